//! The host-facing database plugin contract

use async_trait::async_trait;

use crate::error::Result;
use crate::secrets::SecretValues;
use crate::types::{
    DeleteUserRequest, InitializeRequest, InitializeResponse, NewUserRequest, NewUserResponse,
    UpdateUserRequest,
};

/// A database plugin instance.
///
/// One instance serves one mount for the lifetime of the process. All
/// methods except [`plugin_type`](Database::plugin_type) and
/// [`secret_values`](Database::secret_values) serialize on the instance lock.
#[async_trait]
pub trait Database: Send + Sync {
    /// Plugin type tag, e.g. `"postgresql"` or `"neo4j"`
    fn plugin_type(&self) -> &'static str;

    /// Parse and validate configuration; optionally verify connectivity
    async fn initialize(&self, request: InitializeRequest) -> Result<InitializeResponse>;

    /// Create a dynamic user and return its generated name
    async fn new_user(&self, request: NewUserRequest) -> Result<NewUserResponse>;

    /// Change a user's password and/or expiration
    async fn update_user(&self, request: UpdateUserRequest) -> Result<()>;

    /// Revoke a user
    async fn delete_user(&self, request: DeleteUserRequest) -> Result<()>;

    /// Release the native client
    async fn close(&self) -> Result<()>;

    /// Secret values to scrub from errors, with their replacement tokens
    fn secret_values(&self) -> SecretValues {
        SecretValues::new()
    }
}

#[async_trait]
impl<D: Database + ?Sized> Database for std::sync::Arc<D> {
    fn plugin_type(&self) -> &'static str {
        (**self).plugin_type()
    }

    async fn initialize(&self, request: InitializeRequest) -> Result<InitializeResponse> {
        (**self).initialize(request).await
    }

    async fn new_user(&self, request: NewUserRequest) -> Result<NewUserResponse> {
        (**self).new_user(request).await
    }

    async fn update_user(&self, request: UpdateUserRequest) -> Result<()> {
        (**self).update_user(request).await
    }

    async fn delete_user(&self, request: DeleteUserRequest) -> Result<()> {
        (**self).delete_user(request).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    fn secret_values(&self) -> SecretValues {
        (**self).secret_values()
    }
}
