//! Error sanitizing wrapper
//!
//! Every error leaving a wrapped plugin is prefixed with the failing
//! operation and scrubbed of the plugin's current secret values, including
//! every cause in its source chain.

use async_trait::async_trait;
use tracing::debug;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::secrets::SecretValues;
use crate::types::{
    DeleteUserRequest, InitializeRequest, InitializeResponse, NewUserRequest, NewUserResponse,
    UpdateUserRequest,
};

/// Wraps a [`Database`] and redacts secrets from its errors
pub struct ErrorSanitizer<D> {
    inner: D,
}

impl<D: Database> ErrorSanitizer<D> {
    /// Wrap a plugin
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// Wrapped plugin
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Unwrap the plugin
    pub fn into_inner(self) -> D {
        self.inner
    }

    // Secrets are read after the call so a rotated password is covered.
    fn sanitize(&self, operation: &str, err: Error) -> Error {
        debug!(operation, category = %err.category(), "plugin operation failed");
        err.redact(&self.inner.secret_values()).in_operation(operation)
    }
}

#[async_trait]
impl<D: Database> Database for ErrorSanitizer<D> {
    fn plugin_type(&self) -> &'static str {
        self.inner.plugin_type()
    }

    async fn initialize(&self, request: InitializeRequest) -> Result<InitializeResponse> {
        // The configuration being applied may not be stored yet, so its
        // secrets are scrubbed as well.
        let mut submitted = SecretValues::new();
        for key in ["password", "private_key"] {
            if let Some(value) = request.config.get(key).and_then(|v| v.as_str()) {
                submitted.insert(value, format!("[{key}]"));
            }
        }
        self.inner
            .initialize(request)
            .await
            .map_err(|e| self.sanitize("initialize", e.redact(&submitted)))
    }

    async fn new_user(&self, request: NewUserRequest) -> Result<NewUserResponse> {
        self.inner
            .new_user(request)
            .await
            .map_err(|e| self.sanitize("new user", e))
    }

    async fn update_user(&self, request: UpdateUserRequest) -> Result<()> {
        self.inner
            .update_user(request)
            .await
            .map_err(|e| self.sanitize("update user", e))
    }

    async fn delete_user(&self, request: DeleteUserRequest) -> Result<()> {
        self.inner
            .delete_user(request)
            .await
            .map_err(|e| self.sanitize("delete user", e))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| self.sanitize("close", e))
    }

    fn secret_values(&self) -> SecretValues {
        self.inner.secret_values()
    }
}
