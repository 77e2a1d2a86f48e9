//! Connection producer
//!
//! Holds the parsed configuration and a memoized native client behind a
//! single instance lock. The lock is taken for the whole of every lifecycle
//! operation through [`ConnectionProducer::lock`]; the client is probed before
//! each use and rebuilt when the probe fails.
//!
//! Backends plug in through [`ClientFactory`], which knows how to parse the
//! raw configuration map and how to open, probe and close a client.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::secrets::{SecretValues, SensitiveString};
use crate::types::ConfigMap;

/// Parsed configuration owned by a producer
pub trait ProducerConfig: Send + Sync + 'static {
    /// Key of the admin password in the raw configuration map
    const PASSWORD_KEY: &'static str = "password";

    /// Admin username the plugin authenticates with
    fn root_username(&self) -> &str;

    /// Admin password the plugin authenticates with
    fn root_password(&self) -> &str;

    /// Replace the admin password after a root rotation
    fn set_root_password(&mut self, password: &SensitiveString);

    /// Secrets held by this configuration
    fn secret_values(&self) -> SecretValues {
        SecretValues::new().with(self.root_password(), "[password]")
    }
}

/// Opens and manages native clients for one backend family
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// Parsed configuration type
    type Config: ProducerConfig;
    /// Native client handle; clones share the same underlying pool
    type Client: Clone + Send + Sync + 'static;

    /// Parse and validate the raw configuration map
    fn parse_config(&self, raw: &ConfigMap) -> Result<Self::Config>;

    /// Register process-global resources (e.g. an IAM dialer) for a configuration
    async fn register(&self, _config: &mut Self::Config) -> Result<()> {
        Ok(())
    }

    /// Release what [`register`](Self::register) set up
    async fn unregister(&self, _config: &Self::Config) {}

    /// Open a new client
    async fn open(&self, config: &Self::Config) -> Result<Self::Client>;

    /// Liveness probe
    async fn ping(&self, client: &Self::Client) -> Result<()>;

    /// Close a client; failures are logged, not returned
    async fn close(&self, client: Self::Client);
}

struct ProducerState<F: ClientFactory> {
    raw: ConfigMap,
    config: Option<F::Config>,
    client: Option<F::Client>,
    closed: bool,
}

/// Memoizing connection producer shared by all plugins
pub struct ConnectionProducer<F: ClientFactory> {
    factory: F,
    state: Mutex<ProducerState<F>>,
    secrets: Arc<RwLock<SecretValues>>,
}

impl<F: ClientFactory> ConnectionProducer<F> {
    /// Create an uninitialized producer
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            state: Mutex::new(ProducerState {
                raw: ConfigMap::new(),
                config: None,
                client: None,
                closed: false,
            }),
            secrets: Arc::new(RwLock::new(SecretValues::new())),
        }
    }

    /// Backend factory
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Parse, validate and store a configuration.
    ///
    /// Re-initializing replaces the previous configuration and client. When
    /// `verify` is set a client is opened and probed before returning.
    pub async fn initialize(&self, raw: ConfigMap, verify: bool) -> Result<ConfigMap> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::invalid_request("plugin instance has been closed"));
        }

        let mut config = self.factory.parse_config(&raw)?;

        if let Some(client) = state.client.take() {
            self.factory.close(client).await;
        }
        if let Some(previous) = state.config.take() {
            self.factory.unregister(&previous).await;
        }

        self.factory.register(&mut config).await?;

        if verify {
            match self.open_verified(&config).await {
                Ok(client) => state.client = Some(client),
                Err(e) => {
                    self.factory.unregister(&config).await;
                    return Err(e);
                }
            }
        }

        *self.secrets.write() = config.secret_values();
        state.raw = raw.clone();
        state.config = Some(config);
        info!(verify, "plugin initialized");
        Ok(raw)
    }

    async fn open_verified(&self, config: &F::Config) -> Result<F::Client> {
        let client = self.factory.open(config).await.map_err(as_reachability)?;
        if let Err(e) = self.factory.ping(&client).await {
            self.factory.close(client).await;
            return Err(as_reachability(e));
        }
        Ok(client)
    }

    /// Acquire the instance lock for the duration of an operation
    pub async fn lock(&self) -> ProducerGuard<'_, F> {
        ProducerGuard {
            factory: &self.factory,
            state: self.state.lock().await,
            secrets: &self.secrets,
        }
    }

    /// Release the client and any registered resources. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(client) = state.client.take() {
            self.factory.close(client).await;
        }
        if let Some(config) = state.config.take() {
            self.factory.unregister(&config).await;
        }
        state.closed = true;
        debug!("plugin closed");
        Ok(())
    }

    /// Snapshot of the secret values, readable without the instance lock
    pub fn secret_values(&self) -> SecretValues {
        self.secrets.read().clone()
    }
}

fn as_reachability(err: Error) -> Error {
    match err {
        Error::Reachability { .. } => err,
        other => Error::Reachability {
            message: format!("error verifying connection: {other}"),
            source: Some(Box::new(other)),
        },
    }
}

/// Exclusive access to an initialized producer
pub struct ProducerGuard<'a, F: ClientFactory> {
    factory: &'a F,
    state: MutexGuard<'a, ProducerState<F>>,
    secrets: &'a RwLock<SecretValues>,
}

impl<F: ClientFactory> ProducerGuard<'_, F> {
    /// Parsed configuration
    pub fn config(&self) -> Result<&F::Config> {
        self.state.config.as_ref().ok_or(Error::NotInitialized)
    }

    /// Whether `username` is the admin account the plugin authenticates as
    pub fn is_root_user(&self, username: &str) -> bool {
        self.state
            .config
            .as_ref()
            .is_some_and(|c| c.root_username() == username)
    }

    /// Memoized client, probed for liveness and rebuilt on failure
    pub async fn connection(&mut self) -> Result<F::Client> {
        let state = &mut *self.state;
        let config = state.config.as_ref().ok_or(Error::NotInitialized)?;

        if let Some(client) = &state.client {
            match self.factory.ping(client).await {
                Ok(()) => return Ok(client.clone()),
                Err(e) => {
                    warn!(error = %e, "connection failed liveness check, reconnecting");
                    if let Some(stale) = state.client.take() {
                        self.factory.close(stale).await;
                    }
                }
            }
        }

        let client = self.factory.open(config).await?;
        state.client = Some(client.clone());
        Ok(client)
    }

    /// Store a rotated admin password.
    ///
    /// Updates the parsed configuration, the retained raw map and the secret
    /// table, then drops the memoized client so the next
    /// [`connection`](Self::connection) authenticates with the new password.
    pub async fn rotate_root_password(&mut self, password: &SensitiveString) -> Result<()> {
        let state = &mut *self.state;
        let config = state.config.as_mut().ok_or(Error::NotInitialized)?;

        let previous = config.secret_values();
        config.set_root_password(password);
        state.raw.insert(
            F::Config::PASSWORD_KEY.to_string(),
            Value::String(password.expose_secret().to_string()),
        );

        let mut secrets = config.secret_values();
        secrets.merge(previous);
        *self.secrets.write() = secrets;

        if let Some(client) = state.client.take() {
            self.factory.close(client).await;
        }
        info!("root credential rotated");
        Ok(())
    }

    /// Raw configuration as last initialized or rotated
    pub fn raw_config(&self) -> &ConfigMap {
        &self.state.raw
    }
}
