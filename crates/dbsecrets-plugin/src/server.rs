//! Line-delimited JSON transport between the host and a plugin process
//!
//! Each request is one JSON object per line:
//!
//! ```text
//! {"id": 7, "method": "new_user", "params": { ... }}
//! ```
//!
//! and each response echoes the id with either a `result` or an `error`:
//!
//! ```text
//! {"id": 7, "result": {"username": "v-token-reader-..."}}
//! {"id": 8, "error": {"category": "statement", "message": "new user: ..."}}
//! ```
//!
//! Requests are dispatched concurrently; the plugin's own instance lock
//! serializes lifecycle operations. Responses may arrive out of order.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{Error, Result};

/// Default per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Serve loop options
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Deadline applied to every request; `None` disables it
    pub request_timeout: Option<Duration>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<u64>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    category: String,
    message: String,
}

impl RpcResponse {
    fn from_result(id: Option<u64>, result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                id,
                result: None,
                error: Some(RpcError {
                    category: e.category().to_string(),
                    message: e.to_string().replace('\n', " "),
                }),
            },
        }
    }
}

/// Serve a plugin over the process's stdin and stdout
pub async fn serve<D: Database + 'static>(db: Arc<D>, options: ServeOptions) -> Result<()> {
    serve_io(db, tokio::io::stdin(), tokio::io::stdout(), options).await
}

/// Serve a plugin over arbitrary streams until the reader reaches EOF.
///
/// The plugin is closed once all in-flight requests have completed.
pub async fn serve_io<D, R, W>(db: Arc<D>, reader: R, writer: W, options: ServeOptions) -> Result<()>
where
    D: Database + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!(plugin = db.plugin_type(), "serving plugin");

    let (tx, rx) = mpsc::channel::<RpcResponse>(64);
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut lines = BufReader::new(reader).lines();
    let mut in_flight = JoinSet::new();

    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| Error::internal(format!("failed to read request: {e}")))?;
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed request");
                let response = RpcResponse::from_result(
                    None,
                    Err(Error::invalid_request(format!("malformed request: {e}"))),
                );
                if tx.send(response).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let db = db.clone();
        let tx = tx.clone();
        let timeout = options.request_timeout;
        in_flight.spawn(async move {
            debug!(id = ?request.id, method = %request.method, "dispatching request");
            let result = with_deadline(
                timeout,
                &request.method,
                dispatch(db.as_ref(), &request.method, request.params),
            )
            .await;
            let _ = tx.send(RpcResponse::from_result(request.id, result)).await;
        });

        // Reap finished tasks so the set does not grow unbounded.
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    if let Err(e) = db.close().await {
        warn!(error = %e, "failed to close plugin at end of input");
    }

    drop(tx);
    writer_task
        .await
        .map_err(|e| Error::internal(format!("response writer panicked: {e}")))?
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<RpcResponse>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response)
            .map_err(|e| Error::internal(format!("failed to encode response: {e}")))?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::internal(format!("failed to write response: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::internal(format!("failed to write response: {e}")))?;
    }
    Ok(())
}

async fn with_deadline<F>(timeout: Option<Duration>, method: &str, fut: F) -> Result<Value>
where
    F: std::future::Future<Output = Result<Value>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(Error::internal("request deadline exceeded").in_operation(&operation_name(method)))
        }),
        None => fut.await,
    }
}

/// `update_user` -> `update user`, matching the middleware's prefixes
fn operation_name(method: &str) -> String {
    method.replace('_', " ")
}

async fn dispatch<D: Database + ?Sized>(db: &D, method: &str, params: Value) -> Result<Value> {
    match method {
        "type" => Ok(serde_json::json!({ "type": db.plugin_type() })),
        "initialize" => to_value(db.initialize(from_params(params)?).await?),
        "new_user" => to_value(db.new_user(from_params(params)?).await?),
        "update_user" => {
            db.update_user(from_params(params)?).await?;
            Ok(Value::Object(Default::default()))
        }
        "delete_user" => {
            db.delete_user(from_params(params)?).await?;
            Ok(Value::Object(Default::default()))
        }
        "close" => {
            db.close().await?;
            Ok(Value::Object(Default::default()))
        }
        other => Err(Error::invalid_request(format!("unknown method {other:?}"))),
    }
}

fn from_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    serde_json::from_value(params).map_err(|e| Error::invalid_request(format!("invalid params: {e}")))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::internal(format!("failed to encode result: {e}")))
}
