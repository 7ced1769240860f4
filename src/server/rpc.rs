//! JSON-RPC 2.0 framing over line-delimited streams.
//!
//! One request per line in, one response per line out. Notifications (requests
//! without an `id`) never get a response. Requests run concurrently, so
//! responses may arrive in a different order than their requests; clients
//! match them by `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{handle_method, SharedState, METHODS};
use crate::error::RpcError;

#[cfg(test)]
#[path = "rpc_tests.rs"]
mod rpc_tests;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Operation ran and failed; the message is meant for display.
pub const EXECUTION_FAILED: i32 = -32000;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier (null when the request could not be parsed).
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server identification returned by `initialize`.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Result of the `initialize` handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    /// Id of the designated root node.
    #[serde(rename = "rootId")]
    pub root_id: String,
    /// Every method this server answers.
    pub methods: Vec<&'static str>,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Map a handler failure onto its error code
    pub fn from_rpc_error(id: Option<Value>, err: &RpcError) -> Self {
        let code = match err {
            RpcError::InvalidRequest { .. } => INVALID_REQUEST,
            RpcError::UnknownMethod { .. } => METHOD_NOT_FOUND,
            RpcError::InvalidParameters { .. } => INVALID_PARAMS,
            RpcError::ExecutionFailed { .. } => EXECUTION_FAILED,
            RpcError::Json(_) => INTERNAL_ERROR,
        };
        Self::error(id, code, err.to_string())
    }
}

/// JSON-RPC server for the conversation tree.
#[derive(Clone)]
pub struct RpcServer {
    state: SharedState,
}

impl RpcServer {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Run the server on stdin/stdout until EOF
    pub async fn run(&self) -> std::io::Result<()> {
        info!("ThreadGPT JSON-RPC server starting...");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve requests read from `input` until EOF, writing responses to `output`.
    ///
    /// Each request is handled on its own task; a slow generate never holds
    /// up requests for other nodes. After EOF, pending requests still finish
    /// and get their responses before this returns.
    pub async fn serve<R, W>(&self, input: R, output: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (responses, pending) = mpsc::unbounded_channel();

        tokio::try_join!(
            self.read_requests(input, responses),
            write_responses(output, pending)
        )?;

        Ok(())
    }

    async fn read_requests<R>(
        &self,
        input: R,
        responses: mpsc::UnboundedSender<JsonRpcResponse>,
    ) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(input);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => {
                    let server = self.clone();
                    let responses = responses.clone();
                    tokio::spawn(async move {
                        if let Some(response) = server.handle_request(request).await {
                            // Writer gone means the output failed; nothing to report to.
                            let _ = responses.send(response);
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    let _ = responses.send(JsonRpcResponse::error(
                        None,
                        PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Handle a single request. `None` for notifications.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        if request.jsonrpc != "2.0" {
            let err = RpcError::InvalidRequest {
                message: format!("unsupported jsonrpc version {:?}", request.jsonrpc),
            };
            return (!is_notification).then(|| JsonRpcResponse::from_rpc_error(request.id, &err));
        }

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" => {
                debug!("Received initialized notification");
                None
            }
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                let result = handle_method(&self.state, method, request.params).await;
                if is_notification {
                    debug!(method = %method, "Notification handled, no response");
                    return None;
                }
                Some(match result {
                    Ok(value) => JsonRpcResponse::success(request.id, value),
                    Err(e) => {
                        error!(method = %method, error = %e, "Request failed");
                        JsonRpcResponse::from_rpc_error(request.id, &e)
                    }
                })
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            server_info: ServerInfo {
                name: "threadgpt".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            root_id: self.state.config.tree.root_id.clone(),
            methods: METHODS.to_vec(),
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e))
            }
        }
    }
}

/// Write responses as they complete until every sender is dropped
async fn write_responses<W>(
    mut output: W,
    mut pending: mpsc::UnboundedReceiver<JsonRpcResponse>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = pending.recv().await {
        let response_json = serde_json::to_string(&response)?;
        debug!(response = %response_json, "Sending response");

        output.write_all(response_json.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }

    Ok(())
}
