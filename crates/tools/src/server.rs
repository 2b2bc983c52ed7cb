//! Serves local tools over a line-delimited JSON-RPC stream.
//!
//! `parley serve-tools` runs this on stdio so another Parley (or any
//! client speaking the protocol) can use the built-in tools remotely.
//! Tools that act for a caller only run when `_meta.authorization`
//! carries a token minted for this server's audience.

use crate::protocol::{
    self, CallToolResult, JsonRpcError, JsonRpcMessage, McpToolDef, ToolAnnotations,
};
use parley_core::error::ToolError;
use parley_core::tool::{Tool, ToolContext};
use parley_security::JwtKeys;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

struct Verifier {
    keys: Arc<JwtKeys>,
    audience: String,
}

pub struct ToolServer {
    name: String,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    verifier: Option<Verifier>,
    calls: AtomicUsize,
}

impl ToolServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: BTreeMap::new(),
            verifier: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    /// Verify caller tokens with `keys`, expecting `audience`.
    pub fn with_verifier(mut self, keys: Arc<JwtKeys>, audience: impl Into<String>) -> Self {
        self.verifier = Some(Verifier {
            keys,
            audience: audience.into(),
        });
        self
    }

    /// Number of tool executions this server has started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Serve one connection until the client hangs up.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(server = %self.name, tools = self.tools.len(), "Tool server listening");
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(frame) => self.handle(frame).await,
                Err(e) => Some(JsonRpcMessage::failure(
                    None,
                    JsonRpcError::new(protocol::PARSE_ERROR, format!("parse error: {e}")),
                )),
            };
            if let Some(reply) = reply {
                let mut out = serde_json::to_string(&reply)?;
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
                writer.flush().await?;
            }
        }
        debug!(server = %self.name, "Client disconnected");
        Ok(())
    }

    /// Handle one frame; notifications produce no reply.
    pub async fn handle(&self, frame: JsonRpcMessage) -> Option<JsonRpcMessage> {
        let method = frame.method.clone()?;
        let id = frame.id.clone();
        let params = frame.params.unwrap_or(Value::Null);

        let outcome = match method.as_str() {
            protocol::METHOD_INITIALIZE => Ok(self.initialize_result()),
            protocol::METHOD_INITIALIZED => return None,
            protocol::METHOD_TOOLS_LIST => Ok(self.list_result()),
            protocol::METHOD_TOOLS_CALL => self.call(&params).await,
            other => Err(JsonRpcError::new(protocol::METHOD_NOT_FOUND, format!("method not found: {other}"))),
        };

        // Notifications never get a reply, even an error
        if id.is_none() {
            return None;
        }
        Some(match outcome {
            Ok(result) => JsonRpcMessage::success(id, result),
            Err(error) => JsonRpcMessage::failure(id, error),
        })
    }

    fn initialize_result(&self) -> Value {
        serde_json::json!({
            "protocolVersion": protocol::PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": self.name, "version": env!("CARGO_PKG_VERSION") },
        })
    }

    fn list_result(&self) -> Value {
        let tools: Vec<McpToolDef> = self
            .tools
            .values()
            .map(|tool| McpToolDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
                annotations: tool.requires_auth().then(|| ToolAnnotations {
                    title: None,
                    requires_auth: true,
                }),
            })
            .collect();
        serde_json::json!({ "tools": tools })
    }

    async fn call(&self, params: &Value) -> Result<Value, JsonRpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| JsonRpcError::new(protocol::INVALID_PARAMS, "missing tool name"))?;
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| JsonRpcError::new(protocol::INVALID_PARAMS, format!("unknown tool: {name}")))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| serde_json::json!({}));

        let principal = match (&self.verifier, protocol::bearer_from_params(params)) {
            (Some(verifier), Some(token)) => match verifier.keys.authenticate(token, &verifier.audience) {
                Ok(ctx) => Some(ctx.principal),
                Err(e) => {
                    warn!(tool = name, error = %e, "Rejected caller token");
                    return Err(JsonRpcError::new(protocol::UNAUTHORIZED, "invalid caller token"));
                }
            },
            _ => None,
        };
        if tool.requires_auth() && principal.is_none() {
            return Err(JsonRpcError::new(
                protocol::UNAUTHORIZED,
                format!("'{name}' requires an authenticated caller"),
            ));
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let ctx = ToolContext {
            correlation_id: params
                .get("_meta")
                .and_then(|m| m.get("correlationId"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            principal,
        };
        let result = match tool.execute(arguments, &ctx).await {
            Ok(output) => CallToolResult::text(output.content, output.structured),
            Err(e) => {
                debug!(tool = name, error = %e, "Tool failed");
                let payload = match e {
                    ToolError::Execution { payload, .. } => payload,
                    other => other.to_model_payload(),
                };
                CallToolResult::error(payload.to_string(), Some(payload))
            }
        };
        serde_json::to_value(result).map_err(|e| JsonRpcError::new(protocol::INTERNAL_ERROR, e.to_string()))
    }
}
