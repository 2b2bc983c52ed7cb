//! JSON-RPC 2.0 frames and the tool-protocol payloads carried in them.
//!
//! Methods: `initialize`, `notifications/initialized`, `tools/list`,
//! `tools/call`. Bearer tokens for stream transports travel in
//! `params._meta.authorization`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-defined: the call needs a caller and none was verified.
pub const UNAUTHORIZED: i64 = -32001;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// Any JSON-RPC frame: request, notification, or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(Value::from(id)),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id.unwrap_or(Value::Null)),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none()
    }

    /// The numeric id, for response routing.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Split a response into its outcome.
    pub fn into_outcome(self) -> Result<Value, JsonRpcError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "requiresAuth", default)]
    pub requires_auth: bool,
}

/// One entry of a `tools/list` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl McpToolDef {
    pub fn requires_auth(&self) -> bool {
        self.annotations.as_ref().is_some_and(|a| a.requires_auth)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

/// The result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "structuredContent", default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>, structured: Option<Value>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            structured_content: structured,
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>, structured: Option<Value>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text, structured)
        }
    }

    /// All text blocks joined by newlines.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Unsupported => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: ServerInfo,
}

/// `initialize` params sent by Parley.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "parley",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Put `Bearer <token>` into `params._meta.authorization`.
pub fn with_bearer(params: Option<Value>, token: &str) -> Value {
    let mut params = match params {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let meta = params
        .entry("_meta")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(meta) = meta {
        meta.insert("authorization".into(), Value::from(format!("Bearer {token}")));
    }
    Value::Object(params)
}

/// The bearer token in `params._meta.authorization`, if any.
pub fn bearer_from_params(params: &Value) -> Option<&str> {
    params
        .get("_meta")?
        .get("authorization")?
        .as_str()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_notification_shapes() {
        let req = serde_json::to_value(JsonRpcMessage::request(7, METHOD_TOOLS_LIST, None)).unwrap();
        assert_eq!(req, serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));

        let note = serde_json::to_value(JsonRpcMessage::notification(METHOD_INITIALIZED, None)).unwrap();
        assert!(note.get("id").is_none());
    }

    #[test]
    fn error_response_becomes_err_outcome() {
        let frame: JsonRpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        assert!(frame.is_response());
        assert_eq!(frame.numeric_id(), Some(3));
        assert_eq!(frame.into_outcome().unwrap_err().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn tool_def_reads_camel_case_fields() {
        let def: McpToolDef = serde_json::from_value(serde_json::json!({
            "name": "schedule_adoption",
            "description": "Book a pickup",
            "inputSchema": {"type": "object", "required": ["dogId"]},
            "annotations": {"requiresAuth": true}
        }))
        .unwrap();
        assert!(def.requires_auth());
        assert_eq!(def.input_schema["required"][0], "dogId");
    }

    #[test]
    fn call_result_ignores_unknown_blocks() {
        let result: CallToolResult = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "text", "text": "booked"},
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "text", "text": "for Friday"}
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(result.joined_text(), "booked\nfor Friday");
    }

    #[test]
    fn bearer_is_carried_in_meta() {
        let params = with_bearer(Some(serde_json::json!({"name": "x"})), "abc.def");
        assert_eq!(params["name"], "x");
        assert_eq!(bearer_from_params(&params), Some("abc.def"));
        assert_eq!(bearer_from_params(&serde_json::json!({})), None);
    }
}
