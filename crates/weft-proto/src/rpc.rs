//! JSON-RPC 2.0 envelope types.
//!
//! The generation runtime speaks plain JSON-RPC 2.0: requests carry a
//! numeric `id`, notifications carry none, and every inbound line is either
//! a correlated response or a notification. Standard codes `-32700..-32603`
//! apply, plus the application range listed in [`codes`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_types::ErrorCode;

/// JSON-RPC application error codes used by the runtime.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const MODEL_LOAD_ERROR: i64 = -32001;
    pub const GENERATION_ERROR: i64 = -32002;
    pub const TOKENIZER_ERROR: i64 = -32003;
    pub const GUIDANCE_ERROR: i64 = -32004;
    pub const MODEL_NOT_LOADED: i64 = -32005;
    pub const RUNTIME_ERROR: i64 = -32099;
}

/// Outbound request (correlated by `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outbound or inbound notification (no `id`, no correlation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_owned(),
            method: method.into(),
            params,
        }
    }
}

/// Error object attached to a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Taxonomy entry for this error's code.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_rpc_code(self.code)
    }
}

/// Inbound response. `id` is `None` when the runtime could not parse our
/// request well enough to echo an id; such responses cannot be correlated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// One parsed inbound line.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(RpcResponse),
    Notification(RpcNotification),
}

impl IncomingMessage {
    /// Classify a raw JSON value per the JSON-RPC 2.0 rules: a `method`
    /// without an `id` is a notification, an `id` with `result` or `error`
    /// is a response, anything else is malformed.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("message is not an object".into()))?;

        if obj.contains_key("method") && !obj.contains_key("id") {
            let note: RpcNotification = serde_json::from_value(value.clone())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            return Ok(Self::Notification(note));
        }

        if obj.contains_key("result") || obj.contains_key("error") {
            let resp: RpcResponse = serde_json::from_value(value)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            return Ok(Self::Response(resp));
        }

        Err(ProtocolError::Malformed(
            "neither a response nor a notification".into(),
        ))
    }
}

/// Failures while framing or classifying wire messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("frame of {observed} bytes exceeds the {limit} byte limit")]
    FrameOverflow { observed: usize, limit: usize },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_version_tag() {
        let req = RpcRequest::new(7, "tokenize", json!({"text": "hi"}));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "tokenize");
    }

    #[test]
    fn classifies_response_and_notification() {
        let resp = IncomingMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 3, "result": {"ok": true}
        }))
        .unwrap();
        assert!(matches!(resp, IncomingMessage::Response(r) if r.id == Some(3)));

        let note = IncomingMessage::from_value(json!({
            "jsonrpc": "2.0", "method": "stream.chunk", "params": {}
        }))
        .unwrap();
        assert!(matches!(note, IncomingMessage::Notification(n) if n.method == "stream.chunk"));
    }

    #[test]
    fn rejects_shapeless_objects() {
        assert!(IncomingMessage::from_value(json!({"jsonrpc": "2.0"})).is_err());
        assert!(IncomingMessage::from_value(json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn error_object_maps_to_taxonomy() {
        let err = RpcErrorObject {
            code: codes::MODEL_NOT_LOADED,
            message: "model x not loaded".into(),
            data: None,
        };
        assert_eq!(err.error_code(), weft_types::ErrorCode::ModelNotLoaded);
    }
}
