//! Shelly Gen2 RPC framing shared by the HTTP, WebSocket and UDP paths.

use crate::error::Result;
use crate::payloads::{DeviceInfo, EmStatus, Settings, Status};
use serde_derive::{Deserialize, Serialize};

pub const METHOD_GET_DEVICE_INFO: &str = "Shelly.GetDeviceInfo";
pub const METHOD_GET_CONFIG: &str = "Shelly.GetConfig";
pub const METHOD_GET_STATUS: &str = "Shelly.GetStatus";
pub const METHOD_EM_GET_STATUS: &str = "EM.GetStatus";

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = 404;

/// Methods that fetch a live status snapshot. On the WebSocket and UDP paths
/// these go through the session's throttling queue instead of being answered
/// immediately.
pub fn is_status_poll(method: &str) -> bool {
    matches!(method, METHOD_GET_STATUS | METHOD_EM_GET_STATUS)
}

/// Inbound request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            src: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_status_poll(&self) -> bool {
        is_status_poll(&self.method)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("No handler for {method}"),
        }
    }

    pub fn parse_error() -> Self {
        Self {
            code: PARSE_ERROR,
            message: "Parse error".to_string(),
        }
    }
}

/// Result payload of a successful call.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RpcResult {
    DeviceInfo(DeviceInfo),
    Settings(Settings),
    Status(Box<Status>),
    Em(EmStatus),
}

/// Outbound response frame. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFrame {
    pub id: Option<i64>,
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RpcResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl ResponseFrame {
    pub fn result(request: &RpcRequest, src: impl Into<String>, result: RpcResult) -> Self {
        Self {
            id: request.id,
            src: src.into(),
            dst: request.src.clone(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(request: Option<&RpcRequest>, src: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: request.and_then(|r| r.id),
            src: src.into(),
            dst: request.and_then(|r| r.src.clone()),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Encodes the frame using the same framing the client used.
    pub fn encode(&self, framing: Framing) -> Result<Frame> {
        Ok(match framing {
            Framing::Text => Frame::Text(serde_json::to_string(self)?),
            Framing::Binary => Frame::Binary(serde_json::to_vec(self)?),
        })
    }
}

/// How a client framed its request; responses mirror it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Text,
    Binary,
}

/// A transport independent WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn framing(&self) -> Framing {
        match self {
            Frame::Text(_) => Framing::Text,
            Frame::Binary(_) => Framing::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_decode_request() {
        let request = RpcRequest::decode(
            br#"{"id":42,"src":"inverter","method":"EM.GetStatus","params":{"id":0}}"#,
        )
        .unwrap();

        assert_eq!(request.id, Some(42));
        assert_eq!(request.src.as_deref(), Some("inverter"));
        assert_eq!(request.method, METHOD_EM_GET_STATUS);
        assert_eq!(request.params, Some(json!({"id": 0})));
        assert!(request.is_status_poll());
    }

    #[test]
    fn test_decode_request_without_optional_fields() {
        let request = RpcRequest::decode(br#"{"method":"Shelly.GetDeviceInfo"}"#).unwrap();
        assert_eq!(request.id, None);
        assert_eq!(request.src, None);
        assert!(!request.is_status_poll());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RpcRequest::decode(b"not json").is_err());
        assert!(RpcRequest::decode(br#"{"id":1}"#).is_err());
    }

    #[test]
    fn test_status_poll_methods() {
        assert!(is_status_poll("EM.GetStatus"));
        assert!(is_status_poll("Shelly.GetStatus"));
        assert!(!is_status_poll("Shelly.GetConfig"));
        assert!(!is_status_poll("em.getstatus"));
    }

    #[test]
    fn test_error_frame_echoes_id_and_src() {
        let mut request = RpcRequest::new(9, "Foo.Bar");
        request.src = Some("client-1".to_string());
        let frame = ResponseFrame::error(
            Some(&request),
            "shellypro3em-abc",
            RpcError::method_not_found(&request.method),
        );

        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 9,
                "src": "shellypro3em-abc",
                "dst": "client-1",
                "error": { "code": 404, "message": "No handler for Foo.Bar" }
            })
        );
    }

    #[test]
    fn test_parse_error_frame_has_null_id() {
        let frame = ResponseFrame::error(None, "shellypro3em-abc", RpcError::parse_error());
        let value: Value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], -32700);
        assert!(value.get("dst").is_none());
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_encode_mirrors_framing() {
        let frame = ResponseFrame::error(None, "x", RpcError::parse_error());

        let text = frame.encode(Framing::Text).unwrap();
        let binary = frame.encode(Framing::Binary).unwrap();

        assert_eq!(text.framing(), Framing::Text);
        assert_eq!(binary.framing(), Framing::Binary);
        assert_eq!(text.as_bytes(), binary.as_bytes());
    }
}
