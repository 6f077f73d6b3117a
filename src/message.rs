//! JSON-RPC 2.0 message grammar
//!
//! Pure data definitions for the three message kinds plus the error object,
//! with wire-shape (de)serialization. Classification follows the field
//! presence rules: `method` marks a request or notification (split on `id`),
//! `result`/`error` alongside `id` marks a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const REQUEST_TIMEOUT: i64 = -32001;

/// Request identifier, unique among the issuing side's currently pending
/// requests. Either a JSON number or a string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_data(
            METHOD_NOT_FOUND,
            "Method not found",
            serde_json::json!({ "method": method }),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, ErrorObject>,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Method name for requests and notifications, `None` for responses.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

/// Raw wire envelope; every field optional so classification errors can be
/// reported after a structurally valid JSON object parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "null_is_present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

/// `result: null` is a legitimate success payload; only an absent field
/// means "not a response".
fn null_is_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, thiserror::Error)]
#[error("invalid message: {0}")]
pub struct InvalidMessage(&'static str);

impl TryFrom<WireMessage> for Message {
    type Error = InvalidMessage;

    fn try_from(wire: WireMessage) -> Result<Self, InvalidMessage> {
        if wire.jsonrpc != JSONRPC_VERSION {
            return Err(InvalidMessage("unsupported jsonrpc version"));
        }

        match (wire.method, wire.id) {
            (Some(method), id) => {
                if wire.result.is_some() || wire.error.is_some() {
                    return Err(InvalidMessage("method alongside result or error"));
                }
                if method.trim().is_empty() {
                    return Err(InvalidMessage("empty method"));
                }
                match id {
                    Some(id) => Ok(Self::Request(Request {
                        id,
                        method,
                        params: wire.params,
                    })),
                    None => Ok(Self::Notification(Notification {
                        method,
                        params: wire.params,
                    })),
                }
            }
            (None, Some(id)) => match (wire.result, wire.error) {
                (Some(result), None) => Ok(Self::Response(Response {
                    id,
                    outcome: Ok(result),
                })),
                (None, Some(error)) => Ok(Self::Response(Response {
                    id,
                    outcome: Err(error),
                })),
                (Some(_), Some(_)) => Err(InvalidMessage("response with result and error")),
                (None, None) => Err(InvalidMessage("response without result or error")),
            },
            (None, None) => Err(InvalidMessage("no method and no id")),
        }
    }
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        let empty = Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        };

        match message {
            Message::Request(request) => Self {
                id: Some(request.id),
                method: Some(request.method),
                params: request.params,
                ..empty
            },
            Message::Notification(notification) => Self {
                method: Some(notification.method),
                params: notification.params,
                ..empty
            },
            Message::Response(response) => match response.outcome {
                Ok(result) => Self {
                    id: Some(response.id),
                    result: Some(result),
                    ..empty
                },
                Err(error) => Self {
                    id: Some(response.id),
                    error: Some(error),
                    ..empty
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_with_number_id() {
        let message: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/list",
            "params": {"cursor": null}
        }))
        .expect("valid request");

        let Message::Request(request) = message else {
            panic!("expected request");
        };
        assert_eq!(request.id, RequestId::Number(7));
        assert_eq!(request.method, "tools/list");
    }

    #[test]
    fn parses_request_with_string_id() {
        let message: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "req-1",
            "method": "ping"
        }))
        .expect("valid request");

        let Message::Request(request) = message else {
            panic!("expected request");
        };
        assert_eq!(request.id, RequestId::String("req-1".to_string()));
        assert_eq!(request.params, None);
    }

    #[test]
    fn missing_id_parses_as_notification() {
        let message: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"value": 3}
        }))
        .expect("valid notification");

        assert!(matches!(message, Message::Notification(_)));
    }

    #[test]
    fn parses_success_and_error_responses() {
        let success: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"ok": true}
        }))
        .expect("valid response");
        let Message::Response(response) = success else {
            panic!("expected response");
        };
        assert_eq!(response.outcome, Ok(json!({"ok": true})));

        let failure: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"}
        }))
        .expect("valid error response");
        let Message::Response(response) = failure else {
            panic!("expected response");
        };
        assert_eq!(
            response.outcome,
            Err(ErrorObject::new(METHOD_NOT_FOUND, "Method not found"))
        );
    }

    #[test]
    fn null_result_is_a_success_response() {
        let message: Message = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": null
        }))
        .expect("valid response");

        let Message::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(response.outcome, Ok(Value::Null));
    }

    #[test]
    fn rejects_ambiguous_shapes() {
        let cases = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "x", "result": {}}),
            json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "m"}}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0"}),
            json!({"jsonrpc": "1.0", "id": 1, "method": "x"}),
            json!({"jsonrpc": "2.0", "id": 1, "method": "  "}),
        ];

        for case in cases {
            assert!(
                serde_json::from_value::<Message>(case.clone()).is_err(),
                "expected rejection of {case}"
            );
        }
    }

    #[test]
    fn serializes_to_exact_wire_shape() {
        let request = Message::Request(Request {
            id: RequestId::Number(3),
            method: "tools/call".to_string(),
            params: Some(json!({"name": "echo"})),
        });
        assert_eq!(
            serde_json::to_value(&request).expect("serialize"),
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "echo"}
            })
        );

        let response = Message::Response(Response::error(
            RequestId::Number(3),
            ErrorObject::new(METHOD_NOT_FOUND, "Method not found"),
        ));
        assert_eq!(
            serde_json::to_value(&response).expect("serialize"),
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "error": {"code": -32601, "message": "Method not found"}
            })
        );
    }

    #[test]
    fn notification_round_trips_without_id() {
        let notification = Message::Notification(Notification {
            method: "notifications/cancelled".to_string(),
            params: Some(json!({"requestId": 9})),
        });

        let encoded = serde_json::to_string(&notification).expect("serialize");
        assert!(!encoded.contains("\"id\""));
        let decoded: Message = serde_json::from_str(&encoded).expect("parse");
        assert_eq!(decoded, notification);
    }
}
