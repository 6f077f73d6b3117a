use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::message::{
    ErrorObject, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, REQUEST_TIMEOUT,
};

/// Protocol and transport failure taxonomy.
///
/// `Timeout`, `Cancelled` and `TransportClosed` only ever fail the specific
/// pending request they belong to; decode errors are reported through the
/// transport error callback and never abort the receive loop.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("parse error: {message}")]
    Parse { message: String },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("invalid params: {message}")]
    InvalidParams { message: String },
    #[error("handler failed: {0}")]
    Handler(ErrorObject),
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("transport closed")]
    TransportClosed,
    #[error("not connected: {reason}")]
    NotConnected { reason: &'static str },
    #[error("transport already started")]
    AlreadyStarted,
    #[error("multiple transports attached; an explicit target is required")]
    AmbiguousTransport,
    #[error("peer gone: session {session} has no open channel")]
    PeerGone { session: String },
}

impl RpcError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    pub fn not_connected(reason: &'static str) -> Self {
        Self::NotConnected { reason }
    }

    pub fn peer_gone(session: impl Into<String>) -> Self {
        Self::PeerGone {
            session: session.into(),
        }
    }

    /// Wire representation for error responses built from this failure.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::Parse { message } => ErrorObject::new(PARSE_ERROR, message.clone()),
            Self::MethodNotFound { method } => ErrorObject::method_not_found(method),
            Self::InvalidParams { message } => ErrorObject::new(INVALID_PARAMS, message.clone()),
            Self::Handler(error) => error.clone(),
            Self::Timeout => ErrorObject::new(REQUEST_TIMEOUT, "Request timed out"),
            other => ErrorObject::new(INTERNAL_ERROR, other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}

impl From<ErrorObject> for RpcError {
    fn from(error: ErrorObject) -> Self {
        match error.code {
            METHOD_NOT_FOUND => Self::MethodNotFound {
                method: error
                    .data
                    .as_ref()
                    .and_then(|data| data.get("method"))
                    .and_then(|method| method.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            },
            INVALID_PARAMS => Self::InvalidParams {
                message: error.message,
            },
            REQUEST_TIMEOUT => Self::Timeout,
            _ => Self::Handler(error),
        }
    }
}

/// HTTP-surface failures for the transport endpoints.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },
    #[error("bad request: {message}")]
    BadRequest {
        code: &'static str,
        message: String,
    },
    #[error("unknown session")]
    SessionNotFound,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl HttpError {
    pub fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self::Unauthorized { code, message }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::Unauthorized { code, message } => {
                (StatusCode::UNAUTHORIZED, code, message.to_string())
            }
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::SessionNotFound => (
                StatusCode::NOT_FOUND,
                "session_not_found",
                "no open session with that id".to_string(),
            ),
        };

        (
            status,
            Json(ErrorBody {
                code: code.to_string(),
                message,
                details: json!({}),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_maps_to_request_timeout_code() {
        assert_eq!(RpcError::Timeout.to_error_object().code, REQUEST_TIMEOUT);
    }

    #[test]
    fn method_not_found_round_trips_through_error_object() {
        let wire = RpcError::MethodNotFound {
            method: "tools/rename".to_string(),
        }
        .to_error_object();
        assert_eq!(wire.code, METHOD_NOT_FOUND);

        let back = RpcError::from(wire);
        assert!(matches!(
            back,
            RpcError::MethodNotFound { method } if method == "tools/rename"
        ));
    }

    #[test]
    fn foreign_error_codes_stay_handler_errors() {
        let error = ErrorObject::new(-32000, "backend unavailable");
        assert!(matches!(
            RpcError::from(error),
            RpcError::Handler(inner) if inner.code == -32000
        ));
    }
}
