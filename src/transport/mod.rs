//! Transport capability contract
//!
//! A transport owns exactly one peer relationship (or, for the HTTP
//! transport, a set of addressable peer sessions) and reports decoded
//! inbound messages through registered callbacks. Metadata travels in one
//! uniform shape in both directions; each implementation fills in the parts
//! it knows about.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::RpcError;
use crate::message::{Message, RequestId};

pub mod http;
pub mod inprocess;
pub mod stream;

/// Opaque authentication data. The engine round-trips it without inspecting
/// it; policy lives at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub token: String,
}

impl AuthInfo {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Connection-scoped metadata accompanying every inbound message.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    pub auth: Option<AuthInfo>,
    pub custom: Option<Value>,
    /// Peer identity on multi-session transports; a later send quoting this
    /// id is routed back to the same peer channel.
    pub session_id: Option<String>,
}

/// Options for an outgoing send. The engine populates this from the
/// originating request's metadata; transports read the fields they
/// understand and ignore the rest.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub related_request_id: Option<RequestId>,
    pub session_id: Option<String>,
    pub auth: Option<AuthInfo>,
    pub custom: Option<Value>,
}

impl SendOptions {
    pub fn for_session(session_id: Option<String>) -> Self {
        Self {
            session_id,
            ..Self::default()
        }
    }
}

pub type MessageCallback = Arc<dyn Fn(Message, MessageMeta) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(RpcError) + Send + Sync>;

/// Callback bundle registered by the engine before `start`.
#[derive(Clone, Default)]
pub struct TransportCallbacks {
    pub on_message: Option<MessageCallback>,
    pub on_close: Option<CloseCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl TransportCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, callback: impl Fn(Message, MessageMeta) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub fn on_close(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(RpcError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin receiving. Fails with [`RpcError::AlreadyStarted`] on a second
    /// call. Messages buffered before start are flushed in arrival order.
    async fn start(&self) -> Result<(), RpcError>;

    /// Deliver one message to the peer selected by `options`. A failure
    /// leaves the transport in a usable state.
    async fn send(&self, message: &Message, options: &SendOptions) -> Result<(), RpcError>;

    /// Release transport resources. Idempotent; the close callback fires
    /// exactly once.
    async fn close(&self) -> Result<(), RpcError>;

    /// Register receive/close/error callbacks. Called before `start`.
    fn bind(&self, callbacks: TransportCallbacks);

    /// Store a connection-scoped context value merged into all future
    /// receive metadata. Optional; the default discards it.
    fn set_custom_context(&self, _value: Value) {}

    /// Stable connection identifier on multi-session transports.
    fn session_id(&self) -> Option<String> {
        None
    }
}

/// Callback slot shared by the transport implementations. `emit_close`
/// removes the close callback as it fires, so it runs at most once no
/// matter how many paths reach it.
#[derive(Default)]
pub(crate) struct CallbackCell {
    inner: Mutex<TransportCallbacks>,
}

impl CallbackCell {
    pub fn replace(&self, callbacks: TransportCallbacks) {
        *self.inner.lock().expect("callback cell poisoned") = callbacks;
    }

    pub fn emit_message(&self, message: Message, meta: MessageMeta) {
        let callback = self
            .inner
            .lock()
            .expect("callback cell poisoned")
            .on_message
            .clone();
        if let Some(callback) = callback {
            callback(message, meta);
        }
    }

    pub fn emit_error(&self, error: RpcError) {
        let callback = self
            .inner
            .lock()
            .expect("callback cell poisoned")
            .on_error
            .clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    pub fn emit_close(&self) {
        let callback = self
            .inner
            .lock()
            .expect("callback cell poisoned")
            .on_close
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
