//! Multi-connection HTTP transport
//!
//! Server-side endpoint with many simultaneous remote peers: each peer holds
//! one SSE event stream for outbound messages and submits inbound messages
//! on a shared POST endpoint, quoting its session id. A reply is routed to
//! the channel the session id names; if that stream is gone the send fails
//! with `PeerGone` instead of reaching a different peer.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};
use uuid::Uuid;

use crate::errors::{HttpError, RpcError};
use crate::message::Message;
use crate::transport::{
    AuthInfo, CallbackCell, MessageMeta, SendOptions, Transport, TransportCallbacks,
};

pub struct HttpServerTransport {
    state: Mutex<Lifecycle>,
    sessions: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    callbacks: CallbackCell,
    custom: Mutex<Option<Value>>,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    closed: bool,
}

impl HttpServerTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Lifecycle::default()),
            sessions: Mutex::new(HashMap::new()),
            callbacks: CallbackCell::default(),
            custom: Mutex::new(None),
        })
    }

    /// Allocate a session and its outbound channel. The receiver feeds the
    /// peer's SSE stream.
    pub fn open_session(&self) -> (String, mpsc::UnboundedReceiver<Message>) {
        let session_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .expect("session map poisoned")
            .insert(session_id.clone(), sender);
        (session_id, receiver)
    }

    pub fn close_session(&self, session_id: &str) {
        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("session map poisoned").len()
    }

    /// Inbound submission for one session. The session id travels in the
    /// metadata so the engine can quote it on the reply send.
    pub fn receive(
        &self,
        session_id: &str,
        auth: Option<AuthInfo>,
        message: Message,
    ) -> Result<(), HttpError> {
        {
            let state = self.state.lock().expect("transport state poisoned");
            if state.closed || !state.started {
                return Err(HttpError::bad_request(
                    "transport_unavailable",
                    "transport is not accepting messages",
                ));
            }
        }
        if !self
            .sessions
            .lock()
            .expect("session map poisoned")
            .contains_key(session_id)
        {
            return Err(HttpError::SessionNotFound);
        }

        let meta = MessageMeta {
            auth,
            custom: self.custom.lock().expect("custom context poisoned").clone(),
            session_id: Some(session_id.to_string()),
        };
        self.callbacks.emit_message(message, meta);
        Ok(())
    }

    /// Decode failures on the submission endpoint surface both ways: the
    /// HTTP caller gets a 400 and the engine's error callback fires.
    pub fn report_parse_error(&self, err: &serde_json::Error) {
        self.callbacks.emit_error(RpcError::parse(err.to_string()));
    }
}

#[async_trait]
impl Transport for HttpServerTransport {
    async fn start(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock().expect("transport state poisoned");
        if state.started {
            return Err(RpcError::AlreadyStarted);
        }
        state.started = true;
        Ok(())
    }

    async fn send(&self, message: &Message, options: &SendOptions) -> Result<(), RpcError> {
        {
            let state = self.state.lock().expect("transport state poisoned");
            if state.closed {
                return Err(RpcError::TransportClosed);
            }
            if !state.started {
                return Err(RpcError::not_connected("transport not started"));
            }
        }

        let (session_id, sender) = {
            let sessions = self.sessions.lock().expect("session map poisoned");
            match &options.session_id {
                Some(session_id) => (
                    session_id.clone(),
                    sessions
                        .get(session_id)
                        .cloned()
                        .ok_or_else(|| RpcError::peer_gone(session_id.clone()))?,
                ),
                // Without an explicit session the send is only unambiguous
                // when exactly one peer is connected.
                None => match sessions.len() {
                    0 => return Err(RpcError::not_connected("no open session")),
                    1 => {
                        let (session_id, sender) =
                            sessions.iter().next().expect("len checked");
                        (session_id.clone(), sender.clone())
                    }
                    _ => return Err(RpcError::AmbiguousTransport),
                },
            }
        };

        if sender.send(message.clone()).is_err() {
            // The SSE stream is gone; drop the stale session rather than
            // letting a later send observe it.
            self.close_session(&session_id);
            return Err(RpcError::peer_gone(session_id));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock().expect("transport state poisoned");
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        // Dropping the senders terminates every session's SSE stream.
        self.sessions
            .lock()
            .expect("session map poisoned")
            .clear();
        self.callbacks.emit_close();
        Ok(())
    }

    fn bind(&self, callbacks: TransportCallbacks) {
        self.callbacks.replace(callbacks);
    }

    fn set_custom_context(&self, value: Value) {
        *self.custom.lock().expect("custom context poisoned") = Some(value);
    }
}

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct HttpTransportState {
    pub api_token: Arc<str>,
    pub transport: Arc<HttpServerTransport>,
}

impl HttpTransportState {
    pub fn new(api_token: String, transport: Arc<HttpServerTransport>) -> Self {
        Self {
            api_token: Arc::<str>::from(api_token),
            transport,
        }
    }
}

/// Router for the transport endpoints plus the public metadata endpoints.
pub fn build_router(state: HttpTransportState) -> Router {
    let protected = Router::new()
        .route("/events", get(open_events))
        .route("/messages", post(submit_message))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/.well-known/rpc", get(discovery))
        .merge(protected)
        .layer(middleware::from_fn(
            crate::logging::request_logging_middleware,
        ))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct DiscoveryResponse {
    name: &'static str,
    version: &'static str,
    events_endpoint: &'static str,
    messages_endpoint: &'static str,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        events_endpoint: "/events",
        messages_endpoint: "/messages",
    })
}

/// Outbound message stream for one session. Dropping it (the peer hung up)
/// removes the session, so a later send fails `PeerGone` instead of queueing
/// into nowhere.
struct SessionStream {
    inner: UnboundedReceiverStream<Message>,
    transport: Arc<HttpServerTransport>,
    session_id: String,
}

impl Stream for SessionStream {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.transport.close_session(&self.session_id);
    }
}

async fn open_events(
    State(state): State<HttpTransportState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (session_id, receiver) = state.transport.open_session();

    let endpoint = tokio_stream::once(Ok(Event::default()
        .event("endpoint")
        .data(format!("/messages?session={session_id}"))));
    let messages = SessionStream {
        inner: UnboundedReceiverStream::new(receiver),
        transport: Arc::clone(&state.transport),
        session_id,
    }
    .map(|message| {
        Ok(Event::default()
            .event("message")
            .data(serde_json::to_string(&message).expect("message serialization")))
    });

    Sse::new(endpoint.chain(messages)).keep_alive(KeepAlive::default())
}

async fn submit_message(
    State(state): State<HttpTransportState>,
    Query(query): Query<SessionQuery>,
    Extension(auth): Extension<AuthInfo>,
    body: Bytes,
) -> Result<StatusCode, HttpError> {
    let message: Message = serde_json::from_slice(&body).map_err(|err| {
        state.transport.report_parse_error(&err);
        HttpError::bad_request("parse_error", err.to_string())
    })?;

    state
        .transport
        .receive(&query.session, Some(auth), message)?;
    Ok(StatusCode::ACCEPTED)
}
