//! The protocol engine: correlation, dispatch, timeout and cancellation
//!
//! An engine owns zero or more attached transports. Every inbound request is
//! bound, at the moment its receive callback fires, to the transport instance
//! that delivered it; the reply is sent through that captured instance and
//! never through engine-level state. Attaching another transport while a
//! request is in flight cannot re-route its response.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::RpcError;
use crate::message::{ErrorObject, Message, Notification, Request, RequestId, Response};
use crate::transport::{AuthInfo, MessageMeta, SendOptions, Transport, TransportCallbacks};

/// Best-effort notification emitted when a pending request is cancelled,
/// and honored for inbound in-flight requests when received.
pub const CANCELLED_METHOD: &str = "notifications/cancelled";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RequestHandlerFn =
    Arc<dyn Fn(Request, RequestContext) -> BoxFuture<Result<Value, ErrorObject>> + Send + Sync>;
type NotificationHandlerFn =
    Arc<dyn Fn(Notification, RequestContext) -> BoxFuture<()> + Send + Sync>;

/// Everything a handler learns about the exchange it serves. One canonical
/// carrier: auth stays opaque, custom context is connection-scoped, and the
/// transport is the captured instance the triggering message arrived on.
#[derive(Clone)]
pub struct RequestContext {
    pub auth: Option<AuthInfo>,
    pub custom: Option<Value>,
    pub session_id: Option<String>,
    pub request_id: Option<RequestId>,
    pub cancellation: CancellationToken,
    transport: Arc<dyn Transport>,
}

impl RequestContext {
    /// The transport the triggering message arrived on.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send a related notification back through the captured transport.
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), RpcError> {
        let options = SendOptions {
            related_request_id: self.request_id.clone(),
            session_id: self.session_id.clone(),
            auth: self.auth.clone(),
            custom: self.custom.clone(),
        };
        self.transport
            .send(
                &Message::Notification(Notification {
                    method: method.into(),
                    params,
                }),
                &options,
            )
            .await
    }
}

/// Identifies one attached transport for explicit send targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHandle(u64);

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Deadline applied to issued requests that set no explicit timeout.
    pub default_request_timeout: Option<Duration>,
    /// Inbound notification methods coalesced per scheduling tick; only the
    /// latest queued value is delivered.
    pub debounced_notification_methods: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Required when more than one transport is attached.
    pub target: Option<TransportHandle>,
    /// Overrides the engine's default request timeout.
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_target(target: TransportHandle) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    next_request_id: AtomicI64,
    next_attachment: AtomicU64,
    default_request_timeout: Option<Duration>,
    attachments: Mutex<Vec<Attachment>>,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    request_handlers: RwLock<HashMap<String, RequestHandlerFn>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandlerFn>>,
    /// Cancellation tokens for inbound requests whose handlers are running,
    /// keyed per attachment so ids from unrelated peers cannot collide.
    inbound_inflight: Mutex<HashMap<(u64, RequestId), CancellationToken>>,
    debounced: HashSet<String>,
    debounce_slots: Mutex<HashMap<String, (Notification, RequestContext)>>,
}

struct Attachment {
    id: u64,
    transport: Arc<dyn Transport>,
}

struct PendingEntry {
    complete: oneshot::Sender<Result<Value, RpcError>>,
    attachment: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                next_request_id: AtomicI64::new(1),
                next_attachment: AtomicU64::new(1),
                default_request_timeout: options.default_request_timeout,
                attachments: Mutex::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
                request_handlers: RwLock::new(HashMap::new()),
                notification_handlers: RwLock::new(HashMap::new()),
                inbound_inflight: Mutex::new(HashMap::new()),
                debounced: options.debounced_notification_methods.into_iter().collect(),
                debounce_slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a request handler for `method`. Replaces any previous
    /// handler for the same method.
    pub fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Request, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorObject>> + Send + 'static,
    {
        let handler: RequestHandlerFn =
            Arc::new(move |request, context| Box::pin(handler(request, context)));
        self.inner
            .request_handlers
            .write()
            .expect("handler registry poisoned")
            .insert(method.into(), handler);
    }

    /// Register a fire-and-forget notification handler for `method`.
    pub fn register_notification<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Notification, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandlerFn =
            Arc::new(move |notification, context| Box::pin(handler(notification, context)));
        self.inner
            .notification_handlers
            .write()
            .expect("handler registry poisoned")
            .insert(method.into(), handler);
    }

    /// Attach a transport: bind callbacks, start it, add it to the attached
    /// set. The receive closure captures the transport instance; that
    /// capture is the binding every reply for this connection uses.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<TransportHandle, RpcError> {
        let id = self.inner.next_attachment.fetch_add(1, Ordering::SeqCst);

        let callbacks = TransportCallbacks::new()
            .on_message({
                let inner = Arc::downgrade(&self.inner);
                let transport = Arc::clone(&transport);
                move |message, meta| {
                    if let Some(inner) = inner.upgrade() {
                        inner.receive(id, &transport, message, meta);
                    }
                }
            })
            .on_close({
                let inner = Arc::downgrade(&self.inner);
                move || {
                    if let Some(inner) = inner.upgrade() {
                        inner.transport_closed(id);
                    }
                }
            })
            .on_error(move |err| {
                warn!(attachment = id, error = %err, "transport reported receive error");
            });

        transport.bind(callbacks);
        // The attachment is registered before start so a close reported
        // during startup finds it and cleans it up.
        self.inner
            .attachments
            .lock()
            .expect("attachment set poisoned")
            .push(Attachment {
                id,
                transport: Arc::clone(&transport),
            });
        if let Err(err) = transport.start().await {
            self.inner.transport_closed(id);
            return Err(err);
        }
        Ok(TransportHandle(id))
    }

    /// Issue an outgoing request and wait for its terminal outcome: the
    /// response, the deadline, cancellation, or the transport closing,
    /// whichever happens first.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, RpcError> {
        let (attachment, transport) = self.inner.target(options.target)?;
        let id = RequestId::Number(self.inner.next_request_id.fetch_add(1, Ordering::SeqCst));

        let (complete, mut wait) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending table poisoned")
            .insert(
                id.clone(),
                PendingEntry {
                    complete,
                    attachment,
                },
            );

        let message = Message::Request(Request {
            id: id.clone(),
            method: method.into(),
            params,
        });
        if let Err(err) = transport.send(&message, &SendOptions::default()).await {
            self.inner.take_pending(&id);
            return Err(err);
        }

        let timeout = options.timeout.or(self.inner.default_request_timeout);
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &options.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = &mut wait => match outcome {
                Ok(result) => result,
                Err(_) => Err(RpcError::TransportClosed),
            },
            () = deadline => {
                self.inner.take_pending(&id);
                // The response may have won the race just before the entry
                // was removed; prefer it.
                match wait.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::Timeout),
                }
            },
            () = cancelled => {
                if self.inner.take_pending(&id).is_some() {
                    let note = Message::Notification(Notification {
                        method: CANCELLED_METHOD.to_string(),
                        params: Some(json!({ "requestId": id })),
                    });
                    tokio::spawn(async move {
                        if let Err(err) = transport.send(&note, &SendOptions::default()).await {
                            debug!(error = %err, "cancellation notice not delivered");
                        }
                    });
                }
                Err(RpcError::Cancelled)
            },
        }
    }

    /// Send a notification; fire-and-forget, no correlation entry.
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        target: Option<TransportHandle>,
    ) -> Result<(), RpcError> {
        let (_, transport) = self.inner.target(target)?;
        transport
            .send(
                &Message::Notification(Notification {
                    method: method.into(),
                    params,
                }),
                &SendOptions::default(),
            )
            .await
    }

    /// Close every attached transport. Each close fails that transport's
    /// pending requests with `TransportClosed`.
    pub async fn close(&self) -> Result<(), RpcError> {
        let transports: Vec<Arc<dyn Transport>> = self
            .inner
            .attachments
            .lock()
            .expect("attachment set poisoned")
            .iter()
            .map(|attachment| Arc::clone(&attachment.transport))
            .collect();
        for transport in transports {
            if let Err(err) = transport.close().await {
                warn!(error = %err, "transport close reported failure");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .expect("pending table poisoned")
            .len()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineInner {
    /// Receive entry point; `transport` is the captured instance from the
    /// attach-time closure, never shared engine state.
    fn receive(
        self: &Arc<Self>,
        attachment: u64,
        transport: &Arc<dyn Transport>,
        message: Message,
        meta: MessageMeta,
    ) {
        match message {
            Message::Response(response) => self.resolve_response(attachment, response),
            Message::Request(request) => {
                self.dispatch_request(attachment, transport, request, meta)
            }
            Message::Notification(notification) => {
                self.dispatch_notification(attachment, transport, notification, meta)
            }
        }
    }

    fn resolve_response(&self, attachment: u64, response: Response) {
        let entry = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            match pending.get(&response.id) {
                Some(entry) if entry.attachment == attachment => pending.remove(&response.id),
                _ => None,
            }
        };

        match entry {
            Some(entry) => {
                let _ = entry.complete.send(response.outcome.map_err(RpcError::from));
            }
            None => {
                debug!(id = %response.id, "dropping response with no matching pending request");
            }
        }
    }

    fn dispatch_request(
        self: &Arc<Self>,
        attachment: u64,
        transport: &Arc<dyn Transport>,
        request: Request,
        meta: MessageMeta,
    ) {
        let token = CancellationToken::new();
        let key = (attachment, request.id.clone());
        self.inbound_inflight
            .lock()
            .expect("inflight table poisoned")
            .insert(key.clone(), token.clone());

        let context = RequestContext {
            auth: meta.auth,
            custom: meta.custom,
            session_id: meta.session_id,
            request_id: Some(request.id.clone()),
            cancellation: token,
            transport: Arc::clone(transport),
        };

        let handler = self
            .request_handlers
            .read()
            .expect("handler registry poisoned")
            .get(&request.method)
            .cloned();

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();
            let outcome = match handler {
                Some(handler) => handler(request, context.clone()).await,
                None => Err(ErrorObject::method_not_found(&method)),
            };
            inner
                .inbound_inflight
                .lock()
                .expect("inflight table poisoned")
                .remove(&key);
            debug!(
                method = %method,
                outcome = if outcome.is_ok() { "success" } else { "failure" },
                "request handled"
            );

            let response = match outcome {
                Ok(result) => Response::success(id.clone(), result),
                Err(error) => Response::error(id.clone(), error),
            };
            let options = SendOptions {
                related_request_id: Some(id),
                session_id: context.session_id.clone(),
                auth: context.auth.clone(),
                custom: context.custom.clone(),
            };
            // Reply through the captured transport, whatever has attached
            // or detached in the meantime.
            if let Err(err) = context
                .transport
                .send(&Message::Response(response), &options)
                .await
            {
                warn!(method = %method, error = %err, "failed to deliver response");
            }
        });
    }

    fn dispatch_notification(
        self: &Arc<Self>,
        attachment: u64,
        transport: &Arc<dyn Transport>,
        notification: Notification,
        meta: MessageMeta,
    ) {
        if notification.method == CANCELLED_METHOD {
            self.cancel_inbound(attachment, &notification);
            return;
        }

        let context = RequestContext {
            auth: meta.auth,
            custom: meta.custom,
            session_id: meta.session_id,
            request_id: None,
            cancellation: CancellationToken::new(),
            transport: Arc::clone(transport),
        };

        if self.debounced.contains(&notification.method) {
            let method = notification.method.clone();
            let mut slots = self.debounce_slots.lock().expect("debounce slots poisoned");
            // A present slot means a flush is already scheduled; later
            // arrivals within the tick only overwrite the payload.
            if slots.insert(method.clone(), (notification, context)).is_none() {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    let slot = inner
                        .debounce_slots
                        .lock()
                        .expect("debounce slots poisoned")
                        .remove(&method);
                    if let Some((notification, context)) = slot {
                        inner.deliver_notification(notification, context);
                    }
                });
            }
            return;
        }

        self.deliver_notification(notification, context);
    }

    fn cancel_inbound(&self, attachment: u64, notification: &Notification) {
        let id = notification
            .params
            .as_ref()
            .and_then(|params| params.get("requestId"))
            .and_then(|value| serde_json::from_value::<RequestId>(value.clone()).ok());
        let Some(id) = id else {
            debug!("cancellation notice without a usable requestId");
            return;
        };

        let token = self
            .inbound_inflight
            .lock()
            .expect("inflight table poisoned")
            .get(&(attachment, id))
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn deliver_notification(&self, notification: Notification, context: RequestContext) {
        let handler = self
            .notification_handlers
            .read()
            .expect("handler registry poisoned")
            .get(&notification.method)
            .cloned();

        match handler {
            Some(handler) => {
                tokio::spawn(handler(notification, context));
            }
            None => debug!(method = %notification.method, "no notification handler registered"),
        }
    }

    /// Remove an attachment and fail everything bound to it; bindings to
    /// other transports are untouched.
    fn transport_closed(&self, attachment: u64) {
        self.attachments
            .lock()
            .expect("attachment set poisoned")
            .retain(|candidate| candidate.id != attachment);

        let failed: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().expect("pending table poisoned");
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, entry)| entry.attachment == attachment)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for entry in failed {
            let _ = entry.complete.send(Err(RpcError::TransportClosed));
        }

        let cancelled: Vec<CancellationToken> = {
            let mut inflight = self.inbound_inflight.lock().expect("inflight table poisoned");
            let keys: Vec<(u64, RequestId)> = inflight
                .keys()
                .filter(|(owner, _)| *owner == attachment)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| inflight.remove(key)).collect()
        };
        for token in cancelled {
            token.cancel();
        }
    }

    fn target(
        &self,
        target: Option<TransportHandle>,
    ) -> Result<(u64, Arc<dyn Transport>), RpcError> {
        let attachments = self.attachments.lock().expect("attachment set poisoned");
        match target {
            Some(TransportHandle(id)) => attachments
                .iter()
                .find(|attachment| attachment.id == id)
                .map(|attachment| (attachment.id, Arc::clone(&attachment.transport)))
                .ok_or(RpcError::TransportClosed),
            None => match attachments.as_slice() {
                [] => Err(RpcError::not_connected("no transport attached")),
                [only] => Ok((only.id, Arc::clone(&only.transport))),
                _ => Err(RpcError::AmbiguousTransport),
            },
        }
    }

    fn take_pending(&self, id: &RequestId) -> Option<PendingEntry> {
        self.pending
            .lock()
            .expect("pending table poisoned")
            .remove(id)
    }
}
