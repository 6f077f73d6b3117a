//! In-process loopback transport
//!
//! Two instances form a linked pair; `send` on one side delivers straight
//! into the other side's receive path. Used for same-process engine pairs
//! and throughout the engine tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::RpcError;
use crate::message::Message;
use crate::transport::{CallbackCell, MessageMeta, SendOptions, Transport, TransportCallbacks};

pub struct InProcessTransport {
    state: Mutex<Inner>,
    callbacks: CallbackCell,
}

#[derive(Default)]
struct Inner {
    started: bool,
    closed: bool,
    peer: Option<Weak<InProcessTransport>>,
    /// Messages that arrived before `start`, flushed in arrival order.
    buffered: VecDeque<Message>,
    custom: Option<Value>,
}

impl InProcessTransport {
    /// Create a linked pair. Messages sent on one side are received on the
    /// other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let left = Arc::new(Self::unlinked());
        let right = Arc::new(Self::unlinked());
        left.state.lock().expect("transport state poisoned").peer = Some(Arc::downgrade(&right));
        right.state.lock().expect("transport state poisoned").peer = Some(Arc::downgrade(&left));
        (left, right)
    }

    fn unlinked() -> Self {
        Self {
            state: Mutex::new(Inner::default()),
            callbacks: CallbackCell::default(),
        }
    }

    /// Inbound delivery from the linked peer. The metadata carries this
    /// side's own custom context: the sender is merely triggering the
    /// receiving side's receive path, so the receiving side's context wins.
    fn deliver(&self, message: Message) -> Result<(), RpcError> {
        let meta = {
            let mut state = self.state.lock().expect("transport state poisoned");
            if state.closed {
                return Err(RpcError::TransportClosed);
            }
            if !state.started {
                state.buffered.push_back(message);
                return Ok(());
            }
            MessageMeta {
                custom: state.custom.clone(),
                ..MessageMeta::default()
            }
        };

        self.callbacks.emit_message(message, meta);
        Ok(())
    }

    /// Close initiated by the linked peer. Runs at most once; the peer link
    /// is dropped so later sends fail with `TransportClosed`.
    fn peer_closed(&self) {
        {
            let mut state = self.state.lock().expect("transport state poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.peer = None;
        }
        self.callbacks.emit_close();
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn start(&self) -> Result<(), RpcError> {
        let (buffered, custom) = {
            let mut state = self.state.lock().expect("transport state poisoned");
            if state.started {
                return Err(RpcError::AlreadyStarted);
            }
            state.started = true;
            (
                std::mem::take(&mut state.buffered),
                state.custom.clone(),
            )
        };

        for message in buffered {
            let meta = MessageMeta {
                custom: custom.clone(),
                ..MessageMeta::default()
            };
            self.callbacks.emit_message(message, meta);
        }
        Ok(())
    }

    async fn send(&self, message: &Message, _options: &SendOptions) -> Result<(), RpcError> {
        let peer = {
            let state = self.state.lock().expect("transport state poisoned");
            if state.closed {
                return Err(RpcError::TransportClosed);
            }
            if !state.started {
                return Err(RpcError::not_connected("transport not started"));
            }
            state.peer.clone()
        };

        let peer = peer
            .and_then(|peer| peer.upgrade())
            .ok_or(RpcError::TransportClosed)?;
        peer.deliver(message.clone())
    }

    async fn close(&self) -> Result<(), RpcError> {
        let peer = {
            let mut state = self.state.lock().expect("transport state poisoned");
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.peer.take()
        };

        self.callbacks.emit_close();
        if let Some(peer) = peer.and_then(|peer| peer.upgrade()) {
            peer.peer_closed();
        }
        Ok(())
    }

    fn bind(&self, callbacks: TransportCallbacks) {
        self.callbacks.replace(callbacks);
    }

    fn set_custom_context(&self, value: Value) {
        self.state.lock().expect("transport state poisoned").custom = Some(value);
    }
}
