//! Newline-delimited JSON stream transport
//!
//! Reads arbitrary chunks from an `AsyncRead`, reassembles complete lines,
//! and decodes each line independently; a bad line is reported through the
//! error callback without disturbing the rest of the buffer. Writes are one
//! serialized message per line, serialized atomically per message.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::errors::RpcError;
use crate::message::Message;
use crate::transport::{CallbackCell, MessageMeta, SendOptions, Transport, TransportCallbacks};

const READ_CHUNK_CAPACITY: usize = 8 * 1024;

pub struct StreamTransport<R, W> {
    reader: Mutex<Option<R>>,
    writer: tokio::sync::Mutex<Option<W>>,
    state: Mutex<State>,
    callbacks: Arc<CallbackCell>,
    custom: Arc<Mutex<Option<Value>>>,
}

#[derive(Default)]
struct State {
    started: bool,
    closed: bool,
    reader_task: Option<JoinHandle<()>>,
}

pub type StdioTransport = StreamTransport<tokio::io::Stdin, tokio::io::Stdout>;

/// Transport over the process standard streams.
pub fn stdio() -> StdioTransport {
    StreamTransport::new(tokio::io::stdin(), tokio::io::stdout())
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            state: Mutex::new(State::default()),
            callbacks: Arc::new(CallbackCell::default()),
            custom: Arc::new(Mutex::new(None)),
        }
    }
}

/// Drain every complete line currently in `buffer`, decoding each one
/// independently.
fn drain_lines(buffer: &mut BytesMut, callbacks: &CallbackCell, custom: &Mutex<Option<Value>>) {
    while let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
        let line = buffer.split_to(newline + 1);
        decode_line(&line[..newline], callbacks, custom);
    }
}

fn decode_line(line: &[u8], callbacks: &CallbackCell, custom: &Mutex<Option<Value>>) {
    let line = trim_line(line);
    if line.is_empty() {
        return;
    }

    match serde_json::from_slice::<Message>(line) {
        Ok(message) => {
            let meta = MessageMeta {
                custom: custom.lock().expect("custom context poisoned").clone(),
                ..MessageMeta::default()
            };
            callbacks.emit_message(message, meta);
        }
        Err(err) => callbacks.emit_error(RpcError::parse(err.to_string())),
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    };
    if line.iter().all(u8::is_ascii_whitespace) {
        &[]
    } else {
        line
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&self) -> Result<(), RpcError> {
        let mut reader = {
            let mut state = self.state.lock().expect("stream state poisoned");
            if state.started {
                return Err(RpcError::AlreadyStarted);
            }
            state.started = true;
            self.reader
                .lock()
                .expect("reader slot poisoned")
                .take()
                .ok_or(RpcError::AlreadyStarted)?
        };

        let callbacks = Arc::clone(&self.callbacks);
        let custom = Arc::clone(&self.custom);
        let task = tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(READ_CHUNK_CAPACITY);
            loop {
                match reader.read_buf(&mut buffer).await {
                    Ok(0) => break,
                    Ok(_) => drain_lines(&mut buffer, &callbacks, &custom),
                    Err(err) => {
                        callbacks.emit_error(RpcError::parse(format!("read failed: {err}")));
                        break;
                    }
                }
            }
            // Trailing bytes without a final newline still form one message.
            if buffer.has_remaining() {
                let line = buffer.split();
                decode_line(&line, &callbacks, &custom);
            }
            callbacks.emit_close();
        });

        self.state
            .lock()
            .expect("stream state poisoned")
            .reader_task = Some(task);
        Ok(())
    }

    async fn send(&self, message: &Message, _options: &SendOptions) -> Result<(), RpcError> {
        {
            let state = self.state.lock().expect("stream state poisoned");
            if state.closed {
                return Err(RpcError::TransportClosed);
            }
            if !state.started {
                return Err(RpcError::not_connected("transport not started"));
            }
        }

        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        // The writer mutex is held across the whole write, so concurrent
        // sends never interleave mid-line.
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(RpcError::TransportClosed)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|_| RpcError::TransportClosed)?;
        writer.flush().await.map_err(|_| RpcError::TransportClosed)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RpcError> {
        let task = {
            let mut state = self.state.lock().expect("stream state poisoned");
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.reader_task.take()
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
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
