//! Event stream: ordered, buffered delivery of Runner Events to the
//! coordinator over a reconnecting transport.
//!
//! The stream owns the connection state machine
//! (`Disconnected -> Connecting -> Connected`, with `Reconnecting`
//! between losses), a count-bounded FIFO buffer for events that could not
//! be written, exponential-backoff reconnects, and the keepalive ping
//! task. Inbound command lines from the same connection are pumped into a
//! channel the runner consumes.
//!
//! Buffer and connection state share one critical section: every
//! operation locks the inner state once, so concurrent sessions can call
//! [`EventStream::send`] freely while per-session ordering is preserved.

pub mod backoff;
pub mod buffer;
pub mod transport;

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::protocol::{Heartbeat, RunnerEvent};
use crate::stream::backoff::reconnect_delay;
use crate::stream::buffer::EventBuffer;
use crate::stream::transport::{ConnectionSink, InboundItem, Transport};
use crate::{AppError, Result};

/// Capacity of the notice channel.
const NOTICE_CAPACITY: usize = 1024;

/// Capacity of the inbound command channel.
const COMMAND_CAPACITY: usize = 256;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No connection and no pending attempt.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Live connection.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

/// Typed notifications emitted by the stream.
#[derive(Debug)]
pub enum StreamNotice {
    /// A connection was established (initial or after reconnect).
    Connected,
    /// Connection lost; a reconnect is scheduled.
    Reconnecting {
        /// 1-based attempt counter since the last successful connect.
        attempt: u32,
        /// Backoff delay before the attempt.
        delay: Duration,
    },
    /// All reconnect attempts exhausted; the stream stays disconnected
    /// until an explicit reconnect. Operator attention required.
    ReconnectExhausted,
    /// The buffer overflowed and this event was dropped.
    EventEvicted(Box<RunnerEvent>),
    /// Intentional disconnect completed.
    Disconnected,
}

/// Whether a send was written immediately or parked in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the live connection.
    Sent,
    /// Appended to the buffer for a later flush.
    Buffered,
}

/// Receivers handed to the runner at construction.
pub struct StreamHandles {
    /// Stream notifications.
    pub notices: mpsc::Receiver<StreamNotice>,
    /// Inbound command lines from the coordinator.
    pub commands: mpsc::Receiver<String>,
}

struct StreamInner {
    state: StreamState,
    buffer: EventBuffer,
    sink: Option<Box<dyn ConnectionSink>>,
    /// Failed attempts since the last successful connect.
    attempts: u32,
    reconnect_cancel: Option<CancellationToken>,
    ping_cancel: Option<CancellationToken>,
    /// Intentional-shutdown latch; suppresses reconnects.
    shutdown: bool,
}

/// Reconnecting, buffering event transport to the coordinator.
pub struct EventStream {
    config: StreamConfig,
    url: String,
    transport: Arc<dyn Transport>,
    inner: Mutex<StreamInner>,
    notice_tx: mpsc::Sender<StreamNotice>,
    command_tx: mpsc::Sender<String>,
    item_tx: mpsc::Sender<InboundItem>,
    /// Self-handle for background tasks (reconnect timers, ping loop).
    weak: Weak<Self>,
}

impl EventStream {
    /// Create a stream over the given transport.
    ///
    /// Returns the stream plus the notice/command receivers. The stream
    /// starts disconnected; call [`connect`](Self::connect) to open it.
    #[must_use]
    pub fn new(
        config: StreamConfig,
        url: String,
        transport: Arc<dyn Transport>,
    ) -> (Arc<Self>, StreamHandles) {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (item_tx, item_rx) = mpsc::channel(COMMAND_CAPACITY);

        let stream = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            inner: Mutex::new(StreamInner {
                state: StreamState::Disconnected,
                buffer: EventBuffer::new(config.max_buffer_size),
                sink: None,
                attempts: 0,
                reconnect_cancel: None,
                ping_cancel: None,
                shutdown: false,
            }),
            config,
            url,
            transport,
            notice_tx,
            command_tx,
            item_tx,
            weak: weak.clone(),
        });

        stream.spawn_inbound_pump(item_rx);

        (
            stream,
            StreamHandles {
                notices: notice_rx,
                commands: command_rx,
            },
        )
    }

    /// Open the transport.
    ///
    /// On failure the stream schedules a reconnect by itself; the error is
    /// returned so the caller can log the cause.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] if an attempt is already active or
    /// the immediate attempt failed.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if !matches!(inner.state, StreamState::Disconnected) {
                return Err(AppError::Transport(
                    "connection already active or in progress".into(),
                ));
            }
            inner.shutdown = false;
            inner.attempts = 0;
            inner.state = StreamState::Connecting;
        }

        match self
            .transport
            .connect(&self.url, self.item_tx.clone())
            .await
        {
            Ok(sink) => {
                self.install_connection(sink).await;
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                self.begin_loss_locked(&mut inner);
                Err(err)
            }
        }
    }

    /// Deliver one Runner Event.
    ///
    /// Writes immediately when connected; otherwise (or on write failure)
    /// the event is buffered and the call returns without blocking on the
    /// network.
    pub async fn send(&self, event: RunnerEvent) -> SendOutcome {
        let mut inner = self.inner.lock().await;

        if inner.state == StreamState::Connected && inner.sink.is_some() {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "event serialization failed, dropping");
                    return SendOutcome::Sent;
                }
            };
            let written = match inner.sink.as_mut() {
                Some(sink) => sink.send_text(text).await,
                None => Err(AppError::Transport("not connected".into())),
            };
            match written {
                Ok(()) => return SendOutcome::Sent,
                Err(err) => {
                    warn!(%err, "event write failed, buffering");
                    self.buffer_locked(&mut inner, event);
                    self.begin_loss_locked(&mut inner);
                    return SendOutcome::Buffered;
                }
            }
        }

        self.buffer_locked(&mut inner, event);
        SendOutcome::Buffered
    }

    /// Send a heartbeat frame.
    ///
    /// Heartbeats describe "now" and are never buffered; when the stream
    /// is not connected the heartbeat is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when disconnected or the write
    /// fails.
    pub async fn send_heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != StreamState::Connected {
            return Err(AppError::Transport("not connected".into()));
        }
        let text = serde_json::to_string(heartbeat)
            .map_err(|err| AppError::Transport(format!("heartbeat serialization: {err}")))?;
        let written = match inner.sink.as_mut() {
            Some(sink) => sink.send_text(text).await,
            None => Err(AppError::Transport("not connected".into())),
        };
        if let Err(err) = written {
            warn!(%err, "heartbeat write failed");
            self.begin_loss_locked(&mut inner);
            return Err(err);
        }
        Ok(())
    }

    /// Intentional disconnect: cancels any pending reconnect timer first
    /// so a stale attempt cannot fire after shutdown.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutdown = true;
        if let Some(token) = inner.reconnect_cancel.take() {
            token.cancel();
        }
        if let Some(token) = inner.ping_cancel.take() {
            token.cancel();
        }
        if let Some(mut sink) = inner.sink.take() {
            sink.close().await;
        }
        inner.state = StreamState::Disconnected;
        drop(inner);
        self.notify(StreamNotice::Disconnected);
        info!("event stream disconnected");
    }

    /// Current connection state.
    pub async fn state(&self) -> StreamState {
        self.inner.lock().await.state
    }

    /// Number of currently buffered events.
    pub async fn buffered(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn notify(&self, notice: StreamNotice) {
        if let Err(err) = self.notice_tx.try_send(notice) {
            warn!(%err, "stream notice dropped");
        }
    }

    fn buffer_locked(&self, inner: &mut StreamInner, event: RunnerEvent) {
        if let Some(evicted) = inner.buffer.push(event) {
            debug!(
                session_id = evicted.session_id,
                seq = evicted.seq,
                "buffer overflow, oldest event evicted"
            );
            self.notify(StreamNotice::EventEvicted(Box::new(evicted)));
        }
    }

    /// Record a connection loss and schedule the next attempt (or give up).
    ///
    /// Callers hold the inner lock. No-op once shutdown is latched or the
    /// stream is already waiting out a backoff.
    fn begin_loss_locked(&self, inner: &mut StreamInner) {
        if inner.shutdown
            || matches!(
                inner.state,
                StreamState::Reconnecting | StreamState::Disconnected
            )
        {
            return;
        }

        if let Some(mut sink) = inner.sink.take() {
            tokio::spawn(async move { sink.close().await });
        }
        if let Some(token) = inner.ping_cancel.take() {
            token.cancel();
        }

        inner.attempts += 1;
        if inner.attempts > self.config.max_reconnect_attempts {
            inner.state = StreamState::Disconnected;
            warn!(
                attempts = inner.attempts - 1,
                "reconnect attempts exhausted; stream requires operator attention"
            );
            self.notify(StreamNotice::ReconnectExhausted);
            return;
        }

        let delay = reconnect_delay(
            Duration::from_millis(self.config.reconnect_base_ms),
            Duration::from_millis(self.config.reconnect_cap_ms),
            inner.attempts,
        );
        inner.state = StreamState::Reconnecting;
        info!(attempt = inner.attempts, ?delay, "scheduling reconnect");
        self.notify(StreamNotice::Reconnecting {
            attempt: inner.attempts,
            delay,
        });

        let Some(stream) = self.weak.upgrade() else {
            return;
        };
        let token = CancellationToken::new();
        inner.reconnect_cancel = Some(token.clone());
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    stream.retry_connect().await;
                }
            }
        });
    }

    /// One scheduled reconnect attempt.
    async fn retry_connect(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.shutdown || inner.state != StreamState::Reconnecting {
                return;
            }
            inner.reconnect_cancel = None;
            inner.state = StreamState::Connecting;
        }

        match self
            .transport
            .connect(&self.url, self.item_tx.clone())
            .await
        {
            Ok(sink) => self.install_connection(sink).await,
            Err(err) => {
                warn!(%err, "reconnect attempt failed");
                let mut inner = self.inner.lock().await;
                self.begin_loss_locked(&mut inner);
            }
        }
    }

    /// Install a fresh connection: reset attempts, start the keepalive
    /// ping, and flush the buffer oldest-first, stopping at the first
    /// failure.
    async fn install_connection(&self, mut sink: Box<dyn ConnectionSink>) {
        let mut inner = self.inner.lock().await;
        if inner.shutdown {
            // A disconnect raced the in-flight attempt; drop the socket.
            sink.close().await;
            return;
        }
        inner.sink = Some(sink);
        inner.state = StreamState::Connected;
        inner.attempts = 0;

        let ping_token = CancellationToken::new();
        inner.ping_cancel = Some(ping_token.clone());
        self.spawn_ping(ping_token);

        self.notify(StreamNotice::Connected);
        info!(buffered = inner.buffer.len(), "event stream connected");

        // Flush buffered events in order; the remainder stays buffered on
        // the first failure.
        while let Some(event) = inner.buffer.pop_front() {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "buffered event serialization failed, dropping");
                    continue;
                }
            };
            let written = match inner.sink.as_mut() {
                Some(sink) => sink.send_text(text).await,
                None => Err(AppError::Transport("not connected".into())),
            };
            if let Err(err) = written {
                warn!(%err, "flush interrupted, re-buffering");
                inner.buffer.push_front(event);
                self.begin_loss_locked(&mut inner);
                break;
            }
        }
    }

    fn spawn_ping(&self, token: CancellationToken) {
        let Some(stream) = self.weak.upgrade() else {
            return;
        };
        let interval = Duration::from_secs(self.config.ping_interval_seconds.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let mut inner = stream.inner.lock().await;
                if inner.state != StreamState::Connected {
                    break;
                }
                let pinged = match inner.sink.as_mut() {
                    Some(sink) => sink.ping().await,
                    None => break,
                };
                if let Err(err) = pinged {
                    warn!(%err, "keepalive ping failed");
                    stream.begin_loss_locked(&mut inner);
                    break;
                }
            }
        });
    }

    /// Forward inbound text frames to the command channel and turn the
    /// transport's close signal into loss handling.
    fn spawn_inbound_pump(&self, mut item_rx: mpsc::Receiver<InboundItem>) {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            while let Some(item) = item_rx.recv().await {
                let Some(stream) = weak.upgrade() else {
                    break;
                };
                match item {
                    InboundItem::Text(line) => {
                        if stream.command_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    InboundItem::Closed => {
                        let mut inner = stream.inner.lock().await;
                        if inner.state == StreamState::Connected {
                            warn!("coordinator connection closed");
                            stream.begin_loss_locked(&mut inner);
                        }
                    }
                }
            }
        });
    }
}
