//! Transport seam for the event stream.
//!
//! The production transport is a `tokio-tungstenite` WebSocket client;
//! tests inject an in-memory implementation. A transport owns its reader:
//! inbound text frames and the close signal are pumped into the channel
//! supplied at connect time, while the returned sink handles outbound
//! writes.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Item delivered from the transport's reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundItem {
    /// One inbound text frame (a JSON command line).
    Text(String),
    /// The connection closed or errored; no more items will follow.
    Closed,
}

/// Outbound half of an open connection.
pub trait ConnectionSink: Send {
    /// Write one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when the write fails; the caller
    /// treats this as connection loss.
    fn send_text(&mut self, text: String)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Write a keepalive ping frame.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when the write fails.
    fn ping(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Close the connection. Best effort; errors are swallowed.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Connection factory.
pub trait Transport: Send + Sync {
    /// Open a connection to `url`.
    ///
    /// The transport spawns its own reader, delivering text frames and the
    /// final [`InboundItem::Closed`] through `inbound`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`] when the connection cannot be
    /// established.
    fn connect(
        &self,
        url: &str,
        inbound: mpsc::Sender<InboundItem>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ConnectionSink>>> + Send + '_>>;
}

// ── WebSocket implementation ──────────────────────────────────────────────────

type WsWriter = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

/// Production WebSocket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

struct WsSink {
    writer: WsWriter,
}

impl ConnectionSink for WsSink {
    fn send_text(
        &mut self,
        text: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.writer
                .send(Message::Text(text.into()))
                .await
                .map_err(|err| AppError::Transport(format!("send failed: {err}")))
        })
    }

    fn ping(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.writer
                .send(Message::Ping(Vec::new().into()))
                .await
                .map_err(|err| AppError::Transport(format!("ping failed: {err}")))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(err) = self.writer.send(Message::Close(None)).await {
                debug!(%err, "close frame send failed");
            }
        })
    }
}

impl Transport for WsTransport {
    fn connect(
        &self,
        url: &str,
        inbound: mpsc::Sender<InboundItem>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn ConnectionSink>>> + Send + '_>> {
        let url = url.to_owned();
        Box::pin(async move {
            let (ws, _response) = connect_async(&url)
                .await
                .map_err(|err| AppError::Transport(format!("connect failed: {err}")))?;

            let (writer, mut reader) = ws.split();

            tokio::spawn(async move {
                while let Some(message) = reader.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if inbound
                                .send(InboundItem::Text(text.to_string()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {
                            // Pongs and binary frames carry no application
                            // meaning here.
                        }
                        Err(err) => {
                            warn!(%err, "websocket read error");
                            break;
                        }
                    }
                }
                let _ = inbound.send(InboundItem::Closed).await;
            });

            Ok(Box::new(WsSink { writer }) as Box<dyn ConnectionSink>)
        })
    }
}
