//! The wire transport seam.
//!
//! [`Transport`] abstracts the platform socket primitive behind `open()`;
//! the returned [`TransportHandle`] is a pair of channels: frames out,
//! [`TransportEvent`]s in. [`WebSocketTransport`] is the production
//! implementation over `tokio-tungstenite`; tests plug in fakes by
//! constructing a handle from raw channels.

use async_trait::async_trait;
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

use crate::Result;
use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::frame::Frame;

/// Inbound notification from an open transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A well-formed frame arrived; `bytes` is its encoded size
    Frame { frame: Frame, bytes: u64 },
    /// An inbound payload that did not parse as a frame. Dropped, counted.
    Malformed { reason: String },
    /// The remote closed the connection
    Closed { code: Option<u16>, reason: String },
    /// Mid-session I/O failure
    Error(Error),
}

/// One physical duplex connection.
///
/// Dropping the `outgoing` sender closes the connection gracefully.
#[derive(Debug)]
pub struct TransportHandle {
    pub(crate) outgoing: mpsc::UnboundedSender<Frame>,
    pub(crate) incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    /// Assemble a handle from raw channels; the seam for fake transports.
    #[must_use]
    pub fn new(
        outgoing: mpsc::UnboundedSender<Frame>,
        incoming: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outgoing, incoming }
    }
}

/// Factory for physical connections. One `open()` call per connection
/// attempt; reconnection re-opens through the same transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, config: &ConnectionConfig) -> Result<TransportHandle>;
}

/// Production transport over `tokio-tungstenite`.
///
/// Frames are JSON-encoded and carried as text messages, or as binary
/// messages when [`ConnectionConfig::binary_frames`] is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, config: &ConnectionConfig) -> Result<TransportHandle> {
        let (ws_stream, _) = connect_async(&config.endpoint)
            .await
            .map_err(|e| Error::connection(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let binary = config.binary_frames;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                forward_payload(&in_tx, text.as_bytes());
                            }
                            Some(Ok(Message::Binary(bytes))) => {
                                forward_payload(&in_tx, &bytes);
                            }
                            Some(Ok(Message::Close(close))) => {
                                let (code, reason) = match close {
                                    Some(frame) => {
                                        (Some(frame.code.into()), frame.reason.as_str().to_owned())
                                    }
                                    None => (None, String::new()),
                                };
                                drop(in_tx.send(TransportEvent::Closed { code, reason }));
                                break;
                            }
                            Some(Ok(_)) => {
                                // WebSocket-level ping/pong handled by tungstenite
                            }
                            Some(Err(e)) => {
                                drop(in_tx.send(TransportEvent::Error(e.into())));
                                break;
                            }
                            None => {
                                drop(in_tx.send(TransportEvent::Closed {
                                    code: None,
                                    reason: "stream ended".to_owned(),
                                }));
                                break;
                            }
                        }
                    }
                    frame = out_rx.recv() => {
                        match frame {
                            Some(frame) => {
                                let Ok(encoded) = serde_json::to_string(&frame) else {
                                    tracing::warn!(id = %frame.id, "dropping unencodable frame");
                                    continue;
                                };
                                let message = if binary {
                                    Message::Binary(encoded.into_bytes().into())
                                } else {
                                    Message::Text(encoded.into())
                                };
                                if let Err(e) = write.send(message).await {
                                    drop(in_tx.send(TransportEvent::Error(e.into())));
                                    break;
                                }
                            }
                            None => {
                                // Client side hung up: close cleanly
                                drop(write.close().await);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(TransportHandle::new(out_tx, in_rx))
    }
}

fn forward_payload(in_tx: &mpsc::UnboundedSender<TransportEvent>, payload: &[u8]) {
    match serde_json::from_slice::<Frame>(payload) {
        Ok(frame) => drop(in_tx.send(TransportEvent::Frame {
            frame,
            bytes: payload.len() as u64,
        })),
        Err(e) => drop(in_tx.send(TransportEvent::Malformed {
            reason: e.to_string(),
        })),
    }
}
