// =============================================================================
// Tick transport — the seam between the connection manager and the wire
// =============================================================================
//
// A transport produces one TransportLink per connection attempt: a channel of
// link events plus a cancelable shutdown handle. The production WsTransport
// speaks WebSocket via tokio-tungstenite; tests substitute scripted
// transports so the whole state machine runs headlessly.
// =============================================================================

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::types::Subscription;

/// Capacity of the per-link event channel.
const LINK_EVENT_BUFFER: usize = 256;

/// One event from a live transport link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A text payload to decode.
    Message(String),
    /// The peer closed the connection. `code` is absent when the stream
    /// ended without a close frame.
    Closed { code: Option<u16>, reason: String },
    /// The link failed at the transport level.
    Failed(String),
}

/// A live connection: inbound events plus a shutdown handle that closes the
/// link from the caller's side.
pub struct TransportLink {
    events: mpsc::Receiver<LinkEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TransportLink {
    pub fn new(events: mpsc::Receiver<LinkEvent>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            events,
            shutdown: Some(shutdown),
        }
    }

    /// Next event, or `None` once the link's pump has exited.
    pub async fn next(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    /// Ask the link to close. Safe to call more than once; the pump may
    /// already be gone.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Establishes links for the connection manager. Implementations must be
/// cheap to share behind an `Arc`.
pub trait TickTransport: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<TransportLink>>;
}

// ---------------------------------------------------------------------------
// Stream addressing
// ---------------------------------------------------------------------------

/// Build the stream URL for a subscription. The subscription is carried as
/// query parameters on the transport endpoint.
pub fn build_stream_url(endpoint: &str, sub: &Subscription) -> String {
    format!(
        "{}?exchange={}&symbol={}&interval={}",
        endpoint.trim_end_matches('/'),
        sub.exchange,
        sub.symbol,
        sub.interval_ms
    )
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// Production transport: one WebSocket per link, pumped by a background task.
///
/// The pump forwards text frames, answers pings, and reports the close code
/// when the peer hangs up. Firing the shutdown handle sends a normal close
/// frame; so does dropping the link.
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl TickTransport for WsTransport {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<TransportLink>> {
        Box::pin(async move {
            let (ws_stream, _response) =
                tokio::time::timeout(self.connect_timeout, connect_async(url))
                    .await
                    .map_err(|_| anyhow!("websocket handshake timed out"))?
                    .context("websocket handshake failed")?;

            let (mut write, mut read) = ws_stream.split();
            let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_BUFFER);
            let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if event_tx.send(LinkEvent::Message(text)).await.is_err() {
                                    // Receiver gone; the connection task has
                                    // moved on.
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = match frame {
                                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                                    None => (None, "no close frame".to_string()),
                                };
                                let _ = event_tx.send(LinkEvent::Closed { code, reason }).await;
                                break;
                            }
                            // Binary / Pong / raw frames carry no ticks.
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = event_tx.send(LinkEvent::Failed(e.to_string())).await;
                                break;
                            }
                            None => {
                                let _ = event_tx
                                    .send(LinkEvent::Closed {
                                        code: None,
                                        reason: "stream ended".to_string(),
                                    })
                                    .await;
                                break;
                            }
                        },
                        // Caller-side close, or the link was dropped.
                        _ = &mut shutdown_rx => {
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "client closing".into(),
                                })))
                                .await;
                            debug!("websocket link closed by caller");
                            break;
                        }
                    }
                }
            });

            Ok(TransportLink::new(event_rx, shutdown_tx))
        })
    }
}
