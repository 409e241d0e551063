//! The transport seam: how a WebSocket to the controller is opened.
//!
//! Everything above this module (probe, scanner, connection manager) talks
//! to a [`Link`], never to a socket.  A link is two unbounded channels:
//!
//! ```text
//!   caller ── Outbound ──►  writer task ──► WebSocket sink
//!   caller ◄── LinkEvent ── reader task ◄── WebSocket stream
//! ```
//!
//! [`WsConnector`] is the production implementation over tokio-tungstenite.
//! Tests provide their own [`Connector`] and drive the far end of a
//! [`Link::pair`] by hand, so no sockets are needed to exercise the state
//! machine.
//!
//! # Closing
//!
//! Sending [`Outbound::Close`] (or dropping the outbound sender) makes the
//! writer task run the WebSocket close handshake.  Dropping the inbound
//! receiver stops the reader task.  The reader always finishes with exactly
//! one [`LinkEvent::Closed`] if anyone is still listening.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Error as WsError, tungstenite::Message};
use tracing::{debug, trace, warn};

use tank_core::DeviceEndpoint;

/// Errors raised while opening a link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The TCP connection could not be established (refused, unreachable).
    #[error("cannot reach {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// TCP connected but the WebSocket upgrade failed.
    #[error("WebSocket handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },
}

impl TransportError {
    fn from_ws(endpoint: &DeviceEndpoint, err: WsError) -> Self {
        match err {
            WsError::Io(e) => TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            },
            other => TransportError::Handshake {
                endpoint: endpoint.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// A frame or command travelling towards the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Start the close handshake and stop writing.
    Close,
}

/// Something that happened on the device side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame, exactly as received.
    Text(String),
    /// A ping or pong control frame.  Counts as traffic for liveness.
    Control,
    /// The link is gone.  `reason` is the close-frame reason or the I/O
    /// error, when there was one.
    Closed { reason: Option<String> },
}

/// An open link to a device.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// The device side of a [`Link::pair`].
#[derive(Debug)]
pub struct LinkPeer {
    /// Frames the local side wrote.
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Push events here to make them appear on the local side.
    pub inbound: mpsc::UnboundedSender<LinkEvent>,
}

impl Link {
    /// Creates a link whose far end is driven by hand.
    pub fn pair() -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    /// Asks the writer to close the link and drops both halves.
    pub fn close(self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Opens links to devices.
///
/// No timeout is applied here; callers wrap [`Connector::open`] in
/// `tokio::time::timeout` with whatever bound fits (probe timeout or
/// handshake timeout).
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a WebSocket to `endpoint` and returns once the handshake completed.
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Link, TransportError>;
}

// ── tokio-tungstenite implementation ──────────────────────────────────────────

/// Production [`Connector`] using `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Link, TransportError> {
        let url = endpoint.ws_url();
        trace!("opening {url}");

        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::from_ws(endpoint, e))?;

        let (mut sink, mut stream) = ws_stream.split();
        let (link, peer) = Link::pair();
        let LinkPeer {
            outbound: mut out_rx,
            inbound: in_tx,
        } = peer;

        // Writer: drains the outbound channel until told to close or until
        // every sender is gone, then runs the close handshake.
        let writer_endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            debug!("write to {writer_endpoint} failed: {e}");
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            let _ = sink.close().await;
            trace!("writer for {writer_endpoint} finished");
        });

        // Reader: forwards frames until the socket ends or nobody listens.
        let reader_endpoint = endpoint.clone();
        tokio::spawn(async move {
            let reason = loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = in_tx.closed() => return,
                };

                let event = match next {
                    Some(Ok(Message::Text(text))) => LinkEvent::Text(text),
                    Some(Ok(Message::Binary(bytes))) => {
                        LinkEvent::Text(binary_frame_text(bytes, &reader_endpoint))
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => LinkEvent::Control,
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.into_owned()).filter(|r| !r.is_empty());
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                };

                if in_tx.send(event).is_err() {
                    return;
                }
            };

            debug!("link to {reader_endpoint} closed ({reason:?})");
            let _ = in_tx.send(LinkEvent::Closed { reason });
        });

        Ok(link)
    }
}

/// Text carried by a binary frame.  Invalid UTF-8 is replaced with U+FFFD
/// and logged, so the frame still reaches listeners (as undecoded text).
fn binary_frame_text(bytes: Vec<u8>, endpoint: &DeviceEndpoint) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            warn!(
                "binary frame from {endpoint} is not valid UTF-8 ({}); bytes were replaced",
                e.utf8_error()
            );
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
