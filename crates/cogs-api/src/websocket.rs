//! WebSocket transport.
//!
//! A connection is exposed as a [`TransportLink`]: a pair of bounded
//! channels, one carrying [`Frame`]s to the server and one carrying
//! [`TransportEvent`]s back. The [`Connector`] trait is the seam between
//! the connection manager and the network, so the manager can be driven
//! by an in-memory peer in tests.
//!
//! [`WebSocketConnector`] performs the signed upgrade handshake and spawns
//! a single pump task that owns both halves of the socket.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use url::Url;

use crate::auth::SignedAuth;
use crate::error::Error;

// ── Channel capacity ─────────────────────────────────────────────────

const DEFAULT_LINK_CAPACITY: usize = 256;

/// Close code reported when the stream ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

// ── Frames and events ────────────────────────────────────────────────

/// Outbound instruction for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Close,
}

/// Something the transport observed on the socket.
#[derive(Debug)]
pub enum TransportEvent {
    Text(String),
    /// The socket is gone. Sent at most once, and never after a locally
    /// requested [`Frame::Close`].
    Closed(Error),
}

// ── TransportLink ────────────────────────────────────────────────────

/// The manager's end of an open connection.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// The transport's end of a [`TransportLink`].
#[derive(Debug)]
pub struct TransportPeer {
    pub outbound: mpsc::Receiver<Frame>,
    pub inbound: mpsc::Sender<TransportEvent>,
}

impl TransportLink {
    /// Create a connected link/peer pair with the given channel capacity.
    pub fn pair(capacity: usize) -> (Self, TransportPeer) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            TransportPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// Opens authenticated connections to the Pub/Sub endpoint.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        url: &Url,
        auth: &SignedAuth,
    ) -> BoxFuture<'static, Result<TransportLink, Error>>;
}

/// The production [`Connector`], backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    capacity: usize,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the capacity of the link's channels.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LINK_CAPACITY,
        }
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        url: &Url,
        auth: &SignedAuth,
    ) -> BoxFuture<'static, Result<TransportLink, Error>> {
        let url = url.clone();
        let auth = auth.clone();
        let capacity = self.capacity;

        Box::pin(async move {
            tracing::info!(url = %url, "Connecting to WebSocket");

            let uri: tungstenite::http::Uri = url.as_str().parse().map_err(
                |e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()),
            )?;

            let mut request = ClientRequestBuilder::new(uri);
            for (name, value) in auth.headers() {
                request = request.with_header(name, value);
            }

            let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

            tracing::info!("WebSocket connected");

            let (link, peer) = TransportLink::pair(capacity);
            tokio::spawn(pump(ws_stream, peer));
            Ok(link)
        })
    }
}

// ── Socket pump ──────────────────────────────────────────────────────

/// Shuttle frames between the socket and the link until either side
/// goes away.
async fn pump<S>(ws_stream: tokio_tungstenite::WebSocketStream<S>, peer: TransportPeer)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let TransportPeer {
        outbound: mut outbound_rx,
        inbound: inbound_tx,
    } = peer;
    let (mut write, mut read) = ws_stream.split();

    let error = loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let message = match frame {
                    Some(Frame::Text(text)) => tungstenite::Message::text(text),
                    Some(Frame::Ping) => tungstenite::Message::Ping(Vec::<u8>::new().into()),
                    Some(Frame::Close) | None => {
                        tracing::debug!("Closing WebSocket");
                        let _ = write.send(tungstenite::Message::Close(None)).await;
                        let _ = write.close().await;
                        return;
                    }
                };
                if let Err(e) = write.send(message).await {
                    break Error::WebSocket(e.to_string());
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let event = TransportEvent::Text(text.as_str().to_owned());
                        if inbound_tx.send(event).await.is_err() {
                            // Link dropped without an explicit close.
                            let _ = write.close().await;
                            return;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let (code, reason) = frame.map_or((ABNORMAL_CLOSURE, String::new()), |cf| {
                            (u16::from(cf.code), cf.reason.as_str().to_owned())
                        });
                        tracing::info!(code, reason = %reason, "WebSocket close frame received");
                        break Error::WebSocketClosed { code, reason };
                    }
                    Some(Ok(tungstenite::Message::Pong(_))) => {
                        tracing::trace!("WebSocket pong");
                    }
                    Some(Ok(_)) => {
                        // Binary, Ping (answered by tungstenite), raw frames
                    }
                    Some(Err(e)) => break Error::WebSocket(e.to_string()),
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break Error::WebSocketClosed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".into(),
                        };
                    }
                }
            }
        }
    };

    tracing::warn!(error = %error, "WebSocket connection lost");
    let _ = inbound_tx.send(TransportEvent::Closed(error)).await;
}

// ── Tests ────────────────────────────────────────────────────────────
