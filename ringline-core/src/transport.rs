//! Signaling transport.
//!
//! A [`SignalingClient`] owns one WebSocket-shaped connection to the
//! signaling server and reconnects on unexpected closure with a single,
//! non-stacking fixed-delay timer. The socket itself sits behind the
//! [`Connector`] seam so reconnect behavior is testable with an
//! in-memory pipe and a paused clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::protocol::{decode_inbound, ClientMessage, Decoded, ServerMessage};

/// Delay between a lost connection and the reconnect attempt
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Errors from the signaling transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No identity token is available
    #[error("missing identity token")]
    MissingToken,
    /// The connection attempt failed
    #[error("signaling connect failed: {0}")]
    Connect(String),
}

/// Events delivered by the transport to its consumer
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection opened
    Opened,
    /// A recognized inbound message
    Message(ServerMessage),
    /// An inbound frame that was not JSON
    Malformed,
    /// The connection closed (expectedly or not)
    Closed,
}

/// Outbound surface of the signaling connection.
///
/// `send` never fails: when the channel is closed the message is logged
/// and dropped, matching fire-and-forget signaling semantics.
pub trait SignalingChannel: Send + Sync {
    /// Whether the connection is currently open
    fn is_open(&self) -> bool;

    /// Send a message, dropping it with a warning when closed
    fn send(&self, message: ClientMessage);
}

/// A connected duplex text pipe
pub struct SocketPipe {
    /// Sink for outbound frames
    pub outbound: mpsc::UnboundedSender<String>,
    /// Source of inbound frames; ends when the socket closes
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Dials the signaling server and produces a [`SocketPipe`]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection, authenticating with `token`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when the dial fails.
    async fn connect(&self, url: &Url, token: &str) -> Result<SocketPipe, TransportError>;
}

/// WebSocket [`Connector`] on tokio-tungstenite.
///
/// The identity token travels in the `Sec-WebSocket-Protocol` header,
/// which browser clients of the same server also use.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url, token: &str) -> Result<SocketPipe, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let protocol =
            HeaderValue::from_str(token).map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(SocketPipe {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Reconnect behavior of a [`SignalingClient`]
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Fixed delay before the reconnect attempt
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

enum Link {
    Down,
    Connecting,
    Up(mpsc::UnboundedSender<String>),
}

/// Auto-reconnecting signaling connection.
///
/// At most one reconnect timer exists at a time; a deliberate
/// [`disconnect`](Self::disconnect) cancels it and suppresses future
/// ones until the next [`connect`](Self::connect).
pub struct SignalingClient<C: Connector> {
    connector: C,
    url: Url,
    token: parking_lot::RwLock<String>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: parking_lot::Mutex<Link>,
    manually_closed: AtomicBool,
    reconnect: parking_lot::Mutex<Option<JoinHandle<()>>>,
    // self-handle for the read loop and reconnect timer tasks
    this: Weak<Self>,
}

impl<C: Connector> SignalingClient<C> {
    /// Create a client and the receiver its events arrive on
    pub fn new(
        connector: C,
        url: Url,
        token: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let client = Arc::new_cyclic(|this| Self {
            connector,
            url,
            token: parking_lot::RwLock::new(token.into()),
            policy,
            events,
            link: parking_lot::Mutex::new(Link::Down),
            manually_closed: AtomicBool::new(false),
            reconnect: parking_lot::Mutex::new(None),
            this: this.clone(),
        });
        (client, receiver)
    }

    /// Replace the identity token used for future connections
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    /// Open the connection. A no-op when already open or connecting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MissingToken`] when no token is set and
    /// [`TransportError::Connect`] when the dial fails; a failed dial
    /// also arms the reconnect timer.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let token = self.token.read().clone();
        if token.is_empty() {
            return Err(TransportError::MissingToken);
        }

        {
            let mut link = self.link.lock();
            if !matches!(*link, Link::Down) {
                tracing::debug!("signaling connect skipped, already open or connecting");
                return Ok(());
            }
            *link = Link::Connecting;
        }
        self.manually_closed.store(false, Ordering::SeqCst);
        self.cancel_reconnect();

        match self.connector.connect(&self.url, &token).await {
            Ok(pipe) => {
                {
                    let mut link = self.link.lock();
                    // a disconnect() issued during the dial wins over the dial
                    if !matches!(*link, Link::Connecting)
                        || self.manually_closed.load(Ordering::SeqCst)
                    {
                        tracing::debug!("connection discarded, closed while dialing");
                        return Ok(());
                    }
                    *link = Link::Up(pipe.outbound);
                }
                tracing::info!(url = %self.url, "signaling connected");
                let _ = self.events.send(TransportEvent::Opened);
                if let Some(client) = self.this.upgrade() {
                    tokio::spawn(client.read_loop(pipe.inbound));
                }
                Ok(())
            }
            Err(e) => {
                *self.link.lock() = Link::Down;
                tracing::warn!(error = %e, "signaling connect failed");
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    /// Close the connection and suppress reconnection
    pub fn disconnect(&self) {
        self.manually_closed.store(true, Ordering::SeqCst);
        self.cancel_reconnect();
        {
            let mut link = self.link.lock();
            if matches!(*link, Link::Down) {
                return;
            }
            *link = Link::Down;
        }
        tracing::info!("signaling disconnected");
        let _ = self.events.send(TransportEvent::Closed);
    }

    async fn read_loop(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = inbound.recv().await {
            match decode_inbound(&text) {
                Decoded::Message(message) => {
                    let _ = self.events.send(TransportEvent::Message(message));
                }
                Decoded::Ignored { message_type } => {
                    tracing::debug!(?message_type, "ignoring unrecognized signaling payload");
                }
                Decoded::Invalid => {
                    tracing::warn!("malformed signaling payload");
                    let _ = self.events.send(TransportEvent::Malformed);
                }
            }
        }
        self.handle_closed();
    }

    fn handle_closed(&self) {
        {
            let mut link = self.link.lock();
            if matches!(*link, Link::Down) {
                // already handled by disconnect()
                return;
            }
            *link = Link::Down;
        }
        tracing::warn!("signaling connection lost");
        let _ = self.events.send(TransportEvent::Closed);
        if !self.manually_closed.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let mut slot = self.reconnect.lock();
        if slot.is_some() || self.manually_closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(client) = self.this.upgrade() else {
            return;
        };
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(client.policy.delay).await;
            client.reconnect.lock().take();
            tracing::info!("attempting signaling reconnect");
            let _ = client.connect().await;
        }));
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = self.reconnect.lock().take() {
            handle.abort();
        }
    }
}

impl<C: Connector> SignalingChannel for SignalingClient<C> {
    fn is_open(&self) -> bool {
        matches!(*self.link.lock(), Link::Up(_))
    }

    fn send(&self, message: ClientMessage) {
        let sender = match &*self.link.lock() {
            Link::Up(sender) => sender.clone(),
            _ => {
                tracing::warn!(?message, "signaling channel not open, dropping message");
                return;
            }
        };
        match serde_json::to_string(&message) {
            Ok(text) => {
                if sender.send(text).is_err() {
                    tracing::warn!(?message, "signaling channel closing, dropped message");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize outbound message"),
        }
    }
}
