//! Call service: per-session wiring of transport, engine and pumps.
//!
//! Each user session builds its own [`CallService`]; there is no global
//! singleton. Dropping the service drops the transport, which stops the
//! event pump.

use std::sync::Arc;

use tokio::sync::broadcast;
use url::Url;

use crate::engine::CallEngine;
use crate::events::{CallEvent, EventBus};
use crate::ice::{IceConfigProvider, IceEndpoint, RtcConfig};
use crate::media::{MediaSource, SampleMediaSource};
use crate::negotiation::{PeerBackend, RtcBackend};
use crate::transport::{
    Connector, ReconnectPolicy, SignalingClient, TransportError, WsConnector,
};
use crate::types::{CallId, CallSession, ErrorCode, MediaKind};

/// A user's call session: signaling connection plus call engine
pub struct CallService<C: Connector> {
    engine: Arc<CallEngine>,
    transport: Arc<SignalingClient<C>>,
    bus: EventBus,
}

impl<C: Connector> CallService<C> {
    /// Start building a service for `user_id` against `server_url`
    pub fn builder(
        user_id: impl Into<String>,
        token: impl Into<String>,
        server_url: Url,
    ) -> CallServiceBuilder<WsConnector> {
        CallServiceBuilder::new(user_id, token, server_url)
    }

    /// Connect to the signaling server.
    ///
    /// A missing token surfaces as an `unauthorized` error event and
    /// the typed error; a failed dial arms the reconnect timer.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the connection cannot be opened.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), TransportError> {
        match self.transport.connect().await {
            Err(TransportError::MissingToken) => {
                self.bus.emit_error(
                    ErrorCode::Unauthorized,
                    "no identity token for signaling connection",
                );
                Err(TransportError::MissingToken)
            }
            other => other,
        }
    }

    /// Close the connection and suppress reconnection
    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Replace the identity token used for future connections
    pub fn set_token(&self, token: impl Into<String>) {
        self.transport.set_token(token);
    }

    /// Place a call
    pub async fn start_call(
        &self,
        target_id: &str,
        media_kind: MediaKind,
        context_id: Option<String>,
    ) {
        self.engine.start_call(target_id, media_kind, context_id).await;
    }

    /// Accept a pending incoming call
    pub async fn accept_call(&self, call_id: &CallId) {
        self.engine.accept_call(call_id).await;
    }

    /// Reject a pending incoming call
    pub async fn reject_call(&self, call_id: &CallId, reason: Option<String>) {
        self.engine.reject_call(call_id, reason).await;
    }

    /// Cancel an outgoing call before it is answered
    pub async fn cancel_call(&self, call_id: &CallId) {
        self.engine.cancel_call(call_id).await;
    }

    /// End the active call
    pub async fn end_call(&self, reason: Option<String>) {
        self.engine.end_call(reason).await;
    }

    /// Send a keepalive
    pub async fn heartbeat(&self) {
        self.engine.heartbeat().await;
    }

    /// Return an ended session to idle
    pub async fn reset(&self) {
        self.engine.reset().await;
    }

    /// Subscribe to call events
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.engine.subscribe()
    }

    /// Snapshot of the current session
    pub async fn session(&self) -> CallSession {
        self.engine.session().await
    }
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder<C: Connector> {
    user_id: String,
    token: String,
    server_url: Url,
    connector: C,
    policy: ReconnectPolicy,
    backend: Arc<dyn PeerBackend>,
    media: Arc<dyn MediaSource>,
    ice: Arc<IceConfigProvider>,
}

impl CallServiceBuilder<WsConnector> {
    /// Builder with the WebSocket connector and production defaults
    pub fn new(user_id: impl Into<String>, token: impl Into<String>, server_url: Url) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
            server_url,
            connector: WsConnector,
            policy: ReconnectPolicy::default(),
            backend: Arc::new(RtcBackend),
            media: Arc::new(SampleMediaSource),
            ice: Arc::new(IceConfigProvider::fixed(RtcConfig::fallback())),
        }
    }
}

impl<C: Connector> CallServiceBuilder<C> {
    /// Swap the transport connector (tests use an in-memory one)
    pub fn with_connector<D: Connector>(self, connector: D) -> CallServiceBuilder<D> {
        CallServiceBuilder {
            user_id: self.user_id,
            token: self.token,
            server_url: self.server_url,
            connector,
            policy: self.policy,
            backend: self.backend,
            media: self.media,
            ice: self.ice,
        }
    }

    /// Override the reconnect policy
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the peer connection backend
    pub fn with_backend(mut self, backend: Arc<dyn PeerBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Override the local media source
    pub fn with_media_source(mut self, media: Arc<dyn MediaSource>) -> Self {
        self.media = media;
        self
    }

    /// Fetch ICE servers from a credential endpoint
    pub fn with_ice_endpoint(mut self, endpoint: Arc<dyn IceEndpoint>) -> Self {
        self.ice = Arc::new(IceConfigProvider::new(endpoint));
        self
    }

    /// Use a fixed ICE configuration
    pub fn with_rtc_config(mut self, config: RtcConfig) -> Self {
        self.ice = Arc::new(IceConfigProvider::fixed(config));
        self
    }

    /// Wire everything together and spawn the event pump
    pub fn build(self) -> CallService<C> {
        let (transport, mut transport_events) = SignalingClient::new(
            self.connector,
            self.server_url,
            self.token,
            self.policy,
        );
        let channel: Arc<dyn crate::transport::SignalingChannel> = transport.clone();
        let bus = EventBus::new();
        let engine = Arc::new(CallEngine::new(
            self.user_id,
            channel,
            self.backend,
            self.media,
            self.ice,
            bus.clone(),
        ));

        let pump_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                pump_engine.handle_transport_event(event).await;
            }
            tracing::debug!("transport event pump stopped");
        });

        CallService {
            engine,
            transport,
            bus,
        }
    }
}
