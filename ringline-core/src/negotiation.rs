//! Peer connection negotiation.
//!
//! The negotiation lifecycle is a typed state: candidates received from
//! the peer can only be buffered while the remote description is not yet
//! applied (`Negotiating`); once it is (`Connected`) they are applied
//! immediately. Re-buffering after the flush is unrepresentable.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::ice::{IceTransportPolicy, RtcConfig};
use crate::media::LocalMedia;
use crate::protocol::{CandidateInit, SdpKind};
use crate::types::{CallId, MediaKind, RemoteMedia};

/// Errors from peer connection negotiation
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The peer connection could not be constructed
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    /// A session description could not be created or applied
    #[error("session description failed: {0}")]
    Sdp(String),
    /// A remote candidate could not be applied
    #[error("ice candidate failed: {0}")]
    Candidate(String),
}

/// A local or remote session description
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// The SDP text
    pub sdp: String,
}

/// Signaling state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No offer outstanding
    Stable,
    /// A local offer has been applied
    HaveLocalOffer,
    /// A remote offer has been applied
    HaveRemoteOffer,
    /// A local provisional answer has been applied
    HaveLocalPranswer,
    /// A remote provisional answer has been applied
    HaveRemotePranswer,
    /// The connection is closed
    Closed,
}

/// Events pushed by the peer connection backend
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and should be trickled
    LocalCandidate(CandidateInit),
    /// A remote media track arrived
    RemoteTrack(RemoteMedia),
}

/// One live peer connection behind a trait seam so the engine can be
/// tested without network or media stacks.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Attach local media tracks
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Setup`] when a track cannot be added.
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError>;

    /// Create an offer and apply it as the local description
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Sdp`] on failure.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer and apply it as the local description
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Sdp`] on failure.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a remote description
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Sdp`] when the description is invalid
    /// or cannot be applied in the current state.
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Candidate`] on failure.
    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), NegotiationError>;

    /// Current signaling state
    fn signaling_state(&self) -> SignalingState;

    /// Detach handlers and close the connection
    async fn close(&self);
}

/// Factory for peer connections
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Create a peer connection configured with the given ICE servers.
    ///
    /// Local candidates and remote tracks are pushed through `events`.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Setup`] on failure.
    async fn create_peer(
        &self,
        config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, NegotiationError>;
}

/// The negotiation bound to the current call
pub struct ActiveNegotiation {
    /// Call the peer connection belongs to
    pub call_id: CallId,
    /// The live peer connection
    pub peer: Arc<dyn PeerHandle>,
    /// Stops the peer-event forwarding task on teardown
    pub shutdown: watch::Sender<bool>,
}

/// Negotiation lifecycle for the current call
pub enum Negotiation {
    /// No peer connection exists
    Idle,
    /// Peer connection exists, remote description not yet applied;
    /// remote candidates are buffered here in arrival order
    Negotiating {
        /// The live negotiation
        conn: ActiveNegotiation,
        /// Candidates waiting for the remote description
        pending: Vec<CandidateInit>,
    },
    /// Remote description applied; candidates apply immediately
    Connected {
        /// The live negotiation
        conn: ActiveNegotiation,
    },
}

/// Observable phase of a [`Negotiation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// No peer connection
    Idle,
    /// Waiting for the remote description
    Negotiating,
    /// Remote description applied
    Connected,
}

impl Negotiation {
    /// The live negotiation, if any
    pub fn active(&self) -> Option<&ActiveNegotiation> {
        match self {
            Self::Idle => None,
            Self::Negotiating { conn, .. } | Self::Connected { conn } => Some(conn),
        }
    }

    /// Observable phase
    pub fn phase(&self) -> NegotiationPhase {
        match self {
            Self::Idle => NegotiationPhase::Idle,
            Self::Negotiating { .. } => NegotiationPhase::Negotiating,
            Self::Connected { .. } => NegotiationPhase::Connected,
        }
    }

    /// Tear out the live negotiation, dropping any buffered candidates
    pub fn take(&mut self) -> Option<ActiveNegotiation> {
        match std::mem::replace(self, Self::Idle) {
            Self::Idle => None,
            Self::Negotiating { conn, .. } | Self::Connected { conn } => Some(conn),
        }
    }

    /// Mark the remote description applied for `call_id`, returning the
    /// buffered candidates in arrival order. `None` when no negotiation
    /// for that call was waiting.
    pub fn remote_description_applied(&mut self, call_id: &CallId) -> Option<Vec<CandidateInit>> {
        match std::mem::replace(self, Self::Idle) {
            Self::Negotiating { conn, pending } if conn.call_id == *call_id => {
                *self = Self::Connected { conn };
                Some(pending)
            }
            other => {
                *self = other;
                None
            }
        }
    }
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Negotiation::Idle"),
            Self::Negotiating { conn, pending } => write!(
                f,
                "Negotiation::Negotiating(call_id={}, pending={})",
                conn.call_id,
                pending.len()
            ),
            Self::Connected { conn } => {
                write!(f, "Negotiation::Connected(call_id={})", conn.call_id)
            }
        }
    }
}

/// [`PeerBackend`] implementation on the webrtc crate
#[derive(Debug, Default)]
pub struct RtcBackend;

#[async_trait]
impl PeerBackend for RtcBackend {
    async fn create_peer(
        &self,
        config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ice_transport_policy: match config.transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| NegotiationError::Setup(e.to_string()))?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let mime_type = track.codec().capability.mime_type;
                let kind = if mime_type.to_lowercase().starts_with("video") {
                    MediaKind::Video
                } else {
                    MediaKind::Audio
                };
                let _ = track_events.send(PeerEvent::RemoteTrack(RemoteMedia {
                    track_id: track.id(),
                    kind,
                    mime_type,
                }));
                Box::pin(async {})
            },
        ));

        pc.on_peer_connection_state_change(Box::new(|state| {
            tracing::debug!(%state, "peer connection state changed");
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerHandle { pc }))
    }
}

struct RtcPeerHandle {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerHandle for RtcPeerHandle {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        for track in &media.tracks {
            self.pc
                .add_track(Arc::clone(track))
                .await
                .map_err(|e| NegotiationError::Setup(e.to_string()))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| NegotiationError::Sdp(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            _ => SignalingState::Closed,
        }
    }

    async fn close(&self) {
        // detach handlers so no events fire into a torn-down call
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "peer connection close failed");
        }
    }
}
