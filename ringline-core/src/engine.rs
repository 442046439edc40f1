//! Call state machine.
//!
//! One [`CallEngine`] drives one user's call session: command guards,
//! inbound signaling dispatch, offer/answer negotiation, candidate
//! buffering and teardown. At most one non-idle session exists at a
//! time; a second outgoing call is rejected, never queued.
//!
//! Every await point re-validates the current call id before mutating
//! state or sending, so continuations of a call that ended mid-flight
//! become no-ops instead of corrupting the next call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::events::{CallEvent, EventBus};
use crate::ice::IceConfigProvider;
use crate::media::{LocalMedia, MediaSource};
use crate::negotiation::{
    ActiveNegotiation, Negotiation, NegotiationPhase, PeerBackend, PeerEvent, PeerHandle,
    SessionDescription, SignalingState,
};
use crate::protocol::{CandidateInit, ClientMessage, SdpKind, ServerMessage};
use crate::transport::{SignalingChannel, TransportEvent};
use crate::types::{
    CallId, CallRole, CallSession, CallStatus, ErrorCode, MediaKind, PendingCall,
};

/// Cap on candidates buffered for a call with no negotiation yet
const MAX_EARLY_CANDIDATES: usize = 64;

struct EngineState {
    session: CallSession,
    pending_incoming: HashMap<CallId, PendingCall>,
    early_candidates: HashMap<CallId, Vec<CandidateInit>>,
    negotiation: Negotiation,
    local_media: Option<LocalMedia>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            session: CallSession::idle(),
            pending_incoming: HashMap::new(),
            early_candidates: HashMap::new(),
            negotiation: Negotiation::Idle,
            local_media: None,
        }
    }

    fn live(&self, call_id: &CallId) -> bool {
        self.session.matches(call_id) && self.session.status != CallStatus::Ended
    }

    fn take_teardown(&mut self) -> (Option<ActiveNegotiation>, Option<LocalMedia>) {
        if let Some(conn) = self.negotiation.active() {
            self.early_candidates.remove(&conn.call_id);
        }
        if let Some(call_id) = &self.session.call_id {
            self.early_candidates.remove(call_id);
        }
        (self.negotiation.take(), self.local_media.take())
    }
}

/// The call state machine for one user session
pub struct CallEngine {
    user_id: String,
    channel: Arc<dyn SignalingChannel>,
    backend: Arc<dyn PeerBackend>,
    media: Arc<dyn MediaSource>,
    ice: Arc<IceConfigProvider>,
    bus: EventBus,
    state: Arc<Mutex<EngineState>>,
}

impl CallEngine {
    /// Create an engine wired to the given collaborators
    pub fn new(
        user_id: impl Into<String>,
        channel: Arc<dyn SignalingChannel>,
        backend: Arc<dyn PeerBackend>,
        media: Arc<dyn MediaSource>,
        ice: Arc<IceConfigProvider>,
        bus: EventBus,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            channel,
            backend,
            media,
            ice,
            bus,
            state: Arc::new(Mutex::new(EngineState::new())),
        }
    }

    /// Subscribe to call events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CallEvent> {
        self.bus.subscribe()
    }

    /// Snapshot of the current session
    pub async fn session(&self) -> CallSession {
        self.state.lock().await.session.clone()
    }

    /// Observable negotiation phase
    pub async fn negotiation_phase(&self) -> NegotiationPhase {
        self.state.lock().await.negotiation.phase()
    }

    /// Look up a pending incoming call
    pub async fn pending_call(&self, call_id: &CallId) -> Option<PendingCall> {
        self.state.lock().await.pending_incoming.get(call_id).cloned()
    }

    fn guard_open(&self) -> bool {
        if self.channel.is_open() {
            true
        } else {
            self.bus
                .emit_error(ErrorCode::WsNotConnected, "signaling channel not connected");
            false
        }
    }

    async fn teardown(taken: Option<ActiveNegotiation>, media: Option<LocalMedia>) {
        if let Some(conn) = taken {
            let _ = conn.shutdown.send(true);
            conn.peer.close().await;
            tracing::debug!(call_id = %conn.call_id, "peer connection closed");
        }
        // local tracks release with their last reference; remote tracks
        // belong to the peer connection and are only dereferenced
        drop(media);
    }

    /// Place a call to `target_id`
    #[tracing::instrument(skip(self))]
    pub async fn start_call(
        &self,
        target_id: &str,
        media_kind: MediaKind,
        context_id: Option<String>,
    ) {
        if !self.guard_open() {
            return;
        }
        {
            let mut st = self.state.lock().await;
            if st.session.status != CallStatus::Idle {
                drop(st);
                self.bus
                    .emit_error(ErrorCode::AlreadyInCall, "a call is already in progress");
                return;
            }
            st.session = CallSession {
                call_id: None,
                peer_user_id: Some(target_id.to_string()),
                media_kind,
                role: Some(CallRole::Caller),
                context_id: context_id.clone(),
                status: CallStatus::Outgoing,
                error: None,
            };
        }
        tracing::info!(target_id, media = %media_kind, "inviting peer");
        self.channel.send(ClientMessage::Invite {
            target_id: target_id.to_string(),
            media_type: media_kind,
            context_id,
        });
    }

    /// Accept a pending incoming call.
    ///
    /// The peer connection and local media are armed before the answer
    /// is sent, so a fast remote offer finds them ready.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn accept_call(&self, call_id: &CallId) {
        if !self.guard_open() {
            return;
        }
        {
            let mut st = self.state.lock().await;
            if matches!(
                st.session.status,
                CallStatus::Outgoing | CallStatus::Active | CallStatus::Ended
            ) {
                drop(st);
                self.bus
                    .emit_error(ErrorCode::AlreadyInCall, "a call is already in progress");
                return;
            }
            let Some(pending) = st.pending_incoming.remove(call_id) else {
                drop(st);
                self.bus
                    .emit_error(ErrorCode::UnknownCall, "no incoming call with this id");
                return;
            };
            st.session = CallSession {
                call_id: Some(call_id.clone()),
                peer_user_id: Some(pending.from_user_id),
                media_kind: pending.media_kind,
                role: Some(CallRole::Callee),
                context_id: pending.context_id,
                status: CallStatus::Incoming,
                error: None,
            };
        }
        if self.ensure_negotiation(call_id).await.is_none() {
            return;
        }
        let live = self.state.lock().await.live(call_id);
        if !live {
            return;
        }
        tracing::info!(call_id = %call_id, "answering call");
        self.channel.send(ClientMessage::Accept {
            call_id: call_id.clone(),
        });
    }

    /// Reject a pending incoming call
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn reject_call(&self, call_id: &CallId, reason: Option<String>) {
        if !self.guard_open() {
            return;
        }
        let (taken, media) = {
            let mut st = self.state.lock().await;
            let was_pending = st.pending_incoming.remove(call_id).is_some();
            let was_session = st.live(call_id);
            if !was_pending && !was_session {
                drop(st);
                self.bus
                    .emit_error(ErrorCode::UnknownCall, "no incoming call with this id");
                return;
            }
            st.early_candidates.remove(call_id);
            if was_session {
                st.session.status = CallStatus::Ended;
                st.take_teardown()
            } else {
                (None, None)
            }
        };
        tracing::info!(call_id = %call_id, "rejecting call");
        self.channel.send(ClientMessage::Reject {
            call_id: call_id.clone(),
            reason: reason.clone(),
        });
        Self::teardown(taken, media).await;
        self.bus.emit(CallEvent::CallRejected {
            call_id: call_id.clone(),
            reason,
        });
    }

    /// Cancel an outgoing call before it is answered
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn cancel_call(&self, call_id: &CallId) {
        if !self.guard_open() {
            return;
        }
        let (taken, media) = {
            let mut st = self.state.lock().await;
            if !(st.session.matches(call_id) && st.session.status == CallStatus::Outgoing) {
                drop(st);
                self.bus
                    .emit_error(ErrorCode::UnknownCall, "no outgoing call with this id");
                return;
            }
            st.session.status = CallStatus::Ended;
            st.take_teardown()
        };
        tracing::info!(call_id = %call_id, "canceling call");
        self.channel.send(ClientMessage::Cancel {
            call_id: call_id.clone(),
        });
        Self::teardown(taken, media).await;
        self.bus.emit(CallEvent::CallCanceled {
            call_id: call_id.clone(),
            reason: None,
        });
    }

    /// End the active call
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self, reason: Option<String>) {
        let (call_id, taken, media) = {
            let mut st = self.state.lock().await;
            if st.session.status != CallStatus::Active {
                drop(st);
                self.bus
                    .emit_error(ErrorCode::NoActiveCall, "no active call to end");
                return;
            }
            st.session.status = CallStatus::Ended;
            let call_id = st.session.call_id.clone();
            let (taken, media) = st.take_teardown();
            (call_id, taken, media)
        };
        tracing::info!(call_id = ?call_id, "ending call");
        if let Some(id) = &call_id {
            self.channel.send(ClientMessage::End {
                call_id: id.clone(),
                reason: reason.clone(),
            });
        }
        Self::teardown(taken, media).await;
        self.bus.emit(CallEvent::CallEnded {
            call_id,
            reason,
            by_user_id: Some(self.user_id.clone()),
        });
    }

    /// Send a keepalive; silently skipped when the channel is closed
    pub async fn heartbeat(&self) {
        if !self.channel.is_open() {
            tracing::trace!("heartbeat skipped, channel closed");
            return;
        }
        let call_id = self.state.lock().await.session.call_id.clone();
        self.channel.send(ClientMessage::Heartbeat { call_id });
    }

    /// Return an ended session to idle
    pub async fn reset(&self) {
        let mut st = self.state.lock().await;
        if st.session.status == CallStatus::Ended {
            st.session = CallSession::idle();
            tracing::debug!("session reset to idle");
        } else {
            tracing::debug!(status = ?st.session.status, "reset ignored");
        }
    }

    /// Feed one transport event into the engine
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => tracing::debug!("signaling channel opened"),
            TransportEvent::Message(message) => self.handle_signal(message).await,
            TransportEvent::Malformed => self
                .bus
                .emit_error(ErrorCode::InvalidJson, "malformed signaling payload"),
            TransportEvent::Closed => self.handle_channel_closed().await,
        }
    }

    /// Forced cleanup after the signaling channel closed: any non-idle
    /// call ends with reason `connection_lost` and pending invites are
    /// dropped (the server re-delivers whatever is still ringing).
    async fn handle_channel_closed(&self) {
        let (taken, media, ended_call) = {
            let mut st = self.state.lock().await;
            st.pending_incoming.clear();
            st.early_candidates.clear();
            let (taken, media) = st.take_teardown();
            if matches!(st.session.status, CallStatus::Idle | CallStatus::Ended) {
                (taken, media, None)
            } else {
                st.session.status = CallStatus::Ended;
                st.session.error = Some("connection_lost".to_string());
                (taken, media, Some(st.session.call_id.clone()))
            }
        };
        Self::teardown(taken, media).await;
        if let Some(call_id) = ended_call {
            tracing::warn!(call_id = ?call_id, "call ended by connection loss");
            self.bus.emit(CallEvent::CallEnded {
                call_id,
                reason: Some("connection_lost".to_string()),
                by_user_id: None,
            });
        }
    }

    /// Dispatch one inbound signaling message
    pub async fn handle_signal(&self, message: ServerMessage) {
        match message {
            ServerMessage::Init {
                state,
                active_call_id,
            } => {
                tracing::debug!(?state, ?active_call_id, "session initialized by server");
                self.bus.emit(CallEvent::CallInit {
                    state,
                    active_call_id,
                });
            }
            ServerMessage::Incoming {
                call_id,
                from_user_id,
                media_type,
                context_id,
            } => self.on_incoming(call_id, from_user_id, media_type, context_id).await,
            ServerMessage::InviteAck {
                call_id,
                target_id,
                media_type,
            } => self.on_invite_ack(call_id, target_id, media_type).await,
            ServerMessage::Accepted { call_id, media_type } => {
                self.on_accepted(call_id, media_type).await;
            }
            ServerMessage::AnswerAck { call_id } => self.on_answer_ack(call_id).await,
            ServerMessage::RejectAck { call_id, status } => {
                tracing::debug!(call_id = %call_id, ?status, "reject acknowledged");
            }
            ServerMessage::Rejected { call_id, reason } => {
                self.finish_from_remote(&call_id, reason.clone()).await;
                self.bus.emit(CallEvent::CallRejected { call_id, reason });
            }
            ServerMessage::CancelAck { call_id } => {
                tracing::debug!(call_id = %call_id, "cancel acknowledged");
            }
            ServerMessage::Canceled { call_id, reason } => {
                {
                    self.state.lock().await.pending_incoming.remove(&call_id);
                }
                self.finish_from_remote(&call_id, reason.clone()).await;
                self.bus.emit(CallEvent::CallCanceled { call_id, reason });
            }
            ServerMessage::Ended {
                call_id,
                reason,
                by_user_id,
            } => {
                self.finish_from_remote(&call_id, reason.clone()).await;
                self.bus.emit(CallEvent::CallEnded {
                    call_id: Some(call_id),
                    reason,
                    by_user_id,
                });
            }
            ServerMessage::EndAck { call_id } => {
                tracing::debug!(call_id = %call_id, "end acknowledged");
            }
            ServerMessage::HeartbeatAck { call_id } => {
                self.bus.emit(CallEvent::HeartbeatAck { call_id });
            }
            ServerMessage::Error { code, message } => {
                let text = match (code, message) {
                    (Some(code), Some(message)) => format!("{code}: {message}"),
                    (Some(code), None) => code,
                    (None, Some(message)) => message,
                    (None, None) => "unknown call error".to_string(),
                };
                self.bus.emit_error(ErrorCode::CallError, text);
            }
            ServerMessage::Offer {
                call_id,
                sdp,
                sdp_type,
            } => self.on_remote_offer(call_id, sdp, sdp_type).await,
            ServerMessage::Answer {
                call_id,
                sdp,
                sdp_type,
            } => self.on_remote_answer(call_id, sdp, sdp_type).await,
            ServerMessage::Candidate {
                call_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.on_remote_candidate(
                    call_id,
                    CandidateInit {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                    },
                )
                .await;
            }
        }
    }

    async fn on_incoming(
        &self,
        call_id: CallId,
        from_user_id: String,
        media_kind: MediaKind,
        context_id: Option<String>,
    ) {
        {
            let mut st = self.state.lock().await;
            st.pending_incoming.insert(
                call_id.clone(),
                PendingCall {
                    from_user_id: from_user_id.clone(),
                    media_kind,
                    context_id: context_id.clone(),
                },
            );
            if st.session.status == CallStatus::Idle {
                st.session = CallSession {
                    call_id: Some(call_id.clone()),
                    peer_user_id: Some(from_user_id.clone()),
                    media_kind,
                    role: Some(CallRole::Callee),
                    context_id: context_id.clone(),
                    status: CallStatus::Incoming,
                    error: None,
                };
            }
        }
        tracing::info!(call_id = %call_id, from_user_id, "incoming call");
        self.bus.emit(CallEvent::IncomingCall {
            call_id,
            from_user_id,
            media_kind,
            context_id,
        });
    }

    async fn on_invite_ack(
        &self,
        call_id: CallId,
        target_id: Option<String>,
        media_type: Option<MediaKind>,
    ) {
        let (to_user_id, media_kind) = {
            let mut st = self.state.lock().await;
            if !(st.session.status == CallStatus::Outgoing && st.session.call_id.is_none()) {
                tracing::debug!(call_id = %call_id, "stale invite ack ignored");
                return;
            }
            st.session.call_id = Some(call_id.clone());
            if let Some(media) = media_type {
                st.session.media_kind = media;
            }
            let to = target_id
                .or_else(|| st.session.peer_user_id.clone())
                .unwrap_or_default();
            (to, st.session.media_kind)
        };
        tracing::info!(call_id = %call_id, to_user_id, "outgoing call ringing");
        self.bus.emit(CallEvent::OutgoingCallStarted {
            call_id: call_id.clone(),
            to_user_id,
            media_kind,
        });
        self.bus.emit(CallEvent::CallRinging {
            call_id,
            role: CallRole::Caller,
        });
    }

    async fn on_accepted(&self, call_id: CallId, media_type: Option<MediaKind>) {
        let (role, media_kind) = {
            let mut st = self.state.lock().await;
            if !st.live(&call_id) {
                tracing::debug!(call_id = %call_id, "stale accept ignored");
                return;
            }
            // the server echo must not override a local downgrade
            if st.local_media.is_none() {
                if let Some(media) = media_type {
                    st.session.media_kind = media;
                }
            }
            st.session.status = CallStatus::Active;
            (st.session.role, st.session.media_kind)
        };
        tracing::info!(call_id = %call_id, "call accepted");
        self.bus.emit(CallEvent::CallActive {
            call_id: call_id.clone(),
            media_kind,
        });
        match role {
            Some(CallRole::Caller) => self.negotiate_offer(&call_id).await,
            Some(CallRole::Callee) => self.bus.emit(CallEvent::CallRinging {
                call_id,
                role: CallRole::Callee,
            }),
            None => tracing::warn!(call_id = %call_id, "accepted call with no role"),
        }
    }

    async fn on_answer_ack(&self, call_id: CallId) {
        let media_kind = {
            let mut st = self.state.lock().await;
            if !(st.session.matches(&call_id) && st.session.status == CallStatus::Incoming) {
                tracing::debug!(call_id = %call_id, "stale answer ack ignored");
                return;
            }
            st.session.status = CallStatus::Active;
            st.session.media_kind
        };
        tracing::info!(call_id = %call_id, "call active");
        self.bus.emit(CallEvent::CallActive { call_id, media_kind });
    }

    /// Tear down the session when the remote side finished the call.
    /// The event itself is emitted by the caller, matching or not.
    /// Candidates buffered for the finished call are dropped even when
    /// it never became the session.
    async fn finish_from_remote(&self, call_id: &CallId, reason: Option<String>) {
        let (taken, media) = {
            let mut st = self.state.lock().await;
            st.early_candidates.remove(call_id);
            if !st.live(call_id) {
                return;
            }
            st.session.status = CallStatus::Ended;
            st.session.error = reason;
            st.take_teardown()
        };
        Self::teardown(taken, media).await;
    }

    async fn on_remote_offer(&self, call_id: CallId, sdp: String, sdp_type: SdpKind) {
        if sdp_type != SdpKind::Offer {
            tracing::warn!(call_id = %call_id, "offer message with non-offer sdp_type ignored");
            return;
        }
        let live = self.state.lock().await.live(&call_id);
        if !live {
            tracing::warn!(call_id = %call_id, "remote offer for unknown call ignored");
            return;
        }
        let Some(peer) = self.ensure_negotiation(&call_id).await else {
            return;
        };
        if peer.signaling_state() != SignalingState::Stable {
            tracing::warn!(call_id = %call_id, state = ?peer.signaling_state(), "remote offer ignored outside stable");
            return;
        }
        if let Err(e) = peer
            .apply_remote_description(SessionDescription {
                kind: SdpKind::Offer,
                sdp,
            })
            .await
        {
            self.abort_call(
                &call_id,
                ErrorCode::CallError,
                format!("failed to apply remote offer: {e}"),
            )
            .await;
            return;
        }
        self.flush_candidates(&call_id, peer.as_ref()).await;
        if peer.signaling_state() != SignalingState::HaveRemoteOffer {
            tracing::warn!(call_id = %call_id, "negotiation state changed before answer, skipping");
            return;
        }
        match peer.create_answer().await {
            Ok(answer) => {
                let live = self.state.lock().await.live(&call_id);
                if live {
                    tracing::debug!(call_id = %call_id, "sending answer");
                    self.channel.send(ClientMessage::Answer {
                        call_id,
                        sdp: answer.sdp,
                        sdp_type: SdpKind::Answer,
                    });
                }
            }
            Err(e) => {
                self.abort_call(
                    &call_id,
                    ErrorCode::CallError,
                    format!("failed to create answer: {e}"),
                )
                .await;
            }
        }
    }

    async fn on_remote_answer(&self, call_id: CallId, sdp: String, sdp_type: SdpKind) {
        if sdp_type != SdpKind::Answer {
            tracing::warn!(call_id = %call_id, "answer message with non-answer sdp_type ignored");
            return;
        }
        let peer = {
            let st = self.state.lock().await;
            if st.session.role != Some(CallRole::Caller) {
                tracing::debug!(call_id = %call_id, "answer ignored, not the caller");
                return;
            }
            match st.negotiation.active() {
                Some(conn) if conn.call_id == call_id => Arc::clone(&conn.peer),
                _ => {
                    tracing::debug!(call_id = %call_id, "answer with no matching negotiation");
                    return;
                }
            }
        };
        match peer.signaling_state() {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemotePranswer => {}
            SignalingState::Stable | SignalingState::Closed => {
                tracing::debug!(call_id = %call_id, "duplicate or late answer ignored");
                return;
            }
            state => {
                tracing::warn!(call_id = %call_id, ?state, "answer ignored in unexpected state");
                return;
            }
        }
        if let Err(e) = peer
            .apply_remote_description(SessionDescription {
                kind: SdpKind::Answer,
                sdp,
            })
            .await
        {
            self.abort_call(
                &call_id,
                ErrorCode::CallError,
                format!("failed to apply remote answer: {e}"),
            )
            .await;
            return;
        }
        self.flush_candidates(&call_id, peer.as_ref()).await;
    }

    async fn on_remote_candidate(&self, call_id: CallId, candidate: CandidateInit) {
        if candidate.candidate.is_empty() {
            // end-of-candidates marker
            return;
        }
        let peer = {
            let mut st = self.state.lock().await;
            match &mut st.negotiation {
                Negotiation::Negotiating { conn, pending } if conn.call_id == call_id => {
                    tracing::trace!(call_id = %call_id, "buffering remote candidate");
                    pending.push(candidate);
                    return;
                }
                Negotiation::Connected { conn } if conn.call_id == call_id => {
                    Arc::clone(&conn.peer)
                }
                _ => {
                    let slot = st.early_candidates.entry(call_id.clone()).or_default();
                    if slot.len() >= MAX_EARLY_CANDIDATES {
                        tracing::warn!(call_id = %call_id, "early candidate buffer full, dropping");
                    } else {
                        tracing::trace!(call_id = %call_id, "holding candidate until negotiation starts");
                        slot.push(candidate);
                    }
                    return;
                }
            }
        };
        if let Err(e) = peer.add_remote_candidate(candidate).await {
            tracing::warn!(call_id = %call_id, error = %e, "remote candidate rejected");
        }
    }

    /// Mark the remote description applied and drain the buffer in
    /// arrival order. Candidates arriving from here on apply directly.
    async fn flush_candidates(&self, call_id: &CallId, peer: &dyn PeerHandle) {
        let pending = {
            self.state
                .lock()
                .await
                .negotiation
                .remote_description_applied(call_id)
        };
        let Some(pending) = pending else { return };
        tracing::debug!(call_id = %call_id, buffered = pending.len(), "flushing buffered candidates");
        for candidate in pending {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                tracing::warn!(call_id = %call_id, error = %e, "buffered candidate rejected");
            }
        }
    }

    /// Get or create the peer connection for `call_id`, acquiring local
    /// media first. A video acquisition failure retries audio-only and
    /// downgrades the session; a total failure aborts the call with
    /// `media_error`.
    async fn ensure_negotiation(&self, call_id: &CallId) -> Option<Arc<dyn PeerHandle>> {
        let requested = {
            let st = self.state.lock().await;
            if let Some(conn) = st.negotiation.active() {
                if conn.call_id == *call_id {
                    return Some(Arc::clone(&conn.peer));
                }
                tracing::warn!(
                    call_id = %call_id,
                    bound = %conn.call_id,
                    "negotiation already bound to another call"
                );
                return None;
            }
            if !st.live(call_id) {
                tracing::debug!(call_id = %call_id, "negotiation skipped for finished call");
                return None;
            }
            st.session.media_kind
        };

        let config = self.ice.config().await;
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = match self.backend.create_peer(&config, peer_tx).await {
            Ok(peer) => peer,
            Err(e) => {
                self.abort_call(
                    call_id,
                    ErrorCode::CallError,
                    format!("peer connection setup failed: {e}"),
                )
                .await;
                return None;
            }
        };

        let media = match self.media.acquire(requested).await {
            Ok(media) => media,
            Err(first) if requested.has_video() => {
                tracing::warn!(call_id = %call_id, error = %first, "video acquisition failed, retrying audio-only");
                match self.media.acquire(MediaKind::Audio).await {
                    Ok(media) => media,
                    Err(e) => {
                        peer.close().await;
                        self.abort_call(
                            call_id,
                            ErrorCode::MediaError,
                            format!("unable to acquire local media: {e}"),
                        )
                        .await;
                        return None;
                    }
                }
            }
            Err(e) => {
                peer.close().await;
                self.abort_call(
                    call_id,
                    ErrorCode::MediaError,
                    format!("unable to acquire local media: {e}"),
                )
                .await;
                return None;
            }
        };

        if let Err(e) = peer.attach_media(&media).await {
            peer.close().await;
            self.abort_call(
                call_id,
                ErrorCode::CallError,
                format!("failed to attach local media: {e}"),
            )
            .await;
            return None;
        }

        let effective = media.kind;
        let mut media = Some(media);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stale = {
            let mut st = self.state.lock().await;
            if st.live(call_id) {
                st.session.media_kind = effective;
                let pending = st.early_candidates.remove(call_id).unwrap_or_default();
                st.negotiation = Negotiation::Negotiating {
                    conn: ActiveNegotiation {
                        call_id: call_id.clone(),
                        peer: Arc::clone(&peer),
                        shutdown: shutdown_tx,
                    },
                    pending,
                };
                st.local_media = media.take();
                false
            } else {
                true
            }
        };
        if stale {
            peer.close().await;
            tracing::debug!(call_id = %call_id, "call finished during negotiation setup");
            return None;
        }

        self.bus.emit(CallEvent::LocalStreamReady {
            call_id: call_id.clone(),
            media_kind: effective,
        });
        tokio::spawn(Self::pump_peer_events(
            Arc::clone(&self.state),
            Arc::clone(&self.channel),
            self.bus.clone(),
            call_id.clone(),
            peer_rx,
            shutdown_rx,
        ));
        Some(peer)
    }

    /// Caller side: create an offer and relay it to the peer
    async fn negotiate_offer(&self, call_id: &CallId) {
        let Some(peer) = self.ensure_negotiation(call_id).await else {
            return;
        };
        if peer.signaling_state() != SignalingState::Stable {
            tracing::debug!(call_id = %call_id, "offer skipped, negotiation already underway");
            return;
        }
        match peer.create_offer().await {
            Ok(offer) => {
                let live = self.state.lock().await.live(call_id);
                if live {
                    tracing::debug!(call_id = %call_id, "sending offer");
                    self.channel.send(ClientMessage::Offer {
                        call_id: call_id.clone(),
                        sdp: offer.sdp,
                        sdp_type: SdpKind::Offer,
                    });
                }
            }
            Err(e) => {
                self.abort_call(
                    call_id,
                    ErrorCode::CallError,
                    format!("failed to create offer: {e}"),
                )
                .await;
            }
        }
    }

    /// Abort the call after a negotiation or media fault: error event,
    /// teardown, hangup notice to the server, terminal call-ended event.
    async fn abort_call(&self, call_id: &CallId, code: ErrorCode, message: String) {
        self.bus.emit_error(code, message.clone());
        let (taken, media, was_session) = {
            let mut st = self.state.lock().await;
            if st.live(call_id) {
                st.session.status = CallStatus::Ended;
                st.session.error = Some(message);
                let (taken, media) = st.take_teardown();
                (taken, media, true)
            } else {
                (None, None, false)
            }
        };
        Self::teardown(taken, media).await;
        if was_session {
            self.channel.send(ClientMessage::End {
                call_id: call_id.clone(),
                reason: Some(code.as_str().to_string()),
            });
            self.bus.emit(CallEvent::CallEnded {
                call_id: Some(call_id.clone()),
                reason: Some(code.as_str().to_string()),
                by_user_id: Some(self.user_id.clone()),
            });
        }
    }

    /// Forward peer-connection events for one call until teardown
    async fn pump_peer_events(
        state: Arc<Mutex<EngineState>>,
        channel: Arc<dyn SignalingChannel>,
        bus: EventBus,
        call_id: CallId,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        None => break,
                        Some(PeerEvent::LocalCandidate(candidate)) => {
                            let live = {
                                let st = state.lock().await;
                                st.negotiation
                                    .active()
                                    .is_some_and(|conn| conn.call_id == call_id)
                            };
                            if live {
                                channel.send(ClientMessage::Candidate {
                                    call_id: call_id.clone(),
                                    candidate: candidate.candidate,
                                    sdp_mid: candidate.sdp_mid,
                                    sdp_mline_index: candidate.sdp_mline_index,
                                });
                            }
                        }
                        Some(PeerEvent::RemoteTrack(media)) => {
                            let live = state.lock().await.live(&call_id);
                            if live {
                                bus.emit(CallEvent::RemoteStreamReady {
                                    call_id: call_id.clone(),
                                    media,
                                });
                            }
                        }
                    }
                }
            }
        }
        tracing::trace!(call_id = %call_id, "peer event pump stopped");
    }
}
