//! Shared mocks for engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use ringline_core::engine::CallEngine;
use ringline_core::events::{CallEvent, EventBus};
use ringline_core::ice::{IceConfigProvider, RtcConfig};
use ringline_core::media::{LocalMedia, MediaError, MediaSource};
use ringline_core::negotiation::{
    NegotiationError, PeerBackend, PeerEvent, PeerHandle, SessionDescription, SignalingState,
};
use ringline_core::protocol::{CandidateInit, ClientMessage, SdpKind};
use ringline_core::transport::SignalingChannel;
use ringline_core::types::MediaKind;

/// Records outbound messages instead of sending them
pub struct MockChannel {
    open: AtomicBool,
    sent: parking_lot::Mutex<Vec<ClientMessage>>,
}

impl MockChannel {
    pub fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(open),
            sent: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }
}

impl SignalingChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, message: ClientMessage) {
        if self.is_open() {
            self.sent.lock().push(message);
        }
    }
}

/// Scripted peer connection recording what the engine does to it
pub struct MockPeer {
    state: parking_lot::Mutex<SignalingState>,
    pub applied_remote: parking_lot::Mutex<Vec<SessionDescription>>,
    pub candidates: parking_lot::Mutex<Vec<CandidateInit>>,
    pub attached: AtomicBool,
    pub closed: AtomicBool,
    pub fail_offer: AtomicBool,
}

impl MockPeer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(SignalingState::Stable),
            applied_remote: parking_lot::Mutex::new(Vec::new()),
            candidates: parking_lot::Mutex::new(Vec::new()),
            attached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_offer: AtomicBool::new(false),
        })
    }

    pub fn candidate_lines(&self) -> Vec<String> {
        self.candidates
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerHandle for MockPeer {
    async fn attach_media(&self, _media: &LocalMedia) -> Result<(), NegotiationError> {
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(NegotiationError::Sdp("scripted offer failure".into()));
        }
        *self.state.lock() = SignalingState::HaveLocalOffer;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 mock-offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        *self.state.lock() = SignalingState::Stable;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 mock-answer".into(),
        })
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        *self.state.lock() = match description.kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            SdpKind::Answer => SignalingState::Stable,
        };
        self.applied_remote.lock().push(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), NegotiationError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        if self.closed.load(Ordering::SeqCst) {
            SignalingState::Closed
        } else {
            *self.state.lock()
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Backend handing out [`MockPeer`]s and keeping their event senders
pub struct MockBackend {
    pub peers: parking_lot::Mutex<Vec<Arc<MockPeer>>>,
    pub event_senders: parking_lot::Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    pub fail: AtomicBool,
    pub fail_offer: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: parking_lot::Mutex::new(Vec::new()),
            event_senders: parking_lot::Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            fail_offer: AtomicBool::new(false),
        })
    }

    pub fn last_peer(&self) -> Arc<MockPeer> {
        self.peers.lock().last().cloned().expect("no peer created")
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_events(&self) -> mpsc::UnboundedSender<PeerEvent> {
        self.event_senders
            .lock()
            .last()
            .cloned()
            .expect("no peer created")
    }
}

#[async_trait]
impl PeerBackend for MockBackend {
    async fn create_peer(
        &self,
        _config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, NegotiationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NegotiationError::Setup("scripted backend failure".into()));
        }
        let peer = MockPeer::new();
        if self.fail_offer.load(Ordering::SeqCst) {
            peer.fail_offer.store(true, Ordering::SeqCst);
        }
        self.peers.lock().push(Arc::clone(&peer));
        self.event_senders.lock().push(events);
        Ok(peer)
    }
}

/// Media source with scriptable failures and an optional hold point
pub struct MockMedia {
    pub fail_video: AtomicBool,
    pub fail_all: AtomicBool,
    hold: AtomicBool,
    released: tokio::sync::Notify,
    pub acquired: parking_lot::Mutex<Vec<MediaKind>>,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_video: AtomicBool::new(false),
            fail_all: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            released: tokio::sync::Notify::new(),
            acquired: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Make the next acquisition block until [`release`](Self::release)
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        self.acquired.lock().push(kind);
        if self.hold.load(Ordering::SeqCst) {
            self.released.notified().await;
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(MediaError::Acquisition("scripted total failure".into()));
        }
        if kind == MediaKind::Video && self.fail_video.load(Ordering::SeqCst) {
            return Err(MediaError::Acquisition("scripted camera failure".into()));
        }
        Ok(LocalMedia {
            kind,
            tracks: Vec::new(),
        })
    }
}

/// An engine wired to mocks, plus handles to drive and observe it
pub struct Harness {
    pub engine: Arc<CallEngine>,
    pub channel: Arc<MockChannel>,
    pub backend: Arc<MockBackend>,
    pub media: Arc<MockMedia>,
    pub events: broadcast::Receiver<CallEvent>,
}

pub fn harness() -> Harness {
    let channel = MockChannel::new(true);
    let backend = MockBackend::new();
    let media = MockMedia::new();
    let bus = EventBus::new();
    let events = bus.subscribe();
    let channel_dyn: Arc<dyn SignalingChannel> = channel.clone();
    let backend_dyn: Arc<dyn PeerBackend> = backend.clone();
    let media_dyn: Arc<dyn MediaSource> = media.clone();
    let engine = Arc::new(CallEngine::new(
        "u1",
        channel_dyn,
        backend_dyn,
        media_dyn,
        Arc::new(IceConfigProvider::fixed(RtcConfig::fallback())),
        bus,
    ));
    Harness {
        engine,
        channel,
        backend,
        media,
        events,
    }
}

/// Drain all immediately available events
pub fn drain_events(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait up to a second for the next event
pub async fn next_event(rx: &mut broadcast::Receiver<CallEvent>) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

pub fn candidate(line: &str) -> CandidateInit {
    CandidateInit {
        candidate: line.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}
