//! Call event bus.
//!
//! Events are broadcast to every subscriber; dropping a receiver
//! unsubscribes it. Emission never blocks and never fails: with no
//! subscribers the event is simply discarded.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{CallId, CallRole, ErrorCode, MediaKind, RemoteMedia};

/// Default broadcast channel capacity
const EVENT_CAPACITY: usize = 256;

/// Events emitted by the call engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum CallEvent {
    /// Server acknowledged the connection and reported session state
    CallInit {
        /// Server-side session state label
        state: Option<String>,
        /// Call id of a call already in progress, if any
        active_call_id: Option<CallId>,
    },
    /// A remote peer is calling
    IncomingCall {
        /// Call id
        call_id: CallId,
        /// Who is calling
        from_user_id: String,
        /// Requested media kind
        media_kind: MediaKind,
        /// Optional correlation token
        context_id: Option<String>,
    },
    /// The server acknowledged our invite and assigned a call id
    OutgoingCallStarted {
        /// Call id
        call_id: CallId,
        /// Invited peer
        to_user_id: String,
        /// Requested media kind
        media_kind: MediaKind,
    },
    /// The call is ringing (on either side)
    CallRinging {
        /// Call id
        call_id: CallId,
        /// Which side this client is on
        role: CallRole,
    },
    /// The call is established
    CallActive {
        /// Call id
        call_id: CallId,
        /// Media kind in effect
        media_kind: MediaKind,
    },
    /// The callee rejected the call (or we rejected an incoming one)
    CallRejected {
        /// Call id
        call_id: CallId,
        /// Optional reason
        reason: Option<String>,
    },
    /// The caller canceled the call before it was answered
    CallCanceled {
        /// Call id
        call_id: CallId,
        /// Optional reason
        reason: Option<String>,
    },
    /// The call ended
    CallEnded {
        /// Call id (absent when the invite was never acknowledged)
        call_id: Option<CallId>,
        /// Optional reason, e.g. `connection_lost`
        reason: Option<String>,
        /// Which user ended it, when known
        by_user_id: Option<String>,
    },
    /// Local media tracks are attached and ready (once per call)
    LocalStreamReady {
        /// Call id
        call_id: CallId,
        /// Media kind actually acquired (may be downgraded)
        media_kind: MediaKind,
    },
    /// A remote media track arrived from the peer
    RemoteStreamReady {
        /// Call id
        call_id: CallId,
        /// Track descriptor
        media: RemoteMedia,
    },
    /// Server answered a heartbeat
    HeartbeatAck {
        /// Call id echoed back, if any
        call_id: Option<CallId>,
    },
    /// A typed error
    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

/// Broadcast fan-out for [`CallEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CallEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribe to events; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: CallEvent) {
        tracing::trace!(?event, "emitting call event");
        let _ = self.sender.send(event);
    }

    /// Emit a typed error event
    pub fn emit_error(&self, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(code = %code, %message, "call error");
        self.emit(CallEvent::Error { code, message });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
