//! Core call types and data structures

use serde::{Deserialize, Serialize};

/// Unique identifier for a call.
///
/// Call ids are opaque tokens assigned by the signaling server when an
/// invite is acknowledged; the client never fabricates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Create a call id from its wire representation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the wire representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of media carried by a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio-only call
    Audio,
    /// Audio and video call
    Video,
}

impl MediaKind {
    /// Check whether video is carried
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl Default for MediaKind {
    fn default() -> Self {
        Self::Audio
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which side of the call this client is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// This client placed the call
    Caller,
    /// This client received the call
    Callee,
}

/// Call session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call in progress
    Idle,
    /// An invite from a remote peer is ringing locally
    Incoming,
    /// An invite has been sent and is ringing remotely
    Outgoing,
    /// The call is established
    Active,
    /// The call finished; `reset` returns the session to `Idle`
    Ended,
}

/// The single authoritative record of the in-progress or most recent call.
///
/// At most one non-idle session exists at a time; a second `start_call`
/// while one is outstanding is rejected, never queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Server-assigned call id (absent until the invite is acknowledged)
    pub call_id: Option<CallId>,
    /// Remote peer's user id
    pub peer_user_id: Option<String>,
    /// Negotiated media kind (may downgrade from video to audio)
    pub media_kind: MediaKind,
    /// Caller or callee
    pub role: Option<CallRole>,
    /// Optional correlation token from the inviting context
    pub context_id: Option<String>,
    /// Current status
    pub status: CallStatus,
    /// Last non-fatal error message, if any
    pub error: Option<String>,
}

impl CallSession {
    /// An idle session with no call recorded
    pub fn idle() -> Self {
        Self {
            call_id: None,
            peer_user_id: None,
            media_kind: MediaKind::Audio,
            role: None,
            context_id: None,
            status: CallStatus::Idle,
            error: None,
        }
    }

    /// Check whether the session is idle
    pub fn is_idle(&self) -> bool {
        self.status == CallStatus::Idle
    }

    /// Check whether the session refers to the given call
    pub fn matches(&self, call_id: &CallId) -> bool {
        self.call_id.as_ref() == Some(call_id)
    }
}

impl Default for CallSession {
    fn default() -> Self {
        Self::idle()
    }
}

/// A pending incoming call, keyed by call id until the user accepts or
/// rejects it, or the remote side cancels.
///
/// Several of these may coexist even though only one can become the
/// active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    /// Who is calling
    pub from_user_id: String,
    /// Requested media kind
    pub media_kind: MediaKind,
    /// Optional correlation token
    pub context_id: Option<String>,
}

/// Descriptor for a remote media track received from the peer.
///
/// Remote tracks are owned by the peer connection; on teardown they are
/// dereferenced, never stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMedia {
    /// Track identifier
    pub track_id: String,
    /// Audio or video
    pub kind: MediaKind,
    /// RTP codec mime type, e.g. `audio/opus`
    pub mime_type: String,
}

/// Error taxonomy surfaced through the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The signaling channel is not open
    WsNotConnected,
    /// A call is already outstanding
    AlreadyInCall,
    /// The command targets a call id this client does not know
    UnknownCall,
    /// `end_call` issued with no active call
    NoActiveCall,
    /// Local media acquisition failed completely
    MediaError,
    /// No identity token available for the signaling channel
    Unauthorized,
    /// Malformed inbound signaling payload
    InvalidJson,
    /// Server-reported call error, or a negotiation failure
    CallError,
}

impl ErrorCode {
    /// Wire/string representation of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WsNotConnected => "ws_not_connected",
            Self::AlreadyInCall => "already_in_call",
            Self::UnknownCall => "unknown_call",
            Self::NoActiveCall => "no_active_call",
            Self::MediaError => "media_error",
            Self::Unauthorized => "unauthorized",
            Self::InvalidJson => "invalid_json",
            Self::CallError => "call_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
