//! Wire protocol for the signaling channel.
//!
//! Messages are JSON objects tagged by a `type` field, e.g.
//! `{"type":"call.invite","target_id":"u2","media_type":"video"}`.
//! Unknown inbound types are ignored so that servers can add messages
//! without breaking older clients.

use serde::{Deserialize, Serialize};

use crate::types::{CallId, MediaKind};

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// A trickled ICE candidate as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

/// Messages sent by the client to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Invite a peer to a call
    #[serde(rename = "call.invite")]
    Invite {
        /// User to invite
        target_id: String,
        /// Requested media kind
        media_type: MediaKind,
        /// Optional correlation token
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_id: Option<String>,
    },
    /// Accept an incoming call
    #[serde(rename = "call.answer")]
    Accept {
        /// Call being accepted
        call_id: CallId,
    },
    /// Reject an incoming call
    #[serde(rename = "call.reject")]
    Reject {
        /// Call being rejected
        call_id: CallId,
        /// Optional reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Cancel an outgoing call before it is answered
    #[serde(rename = "call.cancel")]
    Cancel {
        /// Call being canceled
        call_id: CallId,
    },
    /// End an active call
    #[serde(rename = "call.end")]
    End {
        /// Call being ended
        call_id: CallId,
        /// Optional reason
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Keepalive ping
    #[serde(rename = "call.heartbeat")]
    Heartbeat {
        /// Current call, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    /// Relay a local SDP offer to the peer
    #[serde(rename = "webrtc.offer")]
    Offer {
        /// Call the description belongs to
        call_id: CallId,
        /// Session description
        sdp: String,
        /// Description kind
        sdp_type: SdpKind,
    },
    /// Relay a local SDP answer to the peer
    #[serde(rename = "webrtc.answer")]
    Answer {
        /// Call the description belongs to
        call_id: CallId,
        /// Session description
        sdp: String,
        /// Description kind
        sdp_type: SdpKind,
    },
    /// Relay a local ICE candidate to the peer
    #[serde(rename = "webrtc.ice_candidate")]
    Candidate {
        /// Call the candidate belongs to
        call_id: CallId,
        /// Candidate attribute line
        candidate: String,
        /// Media stream identification tag
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        /// Index of the media description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
}

/// Messages received from the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Connection acknowledged; reports server-side session state
    #[serde(rename = "call.init")]
    Init {
        /// Server-side session state label
        #[serde(default)]
        state: Option<String>,
        /// Call already in progress for this user, if any
        #[serde(default)]
        active_call_id: Option<CallId>,
    },
    /// A remote peer is inviting us to a call
    #[serde(rename = "call.incoming")]
    Incoming {
        /// Server-assigned call id
        call_id: CallId,
        /// Who is calling
        from_user_id: String,
        /// Requested media kind
        media_type: MediaKind,
        /// Optional correlation token
        #[serde(default)]
        context_id: Option<String>,
    },
    /// Our invite was accepted by the server and assigned an id
    #[serde(rename = "call.invite_ack")]
    InviteAck {
        /// Server-assigned call id
        call_id: CallId,
        /// Invited peer, echoed back
        #[serde(default)]
        target_id: Option<String>,
        /// Media kind, echoed back
        #[serde(default)]
        media_type: Option<MediaKind>,
    },
    /// The callee accepted; the call is now established
    #[serde(rename = "call.accepted")]
    Accepted {
        /// Call id
        call_id: CallId,
        /// Media kind in effect
        #[serde(default)]
        media_type: Option<MediaKind>,
    },
    /// Server acknowledged our `call.answer`
    #[serde(rename = "call.answer_ack")]
    AnswerAck {
        /// Call id
        call_id: CallId,
    },
    /// Server acknowledged our `call.reject`
    #[serde(rename = "call.reject_ack")]
    RejectAck {
        /// Call id
        call_id: CallId,
        /// Resulting server-side status
        #[serde(default)]
        status: Option<String>,
    },
    /// The callee rejected our invite
    #[serde(rename = "call.rejected")]
    Rejected {
        /// Call id
        call_id: CallId,
        /// Optional reason
        #[serde(default)]
        reason: Option<String>,
    },
    /// Server acknowledged our `call.cancel`
    #[serde(rename = "call.cancel_ack")]
    CancelAck {
        /// Call id
        call_id: CallId,
    },
    /// The caller canceled their invite
    #[serde(rename = "call.canceled")]
    Canceled {
        /// Call id
        call_id: CallId,
        /// Optional reason
        #[serde(default)]
        reason: Option<String>,
    },
    /// The call ended (remote hangup or server decision)
    #[serde(rename = "call.ended")]
    Ended {
        /// Call id
        call_id: CallId,
        /// Optional reason
        #[serde(default)]
        reason: Option<String>,
        /// Which user ended it, when known
        #[serde(default)]
        by_user_id: Option<String>,
    },
    /// Server acknowledged our `call.end`
    #[serde(rename = "call.end_ack")]
    EndAck {
        /// Call id
        call_id: CallId,
    },
    /// Server answered a heartbeat
    #[serde(rename = "call.heartbeat_ack")]
    HeartbeatAck {
        /// Call id echoed back, if any
        #[serde(default)]
        call_id: Option<CallId>,
    },
    /// Server-reported call error
    #[serde(rename = "call.error")]
    Error {
        /// Server error code
        #[serde(default)]
        code: Option<String>,
        /// Human-readable message
        #[serde(default)]
        message: Option<String>,
    },
    /// Remote SDP offer relayed from the peer
    #[serde(rename = "webrtc.offer")]
    Offer {
        /// Call the description belongs to
        call_id: CallId,
        /// Session description
        sdp: String,
        /// Description kind
        sdp_type: SdpKind,
    },
    /// Remote SDP answer relayed from the peer
    #[serde(rename = "webrtc.answer")]
    Answer {
        /// Call the description belongs to
        call_id: CallId,
        /// Session description
        sdp: String,
        /// Description kind
        sdp_type: SdpKind,
    },
    /// Remote ICE candidate relayed from the peer
    #[serde(rename = "webrtc.ice_candidate")]
    Candidate {
        /// Call the candidate belongs to
        call_id: CallId,
        /// Candidate attribute line
        candidate: String,
        /// Media stream identification tag
        #[serde(default)]
        sdp_mid: Option<String>,
        /// Index of the media description
        #[serde(default)]
        sdp_mline_index: Option<u16>,
    },
}

/// Outcome of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A recognized message
    Message(ServerMessage),
    /// Valid JSON with an unrecognized or malformed `type`; dropped
    Ignored {
        /// The `type` field, when present
        message_type: Option<String>,
    },
    /// Not JSON at all
    Invalid,
}

/// Classify one inbound text frame.
///
/// Unknown message types are tolerated so that newer servers keep
/// working against this client; only non-JSON input is an error.
pub fn decode_inbound(text: &str) -> Decoded {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => Decoded::Message(message),
        Err(_) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => Decoded::Ignored {
                message_type: value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(str::to_string),
            },
            Err(_) => Decoded::Invalid,
        },
    }
}
