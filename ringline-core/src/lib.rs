//! Ringline - real-time call signaling and WebRTC peer negotiation
//!
//! This library drives one-to-one audio/video calls against a JSON
//! WebSocket signaling server. It owns:
//!
//! - **Signaling transport**: auto-reconnecting WebSocket client with a
//!   single non-stacking retry timer
//! - **Call state machine**: idle / incoming / outgoing / active / ended
//!   with caller/callee asymmetry and busy rejection
//! - **Peer negotiation**: offer/answer exchange and trickled ICE with
//!   ordered candidate buffering until the remote description applies
//! - **Media**: local Opus/VP8 tracks with video-to-audio downgrade
//! - **Events**: a broadcast bus covering the whole call lifecycle
//!
//! # Examples
//!
//! ```rust,no_run
//! use ringline_core::{CallService, MediaKind, WsConnector};
//! use url::Url;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let url = Url::parse("wss://calls.example.org/ws")?;
//! let service = CallService::<WsConnector>::builder("u1", "token", url).build();
//!
//! service.connect().await?;
//! let mut events = service.subscribe();
//!
//! service.start_call("u2", MediaKind::Video, None).await;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Call event vocabulary and broadcast bus
pub mod events;

/// Wire protocol for the signaling channel
pub mod protocol;

/// Auto-reconnecting signaling transport
pub mod transport;

/// ICE server configuration
pub mod ice;

/// Local media acquisition
pub mod media;

/// Peer connection negotiation
pub mod negotiation;

/// Call state machine
pub mod engine;

/// Per-session service wiring
pub mod service;

pub use engine::CallEngine;
pub use events::{CallEvent, EventBus};
pub use ice::{HttpIceEndpoint, IceConfigProvider, IceEndpoint, IceServer, RtcConfig};
pub use media::{LocalMedia, MediaError, MediaSource, SampleMediaSource};
pub use negotiation::{
    Negotiation, NegotiationError, NegotiationPhase, PeerBackend, PeerHandle, RtcBackend,
};
pub use protocol::{ClientMessage, SdpKind, ServerMessage};
pub use service::{CallService, CallServiceBuilder};
pub use transport::{
    Connector, ReconnectPolicy, SignalingChannel, SignalingClient, TransportError, TransportEvent,
    WsConnector,
};
pub use types::{
    CallId, CallRole, CallSession, CallStatus, ErrorCode, MediaKind, PendingCall, RemoteMedia,
};

/// Commonly used types
pub mod prelude {
    pub use crate::engine::CallEngine;
    pub use crate::events::CallEvent;
    pub use crate::service::{CallService, CallServiceBuilder};
    pub use crate::types::{CallId, CallRole, CallSession, CallStatus, ErrorCode, MediaKind};
}
