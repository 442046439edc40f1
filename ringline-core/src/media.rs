//! Local media acquisition.
//!
//! The engine asks a [`MediaSource`] for tracks before negotiating.
//! A failed video acquisition is retried audio-only by the engine;
//! only a total failure aborts the call.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::types::MediaKind;

/// Errors during local media acquisition
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// The requested tracks could not be produced
    #[error("media acquisition failed: {0}")]
    Acquisition(String),
}

/// Local tracks ready to attach to a peer connection.
///
/// Dropping this releases the tracks; sample tracks stop producing
/// once their last reference is gone.
pub struct LocalMedia {
    /// Media kind actually acquired
    pub kind: MediaKind,
    /// The tracks, in attach order
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("kind", &self.kind)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Source of local media tracks
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire tracks for the given media kind
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Acquisition`] when the tracks cannot be
    /// produced, e.g. a capture device is missing or in use.
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError>;
}

/// Sample-based media source producing Opus audio and VP8 video tracks.
///
/// Writing captured samples into the tracks is the integrator's job;
/// this source only creates the track objects the peer connection
/// negotiates with.
#[derive(Debug, Default)]
pub struct SampleMediaSource;

impl SampleMediaSource {
    fn audio_track() -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio0".to_string(),
            "ringline".to_string(),
        ))
    }

    fn video_track() -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video0".to_string(),
            "ringline".to_string(),
        ))
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        let mut tracks = vec![Self::audio_track()];
        if kind.has_video() {
            tracks.push(Self::video_track());
        }
        tracing::debug!(%kind, tracks = tracks.len(), "local media acquired");
        Ok(LocalMedia { kind, tracks })
    }
}
