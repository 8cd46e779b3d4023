//! Local capture handles and the platform media seam.
//!
//! [`MediaTrack`] and [`MediaStream`] are the engine's handles to acquired
//! capture resources. Tracks carry an atomic enabled flag (mute/unmute flips
//! it without stopping the capture) and an idempotent [`MediaTrack::stop`].
//! The awaitable [`MediaTrack::ended`] signal is how the engine observes
//! externally-initiated capture end, e.g. the platform's own "stop sharing"
//! control on a screen-capture track.
//!
//! Acquisition goes through the [`MediaDevices`] trait so the platform API
//! can be mocked in tests.

pub mod registry;

use crate::errors::MediaAcquisitionError;
use crate::types::StreamId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub use registry::{MediaResourceRegistry, OwnerId, StreamPurpose};

/// Kind of a capture track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Returns the kind as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// Liveness of a capture track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Producing media.
    Live,
    /// Stopped; a track never returns to `Live`.
    Ended,
}

/// One capture track (microphone, camera, or screen capture).
#[derive(Debug)]
pub struct MediaTrack {
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
}

impl MediaTrack {
    /// Create a live, enabled track.
    #[must_use]
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        let (ended_tx, _) = watch::channel(false);
        Arc::new(Self {
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            ended_tx,
        })
    }

    /// Track kind.
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Human-readable device label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the track is currently contributing media.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag. Instantaneous; the capture keeps running.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current liveness.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        if *self.ended_tx.borrow() {
            ReadyState::Ended
        } else {
            ReadyState::Live
        }
    }

    /// Stop the capture. Idempotent; stopping an ended track is a no-op.
    pub fn stop(&self) {
        self.ended_tx.send_replace(true);
    }

    /// Resolves once the track has ended, whether by [`stop`](Self::stop) or
    /// by the platform ending the capture.
    pub async fn ended(&self) {
        let mut rx = self.ended_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// An acquired set of tracks sharing one capture request.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: StreamId,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    /// Create a stream over the given tracks.
    #[must_use]
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: StreamId::new(),
            tracks,
        }
    }

    /// Stream id.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// All tracks.
    #[must_use]
    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// First audio track, if any.
    #[must_use]
    pub fn audio_track(&self) -> Option<Arc<MediaTrack>> {
        self.tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .cloned()
    }

    /// First video track, if any.
    #[must_use]
    pub fn video_track(&self) -> Option<Arc<MediaTrack>> {
        self.tracks
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned()
    }

    /// Stop every track that is still live.
    pub fn stop_tracks(&self) {
        for track in &self.tracks {
            if track.ready_state() == ReadyState::Live {
                track.stop();
            }
        }
    }

    /// Whether every track has ended.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks
            .iter()
            .all(|t| t.ready_state() == ReadyState::Ended)
    }
}

/// Constraints for a capture request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Request a microphone track.
    pub audio: bool,
    /// Request a camera track.
    pub video: bool,
    /// Pin the capture to a specific input device.
    pub device_id: Option<String>,
}

/// Kind of an enumerable input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

/// One entry from device enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Platform capture API seam (enables mocking).
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire camera and/or microphone per the constraints.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError>;

    /// Acquire a screen-capture stream.
    async fn get_display_media(&self) -> Result<MediaStream, MediaAcquisitionError>;

    /// List available input devices.
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaAcquisitionError>;
}
