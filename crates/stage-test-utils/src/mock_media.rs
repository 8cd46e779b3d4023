//! Mock media device layer.
//!
//! Grants deterministic in-memory streams, or fails in configurable ways.
//! Every granted stream is recorded so tests can assert that each one ended
//! up stopped, regardless of which cleanup path ran.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use stage_engine::{
    MediaAcquisitionError, MediaConstraints, MediaDeviceInfo, MediaDevices, MediaStream,
    MediaTrack, TrackKind,
};

#[derive(Clone)]
enum AcquireMode {
    Grant,
    Deny(MediaAcquisitionError),
}

struct Inner {
    user_media: AcquireMode,
    display_media: AcquireMode,
    acquire_delay: Duration,
    devices: Vec<MediaDeviceInfo>,
    user_media_calls: u32,
    display_media_calls: u32,
    last_constraints: Option<MediaConstraints>,
    granted: Vec<MediaStream>,
    granted_displays: Vec<MediaStream>,
}

/// Mock implementation of [`MediaDevices`].
pub struct MockMediaDevices {
    inner: Mutex<Inner>,
}

impl MockMediaDevices {
    /// A device layer that grants every request.
    #[must_use]
    pub fn granting() -> Arc<Self> {
        Self::with_mode(AcquireMode::Grant, AcquireMode::Grant)
    }

    /// A device layer that denies camera/microphone requests.
    #[must_use]
    pub fn denying(error: MediaAcquisitionError) -> Arc<Self> {
        Self::with_mode(AcquireMode::Deny(error), AcquireMode::Grant)
    }

    /// A device layer that denies screen-capture requests.
    #[must_use]
    pub fn denying_display(error: MediaAcquisitionError) -> Arc<Self> {
        Self::with_mode(AcquireMode::Grant, AcquireMode::Deny(error))
    }

    fn with_mode(user_media: AcquireMode, display_media: AcquireMode) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                user_media,
                display_media,
                acquire_delay: Duration::ZERO,
                devices: Vec::new(),
                user_media_calls: 0,
                display_media_calls: 0,
                last_constraints: None,
                granted: Vec::new(),
                granted_displays: Vec::new(),
            }),
        })
    }

    /// Delay every acquisition, for cancellation-race tests with paused
    /// time.
    pub fn set_acquire_delay(&self, delay: Duration) {
        self.lock().acquire_delay = delay;
    }

    /// Configure the enumerable device list.
    pub fn set_devices(&self, devices: Vec<MediaDeviceInfo>) {
        self.lock().devices = devices;
    }

    /// Number of camera/microphone acquisitions.
    #[must_use]
    pub fn user_media_calls(&self) -> u32 {
        self.lock().user_media_calls
    }

    /// Number of screen-capture acquisitions.
    #[must_use]
    pub fn display_media_calls(&self) -> u32 {
        self.lock().display_media_calls
    }

    /// Constraints of the most recent camera/microphone acquisition.
    #[must_use]
    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        self.lock().last_constraints.clone()
    }

    /// Every granted camera/microphone stream, in grant order.
    #[must_use]
    pub fn granted_streams(&self) -> Vec<MediaStream> {
        self.lock().granted.clone()
    }

    /// Every granted screen-capture stream, in grant order.
    #[must_use]
    pub fn granted_display_streams(&self) -> Vec<MediaStream> {
        self.lock().granted_displays.clone()
    }

    /// The most recent screen-capture stream, if any.
    #[must_use]
    pub fn last_display_stream(&self) -> Option<MediaStream> {
        self.lock().granted_displays.last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaAcquisitionError> {
        let (mode, delay) = {
            let mut inner = self.lock();
            inner.user_media_calls += 1;
            inner.last_constraints = Some(constraints.clone());
            (inner.user_media.clone(), inner.acquire_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match mode {
            AcquireMode::Deny(error) => Err(error),
            AcquireMode::Grant => {
                let mut tracks = Vec::new();
                if constraints.audio {
                    tracks.push(MediaTrack::new(TrackKind::Audio, "mock-mic"));
                }
                if constraints.video {
                    let label = constraints
                        .device_id
                        .clone()
                        .unwrap_or_else(|| "mock-cam".to_string());
                    tracks.push(MediaTrack::new(TrackKind::Video, label));
                }
                let stream = MediaStream::new(tracks);
                self.lock().granted.push(stream.clone());
                Ok(stream)
            }
        }
    }

    async fn get_display_media(&self) -> Result<MediaStream, MediaAcquisitionError> {
        let (mode, delay) = {
            let mut inner = self.lock();
            inner.display_media_calls += 1;
            (inner.display_media.clone(), inner.acquire_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match mode {
            AcquireMode::Deny(error) => Err(error),
            AcquireMode::Grant => {
                let stream = MediaStream::new(vec![MediaTrack::new(
                    TrackKind::Video,
                    "mock-screen",
                )]);
                self.lock().granted_displays.push(stream.clone());
                Ok(stream)
            }
        }
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaAcquisitionError> {
        Ok(self.lock().devices.clone())
    }
}
