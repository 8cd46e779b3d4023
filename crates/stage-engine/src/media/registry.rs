//! Registry of acquired capture streams.
//!
//! Every acquired stream is registered here before any network operation, so
//! every cleanup path (explicit leave, screen-share end, session teardown,
//! consumer unmount) funnels through one structure. Auditing "did we leak a
//! camera light" has exactly one place to look.
//!
//! Stops are idempotent: tracks check their ready state before stopping, and
//! a stop request for a stream the registry no longer tracks logs a
//! leak-guard warning instead of failing.

use crate::media::MediaStream;
use crate::metrics::SessionMetrics;
use crate::types::StreamId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Why a stream was acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPurpose {
    /// Camera and/or microphone capture.
    CameraMic,
    /// Screen capture.
    ScreenShare,
}

impl StreamPurpose {
    /// Returns the purpose as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamPurpose::CameraMic => "camera-mic",
            StreamPurpose::ScreenShare => "screen-share",
        }
    }
}

/// Identifies the component that requested a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug)]
struct RegisteredStream {
    stream: MediaStream,
    purpose: StreamPurpose,
    owner: OwnerId,
}

/// Tracks every acquired stream so it can be force-stopped regardless of
/// which component requested it.
#[derive(Debug)]
pub struct MediaResourceRegistry {
    inner: Mutex<HashMap<StreamId, RegisteredStream>>,
    metrics: Arc<SessionMetrics>,
}

impl MediaResourceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(metrics: Arc<SessionMetrics>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    /// Register an acquired stream.
    pub fn register(&self, stream: MediaStream, purpose: StreamPurpose, owner: OwnerId) {
        let id = stream.id();
        debug!(
            target: "stage.media",
            stream_id = %id,
            purpose = purpose.as_str(),
            owner = %owner,
            "Stream registered"
        );
        self.metrics.record_stream_registered();
        let mut inner = self.lock();
        inner.insert(
            id,
            RegisteredStream {
                stream,
                purpose,
                owner,
            },
        );
    }

    /// Stop and remove one stream.
    ///
    /// Returns `false` (and logs the leak-guard warning) when the registry no
    /// longer tracks the stream, which means some caller stopped it outside
    /// the registry funnel.
    pub fn release(&self, id: StreamId) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.remove(&id)
        };
        match removed {
            Some(entry) => {
                entry.stream.stop_tracks();
                self.metrics.record_stream_stopped();
                debug!(
                    target: "stage.media",
                    stream_id = %id,
                    purpose = entry.purpose.as_str(),
                    "Stream stopped and released"
                );
                true
            }
            None => {
                self.metrics.record_leak_guard_warning();
                warn!(
                    target: "stage.media",
                    stream_id = %id,
                    "Release requested for a stream the registry does not track"
                );
                false
            }
        }
    }

    /// Stop and remove a stream if it is still tracked.
    ///
    /// Unlike [`release`](Self::release), an already-released stream is not a
    /// leak-guard violation; concurrent teardown paths (cancelled connect,
    /// session teardown) may both reach for the same stream and the loser is
    /// expected here.
    pub fn try_release(&self, id: StreamId) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.remove(&id)
        };
        match removed {
            Some(entry) => {
                entry.stream.stop_tracks();
                self.metrics.record_stream_stopped();
                true
            }
            None => false,
        }
    }

    /// Stop and remove every stream belonging to one owner.
    pub fn release_owned(&self, owner: &OwnerId) -> usize {
        let removed: Vec<RegisteredStream> = {
            let mut inner = self.lock();
            let ids: Vec<StreamId> = inner
                .iter()
                .filter(|(_, entry)| entry.owner == *owner)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
        };
        for entry in &removed {
            entry.stream.stop_tracks();
            self.metrics.record_stream_stopped();
        }
        if !removed.is_empty() {
            debug!(
                target: "stage.media",
                owner = %owner,
                count = removed.len(),
                "Owner streams stopped and released"
            );
        }
        removed.len()
    }

    /// Stop and remove every registered stream.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<RegisteredStream> = {
            let mut inner = self.lock();
            inner.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.stream.stop_tracks();
            self.metrics.record_stream_stopped();
        }
        if !drained.is_empty() {
            debug!(
                target: "stage.media",
                count = drained.len(),
                "All registered streams stopped"
            );
        }
        drained.len()
    }

    /// Whether a stream is currently tracked.
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of tracked streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, RegisteredStream>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // A poisoned map still holds the streams; cleanup must proceed.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for MediaResourceRegistry {
    fn drop(&mut self) {
        let remaining = self.stop_all();
        if remaining > 0 {
            warn!(
                target: "stage.media",
                count = remaining,
                "Registry dropped with live streams; stopped at teardown"
            );
        }
    }
}
