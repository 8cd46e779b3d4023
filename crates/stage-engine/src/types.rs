//! Shared identifier and read-model types.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a stage (one multi-party call room).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageId(pub String);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a participant, supplied by the identity provider.
///
/// Ordered so that simultaneous offers between two peers resolve
/// deterministically (the lower id keeps the offerer role).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique identifier for an acquired media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Create a new random stream ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Role of a participant within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageRole {
    /// Can speak and moderate other participants.
    Moderator,
    /// Can speak.
    Speaker,
    /// Listens only.
    Audience,
}

impl StageRole {
    /// Returns the role as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageRole::Moderator => "moderator",
            StageRole::Speaker => "speaker",
            StageRole::Audience => "audience",
        }
    }
}

/// Connection lifecycle state of a stage session.
///
/// `Error` and `Left` are terminal for that session instance; a new
/// `initialize` call creates a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session yet.
    Idle,
    /// Acquiring media and joining signaling.
    Connecting,
    /// Signaling subscription acknowledged; peer links converge independently.
    Connected,
    /// Lost signaling or a majority of peer links; retrying with backoff.
    Reconnecting,
    /// Unrecoverable failure (terminal).
    Error,
    /// Session ended by the local user (terminal).
    Left,
}

impl ConnectionState {
    /// Whether this state ends the session instance.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Left)
    }

    /// Whether a session in this state is actively running.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    /// Returns the state as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Left => "left",
        }
    }
}

/// Local media flags, mirrored to remote participants via control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaState {
    /// Microphone track enabled.
    pub audio_enabled: bool,
    /// Camera track enabled.
    pub video_enabled: bool,
    /// A screen-capture stream is active.
    pub screen_sharing: bool,
}

/// Coarse link quality bucket derived from peer transport statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    Good,
    Degraded,
    Poor,
}

impl LinkQuality {
    /// Returns the quality as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkQuality::Good => "good",
            LinkQuality::Degraded => "degraded",
            LinkQuality::Poor => "poor",
        }
    }
}

/// Advisory network quality; never drives control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkQuality {
    pub quality: LinkQuality,
    pub ping_ms: u32,
}

impl Default for NetworkQuality {
    fn default() -> Self {
        Self {
            quality: LinkQuality::Good,
            ping_ms: 0,
        }
    }
}
