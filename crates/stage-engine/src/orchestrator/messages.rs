//! Mailbox messages and read-model types for the stage orchestrator.
//!
//! All communication with the orchestrator actor is strongly-typed message
//! passing over `tokio::sync::mpsc`; request-reply uses `tokio::sync::oneshot`.

use crate::errors::StageError;
use crate::media::{MediaConstraints, MediaStream};
use crate::peering::PeerLinkInfo;
use crate::signaling::{SignalingChannel, StageMember};
use crate::types::{
    ConnectionState, MediaState, NetworkQuality, StageId, StageRole, StreamId, UserId,
};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Parameters for one `initialize` call.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// The call room to join.
    pub stage_id: StageId,
    /// Local identity, from the identity provider.
    pub user_id: UserId,
    /// Local role within the stage.
    pub role: StageRole,
    /// Capture constraints for the local camera/microphone stream.
    pub constraints: MediaConstraints,
}

/// Roster entry for one participant (local or remote).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub role: StageRole,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub hand_raised: bool,
    pub screen_sharing: bool,
}

impl ParticipantInfo {
    /// Roster entry with default media flags, used until the participant's
    /// first control message arrives.
    #[must_use]
    pub fn joined(user_id: UserId, role: StageRole) -> Self {
        Self {
            user_id,
            role,
            audio_enabled: true,
            video_enabled: true,
            hand_raised: false,
            screen_sharing: false,
        }
    }
}

/// The session read model, published through a watch channel so the
/// consumer reads it synchronously at any time.
#[derive(Debug, Clone)]
pub struct StageSnapshot {
    pub stage_id: Option<StageId>,
    pub local_user_id: Option<UserId>,
    pub local_role: Option<StageRole>,
    pub connection_state: ConnectionState,
    /// Human-readable reason for the current state (set for `Error`).
    pub state_reason: Option<String>,
    pub media_state: MediaState,
    pub network_quality: NetworkQuality,
    /// Reconnect attempts for the current outage; 0 while healthy.
    pub connection_attempts: u32,
    pub hand_raised: bool,
    /// Remote participants, keyed by user id.
    pub participants: Vec<ParticipantInfo>,
    /// Active peer links and their transport states.
    pub peer_links: Vec<PeerLinkInfo>,
    /// Remote streams ready to render, keyed by user id.
    pub remote_streams: HashMap<UserId, MediaStream>,
}

impl Default for StageSnapshot {
    fn default() -> Self {
        Self {
            stage_id: None,
            local_user_id: None,
            local_role: None,
            connection_state: ConnectionState::Idle,
            state_reason: None,
            media_state: MediaState::default(),
            network_quality: NetworkQuality::default(),
            connection_attempts: 0,
            hand_raised: false,
            participants: Vec::new(),
            peer_links: Vec::new(),
            remote_streams: HashMap::new(),
        }
    }
}

/// What a successful connect attempt hands back to the actor.
#[derive(Debug)]
pub(crate) struct ConnectArtifacts {
    pub stream: MediaStream,
    pub channel: SignalingChannel,
    pub members: Vec<StageMember>,
}

/// What a successful rejoin attempt hands back to the actor.
#[derive(Debug)]
pub(crate) struct RejoinArtifacts {
    pub channel: SignalingChannel,
    pub members: Vec<StageMember>,
}

/// Messages sent to the orchestrator actor.
#[derive(Debug)]
pub(crate) enum StageCommand {
    /// Start a new session.
    Initialize {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// End the session and release every resource. Idempotent.
    Leave { respond_to: oneshot::Sender<()> },

    /// Flip the microphone track; responds with the new enabled state.
    ToggleAudio {
        respond_to: oneshot::Sender<Result<bool, StageError>>,
    },

    /// Flip the camera track; responds with the new enabled state.
    ToggleVideo {
        respond_to: oneshot::Sender<Result<bool, StageError>>,
    },

    /// Start sharing a screen-capture stream.
    StartScreenShare {
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Stop the active screen share, reverting to the camera track.
    StopScreenShare {
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Re-acquire the camera/microphone from a specific input device.
    SwitchInputDevice {
        device_id: String,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Raise or lower the local hand.
    SetHandRaised {
        raised: bool,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Internal: a connect attempt finished.
    ConnectFinished {
        epoch: u64,
        result: Result<ConnectArtifacts, StageError>,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    },

    /// Internal: a reconnect attempt finished.
    RejoinFinished {
        epoch: u64,
        result: Result<RejoinArtifacts, StageError>,
    },

    /// Internal: a screen-capture track ended outside our own stop path.
    ScreenTrackEnded { stream_id: StreamId },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot_is_idle_and_empty() {
        let snapshot = StageSnapshot::default();
        assert_eq!(snapshot.connection_state, ConnectionState::Idle);
        assert_eq!(snapshot.connection_attempts, 0);
        assert!(snapshot.remote_streams.is_empty());
        assert!(snapshot.participants.is_empty());
    }

    #[test]
    fn test_joined_roster_entry_defaults() {
        let info = ParticipantInfo::joined(UserId::from("u2"), StageRole::Speaker);
        assert!(info.audio_enabled);
        assert!(info.video_enabled);
        assert!(!info.hand_raised);
        assert!(!info.screen_sharing);
    }
}
