//! Stage-scoped signaling: message shapes and the transport seam.
//!
//! The transport delivers every message to every participant in the stage
//! except the sender, at-least-once, with no cross-sender ordering
//! guarantee. Handlers therefore tolerate duplicates and reordering:
//! re-applying an identical candidate is a no-op, answers correlate to
//! offers by nonce, and control messages are state-setting rather than
//! toggling blind.

pub mod channel;

use crate::errors::SignalingError;
use crate::peering::IceCandidate;
use crate::types::{StageId, StageRole, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use channel::SignalingChannel;

/// One message on a stage's signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    /// Stage the message is scoped to.
    pub stage_id: StageId,
    /// Sender.
    pub from_user_id: UserId,
    /// Addressee; `None` broadcasts to the whole stage.
    pub to_user_id: Option<UserId>,
    /// Payload.
    #[serde(flatten)]
    pub body: SignalingBody,
}

impl SignalingMessage {
    /// Whether this message is addressed to the given user (directly or by
    /// broadcast).
    #[must_use]
    pub fn addressed_to(&self, user_id: &UserId) -> bool {
        match &self.to_user_id {
            Some(target) => target == user_id,
            None => true,
        }
    }
}

/// Closed union of signaling payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingBody {
    /// Presence: the sender entered the stage.
    Join { role: StageRole },

    /// Presence: the sender left the stage.
    Leave,

    /// Session description offer. `nonce` correlates the eventual answer.
    Offer { sdp: String, nonce: Uuid },

    /// Session description answer to the offer with the same nonce.
    Answer { sdp: String, nonce: Uuid },

    /// Trickle ICE candidate.
    IceCandidate { candidate: IceCandidate },

    /// Media/UI control update; lets peers reflect remote state without
    /// guessing from silence or frozen frames.
    Control { payload: ControlPayload },
}

impl SignalingBody {
    /// Returns the payload kind as a string for log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalingBody::Join { .. } => "join",
            SignalingBody::Leave => "leave",
            SignalingBody::Offer { .. } => "offer",
            SignalingBody::Answer { .. } => "answer",
            SignalingBody::IceCandidate { .. } => "ice-candidate",
            SignalingBody::Control { .. } => "control",
        }
    }
}

/// Control sub-payloads. All carry the resulting state, so duplicate
/// delivery converges instead of double-toggling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlPayload {
    AudioToggle { enabled: bool },
    VideoToggle { enabled: bool },
    HandRaise { raised: bool },
    ScreenShareStart,
    ScreenShareStop,
}

/// A participant present in the stage at join time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMember {
    pub user_id: UserId,
    pub role: StageRole,
}

/// Result of a successful transport join.
#[derive(Debug)]
pub struct JoinAck {
    /// Participants already present, for the initial round of offers.
    pub members: Vec<StageMember>,
    /// Inbound message stream. The transport closes it on disconnect.
    pub incoming: mpsc::Receiver<SignalingMessage>,
}

/// Signaling transport seam (enables mocking).
///
/// Implementations deliver each sent message to every joined participant of
/// the stage except the sender. Delivery is at-least-once and unordered
/// across senders.
#[async_trait::async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to a stage. The returned ack carries the current member
    /// list and the inbound stream.
    async fn join(&self, stage_id: &StageId, user_id: &UserId)
        -> Result<JoinAck, SignalingError>;

    /// Fire-and-forget send. Callers needing acknowledgement encode their
    /// own correlation in the payload.
    fn send(&self, message: SignalingMessage);

    /// Unsubscribe. Safe to call when never joined.
    async fn leave(&self, stage_id: &StageId, user_id: &UserId);
}
