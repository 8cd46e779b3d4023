//! Peer connection layer: one link per remote participant.
//!
//! The engine drives offer/answer/ICE over the signaling channel and keeps
//! per-link negotiation state; the actual media transport sits behind the
//! [`PeerTransport`] seam. Operations on one link are serialized (a second
//! renegotiation queues behind an in-flight one); distinct links proceed
//! independently.

pub mod link;
pub mod manager;

use crate::errors::NegotiationError;
use crate::media::{MediaStream, MediaTrack};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use link::{PeerLinkInfo, RenegotiationReason};
pub use manager::{LinkTransition, OutboundSignal, PeerConnectionManager, RemovedLink};

/// Which side of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description produced or consumed by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

/// A trickle ICE candidate.
///
/// `Eq + Hash` so re-applying an identical candidate can be detected and
/// dropped; the channel delivers at-least-once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u32>,
}

/// Transport-level connection state of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Returns the state as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        }
    }
}

/// Point-in-time transport statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Round-trip time to the remote peer, if measured.
    pub rtt_ms: Option<u32>,
}

/// Events surfaced by a peer transport.
#[derive(Debug, Clone)]
pub enum PeerTransportEvent {
    /// The transport's connection state changed.
    ConnectionStateChanged(PeerConnectionState),
    /// The transport gathered a local candidate to trickle to the peer.
    IceCandidate(IceCandidate),
    /// Remote media arrived.
    RemoteStream(MediaStream),
}

/// A transport event tagged with the link it belongs to.
#[derive(Debug)]
pub struct LinkEvent {
    pub remote_user_id: UserId,
    pub event: PeerTransportEvent,
}

/// The local tracks currently offered to peers.
///
/// `video` is the screen-capture track while a share is active, the camera
/// track otherwise.
#[derive(Debug, Clone, Default)]
pub struct LocalTracks {
    pub audio: Option<Arc<MediaTrack>>,
    pub video: Option<Arc<MediaTrack>>,
}

/// Media transport seam for one peer link (enables mocking).
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer describing the local side.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create an answer to the current remote description.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a locally-created description.
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply the remote side's description.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply a remote candidate. Must only be called after the remote
    /// description is set; the link buffers earlier arrivals.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Swap the outgoing audio track in place, without renegotiation.
    async fn replace_audio_track(
        &self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError>;

    /// Swap the outgoing video track in place, without renegotiation.
    ///
    /// Transports that cannot swap in place return
    /// [`NegotiationError::ReplaceUnsupported`] and the link falls back to a
    /// queued renegotiation.
    async fn replace_video_track(
        &self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError>;

    /// Current statistics.
    fn stats(&self) -> TransportStats;

    /// Close the transport. Idempotent.
    async fn close(&self);
}

/// Creates peer transports (seam for tests).
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport for the given remote participant, returning the
    /// transport and its event stream.
    fn create(
        &self,
        remote_user_id: &UserId,
    ) -> (Arc<dyn PeerTransport>, mpsc::Receiver<PeerTransportEvent>);
}
