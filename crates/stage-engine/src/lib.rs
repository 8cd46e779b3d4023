//! Soundstage Call Orchestration Core
//!
//! This library turns a user's intent ("join stage X") into a live,
//! self-healing mesh of peer-to-peer audio/video links, while guaranteeing
//! that every acquired capture resource is released on every exit path.
//!
//! # Architecture
//!
//! One actor owns each stage session; everything else hangs off it:
//!
//! ```text
//! StageOrchestrator (actor, one session at a time)
//! ├── owns session state, published through a watch snapshot
//! ├── MediaResourceRegistry (shared; the single stream-release funnel)
//! ├── SignalingChannel (per-session subscription to the stage)
//! └── PeerConnectionManager
//!     └── PeerLink (one per remote participant)
//!         └── event forwarder task (per-link, cancellation-scoped)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One writer**: only the orchestrator actor mutates session state; the
//!   consumer talks to it through a cloneable [`StageHandle`].
//! - **Registry funnel**: every capture stream is registered before any
//!   network I/O and only ever stopped through the registry, so overlapping
//!   teardown triggers (leave, screen-share end, unmount) compose.
//! - **Seams for the platform**: media capture, signaling delivery, and the
//!   peer media transport sit behind traits, mocked in `stage-test-utils`.
//! - **Glare is deliberate**: simultaneous offers resolve by user-id order,
//!   and pre-description candidates are buffered, never dropped.
//!
//! # Modules
//!
//! - [`orchestrator`] - the session actor and its handle
//! - [`peering`] - peer links, negotiation, and the transport seam
//! - [`signaling`] - message shapes, channel client, and the transport seam
//! - [`media`] - capture handles, the device seam, and the resource registry
//! - [`config`] - tunables with compile-time defaults
//! - [`errors`] - error taxonomy
//! - [`events`] - consumer-facing event stream
//! - [`metrics`] - in-process counters

pub mod config;
pub mod errors;
pub mod events;
pub mod media;
pub mod metrics;
pub mod orchestrator;
pub mod peering;
pub mod signaling;
pub mod types;

// Re-export the primary surface.
pub use config::StageConfig;
pub use errors::{MediaAcquisitionError, NegotiationError, SignalingError, StageError};
pub use events::{EventStream, StageEvent};
pub use media::{
    DeviceKind, MediaConstraints, MediaDeviceInfo, MediaDevices, MediaResourceRegistry,
    MediaStream, MediaTrack, OwnerId, StreamPurpose, TrackKind,
};
pub use metrics::{SessionMetrics, SessionMetricsSnapshot};
pub use orchestrator::messages::{JoinRequest, ParticipantInfo, StageSnapshot};
pub use orchestrator::{StageDeps, StageHandle, StageOrchestrator};
pub use peering::{
    IceCandidate, PeerConnectionState, PeerLinkInfo, PeerTransport, PeerTransportEvent,
    PeerTransportFactory, RenegotiationReason, SdpKind, SessionDescription, TransportStats,
};
pub use signaling::{
    ControlPayload, JoinAck, SignalingBody, SignalingMessage, SignalingTransport, StageMember,
};
pub use types::{
    ConnectionState, LinkQuality, MediaState, NetworkQuality, StageId, StageRole, StreamId, UserId,
};
