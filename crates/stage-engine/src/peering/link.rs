//! Per-peer negotiation state machine.
//!
//! One [`PeerLink`] owns the transport for one remote participant plus the
//! negotiation bookkeeping around it: the in-flight offer (at most one; a
//! second request queues), the candidate buffer for candidates that arrive
//! before the remote description, and the answer cache that makes duplicate
//! offer delivery converge instead of renegotiating.

use crate::errors::NegotiationError;
use crate::media::{MediaStream, MediaTrack};
use crate::peering::{
    IceCandidate, PeerConnectionState, PeerTransport, SessionDescription, SdpKind,
};
use crate::signaling::SignalingBody;
use crate::types::UserId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Why the link last renegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenegotiationReason {
    InitialConnect,
    ScreenShareStart,
    ScreenShareStop,
    DeviceSwitch,
}

impl RenegotiationReason {
    /// Returns the reason as a string for log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RenegotiationReason::InitialConnect => "initial-connect",
            RenegotiationReason::ScreenShareStart => "screen-share-start",
            RenegotiationReason::ScreenShareStop => "screen-share-stop",
            RenegotiationReason::DeviceSwitch => "device-switch",
        }
    }
}

/// Offer/answer phase of one link.
#[derive(Debug, Clone, Copy)]
enum NegotiationPhase {
    Idle,
    AwaitingAnswer { nonce: Uuid, deadline: Instant },
}

/// Read model of one link, for the session snapshot.
#[derive(Debug, Clone)]
pub struct PeerLinkInfo {
    pub remote_user_id: UserId,
    pub state: PeerConnectionState,
    pub last_renegotiation_reason: Option<RenegotiationReason>,
}

/// One remote participant's transport plus negotiation state.
pub(crate) struct PeerLink {
    remote_user_id: UserId,
    transport: Arc<dyn PeerTransport>,
    state: PeerConnectionState,
    remote_stream: Option<MediaStream>,
    last_renegotiation_reason: Option<RenegotiationReason>,
    phase: NegotiationPhase,
    /// A renegotiation requested while another was in flight; started once
    /// the in-flight answer lands.
    pending_renegotiation: Option<RenegotiationReason>,
    /// Candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    /// Candidates already applied; re-applying a duplicate is a no-op.
    applied_candidates: HashSet<IceCandidate>,
    remote_description_set: bool,
    /// Nonce of the last remote offer we answered, with the cached answer,
    /// so at-least-once delivery of the same offer re-sends the same answer.
    last_remote_offer_nonce: Option<Uuid>,
    cached_answer: Option<SignalingBody>,
    /// When the link entered a pre-connected state; negotiation must
    /// converge within the timeout or the link is treated as failed.
    connecting_since: Instant,
    /// When set, the link is removed once this instant passes.
    remove_after: Option<Instant>,
    /// Event forwarder task, cancelled with the link.
    forwarder: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl PeerLink {
    pub(crate) fn new(
        remote_user_id: UserId,
        transport: Arc<dyn PeerTransport>,
        forwarder: JoinHandle<()>,
        cancel_token: CancellationToken,
        now: Instant,
    ) -> Self {
        Self {
            remote_user_id,
            transport,
            state: PeerConnectionState::New,
            remote_stream: None,
            last_renegotiation_reason: None,
            phase: NegotiationPhase::Idle,
            pending_renegotiation: None,
            pending_candidates: Vec::new(),
            applied_candidates: HashSet::new(),
            remote_description_set: false,
            last_remote_offer_nonce: None,
            cached_answer: None,
            connecting_since: now,
            remove_after: None,
            forwarder,
            cancel_token,
        }
    }

    pub(crate) fn remote_user_id(&self) -> &UserId {
        &self.remote_user_id
    }

    pub(crate) fn state(&self) -> PeerConnectionState {
        self.state
    }

    pub(crate) fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub(crate) fn set_remote_stream(&mut self, stream: MediaStream) {
        self.remote_stream = Some(stream);
    }

    pub(crate) fn has_offer_in_flight(&self) -> bool {
        matches!(self.phase, NegotiationPhase::AwaitingAnswer { .. })
    }

    pub(crate) fn info(&self) -> PeerLinkInfo {
        PeerLinkInfo {
            remote_user_id: self.remote_user_id.clone(),
            state: self.state,
            last_renegotiation_reason: self.last_renegotiation_reason,
        }
    }

    /// Start an offer toward the remote peer.
    ///
    /// If an offer is already in flight the request is queued and `None` is
    /// returned; the queued renegotiation starts when the in-flight answer
    /// is applied.
    pub(crate) async fn start_offer(
        &mut self,
        reason: RenegotiationReason,
        timeout: Duration,
        now: Instant,
    ) -> Result<Option<SignalingBody>, NegotiationError> {
        if self.has_offer_in_flight() {
            trace!(
                target: "stage.peering",
                remote_user_id = %self.remote_user_id,
                reason = reason.as_str(),
                "Renegotiation queued behind in-flight offer"
            );
            self.pending_renegotiation = Some(reason);
            return Ok(None);
        }

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;

        let nonce = Uuid::new_v4();
        self.phase = NegotiationPhase::AwaitingAnswer {
            nonce,
            deadline: now + timeout,
        };
        self.last_renegotiation_reason = Some(reason);
        debug!(
            target: "stage.peering",
            remote_user_id = %self.remote_user_id,
            reason = reason.as_str(),
            %nonce,
            "Offer sent"
        );
        Ok(Some(SignalingBody::Offer {
            sdp: offer.sdp,
            nonce,
        }))
    }

    /// Drop the in-flight offer (glare loser path). Any queued renegotiation
    /// stays queued.
    pub(crate) fn abandon_offer(&mut self) {
        if self.has_offer_in_flight() {
            debug!(
                target: "stage.peering",
                remote_user_id = %self.remote_user_id,
                "Abandoning in-flight offer"
            );
            self.phase = NegotiationPhase::Idle;
        }
    }

    /// Apply a remote offer and produce the answer to send back.
    ///
    /// Duplicate delivery of an already-answered offer re-sends the cached
    /// answer without touching the transport.
    pub(crate) async fn accept_offer(
        &mut self,
        sdp: String,
        nonce: Uuid,
    ) -> Result<SignalingBody, NegotiationError> {
        if self.last_remote_offer_nonce == Some(nonce) {
            if let Some(cached) = self.cached_answer.clone() {
                trace!(
                    target: "stage.peering",
                    remote_user_id = %self.remote_user_id,
                    %nonce,
                    "Duplicate offer; re-sending cached answer"
                );
                return Ok(cached);
            }
        }

        self.transport
            .set_remote_description(SessionDescription {
                kind: SdpKind::Offer,
                sdp,
            })
            .await?;
        self.remote_description_set = true;
        self.flush_candidates().await?;

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;

        self.last_remote_offer_nonce = Some(nonce);
        let body = SignalingBody::Answer {
            sdp: answer.sdp,
            nonce,
        };
        self.cached_answer = Some(body.clone());
        debug!(
            target: "stage.peering",
            remote_user_id = %self.remote_user_id,
            %nonce,
            "Offer answered"
        );
        Ok(body)
    }

    /// Apply a remote answer. Returns whether it matched the in-flight
    /// offer; stale or duplicate answers are ignored.
    pub(crate) async fn accept_answer(
        &mut self,
        sdp: String,
        nonce: Uuid,
    ) -> Result<bool, NegotiationError> {
        match self.phase {
            NegotiationPhase::AwaitingAnswer { nonce: expected, .. } if expected == nonce => {
                self.transport
                    .set_remote_description(SessionDescription {
                        kind: SdpKind::Answer,
                        sdp,
                    })
                    .await?;
                self.remote_description_set = true;
                self.flush_candidates().await?;
                self.phase = NegotiationPhase::Idle;
                debug!(
                    target: "stage.peering",
                    remote_user_id = %self.remote_user_id,
                    %nonce,
                    "Answer applied"
                );
                Ok(true)
            }
            _ => {
                trace!(
                    target: "stage.peering",
                    remote_user_id = %self.remote_user_id,
                    %nonce,
                    "Stale or duplicate answer ignored"
                );
                Ok(false)
            }
        }
    }

    /// Apply or buffer a remote candidate.
    ///
    /// Candidates arriving before the remote description are buffered and
    /// applied once it lands; duplicates are no-ops.
    pub(crate) async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.applied_candidates.contains(&candidate) {
            return Ok(());
        }
        if !self.remote_description_set {
            if !self.pending_candidates.contains(&candidate) {
                trace!(
                    target: "stage.peering",
                    remote_user_id = %self.remote_user_id,
                    buffered = self.pending_candidates.len() + 1,
                    "Candidate buffered until remote description is set"
                );
                self.pending_candidates.push(candidate);
            }
            return Ok(());
        }
        self.transport.add_ice_candidate(candidate.clone()).await?;
        self.applied_candidates.insert(candidate);
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<(), NegotiationError> {
        let buffered = std::mem::take(&mut self.pending_candidates);
        for candidate in buffered {
            if self.applied_candidates.contains(&candidate) {
                continue;
            }
            self.transport.add_ice_candidate(candidate.clone()).await?;
            self.applied_candidates.insert(candidate);
        }
        Ok(())
    }

    /// Take the queued renegotiation, if any.
    pub(crate) fn take_pending_renegotiation(&mut self) -> Option<RenegotiationReason> {
        self.pending_renegotiation.take()
    }

    pub(crate) async fn replace_audio(
        &mut self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        self.transport.replace_audio_track(track).await
    }

    pub(crate) async fn replace_video(
        &mut self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        self.transport.replace_video_track(track).await
    }

    pub(crate) fn stats(&self) -> crate::peering::TransportStats {
        self.transport.stats()
    }

    /// Record a transport state change. Grace bookkeeping:
    /// `Failed` links are pruned on the next tick, `Disconnected` links get
    /// the grace period (the transport retries internally).
    pub(crate) fn apply_state(
        &mut self,
        state: PeerConnectionState,
        now: Instant,
        grace: Duration,
    ) -> PeerConnectionState {
        let previous = self.state;
        self.state = state;
        match state {
            PeerConnectionState::Connected => {
                self.remove_after = None;
            }
            PeerConnectionState::Disconnected => {
                if self.remove_after.is_none() {
                    self.remove_after = Some(now + grace);
                }
            }
            PeerConnectionState::Failed => {
                self.remove_after = Some(now);
            }
            _ => {}
        }
        previous
    }

    /// Whether the link should be pruned at `now`.
    pub(crate) fn expired(&self, now: Instant, negotiation_timeout: Duration) -> bool {
        if let Some(at) = self.remove_after {
            if now >= at {
                return true;
            }
        }
        let converging = matches!(
            self.state,
            PeerConnectionState::New | PeerConnectionState::Connecting
        );
        if converging && now >= self.connecting_since + negotiation_timeout {
            warn!(
                target: "stage.peering",
                remote_user_id = %self.remote_user_id,
                error = %NegotiationError::Timeout,
                "Link did not converge in time"
            );
            return true;
        }
        false
    }

    /// Close the transport and stop the event forwarder. Idempotent.
    pub(crate) async fn close(&mut self) {
        self.cancel_token.cancel();
        self.forwarder.abort();
        if self.state != PeerConnectionState::Closed {
            self.state = PeerConnectionState::Closed;
            self.transport.close().await;
            debug!(
                target: "stage.peering",
                remote_user_id = %self.remote_user_id,
                "Link closed"
            );
        }
    }
}
