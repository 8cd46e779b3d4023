//! Owns the set of peer links for one stage session.
//!
//! The manager creates links reactively (presence, inbound offers, early
//! candidates), resolves glare deterministically, and prunes dead links so
//! the read model never dangles a failed or closed link. It never sends on
//! the signaling channel itself; negotiation methods return the messages to
//! send, and the orchestrator dispatches them.

use crate::errors::{NegotiationError, StageError};
use crate::media::{MediaStream, MediaTrack};
use crate::metrics::SessionMetrics;
use crate::peering::link::{PeerLink, PeerLinkInfo, RenegotiationReason};
use crate::peering::{
    IceCandidate, LinkEvent, LocalTracks, PeerConnectionState, PeerTransportEvent,
    PeerTransportFactory,
};
use crate::signaling::{SignalingBody, StageMember};
use crate::types::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Buffer for the merged link event stream.
const LINK_EVENT_BUFFER: usize = 256;

/// A signaling payload the orchestrator must dispatch.
#[derive(Debug)]
pub struct OutboundSignal {
    pub to: UserId,
    pub body: SignalingBody,
}

/// A link that was pruned from the active map.
#[derive(Debug, Clone)]
pub struct RemovedLink {
    pub remote_user_id: UserId,
    /// Whether the link had delivered a remote stream, so the orchestrator
    /// can emit the matching stream-removed event.
    pub had_stream: bool,
}

/// Result of applying a transport state change.
#[derive(Debug)]
pub enum LinkTransition {
    /// The link reached `Connected` for the first time since (re)connecting.
    Connected,
    /// The link was removed from the active map.
    Removed(RemovedLink),
}

/// Maintains one [`PeerLink`] per remote participant.
pub struct PeerConnectionManager {
    local_user_id: UserId,
    factory: Arc<dyn PeerTransportFactory>,
    links: HashMap<UserId, PeerLink>,
    events_tx: mpsc::Sender<LinkEvent>,
    negotiation_timeout: Duration,
    disconnect_grace: Duration,
    cancel_token: CancellationToken,
    metrics: Arc<SessionMetrics>,
}

impl PeerConnectionManager {
    /// Create a manager and the merged event stream its links feed.
    #[must_use]
    pub fn new(
        local_user_id: UserId,
        factory: Arc<dyn PeerTransportFactory>,
        metrics: Arc<SessionMetrics>,
        negotiation_timeout: Duration,
        disconnect_grace: Duration,
        parent_token: &CancellationToken,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        (
            Self {
                local_user_id,
                factory,
                links: HashMap::new(),
                events_tx,
                negotiation_timeout,
                disconnect_grace,
                cancel_token: parent_token.child_token(),
                metrics,
            },
            events_rx,
        )
    }

    /// Offer to every present participant not yet linked.
    ///
    /// Per-peer failures are contained: the failing link is dropped and the
    /// remaining offers still go out.
    pub async fn connect_to_present_peers(
        &mut self,
        members: &[StageMember],
        local: &LocalTracks,
    ) -> Vec<OutboundSignal> {
        let now = Instant::now();
        let timeout = self.negotiation_timeout;
        let mut outbound = Vec::new();

        for member in members {
            if member.user_id == self.local_user_id || self.links.contains_key(&member.user_id) {
                continue;
            }
            if let Err(error) = self.ensure_link(&member.user_id, local).await {
                warn!(
                    target: "stage.peering",
                    remote_user_id = %member.user_id,
                    error = %error,
                    "Could not create link; peer skipped"
                );
                continue;
            }
            let result = match self.links.get_mut(&member.user_id) {
                Some(link) => {
                    link.start_offer(RenegotiationReason::InitialConnect, timeout, now)
                        .await
                }
                None => continue,
            };
            match result {
                Ok(Some(body)) => {
                    self.metrics.record_renegotiation();
                    outbound.push(OutboundSignal {
                        to: member.user_id.clone(),
                        body,
                    });
                }
                Ok(None) => {}
                Err(source) => {
                    let error = self.fail_link(&member.user_id, source).await;
                    warn!(
                        target: "stage.peering",
                        remote_user_id = %member.user_id,
                        error = %error,
                        "Initial offer failed; peer skipped"
                    );
                }
            }
        }
        outbound
    }

    /// Apply a remote offer, resolving glare deterministically.
    ///
    /// When both sides have offers in flight, the lower user id keeps the
    /// offerer role: its offer stands and the remote one is ignored here,
    /// while the higher id abandons its own offer and answers instead.
    pub async fn handle_offer(
        &mut self,
        from: &UserId,
        sdp: String,
        nonce: Uuid,
        local: &LocalTracks,
    ) -> Result<Option<OutboundSignal>, StageError> {
        self.ensure_link(from, local).await?;

        let local_id = self.local_user_id.clone();
        let local_offer_wins = {
            let Some(link) = self.links.get_mut(from) else {
                return Ok(None);
            };
            if link.has_offer_in_flight() {
                if local_id < *from {
                    true
                } else {
                    link.abandon_offer();
                    false
                }
            } else {
                false
            }
        };
        if local_offer_wins {
            debug!(
                target: "stage.peering",
                remote_user_id = %from,
                "Glare: local offer wins, remote offer dropped"
            );
            return Ok(None);
        }

        let result = match self.links.get_mut(from) {
            Some(link) => link.accept_offer(sdp, nonce).await,
            None => return Ok(None),
        };
        match result {
            Ok(body) => Ok(Some(OutboundSignal {
                to: from.clone(),
                body,
            })),
            Err(source) => Err(self.fail_link(from, source).await),
        }
    }

    /// Apply a remote answer; stale nonces are ignored. May yield a queued
    /// renegotiation offer to dispatch.
    pub async fn handle_answer(
        &mut self,
        from: &UserId,
        sdp: String,
        nonce: Uuid,
    ) -> Result<Option<OutboundSignal>, StageError> {
        let timeout = self.negotiation_timeout;
        let now = Instant::now();

        let result = match self.links.get_mut(from) {
            Some(link) => match link.accept_answer(sdp, nonce).await {
                Ok(true) => match link.take_pending_renegotiation() {
                    Some(reason) => link.start_offer(reason, timeout, now).await,
                    None => Ok(None),
                },
                Ok(false) => Ok(None),
                Err(source) => Err(source),
            },
            None => return Ok(None),
        };
        match result {
            Ok(Some(body)) => {
                self.metrics.record_renegotiation();
                Ok(Some(OutboundSignal {
                    to: from.clone(),
                    body,
                }))
            }
            Ok(None) => Ok(None),
            Err(source) => Err(self.fail_link(from, source).await),
        }
    }

    /// Apply or buffer a remote candidate. Creates the link if the candidate
    /// outran the offer (delivery is unordered).
    pub async fn handle_candidate(
        &mut self,
        from: &UserId,
        candidate: IceCandidate,
        local: &LocalTracks,
    ) -> Result<(), StageError> {
        self.ensure_link(from, local).await?;
        let result = match self.links.get_mut(from) {
            Some(link) => link.add_remote_candidate(candidate).await,
            None => Ok(()),
        };
        match result {
            Ok(()) => Ok(()),
            Err(source) => Err(self.fail_link(from, source).await),
        }
    }

    /// Record a delivered remote stream. Returns `false` when the link no
    /// longer exists.
    pub fn set_remote_stream(&mut self, from: &UserId, stream: MediaStream) -> bool {
        match self.links.get_mut(from) {
            Some(link) => {
                link.set_remote_stream(stream);
                true
            }
            None => false,
        }
    }

    /// Apply a transport connection-state change.
    pub async fn apply_transport_state(
        &mut self,
        from: &UserId,
        state: PeerConnectionState,
    ) -> Option<LinkTransition> {
        if state == PeerConnectionState::Closed {
            return self.remove_link(from).await.map(LinkTransition::Removed);
        }
        let now = Instant::now();
        let grace = self.disconnect_grace;
        let link = self.links.get_mut(from)?;
        let previous = link.apply_state(state, now, grace);
        debug!(
            target: "stage.peering",
            remote_user_id = %from,
            from_state = previous.as_str(),
            to_state = state.as_str(),
            "Link state changed"
        );
        if state == PeerConnectionState::Connected && previous != PeerConnectionState::Connected {
            Some(LinkTransition::Connected)
        } else {
            None
        }
    }

    /// Swap the outgoing video track on every link, falling back to a
    /// (queued) renegotiation where the transport cannot swap in place.
    pub async fn replace_outgoing_video(
        &mut self,
        track: Option<Arc<MediaTrack>>,
        reason: RenegotiationReason,
    ) -> (Vec<OutboundSignal>, Vec<RemovedLink>) {
        self.replace_tracks(None, Some(track), reason).await
    }

    /// Swap the outgoing audio track on every link, and optionally the video
    /// track too (device switch keeps the screen track when a share is
    /// active, so video replacement is conditional).
    pub async fn update_local_tracks(
        &mut self,
        audio: Option<Arc<MediaTrack>>,
        video: Option<Option<Arc<MediaTrack>>>,
        reason: RenegotiationReason,
    ) -> (Vec<OutboundSignal>, Vec<RemovedLink>) {
        self.replace_tracks(Some(audio), video, reason).await
    }

    async fn replace_tracks(
        &mut self,
        audio: Option<Option<Arc<MediaTrack>>>,
        video: Option<Option<Arc<MediaTrack>>>,
        reason: RenegotiationReason,
    ) -> (Vec<OutboundSignal>, Vec<RemovedLink>) {
        let now = Instant::now();
        let timeout = self.negotiation_timeout;
        let ids: Vec<UserId> = self.links.keys().cloned().collect();
        let mut outbound = Vec::new();
        let mut removed = Vec::new();

        for id in ids {
            let result = match self.links.get_mut(&id) {
                Some(link) => {
                    let mut result = Ok(());
                    if let Some(track) = audio.clone() {
                        result = link.replace_audio(track).await;
                    }
                    if result.is_ok() {
                        if let Some(track) = video.clone() {
                            result = link.replace_video(track).await;
                        }
                    }
                    result
                }
                None => continue,
            };
            match result {
                Ok(()) => {}
                Err(NegotiationError::ReplaceUnsupported) => {
                    let offer = match self.links.get_mut(&id) {
                        Some(link) => link.start_offer(reason, timeout, now).await,
                        None => continue,
                    };
                    match offer {
                        Ok(Some(body)) => {
                            self.metrics.record_renegotiation();
                            outbound.push(OutboundSignal {
                                to: id.clone(),
                                body,
                            });
                        }
                        Ok(None) => {}
                        Err(source) => {
                            warn!(
                                target: "stage.peering",
                                remote_user_id = %id,
                                error = %source,
                                "Fallback renegotiation failed; link removed"
                            );
                            if let Some(gone) = self.remove_link(&id).await {
                                removed.push(gone);
                            }
                        }
                    }
                }
                Err(source) => {
                    warn!(
                        target: "stage.peering",
                        remote_user_id = %id,
                        error = %source,
                        "Track replacement failed; link removed"
                    );
                    if let Some(gone) = self.remove_link(&id).await {
                        removed.push(gone);
                    }
                }
            }
        }
        (outbound, removed)
    }

    /// Remove the link for a participant that left.
    pub async fn handle_peer_left(&mut self, from: &UserId) -> Option<RemovedLink> {
        self.remove_link(from).await
    }

    /// Prune links past their grace deadline or stuck in negotiation.
    pub async fn tick(&mut self, now: Instant) -> Vec<RemovedLink> {
        let negotiation_timeout = self.negotiation_timeout;
        let expired: Vec<UserId> = self
            .links
            .iter()
            .filter(|(_, link)| link.expired(now, negotiation_timeout))
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in expired {
            if let Some(gone) = self.remove_link(&id).await {
                removed.push(gone);
            }
        }
        removed
    }

    /// Close every link and clear the map. Idempotent.
    pub async fn cleanup(&mut self) -> Vec<RemovedLink> {
        let ids: Vec<UserId> = self.links.keys().cloned().collect();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(gone) = self.remove_link(&id).await {
                removed.push(gone);
            }
        }
        removed
    }

    /// Whether strictly more than half of the active links have failed.
    #[must_use]
    pub fn failed_majority(&self) -> bool {
        let total = self.links.len();
        if total == 0 {
            return false;
        }
        let failed = self
            .links
            .values()
            .filter(|link| link.state() == PeerConnectionState::Failed)
            .count();
        failed * 2 > total
    }

    /// Remote streams currently delivered, keyed by participant.
    #[must_use]
    pub fn remote_streams(&self) -> HashMap<UserId, MediaStream> {
        self.links
            .iter()
            .filter_map(|(id, link)| {
                link.remote_stream()
                    .map(|stream| (id.clone(), stream.clone()))
            })
            .collect()
    }

    /// Read model of every active link.
    #[must_use]
    pub fn link_infos(&self) -> Vec<PeerLinkInfo> {
        self.links.values().map(PeerLink::info).collect()
    }

    /// Number of active links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Round-trip times of connected links, for quality sampling.
    #[must_use]
    pub fn connected_rtts(&self) -> Vec<u32> {
        self.links
            .values()
            .filter(|link| link.state() == PeerConnectionState::Connected)
            .filter_map(|link| link.stats().rtt_ms)
            .collect()
    }

    async fn ensure_link(&mut self, remote: &UserId, local: &LocalTracks) -> Result<(), StageError> {
        if self.links.contains_key(remote) {
            return Ok(());
        }

        let (transport, events) = self.factory.create(remote);
        let token = self.cancel_token.child_token();
        let forwarder = spawn_forwarder(
            remote.clone(),
            events,
            self.events_tx.clone(),
            token.clone(),
        );
        let link = PeerLink::new(remote.clone(), transport, forwarder, token, Instant::now());
        self.links.insert(remote.clone(), link);
        self.metrics.record_peer_linked();

        let attach = match self.links.get_mut(remote) {
            Some(link) => match link.replace_audio(local.audio.clone()).await {
                Ok(()) => link.replace_video(local.video.clone()).await,
                Err(source) => Err(source),
            },
            None => Ok(()),
        };
        if let Err(source) = attach {
            return Err(self.fail_link(remote, source).await);
        }

        debug!(
            target: "stage.peering",
            remote_user_id = %remote,
            "Peer link created"
        );
        Ok(())
    }

    async fn fail_link(&mut self, remote: &UserId, source: NegotiationError) -> StageError {
        warn!(
            target: "stage.peering",
            remote_user_id = %remote,
            error = %source,
            "Negotiation failed; link removed"
        );
        self.remove_link(remote).await;
        StageError::Negotiation {
            remote_user_id: remote.clone(),
            source,
        }
    }

    async fn remove_link(&mut self, remote: &UserId) -> Option<RemovedLink> {
        let mut link = self.links.remove(remote)?;
        let had_stream = link.remote_stream().is_some();
        link.close().await;
        self.metrics.record_peer_unlinked();
        Some(RemovedLink {
            remote_user_id: remote.clone(),
            had_stream,
        })
    }
}

/// Forward transport events into the manager's merged stream, tagged with
/// the link's participant, until the link is cancelled.
fn spawn_forwarder(
    remote_user_id: UserId,
    mut events: mpsc::Receiver<PeerTransportEvent>,
    events_tx: mpsc::Sender<LinkEvent>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            let tagged = LinkEvent {
                                remote_user_id: remote_user_id.clone(),
                                event,
                            };
                            if events_tx.send(tagged).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    })
}
