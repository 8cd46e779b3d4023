//! Scripted peer transports.
//!
//! [`MockPeerFactory`] hands the engine one [`MockPeerTransport`] per remote
//! participant and keeps a handle to each, so tests can drive connection
//! states, remote streams, and trickle candidates, and inspect what the
//! engine did to the transport (descriptions applied, tracks replaced,
//! close calls).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stage_engine::{
    IceCandidate, MediaStream, MediaTrack, NegotiationError, PeerConnectionState, PeerTransport,
    PeerTransportEvent, PeerTransportFactory, SdpKind, SessionDescription, TransportStats, UserId,
};
use tokio::sync::mpsc;

/// Buffer for scripted transport events.
const EVENT_BUFFER: usize = 64;

#[derive(Default)]
struct TransportInner {
    local_descriptions: Vec<SessionDescription>,
    remote_descriptions: Vec<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    audio_replacements: Vec<Option<Arc<MediaTrack>>>,
    video_replacements: Vec<Option<Arc<MediaTrack>>>,
    refuse_replace: bool,
    fail_negotiation: bool,
    rtt_ms: Option<u32>,
    offer_seq: u32,
    closed: bool,
}

/// One scripted transport, observable and drivable from the test.
pub struct MockPeerTransport {
    remote_user_id: UserId,
    events_tx: mpsc::Sender<PeerTransportEvent>,
    inner: Mutex<TransportInner>,
}

impl MockPeerTransport {
    fn new(
        remote_user_id: UserId,
        events_tx: mpsc::Sender<PeerTransportEvent>,
        refuse_replace: bool,
        fail_negotiation: bool,
    ) -> Self {
        Self {
            remote_user_id,
            events_tx,
            inner: Mutex::new(TransportInner {
                refuse_replace,
                fail_negotiation,
                ..TransportInner::default()
            }),
        }
    }

    /// Drive the connection state from the test.
    pub fn emit_state(&self, state: PeerConnectionState) {
        let _ = self
            .events_tx
            .try_send(PeerTransportEvent::ConnectionStateChanged(state));
    }

    /// Deliver a remote stream from the test.
    pub fn emit_remote_stream(&self, stream: MediaStream) {
        let _ = self
            .events_tx
            .try_send(PeerTransportEvent::RemoteStream(stream));
    }

    /// Trickle a locally-gathered candidate from the test.
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let _ = self
            .events_tx
            .try_send(PeerTransportEvent::IceCandidate(candidate));
    }

    /// Simulated round-trip time reported by `stats()`.
    pub fn set_rtt_ms(&self, rtt_ms: Option<u32>) {
        self.lock().rtt_ms = rtt_ms;
    }

    /// Refuse in-place track replacement, forcing the renegotiation
    /// fallback.
    pub fn set_refuse_replace(&self, refuse: bool) {
        self.lock().refuse_replace = refuse;
    }

    /// Fail every offer/answer produced by this transport.
    pub fn set_fail_negotiation(&self, fail: bool) {
        self.lock().fail_negotiation = fail;
    }

    #[must_use]
    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.lock().local_descriptions.clone()
    }

    #[must_use]
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.lock().remote_descriptions.clone()
    }

    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.lock().applied_candidates.clone()
    }

    /// Video tracks the engine swapped in, in order (`None` = video
    /// removed).
    #[must_use]
    pub fn video_replacements(&self) -> Vec<Option<Arc<MediaTrack>>> {
        self.lock().video_replacements.clone()
    }

    #[must_use]
    pub fn audio_replacements(&self) -> Vec<Option<Arc<MediaTrack>>> {
        self.lock().audio_replacements.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(NegotiationError::TransportClosed);
        }
        if inner.fail_negotiation {
            return Err(NegotiationError::SdpRejected(
                "injected negotiation failure".to_string(),
            ));
        }
        inner.offer_seq += 1;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("offer-to-{}-{}", self.remote_user_id, inner.offer_seq),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let inner = self.lock();
        if inner.closed {
            return Err(NegotiationError::TransportClosed);
        }
        if inner.fail_negotiation {
            return Err(NegotiationError::SdpRejected(
                "injected negotiation failure".to_string(),
            ));
        }
        if inner.remote_descriptions.is_empty() {
            return Err(NegotiationError::SdpRejected(
                "answer requested before remote description".to_string(),
            ));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("answer-to-{}", self.remote_user_id),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.lock().local_descriptions.push(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.lock().remote_descriptions.push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut inner = self.lock();
        // The engine must buffer candidates until a description is applied;
        // reaching the transport early is the bug this check surfaces.
        if inner.remote_descriptions.is_empty() {
            return Err(NegotiationError::IceFailure(
                "candidate before remote description".to_string(),
            ));
        }
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    async fn replace_audio_track(
        &self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.lock();
        if inner.refuse_replace {
            return Err(NegotiationError::ReplaceUnsupported);
        }
        inner.audio_replacements.push(track);
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.lock();
        if inner.refuse_replace {
            return Err(NegotiationError::ReplaceUnsupported);
        }
        inner.video_replacements.push(track);
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            rtt_ms: self.lock().rtt_ms,
        }
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

#[derive(Default)]
struct FactoryInner {
    transports: HashMap<UserId, Arc<MockPeerTransport>>,
    created: u32,
    refuse_replace: bool,
    fail_negotiation_for: Vec<UserId>,
}

/// Factory handing out one scripted transport per remote participant.
#[derive(Default)]
pub struct MockPeerFactory {
    inner: Mutex<FactoryInner>,
}

impl MockPeerFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every transport (existing and future) refuse in-place track
    /// replacement.
    pub fn set_refuse_replace(&self, refuse: bool) {
        let mut inner = self.lock();
        inner.refuse_replace = refuse;
        for transport in inner.transports.values() {
            transport.set_refuse_replace(refuse);
        }
    }

    /// Make transports toward one participant fail every offer/answer,
    /// including transports not yet created.
    pub fn fail_negotiation_for(&self, remote_user_id: &UserId) {
        let mut inner = self.lock();
        inner.fail_negotiation_for.push(remote_user_id.clone());
        if let Some(transport) = inner.transports.get(remote_user_id) {
            transport.set_fail_negotiation(true);
        }
    }

    /// The transport created for a participant, if any.
    #[must_use]
    pub fn transport_for(&self, remote_user_id: &UserId) -> Option<Arc<MockPeerTransport>> {
        self.lock().transports.get(remote_user_id).cloned()
    }

    /// Total transports created.
    #[must_use]
    pub fn created_count(&self) -> u32 {
        self.lock().created
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FactoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PeerTransportFactory for MockPeerFactory {
    fn create(
        &self,
        remote_user_id: &UserId,
    ) -> (Arc<dyn PeerTransport>, mpsc::Receiver<PeerTransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let mut inner = self.lock();
        let transport = Arc::new(MockPeerTransport::new(
            remote_user_id.clone(),
            events_tx,
            inner.refuse_replace,
            inner.fail_negotiation_for.contains(remote_user_id),
        ));
        inner
            .transports
            .insert(remote_user_id.clone(), Arc::clone(&transport));
        inner.created += 1;
        (transport, events_rx)
    }
}
