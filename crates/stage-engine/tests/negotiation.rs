//! Peer negotiation tests: glare resolution, candidate buffering, tolerance
//! of the transport's at-least-once unordered delivery, and link pruning.
//!
//! The first half drives [`PeerConnectionManager`] directly, where message
//! interleavings can be forced deterministically; the second half runs the
//! same contracts through two full orchestrators on a shared hub.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;
use stage_engine::peering::{LocalTracks, PeerConnectionManager, RenegotiationReason};
use stage_engine::{
    ConnectionState, EventStream, IceCandidate, MediaStream, MediaTrack, PeerConnectionState,
    PeerTransportFactory, SdpKind, SessionMetrics, SignalingBody, StageEvent, StageMember,
    StageRole, TrackKind, UserId,
};
use stage_test_utils::{connected_pair, MockPeerFactory};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn manager_for(
    local: &str,
    factory: &Arc<MockPeerFactory>,
) -> (
    PeerConnectionManager,
    tokio::sync::mpsc::Receiver<stage_engine::peering::LinkEvent>,
) {
    PeerConnectionManager::new(
        UserId::from(local),
        Arc::clone(factory) as Arc<dyn PeerTransportFactory>,
        SessionMetrics::new(),
        Duration::from_secs(5),
        Duration::from_secs(1),
        &CancellationToken::new(),
    )
}

fn camera_tracks() -> LocalTracks {
    LocalTracks {
        audio: Some(MediaTrack::new(TrackKind::Audio, "mic")),
        video: Some(MediaTrack::new(TrackKind::Video, "cam")),
    }
}

fn member(id: &str) -> StageMember {
    StageMember {
        user_id: UserId::from(id),
        role: StageRole::Speaker,
    }
}

fn offer_parts(body: &SignalingBody) -> (String, Uuid) {
    match body {
        SignalingBody::Offer { sdp, nonce } => (sdp.clone(), *nonce),
        other => panic!("expected an offer, got {}", other.kind()),
    }
}

/// Poll until the condition holds (virtual time advances automatically).
async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
    }
    panic!("condition not reached in time");
}

/// Drain the event stream looking for a match, bounded by a virtual-time
/// deadline per event.
async fn saw_event(events: &mut EventStream, pred: impl Fn(&StageEvent) -> bool) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(event)) => {
                if pred(&event) {
                    return true;
                }
            }
            Ok(None) | Err(_) => return false,
        }
    }
}

// ----------------------------------------------------------------------
// Manager-level: forced interleavings
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_glare_resolves_to_single_negotiation() {
    let factory_a = MockPeerFactory::new();
    let factory_b = MockPeerFactory::new();
    let (mut a, _a_events) = manager_for("u1", &factory_a);
    let (mut b, _b_events) = manager_for("u2", &factory_b);
    let tracks = camera_tracks();
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    // Both sides offer simultaneously.
    let a_out = a.connect_to_present_peers(&[member("u2")], &tracks).await;
    let b_out = b.connect_to_present_peers(&[member("u1")], &tracks).await;
    let (a_sdp, a_nonce) = offer_parts(&a_out[0].body);
    let (b_sdp, b_nonce) = offer_parts(&b_out[0].body);

    // The higher id abandons its own offer and answers instead.
    let b_reply = b.handle_offer(&u1, a_sdp, a_nonce, &tracks).await.unwrap();
    let answer = b_reply.expect("higher id must answer the lower id's offer");
    let answer_sdp = match &answer.body {
        SignalingBody::Answer { sdp, nonce } => {
            assert_eq!(*nonce, a_nonce);
            sdp.clone()
        }
        other => panic!("expected an answer, got {}", other.kind()),
    };

    // The lower id keeps its offer and drops the remote one.
    let a_reply = a.handle_offer(&u2, b_sdp, b_nonce, &tracks).await.unwrap();
    assert!(a_reply.is_none(), "lower id must ignore the glared offer");

    let queued = a.handle_answer(&u2, answer_sdp, a_nonce).await.unwrap();
    assert!(queued.is_none());

    // Exactly one link per side, one converged offer/answer pair.
    assert_eq!(a.link_count(), 1);
    assert_eq!(b.link_count(), 1);
    let a_transport = factory_a.transport_for(&u2).unwrap();
    let b_transport = factory_b.transport_for(&u1).unwrap();
    assert_eq!(a_transport.remote_descriptions().len(), 1);
    assert_eq!(a_transport.remote_descriptions()[0].kind, SdpKind::Answer);
    assert_eq!(b_transport.remote_descriptions().len(), 1);
    assert_eq!(b_transport.remote_descriptions()[0].kind, SdpKind::Offer);
}

#[tokio::test]
async fn test_candidate_before_description_is_buffered_then_flushed() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u2", &factory);
    let tracks = camera_tracks();
    let u1 = UserId::from("u1");
    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    };

    // The candidate outran the offer; it must be held, not applied.
    m.handle_candidate(&u1, candidate.clone(), &tracks)
        .await
        .unwrap();
    let transport = factory.transport_for(&u1).unwrap();
    assert!(transport.applied_candidates().is_empty());

    // The offer lands; the buffered candidate is applied with it.
    let reply = m
        .handle_offer(&u1, "offer-sdp".to_string(), Uuid::new_v4(), &tracks)
        .await
        .unwrap();
    assert!(reply.is_some());
    assert_eq!(transport.applied_candidates(), vec![candidate.clone()]);

    // Re-delivery of the same candidate is a no-op.
    m.handle_candidate(&u1, candidate, &tracks).await.unwrap();
    assert_eq!(transport.applied_candidates().len(), 1);
}

#[tokio::test]
async fn test_duplicate_offer_resends_cached_answer() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u2", &factory);
    let tracks = camera_tracks();
    let u1 = UserId::from("u1");
    let nonce = Uuid::new_v4();

    let first = m
        .handle_offer(&u1, "offer-sdp".to_string(), nonce, &tracks)
        .await
        .unwrap()
        .unwrap();
    let second = m
        .handle_offer(&u1, "offer-sdp".to_string(), nonce, &tracks)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.body, second.body);

    // The transport negotiated once; the duplicate never reached it.
    let transport = factory.transport_for(&u1).unwrap();
    assert_eq!(transport.remote_descriptions().len(), 1);
    assert_eq!(transport.local_descriptions().len(), 1);
}

#[tokio::test]
async fn test_stale_and_duplicate_answers_are_ignored() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    let u2 = UserId::from("u2");

    let out = m.connect_to_present_peers(&[member("u2")], &tracks).await;
    let (_, nonce) = offer_parts(&out[0].body);
    let transport = factory.transport_for(&u2).unwrap();

    // Wrong nonce: nothing applied.
    m.handle_answer(&u2, "answer-sdp".to_string(), Uuid::new_v4())
        .await
        .unwrap();
    assert!(transport.remote_descriptions().is_empty());

    // Matching nonce: applied once.
    m.handle_answer(&u2, "answer-sdp".to_string(), nonce)
        .await
        .unwrap();
    assert_eq!(transport.remote_descriptions().len(), 1);

    // Re-delivery of the applied answer: ignored.
    m.handle_answer(&u2, "answer-sdp".to_string(), nonce)
        .await
        .unwrap();
    assert_eq!(transport.remote_descriptions().len(), 1);
}

#[tokio::test]
async fn test_renegotiation_queues_behind_inflight_offer() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    let u2 = UserId::from("u2");

    let out = m.connect_to_present_peers(&[member("u2")], &tracks).await;
    let (_, nonce) = offer_parts(&out[0].body);
    let transport = factory.transport_for(&u2).unwrap();
    transport.set_refuse_replace(true);

    // Replacement falls back to renegotiation, which must queue behind the
    // in-flight initial offer instead of corrupting it.
    let screen = MediaTrack::new(TrackKind::Video, "screen");
    let (outbound, removed) = m
        .replace_outgoing_video(Some(screen), RenegotiationReason::ScreenShareStart)
        .await;
    assert!(outbound.is_empty());
    assert!(removed.is_empty());

    // The answer lands and the queued renegotiation starts.
    let queued = m
        .handle_answer(&u2, "answer-sdp".to_string(), nonce)
        .await
        .unwrap()
        .expect("queued renegotiation must start once the answer applies");
    assert!(matches!(queued.body, SignalingBody::Offer { .. }));
    assert_eq!(transport.local_descriptions().len(), 2);
}

#[tokio::test]
async fn test_negotiation_failure_is_contained_to_that_peer() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    factory.fail_negotiation_for(&UserId::from("u2"));

    let out = m
        .connect_to_present_peers(&[member("u2"), member("u3")], &tracks)
        .await;

    // The failing peer is skipped, the healthy one still gets its offer.
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to, UserId::from("u3"));
    assert_eq!(m.link_count(), 1);
}

#[tokio::test]
async fn test_failed_majority_threshold() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    m.connect_to_present_peers(&[member("u2"), member("u3"), member("u4")], &tracks)
        .await;

    m.apply_transport_state(&UserId::from("u2"), PeerConnectionState::Failed)
        .await;
    assert!(!m.failed_majority(), "1 of 3 is not a majority");

    m.apply_transport_state(&UserId::from("u3"), PeerConnectionState::Failed)
        .await;
    assert!(m.failed_majority(), "2 of 3 is a majority");
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_link_is_pruned_after_grace() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    m.connect_to_present_peers(&[member("u2")], &tracks).await;
    let u2 = UserId::from("u2");

    m.apply_transport_state(&u2, PeerConnectionState::Disconnected)
        .await;
    assert!(
        m.tick(tokio::time::Instant::now()).await.is_empty(),
        "pruned before the grace period"
    );

    tokio::time::advance(Duration::from_secs(2)).await;
    let removed = m.tick(tokio::time::Instant::now()).await;
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].remote_user_id, u2);
    assert!(factory.transport_for(&u2).unwrap().is_closed());
    assert_eq!(m.link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnected_link_escapes_the_grace_deadline() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    m.connect_to_present_peers(&[member("u2")], &tracks).await;
    let u2 = UserId::from("u2");

    m.apply_transport_state(&u2, PeerConnectionState::Disconnected)
        .await;
    m.apply_transport_state(&u2, PeerConnectionState::Connected)
        .await;

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(m.tick(tokio::time::Instant::now()).await.is_empty());
    assert_eq!(m.link_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_negotiation_is_pruned_at_timeout() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    m.connect_to_present_peers(&[member("u2")], &tracks).await;

    // No answer ever arrives; the link never leaves `New`.
    tokio::time::advance(Duration::from_secs(6)).await;
    let removed = m.tick(tokio::time::Instant::now()).await;
    assert_eq!(removed.len(), 1);
    assert_eq!(m.link_count(), 0);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let factory = MockPeerFactory::new();
    let (mut m, _events) = manager_for("u1", &factory);
    let tracks = camera_tracks();
    m.connect_to_present_peers(&[member("u2"), member("u3")], &tracks)
        .await;

    assert_eq!(m.cleanup().await.len(), 2);
    assert_eq!(m.cleanup().await.len(), 0);
    assert!(factory.transport_for(&UserId::from("u2")).unwrap().is_closed());
    assert!(factory.transport_for(&UserId::from("u3")).unwrap().is_closed());
}

// ----------------------------------------------------------------------
// Orchestrator-level: the same contracts end to end
// ----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_two_stages_negotiate_one_offer_answer_pair() {
    let (first, second) = connected_pair("s1", "u1", "u2").await;
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    let offers = second.hub.sent_by(&u2, |b| matches!(b, SignalingBody::Offer { .. }));
    let answers = first.hub.sent_by(&u1, |b| matches!(b, SignalingBody::Answer { .. }));
    assert_eq!(offers.len(), 1);
    assert_eq!(answers.len(), 1);

    // Each side sees the other in its roster and has one connected link.
    assert_eq!(first.handle.snapshot().participants.len(), 1);
    assert_eq!(second.handle.snapshot().participants.len(), 1);
    let links = second.handle.snapshot().peer_links;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].state, PeerConnectionState::Connected);
    assert_eq!(
        links[0].last_renegotiation_reason,
        Some(RenegotiationReason::InitialConnect)
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_stream_surfaces_in_snapshot_and_events() {
    let (first, _second) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");
    let mut events = first.handle.events();

    let remote = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "remote-cam")]);
    first
        .peers
        .transport_for(&u2)
        .unwrap()
        .emit_remote_stream(remote);

    wait_for(|| first.handle.snapshot().remote_streams.contains_key(&u2)).await;
    assert!(
        saw_event(&mut events, |e| matches!(
            e,
            StageEvent::RemoteStreamAdded { user_id, .. } if *user_id == u2
        ))
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_peer_leave_removes_link_and_stream() {
    let (first, second) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");
    first
        .peers
        .transport_for(&u2)
        .unwrap()
        .emit_remote_stream(MediaStream::new(vec![MediaTrack::new(
            TrackKind::Video,
            "remote-cam",
        )]));
    wait_for(|| first.handle.snapshot().remote_streams.contains_key(&u2)).await;
    let mut events = first.handle.events();

    second.handle.leave().await;

    wait_for(|| first.handle.snapshot().participants.is_empty()).await;
    let snapshot = first.handle.snapshot();
    assert!(snapshot.remote_streams.is_empty());
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert!(first.peers.transport_for(&u2).unwrap().is_closed());
    assert!(
        saw_event(&mut events, |e| matches!(
            e,
            StageEvent::RemoteStreamRemoved { user_id } if *user_id == u2
        ))
        .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_peer_is_pruned_without_reconnecting_the_session() {
    let (first, _second) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");

    first
        .peers
        .transport_for(&u2)
        .unwrap()
        .emit_state(PeerConnectionState::Disconnected);

    wait_for(|| first.peers.transport_for(&u2).unwrap().is_closed()).await;
    // One dead peer does not degrade the whole session.
    assert_eq!(
        first.handle.snapshot().connection_state,
        ConnectionState::Connected
    );
    assert_eq!(first.hub.join_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_peer_majority_reconnects_the_session() {
    let (first, _second) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");

    // With a single link, one failure is a majority.
    first
        .peers
        .transport_for(&u2)
        .unwrap()
        .emit_state(PeerConnectionState::Failed);

    wait_for(|| first.hub.join_count() == 3).await;
    wait_for(|| first.handle.snapshot().connection_state == ConnectionState::Connected).await;

    // Recovery re-joined signaling and re-offered, without touching the
    // local capture.
    assert_eq!(first.devices.user_media_calls(), 1);
    assert_eq!(first.peers.created_count(), 2);
    assert_eq!(first.metrics.snapshot().reconnect_attempts, 1);
    assert_eq!(first.handle.snapshot().connection_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_applies_candidates_once() {
    let hub = stage_test_utils::SignalingHub::new();
    hub.set_duplicate_delivery(true);
    let (first, second) = stage_test_utils::connected_pair_on(hub, "s1", "u1", "u2").await;
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    // A candidate gathered on the second side trickles to the first, twice.
    second
        .peers
        .transport_for(&u1)
        .unwrap()
        .emit_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        });

    wait_for(|| {
        !first
            .peers
            .transport_for(&u2)
            .map(|t| t.applied_candidates().is_empty())
            .unwrap_or(true)
    })
    .await;
    // Let the duplicate copy arrive too before asserting.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        first
            .peers
            .transport_for(&u2)
            .unwrap()
            .applied_candidates()
            .len(),
        1
    );
}
