//! Media control tests: mute toggles, screen-share swap and revert, device
//! switching, and control-message broadcast to the roster.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;
use stage_engine::{
    ConnectionState, ControlPayload, DeviceKind, EventStream, MediaAcquisitionError,
    MediaDeviceInfo, MediaDevices, SdpKind, SignalingBody, StageError, StageEvent, UserId,
};
use stage_test_utils::{
    connected_pair, connected_pair_on, join_request, test_config, MockMediaDevices, SignalingHub,
    TestStage,
};

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

#[tokio::test(start_paused = true)]
async fn test_toggle_audio_round_trips_and_emits_two_controls() {
    let stage = TestStage::spawn();
    stage
        .handle
        .initialize(join_request("s1", "u1"))
        .await
        .unwrap();

    assert!(!stage.handle.toggle_audio().await.unwrap());
    assert!(stage.handle.toggle_audio().await.unwrap());

    let controls = stage.hub.sent_by(&UserId::from("u1"), |b| {
        matches!(
            b,
            SignalingBody::Control {
                payload: ControlPayload::AudioToggle { .. }
            }
        )
    });
    assert_eq!(controls.len(), 2);
    assert_eq!(stage.metrics.snapshot().control_messages_sent, 2);

    // Back where we started, with the capture still running.
    let snapshot = stage.handle.snapshot();
    assert!(snapshot.media_state.audio_enabled);
    let stream = stage.devices.granted_streams()[0].clone();
    assert!(stream.audio_track().unwrap().is_enabled());
    assert!(!stream.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_toggle_video_mutes_without_stopping_capture() {
    let stage = TestStage::spawn();
    stage
        .handle
        .initialize(join_request("s1", "u1"))
        .await
        .unwrap();

    assert!(!stage.handle.toggle_video().await.unwrap());

    let snapshot = stage.handle.snapshot();
    assert!(!snapshot.media_state.video_enabled);
    assert!(snapshot.media_state.audio_enabled);

    // Muting flips the flag; the camera itself keeps running so unmuting is
    // instantaneous.
    let stream = stage.devices.granted_streams()[0].clone();
    assert!(!stream.video_track().unwrap().is_enabled());
    assert!(!stream.is_stopped());
    assert_eq!(stage.registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_without_session_is_invalid_state() {
    let stage = TestStage::spawn();
    let error = stage.handle.toggle_audio().await.unwrap_err();
    assert!(matches!(error, StageError::InvalidState(_)));
}

#[tokio::test(start_paused = true)]
async fn test_screen_share_swaps_and_restores_camera_track() {
    let (sharer, _viewer) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");
    let camera = sharer.devices.granted_streams()[0]
        .video_track()
        .unwrap();

    sharer.handle.start_screen_share().await.unwrap();
    assert!(sharer.handle.snapshot().media_state.screen_sharing);
    assert_eq!(sharer.registry.len(), 2);

    let screen = sharer.devices.last_display_stream().unwrap();
    let screen_track = screen.video_track().unwrap();
    let transport = sharer.peers.transport_for(&u2).unwrap();
    let replaced = transport.video_replacements();
    assert!(Arc::ptr_eq(
        replaced.last().unwrap().as_ref().unwrap(),
        &screen_track
    ));

    sharer.handle.stop_screen_share().await.unwrap();
    let snapshot = sharer.handle.snapshot();
    assert!(!snapshot.media_state.screen_sharing);
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert_eq!(sharer.registry.len(), 1);
    assert!(screen.is_stopped());

    // The camera track came back on the same, still-open connection.
    let replaced = transport.video_replacements();
    assert!(Arc::ptr_eq(
        replaced.last().unwrap().as_ref().unwrap(),
        &camera
    ));
    assert!(!transport.is_closed());

    // Both transitions were announced to peers.
    let controls = sharer.hub.sent_by(&UserId::from("u1"), |b| {
        matches!(
            b,
            SignalingBody::Control {
                payload: ControlPayload::ScreenShareStart | ControlPayload::ScreenShareStop
            }
        )
    });
    assert_eq!(controls.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_screen_share_with_video_muted_reverts_to_no_video() {
    let (sharer, _viewer) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");

    sharer.handle.toggle_video().await.unwrap();
    sharer.handle.start_screen_share().await.unwrap();
    sharer.handle.stop_screen_share().await.unwrap();

    let transport = sharer.peers.transport_for(&u2).unwrap();
    assert!(transport.video_replacements().last().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_active_share_is_noop() {
    let stage = TestStage::spawn();
    stage
        .handle
        .initialize(join_request("s1", "u1"))
        .await
        .unwrap();

    stage.handle.stop_screen_share().await.unwrap();
    assert_eq!(stage.registry.len(), 1);
    assert_eq!(stage.devices.display_media_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_platform_ended_capture_reverts_to_camera() {
    let (sharer, _viewer) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");
    let mut events = sharer.handle.events();

    sharer.handle.start_screen_share().await.unwrap();
    let screen = sharer.devices.last_display_stream().unwrap();

    // The user clicks the platform's own "stop sharing" control; the track
    // ends without the engine asking.
    screen.video_track().unwrap().stop();

    wait_for(|| !sharer.handle.snapshot().media_state.screen_sharing).await;
    assert_eq!(sharer.registry.len(), 1);
    assert!(saw_event(&mut events, |e| matches!(e, StageEvent::ScreenShareEnded)).await);

    let camera = sharer.devices.granted_streams()[0]
        .video_track()
        .unwrap();
    let transport = sharer.peers.transport_for(&u2).unwrap();
    assert!(Arc::ptr_eq(
        transport.video_replacements().last().unwrap().as_ref().unwrap(),
        &camera
    ));

    // An explicit stop after the capture already ended composes as a no-op.
    sharer.handle.stop_screen_share().await.unwrap();
    assert_eq!(sharer.registry.len(), 1);
    assert_eq!(sharer.metrics.snapshot().leak_guard_warnings, 0);
}

#[tokio::test(start_paused = true)]
async fn test_leave_releases_camera_and_screen_streams() {
    let (sharer, _viewer) = connected_pair("s1", "u1", "u2").await;
    sharer.handle.start_screen_share().await.unwrap();
    assert_eq!(sharer.registry.len(), 2);

    sharer.handle.leave().await;

    assert!(sharer.registry.is_empty());
    assert!(sharer.devices.granted_streams()[0].is_stopped());
    assert!(sharer.devices.last_display_stream().unwrap().is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_screen_share_denied_leaves_session_untouched() {
    let hub = SignalingHub::new();
    let devices = MockMediaDevices::denying_display(MediaAcquisitionError::PermissionDenied);
    let stage = TestStage::spawn_with(hub, devices, test_config());
    stage
        .handle
        .initialize(join_request("s1", "u1"))
        .await
        .unwrap();

    let error = stage.handle.start_screen_share().await.unwrap_err();
    assert!(matches!(error, StageError::MediaAcquisition(_)));

    let snapshot = stage.handle.snapshot();
    assert_eq!(snapshot.connection_state, ConnectionState::Connected);
    assert!(!snapshot.media_state.screen_sharing);
    assert_eq!(stage.registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replace_unsupported_falls_back_to_renegotiation() {
    let (sharer, _viewer) = connected_pair("s1", "u1", "u2").await;
    let u1 = UserId::from("u1");
    let u2 = UserId::from("u2");

    sharer.peers.set_refuse_replace(true);
    sharer.handle.start_screen_share().await.unwrap();

    // A fallback offer went out and the viewer answered it; the original
    // connection was never torn down.
    wait_for(|| {
        sharer
            .peers
            .transport_for(&u2)
            .map(|t| t.remote_descriptions().len() == 2)
            .unwrap_or(false)
    })
    .await;
    let offers = sharer
        .hub
        .sent_by(&u1, |b| matches!(b, SignalingBody::Offer { .. }));
    assert_eq!(offers.len(), 1);
    let transport = sharer.peers.transport_for(&u2).unwrap();
    assert_eq!(
        transport.remote_descriptions().last().unwrap().kind,
        SdpKind::Answer
    );
    assert!(!transport.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_device_switch_routes_old_stream_through_registry() {
    let (stage, _viewer) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");
    stage.devices.set_devices(vec![MediaDeviceInfo {
        device_id: "usb-cam-2".to_string(),
        kind: DeviceKind::VideoInput,
        label: "USB Camera".to_string(),
    }]);

    // Mute first; switching devices must not unmute.
    stage.handle.toggle_audio().await.unwrap();
    let old_stream = stage.devices.granted_streams()[0].clone();

    // Pick the target from enumeration, the way the device-switch surface
    // does.
    let available = stage.devices.enumerate_devices().await.unwrap();
    stage
        .handle
        .switch_input_device(available[0].device_id.clone())
        .await
        .unwrap();

    assert_eq!(stage.devices.user_media_calls(), 2);
    assert_eq!(
        stage
            .devices
            .last_constraints()
            .unwrap()
            .device_id
            .as_deref(),
        Some("usb-cam-2")
    );
    assert_eq!(stage.registry.len(), 1);
    assert!(old_stream.is_stopped());

    let new_stream = stage.devices.granted_streams()[1].clone();
    assert!(!new_stream.is_stopped());
    assert!(!new_stream.audio_track().unwrap().is_enabled());
    assert!(!stage.handle.snapshot().media_state.audio_enabled);

    // Peers got the new tracks in place, on the same connection.
    let transport = stage.peers.transport_for(&u2).unwrap();
    assert!(Arc::ptr_eq(
        transport.audio_replacements().last().unwrap().as_ref().unwrap(),
        &new_stream.audio_track().unwrap()
    ));
    assert!(Arc::ptr_eq(
        transport.video_replacements().last().unwrap().as_ref().unwrap(),
        &new_stream.video_track().unwrap()
    ));
    assert!(!transport.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_device_switch_keeps_screen_video_while_sharing() {
    let (stage, _viewer) = connected_pair("s1", "u1", "u2").await;
    let u2 = UserId::from("u2");

    stage.handle.start_screen_share().await.unwrap();
    let transport = stage.peers.transport_for(&u2).unwrap();
    let video_swaps_before = transport.video_replacements().len();

    stage.handle.switch_input_device("usb-cam-2").await.unwrap();

    // Outgoing video stays the screen track; only the microphone moved.
    assert_eq!(transport.video_replacements().len(), video_swaps_before);
    let new_stream = stage.devices.granted_streams()[1].clone();
    assert!(Arc::ptr_eq(
        transport.audio_replacements().last().unwrap().as_ref().unwrap(),
        &new_stream.audio_track().unwrap()
    ));

    // Stopping the share reverts to the camera of the new device.
    stage.handle.stop_screen_share().await.unwrap();
    assert!(Arc::ptr_eq(
        transport.video_replacements().last().unwrap().as_ref().unwrap(),
        &new_stream.video_track().unwrap()
    ));
}

#[tokio::test(start_paused = true)]
async fn test_hand_raise_reaches_the_remote_roster() {
    let (first, second) = connected_pair("s1", "u1", "u2").await;
    let u1 = UserId::from("u1");

    first.handle.set_hand_raised(true).await.unwrap();
    assert!(first.handle.snapshot().hand_raised);
    wait_for(|| {
        second
            .handle
            .snapshot()
            .participants
            .iter()
            .any(|p| p.user_id == u1 && p.hand_raised)
    })
    .await;

    first.handle.set_hand_raised(false).await.unwrap();
    wait_for(|| {
        second
            .handle
            .snapshot()
            .participants
            .iter()
            .any(|p| p.user_id == u1 && !p.hand_raised)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_control_delivery_converges() {
    let hub = SignalingHub::new();
    hub.set_duplicate_delivery(true);
    let (first, second) = connected_pair_on(hub, "s1", "u1", "u2").await;
    let u2 = UserId::from("u2");

    // One toggle, delivered twice: the payload carries the resulting state,
    // so the roster converges instead of double-toggling.
    assert!(!second.handle.toggle_audio().await.unwrap());
    wait_for(|| {
        first
            .handle
            .snapshot()
            .participants
            .iter()
            .any(|p| p.user_id == u2 && !p.audio_enabled)
    })
    .await;
    assert_eq!(
        first
            .hub
            .sent_by(&u2, |b| matches!(b, SignalingBody::Control { .. }))
            .len(),
        1
    );
}
