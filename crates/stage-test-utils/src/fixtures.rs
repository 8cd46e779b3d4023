//! Pre-wired orchestrators and request builders.

use crate::hub::SignalingHub;
use crate::mock_media::MockMediaDevices;
use crate::mock_peer::MockPeerFactory;
use std::sync::Arc;
use std::time::Duration;
use stage_engine::{
    JoinRequest, MediaConstraints, MediaResourceRegistry, PeerConnectionState, SessionMetrics,
    StageConfig, StageDeps, StageHandle, StageId, StageOrchestrator, StageRole, UserId,
};
use tokio::task::JoinHandle;

/// A config with short timeouts suited to paused-time tests.
#[must_use]
pub fn test_config() -> StageConfig {
    StageConfig {
        join_timeout: Duration::from_secs(2),
        negotiation_timeout: Duration::from_secs(5),
        disconnect_grace_period: Duration::from_secs(1),
        reconnect_base_delay: Duration::from_millis(100),
        reconnect_max_delay: Duration::from_secs(2),
        tick_interval: Duration::from_millis(200),
        ..StageConfig::default()
    }
}

/// A join request with both capture kinds enabled.
#[must_use]
pub fn join_request(stage_id: &str, user_id: &str) -> JoinRequest {
    JoinRequest {
        stage_id: StageId::from(stage_id),
        user_id: UserId::from(user_id),
        role: StageRole::Speaker,
        constraints: MediaConstraints {
            audio: true,
            video: true,
            device_id: None,
        },
    }
}

/// One orchestrator with all of its mocks, ready to drive.
pub struct TestStage {
    pub handle: StageHandle,
    pub task: JoinHandle<()>,
    pub hub: Arc<SignalingHub>,
    pub devices: Arc<MockMediaDevices>,
    pub peers: Arc<MockPeerFactory>,
    pub registry: Arc<MediaResourceRegistry>,
    pub metrics: Arc<SessionMetrics>,
}

impl TestStage {
    /// Spawn an orchestrator on a fresh hub with granting devices.
    #[must_use]
    pub fn spawn() -> Self {
        Self::spawn_on(SignalingHub::new())
    }

    /// Spawn an orchestrator on a shared hub (multi-participant tests).
    #[must_use]
    pub fn spawn_on(hub: Arc<SignalingHub>) -> Self {
        Self::spawn_with(hub, MockMediaDevices::granting(), test_config())
    }

    /// Spawn with explicit devices and config.
    #[must_use]
    pub fn spawn_with(
        hub: Arc<SignalingHub>,
        devices: Arc<MockMediaDevices>,
        config: StageConfig,
    ) -> Self {
        let metrics = SessionMetrics::new();
        let registry = MediaResourceRegistry::new(Arc::clone(&metrics));
        let peers = MockPeerFactory::new();
        let deps = StageDeps {
            devices: Arc::clone(&devices) as Arc<dyn stage_engine::MediaDevices>,
            signaling: Arc::clone(&hub) as Arc<dyn stage_engine::SignalingTransport>,
            peers: Arc::clone(&peers) as Arc<dyn stage_engine::PeerTransportFactory>,
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
        };
        let (handle, task) = StageOrchestrator::spawn(config, deps);
        Self {
            handle,
            task,
            hub,
            devices,
            peers,
            registry,
            metrics,
        }
    }
}

/// Two orchestrators on a fresh hub, linked to each other with both
/// transports driven to `Connected`. The first joins an empty stage; the
/// second joins and offers to the first.
pub async fn connected_pair(stage_id: &str, first_user: &str, second_user: &str) -> (TestStage, TestStage) {
    connected_pair_on(SignalingHub::new(), stage_id, first_user, second_user).await
}

/// Like [`connected_pair`] but on a caller-provided hub (e.g. one with
/// duplicate delivery enabled).
pub async fn connected_pair_on(
    hub: Arc<SignalingHub>,
    stage_id: &str,
    first_user: &str,
    second_user: &str,
) -> (TestStage, TestStage) {
    let first = TestStage::spawn_on(Arc::clone(&hub));
    first
        .handle
        .initialize(join_request(stage_id, first_user))
        .await
        .expect("first participant failed to join");

    let second = TestStage::spawn_on(hub);
    second
        .handle
        .initialize(join_request(stage_id, second_user))
        .await
        .expect("second participant failed to join");

    // The second participant offers to the first; wait until its answer has
    // been applied, which also means the first side's transport exists.
    let first_id = UserId::from(first_user);
    let second_id = UserId::from(second_user);
    for _ in 0..300 {
        let converged = second
            .peers
            .transport_for(&first_id)
            .map(|t| !t.remote_descriptions().is_empty())
            .unwrap_or(false);
        if converged {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
    }

    let offerer = second
        .peers
        .transport_for(&first_id)
        .expect("offerer transport missing");
    let answerer = first
        .peers
        .transport_for(&second_id)
        .expect("answerer transport missing");
    assert!(
        !offerer.remote_descriptions().is_empty(),
        "offer/answer exchange did not converge"
    );
    offerer.emit_state(PeerConnectionState::Connected);
    answerer.emit_state(PeerConnectionState::Connected);

    // Let the state-change events land in both actors.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
    }

    (first, second)
}
