//! `StageOrchestrator` - the top-level session actor.
//!
//! One orchestrator owns at most one stage session at a time and is the only
//! writer of session state. All consumer calls go through the cloneable
//! [`StageHandle`]; the actor's `tokio::select!` loop merges the mailbox,
//! the signaling channel, peer transport events, and a housekeeping tick.
//!
//! # Lifecycle
//!
//! ```text
//! idle -> connecting -> connected <-> reconnecting -> {left, error}
//! ```
//!
//! `initialize` acquires local media and registers it with the resource
//! registry before any network I/O, so every later failure has a known
//! resource to clean up. `leave` is idempotent, doubles as the cancellation
//! signal for an in-flight `initialize`, and always funnels resource release
//! through the registry. Disposing the handle (consumer unmount) cancels the
//! actor, which runs the same teardown.

pub mod messages;
mod reconnect;
mod quality;

use crate::config::StageConfig;
use crate::errors::{MediaAcquisitionError, StageError};
use crate::events::{EventBus, EventStream, StageEvent};
use crate::media::{
    MediaConstraints, MediaDevices, MediaResourceRegistry, MediaStream, OwnerId, StreamPurpose,
    TrackKind,
};
use crate::metrics::{MailboxMonitor, SessionMetrics};
use crate::peering::{
    LinkEvent, LinkTransition, LocalTracks, OutboundSignal, PeerConnectionManager,
    PeerTransportEvent, PeerTransportFactory, RemovedLink, RenegotiationReason,
};
use crate::signaling::{
    ControlPayload, SignalingBody, SignalingChannel, SignalingMessage, SignalingTransport,
    StageMember,
};
use crate::types::{
    ConnectionState, MediaState, NetworkQuality, StageId, StageRole, StreamId, UserId,
};
use messages::{
    ConnectArtifacts, JoinRequest, ParticipantInfo, RejoinArtifacts, StageCommand, StageSnapshot,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// External collaborators the orchestrator drives.
///
/// The registry is shared so the consumer can audit or force-stop capture
/// resources from outside the actor.
#[derive(Clone)]
pub struct StageDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub peers: Arc<dyn PeerTransportFactory>,
    pub registry: Arc<MediaResourceRegistry>,
    pub metrics: Arc<SessionMetrics>,
}

/// Handle to a running [`StageOrchestrator`].
#[derive(Clone)]
pub struct StageHandle {
    sender: mpsc::Sender<StageCommand>,
    state_rx: watch::Receiver<StageSnapshot>,
    events: EventBus,
    cancel_token: CancellationToken,
}

impl StageHandle {
    /// Start a new session. Rejected while a session is already
    /// initializing or active; resolves once the signaling join is
    /// acknowledged.
    pub async fn initialize(&self, request: JoinRequest) -> Result<(), StageError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StageCommand::Initialize {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| StageError::Internal("orchestrator unavailable".to_string()))?;
        rx.await.map_err(|_| StageError::Cancelled)?
    }

    /// End the session, releasing every stream and peer link. Idempotent;
    /// also cancels an in-flight `initialize`.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(StageCommand::Leave { respond_to: tx })
            .await
            .is_err()
        {
            // Actor already stopped; its shutdown path ran the teardown.
            return;
        }
        let _ = rx.await;
    }

    /// Flip the microphone track; returns the new enabled state.
    pub async fn toggle_audio(&self) -> Result<bool, StageError> {
        self.request(|tx| StageCommand::ToggleAudio { respond_to: tx })
            .await
    }

    /// Flip the camera track; returns the new enabled state.
    pub async fn toggle_video(&self) -> Result<bool, StageError> {
        self.request(|tx| StageCommand::ToggleVideo { respond_to: tx })
            .await
    }

    /// Start sharing a second, screen-capture stream.
    pub async fn start_screen_share(&self) -> Result<(), StageError> {
        self.request(|tx| StageCommand::StartScreenShare { respond_to: tx })
            .await
    }

    /// Stop the active screen share, reverting peers to the camera track.
    pub async fn stop_screen_share(&self) -> Result<(), StageError> {
        self.request(|tx| StageCommand::StopScreenShare { respond_to: tx })
            .await
    }

    /// Re-acquire the camera/microphone from a specific input device.
    pub async fn switch_input_device(&self, device_id: impl Into<String>) -> Result<(), StageError> {
        let device_id = device_id.into();
        self.request(|tx| StageCommand::SwitchInputDevice {
            device_id,
            respond_to: tx,
        })
        .await
    }

    /// Raise or lower the local hand.
    pub async fn set_hand_raised(&self, raised: bool) -> Result<(), StageError> {
        self.request(|tx| StageCommand::SetHandRaised {
            raised,
            respond_to: tx,
        })
        .await
    }

    /// Current session read model, available synchronously.
    #[must_use]
    pub fn snapshot(&self) -> StageSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Stop the orchestrator, tearing down any active session. Intended for
    /// consumer unmount.
    pub fn dispose(&self) {
        self.cancel_token.cancel();
    }

    /// Whether the orchestrator has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, StageError>>) -> StageCommand,
    ) -> Result<T, StageError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| StageError::Internal("orchestrator unavailable".to_string()))?;
        rx.await
            .map_err(|_| StageError::Internal("orchestrator dropped the request".to_string()))?
    }
}

/// State owned by the actor for one session instance.
struct Session {
    epoch: u64,
    stage_id: StageId,
    local_user_id: UserId,
    role: StageRole,
    constraints: MediaConstraints,
    owner: OwnerId,
    state: ConnectionState,
    state_reason: Option<String>,
    media_state: MediaState,
    network_quality: NetworkQuality,
    connection_attempts: u32,
    hand_raised: bool,
    local_stream: Option<MediaStream>,
    screen_stream: Option<MediaStream>,
    signaling: Option<SignalingChannel>,
    manager: Option<PeerConnectionManager>,
    links_rx: Option<mpsc::Receiver<LinkEvent>>,
    participants: HashMap<UserId, ParticipantInfo>,
    token: CancellationToken,
    created_at: i64,
}

impl Session {
    /// The tracks currently offered to peers: screen video while sharing,
    /// camera video otherwise.
    fn local_tracks(&self) -> LocalTracks {
        let audio = self.local_stream.as_ref().and_then(MediaStream::audio_track);
        let video = if self.media_state.screen_sharing {
            self.screen_stream.as_ref().and_then(MediaStream::video_track)
        } else {
            self.local_stream.as_ref().and_then(MediaStream::video_track)
        };
        LocalTracks { audio, video }
    }
}

/// The `StageOrchestrator` actor.
pub struct StageOrchestrator {
    config: StageConfig,
    deps: StageDeps,
    receiver: mpsc::Receiver<StageCommand>,
    self_sender: mpsc::Sender<StageCommand>,
    cancel_token: CancellationToken,
    events: EventBus,
    state_tx: watch::Sender<StageSnapshot>,
    metrics: Arc<SessionMetrics>,
    mailbox: MailboxMonitor,
    session: Option<Session>,
    epoch: u64,
}

impl StageOrchestrator {
    /// Spawn the actor.
    ///
    /// Returns a handle and the task join handle.
    #[must_use]
    pub fn spawn(config: StageConfig, deps: StageDeps) -> (StageHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.command_buffer);
        let (state_tx, state_rx) = watch::channel(StageSnapshot::default());
        let events = EventBus::new(config.event_buffer);
        let cancel_token = CancellationToken::new();
        let metrics = Arc::clone(&deps.metrics);

        let actor = Self {
            config,
            deps,
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            events: events.clone(),
            state_tx,
            metrics,
            mailbox: MailboxMonitor::new("stage-orchestrator"),
            session: None,
            epoch: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = StageHandle {
            sender,
            state_rx,
            events,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "stage.orchestrator")]
    async fn run(mut self) {
        info!(target: "stage.orchestrator", "StageOrchestrator started");

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Split the session borrow so signaling and link events can be
            // polled as independent select branches.
            let (signaling, link_events) = match self.session.as_mut() {
                Some(session) => (session.signaling.as_mut(), session.links_rx.as_mut()),
                None => (None, None),
            };

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "stage.orchestrator",
                        "StageOrchestrator received cancellation signal"
                    );
                    self.teardown(ConnectionState::Left, None).await;
                    break;
                }

                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            self.mailbox.record_enqueue();
                            self.handle_command(command).await;
                            self.mailbox.record_dequeue();
                        }
                        None => {
                            info!(
                                target: "stage.orchestrator",
                                "All handles dropped, shutting down"
                            );
                            self.teardown(ConnectionState::Left, None).await;
                            break;
                        }
                    }
                }

                message = Self::recv_signaling(signaling) => {
                    match message {
                        Some(message) => self.handle_signaling(message).await,
                        None => self.handle_signaling_lost().await,
                    }
                }

                event = Self::recv_link_event(link_events) => {
                    match event {
                        Some(event) => self.handle_link_event(event).await,
                        None => {
                            if let Some(session) = &mut self.session {
                                session.links_rx = None;
                            }
                        }
                    }
                }

                _ = tick.tick() => {
                    self.handle_tick().await;
                }
            }
        }

        info!(
            target: "stage.orchestrator",
            messages_processed = self.mailbox.messages_processed(),
            "StageOrchestrator stopped"
        );
    }

    async fn recv_signaling(channel: Option<&mut SignalingChannel>) -> Option<SignalingMessage> {
        match channel {
            Some(channel) => channel.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn recv_link_event(
        events: Option<&mut mpsc::Receiver<LinkEvent>>,
    ) -> Option<LinkEvent> {
        match events {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Handle a single mailbox message.
    async fn handle_command(&mut self, command: StageCommand) {
        match command {
            StageCommand::Initialize {
                request,
                respond_to,
            } => {
                self.handle_initialize(request, respond_to);
            }

            StageCommand::Leave { respond_to } => {
                self.teardown(ConnectionState::Left, None).await;
                let _ = respond_to.send(());
            }

            StageCommand::ToggleAudio { respond_to } => {
                let result = self.handle_toggle(TrackKind::Audio);
                if result.is_ok() {
                    self.publish_snapshot();
                }
                let _ = respond_to.send(result);
            }

            StageCommand::ToggleVideo { respond_to } => {
                let result = self.handle_toggle(TrackKind::Video);
                if result.is_ok() {
                    self.publish_snapshot();
                }
                let _ = respond_to.send(result);
            }

            StageCommand::StartScreenShare { respond_to } => {
                let result = self.handle_start_screen_share().await;
                let _ = respond_to.send(result);
            }

            StageCommand::StopScreenShare { respond_to } => {
                let result = self.revert_screen_share(None, false).await;
                let _ = respond_to.send(result);
            }

            StageCommand::SwitchInputDevice {
                device_id,
                respond_to,
            } => {
                let result = self.handle_switch_device(device_id).await;
                let _ = respond_to.send(result);
            }

            StageCommand::SetHandRaised { raised, respond_to } => {
                let result = self.handle_set_hand_raised(raised);
                let _ = respond_to.send(result);
            }

            StageCommand::ConnectFinished {
                epoch,
                result,
                respond_to,
            } => {
                self.handle_connect_finished(epoch, result, respond_to).await;
            }

            StageCommand::RejoinFinished { epoch, result } => {
                self.handle_rejoin_finished(epoch, result).await;
            }

            StageCommand::ScreenTrackEnded { stream_id } => {
                let _ = self.revert_screen_share(Some(stream_id), true).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    fn handle_initialize(
        &mut self,
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    ) {
        if let Some(session) = &self.session {
            if session.state.is_active() {
                let _ = respond_to.send(Err(StageError::InvalidState(
                    "A session is already initializing or active".to_string(),
                )));
                return;
            }
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let token = self.cancel_token.child_token();
        let owner = OwnerId(format!("{}#{}", request.stage_id, epoch));

        info!(
            target: "stage.orchestrator",
            stage_id = %request.stage_id,
            user_id = %request.user_id,
            role = request.role.as_str(),
            "Initializing stage session"
        );

        self.session = Some(Session {
            epoch,
            stage_id: request.stage_id.clone(),
            local_user_id: request.user_id.clone(),
            role: request.role,
            constraints: request.constraints.clone(),
            owner: owner.clone(),
            state: ConnectionState::Connecting,
            state_reason: None,
            media_state: MediaState::default(),
            network_quality: NetworkQuality::default(),
            connection_attempts: 0,
            hand_raised: false,
            local_stream: None,
            screen_stream: None,
            signaling: None,
            manager: None,
            links_rx: None,
            participants: HashMap::new(),
            token: token.clone(),
            created_at: chrono::Utc::now().timestamp(),
        });
        self.publish_snapshot();
        self.events.publish(StageEvent::StateChanged {
            state: ConnectionState::Connecting,
            reason: None,
        });

        tokio::spawn(run_connect(
            Arc::clone(&self.deps.devices),
            Arc::clone(&self.deps.signaling),
            Arc::clone(&self.deps.registry),
            self.config.join_timeout,
            request,
            owner,
            epoch,
            token,
            self.self_sender.clone(),
            respond_to,
        ));
    }

    async fn handle_connect_finished(
        &mut self,
        epoch: u64,
        result: Result<ConnectArtifacts, StageError>,
        respond_to: oneshot::Sender<Result<(), StageError>>,
    ) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.epoch == epoch && s.state == ConnectionState::Connecting);
        if !current {
            // The session moved on while the attempt was in flight.
            match result {
                Ok(artifacts) => {
                    self.deps.registry.try_release(artifacts.stream.id());
                    artifacts.channel.leave().await;
                    let _ = respond_to.send(Err(StageError::Cancelled));
                }
                Err(error) => {
                    let _ = respond_to.send(Err(error));
                }
            }
            return;
        }

        match result {
            Ok(artifacts) => {
                self.adopt_connection(artifacts).await;
                let _ = respond_to.send(Ok(()));
            }
            Err(error) => {
                warn!(
                    target: "stage.orchestrator",
                    error = %error,
                    error_type = error.error_type_label(),
                    "Session initialization failed"
                );
                self.enter_error(&error).await;
                let _ = respond_to.send(Err(error));
            }
        }
    }

    async fn adopt_connection(&mut self, artifacts: ConnectArtifacts) {
        let ConnectArtifacts {
            stream,
            channel,
            members,
        } = artifacts;

        let outbound = {
            let Some(session) = &mut self.session else {
                return;
            };
            session.media_state = MediaState {
                audio_enabled: stream.audio_track().map(|t| t.is_enabled()).unwrap_or(false),
                video_enabled: stream.video_track().map(|t| t.is_enabled()).unwrap_or(false),
                screen_sharing: false,
            };
            session.local_stream = Some(stream);
            session.signaling = Some(channel);

            let (manager, links_rx) = PeerConnectionManager::new(
                session.local_user_id.clone(),
                Arc::clone(&self.deps.peers),
                Arc::clone(&self.metrics),
                self.config.negotiation_timeout,
                self.config.disconnect_grace_period,
                &session.token,
            );
            session.manager = Some(manager);
            session.links_rx = Some(links_rx);

            session.state = ConnectionState::Connected;
            session.state_reason = None;
            session.connection_attempts = 0;
            session.participants = roster_from(&members);

            if let Some(channel) = &session.signaling {
                channel.broadcast(SignalingBody::Join { role: session.role });
            }

            let local = session.local_tracks();
            match session.manager.as_mut() {
                Some(manager) => manager.connect_to_present_peers(&members, &local).await,
                None => Vec::new(),
            }
        };

        self.dispatch_outbound(outbound);
        self.publish_snapshot();
        self.events.publish(StageEvent::StateChanged {
            state: ConnectionState::Connected,
            reason: None,
        });
        info!(
            target: "stage.orchestrator",
            peers_present = self
                .session
                .as_ref()
                .map(|s| s.participants.len())
                .unwrap_or(0),
            "Stage session connected"
        );
    }

    /// Release every session resource. Idempotent; every exit path funnels
    /// through here and through the registry.
    async fn release_session_resources(&mut self) {
        let Some(session) = &mut self.session else {
            return;
        };
        session.token.cancel();
        self.deps.registry.release_owned(&session.owner);
        session.local_stream = None;
        session.screen_stream = None;

        if let Some(mut manager) = session.manager.take() {
            manager.cleanup().await;
        }
        session.links_rx = None;

        if let Some(channel) = session.signaling.take() {
            channel.broadcast(SignalingBody::Leave);
            channel.leave().await;
        }
        session.participants.clear();
        session.media_state = MediaState::default();
    }

    async fn teardown(&mut self, terminal: ConnectionState, reason: Option<String>) {
        if self.session.is_none() {
            return;
        }
        self.release_session_resources().await;

        let duration_secs = self
            .session
            .as_ref()
            .map(|s| chrono::Utc::now().timestamp() - s.created_at)
            .unwrap_or(0);
        if let Some(session) = &mut self.session {
            session.state = terminal;
            session.state_reason = reason.clone();
        }
        self.publish_snapshot();
        self.session = None;

        self.events.publish(StageEvent::StateChanged {
            state: terminal,
            reason,
        });
        info!(
            target: "stage.orchestrator",
            state = terminal.as_str(),
            duration_secs,
            "Session ended"
        );
    }

    /// Terminal failure: release everything, keep the session as the read
    /// model for the error state.
    async fn enter_error(&mut self, error: &StageError) {
        self.release_session_resources().await;
        let reason = error.user_message();
        if let Some(session) = &mut self.session {
            session.state = ConnectionState::Error;
            session.state_reason = Some(reason.clone());
        }
        self.publish_snapshot();
        self.events.publish(StageEvent::StateChanged {
            state: ConnectionState::Error,
            reason: Some(reason),
        });
    }

    // ------------------------------------------------------------------
    // Media controls
    // ------------------------------------------------------------------

    fn handle_toggle(&mut self, kind: TrackKind) -> Result<bool, StageError> {
        let Some(session) = &mut self.session else {
            return Err(StageError::InvalidState("No active session".to_string()));
        };
        if !session.state.is_active() {
            return Err(StageError::InvalidState(
                "Session is not active".to_string(),
            ));
        }
        let Some(stream) = &session.local_stream else {
            return Err(StageError::InvalidState(
                "Local media is not ready".to_string(),
            ));
        };
        let track = match kind {
            TrackKind::Audio => stream.audio_track(),
            TrackKind::Video => stream.video_track(),
        }
        .ok_or_else(|| {
            StageError::InvalidState(format!("No local {} track", kind.as_str()))
        })?;

        // Flip the enabled flag only; stopping the track would force a
        // renegotiation and a visible capture restart.
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        let payload = match kind {
            TrackKind::Audio => {
                session.media_state.audio_enabled = enabled;
                ControlPayload::AudioToggle { enabled }
            }
            TrackKind::Video => {
                session.media_state.video_enabled = enabled;
                ControlPayload::VideoToggle { enabled }
            }
        };
        if let Some(channel) = &session.signaling {
            channel.broadcast(SignalingBody::Control { payload });
            self.metrics.record_control_message();
        }
        debug!(
            target: "stage.orchestrator",
            kind = kind.as_str(),
            enabled,
            "Local track toggled"
        );
        Ok(enabled)
    }

    async fn handle_start_screen_share(&mut self) -> Result<(), StageError> {
        {
            let Some(session) = &self.session else {
                return Err(StageError::InvalidState("No active session".to_string()));
            };
            if !matches!(
                session.state,
                ConnectionState::Connected | ConnectionState::Reconnecting
            ) {
                return Err(StageError::InvalidState(
                    "Session is not connected".to_string(),
                ));
            }
            if session.media_state.screen_sharing {
                return Ok(());
            }
        }

        let stream = self.deps.devices.get_display_media().await?;
        let track = match stream.video_track() {
            Some(track) => track,
            None => {
                stream.stop_tracks();
                return Err(StageError::MediaAcquisition(
                    MediaAcquisitionError::DeviceUnavailable(
                        "screen capture produced no video track".to_string(),
                    ),
                ));
            }
        };

        let (outbound, removed) = {
            let Some(session) = &mut self.session else {
                stream.stop_tracks();
                return Err(StageError::Cancelled);
            };
            self.deps
                .registry
                .register(stream.clone(), StreamPurpose::ScreenShare, session.owner.clone());
            session.screen_stream = Some(stream.clone());
            session.media_state.screen_sharing = true;

            // Detect the platform's own "stop sharing" control: the track
            // ends without us asking.
            let watcher_token = session.token.child_token();
            let sender = self.self_sender.clone();
            let stream_id = stream.id();
            let ended_track = Arc::clone(&track);
            tokio::spawn(async move {
                tokio::select! {
                    () = watcher_token.cancelled() => {}
                    () = ended_track.ended() => {
                        let _ = sender
                            .send(StageCommand::ScreenTrackEnded { stream_id })
                            .await;
                    }
                }
            });

            if let Some(channel) = &session.signaling {
                channel.broadcast(SignalingBody::Control {
                    payload: ControlPayload::ScreenShareStart,
                });
                self.metrics.record_control_message();
            }

            match session.manager.as_mut() {
                Some(manager) => {
                    manager
                        .replace_outgoing_video(Some(track), RenegotiationReason::ScreenShareStart)
                        .await
                }
                None => (Vec::new(), Vec::new()),
            }
        };

        self.dispatch_outbound(outbound);
        self.emit_removed(removed);
        self.publish_snapshot();
        info!(target: "stage.orchestrator", "Screen share started");
        Ok(())
    }

    /// Stop screen sharing, from the explicit action or from the capture
    /// ending on its own. Both paths compose: whichever runs second finds no
    /// screen stream and is a no-op.
    async fn revert_screen_share(
        &mut self,
        expected: Option<StreamId>,
        via_track_end: bool,
    ) -> Result<(), StageError> {
        let (outbound, removed) = {
            let Some(session) = &mut self.session else {
                return if via_track_end {
                    Ok(())
                } else {
                    Err(StageError::InvalidState("No active session".to_string()))
                };
            };
            let Some(screen) = session.screen_stream.clone() else {
                return Ok(());
            };
            if let Some(id) = expected {
                if id != screen.id() {
                    // End event from an older capture; current share stands.
                    return Ok(());
                }
            }

            session.screen_stream = None;
            session.media_state.screen_sharing = false;
            self.deps.registry.release(screen.id());

            let camera = if session.media_state.video_enabled {
                session.local_stream.as_ref().and_then(MediaStream::video_track)
            } else {
                None
            };
            if let Some(channel) = &session.signaling {
                channel.broadcast(SignalingBody::Control {
                    payload: ControlPayload::ScreenShareStop,
                });
                self.metrics.record_control_message();
            }
            match session.manager.as_mut() {
                Some(manager) => {
                    manager
                        .replace_outgoing_video(camera, RenegotiationReason::ScreenShareStop)
                        .await
                }
                None => (Vec::new(), Vec::new()),
            }
        };

        self.dispatch_outbound(outbound);
        self.emit_removed(removed);
        if via_track_end {
            self.events.publish(StageEvent::ScreenShareEnded);
        }
        self.publish_snapshot();
        info!(
            target: "stage.orchestrator",
            via_track_end,
            "Screen share stopped"
        );
        Ok(())
    }

    async fn handle_switch_device(&mut self, device_id: String) -> Result<(), StageError> {
        let constraints = {
            let Some(session) = &self.session else {
                return Err(StageError::InvalidState("No active session".to_string()));
            };
            if !session.state.is_active() {
                return Err(StageError::InvalidState(
                    "Session is not active".to_string(),
                ));
            }
            if session.local_stream.is_none() {
                return Err(StageError::InvalidState(
                    "Local media is not ready".to_string(),
                ));
            }
            let mut constraints = session.constraints.clone();
            constraints.device_id = Some(device_id.clone());
            constraints
        };

        // Acquire first; on failure the previous stream stays untouched.
        let new_stream = self.deps.devices.get_user_media(&constraints).await?;

        let (outbound, removed) = {
            let Some(session) = &mut self.session else {
                new_stream.stop_tracks();
                return Err(StageError::Cancelled);
            };
            self.deps.registry.register(
                new_stream.clone(),
                StreamPurpose::CameraMic,
                session.owner.clone(),
            );

            // Carry the mute flags over; a device switch is not an unmute.
            if let Some(track) = new_stream.audio_track() {
                track.set_enabled(session.media_state.audio_enabled);
            }
            if let Some(track) = new_stream.video_track() {
                track.set_enabled(session.media_state.video_enabled);
            }

            let previous = session.local_stream.replace(new_stream.clone());
            session.constraints = constraints;

            let audio = new_stream.audio_track();
            // While a share is active the outgoing video stays the screen
            // track; the new camera track takes over on share stop.
            let video = if session.media_state.screen_sharing {
                None
            } else {
                Some(new_stream.video_track())
            };
            let result = match session.manager.as_mut() {
                Some(manager) => {
                    manager
                        .update_local_tracks(audio, video, RenegotiationReason::DeviceSwitch)
                        .await
                }
                None => (Vec::new(), Vec::new()),
            };

            if let Some(previous) = previous {
                self.deps.registry.release(previous.id());
            }
            result
        };

        self.dispatch_outbound(outbound);
        self.emit_removed(removed);
        self.publish_snapshot();
        info!(
            target: "stage.orchestrator",
            device_id = %device_id,
            "Input device switched"
        );
        Ok(())
    }

    fn handle_set_hand_raised(&mut self, raised: bool) -> Result<(), StageError> {
        let Some(session) = &mut self.session else {
            return Err(StageError::InvalidState("No active session".to_string()));
        };
        if !session.state.is_active() {
            return Err(StageError::InvalidState(
                "Session is not active".to_string(),
            ));
        }
        session.hand_raised = raised;
        if let Some(channel) = &session.signaling {
            channel.broadcast(SignalingBody::Control {
                payload: ControlPayload::HandRaise { raised },
            });
            self.metrics.record_control_message();
        }
        self.publish_snapshot();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------

    async fn handle_signaling(&mut self, message: SignalingMessage) {
        let from = message.from_user_id.clone();
        match message.body {
            SignalingBody::Join { role } => {
                let participant = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    let entry = session
                        .participants
                        .entry(from.clone())
                        .or_insert_with(|| ParticipantInfo::joined(from.clone(), role));
                    entry.role = role;
                    entry.clone()
                };
                self.events
                    .publish(StageEvent::ParticipantUpdated { participant });
                self.publish_snapshot();
            }

            SignalingBody::Leave => {
                let removed = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    session.participants.remove(&from);
                    match session.manager.as_mut() {
                        Some(manager) => manager.handle_peer_left(&from).await,
                        None => None,
                    }
                };
                if let Some(gone) = removed {
                    self.emit_removed(vec![gone]);
                }
                self.publish_snapshot();
            }

            SignalingBody::Offer { sdp, nonce } => {
                let result = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    let local = session.local_tracks();
                    match session.manager.as_mut() {
                        Some(manager) => manager.handle_offer(&from, sdp, nonce, &local).await,
                        None => Ok(None),
                    }
                };
                match result {
                    Ok(Some(signal)) => self.dispatch_outbound(vec![signal]),
                    Ok(None) => {}
                    Err(error) => self.contain_negotiation_failure(&from, &error),
                }
            }

            SignalingBody::Answer { sdp, nonce } => {
                let result = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    match session.manager.as_mut() {
                        Some(manager) => manager.handle_answer(&from, sdp, nonce).await,
                        None => Ok(None),
                    }
                };
                match result {
                    Ok(Some(signal)) => self.dispatch_outbound(vec![signal]),
                    Ok(None) => {}
                    Err(error) => self.contain_negotiation_failure(&from, &error),
                }
            }

            SignalingBody::IceCandidate { candidate } => {
                let result = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    let local = session.local_tracks();
                    match session.manager.as_mut() {
                        Some(manager) => manager.handle_candidate(&from, candidate, &local).await,
                        None => Ok(()),
                    }
                };
                if let Err(error) = result {
                    self.contain_negotiation_failure(&from, &error);
                }
            }

            SignalingBody::Control { payload } => {
                let participant = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    // Unordered delivery: a control message may outrun the
                    // join, so materialize the roster entry on demand.
                    let entry = session
                        .participants
                        .entry(from.clone())
                        .or_insert_with(|| ParticipantInfo::joined(from.clone(), StageRole::Audience));
                    match payload {
                        ControlPayload::AudioToggle { enabled } => entry.audio_enabled = enabled,
                        ControlPayload::VideoToggle { enabled } => entry.video_enabled = enabled,
                        ControlPayload::HandRaise { raised } => entry.hand_raised = raised,
                        ControlPayload::ScreenShareStart => entry.screen_sharing = true,
                        ControlPayload::ScreenShareStop => entry.screen_sharing = false,
                    }
                    entry.clone()
                };
                self.events
                    .publish(StageEvent::ParticipantUpdated { participant });
                self.publish_snapshot();
            }
        }
    }

    /// A single peer's negotiation failed; the call continues without it.
    fn contain_negotiation_failure(&mut self, from: &UserId, error: &StageError) {
        warn!(
            target: "stage.orchestrator",
            remote_user_id = %from,
            error = %error,
            "Peer negotiation failed; continuing without that peer"
        );
        self.events.publish(StageEvent::PeerDisconnected {
            user_id: from.clone(),
        });
        self.publish_snapshot();
    }

    async fn handle_signaling_lost(&mut self) {
        let was_connected = {
            let Some(session) = &mut self.session else {
                return;
            };
            session.signaling = None;
            session.state == ConnectionState::Connected
        };
        warn!(
            target: "stage.orchestrator",
            "Signaling channel closed by transport"
        );
        if was_connected {
            self.begin_reconnect("signaling channel lost").await;
        }
    }

    // ------------------------------------------------------------------
    // Peer transport events
    // ------------------------------------------------------------------

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            remote_user_id,
            event,
        } = event;

        match event {
            PeerTransportEvent::ConnectionStateChanged(state) => {
                let transition = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    match session.manager.as_mut() {
                        Some(manager) => {
                            manager.apply_transport_state(&remote_user_id, state).await
                        }
                        None => None,
                    }
                };
                match transition {
                    Some(LinkTransition::Connected) => {
                        self.events.publish(StageEvent::PeerConnected {
                            user_id: remote_user_id.clone(),
                        });
                        self.publish_snapshot();
                    }
                    Some(LinkTransition::Removed(gone)) => {
                        self.emit_removed(vec![gone]);
                        self.publish_snapshot();
                    }
                    None => {}
                }

                let majority_failed = self
                    .session
                    .as_ref()
                    .and_then(|s| s.manager.as_ref())
                    .map(PeerConnectionManager::failed_majority)
                    .unwrap_or(false);
                if majority_failed {
                    self.begin_reconnect("majority of peer links failed").await;
                }
            }

            PeerTransportEvent::IceCandidate(candidate) => {
                let Some(session) = &self.session else {
                    return;
                };
                if let Some(channel) = &session.signaling {
                    channel.send_to(remote_user_id, SignalingBody::IceCandidate { candidate });
                }
            }

            PeerTransportEvent::RemoteStream(stream) => {
                let added = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    match session.manager.as_mut() {
                        Some(manager) => manager.set_remote_stream(&remote_user_id, stream.clone()),
                        None => false,
                    }
                };
                if added {
                    self.events.publish(StageEvent::RemoteStreamAdded {
                        user_id: remote_user_id,
                        stream,
                    });
                    self.publish_snapshot();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping tick
    // ------------------------------------------------------------------

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        let removed = {
            let Some(session) = &mut self.session else {
                return;
            };
            if !session.state.is_active() {
                return;
            }
            match session.manager.as_mut() {
                Some(manager) => manager.tick(now).await,
                None => Vec::new(),
            }
        };
        if !removed.is_empty() {
            self.emit_removed(removed);
            self.publish_snapshot();
        }

        let rtts = self
            .session
            .as_ref()
            .and_then(|s| s.manager.as_ref())
            .map(PeerConnectionManager::connected_rtts);
        if let Some(rtts) = rtts {
            let sampled = quality::derive_quality(&rtts);
            let changed = {
                let Some(session) = &mut self.session else {
                    return;
                };
                if session.network_quality == sampled {
                    false
                } else {
                    session.network_quality = sampled;
                    true
                }
            };
            if changed {
                self.events
                    .publish(StageEvent::NetworkQualityChanged { quality: sampled });
                self.publish_snapshot();
            }
        }
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    async fn begin_reconnect(&mut self, reason: &str) {
        {
            let Some(session) = &mut self.session else {
                return;
            };
            if session.state != ConnectionState::Connected {
                return;
            }
            session.state = ConnectionState::Reconnecting;
            session.state_reason = Some(reason.to_string());
        }
        warn!(
            target: "stage.orchestrator",
            reason,
            "Connection degraded; reconnecting"
        );

        // Drop signaling and links; keep local media so recovery does not
        // flicker the capture indicator.
        let removed = {
            let Some(session) = &mut self.session else {
                return;
            };
            if let Some(channel) = session.signaling.take() {
                channel.leave().await;
            }
            let removed = match session.manager.as_mut() {
                Some(manager) => manager.cleanup().await,
                None => Vec::new(),
            };
            session.participants.clear();
            removed
        };
        self.emit_removed(removed);
        self.publish_snapshot();
        self.events.publish(StageEvent::StateChanged {
            state: ConnectionState::Reconnecting,
            reason: Some(reason.to_string()),
        });

        self.spawn_reconnect_attempt().await;
    }

    async fn spawn_reconnect_attempt(&mut self) {
        let cap = self.config.reconnect_attempt_cap;
        let exhausted = {
            let Some(session) = &mut self.session else {
                return;
            };
            if session.state != ConnectionState::Reconnecting {
                return;
            }
            if session.connection_attempts >= cap {
                true
            } else {
                session.connection_attempts += 1;
                false
            }
        };

        if exhausted {
            let error = StageError::AttemptsExhausted { attempts: cap };
            warn!(
                target: "stage.orchestrator",
                attempts = cap,
                "Reconnect attempts exhausted"
            );
            self.enter_error(&error).await;
            return;
        }

        let (attempt, epoch, stage_id, user_id, token) = {
            let Some(session) = &self.session else {
                return;
            };
            (
                session.connection_attempts,
                session.epoch,
                session.stage_id.clone(),
                session.local_user_id.clone(),
                session.token.child_token(),
            )
        };
        self.metrics.record_reconnect_attempt();
        self.publish_snapshot();

        let delay = reconnect::backoff_delay(
            attempt,
            self.config.reconnect_base_delay,
            self.config.reconnect_max_delay,
        );
        info!(
            target: "stage.orchestrator",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect attempt"
        );

        let transport = Arc::clone(&self.deps.signaling);
        let join_timeout = self.config.join_timeout;
        let mailbox = self.self_sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let result = SignalingChannel::join(transport, stage_id, user_id, join_timeout)
                .await
                .map(|(channel, members)| RejoinArtifacts { channel, members })
                .map_err(StageError::Signaling);

            if let Err(send_error) =
                mailbox.send(StageCommand::RejoinFinished { epoch, result }).await
            {
                if let StageCommand::RejoinFinished {
                    result: Ok(artifacts),
                    ..
                } = send_error.0
                {
                    artifacts.channel.leave().await;
                }
            }
        });
    }

    async fn handle_rejoin_finished(
        &mut self,
        epoch: u64,
        result: Result<RejoinArtifacts, StageError>,
    ) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.epoch == epoch && s.state == ConnectionState::Reconnecting);
        if !current {
            if let Ok(artifacts) = result {
                artifacts.channel.leave().await;
            }
            return;
        }

        match result {
            Ok(RejoinArtifacts { channel, members }) => {
                let outbound = {
                    let Some(session) = &mut self.session else {
                        return;
                    };
                    session.signaling = Some(channel);
                    session.state = ConnectionState::Connected;
                    session.state_reason = None;
                    session.connection_attempts = 0;
                    session.participants = roster_from(&members);
                    if let Some(channel) = &session.signaling {
                        channel.broadcast(SignalingBody::Join { role: session.role });
                    }
                    let local = session.local_tracks();
                    match session.manager.as_mut() {
                        Some(manager) => {
                            manager.connect_to_present_peers(&members, &local).await
                        }
                        None => Vec::new(),
                    }
                };
                self.dispatch_outbound(outbound);
                self.publish_snapshot();
                self.events.publish(StageEvent::StateChanged {
                    state: ConnectionState::Connected,
                    reason: None,
                });
                info!(target: "stage.orchestrator", "Reconnected to stage");
            }
            Err(error) => {
                debug!(
                    target: "stage.orchestrator",
                    error = %error,
                    "Reconnect attempt failed"
                );
                self.spawn_reconnect_attempt().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn dispatch_outbound(&self, outbound: Vec<OutboundSignal>) {
        let Some(channel) = self.session.as_ref().and_then(|s| s.signaling.as_ref()) else {
            return;
        };
        for signal in outbound {
            channel.send_to(signal.to, signal.body);
        }
    }

    fn emit_removed(&mut self, removed: Vec<RemovedLink>) {
        for gone in removed {
            if gone.had_stream {
                self.events.publish(StageEvent::RemoteStreamRemoved {
                    user_id: gone.remote_user_id.clone(),
                });
            }
            self.events.publish(StageEvent::PeerDisconnected {
                user_id: gone.remote_user_id,
            });
        }
    }

    fn publish_snapshot(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let snapshot = StageSnapshot {
            stage_id: Some(session.stage_id.clone()),
            local_user_id: Some(session.local_user_id.clone()),
            local_role: Some(session.role),
            connection_state: session.state,
            state_reason: session.state_reason.clone(),
            media_state: session.media_state,
            network_quality: session.network_quality,
            connection_attempts: session.connection_attempts,
            hand_raised: session.hand_raised,
            participants: session.participants.values().cloned().collect(),
            peer_links: session
                .manager
                .as_ref()
                .map(PeerConnectionManager::link_infos)
                .unwrap_or_default(),
            remote_streams: session
                .manager
                .as_ref()
                .map(PeerConnectionManager::remote_streams)
                .unwrap_or_default(),
        };
        self.state_tx.send_replace(snapshot);
    }
}

fn roster_from(members: &[StageMember]) -> HashMap<UserId, ParticipantInfo> {
    members
        .iter()
        .map(|member| {
            (
                member.user_id.clone(),
                ParticipantInfo::joined(member.user_id.clone(), member.role),
            )
        })
        .collect()
}

/// Connect attempt, run off the actor loop so `leave` can cancel it.
///
/// Local media is acquired and registered before any network I/O. After
/// every await the attempt re-checks cancellation: a media grant or join
/// resolving after `leave` is released immediately, never adopted.
#[allow(clippy::too_many_arguments)]
async fn run_connect(
    devices: Arc<dyn MediaDevices>,
    signaling: Arc<dyn SignalingTransport>,
    registry: Arc<MediaResourceRegistry>,
    join_timeout: Duration,
    request: JoinRequest,
    owner: OwnerId,
    epoch: u64,
    token: CancellationToken,
    mailbox: mpsc::Sender<StageCommand>,
    respond_to: oneshot::Sender<Result<(), StageError>>,
) {
    let result = connect_attempt(
        &devices,
        &signaling,
        &registry,
        join_timeout,
        &request,
        &owner,
        &token,
    )
    .await;

    let command = StageCommand::ConnectFinished {
        epoch,
        result,
        respond_to,
    };
    if let Err(send_error) = mailbox.send(command).await {
        // Actor already stopped; release whatever the attempt acquired.
        if let StageCommand::ConnectFinished {
            result: Ok(artifacts),
            respond_to,
            ..
        } = send_error.0
        {
            registry.try_release(artifacts.stream.id());
            artifacts.channel.leave().await;
            let _ = respond_to.send(Err(StageError::Cancelled));
        }
    }
}

async fn connect_attempt(
    devices: &Arc<dyn MediaDevices>,
    signaling: &Arc<dyn SignalingTransport>,
    registry: &Arc<MediaResourceRegistry>,
    join_timeout: Duration,
    request: &JoinRequest,
    owner: &OwnerId,
    token: &CancellationToken,
) -> Result<ConnectArtifacts, StageError> {
    let stream = devices.get_user_media(&request.constraints).await?;
    if token.is_cancelled() {
        // Late grant after leave: stop it, never adopt it.
        stream.stop_tracks();
        return Err(StageError::Cancelled);
    }
    registry.register(stream.clone(), StreamPurpose::CameraMic, owner.clone());

    let joined = SignalingChannel::join(
        Arc::clone(signaling),
        request.stage_id.clone(),
        request.user_id.clone(),
        join_timeout,
    )
    .await;
    let (channel, members) = match joined {
        Ok(joined) => joined,
        Err(error) => {
            registry.try_release(stream.id());
            return Err(StageError::Signaling(error));
        }
    };

    if token.is_cancelled() {
        channel.leave().await;
        registry.try_release(stream.id());
        return Err(StageError::Cancelled);
    }

    Ok(ConnectArtifacts {
        stream,
        channel,
        members,
    })
}
