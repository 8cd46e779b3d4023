//! In-memory signaling hub.
//!
//! Implements [`SignalingTransport`] for any number of clients: each joined
//! participant gets an inbound queue, and every sent message fans out to the
//! other participants of its stage. The hub deliberately reproduces the
//! transport contract the engine must tolerate - at-least-once delivery
//! (optional duplicate mode), no cross-sender ordering, and abrupt
//! disconnects (closing a participant's queue).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stage_engine::{
    JoinAck, SignalingBody, SignalingError, SignalingMessage, SignalingTransport, StageId,
    StageMember, StageRole, UserId,
};
use tokio::sync::mpsc;

/// Per-subscriber inbound queue size.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct HubInner {
    /// Subscribed senders per stage.
    stages: HashMap<StageId, HashMap<UserId, mpsc::Sender<SignalingMessage>>>,
    /// Last role observed per participant (from their join broadcast).
    roles: HashMap<(StageId, UserId), StageRole>,
    /// Every message ever sent through the hub.
    sent_log: Vec<SignalingMessage>,
    /// Number of joins that should fail before joins succeed again.
    fail_next_joins: u32,
    /// When set, joins never resolve (for timeout tests).
    hold_joins: bool,
    /// Deliver every message twice.
    duplicate_delivery: bool,
    join_count: u32,
}

/// Shared in-memory signaling fabric for tests.
#[derive(Clone, Default)]
pub struct SignalingHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SignalingHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` joins fail with an unreachable error.
    pub fn fail_next_joins(&self, count: u32) {
        self.lock().fail_next_joins = count;
    }

    /// Hold every join forever (until unset), for join-timeout tests.
    pub fn set_hold_joins(&self, hold: bool) {
        self.lock().hold_joins = hold;
    }

    /// Deliver every message twice, exercising duplicate tolerance.
    pub fn set_duplicate_delivery(&self, duplicate: bool) {
        self.lock().duplicate_delivery = duplicate;
    }

    /// Abruptly drop a participant's subscription, closing its inbound
    /// stream without a leave. The engine sees a disconnect.
    pub fn disconnect(&self, stage_id: &StageId, user_id: &UserId) {
        let mut inner = self.lock();
        if let Some(stage) = inner.stages.get_mut(stage_id) {
            stage.remove(user_id);
        }
    }

    /// Whether a participant is currently subscribed.
    #[must_use]
    pub fn is_joined(&self, stage_id: &StageId, user_id: &UserId) -> bool {
        self.lock()
            .stages
            .get(stage_id)
            .is_some_and(|stage| stage.contains_key(user_id))
    }

    /// Total successful joins.
    #[must_use]
    pub fn join_count(&self) -> u32 {
        self.lock().join_count
    }

    /// All messages sent through the hub, in send order.
    #[must_use]
    pub fn sent_messages(&self) -> Vec<SignalingMessage> {
        self.lock().sent_log.clone()
    }

    /// Sent messages from one user matching a predicate.
    #[must_use]
    pub fn sent_by(
        &self,
        user_id: &UserId,
        predicate: impl Fn(&SignalingBody) -> bool,
    ) -> Vec<SignalingMessage> {
        self.lock()
            .sent_log
            .iter()
            .filter(|m| m.from_user_id == *user_id && predicate(&m.body))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl SignalingTransport for SignalingHub {
    async fn join(
        &self,
        stage_id: &StageId,
        user_id: &UserId,
    ) -> Result<JoinAck, SignalingError> {
        loop {
            {
                let mut inner = self.lock();
                if !inner.hold_joins {
                    if inner.fail_next_joins > 0 {
                        inner.fail_next_joins -= 1;
                        return Err(SignalingError::Unreachable(
                            "injected join failure".to_string(),
                        ));
                    }

                    let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                    let members: Vec<StageMember> = inner
                        .stages
                        .get(stage_id)
                        .map(|stage| {
                            stage
                                .keys()
                                .filter(|present| *present != user_id)
                                .map(|present| StageMember {
                                    user_id: present.clone(),
                                    role: inner
                                        .roles
                                        .get(&(stage_id.clone(), present.clone()))
                                        .copied()
                                        .unwrap_or(StageRole::Audience),
                                })
                                .collect()
                        })
                        .unwrap_or_default();

                    inner
                        .stages
                        .entry(stage_id.clone())
                        .or_default()
                        .insert(user_id.clone(), tx);
                    inner.join_count += 1;
                    return Ok(JoinAck {
                        members,
                        incoming: rx,
                    });
                }
            }
            // Held joins poll until released; timeout tests advance past the
            // caller's deadline instead.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    fn send(&self, message: SignalingMessage) {
        let mut inner = self.lock();
        if let SignalingBody::Join { role } = &message.body {
            inner.roles.insert(
                (message.stage_id.clone(), message.from_user_id.clone()),
                *role,
            );
        }
        inner.sent_log.push(message.clone());

        let copies = if inner.duplicate_delivery { 2 } else { 1 };
        if let Some(stage) = inner.stages.get(&message.stage_id) {
            for (subscriber, tx) in stage {
                if *subscriber == message.from_user_id {
                    continue;
                }
                for _ in 0..copies {
                    // Full or closed queues are the transport's problem in
                    // production too; drop silently.
                    let _ = tx.try_send(message.clone());
                }
            }
        }
    }

    async fn leave(&self, stage_id: &StageId, user_id: &UserId) {
        let mut inner = self.lock();
        if let Some(stage) = inner.stages.get_mut(stage_id) {
            stage.remove(user_id);
        }
        inner.roles.remove(&(stage_id.clone(), user_id.clone()));
    }
}
