//! Event stream surfaced to the consumer.
//!
//! Delivery is best-effort broadcast: a lagging subscriber loses the oldest
//! events, never blocks the orchestrator. The state of record is always the
//! watch snapshot; events exist so the UI can animate transitions without
//! diffing snapshots.

use crate::media::MediaStream;
use crate::orchestrator::messages::ParticipantInfo;
use crate::types::{ConnectionState, NetworkQuality, UserId};
use tokio::sync::broadcast;
use tracing::trace;

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// The session's connection state changed.
    StateChanged {
        state: ConnectionState,
        reason: Option<String>,
    },
    /// A peer link reached the connected state.
    PeerConnected { user_id: UserId },
    /// A peer link was removed.
    PeerDisconnected { user_id: UserId },
    /// A remote stream became available for rendering.
    RemoteStreamAdded {
        user_id: UserId,
        stream: MediaStream,
    },
    /// A remote stream went away with its link.
    RemoteStreamRemoved { user_id: UserId },
    /// A participant's roster entry changed.
    ParticipantUpdated { participant: ParticipantInfo },
    /// Screen sharing ended because the capture itself stopped.
    ScreenShareEnded,
    /// The advisory network quality changed.
    NetworkQualityChanged { quality: NetworkQuality },
}

/// A subscription to the orchestrator's events.
pub struct EventStream {
    receiver: broadcast::Receiver<StageEvent>,
}

impl EventStream {
    /// Receive the next event.
    ///
    /// Skips over any stretch of events lost to lag and returns `None` once
    /// the orchestrator is gone.
    pub async fn recv(&mut self) -> Option<StageEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(
                        target: "stage.events",
                        skipped,
                        "Event subscriber lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Publish side of the event stream.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<StageEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; a missing audience is not an error.
    pub(crate) fn publish(&self, event: StageEvent) {
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.publish(StageEvent::ScreenShareEnded);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();
        bus.publish(StageEvent::PeerConnected {
            user_id: UserId::from("u2"),
        });
        bus.publish(StageEvent::ScreenShareEnded);

        assert!(matches!(
            stream.recv().await,
            Some(StageEvent::PeerConnected { .. })
        ));
        assert!(matches!(
            stream.recv().await,
            Some(StageEvent::ScreenShareEnded)
        ));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_bus_drop() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.recv().await.is_none());
    }
}
