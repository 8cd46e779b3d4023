//! Session metrics and mailbox monitoring.
//!
//! Counters are in-process atomics snapshotted by tests and diagnostics;
//! there is no exporter in this crate.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Mailbox depth past which a warning is logged.
pub const MAILBOX_WARNING_DEPTH: usize = 48;

/// Aggregate counters for one orchestrator instance.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    peers_linked: AtomicU64,
    peers_unlinked: AtomicU64,
    renegotiations: AtomicU64,
    reconnect_attempts: AtomicU64,
    control_messages_sent: AtomicU64,
    streams_registered: AtomicU64,
    streams_stopped: AtomicU64,
    leak_guard_warnings: AtomicU64,
}

/// Point-in-time copy of [`SessionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionMetricsSnapshot {
    pub peers_linked: u64,
    pub peers_unlinked: u64,
    pub renegotiations: u64,
    pub reconnect_attempts: u64,
    pub control_messages_sent: u64,
    pub streams_registered: u64,
    pub streams_stopped: u64,
    pub leak_guard_warnings: u64,
}

impl SessionMetrics {
    /// Create shared metrics.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_peer_linked(&self) {
        self.peers_linked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_peer_unlinked(&self) {
        self.peers_unlinked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_renegotiation(&self) {
        self.renegotiations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_message(&self) {
        self.control_messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_registered(&self) {
        self.streams_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_stopped(&self) {
        self.streams_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leak_guard_warning(&self) {
        self.leak_guard_warnings.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            peers_linked: self.peers_linked.load(Ordering::Relaxed),
            peers_unlinked: self.peers_unlinked.load(Ordering::Relaxed),
            renegotiations: self.renegotiations.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            control_messages_sent: self.control_messages_sent.load(Ordering::Relaxed),
            streams_registered: self.streams_registered.load(Ordering::Relaxed),
            streams_stopped: self.streams_stopped.load(Ordering::Relaxed),
            leak_guard_warnings: self.leak_guard_warnings.load(Ordering::Relaxed),
        }
    }
}

/// Mailbox monitor for tracking queue depth.
#[derive(Debug)]
pub struct MailboxMonitor {
    /// Actor identifier (stage id).
    actor_id: String,
    /// Current mailbox depth.
    depth: AtomicUsize,
    /// Peak mailbox depth.
    peak_depth: AtomicUsize,
    /// Total messages processed.
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    /// Create a new mailbox monitor for the given actor.
    #[must_use]
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;

        let mut current_peak = self.peak_depth.load(Ordering::Relaxed);
        while new_depth > current_peak {
            match self.peak_depth.compare_exchange_weak(
                current_peak,
                new_depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current_peak = actual,
            }
        }

        if new_depth == MAILBOX_WARNING_DEPTH {
            warn!(
                target: "stage.orchestrator.mailbox",
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            );
        }
    }

    /// Record a message being removed from the mailbox (processed).
    pub fn record_dequeue(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Total messages processed.
    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    /// Peak depth observed.
    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot_counts() {
        let metrics = SessionMetrics::new();
        metrics.record_peer_linked();
        metrics.record_peer_linked();
        metrics.record_stream_registered();
        metrics.record_leak_guard_warning();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.peers_linked, 2);
        assert_eq!(snapshot.streams_registered, 1);
        assert_eq!(snapshot.leak_guard_warnings, 1);
        assert_eq!(snapshot.peers_unlinked, 0);
    }

    #[test]
    fn test_mailbox_monitor_tracks_depth_and_peak() {
        let mailbox = MailboxMonitor::new("stage-1");
        mailbox.record_enqueue();
        mailbox.record_enqueue();
        mailbox.record_dequeue();
        mailbox.record_enqueue();

        assert_eq!(mailbox.peak_depth(), 2);
        assert_eq!(mailbox.messages_processed(), 1);
    }
}
