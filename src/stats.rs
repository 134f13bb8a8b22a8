//! Discovery statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated from every worker; snapshotted for the
/// periodic statistics log and for tests.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    ack_timeouts: AtomicU64,
    socket_timeouts: AtomicU64,
    ring_reconnects: AtomicU64,
    pending_replays: AtomicU64,
    nodes_joined: AtomicU64,
    nodes_left: AtomicU64,
    nodes_failed: AtomicU64,
    coordinator_changes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub ack_timeouts: u64,
    pub socket_timeouts: u64,
    pub ring_reconnects: u64,
    pub pending_replays: u64,
    pub nodes_joined: u64,
    pub nodes_left: u64,
    pub nodes_failed: u64,
    pub coordinator_changes: u64,
}

impl DiscoveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_ack_timeout(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_socket_timeout(&self) {
        self.socket_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_ring_reconnect(&self) {
        self.ring_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_pending_replay(&self) {
        self.pending_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_node_joined(&self) {
        self.nodes_joined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_node_left(&self) {
        self.nodes_left.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_node_failed(&self) {
        self.nodes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_coordinator_change(&self) {
        self.coordinator_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            socket_timeouts: self.socket_timeouts.load(Ordering::Relaxed),
            ring_reconnects: self.ring_reconnects.load(Ordering::Relaxed),
            pending_replays: self.pending_replays.load(Ordering::Relaxed),
            nodes_joined: self.nodes_joined.load(Ordering::Relaxed),
            nodes_left: self.nodes_left.load(Ordering::Relaxed),
            nodes_failed: self.nodes_failed.load(Ordering::Relaxed),
            coordinator_changes: self.coordinator_changes.load(Ordering::Relaxed),
        }
    }

    pub fn log_snapshot(&self) {
        let snap = self.snapshot();
        tracing::info!(
            sent = snap.messages_sent,
            received = snap.messages_received,
            ack_timeouts = snap.ack_timeouts,
            socket_timeouts = snap.socket_timeouts,
            ring_reconnects = snap.ring_reconnects,
            pending_replays = snap.pending_replays,
            joined = snap.nodes_joined,
            left = snap.nodes_left,
            failed = snap.nodes_failed,
            "discovery statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = DiscoveryStats::new();
        stats.on_message_sent();
        stats.on_message_sent();
        stats.on_ack_timeout();
        stats.on_node_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.ack_timeouts, 1);
        assert_eq!(snap.nodes_failed, 1);
        assert_eq!(snap.messages_received, 0);
    }
}
