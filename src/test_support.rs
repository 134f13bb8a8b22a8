//! Fault-injection hooks for the test suite.
//!
//! These drive the integration scenarios (forced neighbor failure, broken
//! ring connections, message taps) and are reachable only through
//! [`crate::discovery::Discovery::test_hooks`]; nothing in the production
//! capability surface exposes them.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::wire::Envelope;

type MessageTap = Box<dyn Fn(&Envelope) + Send + Sync>;
type ConnectionTap = Box<dyn Fn(SocketAddr) + Send + Sync>;

#[derive(Default)]
pub struct TestHooks {
    break_next_connection: AtomicBool,
    fail_next_neighbor: AtomicBool,
    simulate_failure: AtomicBool,
    message_taps: Mutex<Vec<MessageTap>>,
    connection_taps: Mutex<Vec<ConnectionTap>>,
}

impl TestHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the outbound ring socket before the next send, forcing a
    /// reconnect to the same neighbor.
    pub fn break_connection(&self) {
        self.break_next_connection.store(true, Ordering::Relaxed);
    }

    /// Treat the next neighbor as unreachable on the next send, forcing a
    /// skip to the neighbor-after-next with pending-log replay.
    pub fn force_next_node_failure(&self) {
        self.fail_next_neighbor.store(true, Ordering::Relaxed);
    }

    /// Stop every worker thread without announcing departure, leaving the
    /// node unresponsive as a crashed process would be.
    pub fn simulate_node_failure(&self) {
        self.simulate_failure.store(true, Ordering::Relaxed);
    }

    pub(crate) fn failure_simulated(&self) -> bool {
        self.simulate_failure.load(Ordering::Relaxed)
    }

    /// Observe every message handed to the ring writer.
    pub fn add_message_tap(&self, tap: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.message_taps
            .lock()
            .expect("message tap lock poisoned")
            .push(Box::new(tap));
    }

    /// Observe every accepted inbound connection.
    pub fn add_connection_tap(&self, tap: impl Fn(SocketAddr) + Send + Sync + 'static) {
        self.connection_taps
            .lock()
            .expect("connection tap lock poisoned")
            .push(Box::new(tap));
    }

    pub(crate) fn take_break_connection(&self) -> bool {
        self.break_next_connection.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn take_fail_next_neighbor(&self) -> bool {
        self.fail_next_neighbor.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn on_message(&self, envelope: &Envelope) {
        for tap in self
            .message_taps
            .lock()
            .expect("message tap lock poisoned")
            .iter()
        {
            tap(envelope);
        }
    }

    pub(crate) fn on_connection(&self, peer: SocketAddr) {
        for tap in self
            .connection_taps
            .lock()
            .expect("connection tap lock poisoned")
            .iter()
        {
            tap(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_flags_are_one_shot() {
        let hooks = TestHooks::new();
        hooks.break_connection();
        assert!(hooks.take_break_connection());
        assert!(!hooks.take_break_connection());

        hooks.force_next_node_failure();
        assert!(hooks.take_fail_next_neighbor());
        assert!(!hooks.take_fail_next_neighbor());
    }
}
