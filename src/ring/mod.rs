//! Ring transport, coordinator protocol, and the server runtime.

pub mod pending;
pub mod server;
pub mod worker;
pub mod writer;

pub use pending::{PendingEntry, PendingLog};
pub use server::ServerNode;
pub use worker::WorkerCmd;
pub use writer::WriterCmd;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::DiscoveryConfig;
use crate::core::{
    ListenerSet, NodeId, NodeRecord, SharedTopology, SpiState, TopologyHistory,
};
use crate::error::JoinError;
use crate::sock::SockIo;
use crate::spi::{DataExchange, MetricsSource, NodeAuthenticator};
use crate::stats::DiscoveryStats;
use crate::test_support::TestHooks;

/// State shared between the accept loop, readers, the message worker, the
/// ring writer, and the timer threads of one server node.
pub(crate) struct RingShared {
    pub config: DiscoveryConfig,
    pub local_id: NodeId,
    /// Local node record; `order` is written once when the coordinator
    /// admits us.
    pub local: Mutex<NodeRecord>,
    pub topology: SharedTopology,
    pub history: Mutex<TopologyHistory>,
    pub listeners: ListenerSet,
    pub pending: Mutex<PendingLog>,
    pub stats: Arc<DiscoveryStats>,
    pub state: Mutex<SpiState>,
    pub shutdown: Arc<AtomicBool>,
    pub sock_io: SockIo,
    pub authenticator: Arc<dyn NodeAuthenticator>,
    pub metrics: Arc<dyn MetricsSource>,
    pub exchange: Arc<dyn DataExchange>,
    pub join_gate: JoinGate,
    pub hooks: Arc<TestHooks>,
    pub started_at: Instant,
}

impl RingShared {
    pub fn state(&self) -> SpiState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn set_state(&self, next: SpiState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != next {
            tracing::debug!(from = state.as_str(), to = next.as_str(), "state change");
            *state = next;
        }
    }

    pub fn local_node(&self) -> NodeRecord {
        self.local.lock().expect("local node lock poisoned").clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed) || self.hooks.failure_simulated()
    }
}

/// Parks the joining thread until the local `NodeAddedFinished` arrives or
/// admission fails.
#[derive(Default)]
pub struct JoinGate {
    slot: Mutex<Option<Result<(), JoinError>>>,
    cv: Condvar,
}

impl JoinGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, result: Result<(), JoinError>) {
        let mut slot = self.slot.lock().expect("join gate lock poisoned");
        if slot.is_none() {
            *slot = Some(result);
            self.cv.notify_all();
        }
    }

    /// Waits until completion or `deadline`; `None` on timeout.
    pub fn wait_deadline(&self, deadline: Option<Instant>) -> Option<Result<(), JoinError>> {
        let mut slot = self.slot.lock().expect("join gate lock poisoned");
        loop {
            if slot.is_some() {
                return slot.take();
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .cv
                        .wait_timeout(slot, deadline - now)
                        .expect("join gate lock poisoned");
                    slot = guard;
                }
                None => {
                    slot = self.cv.wait(slot).expect("join gate lock poisoned");
                }
            }
        }
    }
}

/// Doubles the ack timeout after every failed attempt, capped.
pub(crate) struct AckBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl AckBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn grow(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn join_gate_releases_waiter() {
        let gate = Arc::new(JoinGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_deadline(None))
        };
        gate.complete(Ok(()));
        let result = waiter.join().unwrap();
        assert!(matches!(result, Some(Ok(()))));
    }

    #[test]
    fn join_gate_times_out() {
        let gate = JoinGate::new();
        let deadline = Some(Instant::now() + Duration::from_millis(20));
        assert!(gate.wait_deadline(deadline).is_none());
    }

    #[test]
    fn join_gate_keeps_first_result() {
        let gate = JoinGate::new();
        gate.complete(Err(JoinError::NoPeers));
        gate.complete(Ok(()));
        let result = gate.wait_deadline(None).unwrap();
        assert!(matches!(result, Err(JoinError::NoPeers)));
    }

    #[test]
    fn ack_backoff_doubles_and_caps() {
        let mut backoff = AckBackoff::new(Duration::from_millis(50), Duration::from_millis(150));
        assert_eq!(backoff.current(), Duration::from_millis(50));
        backoff.grow();
        assert_eq!(backoff.current(), Duration::from_millis(100));
        backoff.grow();
        assert_eq!(backoff.current(), Duration::from_millis(150));
        backoff.grow();
        assert_eq!(backoff.current(), Duration::from_millis(150));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(50));
    }
}
