//! Discovery events and listener dispatch.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::node::NodeRecord;
use super::topology::TopologySnapshot;

/// Events surfaced to the embedding runtime, in topology-version order.
#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    NodeJoined(NodeRecord),
    NodeLeft(NodeRecord),
    NodeFailed(NodeRecord),
    /// The local node was excised from the ring and could not rejoin.
    Segmented,
    /// A client node lost its router and exhausted the reconnect budget.
    Disconnected,
    Custom(Bytes),
}

impl DiscoveryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryEvent::NodeJoined(_) => "NODE_JOINED",
            DiscoveryEvent::NodeLeft(_) => "NODE_LEFT",
            DiscoveryEvent::NodeFailed(_) => "NODE_FAILED",
            DiscoveryEvent::Segmented => "SEGMENTED",
            DiscoveryEvent::Disconnected => "DISCONNECTED",
            DiscoveryEvent::Custom(_) => "CUSTOM",
        }
    }
}

/// Sink for discovery events. Snapshot references are shared, never copied.
pub trait DiscoveryListener: Send + Sync {
    fn on_event(&self, event: &DiscoveryEvent, snapshot: &Arc<TopologySnapshot>);
}

impl<F> DiscoveryListener for F
where
    F: Fn(&DiscoveryEvent, &Arc<TopologySnapshot>) + Send + Sync,
{
    fn on_event(&self, event: &DiscoveryEvent, snapshot: &Arc<TopologySnapshot>) {
        self(event, snapshot)
    }
}

/// Copy-on-write listener list.
///
/// Adding a listener publishes a fresh immutable array; notification clones
/// the current `Arc` and iterates without holding the lock.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<Mutex<Arc<Vec<Arc<dyn DiscoveryListener>>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DiscoveryListener>) {
        let mut slot = self.inner.lock().expect("listener lock poisoned");
        let mut next = slot.as_ref().clone();
        next.push(listener);
        *slot = Arc::new(next);
    }

    pub fn clear(&self) {
        let mut slot = self.inner.lock().expect("listener lock poisoned");
        *slot = Arc::new(Vec::new());
    }

    pub fn notify(&self, event: &DiscoveryEvent, snapshot: &Arc<TopologySnapshot>) {
        let listeners = Arc::clone(&self.inner.lock().expect("listener lock poisoned"));
        for listener in listeners.iter() {
            listener.on_event(event, snapshot);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("listener lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn notify_reaches_every_listener() {
        let set = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            set.add(Arc::new(move |_: &DiscoveryEvent, _: &Arc<TopologySnapshot>| {
                hits.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let snapshot = Arc::new(TopologySnapshot::empty());
        set.notify(&DiscoveryEvent::Segmented, &snapshot);
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn add_during_iteration_is_safe() {
        let set = ListenerSet::new();
        let inner = set.clone();
        set.add(Arc::new(move |_: &DiscoveryEvent, _: &Arc<TopologySnapshot>| {
            inner.add(Arc::new(|_: &DiscoveryEvent, _: &Arc<TopologySnapshot>| {}));
        }));

        let snapshot = Arc::new(TopologySnapshot::empty());
        set.notify(&DiscoveryEvent::Segmented, &snapshot);
        assert_eq!(set.len(), 2);
    }
}
