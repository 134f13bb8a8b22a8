//! Topology snapshots, the published ring view, and bounded history.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::identity::{NodeId, NodeOrder, TopologyVersion};
use super::node::NodeRecord;

/// Immutable view of the cluster at one topology version.
///
/// `members` is sorted by ring order and may contain nodes still in the
/// pending-visible phase (admitted by the coordinator, `NodeAddedFinished`
/// not yet observed); `pending` names them. Ring routing uses every server
/// member; the live set exposed to listeners and public accessors excludes
/// pending ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub version: TopologyVersion,
    pub members: Vec<NodeRecord>,
    pub pending: BTreeSet<NodeId>,
}

impl TopologySnapshot {
    pub fn new(version: TopologyVersion, mut members: Vec<NodeRecord>) -> Self {
        members.sort();
        Self {
            version,
            members,
            pending: BTreeSet::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(TopologyVersion::ZERO, Vec::new())
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.members.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Live members: finished, non-pending nodes (servers and clients).
    pub fn live_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.members.iter().filter(|n| !self.pending.contains(&n.id))
    }

    /// Server members occupying ring positions, pending included.
    pub fn ring_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.members.iter().filter(|n| n.is_server())
    }

    /// The live server node with the smallest order.
    pub fn coordinator(&self) -> Option<&NodeRecord> {
        self.live_nodes().filter(|n| n.is_server()).min_by_key(|n| n.order)
    }

    pub fn max_order(&self) -> NodeOrder {
        self.members
            .iter()
            .map(|n| n.order)
            .max()
            .unwrap_or(NodeOrder::UNASSIGNED)
    }

    /// Next ring neighbor of `of`: the server with the next higher order,
    /// wrapping to the smallest. `None` when `of` is the only server.
    pub fn next_neighbor(&self, of: NodeId) -> Option<&NodeRecord> {
        let mut ring: Vec<&NodeRecord> = self.ring_nodes().collect();
        ring.sort();
        if ring.len() < 2 {
            return None;
        }
        let pos = ring.iter().position(|n| n.id == of)?;
        Some(ring[(pos + 1) % ring.len()])
    }

    /// Ring successors of `of` in order, nearest first, excluding `of`.
    pub fn successors(&self, of: NodeId) -> Vec<&NodeRecord> {
        let mut ring: Vec<&NodeRecord> = self.ring_nodes().collect();
        ring.sort();
        let Some(pos) = ring.iter().position(|n| n.id == of) else {
            return ring;
        };
        ring.rotate_left(pos + 1);
        ring.pop();
        ring
    }

    pub fn with_member(&self, node: NodeRecord, version: TopologyVersion) -> Self {
        let mut members = self.members.clone();
        members.retain(|n| n.id != node.id);
        let mut pending = self.pending.clone();
        pending.insert(node.id);
        members.push(node);
        members.sort();
        Self {
            version,
            members,
            pending,
        }
    }

    pub fn with_finished(&self, id: NodeId) -> Self {
        let mut pending = self.pending.clone();
        pending.remove(&id);
        Self {
            version: self.version,
            members: self.members.clone(),
            pending,
        }
    }

    pub fn without_member(&self, id: NodeId, version: TopologyVersion) -> Self {
        let mut members = self.members.clone();
        members.retain(|n| n.id != id);
        let mut pending = self.pending.clone();
        pending.remove(&id);
        Self {
            version,
            members,
            pending,
        }
    }

    pub fn at_version(&self, version: TopologyVersion) -> Self {
        Self {
            version,
            members: self.members.clone(),
            pending: self.pending.clone(),
        }
    }
}

/// Copy-on-write publication point for the current snapshot.
///
/// The message worker publishes fresh `Arc`s; readers clone the `Arc` and
/// never hold the lock across any other work.
#[derive(Clone)]
pub struct SharedTopology {
    inner: Arc<Mutex<Arc<TopologySnapshot>>>,
}

impl SharedTopology {
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Arc::new(snapshot))),
        }
    }

    pub fn load(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.inner.lock().expect("topology lock poisoned"))
    }

    pub fn publish(&self, snapshot: TopologySnapshot) -> Arc<TopologySnapshot> {
        let published = Arc::new(snapshot);
        *self.inner.lock().expect("topology lock poisoned") = Arc::clone(&published);
        published
    }
}

impl Default for SharedTopology {
    fn default() -> Self {
        Self::new(TopologySnapshot::empty())
    }
}

/// Bounded retention of published snapshots, oldest evicted first.
pub struct TopologyHistory {
    cap: usize,
    entries: VecDeque<Arc<TopologySnapshot>>,
}

impl TopologyHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, snapshot: Arc<TopologySnapshot>) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    pub fn get(&self, version: TopologyVersion) -> Option<&Arc<TopologySnapshot>> {
        self.entries.iter().find(|s| s.version == version)
    }

    pub fn latest(&self) -> Option<&Arc<TopologySnapshot>> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::NodeId;

    fn server(order: u64, port: u16) -> NodeRecord {
        let mut node = NodeRecord::new(
            NodeId::random(),
            vec![format!("127.0.0.1:{port}").parse().unwrap()],
            port,
        );
        node.order = NodeOrder::new(order);
        node
    }

    fn snapshot(orders: &[u64]) -> TopologySnapshot {
        let members = orders
            .iter()
            .map(|&o| server(o, 47500 + o as u16))
            .collect();
        TopologySnapshot::new(TopologyVersion::new(orders.len() as u64), members)
    }

    #[test]
    fn coordinator_is_smallest_order() {
        let snap = snapshot(&[3, 1, 2]);
        assert_eq!(snap.coordinator().unwrap().order, NodeOrder::new(1));
    }

    #[test]
    fn next_neighbor_wraps() {
        let snap = snapshot(&[1, 2, 3]);
        let last = snap.members.iter().find(|n| n.order.get() == 3).unwrap();
        let first = snap.members.iter().find(|n| n.order.get() == 1).unwrap();
        assert_eq!(snap.next_neighbor(last.id).unwrap().id, first.id);
    }

    #[test]
    fn next_neighbor_alone_is_none() {
        let snap = snapshot(&[1]);
        let only = &snap.members[0];
        assert!(snap.next_neighbor(only.id).is_none());
    }

    #[test]
    fn successors_are_ring_ordered() {
        let snap = snapshot(&[1, 2, 3]);
        let second = snap.members.iter().find(|n| n.order.get() == 2).unwrap();
        let succ: Vec<u64> = snap
            .successors(second.id)
            .iter()
            .map(|n| n.order.get())
            .collect();
        assert_eq!(succ, vec![3, 1]);
    }

    #[test]
    fn pending_members_are_not_live() {
        let snap = snapshot(&[1]);
        let joiner = server(2, 47502);
        let joiner_id = joiner.id;
        let v2 = TopologyVersion::new(2);
        let with_pending = snap.with_member(joiner, v2);
        assert!(with_pending.contains(joiner_id));
        assert_eq!(with_pending.live_nodes().count(), 1);
        let finished = with_pending.with_finished(joiner_id);
        assert_eq!(finished.live_nodes().count(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let mut history = TopologyHistory::new(2);
        for v in 1..=3u64 {
            history.push(Arc::new(snapshot(&[1]).at_version(TopologyVersion::new(v))));
        }
        assert_eq!(history.len(), 2);
        assert!(history.get(TopologyVersion::new(1)).is_none());
        assert_eq!(
            history.latest().unwrap().version,
            TopologyVersion::new(3)
        );
    }
}
