//! Identity atoms.
//!
//! NodeId: 128-bit node identity
//! MessageId: per-message unique id used for absorption and replay dedup
//! NodeOrder: coordinator-assigned ring position
//! TopologyVersion: strictly monotonic topology counter

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node identifier. Every cluster participant, server or client, carries one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique id carried by every ring message.
///
/// A message that circles back to its creator is recognized by this id and
/// absorbed; replayed duplicates are suppressed by it as well.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ring position assigned by the coordinator at admission.
///
/// Order `0` means "not yet assigned"; the oldest live node holds order `1`
/// and is the coordinator.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeOrder(u64);

impl NodeOrder {
    pub const UNASSIGNED: NodeOrder = NodeOrder(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for NodeOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly monotonic 64-bit topology counter.
///
/// Advances exactly once per coordinator-sequenced event (join, leave, fail,
/// custom event).
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TopologyVersion(u64);

impl TopologyVersion {
    pub const ZERO: TopologyVersion = TopologyVersion(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_distinct() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn order_zero_is_unassigned() {
        assert!(!NodeOrder::UNASSIGNED.is_assigned());
        assert!(NodeOrder::new(1).is_assigned());
        assert_eq!(NodeOrder::new(1).next(), NodeOrder::new(2));
    }

    #[test]
    fn version_advances_by_one() {
        let v = TopologyVersion::new(41);
        assert_eq!(v.next().get(), 42);
        assert!(v.next() > v);
    }
}
