//! Injected boundaries: address book, codec, metrics, authentication,
//! joining-data exchange.

use std::collections::BTreeSet;
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{NodeId, NodeRecord};
use crate::wire::{CodecError, Envelope};

/// Pluggable provider of candidate peer endpoints.
///
/// Entries are `host[:port]` strings; bare hosts and port `0` are completed
/// with the local discovery port (or the default for client nodes) by the
/// adapter. Shared books are mutable cluster-wide: ring nodes register their
/// own addresses at startup and the coordinator prunes entries of departed
/// nodes.
pub trait AddressBook: Send + Sync {
    fn peers(&self) -> Result<Vec<String>, AddressBookError>;

    fn register(&self, addrs: &[String]) -> Result<(), AddressBookError>;

    fn unregister(&self, addrs: &[String]) -> Result<(), AddressBookError>;

    fn is_shared(&self) -> bool {
        false
    }
}

#[derive(Debug, Error)]
pub enum AddressBookError {
    #[error("address book unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Fixed in-memory address book seeded at construction.
pub struct StaticAddressBook {
    entries: Mutex<BTreeSet<String>>,
}

impl StaticAddressBook {
    pub fn new(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().map(Into::into).collect()),
        }
    }
}

impl AddressBook for StaticAddressBook {
    fn peers(&self) -> Result<Vec<String>, AddressBookError> {
        Ok(self
            .entries
            .lock()
            .expect("address book lock poisoned")
            .iter()
            .cloned()
            .collect())
    }

    fn register(&self, addrs: &[String]) -> Result<(), AddressBookError> {
        let mut entries = self.entries.lock().expect("address book lock poisoned");
        for addr in addrs {
            entries.insert(addr.clone());
        }
        Ok(())
    }

    fn unregister(&self, addrs: &[String]) -> Result<(), AddressBookError> {
        let mut entries = self.entries.lock().expect("address book lock poisoned");
        for addr in addrs {
            entries.remove(addr);
        }
        Ok(())
    }
}

/// Pluggable message serialization.
pub trait Codec: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError>;
}

/// Per-node metric snapshot folded into heartbeats as they traverse the
/// ring.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub uptime_ms: u64,
    pub message_queue_depth: u64,
    pub heap_bytes_used: u64,
}

pub trait MetricsSource: Send + Sync {
    fn snapshot(&self) -> NodeMetrics;
}

/// Metrics source reporting zeros; the default when the embedding runtime
/// injects nothing.
pub struct NoopMetrics;

impl MetricsSource for NoopMetrics {
    fn snapshot(&self) -> NodeMetrics {
        NodeMetrics::default()
    }
}

/// Admission authentication, consulted by the coordinator (and by first-hop
/// pre-checks) for every joining node.
pub trait NodeAuthenticator: Send + Sync {
    fn authenticate(&self, node: &NodeRecord) -> bool;
}

pub struct AllowAllAuthenticator;

impl NodeAuthenticator for AllowAllAuthenticator {
    fn authenticate(&self, _node: &NodeRecord) -> bool {
        true
    }
}

/// Joining-data exchange: the joiner's blob travels with its `JoinRequest`
/// and is handed to every member when the matching `NodeAdded` is applied.
pub trait DataExchange: Send + Sync {
    fn collect(&self, local: &NodeRecord) -> Bytes;

    fn on_exchange(&self, joiner: NodeId, data: &Bytes);
}

pub struct NoopDataExchange;

impl DataExchange for NoopDataExchange {
    fn collect(&self, _local: &NodeRecord) -> Bytes {
        Bytes::new()
    }

    fn on_exchange(&self, _joiner: NodeId, _data: &Bytes) {}
}
