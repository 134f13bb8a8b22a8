//! Node record: identity, addresses, attributes, ring order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::identity::{NodeId, NodeOrder};
use super::version::ProductVersion;

/// Node attribute that is mapped to the node's external addresses.
pub const ATTR_EXT_ADDRS: &str = "disc.tcp.ext-addrs";

/// A cluster participant as carried on the wire and in topology snapshots.
///
/// `order` is `NodeOrder::UNASSIGNED` until the coordinator admits the node.
/// Client nodes carry `discovery_port` 0 and never occupy a ring position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub attributes: BTreeMap<String, Bytes>,
    pub internal_addrs: Vec<SocketAddr>,
    pub external_addrs: Vec<SocketAddr>,
    pub discovery_port: u16,
    pub version: ProductVersion,
    pub order: NodeOrder,
    pub client: bool,
    /// Set only on the record describing the local node; never on the wire.
    #[serde(skip)]
    pub local: bool,
}

impl NodeRecord {
    pub fn new(id: NodeId, internal_addrs: Vec<SocketAddr>, discovery_port: u16) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            internal_addrs,
            external_addrs: Vec::new(),
            discovery_port,
            version: ProductVersion::default(),
            order: NodeOrder::UNASSIGNED,
            client: false,
            local: false,
        }
    }

    pub fn with_external_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
        let joined = addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.attributes
            .insert(ATTR_EXT_ADDRS.to_string(), Bytes::from(joined));
        self.external_addrs = addrs;
        self
    }

    pub fn with_version(mut self, version: ProductVersion) -> Self {
        self.version = version;
        self
    }

    pub fn as_client(mut self) -> Self {
        self.client = true;
        self.discovery_port = 0;
        self
    }

    pub fn as_local(mut self) -> Self {
        self.local = true;
        self
    }

    pub fn is_server(&self) -> bool {
        !self.client
    }

    /// Internal then external addresses, duplicates removed, order kept.
    pub fn socket_addresses(&self) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(self.internal_addrs.len() + self.external_addrs.len());
        for addr in self.internal_addrs.iter().chain(self.external_addrs.iter()) {
            if !out.contains(addr) {
                out.push(*addr);
            }
        }
        out
    }

    pub fn attribute(&self, key: &str) -> Option<&Bytes> {
        self.attributes.get(key)
    }
}

impl PartialOrd for NodeRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.cmp(&other.order).then(self.id.cmp(&other.id))
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [order={}, client={}, addrs={:?}]",
            self.id, self.order, self.client, self.internal_addrs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn ordering_follows_ring_order() {
        let mut a = NodeRecord::new(NodeId::random(), vec![addr(47500)], 47500);
        let mut b = NodeRecord::new(NodeId::random(), vec![addr(47501)], 47501);
        a.order = NodeOrder::new(2);
        b.order = NodeOrder::new(1);
        assert!(b < a);
    }

    #[test]
    fn external_addrs_mirror_into_attribute() {
        let node = NodeRecord::new(NodeId::random(), vec![addr(47500)], 47500)
            .with_external_addrs(vec![addr(8000), addr(8001)]);
        let raw = node.attribute(ATTR_EXT_ADDRS).unwrap();
        assert_eq!(raw.as_ref(), b"127.0.0.1:8000,127.0.0.1:8001");
    }

    #[test]
    fn socket_addresses_deduplicate() {
        let node = NodeRecord::new(NodeId::random(), vec![addr(47500), addr(8000)], 47500)
            .with_external_addrs(vec![addr(8000)]);
        assert_eq!(node.socket_addresses(), vec![addr(47500), addr(8000)]);
    }

    #[test]
    fn client_nodes_have_no_discovery_port() {
        let node = NodeRecord::new(NodeId::random(), vec![addr(47500)], 47500).as_client();
        assert!(node.client);
        assert_eq!(node.discovery_port, 0);
    }
}
