#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ringmesh::{
    Discovery, DiscoveryConfig, DiscoveryEvent, DiscoveryListener, NodeId, TopologySnapshot,
};

/// Each rig claims a disjoint port window; nodes bind the first free port
/// inside it.
const PORT_WINDOW: u16 = 40;
static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(47_560);

pub fn next_base_port() -> u16 {
    NEXT_BASE_PORT.fetch_add(PORT_WINDOW, Ordering::Relaxed)
}

#[derive(Clone, Debug)]
pub struct EventRecord {
    pub kind: &'static str,
    pub version: u64,
    pub node: Option<NodeId>,
    pub payload: Option<Vec<u8>>,
}

/// Listener that records every event with the snapshot version it arrived
/// at.
#[derive(Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<Vec<EventRecord>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.inner.lock().unwrap().clone()
    }

    pub fn joined(&self, node: NodeId) -> usize {
        self.records()
            .iter()
            .filter(|r| r.kind == "NODE_JOINED" && r.node == Some(node))
            .count()
    }

    pub fn failed(&self, node: NodeId) -> usize {
        self.records()
            .iter()
            .filter(|r| r.kind == "NODE_FAILED" && r.node == Some(node))
            .count()
    }

    pub fn customs(&self) -> Vec<Vec<u8>> {
        self.records()
            .iter()
            .filter(|r| r.kind == "CUSTOM")
            .filter_map(|r| r.payload.clone())
            .collect()
    }

    pub fn saw(&self, kind: &str) -> bool {
        self.records().iter().any(|r| r.kind == kind)
    }

    /// `(kind, version, node)` triples from `from_version` on, for
    /// cross-node ordering comparisons.
    pub fn ordered_from(&self, from_version: u64) -> Vec<(String, u64, Option<NodeId>)> {
        self.records()
            .iter()
            .filter(|r| r.version >= from_version)
            .map(|r| (r.kind.to_string(), r.version, r.node))
            .collect()
    }
}

impl DiscoveryListener for EventLog {
    fn on_event(&self, event: &DiscoveryEvent, snapshot: &Arc<TopologySnapshot>) {
        let (node, payload) = match event {
            DiscoveryEvent::NodeJoined(n)
            | DiscoveryEvent::NodeLeft(n)
            | DiscoveryEvent::NodeFailed(n) => (Some(n.id), None),
            DiscoveryEvent::Custom(bytes) => (None, Some(bytes.to_vec())),
            DiscoveryEvent::Segmented | DiscoveryEvent::Disconnected => (None, None),
        };
        self.inner.lock().unwrap().push(EventRecord {
            kind: event.kind(),
            version: snapshot.version.get(),
            node,
            payload,
        });
    }
}

pub struct RigNode {
    pub disc: Discovery,
    pub events: EventLog,
}

impl RigNode {
    pub fn id(&self) -> NodeId {
        self.disc.local_node().id
    }

    pub fn version(&self) -> u64 {
        self.disc.topology_version().get()
    }

    pub fn live_ids(&self) -> Vec<NodeId> {
        let snapshot = self.disc.topology();
        let mut ids: Vec<NodeId> = snapshot.live_nodes().map(|n| n.id).collect();
        ids.sort();
        ids
    }
}

/// In-process cluster on loopback with a per-rig port window and a static
/// address book pointing at the window's first port.
pub struct ClusterRig {
    pub nodes: Vec<RigNode>,
    base_port: u16,
}

impl ClusterRig {
    pub fn launch(servers: usize) -> Self {
        ringmesh::telemetry::init(0, &ringmesh::telemetry::LoggingConfig::default());
        let mut rig = Self {
            nodes: Vec::new(),
            base_port: next_base_port(),
        };
        for _ in 0..servers {
            rig.add_server().expect("server start");
        }
        rig
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn seed_entry(&self) -> String {
        format!("127.0.0.1:{}", self.base_port)
    }

    pub fn server_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            local_address: Some(IpAddr::from([127, 0, 0, 1])),
            local_port: self.base_port,
            local_port_range: PORT_WINDOW - 1,
            network_timeout_ms: 3_000,
            join_timeout_ms: 30_000,
            ..DiscoveryConfig::default()
        }
    }

    /// Starts one more server; returns its index in `nodes`.
    pub fn add_server(&mut self) -> ringmesh::Result<usize> {
        self.add_server_with(|config| config, None)
    }

    pub fn add_server_with(
        &mut self,
        tweak: impl FnOnce(DiscoveryConfig) -> DiscoveryConfig,
        node_id: Option<NodeId>,
    ) -> ringmesh::Result<usize> {
        let events = EventLog::new();
        let mut builder = Discovery::builder(tweak(self.server_config()))
            .static_addresses([self.seed_entry()])
            .listener(Arc::new(events.clone()));
        if let Some(node_id) = node_id {
            builder = builder.node_id(node_id);
        }
        let disc = builder.build()?;
        disc.start()?;
        self.nodes.push(RigNode { disc, events });
        Ok(self.nodes.len() - 1)
    }

    /// Starts a server that discovers the cluster through the given peer
    /// entries instead of the rig seed; returns its index in `nodes`.
    pub fn add_server_via(&mut self, entries: Vec<String>) -> ringmesh::Result<usize> {
        let events = EventLog::new();
        let disc = Discovery::builder(self.server_config())
            .static_addresses(entries)
            .listener(Arc::new(events.clone()))
            .build()?;
        disc.start()?;
        self.nodes.push(RigNode { disc, events });
        Ok(self.nodes.len() - 1)
    }

    /// Attach a client over the given peer entries (defaults to every
    /// server's bound address); returns its index in `nodes`.
    pub fn add_client(&mut self, entries: Option<Vec<String>>) -> ringmesh::Result<usize> {
        let entries = entries.unwrap_or_else(|| {
            self.nodes
                .iter()
                .filter_map(|n| n.disc.bind_addr())
                .map(|a| a.to_string())
                .collect()
        });

        let config = DiscoveryConfig {
            client_mode: true,
            ..self.server_config()
        };
        let events = EventLog::new();
        let disc = Discovery::builder(config)
            .static_addresses(entries)
            .listener(Arc::new(events.clone()))
            .build()?;
        disc.start()?;
        self.nodes.push(RigNode { disc, events });
        Ok(self.nodes.len() - 1)
    }

    /// Crash a node: workers halt without announcing departure, as a killed
    /// process would.
    pub fn crash(&self, idx: usize) {
        self.nodes[idx]
            .disc
            .test_hooks()
            .expect("server node")
            .simulate_node_failure();
    }

    pub fn node(&self, idx: usize) -> &RigNode {
        &self.nodes[idx]
    }
}

impl Drop for ClusterRig {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.disc.stop();
        }
    }
}

pub fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[track_caller]
pub fn assert_until(timeout: Duration, mut probe: impl FnMut() -> bool, what: &str) {
    if !wait_until(timeout, &mut probe) {
        panic!("condition not reached within {timeout:?}: {what}");
    }
}
