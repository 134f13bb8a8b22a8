//! Discovery façade: one construction-time choice between the server
//! (ring member) and client (router-attached) runtimes behind a shared
//! capability interface.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::client::{ClientDeps, ClientNode};
use crate::config::DiscoveryConfig;
use crate::core::{
    DiscoveryListener, ListenerSet, NodeId, NodeRecord, SpiState, TopologySnapshot,
    TopologyVersion,
};
use crate::ring::{ServerNode, server::ServerDeps};
use crate::spi::{
    AddressBook, AllowAllAuthenticator, Codec, DataExchange, MetricsSource, NoopDataExchange,
    NoopMetrics, NodeAuthenticator, StaticAddressBook,
};
use crate::wire::CborCodec;
use crate::test_support::TestHooks;
use crate::util::Latch;

/// The operation surface both runtimes provide.
pub trait DiscoveryRuntime: Send + Sync {
    /// Join the cluster; blocks until admitted or failed.
    fn start(&self) -> crate::Result<()>;

    fn state(&self) -> SpiState;

    fn local_node(&self) -> NodeRecord;

    fn topology(&self) -> Arc<TopologySnapshot>;

    fn ping(&self, node_id: NodeId) -> bool;

    fn send_custom_event(&self, payload: Bytes) -> crate::Result<()>;

    fn fail_node(&self, node_id: NodeId) -> crate::Result<()>;

    fn message_worker_queue_size(&self) -> usize;

    fn stop(&self);
}

impl DiscoveryRuntime for ServerNode {
    fn start(&self) -> crate::Result<()> {
        ServerNode::start(self)
    }

    fn state(&self) -> SpiState {
        ServerNode::state(self)
    }

    fn local_node(&self) -> NodeRecord {
        ServerNode::local_node(self)
    }

    fn topology(&self) -> Arc<TopologySnapshot> {
        ServerNode::topology(self)
    }

    fn ping(&self, node_id: NodeId) -> bool {
        ServerNode::ping(self, node_id)
    }

    fn send_custom_event(&self, payload: Bytes) -> crate::Result<()> {
        ServerNode::send_custom_event(self, payload)
    }

    fn fail_node(&self, node_id: NodeId) -> crate::Result<()> {
        ServerNode::fail_node(self, node_id)
    }

    fn message_worker_queue_size(&self) -> usize {
        ServerNode::message_worker_queue_size(self)
    }

    fn stop(&self) {
        ServerNode::stop(self)
    }
}

impl DiscoveryRuntime for ClientNode {
    fn start(&self) -> crate::Result<()> {
        ClientNode::start(self)
    }

    fn state(&self) -> SpiState {
        ClientNode::state(self)
    }

    fn local_node(&self) -> NodeRecord {
        ClientNode::local_node(self)
    }

    fn topology(&self) -> Arc<TopologySnapshot> {
        ClientNode::topology(self)
    }

    fn ping(&self, node_id: NodeId) -> bool {
        ClientNode::ping(self, node_id)
    }

    fn send_custom_event(&self, payload: Bytes) -> crate::Result<()> {
        ClientNode::send_custom_event(self, payload)
    }

    fn fail_node(&self, node_id: NodeId) -> crate::Result<()> {
        ClientNode::fail_node(self, node_id)
    }

    fn message_worker_queue_size(&self) -> usize {
        // Clients apply messages on the session thread; there is no worker
        // queue to observe.
        0
    }

    fn stop(&self) {
        ClientNode::stop(self)
    }
}

pub struct DiscoveryBuilder {
    config: DiscoveryConfig,
    node_id: NodeId,
    book: Option<Arc<dyn AddressBook>>,
    codec: Arc<dyn Codec>,
    listeners: ListenerSet,
    authenticator: Arc<dyn NodeAuthenticator>,
    metrics: Arc<dyn MetricsSource>,
    exchange: Arc<dyn DataExchange>,
}

impl DiscoveryBuilder {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            node_id: NodeId::random(),
            book: None,
            codec: Arc::new(CborCodec),
            listeners: ListenerSet::new(),
            authenticator: Arc::new(AllowAllAuthenticator),
            metrics: Arc::new(NoopMetrics),
            exchange: Arc::new(NoopDataExchange),
        }
    }

    /// Fixed node identity; defaults to a random one.
    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn address_book(mut self, book: Arc<dyn AddressBook>) -> Self {
        self.book = Some(book);
        self
    }

    /// Convenience for the common static-list deployment.
    pub fn static_addresses(
        self,
        entries: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.address_book(Arc::new(StaticAddressBook::new(entries)))
    }

    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn listener(self, listener: Arc<dyn DiscoveryListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn NodeAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn data_exchange(mut self, exchange: Arc<dyn DataExchange>) -> Self {
        self.exchange = exchange;
        self
    }

    /// Validates configuration and constructs the runtime; server nodes
    /// bind their listener here. Call [`Discovery::start`] to join.
    pub fn build(self) -> crate::Result<Discovery> {
        self.config.validate()?;
        let book = self.book.ok_or(crate::config::ConfigError::Invalid {
            option: "address_book",
            reason: "an address book provider is required".to_string(),
        })?;

        let ctx_latch = Arc::new(Latch::new());
        if self.config.starts_as_client() {
            let client = ClientNode::new(
                ClientDeps {
                    config: self.config,
                    node_id: self.node_id,
                    book,
                    codec: self.codec,
                    listeners: self.listeners,
                    metrics: self.metrics,
                },
                Arc::clone(&ctx_latch),
            )?;
            Ok(Discovery {
                runtime: Box::new(client),
                server: None,
                ctx_latch,
            })
        } else {
            let server = Arc::new(ServerNode::new(
                ServerDeps {
                    config: self.config,
                    node_id: self.node_id,
                    book,
                    codec: self.codec,
                    listeners: self.listeners,
                    authenticator: self.authenticator,
                    metrics: self.metrics,
                    exchange: self.exchange,
                },
                Arc::clone(&ctx_latch),
            )?);
            Ok(Discovery {
                runtime: Box::new(SharedServer(Arc::clone(&server))),
                server: Some(server),
                ctx_latch,
            })
        }
    }
}

/// Arc wrapper so the façade can keep a second handle on the server for
/// server-only accessors.
struct SharedServer(Arc<ServerNode>);

impl DiscoveryRuntime for SharedServer {
    fn start(&self) -> crate::Result<()> {
        self.0.start()
    }

    fn state(&self) -> SpiState {
        self.0.state()
    }

    fn local_node(&self) -> NodeRecord {
        self.0.local_node()
    }

    fn topology(&self) -> Arc<TopologySnapshot> {
        self.0.topology()
    }

    fn ping(&self, node_id: NodeId) -> bool {
        self.0.ping(node_id)
    }

    fn send_custom_event(&self, payload: Bytes) -> crate::Result<()> {
        self.0.send_custom_event(payload)
    }

    fn fail_node(&self, node_id: NodeId) -> crate::Result<()> {
        self.0.fail_node(node_id)
    }

    fn message_worker_queue_size(&self) -> usize {
        self.0.message_worker_queue_size()
    }

    fn stop(&self) {
        self.0.stop()
    }
}

/// Cluster membership handle for one local node.
pub struct Discovery {
    runtime: Box<dyn DiscoveryRuntime>,
    server: Option<Arc<ServerNode>>,
    ctx_latch: Arc<Latch>,
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery").finish_non_exhaustive()
    }
}

impl Discovery {
    pub fn builder(config: DiscoveryConfig) -> DiscoveryBuilder {
        DiscoveryBuilder::new(config)
    }

    /// Join the cluster; blocks until the local node is admitted, the join
    /// is rejected, or the join timeout elapses.
    pub fn start(&self) -> crate::Result<()> {
        self.runtime.start()
    }

    pub fn state(&self) -> SpiState {
        self.runtime.state()
    }

    pub fn is_client(&self) -> bool {
        self.server.is_none()
    }

    pub fn local_node(&self) -> NodeRecord {
        self.ctx_latch.wait();
        self.runtime.local_node()
    }

    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.runtime.topology()
    }

    pub fn topology_version(&self) -> TopologyVersion {
        self.runtime.topology().version
    }

    /// Live members other than the local node.
    pub fn remote_nodes(&self) -> Vec<NodeRecord> {
        let local_id = self.runtime.local_node().id;
        self.runtime
            .topology()
            .live_nodes()
            .filter(|n| n.id != local_id)
            .cloned()
            .collect()
    }

    pub fn node(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.runtime.topology().node(node_id).cloned()
    }

    /// Id of the node the local snapshot believes to be coordinator.
    pub fn coordinator(&self) -> Option<NodeId> {
        self.runtime.topology().coordinator().map(|n| n.id)
    }

    pub fn ping(&self, node_id: NodeId) -> bool {
        self.runtime.ping(node_id)
    }

    pub fn send_custom_event(&self, payload: Bytes) -> crate::Result<()> {
        self.runtime.send_custom_event(payload)
    }

    /// Excise a node under the caller's authority.
    pub fn fail_node(&self, node_id: NodeId) -> crate::Result<()> {
        self.runtime.fail_node(node_id)
    }

    pub fn message_worker_queue_size(&self) -> usize {
        self.runtime.message_worker_queue_size()
    }

    /// Bound discovery address of a server node; `None` for clients.
    pub fn bind_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.as_ref().map(|s| s.bind_addr())
    }

    /// Fault-injection hooks; server nodes only.
    pub fn test_hooks(&self) -> Option<Arc<TestHooks>> {
        self.server.as_ref().map(|s| s.test_hooks())
    }

    pub fn stop(&self) {
        self.runtime.stop()
    }
}
