//! Client (router-attached) runtime.
//!
//! A client node takes no ring position: it keeps a single socket to a
//! router ring node, receives every topology and custom event through it,
//! and pushes its own heartbeats the other way. Losing the router triggers
//! reconnection to another peer with a fast-forward from the new router's
//! pending log.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::addrs::AddressBookAdapter;
use crate::config::DiscoveryConfig;
use crate::core::{
    DiscoveryEvent, ListenerSet, NodeId, NodeRecord, SharedTopology, SpiState, TopologyHistory,
    TopologySnapshot,
};
use crate::error::JoinError;
use crate::ring::JoinGate;
use crate::sock::{SockError, SockIo, TimeoutWheel};
use crate::spi::{AddressBook, Codec, MetricsSource};
use crate::stats::DiscoveryStats;
use crate::util::{Latch, RecentIds};
use crate::wire::{
    ClientJoin, ClientReconnect, Envelope, Heartbeat, Message, NodeFailed, NodeLeft, Receipt,
    RejectReason,
};

pub(crate) struct ClientDeps {
    pub config: DiscoveryConfig,
    pub node_id: NodeId,
    pub book: Arc<dyn AddressBook>,
    pub codec: Arc<dyn Codec>,
    pub listeners: ListenerSet,
    pub metrics: Arc<dyn MetricsSource>,
}

struct ClientShared {
    config: DiscoveryConfig,
    local_id: NodeId,
    local: Mutex<NodeRecord>,
    topology: SharedTopology,
    history: Mutex<TopologyHistory>,
    listeners: ListenerSet,
    stats: Arc<DiscoveryStats>,
    state: Mutex<SpiState>,
    shutdown: Arc<AtomicBool>,
    sock_io: SockIo,
    metrics: Arc<dyn MetricsSource>,
    join_gate: JoinGate,
    /// Outbound channel of the live router session, if any.
    router_tx: Mutex<Option<Sender<Envelope>>>,
    started_at: Instant,
}

impl ClientShared {
    fn state(&self) -> SpiState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: SpiState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    fn local_node(&self) -> NodeRecord {
        self.local.lock().expect("local node lock poisoned").clone()
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn send_via_router(&self, envelope: Envelope) -> crate::Result<()> {
        let slot = self.router_tx.lock().expect("router lock poisoned");
        match slot.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| crate::Error::Shutdown),
            None => Err(crate::Error::Shutdown),
        }
    }
}

/// A non-ring participant attached through a router node.
pub struct ClientNode {
    shared: Arc<ClientShared>,
    adapter: AddressBookAdapter,
    wheel: TimeoutWheel,
    threads: Mutex<Vec<JoinHandle<()>>>,
    ctx_latch: Arc<Latch>,
}

impl ClientNode {
    pub(crate) fn new(deps: ClientDeps, ctx_latch: Arc<Latch>) -> crate::Result<Self> {
        let config = deps.config;
        let stats = Arc::new(DiscoveryStats::new());
        let wheel = TimeoutWheel::start(Arc::clone(&stats));
        let sock_io = SockIo::new(
            Arc::clone(&deps.codec),
            wheel.clone(),
            Arc::clone(&stats),
            config.effective_socket_timeout(),
            config.max_frame_bytes,
        );

        let local = NodeRecord::new(deps.node_id, Vec::new(), 0)
            .with_external_addrs(config.external_addresses.clone())
            .as_client()
            .as_local();

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(ClientShared {
            local_id: deps.node_id,
            local: Mutex::new(local),
            topology: SharedTopology::default(),
            history: Mutex::new(TopologyHistory::new(config.topology_history_size)),
            listeners: deps.listeners,
            stats,
            state: Mutex::new(SpiState::Connecting),
            shutdown: Arc::clone(&shutdown),
            sock_io,
            metrics: deps.metrics,
            join_gate: JoinGate::new(),
            router_tx: Mutex::new(None),
            started_at: Instant::now(),
            config,
        });

        let adapter = AddressBookAdapter::new(deps.book, 0, Vec::new(), shutdown);

        // Clients never listen; context is ready as soon as the runtime
        // exists.
        ctx_latch.signal();

        Ok(Self {
            shared,
            adapter,
            wheel,
            threads: Mutex::new(Vec::new()),
            ctx_latch,
        })
    }

    /// Attach to a router and wait for admission.
    pub fn start(&self) -> crate::Result<()> {
        self.ctx_latch.wait();

        let session = {
            let shared = Arc::clone(&self.shared);
            let adapter = self.adapter.clone();
            thread::Builder::new()
                .name("disc-client".into())
                .spawn(move || run_session_manager(shared, adapter))
                .expect("spawn client session manager")
        };
        self.threads
            .lock()
            .expect("thread list lock poisoned")
            .push(session);

        let deadline = self
            .shared
            .config
            .join_timeout()
            .map(|t| Instant::now() + t);
        let started = Instant::now();
        match self.shared.join_gate.wait_deadline(deadline) {
            Some(Ok(())) => {
                tracing::info!("client attached to topology");
                Ok(())
            }
            Some(Err(error)) => Err(error.into()),
            None => Err(JoinError::Timeout {
                waited_ms: started.elapsed().as_millis() as u64,
            }
            .into()),
        }
    }

    pub fn state(&self) -> SpiState {
        self.shared.state()
    }

    pub fn local_node(&self) -> NodeRecord {
        self.shared.local_node()
    }

    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.shared.topology.load()
    }

    /// Direct liveness probe; clients may dial topology members directly
    /// even though discovery traffic stays on the router.
    pub fn ping(&self, node_id: NodeId) -> bool {
        if node_id == self.shared.local_id {
            return self.state() == SpiState::Connected;
        }
        let snapshot = self.shared.topology.load();
        let Some(node) = snapshot.node(node_id) else {
            return false;
        };

        let envelope = Envelope::new(
            self.shared.local_id,
            Message::Ping(crate::wire::Ping { target: node_id }),
        );
        for addr in node.socket_addresses() {
            let Ok(sock) = self.shared.sock_io.open(addr) else {
                continue;
            };
            if self.shared.sock_io.write_message(&sock, &envelope).is_ok()
                && matches!(
                    self.shared
                        .sock_io
                        .read_receipt(&sock, self.shared.config.network_timeout()),
                    Ok(Receipt::Ok)
                )
            {
                return true;
            }
        }
        false
    }

    pub fn send_custom_event(&self, payload: Bytes) -> crate::Result<()> {
        if self.state() != SpiState::Connected {
            return Err(crate::Error::Shutdown);
        }
        self.shared.send_via_router(Envelope::new(
            self.shared.local_id,
            Message::CustomEvent(crate::wire::CustomEvent { payload }),
        ))
    }

    pub fn fail_node(&self, node_id: NodeId) -> crate::Result<()> {
        let snapshot = self.shared.topology.load();
        let Some(node) = snapshot.node(node_id) else {
            return Ok(());
        };
        self.shared.send_via_router(Envelope::new(
            self.shared.local_id,
            Message::NodeFailed(NodeFailed {
                node_id,
                node_order: node.order,
                version: crate::core::TopologyVersion::ZERO,
            }),
        ))
    }

    pub fn stop(&self) {
        if self.shared.state() == SpiState::Stopped {
            return;
        }
        if self.shared.state() == SpiState::Connected {
            let _ = self.shared.send_via_router(Envelope::new(
                self.shared.local_id,
                Message::NodeLeft(NodeLeft {
                    node_id: self.shared.local_id,
                    version: crate::core::TopologyVersion::ZERO,
                }),
            ));
            thread::sleep(self.shared.config.effective_socket_timeout());
        }

        self.shared.shutdown.store(true, Ordering::Relaxed);
        // Release a starter still parked on the join gate.
        self.shared.join_gate.complete(Err(JoinError::Interrupted));
        let mut threads = self.threads.lock().expect("thread list lock poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.wheel.shutdown();
        self.shared.set_state(SpiState::Stopped);
        tracing::info!("client discovery stopped");
    }
}

// ---- session management ---------------------------------------------------

enum SessionEnd {
    /// Socket or liveness failure: reconnect with fast-forward.
    RouterLost,
    /// The ring failed us; rejoin from scratch.
    Failed,
    /// Fatal admission verdict or local shutdown.
    Stop,
}

fn run_session_manager(shared: Arc<ClientShared>, adapter: AddressBookAdapter) {
    let mut fresh_join = true;

    'outer: while !shared.is_stopping() {
        // One reconnect budget per attachment loss.
        let reconnect_deadline = Instant::now()
            + shared.config.network_timeout() * shared.config.reconnect_count;

        loop {
            if shared.is_stopping() {
                break 'outer;
            }

            let endpoints = match adapter.resolved_addresses() {
                Ok(endpoints) => endpoints,
                Err(err) => {
                    tracing::warn!("client could not resolve peers: {err}");
                    break 'outer;
                }
            };

            for endpoint in &endpoints {
                let Ok(addrs) = endpoint.resolve() else {
                    continue;
                };
                for addr in addrs {
                    match run_session(&shared, addr, fresh_join) {
                        Ok(SessionEnd::RouterLost) => {
                            tracing::warn!(router = %addr, "router connection lost, reconnecting");
                            shared.stats.on_ring_reconnect();
                            fresh_join = false;
                            continue 'outer;
                        }
                        Ok(SessionEnd::Failed) => {
                            tracing::warn!("client was failed by the ring, rejoining");
                            fresh_join = true;
                            continue 'outer;
                        }
                        Ok(SessionEnd::Stop) => break 'outer,
                        Err(err) => {
                            tracing::debug!(router = %addr, "router attach failed: {err}");
                        }
                    }
                }
            }

            if Instant::now() >= reconnect_deadline {
                tracing::warn!("client reconnect budget exhausted");
                let snapshot = shared.topology.load();
                shared.set_state(SpiState::Disconnecting);
                shared.listeners.notify(
                    &DiscoveryEvent::Disconnected,
                    &Arc::new(snapshot.as_ref().clone()),
                );
                shared
                    .join_gate
                    .complete(Err(JoinError::NoPeers));
                break 'outer;
            }
            thread::sleep(Duration::from_millis(500));
        }
    }
}

/// One attachment to one router: handshake, admission, then the event pump
/// until the session ends.
fn run_session(
    shared: &Arc<ClientShared>,
    router: SocketAddr,
    fresh_join: bool,
) -> Result<SessionEnd, SockError> {
    let sock = shared.sock_io.open(router)?;
    let local = shared.local_node();

    let attach = if fresh_join {
        Message::ClientJoin(ClientJoin { node: local.clone() })
    } else {
        Message::ClientReconnect(ClientReconnect {
            node: local.clone(),
            last_version: shared.topology.load().version,
        })
    };
    let envelope = Envelope::new(shared.local_id, attach);
    shared.sock_io.write_message(&sock, &envelope)?;

    match shared
        .sock_io
        .read_receipt(&sock, shared.config.network_timeout())?
    {
        Receipt::Ok => {}
        Receipt::Reconnect => {
            // The router cannot fast-forward us; retry as a fresh join.
            if !fresh_join {
                tracing::info!("router demands a fresh join");
                drop(sock);
                return run_session(shared, router, true);
            }
            return Err(SockError::Closed);
        }
        refusal => {
            let local_id = shared.local_id;
            let error = match refusal {
                Receipt::DuplicateId => JoinError::DuplicateId { id: local_id },
                Receipt::AuthFailed => JoinError::AuthFailed { id: local_id },
                _ => JoinError::VersionIncompatible {
                    local: local.version.to_string(),
                },
            };
            shared.set_state(SpiState::Disconnecting);
            shared.join_gate.complete(Err(error));
            return Ok(SessionEnd::Stop);
        }
    }

    // Outbound pump: application messages, padded with our heartbeats.
    let (tx, rx) = crossbeam::channel::unbounded::<Envelope>();
    *shared.router_tx.lock().expect("router lock poisoned") = Some(tx);
    let pump = spawn_outbound_pump(Arc::clone(shared), sock.try_clone().map_err(SockError::Io)?, rx);

    let end = run_event_pump(shared, &sock);

    *shared.router_tx.lock().expect("router lock poisoned") = None;
    drop(sock);
    let _ = pump.join();
    end
}

fn spawn_outbound_pump(
    shared: Arc<ClientShared>,
    sock: std::net::TcpStream,
    rx: Receiver<Envelope>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("disc-client-out".into())
        .spawn(move || {
            let freq = shared.config.heartbeat_frequency();
            let mut last_heartbeat = Instant::now();
            loop {
                if shared.is_stopping() {
                    break;
                }
                match rx.recv_timeout(freq.min(Duration::from_millis(100))) {
                    Ok(envelope) => {
                        if shared.sock_io.write_message(&sock, &envelope).is_err() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if last_heartbeat.elapsed() >= freq {
                    let mut metrics = shared.metrics.snapshot();
                    metrics.uptime_ms = shared.started_at.elapsed().as_millis() as u64;
                    let mut map = std::collections::BTreeMap::new();
                    map.insert(shared.local_id, metrics);
                    let heartbeat = Envelope::new(
                        shared.local_id,
                        Message::Heartbeat(Heartbeat { metrics: map }),
                    );
                    if shared.sock_io.write_message(&sock, &heartbeat).is_err() {
                        break;
                    }
                    last_heartbeat = Instant::now();
                }
            }
        })
        .expect("spawn client outbound pump")
}

/// Inbound pump: applies topology traffic pushed by the router and watches
/// the router's own heartbeat deadline.
fn run_event_pump(shared: &Arc<ClientShared>, sock: &std::net::TcpStream) -> Result<SessionEnd, SockError> {
    let freq = shared.config.heartbeat_frequency();
    let deadline = freq * shared.config.max_missed_client_heartbeats + freq;
    let mut last_activity = Instant::now();
    let mut recent = RecentIds::new(1_024);

    loop {
        if shared.is_stopping() {
            return Ok(SessionEnd::Stop);
        }
        if last_activity.elapsed() > deadline {
            tracing::warn!("router went silent beyond the heartbeat budget");
            return Ok(SessionEnd::RouterLost);
        }

        let envelope = match shared.sock_io.read_message(sock, Duration::from_millis(100)) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(SessionEnd::RouterLost),
            Err(SockError::Timeout { .. }) => continue,
            Err(err) => {
                tracing::debug!("router read failed: {err}");
                return Ok(SessionEnd::RouterLost);
            }
        };
        last_activity = Instant::now();

        if !recent.insert(envelope.id) {
            continue;
        }
        match apply_client_message(shared, envelope) {
            Some(end) => return Ok(end),
            None => {}
        }
    }
}

fn apply_client_message(shared: &Arc<ClientShared>, envelope: Envelope) -> Option<SessionEnd> {
    match envelope.message {
        Message::NodeAdded(msg) => {
            let snapshot = shared.topology.load();
            let next = if msg.node.id == shared.local_id {
                let mut local = shared.local.lock().expect("local node lock poisoned");
                local.order = msg.node.order;
                drop(local);

                let mut adopted = TopologySnapshot::new(msg.version, msg.members);
                adopted.pending.insert(shared.local_id);
                adopted
            } else {
                if msg.version <= snapshot.version {
                    return None;
                }
                snapshot.with_member(msg.node, msg.version)
            };
            publish(shared, next);
        }
        Message::NodeAddedFinished(msg) => {
            let snapshot = shared.topology.load();
            let node = snapshot.node(msg.node_id)?.clone();
            let published = publish(shared, snapshot.with_finished(msg.node_id));
            shared.stats.on_node_joined();
            shared
                .listeners
                .notify(&DiscoveryEvent::NodeJoined(node), &published);
            if msg.node_id == shared.local_id {
                shared.set_state(SpiState::Connected);
                shared.join_gate.complete(Ok(()));
            }
        }
        Message::NodeLeft(msg) if msg.version.is_assigned() => {
            let snapshot = shared.topology.load();
            let node = snapshot.node(msg.node_id)?.clone();
            let published = publish(shared, snapshot.without_member(msg.node_id, msg.version));
            shared.stats.on_node_left();
            shared
                .listeners
                .notify(&DiscoveryEvent::NodeLeft(node), &published);
        }
        Message::NodeFailed(msg) if msg.version.is_assigned() => {
            if msg.node_id == shared.local_id {
                return Some(SessionEnd::Failed);
            }
            let snapshot = shared.topology.load();
            let node = snapshot.node(msg.node_id)?.clone();
            let published = publish(shared, snapshot.without_member(msg.node_id, msg.version));
            shared.stats.on_node_failed();
            shared
                .listeners
                .notify(&DiscoveryEvent::NodeFailed(node), &published);
        }
        Message::CustomEventAck(msg) => {
            let snapshot = shared.topology.load();
            if msg.version > snapshot.version {
                let published = publish(shared, snapshot.at_version(msg.version));
                shared
                    .listeners
                    .notify(&DiscoveryEvent::Custom(msg.payload), &published);
            }
        }
        Message::RejectJoin(msg) if msg.target == shared.local_id => {
            let local = shared.local_node();
            let error = match msg.reason {
                RejectReason::DuplicateId => JoinError::DuplicateId { id: local.id },
                RejectReason::AuthFailed => JoinError::AuthFailed { id: local.id },
                RejectReason::VersionCheckFailed => JoinError::VersionIncompatible {
                    local: local.version.to_string(),
                },
            };
            shared.set_state(SpiState::Disconnecting);
            shared.join_gate.complete(Err(error));
            return Some(SessionEnd::Stop);
        }
        // Ring heartbeats only refresh the router liveness clock, which the
        // caller already did.
        _ => {}
    }
    None
}

fn publish(shared: &Arc<ClientShared>, snapshot: TopologySnapshot) -> Arc<TopologySnapshot> {
    let published = shared.topology.publish(snapshot);
    shared
        .history
        .lock()
        .expect("history lock poisoned")
        .push(Arc::clone(&published));
    published
}
