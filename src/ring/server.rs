//! Server (ring member) runtime: listener, accept loop, inbound readers,
//! the join protocol, and the public operation surface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::addrs::AddressBookAdapter;
use crate::config::{ConfigError, DiscoveryConfig};
use crate::core::{
    ListenerSet, NodeId, NodeRecord, SharedTopology, SpiState, TopologyHistory, TopologySnapshot,
    TopologyVersion,
};
use crate::error::JoinError;
use crate::sock::{SockError, SockIo, TimeoutWheel};
use crate::spi::{AddressBook, Codec, DataExchange, MetricsSource, NodeAuthenticator};
use crate::stats::DiscoveryStats;
use crate::test_support::TestHooks;
use crate::util::Latch;
use crate::wire::{Envelope, JoinRequest, Message, Receipt};

use super::worker::WorkerCmd;
use super::writer::WriterCmd;
use super::{JoinGate, RingShared, worker, writer};

/// Cadence of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(25);
/// Read timeout per iteration of an inbound reader; bounds shutdown
/// latency.
const READER_POLL: Duration = Duration::from_millis(500);
/// Retry cadence of the outer join loop.
const JOIN_RETRY: Duration = Duration::from_millis(2_000);

pub(crate) struct ServerDeps {
    pub config: DiscoveryConfig,
    pub node_id: NodeId,
    pub book: Arc<dyn AddressBook>,
    pub codec: Arc<dyn Codec>,
    pub listeners: ListenerSet,
    pub authenticator: Arc<dyn NodeAuthenticator>,
    pub metrics: Arc<dyn MetricsSource>,
    pub exchange: Arc<dyn DataExchange>,
}

/// A ring member. Construction binds the listener and spawns the worker
/// threads; `start` runs the join protocol.
pub struct ServerNode {
    shared: Arc<RingShared>,
    worker_tx: Sender<WorkerCmd>,
    writer_tx: Sender<WriterCmd>,
    adapter: AddressBookAdapter,
    wheel: TimeoutWheel,
    bind_addr: SocketAddr,
    threads: Mutex<Vec<JoinHandle<()>>>,
    ctx_latch: Arc<Latch>,
}

impl ServerNode {
    pub(crate) fn new(deps: ServerDeps, ctx_latch: Arc<Latch>) -> crate::Result<Self> {
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

        let local_host = resolve_local_host(config.local_address);
        let (listener, bind_addr) = bind_listener(local_host, &config)?;
        tracing::info!(%bind_addr, "discovery listener bound");

        let local = NodeRecord::new(deps.node_id, vec![bind_addr], bind_addr.port())
            .with_external_addrs(config.external_addresses.clone())
            .as_local();

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(RingShared {
            local_id: deps.node_id,
            local: Mutex::new(local),
            topology: SharedTopology::default(),
            history: Mutex::new(TopologyHistory::new(config.topology_history_size)),
            listeners: deps.listeners,
            pending: Mutex::new(super::PendingLog::new(config.pending_messages_limit)),
            stats,
            state: Mutex::new(SpiState::Connecting),
            shutdown: Arc::clone(&shutdown),
            sock_io,
            authenticator: deps.authenticator,
            metrics: deps.metrics,
            exchange: deps.exchange,
            join_gate: JoinGate::new(),
            hooks: Arc::new(TestHooks::new()),
            started_at: Instant::now(),
            config,
        });

        let adapter = AddressBookAdapter::new(
            deps.book,
            bind_addr.port(),
            shared.local_node().socket_addresses(),
            Arc::clone(&shutdown),
        );

        let (worker_tx, worker_rx) = crossbeam::channel::unbounded();
        let (writer_tx, writer_rx) = crossbeam::channel::unbounded();

        let mut threads = Vec::new();
        threads.push(worker::spawn(
            Arc::clone(&shared),
            worker_rx,
            worker_tx.clone(),
            writer_tx.clone(),
        ));
        threads.push(writer::spawn(
            Arc::clone(&shared),
            writer_rx,
            worker_tx.clone(),
        ));
        threads.push(spawn_accept_loop(
            listener,
            Arc::clone(&shared),
            worker_tx.clone(),
        ));
        threads.push(spawn_heartbeat_timer(
            Arc::clone(&shared),
            worker_tx.clone(),
        ));
        threads.push(spawn_maintenance(Arc::clone(&shared), adapter.clone()));

        ctx_latch.signal();

        Ok(Self {
            shared,
            worker_tx,
            writer_tx,
            adapter,
            wheel,
            bind_addr,
            threads: Mutex::new(threads),
            ctx_latch,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn test_hooks(&self) -> Arc<TestHooks> {
        Arc::clone(&self.shared.hooks)
    }

    // ---- join protocol ---------------------------------------------------

    /// Discover peers and join the ring; blocks until the local
    /// `NodeAddedFinished` arrives or admission fails.
    pub fn start(&self) -> crate::Result<()> {
        self.ctx_latch.wait();
        self.adapter.register_local();

        let deadline = self.shared.config.join_timeout().map(|t| Instant::now() + t);
        let started = Instant::now();

        loop {
            if self.shared.is_stopping() {
                return Err(crate::Error::Shutdown);
            }

            let endpoints = self.adapter.resolved_addresses()?;
            if endpoints.is_empty() {
                self.become_first_node();
                return Ok(());
            }

            for endpoint in &endpoints {
                let addrs = match endpoint.resolve() {
                    Ok(addrs) => addrs,
                    Err(err) => {
                        tracing::warn!("failed to resolve {endpoint} (will retry): {err}");
                        continue;
                    }
                };
                for addr in addrs {
                    match self.try_join(addr) {
                        JoinAttempt::Accepted => {
                            tracing::debug!(%addr, "join request accepted, awaiting admission");
                            return self.await_admission(deadline, started);
                        }
                        JoinAttempt::Rejected(error) => return Err(error.into()),
                        JoinAttempt::Unreachable => {}
                    }
                }
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(JoinError::Timeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                }
                .into());
            }
            tracing::info!(
                tried = endpoints.len(),
                "no peer accepted the join request yet, retrying"
            );
            thread::sleep(JOIN_RETRY);
        }
    }

    fn try_join(&self, addr: SocketAddr) -> JoinAttempt {
        let sock = match self.shared.sock_io.open(addr) {
            Ok(sock) => sock,
            Err(err) => {
                tracing::debug!(%addr, "join connect failed: {err}");
                return JoinAttempt::Unreachable;
            }
        };

        let local = self.shared.local_node();
        let discovery_data = self.shared.exchange.collect(&local);
        let envelope = Envelope::new(
            local.id,
            Message::JoinRequest(JoinRequest {
                node: local.clone(),
                discovery_data,
            }),
        );
        if let Err(err) = self.shared.sock_io.write_message(&sock, &envelope) {
            tracing::debug!(%addr, "join request write failed: {err}");
            return JoinAttempt::Unreachable;
        }

        match self
            .shared
            .sock_io
            .read_receipt(&sock, self.shared.config.network_timeout())
        {
            Ok(Receipt::Ok) => JoinAttempt::Accepted,
            Ok(Receipt::DuplicateId) => {
                JoinAttempt::Rejected(JoinError::DuplicateId { id: local.id })
            }
            Ok(Receipt::AuthFailed) => JoinAttempt::Rejected(JoinError::AuthFailed { id: local.id }),
            Ok(Receipt::VersionCheckFailed) => JoinAttempt::Rejected(JoinError::VersionIncompatible {
                local: local.version.to_string(),
            }),
            Ok(Receipt::Reconnect) => JoinAttempt::Unreachable,
            Err(err) => {
                tracing::debug!(%addr, "join receipt failed: {err}");
                JoinAttempt::Unreachable
            }
        }
    }

    fn await_admission(&self, deadline: Option<Instant>, started: Instant) -> crate::Result<()> {
        match self.shared.join_gate.wait_deadline(deadline) {
            Some(Ok(())) => {
                let local = self.shared.local_node();
                tracing::info!(order = %local.order, "joined topology");
                Ok(())
            }
            Some(Err(error)) => Err(error.into()),
            None => Err(JoinError::Timeout {
                waited_ms: started.elapsed().as_millis() as u64,
            }
            .into()),
        }
    }

    /// No peers to talk to: bootstrap a single-node ring with ourselves as
    /// coordinator.
    fn become_first_node(&self) {
        let mut local = self.shared.local.lock().expect("local node lock poisoned");
        local.order = crate::core::NodeOrder::new(1);
        let record = local.clone();
        drop(local);

        let snapshot = TopologySnapshot::new(TopologyVersion::new(1), vec![record]);
        let published = self.shared.topology.publish(snapshot);
        self.shared
            .history
            .lock()
            .expect("history lock poisoned")
            .push(published);
        self.shared.set_state(SpiState::Connected);
        self.shared.join_gate.complete(Ok(()));
        tracing::info!("started as the first node of a new cluster");
    }

    // ---- operations ------------------------------------------------------

    pub fn state(&self) -> SpiState {
        self.shared.state()
    }

    pub fn local_node(&self) -> NodeRecord {
        self.shared.local_node()
    }

    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.shared.topology.load()
    }

    pub fn message_worker_queue_size(&self) -> usize {
        self.worker_tx.len()
    }

    /// Direct liveness probe, usable for any topology member.
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

    pub fn send_custom_event(&self, payload: bytes::Bytes) -> crate::Result<()> {
        if self.state() != SpiState::Connected {
            return Err(crate::Error::Shutdown);
        }
        self.worker_tx
            .send(WorkerCmd::SendCustom(payload))
            .map_err(|_| crate::Error::Shutdown)
    }

    pub fn fail_node(&self, node_id: NodeId) -> crate::Result<()> {
        self.worker_tx
            .send(WorkerCmd::FailNode(node_id))
            .map_err(|_| crate::Error::Shutdown)
    }

    /// Cooperative shutdown: announce departure, stop every worker, join
    /// the threads.
    pub fn stop(&self) {
        if self.shared.state() == SpiState::Stopped {
            return;
        }
        if self.shared.state() == SpiState::Connected {
            let _ = self.worker_tx.send(WorkerCmd::Leave);
            // Let the departure drain through the worker and the writer
            // before tearing the threads down.
            let deadline = Instant::now() + Duration::from_secs(1);
            while (!self.worker_tx.is_empty() || !self.writer_tx.is_empty())
                && Instant::now() < deadline
            {
                thread::sleep(Duration::from_millis(10));
            }
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
        tracing::info!("discovery stopped");
    }
}

enum JoinAttempt {
    Accepted,
    Rejected(JoinError),
    Unreachable,
}

// ---- listener and inbound connections -----------------------------------

fn bind_listener(
    host: IpAddr,
    config: &DiscoveryConfig,
) -> Result<(TcpListener, SocketAddr), ConfigError> {
    let from = config.local_port;
    let to = config.local_port + config.local_port_range;
    for port in from..=to {
        match TcpListener::bind(SocketAddr::new(host, port)) {
            Ok(listener) => {
                let addr = listener.local_addr().map_err(|err| ConfigError::Invalid {
                    option: "local_port",
                    reason: err.to_string(),
                })?;
                return Ok((listener, addr));
            }
            Err(err) => {
                tracing::debug!(port, "bind failed: {err}");
            }
        }
    }
    Err(ConfigError::Invalid {
        option: "local_port",
        reason: format!("no free port in [{from}, {to}] on {host}"),
    })
}

/// Local bind host: configured value, else the interface the OS routes
/// externally, else loopback.
fn resolve_local_host(configured: Option<IpAddr>) -> IpAddr {
    if let Some(host) = configured {
        return host;
    }
    // Routing probe; no packet is sent.
    if let Ok(probe) = UdpSocket::bind("0.0.0.0:0")
        && probe.connect("198.51.100.1:53").is_ok()
        && let Ok(addr) = probe.local_addr()
        && !addr.ip().is_loopback()
        && !addr.ip().is_unspecified()
    {
        return addr.ip();
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn spawn_accept_loop(
    listener: TcpListener,
    shared: Arc<RingShared>,
    worker_tx: Sender<WorkerCmd>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("disc-accept".into())
        .spawn(move || run_accept_loop(listener, shared, worker_tx))
        .expect("spawn accept loop")
}

fn run_accept_loop(listener: TcpListener, shared: Arc<RingShared>, worker_tx: Sender<WorkerCmd>) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("accept loop failed to set nonblocking: {err}");
        return;
    }

    loop {
        if shared.is_stopping() {
            break;
        }

        match listener.accept() {
            Ok((sock, peer)) => {
                shared.hooks.on_connection(peer);
                let shared = Arc::clone(&shared);
                let worker_tx = worker_tx.clone();
                let _ = thread::Builder::new()
                    .name("disc-reader".into())
                    .spawn(move || {
                        if let Err(err) = run_reader(sock, peer, &shared, &worker_tx) {
                            tracing::debug!(%peer, "inbound connection closed: {err}");
                        }
                    });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

fn run_reader(
    sock: TcpStream,
    peer: SocketAddr,
    shared: &Arc<RingShared>,
    worker_tx: &Sender<WorkerCmd>,
) -> Result<(), SockError> {
    sock.set_nodelay(true).map_err(SockError::Io)?;
    shared.sock_io.accept_handshake(&sock)?;

    // After a client attaches, the pushed event stream owns the outbound
    // direction; per-message receipts stop so the two never interleave.
    let mut client_session = false;

    loop {
        if shared.is_stopping() {
            return Ok(());
        }

        let envelope = match shared.sock_io.read_message(&sock, READER_POLL) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(()),
            Err(SockError::Timeout { .. }) => continue,
            Err(err) => return Err(err),
        };

        match &envelope.message {
            Message::JoinRequest(request) if is_first_hop(&envelope, request.node.id) => {
                let receipt = admission_precheck(shared, &request.node);
                shared.sock_io.write_receipt(&sock, receipt)?;
                if receipt != Receipt::Ok {
                    tracing::info!(%peer, node = %request.node.id, receipt = ?receipt, "join refused at first hop");
                    return Ok(());
                }
                let _ = worker_tx.send(WorkerCmd::Inbound(envelope));
            }
            Message::ClientJoin(join) if is_first_hop(&envelope, join.node.id) => {
                let receipt = admission_precheck(shared, &join.node);
                shared.sock_io.write_receipt(&sock, receipt)?;
                if receipt != Receipt::Ok {
                    tracing::info!(%peer, node = %join.node.id, receipt = ?receipt, "client join refused");
                    return Ok(());
                }
                attach_client(shared, worker_tx, &sock, join.node.id)?;
                client_session = true;
                let _ = worker_tx.send(WorkerCmd::Inbound(envelope));
            }
            Message::ClientReconnect(reconnect) => {
                let snapshot = shared.topology.load();
                let reaches = shared
                    .pending
                    .lock()
                    .expect("pending log lock poisoned")
                    .reaches_back_to(reconnect.last_version);
                if !snapshot.contains(reconnect.node.id) || !reaches {
                    // The client was failed, or the log no longer reaches
                    // back; force a fresh join.
                    shared.sock_io.write_receipt(&sock, Receipt::Reconnect)?;
                    return Ok(());
                }
                shared.sock_io.write_receipt(&sock, Receipt::Ok)?;
                attach_client(shared, worker_tx, &sock, reconnect.node.id)?;
                client_session = true;
                let _ = worker_tx.send(WorkerCmd::ClientReplay {
                    node_id: reconnect.node.id,
                    last_version: reconnect.last_version,
                });
            }
            _ => {
                if !client_session {
                    shared.sock_io.write_receipt(&sock, Receipt::Ok)?;
                }
                let _ = worker_tx.send(WorkerCmd::Inbound(envelope));
            }
        }
    }
}

/// A join message straight from the joiner, as opposed to one riding the
/// ring: nobody has endorsed it yet.
fn is_first_hop(envelope: &Envelope, joiner: NodeId) -> bool {
    envelope.creator == joiner && envelope.verifier == envelope.creator
}

/// First-hop admission check against the local snapshot. The coordinator
/// remains the authority; this only refuses joins that are already known to
/// be doomed.
fn admission_precheck(shared: &Arc<RingShared>, node: &NodeRecord) -> Receipt {
    if shared.is_stopping() {
        return Receipt::Reconnect;
    }
    let snapshot = shared.topology.load();
    if node.id == shared.local_id || snapshot.contains(node.id) {
        return Receipt::DuplicateId;
    }
    if !shared.authenticator.authenticate(node) {
        return Receipt::AuthFailed;
    }
    if !shared.local_node().version.compatible_with(&node.version) {
        return Receipt::VersionCheckFailed;
    }
    Receipt::Ok
}

/// Registers a routed client and spawns the thread that pushes ring
/// traffic down its socket.
fn attach_client(
    shared: &Arc<RingShared>,
    worker_tx: &Sender<WorkerCmd>,
    sock: &TcpStream,
    node_id: NodeId,
) -> Result<(), SockError> {
    let out = sock.try_clone().map_err(SockError::Io)?;
    let (tx, rx) = crossbeam::channel::unbounded::<Envelope>();
    let shared = Arc::clone(shared);

    let _ = thread::Builder::new()
        .name("disc-client-writer".into())
        .spawn(move || {
            loop {
                if shared.is_stopping() {
                    break;
                }
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(envelope) => {
                        if let Err(err) = shared.sock_io.write_message(&out, &envelope) {
                            tracing::debug!(client = %node_id, "client push failed: {err}");
                            break;
                        }
                    }
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

    let _ = worker_tx.send(WorkerCmd::ClientAttached { node_id, tx });
    Ok(())
}

// ---- timers --------------------------------------------------------------

fn spawn_heartbeat_timer(
    shared: Arc<RingShared>,
    worker_tx: Sender<WorkerCmd>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("disc-heartbeat".into())
        .spawn(move || {
            let freq = shared.config.heartbeat_frequency();
            loop {
                if shared.is_stopping() {
                    break;
                }
                thread::sleep(freq);
                let _ = worker_tx.send(WorkerCmd::EmitHeartbeat);
                let _ = worker_tx.send(WorkerCmd::CheckHeartbeats);
            }
        })
        .expect("spawn heartbeat timer")
}

/// Statistics printing and coordinator-side address book cleaning.
fn spawn_maintenance(shared: Arc<RingShared>, adapter: AddressBookAdapter) -> JoinHandle<()> {
    thread::Builder::new()
        .name("disc-maintenance".into())
        .spawn(move || {
            let stats_freq = match shared.config.statistics_print_frequency_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            };
            let clean_freq = Duration::from_millis(shared.config.address_clean_frequency_ms);
            let mut last_stats = Instant::now();
            let mut last_clean = Instant::now();

            loop {
                if shared.is_stopping() {
                    break;
                }
                thread::sleep(Duration::from_millis(200));

                if let Some(freq) = stats_freq
                    && last_stats.elapsed() >= freq
                {
                    shared.stats.log_snapshot();
                    last_stats = Instant::now();
                }

                if last_clean.elapsed() >= clean_freq {
                    last_clean = Instant::now();
                    let snapshot = shared.topology.load();
                    let is_coordinator = snapshot
                        .coordinator()
                        .map(|n| n.id == shared.local_id)
                        .unwrap_or(false);
                    if is_coordinator {
                        let live = snapshot
                            .live_nodes()
                            .flat_map(|n| n.socket_addresses())
                            .collect();
                        adapter.clean(&live);
                    }
                }
            }
        })
        .expect("spawn maintenance timer")
}
