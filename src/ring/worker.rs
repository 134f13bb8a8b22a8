//! Message worker: the single-threaded serialization point.
//!
//! All state transitions (join, leave, fail, custom events, heartbeats)
//! happen here, in dequeue order; this is what yields the global total
//! order of coordinator-emitted events. The worker applies message
//! semantics, dispatches listeners, routes copies to attached clients, and
//! hands messages back to the ring writer for forwarding.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::core::{
    DiscoveryEvent, NodeId, NodeRecord, SpiState, TopologySnapshot, TopologyVersion,
};
use crate::error::JoinError;
use crate::spi::NodeMetrics;
use crate::util::RecentIds;
use crate::wire::{
    ClientJoin, CustomEvent, CustomEventAck, Discard, Envelope, Heartbeat, JoinRequest, Message,
    NodeAdded, NodeAddedFinished, NodeFailed, NodeLeft, RejectJoin, RejectReason, StatusCheck,
};

use super::writer::WriterCmd;
use super::RingShared;

const RECENT_IDS_CAP: usize = 4_096;

pub enum WorkerCmd {
    /// A message accepted from an inbound connection.
    Inbound(Envelope),
    /// Heartbeat timer tick: emit our own heartbeat.
    EmitHeartbeat,
    /// Heartbeat timer tick: check round trips and client deadlines.
    CheckHeartbeats,
    SendCustom(Bytes),
    FailNode(NodeId),
    /// Graceful departure of the local node.
    Leave,
    /// The writer (or a status-check probe) gave up on a neighbor.
    NeighborSuspect { suspect: NodeId },
    /// A status-check probe found the neighbor alive after all.
    StatusCheckOk,
    /// A client attached to this node as its router.
    ClientAttached {
        node_id: NodeId,
        tx: Sender<Envelope>,
    },
    /// Fast-forward a reconnecting client from the pending log.
    ClientReplay {
        node_id: NodeId,
        last_version: TopologyVersion,
    },
    ClientHeartbeat {
        node_id: NodeId,
        metrics: NodeMetrics,
    },
}

struct ClientHandle {
    tx: Sender<Envelope>,
    last_heartbeat: Instant,
    metrics: Option<NodeMetrics>,
}

pub(crate) fn spawn(
    shared: Arc<RingShared>,
    rx: Receiver<WorkerCmd>,
    self_tx: Sender<WorkerCmd>,
    writer_tx: Sender<WriterCmd>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("disc-msg-worker".into())
        .spawn(move || {
            let mut worker = RingWorker::new(shared, rx, self_tx, writer_tx);
            worker.run();
        })
        .expect("spawn message worker")
}

struct RingWorker {
    shared: Arc<RingShared>,
    rx: Receiver<WorkerCmd>,
    self_tx: Sender<WorkerCmd>,
    writer_tx: Sender<WriterCmd>,
    recent: RecentIds,
    clients: HashMap<NodeId, ClientHandle>,
    last_self_heartbeat: Instant,
    status_check_in_flight: bool,
}

impl RingWorker {
    fn new(
        shared: Arc<RingShared>,
        rx: Receiver<WorkerCmd>,
        self_tx: Sender<WorkerCmd>,
        writer_tx: Sender<WriterCmd>,
    ) -> Self {
        Self {
            shared,
            rx,
            self_tx,
            writer_tx,
            recent: RecentIds::new(RECENT_IDS_CAP),
            clients: HashMap::new(),
            last_self_heartbeat: Instant::now(),
            status_check_in_flight: false,
        }
    }

    fn run(&mut self) {
        loop {
            if self.shared.is_stopping() {
                break;
            }
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(cmd) => self.handle(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("message worker stopped");
    }

    fn handle(&mut self, cmd: WorkerCmd) {
        match cmd {
            WorkerCmd::Inbound(envelope) => self.handle_inbound(envelope),
            WorkerCmd::EmitHeartbeat => self.emit_heartbeat(),
            WorkerCmd::CheckHeartbeats => self.check_heartbeats(),
            WorkerCmd::SendCustom(payload) => self.send_custom(payload),
            WorkerCmd::FailNode(node_id) => self.request_node_failed(node_id),
            WorkerCmd::Leave => self.leave(),
            WorkerCmd::NeighborSuspect { suspect } => {
                self.status_check_in_flight = false;
                self.last_self_heartbeat = Instant::now();
                self.request_node_failed(suspect);
            }
            WorkerCmd::StatusCheckOk => {
                self.status_check_in_flight = false;
                self.last_self_heartbeat = Instant::now();
            }
            WorkerCmd::ClientAttached { node_id, tx } => {
                self.clients.insert(node_id, ClientHandle {
                    tx,
                    last_heartbeat: Instant::now(),
                    metrics: None,
                });
            }
            WorkerCmd::ClientReplay {
                node_id,
                last_version,
            } => self.replay_to_client(node_id, last_version),
            WorkerCmd::ClientHeartbeat { node_id, metrics } => {
                if let Some(handle) = self.clients.get_mut(&node_id) {
                    handle.last_heartbeat = Instant::now();
                    handle.metrics = Some(metrics);
                }
            }
        }
    }

    // ---- inbound dispatch ------------------------------------------------

    fn handle_inbound(&mut self, envelope: Envelope) {
        let fresh = self.recent.insert(envelope.id);
        if !fresh {
            if envelope.creator == self.shared.local_id {
                // Circled back to its creator.
                self.absorb(&envelope);
                return;
            }
            let snapshot = self.shared.topology.load();
            if !snapshot.contains(envelope.creator) {
                // Creator left or failed; nothing will ever absorb this.
                self.absorb(&envelope);
                return;
            }
            let creator_is_client = snapshot
                .node(envelope.creator)
                .map(|n| n.client)
                .unwrap_or(false);
            if creator_is_client && self.is_coordinator() {
                // Client creators never see their messages again; the
                // coordinator absorbs on their behalf.
                self.absorb(&envelope);
                return;
            }
            // Replayed duplicate: forward without re-applying.
            self.forward(envelope);
            return;
        }

        match envelope.message.clone() {
            Message::JoinRequest(msg) => self.on_join_request(envelope, msg),
            Message::RejectJoin(msg) => self.on_reject_join(envelope, msg),
            Message::NodeAdded(msg) => self.on_node_added(envelope, msg),
            Message::NodeAddedFinished(msg) => self.on_node_added_finished(envelope, msg),
            Message::NodeLeft(msg) => self.on_node_left(envelope, msg),
            Message::NodeFailed(msg) => self.on_node_failed(envelope, msg),
            Message::Heartbeat(msg) => self.on_heartbeat(envelope, msg),
            Message::StatusCheck(_) | Message::Ping(_) => {
                // Directed probes; the acceptance receipt was the reply.
            }
            Message::Discard(_) => self.forward(envelope),
            Message::CustomEvent(msg) => self.on_custom_event(envelope, msg),
            Message::CustomEventAck(msg) => self.on_custom_event_ack(envelope, msg),
            Message::ClientJoin(msg) => self.on_client_join(envelope, msg),
            Message::ClientReconnect(_) => {
                // Handled at the accepting connection; nothing rides the ring.
            }
        }
    }

    /// Terminal handling for a message that finished its trip around the
    /// ring.
    fn absorb(&mut self, envelope: &Envelope) {
        tracing::trace!(kind = envelope.kind().as_str(), id = %envelope.id, "absorbed");

        if matches!(envelope.message, Message::Heartbeat(_))
            && envelope.creator == self.shared.local_id
        {
            // Our own heartbeat made it all the way around.
            self.last_self_heartbeat = Instant::now();
            return;
        }

        if let Message::NodeAdded(msg) = &envelope.message
            && self.is_coordinator()
        {
            // Everyone has installed the node; promote it.
            self.emit(Message::NodeAddedFinished(NodeAddedFinished {
                node_id: msg.node.id,
            }));
        }

        if envelope.ensured() && self.is_coordinator() {
            self.emit(Message::Discard(Discard { up_to: envelope.id }));
        }
    }

    // ---- join protocol ---------------------------------------------------

    fn on_join_request(&mut self, envelope: Envelope, msg: JoinRequest) {
        if !self.is_coordinator() {
            self.forward(envelope);
            return;
        }
        self.admit(msg.node, msg.discovery_data);
    }

    fn on_client_join(&mut self, envelope: Envelope, msg: ClientJoin) {
        if !self.is_coordinator() {
            self.forward(envelope);
            return;
        }
        self.admit(msg.node, Bytes::new());
    }

    /// Coordinator-side admission: validate, assign the next order, and
    /// broadcast the add.
    fn admit(&mut self, mut node: NodeRecord, discovery_data: Bytes) {
        let snapshot = self.shared.topology.load();

        if snapshot.contains(node.id) {
            tracing::warn!(node = %node.id, "join rejected: duplicate node id");
            self.reject(&node, RejectReason::DuplicateId);
            return;
        }
        if !self.shared.authenticator.authenticate(&node) {
            tracing::warn!(node = %node.id, "join rejected: authentication failed");
            self.reject(&node, RejectReason::AuthFailed);
            return;
        }
        let local_version = self.shared.local_node().version;
        if !local_version.compatible_with(&node.version) {
            tracing::warn!(
                node = %node.id,
                remote = %node.version,
                local = %local_version,
                "join rejected: versions are not compatible"
            );
            self.reject(&node, RejectReason::VersionCheckFailed);
            return;
        }

        node.order = snapshot.max_order().next();
        let version = snapshot.version.next();
        let mut members: Vec<NodeRecord> = snapshot.members.clone();
        members.push(node.clone());
        members.sort();

        tracing::info!(node = %node.id, order = %node.order, %version, "admitting node");
        self.emit(Message::NodeAdded(NodeAdded {
            node,
            members,
            version,
            discovery_data,
        }));
    }

    fn reject(&mut self, node: &NodeRecord, reason: RejectReason) {
        let message = Message::RejectJoin(RejectJoin {
            target: node.id,
            reason,
        });
        if node.client {
            // Clients are reachable only through their router; let the
            // verdict ride the ring until the router delivers it.
            self.emit(message);
            return;
        }

        // Server joiners listen on their discovery port.
        let envelope = Envelope::new(self.shared.local_id, message);
        let sock_io = self.shared.sock_io.clone();
        let addrs = node.socket_addresses();
        let node_id = node.id;
        thread::spawn(move || {
            for addr in addrs {
                match sock_io.open(addr) {
                    Ok(sock) => {
                        if sock_io.write_message(&sock, &envelope).is_ok() {
                            let _ = sock_io.read_receipt(&sock, Duration::from_millis(500));
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(node = %node_id, %addr, "reject delivery failed: {err}");
                    }
                }
            }
        });
    }

    fn on_reject_join(&mut self, envelope: Envelope, msg: RejectJoin) {
        if msg.target == self.shared.local_id {
            let local = self.shared.local_node();
            let error = match msg.reason {
                RejectReason::DuplicateId => JoinError::DuplicateId { id: local.id },
                RejectReason::AuthFailed => JoinError::AuthFailed { id: local.id },
                RejectReason::VersionCheckFailed => JoinError::VersionIncompatible {
                    local: local.version.to_string(),
                },
            };
            self.shared.set_state(SpiState::Disconnecting);
            self.shared.join_gate.complete(Err(error));
            return;
        }
        if let Some(handle) = self.clients.get(&msg.target) {
            let _ = handle.tx.send(envelope);
            return;
        }
        self.forward(envelope);
    }

    fn on_node_added(&mut self, envelope: Envelope, msg: NodeAdded) {
        let snapshot = self.shared.topology.load();

        let next = if msg.node.id == self.shared.local_id {
            // Our own admission: adopt the coordinator's member list
            // wholesale, remember our assigned order.
            let mut local = self.shared.local.lock().expect("local node lock poisoned");
            local.order = msg.node.order;
            drop(local);

            let mut adopted = TopologySnapshot::new(msg.version, msg.members.clone());
            adopted.pending.insert(msg.node.id);
            adopted
        } else {
            self.shared
                .exchange
                .on_exchange(msg.node.id, &msg.discovery_data);
            snapshot.with_member(msg.node.clone(), msg.version)
        };

        self.publish(next);
        self.route_to_clients(&envelope);
        self.forward(envelope);
    }

    fn on_node_added_finished(&mut self, envelope: Envelope, msg: NodeAddedFinished) {
        let snapshot = self.shared.topology.load();
        let Some(node) = snapshot.node(msg.node_id).cloned() else {
            // Stale finish for a node that already left; keep it moving.
            self.forward(envelope);
            return;
        };

        let published = self.publish(snapshot.with_finished(msg.node_id));
        self.shared.stats.on_node_joined();
        self.shared
            .listeners
            .notify(&DiscoveryEvent::NodeJoined(node), &published);

        if msg.node_id == self.shared.local_id {
            self.shared.set_state(SpiState::Connected);
            self.last_self_heartbeat = Instant::now();
            self.shared.join_gate.complete(Ok(()));
        }

        self.route_to_clients(&envelope);
        self.forward(envelope);
    }

    // ---- leave and failure ----------------------------------------------

    fn on_node_left(&mut self, envelope: Envelope, msg: NodeLeft) {
        if !msg.version.is_assigned() {
            self.stamp_or_forward(envelope, StampKind::Left(msg.node_id));
            return;
        }

        let snapshot = self.shared.topology.load();
        let Some(node) = snapshot.node(msg.node_id).cloned() else {
            self.forward(envelope);
            return;
        };

        let was_coordinator = snapshot.coordinator().map(|n| n.id);
        let published = self.publish(snapshot.without_member(msg.node_id, msg.version));
        self.note_coordinator_change(was_coordinator, &published);
        self.shared.stats.on_node_left();
        self.shared
            .listeners
            .notify(&DiscoveryEvent::NodeLeft(node), &published);

        self.clients.remove(&msg.node_id);
        self.route_to_clients(&envelope);
        self.forward(envelope);
    }

    fn on_node_failed(&mut self, envelope: Envelope, msg: NodeFailed) {
        if !msg.version.is_assigned() {
            self.stamp_or_forward(envelope, StampKind::Failed(msg.node_id, msg.node_order));
            return;
        }

        if msg.node_id == self.shared.local_id {
            // The ring excised us; we are on our own now.
            tracing::warn!("local node was declared failed by the ring");
            let snapshot = self.shared.topology.load();
            let published = Arc::new(snapshot.as_ref().clone());
            self.shared.set_state(SpiState::Disconnecting);
            self.shared
                .listeners
                .notify(&DiscoveryEvent::Segmented, &published);
            return;
        }

        let snapshot = self.shared.topology.load();
        let Some(node) = snapshot.node(msg.node_id).cloned() else {
            self.forward(envelope);
            return;
        };

        tracing::info!(node = %msg.node_id, version = %msg.version, "node failed");
        if envelope.creator == self.shared.local_id {
            // We stamped the exclusion; tell the node itself, in case it is
            // still alive, so it can segment instead of lingering.
            self.notify_failed_node(&node, &envelope);
        }
        let was_coordinator = snapshot.coordinator().map(|n| n.id);
        let published = self.publish(snapshot.without_member(msg.node_id, msg.version));
        self.note_coordinator_change(was_coordinator, &published);
        self.shared.stats.on_node_failed();
        self.shared
            .listeners
            .notify(&DiscoveryEvent::NodeFailed(node), &published);

        self.clients.remove(&msg.node_id);
        self.route_to_clients(&envelope);
        self.forward(envelope);
    }

    /// Best-effort direct delivery of a stamped `NodeFailed` to its own
    /// subject.
    fn notify_failed_node(&self, node: &NodeRecord, envelope: &Envelope) {
        if node.client {
            // Routers drop failed clients themselves.
            return;
        }
        let sock_io = self.shared.sock_io.clone();
        let envelope = envelope.clone();
        let addrs = node.socket_addresses();
        thread::spawn(move || {
            for addr in addrs {
                if let Ok(sock) = sock_io.open(addr)
                    && sock_io.write_message(&sock, &envelope).is_ok()
                {
                    let _ = sock_io.read_receipt(&sock, Duration::from_millis(500));
                    return;
                }
            }
        });
    }

    /// Unstamped leave/fail messages ride the ring until the authoritative
    /// node (the coordinator of the post-event topology) absorbs them and
    /// re-emits a stamped copy.
    fn stamp_or_forward(&mut self, envelope: Envelope, kind: StampKind) {
        let target = match kind {
            StampKind::Left(id) | StampKind::Failed(id, _) => id,
        };
        if self.coordinator_excluding(target) != Some(self.shared.local_id) {
            self.forward(envelope);
            return;
        }

        let snapshot = self.shared.topology.load();
        if !snapshot.contains(target) {
            // Already removed by an earlier stamped message.
            return;
        }
        let version = snapshot.version.next();
        match kind {
            StampKind::Left(node_id) => {
                self.emit(Message::NodeLeft(NodeLeft { node_id, version }));
            }
            StampKind::Failed(node_id, node_order) => {
                self.emit(Message::NodeFailed(NodeFailed {
                    node_id,
                    node_order,
                    version,
                }));
            }
        }
    }

    /// Entry point for every failure report: the detector, the writer, a
    /// client deadline, or the public `fail_node`.
    fn request_node_failed(&mut self, node_id: NodeId) {
        let snapshot = self.shared.topology.load();
        let Some(node) = snapshot.node(node_id) else {
            return;
        };
        let node_order = node.order;

        if self.coordinator_excluding(node_id) == Some(self.shared.local_id) {
            let version = snapshot.version.next();
            self.emit(Message::NodeFailed(NodeFailed {
                node_id,
                node_order,
                version,
            }));
        } else {
            self.emit(Message::NodeFailed(NodeFailed {
                node_id,
                node_order,
                version: TopologyVersion::ZERO,
            }));
        }
    }

    fn leave(&mut self) {
        let snapshot = self.shared.topology.load();
        if snapshot.ring_nodes().count() < 2 {
            self.shared.set_state(SpiState::Disconnecting);
            return;
        }
        self.shared.set_state(SpiState::Disconnecting);
        if self.is_coordinator() {
            // Hand the stamped departure to the ring ourselves; our
            // successor takes over coordination as it applies it.
            let version = snapshot.version.next();
            self.emit(Message::NodeLeft(NodeLeft {
                node_id: self.shared.local_id,
                version,
            }));
        } else {
            self.emit(Message::NodeLeft(NodeLeft {
                node_id: self.shared.local_id,
                version: TopologyVersion::ZERO,
            }));
        }
    }

    // ---- heartbeats and the failure detector -----------------------------

    fn emit_heartbeat(&mut self) {
        if self.shared.state() != SpiState::Connected {
            return;
        }
        let mut metrics = BTreeMap::new();
        metrics.insert(self.shared.local_id, self.local_metrics());

        let snapshot = self.shared.topology.load();
        if snapshot.successors(self.shared.local_id).is_empty() {
            // Alone in the ring; the round trip is trivially healthy, but
            // attached clients still expect their heartbeats from us.
            self.last_self_heartbeat = Instant::now();
            if !self.clients.is_empty() {
                let envelope = Envelope::new(
                    self.shared.local_id,
                    Message::Heartbeat(Heartbeat { metrics }),
                );
                self.route_to_clients(&envelope);
            }
            return;
        }

        self.emit(Message::Heartbeat(Heartbeat { metrics }));
    }

    fn on_heartbeat(&mut self, mut envelope: Envelope, mut msg: Heartbeat) {
        let snapshot = self.shared.topology.load();
        if let Some(creator) = snapshot.node(envelope.creator)
            && creator.client
        {
            // A client heartbeat arriving through us: we are its router.
            let metrics = msg
                .metrics
                .get(&envelope.creator)
                .cloned()
                .unwrap_or_default();
            if let Some(handle) = self.clients.get_mut(&envelope.creator) {
                handle.last_heartbeat = Instant::now();
                handle.metrics = Some(metrics);
            }
            return;
        }

        // Fold in our own snapshot plus those of clients routed through us.
        msg.metrics.insert(self.shared.local_id, self.local_metrics());
        for (client_id, handle) in &self.clients {
            if let Some(metrics) = &handle.metrics {
                msg.metrics.insert(*client_id, metrics.clone());
            }
        }
        envelope.message = Message::Heartbeat(msg);

        self.route_to_clients(&envelope);
        self.forward(envelope);
    }

    fn check_heartbeats(&mut self) {
        if self.shared.state() != SpiState::Connected {
            return;
        }

        self.check_client_deadlines();

        let snapshot = self.shared.topology.load();
        let Some(neighbor) = snapshot.next_neighbor(self.shared.local_id).cloned() else {
            return;
        };

        let freq = self.shared.config.heartbeat_frequency();
        let budget = freq * self.shared.config.max_missed_heartbeats;
        if self.last_self_heartbeat.elapsed() <= budget + freq {
            return;
        }
        if self.status_check_in_flight {
            return;
        }

        tracing::warn!(
            neighbor = %neighbor.id,
            missed_for_ms = self.last_self_heartbeat.elapsed().as_millis() as u64,
            "own heartbeat went missing, probing next neighbor"
        );
        self.status_check_in_flight = true;
        self.spawn_status_check(neighbor);
    }

    /// Probe the silent neighbor off the worker thread; the result comes
    /// back as a command.
    fn spawn_status_check(&self, neighbor: NodeRecord) {
        let sock_io = self.shared.sock_io.clone();
        let worker_tx = self.self_tx.clone();
        let local_id = self.shared.local_id;
        let network_timeout = self.shared.config.network_timeout();

        thread::Builder::new()
            .name("disc-status-check".into())
            .spawn(move || {
                let envelope = Envelope::new(
                    local_id,
                    Message::StatusCheck(StatusCheck {
                        target: neighbor.id,
                    }),
                );
                let deadline = Instant::now() + network_timeout;
                for addr in neighbor.socket_addresses() {
                    if Instant::now() >= deadline {
                        break;
                    }
                    let Ok(sock) = sock_io.open(addr) else {
                        continue;
                    };
                    if sock_io.write_message(&sock, &envelope).is_ok()
                        && sock_io
                            .read_receipt(&sock, deadline.saturating_duration_since(Instant::now()))
                            .is_ok()
                    {
                        let _ = worker_tx.send(WorkerCmd::StatusCheckOk);
                        return;
                    }
                }
                tracing::warn!(neighbor = %neighbor.id, "status check failed, declaring node failed");
                let _ = worker_tx.send(WorkerCmd::NeighborSuspect {
                    suspect: neighbor.id,
                });
            })
            .expect("spawn status check");
    }

    fn check_client_deadlines(&mut self) {
        let freq = self.shared.config.heartbeat_frequency();
        let budget = freq * self.shared.config.max_missed_client_heartbeats;

        let expired: Vec<NodeId> = self
            .clients
            .iter()
            .filter(|(_, handle)| handle.last_heartbeat.elapsed() > budget + freq)
            .map(|(id, _)| *id)
            .collect();

        for node_id in expired {
            tracing::warn!(client = %node_id, "client missed its heartbeat deadline");
            self.clients.remove(&node_id);
            self.request_node_failed(node_id);
        }
    }

    fn local_metrics(&self) -> NodeMetrics {
        let mut metrics = self.shared.metrics.snapshot();
        metrics.uptime_ms = self.shared.started_at.elapsed().as_millis() as u64;
        metrics.message_queue_depth = self.rx.len() as u64;
        metrics
    }

    // ---- custom events ---------------------------------------------------

    fn send_custom(&mut self, payload: Bytes) {
        if self.is_coordinator() {
            let version = self.shared.topology.load().version.next();
            self.emit(Message::CustomEventAck(CustomEventAck { payload, version }));
        } else {
            self.emit(Message::CustomEvent(CustomEvent { payload }));
        }
    }

    fn on_custom_event(&mut self, envelope: Envelope, msg: CustomEvent) {
        if self.is_coordinator() {
            let version = self.shared.topology.load().version.next();
            self.emit(Message::CustomEventAck(CustomEventAck {
                payload: msg.payload,
                version,
            }));
        }
        // The original keeps circling to its creator; delivery happens on
        // the ack so every node sees the same position in the version
        // stream.
        self.forward(envelope);
    }

    fn on_custom_event_ack(&mut self, envelope: Envelope, msg: CustomEventAck) {
        let snapshot = self.shared.topology.load();
        let published = self.publish(snapshot.at_version(msg.version));
        self.shared
            .listeners
            .notify(&DiscoveryEvent::Custom(msg.payload), &published);
        self.route_to_clients(&envelope);
        self.forward(envelope);
    }

    // ---- plumbing --------------------------------------------------------

    /// Creates, applies, and forwards a locally originated message.
    fn emit(&mut self, message: Message) {
        let envelope = Envelope::new(self.shared.local_id, message);
        self.recent.insert(envelope.id);

        match envelope.message.clone() {
            Message::NodeAdded(msg) => self.on_node_added(envelope, msg),
            Message::NodeAddedFinished(msg) => self.on_node_added_finished(envelope, msg),
            Message::NodeLeft(msg) => self.on_node_left(envelope, msg),
            Message::NodeFailed(msg) => self.on_node_failed(envelope, msg),
            Message::CustomEventAck(msg) => self.on_custom_event_ack(envelope, msg),
            // Heartbeats, discards, rejects, and plain custom events have
            // no local effect at emission time.
            _ => self.forward(envelope),
        }
    }

    fn forward(&mut self, mut envelope: Envelope) {
        // Endorse before forwarding; the verifier marks the last node that
        // vouched for the message on its way around the ring.
        envelope.verifier = self.shared.local_id;
        let _ = self.writer_tx.send(WriterCmd::Forward(envelope));
    }

    /// Copies ring traffic to every attached client.
    fn route_to_clients(&mut self, envelope: &Envelope) {
        if self.clients.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for (client_id, handle) in &self.clients {
            if handle.tx.send(envelope.clone()).is_err() {
                dead.push(*client_id);
            }
        }
        for client_id in dead {
            tracing::debug!(client = %client_id, "client channel closed");
            self.clients.remove(&client_id);
        }
    }

    fn replay_to_client(&mut self, node_id: NodeId, last_version: TopologyVersion) {
        let entries = self
            .shared
            .pending
            .lock()
            .expect("pending log lock poisoned")
            .replay_since(last_version);
        let Some(handle) = self.clients.get(&node_id) else {
            return;
        };
        tracing::info!(client = %node_id, count = entries.len(), "fast-forwarding client");
        for envelope in entries {
            if handle.tx.send(envelope).is_err() {
                break;
            }
        }
    }

    fn publish(&self, snapshot: TopologySnapshot) -> Arc<TopologySnapshot> {
        let published = self.shared.topology.publish(snapshot);
        self.shared
            .history
            .lock()
            .expect("history lock poisoned")
            .push(Arc::clone(&published));
        published
    }

    fn is_coordinator(&self) -> bool {
        self.shared
            .topology
            .load()
            .coordinator()
            .map(|n| n.id == self.shared.local_id)
            .unwrap_or(false)
    }

    /// Coordinator of the topology that results from removing `excluded`;
    /// the node that must stamp a leave/fail event for `excluded`.
    fn coordinator_excluding(&self, excluded: NodeId) -> Option<NodeId> {
        self.shared
            .topology
            .load()
            .live_nodes()
            .filter(|n| n.is_server() && n.id != excluded)
            .min_by_key(|n| n.order)
            .map(|n| n.id)
    }

    fn note_coordinator_change(
        &self,
        before: Option<NodeId>,
        after: &Arc<TopologySnapshot>,
    ) {
        let now = after.coordinator().map(|n| n.id);
        if before != now {
            self.shared.stats.on_coordinator_change();
            if now == Some(self.shared.local_id) {
                tracing::info!("local node is now the coordinator");
            }
        }
    }
}

enum StampKind {
    Left(NodeId),
    Failed(NodeId, crate::core::NodeOrder),
}
