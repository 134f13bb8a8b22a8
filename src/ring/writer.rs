//! Ring writer: single owner of the outbound next-neighbor socket.
//!
//! Forwards messages handed over by the message worker, retries with a
//! doubling ack timeout, and on exhausting the retry budget skips to the
//! neighbor-after-next, replaying the pending log so the new neighbor sees
//! every ensure-delivery message it may have missed.

use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::core::{NodeId, NodeRecord};
use crate::wire::{Envelope, Message, Receipt};

use super::worker::WorkerCmd;
use super::{AckBackoff, RingShared};

pub enum WriterCmd {
    Forward(Envelope),
}

pub(crate) fn spawn(
    shared: Arc<RingShared>,
    rx: Receiver<WriterCmd>,
    worker_tx: Sender<WorkerCmd>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("disc-ring-writer".into())
        .spawn(move || {
            let mut writer = RingWriter::new(shared, rx, worker_tx);
            writer.run();
        })
        .expect("spawn ring writer")
}

struct RingWriter {
    shared: Arc<RingShared>,
    rx: Receiver<WriterCmd>,
    worker_tx: Sender<WorkerCmd>,
    /// Current outbound connection, tagged with the neighbor it reaches.
    sock: Option<(NodeId, TcpStream)>,
    backoff: AckBackoff,
    /// Set after a skip: the next successful connection must be fed the
    /// pending log before new traffic.
    replay_on_next_connect: bool,
}

impl RingWriter {
    fn new(shared: Arc<RingShared>, rx: Receiver<WriterCmd>, worker_tx: Sender<WorkerCmd>) -> Self {
        let backoff = AckBackoff::new(
            shared.config.effective_ack_timeout(),
            shared.config.max_ack_timeout(),
        );
        Self {
            shared,
            rx,
            worker_tx,
            sock: None,
            backoff,
            replay_on_next_connect: false,
        }
    }

    fn run(&mut self) {
        loop {
            if self.shared.is_stopping() {
                break;
            }
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(WriterCmd::Forward(envelope)) => self.forward(envelope),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("ring writer stopped");
    }

    fn forward(&mut self, envelope: Envelope) {
        self.shared.hooks.on_message(&envelope);

        if let Message::Discard(discard) = &envelope.message {
            self.shared
                .pending
                .lock()
                .expect("pending log lock poisoned")
                .discard_up_to(discard.up_to);
        } else if envelope.ensured() {
            let version_at = self.shared.topology.load().version;
            self.shared
                .pending
                .lock()
                .expect("pending log lock poisoned")
                .push(envelope.clone(), version_at);
        }

        self.send_with_failover(envelope);
    }

    /// Sends to the next neighbor, walking further around the ring as
    /// neighbors are exhausted. Every skipped neighbor is reported suspect.
    fn send_with_failover(&mut self, envelope: Envelope) {
        if self.shared.hooks.take_break_connection() {
            tracing::info!("ring connection broken by test hook");
            self.drop_sock();
        }
        let mut force_skip = self.shared.hooks.take_fail_next_neighbor();

        let snapshot = self.shared.topology.load();
        let successors: Vec<NodeRecord> = snapshot
            .successors(self.shared.local_id)
            .into_iter()
            .cloned()
            .collect();
        if successors.is_empty() {
            // Alone in the ring; nothing to forward to.
            return;
        }

        for (hop, target) in successors.iter().enumerate() {
            if force_skip {
                force_skip = false;
                tracing::info!(neighbor = %target.id, "neighbor skipped by test hook");
                self.drop_sock();
                self.mark_suspect(target.id);
                self.replay_on_next_connect = true;
                continue;
            }

            if self.send_to(target, &envelope) {
                return;
            }

            // Retry budget exhausted for this neighbor.
            self.mark_suspect(target.id);
            self.replay_on_next_connect = true;
        }

        tracing::error!(
            message = envelope.kind().as_str(),
            "ring is broken: no reachable successor"
        );
    }

    /// One neighbor, full retry budget. Returns `true` on acknowledged
    /// delivery.
    fn send_to(&mut self, target: &NodeRecord, envelope: &Envelope) -> bool {
        for attempt in 0..self.shared.config.reconnect_count {
            if self.shared.is_stopping() {
                return false;
            }

            if self
                .sock
                .as_ref()
                .map(|(id, _)| *id != target.id)
                .unwrap_or(false)
            {
                self.drop_sock();
            }

            if self.sock.is_none() {
                match self.connect(target) {
                    Some(sock) => {
                        if attempt > 0 || self.replay_on_next_connect {
                            self.shared.stats.on_ring_reconnect();
                        }
                        self.sock = Some((target.id, sock));
                        if self.replay_on_next_connect {
                            if !self.replay_pending() {
                                self.grow_backoff(target);
                                continue;
                            }
                            // Ensured messages ride along with the replay;
                            // only unretained traffic still needs a send.
                            if envelope.ensured() {
                                self.backoff.reset();
                                return true;
                            }
                        }
                    }
                    None => {
                        self.grow_backoff(target);
                        continue;
                    }
                }
            }

            if self.write_acked(envelope) {
                self.backoff.reset();
                return true;
            }
            self.grow_backoff(target);
        }
        false
    }

    fn connect(&self, target: &NodeRecord) -> Option<TcpStream> {
        for addr in target.socket_addresses() {
            match self.shared.sock_io.open(addr) {
                Ok(sock) => return Some(sock),
                Err(err) => {
                    tracing::debug!(neighbor = %target.id, %addr, "ring connect failed: {err}");
                }
            }
        }
        None
    }

    /// Feeds the entire pending log to a fresh neighbor after a skip.
    fn replay_pending(&mut self) -> bool {
        let entries = self
            .shared
            .pending
            .lock()
            .expect("pending log lock poisoned")
            .replay_all();
        if entries.is_empty() {
            self.replay_on_next_connect = false;
            return true;
        }

        tracing::info!(count = entries.len(), "replaying pending messages to new neighbor");
        for entry in &entries {
            if !self.write_acked(entry) {
                return false;
            }
        }
        self.shared.stats.on_pending_replay();
        self.replay_on_next_connect = false;
        true
    }

    /// One framed write plus its receipt within the current ack timeout.
    fn write_acked(&mut self, envelope: &Envelope) -> bool {
        let Some((neighbor, sock)) = &self.sock else {
            return false;
        };
        let neighbor = *neighbor;

        if let Err(err) = self.shared.sock_io.write_message(sock, envelope) {
            tracing::debug!(%neighbor, "ring write failed: {err}");
            self.drop_sock();
            return false;
        }

        match self.shared.sock_io.read_receipt(sock, self.backoff.current()) {
            Ok(Receipt::Ok) => true,
            Ok(other) => {
                tracing::warn!(%neighbor, receipt = ?other, "unexpected ring receipt");
                self.drop_sock();
                false
            }
            Err(err) => {
                tracing::debug!(
                    %neighbor,
                    timeout_ms = self.backoff.current().as_millis() as u64,
                    "no ring ack: {err}"
                );
                self.drop_sock();
                false
            }
        }
    }

    fn grow_backoff(&mut self, target: &NodeRecord) {
        tracing::debug!(
            neighbor = %target.id,
            next_timeout_ms = (self.backoff.current() * 2).as_millis() as u64,
            "growing ack timeout"
        );
        self.backoff.grow();
    }

    fn mark_suspect(&mut self, suspect: NodeId) {
        let _ = self.worker_tx.send(WorkerCmd::NeighborSuspect { suspect });
    }

    fn drop_sock(&mut self) {
        self.sock = None;
    }
}
