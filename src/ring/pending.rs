//! Pending-message log: bounded retention of forwarded ensure-delivery
//! messages, replayed to a new neighbor after a ring skip and to
//! reconnecting clients.

use std::collections::VecDeque;

use crate::core::{MessageId, TopologyVersion};
use crate::wire::Envelope;

#[derive(Clone, Debug)]
pub struct PendingEntry {
    /// Topology version current when the message was forwarded; used to
    /// fast-forward reconnecting clients.
    pub version_at: TopologyVersion,
    pub envelope: Envelope,
}

/// Ordered, bounded buffer of forwarded ensure-delivery messages.
///
/// Trimmed when a `Discard` traverses the ring; bounded by configured size
/// with oldest-first eviction otherwise.
pub struct PendingLog {
    cap: usize,
    entries: VecDeque<PendingEntry>,
}

impl PendingLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, envelope: Envelope, version_at: TopologyVersion) {
        debug_assert!(envelope.ensured(), "only ensured messages are retained");
        if self.entries.iter().any(|e| e.envelope.id == envelope.id) {
            return;
        }
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(PendingEntry {
            version_at,
            envelope,
        });
    }

    /// Drops every entry up to and including `up_to`. No-op when the id is
    /// not retained (already trimmed or never seen).
    pub fn discard_up_to(&mut self, up_to: MessageId) {
        let Some(pos) = self.entries.iter().position(|e| e.envelope.id == up_to) else {
            return;
        };
        self.entries.drain(..=pos);
    }

    /// Every retained message, oldest first, for replay after a ring skip.
    pub fn replay_all(&self) -> Vec<Envelope> {
        self.entries.iter().map(|e| e.envelope.clone()).collect()
    }

    /// Messages a client that observed `last_version` may have missed.
    ///
    /// Inclusive of entries forwarded at `last_version` itself: a client may
    /// have seen the version bump but not the trailing finish message, and
    /// replayed duplicates are suppressed on the receiving side.
    pub fn replay_since(&self, last_version: TopologyVersion) -> Vec<Envelope> {
        self.entries
            .iter()
            .filter(|e| e.version_at >= last_version)
            .map(|e| e.envelope.clone())
            .collect()
    }

    /// Whether the log still reaches back to `last_version`; when it does
    /// not, a reconnecting client cannot be fast-forwarded.
    pub fn reaches_back_to(&self, last_version: TopologyVersion) -> bool {
        self.entries
            .front()
            .map(|e| e.version_at <= last_version.next())
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
