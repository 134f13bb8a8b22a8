//! Address book adapter: resolve, deduplicate, and shuffle peer endpoints.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::config::DFLT_PORT;
use crate::spi::AddressBook;

/// Retry cadence when the provider cannot be contacted. The caller bounds
/// the overall wait through the join timeout.
const PROVIDER_RETRY: Duration = Duration::from_millis(2_000);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("interrupted by shutdown while waiting for the address book")]
    Interrupted,
    #[error("invalid peer entry {raw:?}: {reason}")]
    InvalidEntry { raw: String, reason: String },
}

/// A peer endpoint that may still need DNS resolution.
///
/// Entries that fail to resolve are kept and re-resolved on the next join
/// attempt rather than dropped.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        if let Ok(ip) = self.host.parse() {
            return Ok(vec![SocketAddr::new(ip, self.port)]);
        }
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Wraps the pluggable [`AddressBook`] with the resolution contract the
/// join protocol relies on.
#[derive(Clone)]
pub struct AddressBookAdapter {
    book: Arc<dyn AddressBook>,
    /// Local discovery port; 0 when the local node is a client.
    local_discovery_port: u16,
    local_addrs: Vec<SocketAddr>,
    shutdown: Arc<AtomicBool>,
}

impl AddressBookAdapter {
    pub fn new(
        book: Arc<dyn AddressBook>,
        local_discovery_port: u16,
        local_addrs: Vec<SocketAddr>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            book,
            local_discovery_port,
            local_addrs,
            shutdown,
        }
    }

    pub fn book(&self) -> &Arc<dyn AddressBook> {
        &self.book
    }

    /// Candidate peers: deduplicated, local addresses excluded, bare hosts
    /// and zero ports completed, shuffled uniformly so concurrent joiners
    /// do not stampede the same peer.
    ///
    /// Blocks retrying every 2000 ms while the provider is unavailable.
    pub fn resolved_addresses(&self) -> Result<Vec<PeerEndpoint>, ResolveError> {
        let raw = loop {
            match self.book.peers() {
                Ok(raw) => break raw,
                Err(err) => {
                    tracing::warn!(
                        "failed to get registered addresses from the address book \
                         (retrying every {} ms): {err}",
                        PROVIDER_RETRY.as_millis()
                    );
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(ResolveError::Interrupted);
            }
            std::thread::sleep(PROVIDER_RETRY);
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(ResolveError::Interrupted);
            }
        };

        let mut seen = BTreeSet::new();
        let mut endpoints = Vec::new();
        for entry in raw {
            let endpoint = self.parse_entry(&entry)?;
            if self.is_local(&endpoint) {
                continue;
            }
            if seen.insert(endpoint.clone()) {
                endpoints.push(endpoint);
            }
        }

        endpoints.shuffle(&mut rand::thread_rng());
        Ok(endpoints)
    }

    /// Registers the local node's own addresses so later joiners can find
    /// it.
    pub fn register_local(&self) {
        let addrs: Vec<String> = self.local_addrs.iter().map(|a| a.to_string()).collect();
        if addrs.is_empty() {
            return;
        }
        if let Err(err) = self.book.register(&addrs) {
            tracing::warn!("failed to register local addresses in the address book: {err}");
        }
    }

    /// Coordinator-only prune of shared books: unregister entries that no
    /// live member advertises.
    pub fn clean(&self, live_addrs: &BTreeSet<SocketAddr>) {
        if !self.book.is_shared() {
            return;
        }
        let raw = match self.book.peers() {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!("address book unavailable during clean: {err}");
                return;
            }
        };

        let mut stale = Vec::new();
        for entry in &raw {
            let Ok(endpoint) = self.parse_entry(entry) else {
                stale.push(entry.clone());
                continue;
            };
            let Ok(resolved) = endpoint.resolve() else {
                continue;
            };
            if !resolved.iter().any(|addr| live_addrs.contains(addr)) {
                stale.push(entry.clone());
            }
        }

        if !stale.is_empty() {
            tracing::info!("pruning {} stale address book entries", stale.len());
            if let Err(err) = self.book.unregister(&stale) {
                tracing::warn!("failed to prune address book entries: {err}");
            }
        }
    }

    fn default_port(&self) -> u16 {
        if self.local_discovery_port != 0 {
            self.local_discovery_port
        } else {
            DFLT_PORT
        }
    }

    fn parse_entry(&self, raw: &str) -> Result<PeerEndpoint, ResolveError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ResolveError::InvalidEntry {
                raw: raw.to_string(),
                reason: "empty entry".to_string(),
            });
        }

        // Bracketed IPv6 with optional port, else "host[:port]".
        if let Some(rest) = raw.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(ResolveError::InvalidEntry {
                    raw: raw.to_string(),
                    reason: "unterminated IPv6 bracket".to_string(),
                });
            };
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(raw, p)?,
                None => 0,
            };
            return Ok(self.complete(host.to_string(), port));
        }

        match raw.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = parse_port(raw, port)?;
                Ok(self.complete(host.to_string(), port))
            }
            // No port, or an unbracketed IPv6 literal.
            _ => Ok(self.complete(raw.to_string(), 0)),
        }
    }

    fn complete(&self, host: String, port: u16) -> PeerEndpoint {
        let port = if port == 0 { self.default_port() } else { port };
        PeerEndpoint { host, port }
    }

    fn is_local(&self, endpoint: &PeerEndpoint) -> bool {
        let Ok(resolved) = endpoint.resolve() else {
            return false;
        };
        resolved.iter().any(|addr| self.local_addrs.contains(addr))
    }
}

fn parse_port(raw: &str, port: &str) -> Result<u16, ResolveError> {
    port.parse().map_err(|_| ResolveError::InvalidEntry {
        raw: raw.to_string(),
        reason: format!("invalid port {port:?}"),
    })
}
