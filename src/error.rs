use thiserror::Error;

use crate::addrs::ResolveError;
use crate::config::ConfigError;
use crate::core::NodeId;
use crate::sock::SockError;
use crate::spi::AddressBookError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Fatal join outcomes surfaced to the caller of `start`.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error(
        "local node has the same id as an existing node in topology \
         (fix configuration and restart): {id}"
    )]
    DuplicateId { id: NodeId },
    #[error("authentication failed for local node {id}")]
    AuthFailed { id: NodeId },
    #[error("product version {local} is not compatible with the cluster")]
    VersionIncompatible { local: String },
    #[error("failed to join topology within {waited_ms} ms")]
    Timeout { waited_ms: u64 },
    #[error("no peer accepted the join request and the address book is empty")]
    NoPeers,
    #[error("startup interrupted by shutdown")]
    Interrupted,
}

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Sock(#[from] SockError),

    #[error(transparent)]
    AddressBook(#[from] AddressBookError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("discovery runtime is shutting down")]
    Shutdown,
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) => Transience::Permanent,
            Error::Join(JoinError::Timeout { .. }) => Transience::Retryable,
            Error::Join(JoinError::NoPeers) => Transience::Retryable,
            Error::Join(_) => Transience::Permanent,
            Error::Sock(e) => e.transience(),
            Error::AddressBook(_) => Transience::Retryable,
            Error::Resolve(_) => Transience::Retryable,
            Error::Shutdown => Transience::Permanent,
        }
    }
}
