#![forbid(unsafe_code)]

pub mod addrs;
pub mod config;
pub mod core;
pub mod discovery;
pub mod error;
pub mod ring;
pub mod sock;
pub mod spi;
pub mod stats;
pub mod telemetry;
pub mod test_support;
pub mod wire;

mod client;
mod util;

pub use error::{Error, JoinError, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types an embedding grid runtime touches directly.
pub use crate::config::{ConfigError, DiscoveryConfig};
pub use crate::core::{
    ATTR_EXT_ADDRS, DiscoveryEvent, DiscoveryListener, NodeId, NodeOrder, NodeRecord,
    ProductVersion, SpiState, TopologySnapshot, TopologyVersion,
};
pub use crate::discovery::{Discovery, DiscoveryBuilder, DiscoveryRuntime};
pub use crate::spi::{
    AddressBook, AddressBookError, AllowAllAuthenticator, Codec, DataExchange, MetricsSource,
    NodeAuthenticator, NodeMetrics, StaticAddressBook,
};
pub use crate::wire::CborCodec;
