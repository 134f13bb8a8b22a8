//! Core data model: identities, node records, topology snapshots, events.

pub mod event;
pub mod identity;
pub mod node;
pub mod topology;
pub mod version;

pub use event::{DiscoveryEvent, DiscoveryListener, ListenerSet};
pub use identity::{MessageId, NodeId, NodeOrder, TopologyVersion};
pub use node::{ATTR_EXT_ADDRS, NodeRecord};
pub use topology::{SharedTopology, TopologyHistory, TopologySnapshot};
pub use version::ProductVersion;

/// Lifecycle state of the local discovery runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpiState {
    Connecting,
    Connected,
    Disconnecting,
    Stopped,
}

impl SpiState {
    pub fn as_str(self) -> &'static str {
        match self {
            SpiState::Connecting => "CONNECTING",
            SpiState::Connected => "CONNECTED",
            SpiState::Disconnecting => "DISCONNECTING",
            SpiState::Stopped => "STOPPED",
        }
    }
}
