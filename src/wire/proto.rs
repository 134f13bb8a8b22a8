//! Discovery message schemas.
//!
//! A closed set of variants; ensure-delivery is a per-variant constant, not
//! a wire field. Every message travels inside an [`Envelope`] carrying its
//! unique id, the creator node id, and the verifier node id (the last node
//! known to have endorsed it — for topology events, the coordinator).

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::core::{MessageId, NodeId, NodeOrder, NodeRecord, TopologyVersion};
use crate::spi::NodeMetrics;

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub id: MessageId,
    pub creator: NodeId,
    pub verifier: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(creator: NodeId, message: Message) -> Self {
        Self {
            id: MessageId::random(),
            creator,
            verifier: creator,
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Whether loss of this message would break a cluster invariant.
    ///
    /// Ensured messages are retained in the pending log until a `Discard`
    /// for them traverses the ring.
    pub fn ensured(&self) -> bool {
        self.message.kind().ensured()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    JoinRequest(JoinRequest),
    RejectJoin(RejectJoin),
    NodeAdded(NodeAdded),
    NodeAddedFinished(NodeAddedFinished),
    NodeLeft(NodeLeft),
    NodeFailed(NodeFailed),
    Heartbeat(Heartbeat),
    StatusCheck(StatusCheck),
    Ping(Ping),
    Discard(Discard),
    CustomEvent(CustomEvent),
    CustomEventAck(CustomEventAck),
    ClientJoin(ClientJoin),
    ClientReconnect(ClientReconnect),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::JoinRequest(_) => MessageKind::JoinRequest,
            Message::RejectJoin(_) => MessageKind::RejectJoin,
            Message::NodeAdded(_) => MessageKind::NodeAdded,
            Message::NodeAddedFinished(_) => MessageKind::NodeAddedFinished,
            Message::NodeLeft(_) => MessageKind::NodeLeft,
            Message::NodeFailed(_) => MessageKind::NodeFailed,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::StatusCheck(_) => MessageKind::StatusCheck,
            Message::Ping(_) => MessageKind::Ping,
            Message::Discard(_) => MessageKind::Discard,
            Message::CustomEvent(_) => MessageKind::CustomEvent,
            Message::CustomEventAck(_) => MessageKind::CustomEventAck,
            Message::ClientJoin(_) => MessageKind::ClientJoin,
            Message::ClientReconnect(_) => MessageKind::ClientReconnect,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinRequest,
    RejectJoin,
    NodeAdded,
    NodeAddedFinished,
    NodeLeft,
    NodeFailed,
    Heartbeat,
    StatusCheck,
    Ping,
    Discard,
    CustomEvent,
    CustomEventAck,
    ClientJoin,
    ClientReconnect,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::JoinRequest => "JOIN_REQUEST",
            MessageKind::RejectJoin => "REJECT_JOIN",
            MessageKind::NodeAdded => "NODE_ADDED",
            MessageKind::NodeAddedFinished => "NODE_ADDED_FINISHED",
            MessageKind::NodeLeft => "NODE_LEFT",
            MessageKind::NodeFailed => "NODE_FAILED",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::StatusCheck => "STATUS_CHECK",
            MessageKind::Ping => "PING",
            MessageKind::Discard => "DISCARD",
            MessageKind::CustomEvent => "CUSTOM_EVENT",
            MessageKind::CustomEventAck => "CUSTOM_EVENT_ACK",
            MessageKind::ClientJoin => "CLIENT_JOIN",
            MessageKind::ClientReconnect => "CLIENT_RECONNECT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "JOIN_REQUEST" => Some(MessageKind::JoinRequest),
            "REJECT_JOIN" => Some(MessageKind::RejectJoin),
            "NODE_ADDED" => Some(MessageKind::NodeAdded),
            "NODE_ADDED_FINISHED" => Some(MessageKind::NodeAddedFinished),
            "NODE_LEFT" => Some(MessageKind::NodeLeft),
            "NODE_FAILED" => Some(MessageKind::NodeFailed),
            "HEARTBEAT" => Some(MessageKind::Heartbeat),
            "STATUS_CHECK" => Some(MessageKind::StatusCheck),
            "PING" => Some(MessageKind::Ping),
            "DISCARD" => Some(MessageKind::Discard),
            "CUSTOM_EVENT" => Some(MessageKind::CustomEvent),
            "CUSTOM_EVENT_ACK" => Some(MessageKind::CustomEventAck),
            "CLIENT_JOIN" => Some(MessageKind::ClientJoin),
            "CLIENT_RECONNECT" => Some(MessageKind::ClientReconnect),
            _ => None,
        }
    }

    pub fn ensured(self) -> bool {
        matches!(
            self,
            MessageKind::NodeAdded
                | MessageKind::NodeAddedFinished
                | MessageKind::NodeLeft
                | MessageKind::NodeFailed
                | MessageKind::CustomEvent
                | MessageKind::CustomEventAck
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JoinRequest {
    pub node: NodeRecord,
    pub discovery_data: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    DuplicateId,
    AuthFailed,
    VersionCheckFailed,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::DuplicateId => "DUPLICATE_ID",
            RejectReason::AuthFailed => "AUTH_FAILED",
            RejectReason::VersionCheckFailed => "VERSION_CHECK_FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DUPLICATE_ID" => Some(RejectReason::DuplicateId),
            "AUTH_FAILED" => Some(RejectReason::AuthFailed),
            "VERSION_CHECK_FAILED" => Some(RejectReason::VersionCheckFailed),
            _ => None,
        }
    }
}

/// Coordinator verdict delivered when admission fails after the first-hop
/// receipt already said `OK`. Directed at `target`.
#[derive(Clone, Debug, PartialEq)]
pub struct RejectJoin {
    pub target: NodeId,
    pub reason: RejectReason,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeAdded {
    pub node: NodeRecord,
    /// Full member list as of `version`, so the joiner can adopt the
    /// topology wholesale.
    pub members: Vec<NodeRecord>,
    pub version: TopologyVersion,
    pub discovery_data: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeAddedFinished {
    pub node_id: NodeId,
}

/// Graceful departure. `version` is zero until the coordinator stamps it.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeLeft {
    pub node_id: NodeId,
    pub version: TopologyVersion,
}

/// Forced or detected failure. `version` is zero until the coordinator
/// stamps it.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeFailed {
    pub node_id: NodeId,
    pub node_order: NodeOrder,
    pub version: TopologyVersion,
}

/// Per-member metric payloads accumulate as the heartbeat passes around the
/// ring; by the time it returns to its originator it carries every live
/// member.
#[derive(Clone, Debug, PartialEq)]
pub struct Heartbeat {
    pub metrics: BTreeMap<NodeId, NodeMetrics>,
}

/// Targeted liveness probe issued when a node's own heartbeat round trip
/// goes silent. Answered by the `OK` receipt alone.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusCheck {
    pub target: NodeId,
}

/// Liveness probe backing the public `ping` operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    pub target: NodeId,
}

/// Pending-log trim signal: drop every retained message up to and including
/// `up_to`.
#[derive(Clone, Debug, PartialEq)]
pub struct Discard {
    pub up_to: MessageId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CustomEvent {
    pub payload: Bytes,
}

/// Coordinator re-emission of a custom event, stamped into the topology
/// version stream so every node delivers it at the same position.
#[derive(Clone, Debug, PartialEq)]
pub struct CustomEventAck {
    pub payload: Bytes,
    pub version: TopologyVersion,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientJoin {
    pub node: NodeRecord,
}

/// Client rebinding to a new router after losing the previous one; the
/// router fast-forwards ensure-delivery messages newer than `last_version`
/// from its pending log.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientReconnect {
    pub node: NodeRecord,
    pub last_version: TopologyVersion,
}
