//! Ring wire protocol: framing, message schemas, CBOR codec.

pub mod codec;
pub mod frame;
pub mod proto;

pub use codec::{CborCodec, CodecError};
pub use frame::{FrameError, FrameReader, MAGIC, Receipt, encode_frame};
pub use proto::{
    ClientJoin, ClientReconnect, CustomEvent, CustomEventAck, Discard, Envelope, Heartbeat,
    JoinRequest, Message, MessageKind, NodeAdded, NodeAddedFinished, NodeFailed, NodeLeft, Ping,
    RejectJoin, RejectReason, StatusCheck,
};
