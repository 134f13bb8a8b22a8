//! Default CBOR codec for discovery messages.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{MessageId, NodeId, NodeOrder, NodeRecord, ProductVersion, TopologyVersion};
use crate::spi::{Codec, NodeMetrics};

use super::proto::{
    ClientJoin, ClientReconnect, CustomEvent, CustomEventAck, Discard, Envelope, Heartbeat,
    JoinRequest, Message, MessageKind, NodeAdded, NodeAddedFinished, NodeFailed, NodeLeft, Ping,
    RejectJoin, RejectReason, StatusCheck,
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("trailing bytes after message body")]
    TrailingBytes,
}

/// Hand-rolled CBOR encoding of the message envelope; the default [`Codec`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        encode_envelope(envelope)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        decode_envelope(bytes)
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(5)?;
    enc.str("id")?;
    enc.bytes(envelope.id.as_uuid().as_bytes())?;
    enc.str("creator")?;
    enc.bytes(envelope.creator.as_uuid().as_bytes())?;
    enc.str("verifier")?;
    enc.bytes(envelope.verifier.as_uuid().as_bytes())?;
    enc.str("type")?;
    enc.str(envelope.kind().as_str())?;
    enc.str("body")?;
    encode_message_body(&mut enc, &envelope.message)?;
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;

    let mut id = None;
    let mut creator = None;
    let mut verifier = None;
    let mut kind = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec)?;
        match key {
            "id" => id = Some(MessageId::from_uuid(decode_uuid(&mut dec, "id")?)),
            "creator" => creator = Some(NodeId::from_uuid(decode_uuid(&mut dec, "creator")?)),
            "verifier" => verifier = Some(NodeId::from_uuid(decode_uuid(&mut dec, "verifier")?)),
            "type" => {
                let raw = decode_text(&mut dec)?;
                kind = Some(
                    MessageKind::parse(raw)
                        .ok_or_else(|| CodecError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                let end = dec.position();
                body_span = Some((start, end));
            }
            _ => skip_value(&mut dec)?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(CodecError::TrailingBytes);
    }

    let kind = kind.ok_or(CodecError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(CodecError::MissingField("body"))?;
    let message = decode_message_body(kind, &bytes[start..end])?;

    Ok(Envelope {
        id: id.ok_or(CodecError::MissingField("id"))?,
        creator: creator.ok_or(CodecError::MissingField("creator"))?,
        verifier: verifier.ok_or(CodecError::MissingField("verifier"))?,
        message,
    })
}

fn encode_message_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    message: &Message,
) -> Result<(), CodecError> {
    match message {
        Message::JoinRequest(msg) => {
            enc.map(2)?;
            enc.str("node")?;
            encode_node(enc, &msg.node)?;
            enc.str("discovery_data")?;
            enc.bytes(msg.discovery_data.as_ref())?;
        }
        Message::RejectJoin(msg) => {
            enc.map(2)?;
            enc.str("target")?;
            enc.bytes(msg.target.as_uuid().as_bytes())?;
            enc.str("reason")?;
            enc.str(msg.reason.as_str())?;
        }
        Message::NodeAdded(msg) => {
            enc.map(4)?;
            enc.str("node")?;
            encode_node(enc, &msg.node)?;
            enc.str("members")?;
            enc.array(msg.members.len() as u64)?;
            for member in &msg.members {
                encode_node(enc, member)?;
            }
            enc.str("version")?;
            enc.u64(msg.version.get())?;
            enc.str("discovery_data")?;
            enc.bytes(msg.discovery_data.as_ref())?;
        }
        Message::NodeAddedFinished(msg) => {
            enc.map(1)?;
            enc.str("node_id")?;
            enc.bytes(msg.node_id.as_uuid().as_bytes())?;
        }
        Message::NodeLeft(msg) => {
            enc.map(2)?;
            enc.str("node_id")?;
            enc.bytes(msg.node_id.as_uuid().as_bytes())?;
            enc.str("version")?;
            enc.u64(msg.version.get())?;
        }
        Message::NodeFailed(msg) => {
            enc.map(3)?;
            enc.str("node_id")?;
            enc.bytes(msg.node_id.as_uuid().as_bytes())?;
            enc.str("node_order")?;
            enc.u64(msg.node_order.get())?;
            enc.str("version")?;
            enc.u64(msg.version.get())?;
        }
        Message::Heartbeat(msg) => {
            enc.map(1)?;
            enc.str("metrics")?;
            enc.map(msg.metrics.len() as u64)?;
            for (node_id, metrics) in &msg.metrics {
                enc.bytes(node_id.as_uuid().as_bytes())?;
                encode_metrics(enc, metrics)?;
            }
        }
        Message::StatusCheck(msg) => {
            enc.map(1)?;
            enc.str("target")?;
            enc.bytes(msg.target.as_uuid().as_bytes())?;
        }
        Message::Ping(msg) => {
            enc.map(1)?;
            enc.str("target")?;
            enc.bytes(msg.target.as_uuid().as_bytes())?;
        }
        Message::Discard(msg) => {
            enc.map(1)?;
            enc.str("up_to")?;
            enc.bytes(msg.up_to.as_uuid().as_bytes())?;
        }
        Message::CustomEvent(msg) => {
            enc.map(1)?;
            enc.str("payload")?;
            enc.bytes(msg.payload.as_ref())?;
        }
        Message::CustomEventAck(msg) => {
            enc.map(2)?;
            enc.str("payload")?;
            enc.bytes(msg.payload.as_ref())?;
            enc.str("version")?;
            enc.u64(msg.version.get())?;
        }
        Message::ClientJoin(msg) => {
            enc.map(1)?;
            enc.str("node")?;
            encode_node(enc, &msg.node)?;
        }
        Message::ClientReconnect(msg) => {
            enc.map(2)?;
            enc.str("node")?;
            encode_node(enc, &msg.node)?;
            enc.str("last_version")?;
            enc.u64(msg.last_version.get())?;
        }
    }
    Ok(())
}

fn decode_message_body(kind: MessageKind, bytes: &[u8]) -> Result<Message, CodecError> {
    let mut dec = Decoder::new(bytes);
    let message = match kind {
        MessageKind::JoinRequest => {
            let map_len = decode_map_len(&mut dec)?;
            let mut node = None;
            let mut discovery_data = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "node" => node = Some(decode_node(&mut dec)?),
                    "discovery_data" => {
                        discovery_data = Some(decode_payload(&mut dec, "discovery_data")?)
                    }
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::JoinRequest(JoinRequest {
                node: node.ok_or(CodecError::MissingField("node"))?,
                discovery_data: discovery_data
                    .ok_or(CodecError::MissingField("discovery_data"))?,
            })
        }
        MessageKind::RejectJoin => {
            let map_len = decode_map_len(&mut dec)?;
            let mut target = None;
            let mut reason = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "target" => {
                        target = Some(NodeId::from_uuid(decode_uuid(&mut dec, "target")?))
                    }
                    "reason" => {
                        let raw = decode_text(&mut dec)?;
                        reason =
                            Some(RejectReason::parse(raw).ok_or(CodecError::InvalidField {
                                field: "reason",
                                reason: format!("unknown reject reason {raw}"),
                            })?);
                    }
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::RejectJoin(RejectJoin {
                target: target.ok_or(CodecError::MissingField("target"))?,
                reason: reason.ok_or(CodecError::MissingField("reason"))?,
            })
        }
        MessageKind::NodeAdded => {
            let map_len = decode_map_len(&mut dec)?;
            let mut node = None;
            let mut members = None;
            let mut version = None;
            let mut discovery_data = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "node" => node = Some(decode_node(&mut dec)?),
                    "members" => {
                        let arr_len = decode_array_len(&mut dec)?;
                        let mut out = Vec::with_capacity(arr_len);
                        for _ in 0..arr_len {
                            out.push(decode_node(&mut dec)?);
                        }
                        members = Some(out);
                    }
                    "version" => version = Some(TopologyVersion::new(dec.u64()?)),
                    "discovery_data" => {
                        discovery_data = Some(decode_payload(&mut dec, "discovery_data")?)
                    }
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::NodeAdded(NodeAdded {
                node: node.ok_or(CodecError::MissingField("node"))?,
                members: members.ok_or(CodecError::MissingField("members"))?,
                version: version.ok_or(CodecError::MissingField("version"))?,
                discovery_data: discovery_data
                    .ok_or(CodecError::MissingField("discovery_data"))?,
            })
        }
        MessageKind::NodeAddedFinished => {
            let map_len = decode_map_len(&mut dec)?;
            let mut node_id = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "node_id" => {
                        node_id = Some(NodeId::from_uuid(decode_uuid(&mut dec, "node_id")?))
                    }
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::NodeAddedFinished(NodeAddedFinished {
                node_id: node_id.ok_or(CodecError::MissingField("node_id"))?,
            })
        }
        MessageKind::NodeLeft => {
            let map_len = decode_map_len(&mut dec)?;
            let mut node_id = None;
            let mut version = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "node_id" => {
                        node_id = Some(NodeId::from_uuid(decode_uuid(&mut dec, "node_id")?))
                    }
                    "version" => version = Some(TopologyVersion::new(dec.u64()?)),
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::NodeLeft(NodeLeft {
                node_id: node_id.ok_or(CodecError::MissingField("node_id"))?,
                version: version.ok_or(CodecError::MissingField("version"))?,
            })
        }
        MessageKind::NodeFailed => {
            let map_len = decode_map_len(&mut dec)?;
            let mut node_id = None;
            let mut node_order = None;
            let mut version = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "node_id" => {
                        node_id = Some(NodeId::from_uuid(decode_uuid(&mut dec, "node_id")?))
                    }
                    "node_order" => node_order = Some(NodeOrder::new(dec.u64()?)),
                    "version" => version = Some(TopologyVersion::new(dec.u64()?)),
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::NodeFailed(NodeFailed {
                node_id: node_id.ok_or(CodecError::MissingField("node_id"))?,
                node_order: node_order.ok_or(CodecError::MissingField("node_order"))?,
                version: version.ok_or(CodecError::MissingField("version"))?,
            })
        }
        MessageKind::Heartbeat => {
            let map_len = decode_map_len(&mut dec)?;
            let mut metrics = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "metrics" => {
                        let entries = decode_map_len(&mut dec)?;
                        let mut out = BTreeMap::new();
                        for _ in 0..entries {
                            let node_id = NodeId::from_uuid(decode_uuid(&mut dec, "metrics")?);
                            out.insert(node_id, decode_metrics(&mut dec)?);
                        }
                        metrics = Some(out);
                    }
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::Heartbeat(Heartbeat {
                metrics: metrics.ok_or(CodecError::MissingField("metrics"))?,
            })
        }
        MessageKind::StatusCheck => {
            let target = decode_single_id_body(&mut dec, "target")?;
            Message::StatusCheck(StatusCheck { target })
        }
        MessageKind::Ping => {
            let target = decode_single_id_body(&mut dec, "target")?;
            Message::Ping(Ping { target })
        }
        MessageKind::Discard => {
            let map_len = decode_map_len(&mut dec)?;
            let mut up_to = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "up_to" => {
                        up_to = Some(MessageId::from_uuid(decode_uuid(&mut dec, "up_to")?))
                    }
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::Discard(Discard {
                up_to: up_to.ok_or(CodecError::MissingField("up_to"))?,
            })
        }
        MessageKind::CustomEvent => {
            let map_len = decode_map_len(&mut dec)?;
            let mut payload = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "payload" => payload = Some(decode_payload(&mut dec, "payload")?),
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::CustomEvent(CustomEvent {
                payload: payload.ok_or(CodecError::MissingField("payload"))?,
            })
        }
        MessageKind::CustomEventAck => {
            let map_len = decode_map_len(&mut dec)?;
            let mut payload = None;
            let mut version = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "payload" => payload = Some(decode_payload(&mut dec, "payload")?),
                    "version" => version = Some(TopologyVersion::new(dec.u64()?)),
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::CustomEventAck(CustomEventAck {
                payload: payload.ok_or(CodecError::MissingField("payload"))?,
                version: version.ok_or(CodecError::MissingField("version"))?,
            })
        }
        MessageKind::ClientJoin => {
            let map_len = decode_map_len(&mut dec)?;
            let mut node = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "node" => node = Some(decode_node(&mut dec)?),
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::ClientJoin(ClientJoin {
                node: node.ok_or(CodecError::MissingField("node"))?,
            })
        }
        MessageKind::ClientReconnect => {
            let map_len = decode_map_len(&mut dec)?;
            let mut node = None;
            let mut last_version = None;
            for _ in 0..map_len {
                match decode_text(&mut dec)? {
                    "node" => node = Some(decode_node(&mut dec)?),
                    "last_version" => last_version = Some(TopologyVersion::new(dec.u64()?)),
                    _ => skip_value(&mut dec)?,
                }
            }
            Message::ClientReconnect(ClientReconnect {
                node: node.ok_or(CodecError::MissingField("node"))?,
                last_version: last_version.ok_or(CodecError::MissingField("last_version"))?,
            })
        }
    };

    if dec.datatype().is_ok() {
        return Err(CodecError::TrailingBytes);
    }

    Ok(message)
}

fn encode_node(enc: &mut Encoder<&mut Vec<u8>>, node: &NodeRecord) -> Result<(), CodecError> {
    enc.map(8)?;
    enc.str("id")?;
    enc.bytes(node.id.as_uuid().as_bytes())?;
    enc.str("attributes")?;
    enc.map(node.attributes.len() as u64)?;
    for (key, value) in &node.attributes {
        enc.str(key)?;
        enc.bytes(value.as_ref())?;
    }
    enc.str("internal_addrs")?;
    encode_addr_list(enc, &node.internal_addrs)?;
    enc.str("external_addrs")?;
    encode_addr_list(enc, &node.external_addrs)?;
    enc.str("discovery_port")?;
    enc.u16(node.discovery_port)?;
    enc.str("version")?;
    encode_version(enc, &node.version)?;
    enc.str("order")?;
    enc.u64(node.order.get())?;
    enc.str("client")?;
    enc.bool(node.client)?;
    Ok(())
}

fn decode_node(dec: &mut Decoder) -> Result<NodeRecord, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut id = None;
    let mut attributes = BTreeMap::new();
    let mut internal_addrs = None;
    let mut external_addrs = None;
    let mut discovery_port = None;
    let mut version = None;
    let mut order = None;
    let mut client = None;

    for _ in 0..map_len {
        match decode_text(dec)? {
            "id" => id = Some(NodeId::from_uuid(decode_uuid(dec, "id")?)),
            "attributes" => {
                let entries = decode_map_len(dec)?;
                for _ in 0..entries {
                    let key = decode_text(dec)?.to_string();
                    let value = decode_payload(dec, "attributes")?;
                    attributes.insert(key, value);
                }
            }
            "internal_addrs" => internal_addrs = Some(decode_addr_list(dec, "internal_addrs")?),
            "external_addrs" => external_addrs = Some(decode_addr_list(dec, "external_addrs")?),
            "discovery_port" => discovery_port = Some(dec.u16()?),
            "version" => version = Some(decode_version(dec)?),
            "order" => order = Some(NodeOrder::new(dec.u64()?)),
            "client" => client = Some(dec.bool()?),
            _ => skip_value(dec)?,
        }
    }

    Ok(NodeRecord {
        id: id.ok_or(CodecError::MissingField("id"))?,
        attributes,
        internal_addrs: internal_addrs.ok_or(CodecError::MissingField("internal_addrs"))?,
        external_addrs: external_addrs.ok_or(CodecError::MissingField("external_addrs"))?,
        discovery_port: discovery_port.ok_or(CodecError::MissingField("discovery_port"))?,
        version: version.ok_or(CodecError::MissingField("version"))?,
        order: order.ok_or(CodecError::MissingField("order"))?,
        client: client.ok_or(CodecError::MissingField("client"))?,
        local: false,
    })
}

fn encode_version(
    enc: &mut Encoder<&mut Vec<u8>>,
    version: &ProductVersion,
) -> Result<(), CodecError> {
    let len = if version.stamp.is_some() { 4 } else { 3 };
    enc.map(len)?;
    enc.str("major")?;
    enc.u32(version.major)?;
    enc.str("minor")?;
    enc.u32(version.minor)?;
    enc.str("maintenance")?;
    enc.u32(version.maintenance)?;
    if let Some(stamp) = &version.stamp {
        enc.str("stamp")?;
        enc.str(stamp)?;
    }
    Ok(())
}

fn decode_version(dec: &mut Decoder) -> Result<ProductVersion, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut major = None;
    let mut minor = None;
    let mut maintenance = None;
    let mut stamp = None;

    for _ in 0..map_len {
        match decode_text(dec)? {
            "major" => major = Some(dec.u32()?),
            "minor" => minor = Some(dec.u32()?),
            "maintenance" => maintenance = Some(dec.u32()?),
            "stamp" => stamp = Some(decode_text(dec)?.to_string()),
            _ => skip_value(dec)?,
        }
    }

    Ok(ProductVersion {
        major: major.ok_or(CodecError::MissingField("major"))?,
        minor: minor.ok_or(CodecError::MissingField("minor"))?,
        maintenance: maintenance.ok_or(CodecError::MissingField("maintenance"))?,
        stamp,
    })
}

fn encode_metrics(
    enc: &mut Encoder<&mut Vec<u8>>,
    metrics: &NodeMetrics,
) -> Result<(), CodecError> {
    enc.map(3)?;
    enc.str("uptime_ms")?;
    enc.u64(metrics.uptime_ms)?;
    enc.str("message_queue_depth")?;
    enc.u64(metrics.message_queue_depth)?;
    enc.str("heap_bytes_used")?;
    enc.u64(metrics.heap_bytes_used)?;
    Ok(())
}

fn decode_metrics(dec: &mut Decoder) -> Result<NodeMetrics, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut metrics = NodeMetrics::default();
    for _ in 0..map_len {
        match decode_text(dec)? {
            "uptime_ms" => metrics.uptime_ms = dec.u64()?,
            "message_queue_depth" => metrics.message_queue_depth = dec.u64()?,
            "heap_bytes_used" => metrics.heap_bytes_used = dec.u64()?,
            _ => skip_value(dec)?,
        }
    }
    Ok(metrics)
}

fn encode_addr_list(
    enc: &mut Encoder<&mut Vec<u8>>,
    addrs: &[SocketAddr],
) -> Result<(), CodecError> {
    enc.array(addrs.len() as u64)?;
    for addr in addrs {
        enc.str(&addr.to_string())?;
    }
    Ok(())
}

fn decode_addr_list(
    dec: &mut Decoder,
    field: &'static str,
) -> Result<Vec<SocketAddr>, CodecError> {
    let arr_len = decode_array_len(dec)?;
    let mut out = Vec::with_capacity(arr_len);
    for _ in 0..arr_len {
        let raw = decode_text(dec)?;
        let addr = raw.parse().map_err(|_| CodecError::InvalidField {
            field,
            reason: format!("invalid socket address {raw}"),
        })?;
        out.push(addr);
    }
    Ok(out)
}

fn decode_single_id_body(dec: &mut Decoder, field: &'static str) -> Result<NodeId, CodecError> {
    let map_len = decode_map_len(dec)?;
    let mut id = None;
    for _ in 0..map_len {
        let key = decode_text(dec)?;
        if key == field {
            id = Some(NodeId::from_uuid(decode_uuid(dec, field)?));
        } else {
            skip_value(dec)?;
        }
    }
    id.ok_or(CodecError::MissingField(field))
}

fn decode_uuid(dec: &mut Decoder, field: &'static str) -> Result<Uuid, CodecError> {
    let raw = decode_bytes(dec)?;
    let bytes: [u8; 16] = raw.try_into().map_err(|_| CodecError::InvalidField {
        field,
        reason: "expected 16-byte uuid".into(),
    })?;
    Ok(Uuid::from_bytes(bytes))
}

fn decode_payload(dec: &mut Decoder, field: &'static str) -> Result<Bytes, CodecError> {
    let raw = decode_bytes(dec).map_err(|_| CodecError::InvalidField {
        field,
        reason: "expected byte string".into(),
    })?;
    Ok(Bytes::copy_from_slice(raw))
}

fn decode_map_len(dec: &mut Decoder) -> Result<usize, CodecError> {
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(CodecError::IndefiniteLength);
    };
    usize::try_from(len).map_err(|_| CodecError::InvalidField {
        field: "map",
        reason: "map length exceeds usize".into(),
    })
}

fn decode_array_len(dec: &mut Decoder) -> Result<usize, CodecError> {
    let len = dec.array()?;
    let Some(len) = len else {
        return Err(CodecError::IndefiniteLength);
    };
    usize::try_from(len).map_err(|_| CodecError::InvalidField {
        field: "array",
        reason: "array length exceeds usize".into(),
    })
}

fn decode_text<'a>(dec: &mut Decoder<'a>) -> Result<&'a str, CodecError> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(CodecError::IndefiniteLength);
    }
    Ok(dec.str()?)
}

fn decode_bytes<'a>(dec: &mut Decoder<'a>) -> Result<&'a [u8], CodecError> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(CodecError::IndefiniteLength);
    }
    Ok(dec.bytes()?)
}

fn skip_value(dec: &mut Decoder) -> Result<(), CodecError> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(CodecError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ATTR_EXT_ADDRS;

    fn server_node() -> NodeRecord {
        let mut node = NodeRecord::new(
            NodeId::random(),
            vec!["127.0.0.1:47500".parse().unwrap()],
            47500,
        )
        .with_external_addrs(vec!["10.0.0.7:47500".parse().unwrap()])
        .with_version(ProductVersion::new(2, 1, 3).with_stamp("b42"));
        node.order = NodeOrder::new(4);
        node
    }

    fn round_trip(message: Message) -> Envelope {
        let env = Envelope::new(NodeId::random(), message);
        let bytes = encode_envelope(&env).unwrap();
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, env);
        decoded
    }

    #[test]
    fn join_request_round_trips() {
        round_trip(Message::JoinRequest(JoinRequest {
            node: server_node(),
            discovery_data: Bytes::from_static(b"cache-config"),
        }));
    }

    #[test]
    fn node_added_round_trips_with_members() {
        round_trip(Message::NodeAdded(NodeAdded {
            node: server_node(),
            members: vec![server_node(), server_node().as_client()],
            version: TopologyVersion::new(9),
            discovery_data: Bytes::new(),
        }));
    }

    #[test]
    fn heartbeat_round_trips_with_metrics() {
        let mut metrics = BTreeMap::new();
        metrics.insert(
            NodeId::random(),
            NodeMetrics {
                uptime_ms: 123,
                message_queue_depth: 4,
                heap_bytes_used: 1 << 20,
            },
        );
        round_trip(Message::Heartbeat(Heartbeat { metrics }));
    }

    #[test]
    fn control_variants_round_trip() {
        round_trip(Message::NodeAddedFinished(NodeAddedFinished {
            node_id: NodeId::random(),
        }));
        round_trip(Message::NodeLeft(NodeLeft {
            node_id: NodeId::random(),
            version: TopologyVersion::ZERO,
        }));
        round_trip(Message::NodeFailed(NodeFailed {
            node_id: NodeId::random(),
            node_order: NodeOrder::new(3),
            version: TopologyVersion::new(7),
        }));
        round_trip(Message::StatusCheck(StatusCheck {
            target: NodeId::random(),
        }));
        round_trip(Message::Ping(Ping {
            target: NodeId::random(),
        }));
        round_trip(Message::Discard(Discard {
            up_to: MessageId::random(),
        }));
        round_trip(Message::RejectJoin(RejectJoin {
            target: NodeId::random(),
            reason: RejectReason::DuplicateId,
        }));
    }

    #[test]
    fn custom_events_round_trip() {
        round_trip(Message::CustomEvent(CustomEvent {
            payload: Bytes::from_static(b"rebalance"),
        }));
        round_trip(Message::CustomEventAck(CustomEventAck {
            payload: Bytes::from_static(b"rebalance"),
            version: TopologyVersion::new(12),
        }));
    }

    #[test]
    fn client_variants_round_trip() {
        round_trip(Message::ClientJoin(ClientJoin {
            node: server_node().as_client(),
        }));
        round_trip(Message::ClientReconnect(ClientReconnect {
            node: server_node().as_client(),
            last_version: TopologyVersion::new(5),
        }));
    }

    #[test]
    fn attributes_survive_encoding() {
        let node = server_node();
        let env = round_trip(Message::ClientJoin(ClientJoin { node: node.clone() }));
        let Message::ClientJoin(decoded) = env.message else {
            panic!("wrong variant");
        };
        assert_eq!(
            decoded.node.attribute(ATTR_EXT_ADDRS),
            node.attribute(ATTR_EXT_ADDRS)
        );
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let env = Envelope::new(
            NodeId::random(),
            Message::Ping(Ping {
                target: NodeId::random(),
            }),
        );
        let mut bytes = encode_envelope(&env).unwrap();
        // Corrupt the type string in place ("PING" -> "PONG").
        let pos = bytes.windows(4).position(|w| w == b"PING").unwrap();
        bytes[pos..pos + 4].copy_from_slice(b"PONG");
        assert!(matches!(
            decode_envelope(&bytes).unwrap_err(),
            CodecError::UnknownMessageType(_)
        ));
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let env = Envelope::new(
            NodeId::random(),
            Message::Ping(Ping {
                target: NodeId::random(),
            }),
        );
        let bytes = encode_envelope(&env).unwrap();
        assert!(decode_envelope(&bytes[..bytes.len() - 3]).is_err());
    }
}
