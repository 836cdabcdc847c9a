//! Wire encoding for descriptors and protocol packets.
//!
//! Descriptors travel out-of-band (through the enclosing pipe) and carry
//! only the correlation id. Packets travel in-band on the connection and
//! announce either a request ("start sending operation N to me") or a
//! reply ("payload for operation N follows"). Framing is the transport's
//! job; this module only defines the fixed-size payloads.

use crate::error::{Error, Result};

/// Opaque descriptor bytes, produced by a channel's `send` and consumed by
/// the peer channel's `recv`.
pub type Descriptor = Vec<u8>;

/// Descriptor layout: operation_id (8 bytes LE).
pub const DESCRIPTOR_SIZE: usize = 8;

/// Packet layout: tag (1 byte) + operation_id (8 bytes LE).
pub const PACKET_SIZE: usize = 9;

const TAG_REQUEST: u8 = 1;
const TAG_REPLY: u8 = 2;
const TAG_NOTIFICATION: u8 = 3;

/// A protocol packet exchanged on the connection.
///
/// `Request` and `Reply` drive the basic channel. `Notification` is used
/// by memory-access channels, which copy the payload out of band and only
/// signal completion on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Request { operation_id: u64 },
    Reply { operation_id: u64 },
    Notification { operation_id: u64 },
}

impl Packet {
    pub fn operation_id(&self) -> u64 {
        match *self {
            Packet::Request { operation_id }
            | Packet::Reply { operation_id }
            | Packet::Notification { operation_id } => operation_id,
        }
    }
}

/// Encodes a descriptor carrying the given operation id.
#[inline]
pub fn encode_descriptor(operation_id: u64) -> Descriptor {
    operation_id.to_le_bytes().to_vec()
}

/// Decodes an operation id out of descriptor bytes.
#[inline]
pub fn decode_descriptor(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; DESCRIPTOR_SIZE] = bytes.try_into().map_err(|_| {
        Error::Protocol(format!(
            "descriptor has {} bytes, expected {}",
            bytes.len(),
            DESCRIPTOR_SIZE
        ))
    })?;
    Ok(u64::from_le_bytes(arr))
}

/// Encodes a packet into its fixed-size wire form.
#[inline]
pub fn encode_packet(packet: &Packet) -> [u8; PACKET_SIZE] {
    let (tag, operation_id) = match *packet {
        Packet::Request { operation_id } => (TAG_REQUEST, operation_id),
        Packet::Reply { operation_id } => (TAG_REPLY, operation_id),
        Packet::Notification { operation_id } => (TAG_NOTIFICATION, operation_id),
    };
    let mut buf = [0u8; PACKET_SIZE];
    buf[0] = tag;
    buf[1..].copy_from_slice(&operation_id.to_le_bytes());
    buf
}

/// Decodes a packet from its wire form.
#[inline]
pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
    if bytes.len() != PACKET_SIZE {
        return Err(Error::Protocol(format!(
            "packet has {} bytes, expected {}",
            bytes.len(),
            PACKET_SIZE
        )));
    }
    let operation_id = u64::from_le_bytes(bytes[1..].try_into().unwrap());
    match bytes[0] {
        TAG_REQUEST => Ok(Packet::Request { operation_id }),
        TAG_REPLY => Ok(Packet::Reply { operation_id }),
        TAG_NOTIFICATION => Ok(Packet::Notification { operation_id }),
        tag => Err(Error::Protocol(format!("unknown packet tag {}", tag))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        for id in [0u64, 1, 42, u64::MAX] {
            let bytes = encode_descriptor(id);
            assert_eq!(bytes.len(), DESCRIPTOR_SIZE);
            assert_eq!(decode_descriptor(&bytes).unwrap(), id);
        }
    }

    #[test]
    fn test_descriptor_wrong_size() {
        assert!(matches!(
            decode_descriptor(&[0u8; 4]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(decode_descriptor(&[]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_packet_roundtrip() {
        let packets = [
            Packet::Request { operation_id: 7 },
            Packet::Reply { operation_id: 7 },
            Packet::Notification { operation_id: u64::MAX },
        ];
        for packet in packets {
            let bytes = encode_packet(&packet);
            assert_eq!(decode_packet(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_packet_bad_tag() {
        let mut bytes = encode_packet(&Packet::Request { operation_id: 1 });
        bytes[0] = 0xff;
        assert!(matches!(decode_packet(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_packet_bad_length() {
        assert!(matches!(decode_packet(&[1u8; 3]), Err(Error::Protocol(_))));
    }
}
