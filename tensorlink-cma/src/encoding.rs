//! Wire encoding for CMA descriptors.
//!
//! Unlike the basic channel, the descriptor carries everything the peer
//! needs to pull the payload directly out of the sender's address space:
//! the correlation id, the sender's pid, the buffer address and its
//! length.
//!
//! Layout (little endian):
//! - operation_id: 8 bytes
//! - pid: 4 bytes (i32)
//! - addr: 8 bytes
//! - len: 8 bytes

use tensorlink::error::{Error, Result};

/// Fixed descriptor size on the wire.
pub const DESCRIPTOR_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmaDescriptor {
    pub operation_id: u64,
    pub pid: i32,
    pub addr: u64,
    pub len: u64,
}

#[inline]
pub fn encode_descriptor(descriptor: &CmaDescriptor) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DESCRIPTOR_SIZE);
    bytes.extend_from_slice(&descriptor.operation_id.to_le_bytes());
    bytes.extend_from_slice(&descriptor.pid.to_le_bytes());
    bytes.extend_from_slice(&descriptor.addr.to_le_bytes());
    bytes.extend_from_slice(&descriptor.len.to_le_bytes());
    bytes
}

#[inline]
pub fn decode_descriptor(bytes: &[u8]) -> Result<CmaDescriptor> {
    if bytes.len() != DESCRIPTOR_SIZE {
        return Err(Error::Protocol(format!(
            "cma descriptor has {} bytes, expected {}",
            bytes.len(),
            DESCRIPTOR_SIZE
        )));
    }
    Ok(CmaDescriptor {
        operation_id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
        pid: i32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        addr: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
        len: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
    })
}
