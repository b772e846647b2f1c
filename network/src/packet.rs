use bytes::Bytes;
use std::net::Ipv4Addr;

/// An immutable packet travelling between two hosts.
///
/// Packets are created by [crate::Network::packet], which assigns identifiers in creation
/// order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    id: u64,
    origin: Ipv4Addr,
    dest: Ipv4Addr,
    payload: Bytes,
}

impl Packet {
    pub(crate) fn new(id: u64, origin: Ipv4Addr, dest: Ipv4Addr, payload: Bytes) -> Self {
        Self {
            id,
            origin,
            dest,
            payload,
        }
    }

    /// Returns the identifier assigned when the packet was created.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the address of the host that created the packet.
    pub fn origin(&self) -> Ipv4Addr {
        self.origin
    }

    /// Returns the address the packet is sent to.
    pub fn dest(&self) -> Ipv4Addr {
        self.dest
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the size of the payload, in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
