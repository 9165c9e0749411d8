//! IPv4 header parsing and construction.
//!
//! Receive-side validation is structural only (version, IHL, total
//! length within the buffer); header checksums on inbound packets are
//! trusted, matching the rest of the receive path. Outbound headers are
//! always checksummed.
//!
//! # References
//! - RFC 791: Internet Protocol

use core::fmt;

use crate::checksum;

/// IPv4 header length without options (IHL == 5).
pub const IPV4_HEADER_LEN: usize = 20;

/// TTL stamped on every outbound packet.
pub const IPV4_DEFAULT_TTL: u8 = 60;

// ============================================================================
// Protocol numbers
// ============================================================================

/// IPv4 protocol numbers handled by the stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Proto {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl Ipv4Proto {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            1 => Some(Ipv4Proto::Icmp),
            6 => Some(Ipv4Proto::Tcp),
            17 => Some(Ipv4Proto::Udp),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Address
// ============================================================================

/// IPv4 address (4 octets, network order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// All zeros (0.0.0.0).
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

    /// Limited broadcast (255.255.255.255).
    pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255, 255, 255, 255]
    }

    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

// ============================================================================
// Header
// ============================================================================

/// Parsed IPv4 header fields the stack cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub total_len: u16,
    pub ident: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Errors from IPv4 parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Error {
    Truncated,
    BadVersion(u8),
    BadHeaderLen(u8),
    BadTotalLen(u16),
}

/// Parse an IPv4 packet into its header and payload.
///
/// The payload slice covers `total_len - ihl * 4` bytes, so link-layer
/// padding after a short datagram is stripped.
pub fn parse_ipv4(packet: &[u8]) -> Result<(Ipv4Header, &[u8]), Ipv4Error> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(Ipv4Error::Truncated);
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(Ipv4Error::BadVersion(version));
    }
    let ihl = packet[0] & 0x0F;
    if ihl < 5 {
        return Err(Ipv4Error::BadHeaderLen(ihl));
    }
    let header_len = ihl as usize * 4;
    let total_len = u16::from_be_bytes([packet[2], packet[3]]);
    if (total_len as usize) < header_len || total_len as usize > packet.len() {
        return Err(Ipv4Error::BadTotalLen(total_len));
    }
    let header = Ipv4Header {
        ihl,
        total_len,
        ident: u16::from_be_bytes([packet[4], packet[5]]),
        ttl: packet[8],
        proto: packet[9],
        src: Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]),
        dst: Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]),
    };
    Ok((header, &packet[header_len..total_len as usize]))
}

/// Build a 20-byte IPv4 header with Don't Fragment set, TTL 60 and the
/// checksum filled in.
pub fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: Ipv4Proto,
    payload_len: usize,
    ident: u16,
) -> [u8; IPV4_HEADER_LEN] {
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    let mut hdr = [0u8; IPV4_HEADER_LEN];
    hdr[0] = 0x45; // version 4, IHL 5
    hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    hdr[4..6].copy_from_slice(&ident.to_be_bytes());
    hdr[6] = 0x40; // DF
    hdr[8] = IPV4_DEFAULT_TTL;
    hdr[9] = proto.to_raw();
    hdr[12..16].copy_from_slice(&src.0);
    hdr[16..20].copy_from_slice(&dst.0);
    let sum = checksum::compute(&hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
    hdr
}
