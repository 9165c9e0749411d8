//! UDP header parsing and datagram construction.
//!
//! Outbound datagrams carry a real checksum (0xFFFF when the computed
//! sum is zero, per RFC 768); inbound checksums are trusted.

use alloc::vec::Vec;

use crate::checksum;
use crate::ipv4::{Ipv4Addr, Ipv4Proto};

/// UDP header length in bytes.
pub const UDP_HEADER_LEN: usize = 8;

/// Parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut out = [0u8; UDP_HEADER_LEN];
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }
}

/// Errors from UDP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    Truncated,
    BadLength(u16),
}

/// Parse a UDP datagram into its header and payload.
///
/// The payload is bounded by the UDP length field, which must cover at
/// least the header and fit inside the buffer.
pub fn parse_udp(data: &[u8]) -> Result<(UdpHeader, &[u8]), UdpError> {
    if data.len() < UDP_HEADER_LEN {
        return Err(UdpError::Truncated);
    }
    let header = UdpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        length: u16::from_be_bytes([data[4], data[5]]),
        checksum: u16::from_be_bytes([data[6], data[7]]),
    };
    let len = header.length as usize;
    if len < UDP_HEADER_LEN || len > data.len() {
        return Err(UdpError::BadLength(header.length));
    }
    Ok((header, &data[UDP_HEADER_LEN..len]))
}

/// Checksum a complete UDP datagram over its IPv4 pseudo-header.
pub fn compute_udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, datagram: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.0);
    pseudo[4..8].copy_from_slice(&dst_ip.0);
    pseudo[9] = Ipv4Proto::Udp.to_raw();
    pseudo[10..12].copy_from_slice(&(datagram.len() as u16).to_be_bytes());
    checksum::finish(checksum::update(checksum::update(0, &pseudo), datagram))
}

/// Build a complete UDP datagram with the checksum filled in.
pub fn build_udp_datagram(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = (UDP_HEADER_LEN + payload.len()) as u16;
    let header = UdpHeader {
        src_port,
        dst_port,
        length,
        checksum: 0,
    };
    let mut datagram = Vec::with_capacity(length as usize);
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);
    let mut sum = compute_udp_checksum(src_ip, dst_ip, &datagram);
    if sum == 0 {
        // 0 on the wire means "no checksum".
        sum = 0xFFFF;
    }
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());
    datagram
}
