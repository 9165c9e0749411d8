//! Ethernet II framing.

use alloc::vec::Vec;
use core::fmt;

/// Ethernet header length in bytes.
pub const ETH_HLEN: usize = 14;

/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// A 48-bit Ethernet address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    /// The all-zero address (unset / "sender unknown" in ARP).
    pub const ZERO: EthAddr = EthAddr([0; 6]);
    /// The broadcast address.
    pub const BROADCAST: EthAddr = EthAddr([0xFF; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        EthAddr(octets)
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }

    /// Group bit of the first octet (includes broadcast).
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Parsed Ethernet II header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: EthAddr,
    pub src: EthAddr,
    pub ethertype: u16,
}

/// Errors from Ethernet parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EthError {
    /// Frame shorter than the 14-byte header.
    Truncated,
}

/// Parse an Ethernet II frame into its header and payload.
pub fn parse_ethernet(frame: &[u8]) -> Result<(EthHeader, &[u8]), EthError> {
    if frame.len() < ETH_HLEN {
        return Err(EthError::Truncated);
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Ok((
        EthHeader {
            dst: EthAddr(dst),
            src: EthAddr(src),
            ethertype,
        },
        &frame[ETH_HLEN..],
    ))
}

/// Assemble a complete frame: header followed by `payload`.
pub fn build_ethernet_frame(dst: EthAddr, src: EthAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HLEN + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
