//! ARP: packet codec, request/reply handling and the address cache.
//!
//! The cache is a small fixed table filled passively: every well-formed
//! ARP packet with a non-zero sender teaches us a binding. Replacement
//! is round-robin with one exception: the slot holding the gateway's
//! binding is never evicted, since losing it stalls all off-link
//! traffic until the next exchange with the gateway.
//!
//! # References
//! - RFC 826: An Ethernet Address Resolution Protocol

use alloc::vec::Vec;

use crate::ethernet::EthAddr;
use crate::ipv4::Ipv4Addr;

/// Number of entries in the address cache.
pub const ARP_TABLE_LEN: usize = 8;

/// ARP packet length for IPv4 over Ethernet.
pub const ARP_PACKET_LEN: usize = 28;

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;

// ============================================================================
// Packet codec
// ============================================================================

/// ARP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

impl ArpOp {
    pub fn from_raw(v: u16) -> Option<Self> {
        match v {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
        }
    }
}

/// Parsed ARP packet (IPv4 over Ethernet only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: EthAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: EthAddr,
    pub target_ip: Ipv4Addr,
}

/// Errors from ARP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    Truncated,
    BadHardwareType(u16),
    BadProtocolType(u16),
    BadAddressLen,
    BadOperation(u16),
}

/// Parse an ARP packet, rejecting anything that isn't IPv4-over-Ethernet.
pub fn parse_arp(data: &[u8]) -> Result<ArpPacket, ArpError> {
    if data.len() < ARP_PACKET_LEN {
        return Err(ArpError::Truncated);
    }
    let htype = u16::from_be_bytes([data[0], data[1]]);
    if htype != ARP_HTYPE_ETHERNET {
        return Err(ArpError::BadHardwareType(htype));
    }
    let ptype = u16::from_be_bytes([data[2], data[3]]);
    if ptype != ARP_PTYPE_IPV4 {
        return Err(ArpError::BadProtocolType(ptype));
    }
    if data[4] != 6 || data[5] != 4 {
        return Err(ArpError::BadAddressLen);
    }
    let raw_op = u16::from_be_bytes([data[6], data[7]]);
    let op = ArpOp::from_raw(raw_op).ok_or(ArpError::BadOperation(raw_op))?;

    let mut sender_mac = [0u8; 6];
    let mut target_mac = [0u8; 6];
    sender_mac.copy_from_slice(&data[8..14]);
    target_mac.copy_from_slice(&data[18..24]);

    Ok(ArpPacket {
        op,
        sender_mac: EthAddr(sender_mac),
        sender_ip: Ipv4Addr([data[14], data[15], data[16], data[17]]),
        target_mac: EthAddr(target_mac),
        target_ip: Ipv4Addr([data[24], data[25], data[26], data[27]]),
    })
}

/// Serialize an ARP packet to its 28-byte wire form.
pub fn serialize_arp(packet: &ArpPacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(ARP_PACKET_LEN);
    out.extend_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    out.extend_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    out.push(6);
    out.push(4);
    out.extend_from_slice(&packet.op.to_raw().to_be_bytes());
    out.extend_from_slice(&packet.sender_mac.0);
    out.extend_from_slice(&packet.sender_ip.0);
    out.extend_from_slice(&packet.target_mac.0);
    out.extend_from_slice(&packet.target_ip.0);
    out
}

/// Build a broadcast who-has request for `target_ip`.
pub fn build_arp_request(our_mac: EthAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    serialize_arp(&ArpPacket {
        op: ArpOp::Request,
        sender_mac: our_mac,
        sender_ip: our_ip,
        target_mac: EthAddr::ZERO,
        target_ip,
    })
}

/// Build a gratuitous announcement: a request with sender IP == target
/// IP, broadcast so neighbors refresh their caches.
pub fn build_arp_announcement(our_mac: EthAddr, our_ip: Ipv4Addr) -> Vec<u8> {
    serialize_arp(&ArpPacket {
        op: ArpOp::Request,
        sender_mac: our_mac,
        sender_ip: our_ip,
        target_mac: EthAddr::ZERO,
        target_ip: our_ip,
    })
}

// ============================================================================
// Address cache
// ============================================================================

/// One IP-to-MAC binding.
#[derive(Debug, Clone, Copy)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: EthAddr,
    pub valid: bool,
}

impl ArpEntry {
    const EMPTY: ArpEntry = ArpEntry {
        ip: Ipv4Addr::UNSPECIFIED,
        mac: EthAddr::ZERO,
        valid: false,
    };
}

/// Fixed-size address cache with a round-robin replacement cursor.
#[derive(Debug)]
pub struct ArpCache {
    entries: [ArpEntry; ARP_TABLE_LEN],
    next_slot: usize,
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpCache {
    pub const fn new() -> Self {
        ArpCache {
            entries: [ArpEntry::EMPTY; ARP_TABLE_LEN],
            next_slot: 0,
        }
    }

    /// Look up the MAC bound to `ip`.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<EthAddr> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    /// Learn a binding from a received packet.
    ///
    /// Zero senders are ignored. An existing entry for `ip` is
    /// refreshed in place without touching the cursor; otherwise the
    /// entry at the cursor is replaced, skipping past the slot that
    /// holds `gateway_ip` so the gateway binding survives churn.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: EthAddr, gateway_ip: Ipv4Addr) {
        if ip.is_unspecified() || mac.is_zero() {
            return;
        }
        for entry in self.entries.iter_mut() {
            if entry.valid && entry.ip == ip {
                entry.mac = mac;
                return;
            }
        }
        let cursor = &self.entries[self.next_slot];
        if cursor.valid && cursor.ip == gateway_ip {
            self.next_slot = (self.next_slot + 1) % ARP_TABLE_LEN;
        }
        self.entries[self.next_slot] = ArpEntry { ip, mac, valid: true };
        self.next_slot = (self.next_slot + 1) % ARP_TABLE_LEN;
    }

    #[cfg(test)]
    fn slot(&self, i: usize) -> &ArpEntry {
        &self.entries[i]
    }
}

// ============================================================================
// Receive handling
// ============================================================================

/// Outcome of processing a received ARP packet.
#[derive(Debug, PartialEq, Eq)]
pub enum ArpResult {
    /// Learned (or ignored); nothing to send.
    Handled,
    /// A reply must be sent, unicast to `dst`.
    Reply { dst: EthAddr, packet: Vec<u8> },
}

/// Process a received ARP payload: learn from the sender, and answer
/// requests that target `our_ip`.
pub fn process_arp(
    data: &[u8],
    our_mac: EthAddr,
    our_ip: Ipv4Addr,
    gateway_ip: Ipv4Addr,
    cache: &mut ArpCache,
) -> Result<ArpResult, ArpError> {
    let packet = parse_arp(data)?;
    cache.learn(packet.sender_ip, packet.sender_mac, gateway_ip);

    if packet.op == ArpOp::Request && packet.target_ip == our_ip && !our_ip.is_unspecified() {
        log::trace!("arp: answering who-has {} from {}", our_ip, packet.sender_ip);
        let reply = serialize_arp(&ArpPacket {
            op: ArpOp::Reply,
            sender_mac: our_mac,
            sender_ip: our_ip,
            target_mac: packet.sender_mac,
            target_ip: packet.sender_ip,
        });
        return Ok(ArpResult::Reply {
            dst: packet.sender_mac,
            packet: reply,
        });
    }
    Ok(ArpResult::Handled)
}
