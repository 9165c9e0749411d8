//! Polled TCP/IP stack for memory-constrained hosts.
//!
//! This crate implements a small, single-threaded network stack:
//! - ARP with a bounded, round-robin address cache
//! - IPv4 send/receive with ICMP echo
//! - UDP datagram sockets with length-prefixed delivery
//! - Passive-open TCP with ring-buffered streams
//! - A DHCP client covering the full lease lifecycle
//!
//! # Design
//!
//! There are no threads and no interrupt context. The host drives the
//! stack from its main loop:
//! - [`NetStack::packet_pump`] drains frames pending in the link driver
//! - [`NetStack::handle_timers`] is called roughly once per second
//!
//! Blocking socket calls are poll loops over the pump, so a "blocked"
//! caller keeps servicing the network. All protocol state lives in
//! fixed-capacity pools; the heap is only used for transient outbound
//! frames.
//!
//! The three host dependencies are injected as traits: [`LinkDriver`]
//! for frame I/O, [`TimerService`] for countdown timers and
//! [`LeaseStore`] for DHCP lease persistence.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arp;
pub mod checksum;
pub mod device;
pub mod dhcp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod ring;
mod rng;
pub mod socket;
pub mod stack;
pub mod storage;
pub mod tcp;
#[cfg(test)]
pub(crate) mod testutil;
pub mod timer;
pub mod udp;

pub use arp::{
    build_arp_announcement, build_arp_request, parse_arp, process_arp, serialize_arp, ArpCache,
    ArpEntry, ArpError, ArpOp, ArpPacket, ArpResult, ARP_TABLE_LEN,
};
pub use device::LinkDriver;
pub use dhcp::{DhcpClient, DhcpError, DhcpState};
pub use ethernet::{
    build_ethernet_frame, parse_ethernet, EthAddr, EthError, EthHeader, ETHERTYPE_ARP,
    ETHERTYPE_IPV4,
};
pub use icmp::{build_echo_reply, parse_icmp, IcmpError, IcmpHeader};
pub use ipv4::{build_ipv4_header, parse_ipv4, Ipv4Addr, Ipv4Error, Ipv4Header, Ipv4Proto};
pub use ring::{RxRing, TxRing, STREAM_RX_CAPACITY, STREAM_TX_CAPACITY};
pub use socket::{
    SocketError, SocketHandle, SocketTable, StreamHandle, StreamState, MAX_SOCKETS, MAX_STREAMS,
};
pub use stack::{NetConfig, NetStack, NetStats, NetStatsSnapshot};
pub use storage::{LeaseRecord, LeaseStore};
pub use tcp::{
    build_tcp_segment, compute_tcp_checksum, parse_tcp_header, TcpError, TcpHeader, TCP_FLAG_ACK,
    TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN,
};
pub use timer::{TimerHandle, TimerService};
pub use udp::{build_udp_datagram, parse_udp, UdpError, UdpHeader};
