//! Link driver abstraction.
//!
//! The NIC driver (ENC28J60-class parts, a TAP device in tests) sits
//! behind this trait. Frame boundaries are the driver's problem; the
//! stack hands it scatter-gather segments so headers need not be
//! copied into one buffer before transmit.

use alloc::vec::Vec;

use crate::ethernet::EthAddr;

/// Host-provided Ethernet frame driver.
pub trait LinkDriver {
    /// Number of received frames waiting to be collected.
    fn frames_pending(&self) -> usize;

    /// Take the next pending frame (complete, starting at the
    /// destination MAC). `None` when nothing is pending.
    fn receive_frame(&mut self) -> Option<Vec<u8>>;

    /// Transmit one frame. The driver writes the Ethernet header from
    /// `dst`/`src`/`ethertype` and then the payload `segments` in
    /// order (e.g. IP header, transport header, body).
    fn send_frame(&mut self, dst: EthAddr, src: EthAddr, ethertype: u16, segments: &[&[u8]]);

    /// Free transmit buffer space in bytes. The stack checks this
    /// before every IPv4 transmit and drops a packet that will not
    /// fit, leaving retransmission to the upper layers.
    fn free_buffer_space(&self) -> usize;
}
