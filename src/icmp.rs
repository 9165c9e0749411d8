//! ICMP echo handling.
//!
//! Only Echo Request/Reply are implemented; everything else is dropped
//! by the dispatcher.

use alloc::vec::Vec;

use crate::checksum;

/// ICMP Echo Reply type.
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
/// ICMP Echo Request type.
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// ICMP header length (echo messages).
pub const ICMP_HEADER_LEN: usize = 8;

/// Parsed ICMP echo header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub ident: u16,
    pub seq: u16,
}

/// Errors from ICMP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    Truncated,
}

/// Parse an ICMP message into its header and payload.
pub fn parse_icmp(data: &[u8]) -> Result<(IcmpHeader, &[u8]), IcmpError> {
    if data.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }
    Ok((
        IcmpHeader {
            icmp_type: data[0],
            code: data[1],
            checksum: u16::from_be_bytes([data[2], data[3]]),
            ident: u16::from_be_bytes([data[4], data[5]]),
            seq: u16::from_be_bytes([data[6], data[7]]),
        },
        &data[ICMP_HEADER_LEN..],
    ))
}

/// Build an Echo Reply answering `request` (a full ICMP message).
///
/// Returns `None` unless `request` is a well-formed Echo Request.
/// Identifier, sequence and payload are echoed; the checksum is
/// recomputed.
pub fn build_echo_reply(request: &[u8]) -> Option<Vec<u8>> {
    let (hdr, payload) = parse_icmp(request).ok()?;
    if hdr.icmp_type != ICMP_TYPE_ECHO_REQUEST || hdr.code != 0 {
        return None;
    }
    let mut reply = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    reply.extend_from_slice(&[ICMP_TYPE_ECHO_REPLY, 0, 0, 0]);
    reply.extend_from_slice(&hdr.ident.to_be_bytes());
    reply.extend_from_slice(&hdr.seq.to_be_bytes());
    reply.extend_from_slice(payload);
    let sum = checksum::compute(&reply);
    reply[2..4].copy_from_slice(&sum.to_be_bytes());
    Some(reply)
}
