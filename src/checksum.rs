//! Internet checksum engine.
//!
//! One 16-bit one's-complement sum shared by IPv4 headers, ICMP, UDP
//! and TCP (the latter two over a pseudo-header). The sum is built
//! incrementally so callers can feed a packet in pieces: pseudo-header,
//! then header, then payload.

/// Fold `data` into a running one's-complement sum.
///
/// Bytes pair up big-endian. A trailing odd byte becomes the high byte
/// of a zero-padded word, so only the *final* chunk of an incremental
/// sum may have odd length. The end-around carry is folded after every
/// word, keeping the accumulator within 16 bits.
pub fn update(sum: u16, data: &[u8]) -> u16 {
    let mut acc = sum as u32;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        acc += u16::from_be_bytes([pair[0], pair[1]]) as u32;
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u32) << 8;
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    acc as u16
}

/// Final inversion. A checksum of all-zero data is transmitted as-is;
/// protocols with a "0 means no checksum" rule (UDP) substitute 0xFFFF
/// themselves.
#[inline]
pub fn finish(sum: u16) -> u16 {
    !sum
}

/// One-shot convenience: sum `data` from scratch and invert.
#[inline]
pub fn compute(data: &[u8]) -> u16 {
    finish(update(0, data))
}
