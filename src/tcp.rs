//! TCP: header/option codec and the passive-open connection machine.
//!
//! The machine is deliberately small. Only in-order payload is
//! accepted (anything else is dropped un-ACKed and the peer
//! retransmits), there is no congestion control and no active open.
//! Ring counters double as relative sequence numbers: `counter +
//! rawseq` is the wire sequence number, so acknowledgment processing
//! is counter arithmetic (see [`crate::ring`]).
//!
//! Two phantom bytes need care. The SYN we acknowledge costs the peer
//! one sequence number (`rx.rawseq += 1` when the handshake ACK
//! arrives), and our own SYN costs us one (`tx.rawseq += 1` right
//! after the SYN+ACK goes out). Our FIN is *not* added to `tx.next`;
//! it is observed as acknowledged when `tx.tail` moves past `tx.next`.
//!
//! # References
//! - RFC 793: Transmission Control Protocol

use alloc::vec;
use alloc::vec::Vec;

use crate::checksum;
use crate::ipv4::{Ipv4Addr, Ipv4Proto};
use crate::socket::{Stream, StreamState};
use crate::timer::TimerService;

/// TCP flag bits.
pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// Minimum TCP header length (data offset 5).
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// MSS we advertise: 576-byte minimum reassembly datagram minus
/// IP and TCP headers.
pub const TCP_DEFAULT_MSS: u16 = 536;

/// Option kinds the stack understands.
pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_WSCALE: u8 = 3;

/// Seconds a stream lingers in TIME_WAIT.
pub const TIME_WAIT_SECS: u32 = 10;
/// Retransmission timer period in seconds.
pub const RETRANSMIT_SECS: u32 = 5;

/// Options carried on our SYN+ACK: MSS 536, padded out with NOPs.
const SYN_ACK_OPTIONS: [u8; 8] = [
    TCP_OPT_MSS,
    4,
    (TCP_DEFAULT_MSS >> 8) as u8,
    (TCP_DEFAULT_MSS & 0xFF) as u8,
    TCP_OPT_NOP,
    TCP_OPT_NOP,
    TCP_OPT_NOP,
    TCP_OPT_END,
];

/// Padding options on ordinary segments.
const PLAIN_OPTIONS: [u8; 4] = [TCP_OPT_NOP, TCP_OPT_NOP, TCP_OPT_NOP, TCP_OPT_END];

// ============================================================================
// Codec
// ============================================================================

/// Parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
}

impl TcpHeader {
    #[inline]
    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    #[inline]
    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }
}

/// Errors from TCP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    Truncated,
    BadDataOffset(u8),
}

/// Parse a TCP segment into header, options region and payload.
pub fn parse_tcp_header(data: &[u8]) -> Result<(TcpHeader, &[u8], &[u8]), TcpError> {
    if data.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }
    let data_offset = data[12] >> 4;
    let header_len = data_offset as usize * 4;
    if !(5..=15).contains(&data_offset) || header_len > data.len() {
        return Err(TcpError::BadDataOffset(data_offset));
    }
    let header = TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
    };
    Ok((header, &data[TCP_HEADER_MIN_LEN..header_len], &data[header_len..]))
}

/// Walk the options region for `kind`, returning its value bytes.
///
/// Bounds-checked throughout; a malformed region simply yields `None`.
pub fn find_tcp_option(options: &[u8], kind: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => return None,
            TCP_OPT_NOP => i += 1,
            k => {
                let len = *options.get(i + 1)? as usize;
                if len < 2 || i + len > options.len() {
                    return None;
                }
                if k == kind {
                    return Some(&options[i + 2..i + len]);
                }
                i += len;
            }
        }
    }
    None
}

/// Checksum a complete TCP segment over its IPv4 pseudo-header.
pub fn compute_tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src_ip.0);
    pseudo[4..8].copy_from_slice(&dst_ip.0);
    pseudo[9] = Ipv4Proto::Tcp.to_raw();
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    checksum::finish(checksum::update(checksum::update(0, &pseudo), segment))
}

/// Build a complete TCP segment with the checksum filled in.
/// `options` must already be padded to a multiple of 4.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    options: &[u8],
    payload: &[u8],
) -> Vec<u8> {
    debug_assert!(options.len() % 4 == 0);
    let header_len = TCP_HEADER_MIN_LEN + options.len();
    let mut seg = Vec::with_capacity(header_len + payload.len());
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push(((header_len / 4) as u8) << 4);
    seg.push(flags);
    seg.extend_from_slice(&window.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
    seg.extend_from_slice(options);
    seg.extend_from_slice(payload);
    let sum = compute_tcp_checksum(src_ip, dst_ip, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}

/// Wraparound-safe `a > b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Wraparound-safe `a < b` in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

// ============================================================================
// Connection machine
// ============================================================================

/// Addressing for segments emitted by the machine. `emit` receives
/// complete TCP segments; the caller wraps them in IPv4 to
/// `remote_ip`.
pub(crate) struct TcpContext<'a> {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_port: u16,
    pub emit: &'a mut dyn FnMut(&[u8]),
}

impl TcpContext<'_> {
    fn send(
        &mut self,
        stream: &Stream,
        seq: u32,
        ack: u32,
        flags: u8,
        options: &[u8],
        payload: &[u8],
    ) {
        let window = stream.rx.free().min(u16::MAX as u32) as u16;
        let seg = build_tcp_segment(
            self.local_ip,
            self.remote_ip,
            self.local_port,
            stream.remote_port,
            seq,
            ack,
            flags,
            window,
            options,
            payload,
        );
        (self.emit)(&seg);
    }
}

/// What became of the stream after processing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpDisposition {
    /// Stream still live.
    Continue,
    /// Stream released; the caller reclaims the pool slot.
    Released,
}

fn release<T: TimerService>(stream: &mut Stream, timers: &mut T) -> TcpDisposition {
    if let Some(t) = stream.timer.take() {
        timers.cancel(t);
    }
    stream.release();
    TcpDisposition::Released
}

fn arm_retransmit<T: TimerService>(stream: &mut Stream, timers: &mut T) {
    match stream.timer {
        Some(t) => timers.reset(t, RETRANSMIT_SECS),
        None => stream.timer = timers.start(RETRANSMIT_SECS),
    }
}

/// Drive one received segment through the stream's state machine.
///
/// For a stream in Listen, `isn` seeds our side of the sequence space;
/// other states ignore it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn process_segment<T: TimerService>(
    stream: &mut Stream,
    ctx: &mut TcpContext<'_>,
    hdr: &TcpHeader,
    options: &[u8],
    payload: &[u8],
    isn: u32,
    timers: &mut T,
) -> TcpDisposition {
    match stream.state {
        StreamState::Listen => {
            if !hdr.is_syn() {
                return TcpDisposition::Continue;
            }
            stream.remote_ip = ctx.remote_ip;
            stream.remote_port = hdr.src_port;
            stream.rx.reset();
            stream.tx.reset();
            stream.rx.rawseq = hdr.seq;
            stream.tx.rawseq = isn;
            stream.tx.window = hdr.window as u32;
            stream.tx.scale = match find_tcp_option(options, TCP_OPT_WSCALE) {
                Some([shift]) => 1u16 << (*shift).min(14),
                _ => 1,
            };
            // SYN+ACK: our ISN, acknowledging their phantom SYN byte.
            ctx.send(
                stream,
                stream.tx.rawseq,
                hdr.seq.wrapping_add(1),
                TCP_FLAG_SYN | TCP_FLAG_ACK,
                &SYN_ACK_OPTIONS,
                &[],
            );
            // Our SYN consumed one sequence number.
            stream.tx.rawseq = stream.tx.rawseq.wrapping_add(1);
            stream.state = StreamState::SynReceived;
            log::debug!("tcp: {}:{} syn-received", ctx.remote_ip, hdr.src_port);
            TcpDisposition::Continue
        }

        StreamState::SynReceived => {
            if hdr.is_rst() {
                // Half-open peer went away; back to listening.
                stream.rx.reset();
                stream.tx.reset();
                stream.remote_ip = Ipv4Addr::UNSPECIFIED;
                stream.remote_port = 0;
                stream.state = StreamState::Listen;
                return TcpDisposition::Continue;
            }
            if hdr.flags == TCP_FLAG_ACK {
                // Their phantom SYN byte is now behind us.
                stream.rx.rawseq = stream.rx.rawseq.wrapping_add(1);
                stream.state = StreamState::Established;
                log::debug!("tcp: {}:{} established", ctx.remote_ip, stream.remote_port);
            }
            TcpDisposition::Continue
        }

        StreamState::Established
        | StreamState::FinWait1
        | StreamState::FinWait2
        | StreamState::CloseWait
        | StreamState::Closing
        | StreamState::LastAck
        | StreamState::TimeWait => {
            if hdr.is_rst() {
                log::debug!("tcp: {}:{} reset by peer", ctx.remote_ip, stream.remote_port);
                return release(stream, timers);
            }

            // Every segment refreshes our view of the peer's window and
            // of how much of our stream it has acknowledged.
            if hdr.is_ack() {
                stream.tx.window = stream.tx.scale as u32 * hdr.window as u32;
                stream.tx.tail = hdr.ack.wrapping_sub(stream.tx.rawseq);
            }

            // Payload is received until the peer's FIN is in: after our
            // own close() the peer may still be flushing data to us.
            let receiving = matches!(
                stream.state,
                StreamState::Established | StreamState::FinWait1 | StreamState::FinWait2
            );
            if receiving && !payload.is_empty() {
                let expected = hdr.seq.wrapping_sub(stream.rx.rawseq);
                if expected == stream.rx.head && stream.rx.write(payload) {
                    ctx.send(
                        stream,
                        stream.tx.next.wrapping_add(stream.tx.rawseq),
                        stream.rx.head.wrapping_add(stream.rx.rawseq),
                        TCP_FLAG_ACK,
                        &PLAIN_OPTIONS,
                        &[],
                    );
                } else {
                    // Out of order or oversized: drop without ACK and
                    // let the peer retransmit from our last ACK.
                    log::trace!(
                        "tcp: dropped {} bytes at {:#x} (expected {:#x})",
                        payload.len(),
                        hdr.seq,
                        stream.rx.head.wrapping_add(stream.rx.rawseq)
                    );
                }
            }

            let our_fin_acked = seq_gt(stream.tx.tail, stream.tx.next);

            // A FIN counts only at the next expected receive position;
            // one arriving ahead of in-flight data (or a stale
            // retransmission) is ignored like out-of-order payload.
            let fin_in_order = hdr.seq.wrapping_sub(stream.rx.rawseq) == stream.rx.head;
            if hdr.is_fin() && fin_in_order {
                // Their FIN is a phantom byte too.
                if receiving {
                    stream.rx.rawseq = stream.rx.rawseq.wrapping_add(1);
                }
                ctx.send(
                    stream,
                    stream.tx.next.wrapping_add(stream.tx.rawseq),
                    stream.rx.head.wrapping_add(stream.rx.rawseq),
                    TCP_FLAG_ACK,
                    &PLAIN_OPTIONS,
                    &[],
                );
                match stream.state {
                    StreamState::Established => stream.state = StreamState::CloseWait,
                    StreamState::FinWait1 => {
                        if our_fin_acked {
                            stream.state = StreamState::TimeWait;
                            enter_time_wait(stream, timers);
                        } else {
                            stream.state = StreamState::Closing;
                        }
                    }
                    StreamState::FinWait2 => {
                        stream.state = StreamState::TimeWait;
                        enter_time_wait(stream, timers);
                    }
                    // Later states already counted the peer's FIN, so
                    // the in-order gate keeps duplicates out of here.
                    _ => {}
                }
                return TcpDisposition::Continue;
            }

            match stream.state {
                StreamState::Established => {
                    // The window may have opened; push queued data.
                    send_pending(stream, ctx, timers);
                }
                StreamState::FinWait1 if our_fin_acked => {
                    stream.state = StreamState::FinWait2;
                }
                StreamState::Closing if our_fin_acked => {
                    stream.state = StreamState::TimeWait;
                    enter_time_wait(stream, timers);
                }
                StreamState::LastAck if our_fin_acked => {
                    log::debug!("tcp: {}:{} closed", ctx.remote_ip, stream.remote_port);
                    return release(stream, timers);
                }
                _ => {}
            }
            TcpDisposition::Continue
        }

        // Listen-family states never reach here via demux.
        _ => TcpDisposition::Continue,
    }
}

fn enter_time_wait<T: TimerService>(stream: &mut Stream, timers: &mut T) {
    match stream.timer {
        Some(t) => timers.reset(t, TIME_WAIT_SECS),
        None => stream.timer = timers.start(TIME_WAIT_SECS),
    }
}

/// Transmit whatever the peer's window and our queue allow, as one
/// segment (the TX ring is smaller than the MSS). Advances `tx.next`
/// and (re)arms the retransmission timer when anything goes out.
pub(crate) fn send_pending<T: TimerService>(
    stream: &mut Stream,
    ctx: &mut TcpContext<'_>,
    timers: &mut T,
) {
    let tx = &stream.tx;
    let window_edge = tx.tail.wrapping_add(tx.window);
    let limit = if seq_lt(window_edge, tx.head) { window_edge } else { tx.head };
    if !seq_gt(limit, tx.next) {
        return;
    }
    let able = limit.wrapping_sub(tx.next) as usize;
    let mut chunk = vec![0u8; able];
    stream.tx.copy_range(stream.tx.next, &mut chunk);
    ctx.send(
        stream,
        stream.tx.next.wrapping_add(stream.tx.rawseq),
        stream.rx.head.wrapping_add(stream.rx.rawseq),
        TCP_FLAG_ACK | TCP_FLAG_PSH,
        &PLAIN_OPTIONS,
        &chunk,
    );
    stream.tx.next = stream.tx.next.wrapping_add(able as u32);
    arm_retransmit(stream, timers);
}

/// Begin an orderly close from our side.
///
/// The FIN goes out at `tx.next` without advancing it; its
/// acknowledgment is later observed as `tx.tail` passing `tx.next`.
pub(crate) fn close<T: TimerService>(
    stream: &mut Stream,
    ctx: &mut TcpContext<'_>,
    timers: &mut T,
) -> TcpDisposition {
    match stream.state {
        StreamState::Established | StreamState::CloseWait => {
            ctx.send(
                stream,
                stream.tx.next.wrapping_add(stream.tx.rawseq),
                stream.rx.head.wrapping_add(stream.rx.rawseq),
                TCP_FLAG_FIN | TCP_FLAG_ACK,
                &PLAIN_OPTIONS,
                &[],
            );
            stream.state = if stream.state == StreamState::Established {
                StreamState::FinWait1
            } else {
                StreamState::LastAck
            };
            arm_retransmit(stream, timers);
            TcpDisposition::Continue
        }
        // Nothing on the wire worth finishing.
        StreamState::Listen | StreamState::SynReceived => release(stream, timers),
        _ => TcpDisposition::Continue,
    }
}

/// Periodic per-stream timer work: TIME_WAIT reaping and
/// retransmission rewind.
pub(crate) fn on_timer_tick<T: TimerService>(
    stream: &mut Stream,
    ctx: &mut TcpContext<'_>,
    timers: &mut T,
) -> TcpDisposition {
    let Some(timer) = stream.timer else {
        return TcpDisposition::Continue;
    };
    if stream.state == StreamState::TimeWait {
        if timers.expired(timer) {
            stream.timer = None;
            return release(stream, timers);
        }
        return TcpDisposition::Continue;
    }
    if !matches!(
        stream.state,
        StreamState::Established
            | StreamState::FinWait1
            | StreamState::Closing
            | StreamState::CloseWait
            | StreamState::LastAck
    ) {
        return TcpDisposition::Continue;
    }
    if !timers.expired(timer) {
        return TcpDisposition::Continue;
    }
    stream.timer = None;
    if stream.tx.next != stream.tx.tail {
        // Unacknowledged data: rewind and resend from the last ACK.
        log::debug!(
            "tcp: {}:{} retransmit from {:#x}",
            ctx.remote_ip,
            stream.remote_port,
            stream.tx.tail.wrapping_add(stream.tx.rawseq)
        );
        stream.tx.next = stream.tx.tail;
        send_pending(stream, ctx, timers);
    } else if matches!(
        stream.state,
        StreamState::FinWait1 | StreamState::Closing | StreamState::LastAck
    ) {
        // Our FIN went unanswered; send it again.
        ctx.send(
            stream,
            stream.tx.next.wrapping_add(stream.tx.rawseq),
            stream.rx.head.wrapping_add(stream.rx.rawseq),
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            &PLAIN_OPTIONS,
            &[],
        );
        arm_retransmit(stream, timers);
    }
    TcpDisposition::Continue
}
