//! DHCP client: BOOTP codec, options TLV and the lease lifecycle.
//!
//! The client covers the whole RFC 2131 client machine relevant to a
//! single interface: Discover/Offer/Request/Ack, init-reboot from a
//! persisted lease, T1 unicast renewal, T2 broadcast rebinding and
//! Nak recovery. Every broadcast conversation starts with a freshly
//! randomized transaction id, and replies whose xid doesn't match ours
//! are ignored wholesale.
//!
//! The client never touches the wire itself; its methods hand back
//! fully formed BOOTP payloads plus addressing, and the stack wraps
//! them in UDP 68→67.
//!
//! # References
//! - RFC 2131: Dynamic Host Configuration Protocol
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use alloc::vec::Vec;

use crate::ethernet::EthAddr;
use crate::ipv4::Ipv4Addr;
use crate::rng::XorShift32;
use crate::storage::LeaseRecord;
use crate::timer::{TimerHandle, TimerService};

/// Server-side UDP port.
pub const DHCP_SERVER_PORT: u16 = 67;
/// Client-side UDP port.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// BOOTP header length, excluding the magic cookie.
pub const BOOTP_HEADER_LEN: usize = 236;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;

/// Broadcast bit in the BOOTP flags field.
const FLAG_BROADCAST: u16 = 0x8000;

// Option codes.
const OPT_PAD: u8 = 0;
const OPT_ROUTER: u8 = 3;
const OPT_HOST_NAME: u8 = 12;
const OPT_REQUESTED_ADDR: u8 = 50;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_REQUEST: u8 = 55;
const OPT_RENEWAL_T1: u8 = 58;
const OPT_REBINDING_T2: u8 = 59;
const OPT_CLIENT_ID: u8 = 61;
const OPT_END: u8 = 0xFF;

// Message types (option 53).
const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;
const MSG_NAK: u8 = 6;

/// Host name we report in option 12.
const HOST_NAME: &[u8] = b"tinystack";

/// Client FSM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    Init,
    Selecting,
    Requesting,
    /// Reacquiring a remembered address at startup. Entered directly:
    /// the RFC 2131 INIT-REBOOT step is instantaneous here because
    /// the request goes out the moment the stored lease is read.
    Rebooting,
    Bound,
    Renewing,
    Rebinding,
}

/// Errors from BOOTP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpError {
    Truncated,
    BadCookie,
}

// ============================================================================
// Codec
// ============================================================================

/// A parsed BOOTP reply: the fixed fields we use plus the raw options
/// region.
#[derive(Debug, Clone, Copy)]
pub struct BootpMessage<'a> {
    pub op: u8,
    pub xid: u32,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub options: &'a [u8],
}

/// Parse a BOOTP message and locate its options region past the magic
/// cookie.
pub fn parse_bootp(data: &[u8]) -> Result<BootpMessage<'_>, DhcpError> {
    if data.len() < BOOTP_HEADER_LEN + 4 {
        return Err(DhcpError::Truncated);
    }
    if data[BOOTP_HEADER_LEN..BOOTP_HEADER_LEN + 4] != MAGIC_COOKIE {
        return Err(DhcpError::BadCookie);
    }
    Ok(BootpMessage {
        op: data[0],
        xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        yiaddr: Ipv4Addr([data[16], data[17], data[18], data[19]]),
        siaddr: Ipv4Addr([data[20], data[21], data[22], data[23]]),
        options: &data[BOOTP_HEADER_LEN + 4..],
    })
}

/// Walk the options TLV for `code`, returning its value bytes.
///
/// 0x00 is a single-byte pad, 0xFF terminates. Truncated options fail
/// closed.
pub fn find_option(options: &[u8], code: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            OPT_END => return None,
            OPT_PAD => i += 1,
            c => {
                let len = *options.get(i + 1)? as usize;
                if i + 2 + len > options.len() {
                    return None;
                }
                if c == code {
                    return Some(&options[i + 2..i + 2 + len]);
                }
                i += 2 + len;
            }
        }
    }
    None
}

fn option_addr(options: &[u8], code: u8) -> Option<Ipv4Addr> {
    let v = find_option(options, code)?;
    if v.len() < 4 {
        return None;
    }
    Some(Ipv4Addr([v[0], v[1], v[2], v[3]]))
}

fn option_u32(options: &[u8], code: u8) -> Option<u32> {
    let v = find_option(options, code)?;
    if v.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
}

struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Fixed BOOTP request header plus cookie. `ciaddr` is non-zero
    /// only when we already own the address (renew/rebind).
    fn new(xid: u32, ciaddr: Ipv4Addr, mac: EthAddr, broadcast: bool) -> Self {
        let mut buf = Vec::with_capacity(BOOTP_HEADER_LEN + 4 + 64);
        buf.push(OP_REQUEST);
        buf.push(1); // htype: Ethernet
        buf.push(6); // hlen
        buf.push(0); // hops
        buf.extend_from_slice(&xid.to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // secs
        let flags = if broadcast { FLAG_BROADCAST } else { 0 };
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&ciaddr.0); // ciaddr
        buf.extend_from_slice(&[0; 12]); // yiaddr, siaddr, giaddr
        buf.extend_from_slice(&mac.0);
        buf.resize(BOOTP_HEADER_LEN, 0); // chaddr pad, sname, file
        buf.extend_from_slice(&MAGIC_COOKIE);
        MessageBuilder { buf }
    }

    fn option(mut self, code: u8, value: &[u8]) -> Self {
        self.buf.push(code);
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value);
        self
    }

    fn client_id(self, mac: EthAddr) -> Self {
        let mut id = [0u8; 7];
        id[0] = 1; // htype: Ethernet
        id[1..].copy_from_slice(&mac.0);
        self.option(OPT_CLIENT_ID, &id)
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf.push(OPT_END);
        self.buf
    }
}

fn build_discover(xid: u32, mac: EthAddr) -> Vec<u8> {
    MessageBuilder::new(xid, Ipv4Addr::UNSPECIFIED, mac, true)
        .option(OPT_MESSAGE_TYPE, &[MSG_DISCOVER])
        .option(OPT_HOST_NAME, HOST_NAME)
        .client_id(mac)
        .option(OPT_PARAM_REQUEST, &[1, OPT_ROUTER, 6]) // mask, router, DNS
        .finish()
}

fn build_request(
    xid: u32,
    mac: EthAddr,
    ciaddr: Ipv4Addr,
    requested: Option<Ipv4Addr>,
    server: Option<Ipv4Addr>,
) -> Vec<u8> {
    let mut b = MessageBuilder::new(xid, ciaddr, mac, ciaddr.is_unspecified())
        .option(OPT_MESSAGE_TYPE, &[MSG_REQUEST])
        .option(OPT_HOST_NAME, HOST_NAME)
        .client_id(mac);
    if let Some(addr) = requested {
        b = b.option(OPT_REQUESTED_ADDR, &addr.0);
    }
    if let Some(addr) = server {
        b = b.option(OPT_SERVER_ID, &addr.0);
    }
    b.option(OPT_PARAM_REQUEST, &[1, OPT_ROUTER, 6]).finish()
}

// ============================================================================
// Client machine
// ============================================================================

/// A BOOTP payload the stack must wrap in UDP 68→67 and transmit.
#[derive(Debug)]
pub(crate) struct DhcpSend {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub payload: Vec<u8>,
}

impl DhcpSend {
    fn broadcast(payload: Vec<u8>) -> Self {
        DhcpSend {
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::BROADCAST,
            payload,
        }
    }
}

/// What the stack should do after the client digests a message.
#[derive(Debug)]
pub(crate) enum DhcpEvent {
    Nothing,
    Transmit(DhcpSend),
    /// A lease was confirmed: adopt the address, persist the record,
    /// warm the ARP cache for the router.
    Bound {
        lease: LeaseRecord,
        router: Ipv4Addr,
    },
}

/// The DHCP client FSM.
pub struct DhcpClient {
    state: DhcpState,
    xid: u32,
    assigned: Ipv4Addr,
    server: Ipv4Addr,
    t1: Option<TimerHandle>,
    t2: Option<TimerHandle>,
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DhcpClient {
    pub const fn new() -> Self {
        DhcpClient {
            state: DhcpState::Init,
            xid: 0,
            assigned: Ipv4Addr::UNSPECIFIED,
            server: Ipv4Addr::UNSPECIFIED,
            t1: None,
            t2: None,
        }
    }

    pub fn state(&self) -> DhcpState {
        self.state
    }

    /// Address usable for traffic?
    pub fn ready(&self) -> bool {
        matches!(
            self.state,
            DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding
        )
    }

    /// Kick off configuration. With a persisted lease we attempt an
    /// init-reboot for the old address; otherwise we discover from
    /// scratch.
    pub(crate) fn start(
        &mut self,
        mac: EthAddr,
        stored: Option<LeaseRecord>,
        rng: &mut XorShift32,
    ) -> DhcpSend {
        self.xid = rng.next_u32();
        match stored {
            Some(lease) => {
                self.assigned = lease.assigned;
                self.server = lease.server;
                self.state = DhcpState::Rebooting;
                log::debug!("dhcp: init-reboot requesting {}", lease.assigned);
                DhcpSend::broadcast(build_request(
                    self.xid,
                    mac,
                    Ipv4Addr::UNSPECIFIED,
                    Some(lease.assigned),
                    None,
                ))
            }
            None => {
                self.state = DhcpState::Selecting;
                log::debug!("dhcp: discovering");
                DhcpSend::broadcast(build_discover(self.xid, mac))
            }
        }
    }

    /// Digest a message that arrived on UDP port 68.
    pub(crate) fn handle_message<T: TimerService>(
        &mut self,
        mac: EthAddr,
        data: &[u8],
        timers: &mut T,
        rng: &mut XorShift32,
    ) -> DhcpEvent {
        let Ok(msg) = parse_bootp(data) else {
            return DhcpEvent::Nothing;
        };
        if msg.op != OP_REPLY || msg.xid != self.xid {
            return DhcpEvent::Nothing;
        }
        let Some(&[msg_type]) = find_option(msg.options, OPT_MESSAGE_TYPE) else {
            return DhcpEvent::Nothing;
        };

        match (msg_type, self.state) {
            (MSG_OFFER, DhcpState::Selecting) => {
                self.assigned = msg.yiaddr;
                self.server = option_addr(msg.options, OPT_SERVER_ID).unwrap_or(msg.siaddr);
                self.state = DhcpState::Requesting;
                log::debug!("dhcp: offered {} by {}", self.assigned, self.server);
                DhcpEvent::Transmit(DhcpSend::broadcast(build_request(
                    self.xid,
                    mac,
                    Ipv4Addr::UNSPECIFIED,
                    Some(self.assigned),
                    Some(self.server),
                )))
            }

            (
                MSG_ACK,
                DhcpState::Requesting
                | DhcpState::Rebooting
                | DhcpState::Renewing
                | DhcpState::Rebinding,
            ) => {
                if !msg.yiaddr.is_unspecified() {
                    self.assigned = msg.yiaddr;
                }
                if let Some(server) = option_addr(msg.options, OPT_SERVER_ID) {
                    self.server = server;
                }
                let router = option_addr(msg.options, OPT_ROUTER).unwrap_or(self.server);
                self.arm_renewal(msg.options, timers);
                self.state = DhcpState::Bound;
                log::info!("dhcp: bound to {} (router {})", self.assigned, router);
                DhcpEvent::Bound {
                    lease: LeaseRecord {
                        assigned: self.assigned,
                        server: self.server,
                    },
                    router,
                }
            }

            (
                MSG_NAK,
                DhcpState::Requesting
                | DhcpState::Rebooting
                | DhcpState::Renewing
                | DhcpState::Rebinding,
            ) => {
                log::warn!("dhcp: lease for {} refused, rediscovering", self.assigned);
                self.forget(timers);
                self.xid = rng.next_u32();
                self.state = DhcpState::Selecting;
                DhcpEvent::Transmit(DhcpSend::broadcast(build_discover(self.xid, mac)))
            }

            _ => DhcpEvent::Nothing,
        }
    }

    /// Periodic timer work: T1 unicast renewal, T2 broadcast rebind.
    pub(crate) fn handle_timers<T: TimerService>(
        &mut self,
        mac: EthAddr,
        timers: &mut T,
        rng: &mut XorShift32,
    ) -> Option<DhcpSend> {
        match self.state {
            DhcpState::Bound => {
                let t1 = self.t1?;
                if !timers.expired(t1) {
                    return None;
                }
                self.t1 = None;
                self.xid = rng.next_u32();
                self.state = DhcpState::Renewing;
                log::debug!("dhcp: T1 expired, renewing {} with {}", self.assigned, self.server);
                Some(DhcpSend {
                    src_ip: self.assigned,
                    dst_ip: self.server,
                    payload: build_request(self.xid, mac, self.assigned, None, None),
                })
            }
            DhcpState::Renewing => {
                let t2 = self.t2?;
                if !timers.expired(t2) {
                    return None;
                }
                self.t2 = None;
                self.xid = rng.next_u32();
                self.state = DhcpState::Rebinding;
                log::debug!("dhcp: T2 expired, rebinding {}", self.assigned);
                Some(DhcpSend::broadcast(build_request(
                    self.xid,
                    mac,
                    self.assigned,
                    None,
                    None,
                )))
            }
            _ => None,
        }
    }

    fn arm_renewal<T: TimerService>(&mut self, options: &[u8], timers: &mut T) {
        self.cancel_timers(timers);
        if let Some(t1) = option_u32(options, OPT_RENEWAL_T1) {
            self.t1 = timers.start(t1);
        }
        if let Some(t2) = option_u32(options, OPT_REBINDING_T2) {
            self.t2 = timers.start(t2);
        }
    }

    fn cancel_timers<T: TimerService>(&mut self, timers: &mut T) {
        if let Some(t) = self.t1.take() {
            timers.cancel(t);
        }
        if let Some(t) = self.t2.take() {
            timers.cancel(t);
        }
    }

    fn forget<T: TimerService>(&mut self, timers: &mut T) {
        self.cancel_timers(timers);
        self.assigned = Ipv4Addr::UNSPECIFIED;
        self.server = Ipv4Addr::UNSPECIFIED;
    }
}
