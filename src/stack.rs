//! The stack object: dispatch, transmit path, socket API and timers.
//!
//! [`NetStack`] owns every piece of protocol state and the three
//! injected host services. The host drives it from its main loop:
//! `packet_pump()` whenever it likes (and at least while blocked on a
//! socket call), `handle_timers()` about once a second.
//!
//! Blocking socket calls are poll loops: try the operation, and while
//! it would block, pump packets and try again. Re-entering the pump
//! from inside a "blocked" call is the whole concurrency model; there
//! are no threads to wake.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arp::{self, ArpCache, ArpResult};
use crate::device::LinkDriver;
use crate::dhcp::{DhcpClient, DhcpEvent, DhcpSend, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::ethernet::{EthAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETH_HLEN};
use crate::icmp;
use crate::ipv4::{build_ipv4_header, parse_ipv4, Ipv4Addr, Ipv4Proto, IPV4_HEADER_LEN};
use crate::rng::XorShift32;
use crate::socket::{
    SocketError, SocketHandle, SocketTable, StreamHandle, StreamState, MAX_STREAMS,
};
use crate::storage::LeaseStore;
use crate::tcp::{self, TcpContext};
use crate::timer::TimerService;
use crate::udp;

// ============================================================================
// Configuration and statistics
// ============================================================================

/// Station addressing. `ip` and `gateway` start unspecified and are
/// filled by DHCP or [`NetStack::configure`].
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub mac: EthAddr,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Stack-wide event counters.
#[derive(Debug, Default)]
pub struct NetStats {
    rx_frames: AtomicU64,
    rx_dropped: AtomicU64,
    tx_frames: AtomicU64,
    tx_dropped: AtomicU64,
    arp_replies: AtomicU64,
    icmp_replies: AtomicU64,
    udp_datagrams: AtomicU64,
    tcp_segments: AtomicU64,
}

/// Point-in-time copy of [`NetStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetStatsSnapshot {
    pub rx_frames: u64,
    pub rx_dropped: u64,
    pub tx_frames: u64,
    pub tx_dropped: u64,
    pub arp_replies: u64,
    pub icmp_replies: u64,
    pub udp_datagrams: u64,
    pub tcp_segments: u64,
}

impl NetStats {
    pub const fn new() -> Self {
        NetStats {
            rx_frames: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
            arp_replies: AtomicU64::new(0),
            icmp_replies: AtomicU64::new(0),
            udp_datagrams: AtomicU64::new(0),
            tcp_segments: AtomicU64::new(0),
        }
    }

    #[inline]
    fn inc_rx_frames(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_tx_frames(&self) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_arp_replies(&self) {
        self.arp_replies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_icmp_replies(&self) {
        self.icmp_replies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_udp_datagrams(&self) {
        self.udp_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn inc_tcp_segments(&self) {
        self.tcp_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetStatsSnapshot {
        NetStatsSnapshot {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            arp_replies: self.arp_replies.load(Ordering::Relaxed),
            icmp_replies: self.icmp_replies.load(Ordering::Relaxed),
            udp_datagrams: self.udp_datagrams.load(Ordering::Relaxed),
            tcp_segments: self.tcp_segments.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Transmit path
// ============================================================================

/// Pick the destination MAC for `dst_ip`: broadcast for the broadcast
/// address, a cached binding when we have one, otherwise the gateway's
/// cached binding.
fn resolve_next_hop(arp: &ArpCache, config: &NetConfig, dst_ip: Ipv4Addr) -> Option<EthAddr> {
    if dst_ip.is_broadcast() {
        return Some(EthAddr::BROADCAST);
    }
    arp.lookup(dst_ip).or_else(|| arp.lookup(config.gateway))
}

/// Wrap `segments` in an IPv4 header and hand the frame to the driver.
///
/// A resolution miss drops the packet and fires an ARP request for the
/// gateway so a later retry can succeed; a driver without buffer room
/// for the frame drops it too. Upper layers all retransmit.
#[allow(clippy::too_many_arguments)]
fn transmit_ipv4<D: LinkDriver>(
    driver: &mut D,
    arp: &ArpCache,
    config: &NetConfig,
    ident: &mut u16,
    stats: &NetStats,
    src_ip: Option<Ipv4Addr>,
    dst_ip: Ipv4Addr,
    next_hop: Option<EthAddr>,
    proto: Ipv4Proto,
    segments: &[&[u8]],
) {
    let Some(dst_mac) = next_hop.or_else(|| resolve_next_hop(arp, config, dst_ip)) else {
        log::debug!("ipv4: no next hop for {}, dropping", dst_ip);
        stats.inc_tx_dropped();
        if !config.gateway.is_unspecified() {
            let req = arp::build_arp_request(config.mac, config.ip, config.gateway);
            driver.send_frame(EthAddr::BROADCAST, config.mac, ETHERTYPE_ARP, &[&req]);
        }
        return;
    };
    let payload_len: usize = segments.iter().map(|s| s.len()).sum();
    if driver.free_buffer_space() < ETH_HLEN + IPV4_HEADER_LEN + payload_len {
        log::debug!("ipv4: driver buffers full, dropping {} bytes", payload_len);
        stats.inc_tx_dropped();
        return;
    }
    *ident = ident.wrapping_add(1);
    let header = build_ipv4_header(
        src_ip.unwrap_or(config.ip),
        dst_ip,
        proto,
        payload_len,
        *ident,
    );
    let mut segs: Vec<&[u8]> = Vec::with_capacity(1 + segments.len());
    segs.push(&header);
    segs.extend_from_slice(segments);
    driver.send_frame(dst_mac, config.mac, ETHERTYPE_IPV4, &segs);
    stats.inc_tx_frames();
}

// ============================================================================
// The stack
// ============================================================================

/// The polled network stack. Generic over the injected link driver,
/// timer service and lease store.
pub struct NetStack<D, T, S> {
    driver: D,
    timers: T,
    store: S,
    config: NetConfig,
    arp: ArpCache,
    dhcp: DhcpClient,
    sockets: SocketTable,
    rng: XorShift32,
    ident: u16,
    stats: NetStats,
}

impl<D: LinkDriver, T: TimerService, S: LeaseStore> NetStack<D, T, S> {
    /// `seed` feeds ISN/xid/ident generation; give it whatever entropy
    /// the platform has.
    pub fn new(driver: D, timers: T, store: S, mac: EthAddr, seed: u32) -> Self {
        NetStack {
            driver,
            timers,
            store,
            config: NetConfig {
                mac,
                ip: Ipv4Addr::UNSPECIFIED,
                gateway: Ipv4Addr::UNSPECIFIED,
            },
            arp: ArpCache::new(),
            dhcp: DhcpClient::new(),
            sockets: SocketTable::new(),
            rng: XorShift32::new(seed),
            ident: 0,
            stats: NetStats::new(),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn stats(&self) -> NetStatsSnapshot {
        self.stats.snapshot()
    }

    /// Static addressing, for hosts that skip DHCP.
    pub fn configure(&mut self, ip: Ipv4Addr, gateway: Ipv4Addr) {
        self.config.ip = ip;
        self.config.gateway = gateway;
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Drain every frame the driver has pending and dispatch each one.
    pub fn packet_pump(&mut self) {
        while self.driver.frames_pending() > 0 {
            let Some(frame) = self.driver.receive_frame() else {
                break;
            };
            self.process_frame(&frame);
        }
    }

    fn process_frame(&mut self, frame: &[u8]) {
        self.stats.inc_rx_frames();
        let Ok((eth, payload)) = crate::ethernet::parse_ethernet(frame) else {
            self.stats.inc_rx_dropped();
            return;
        };
        if eth.dst != self.config.mac && !eth.dst.is_broadcast() {
            self.stats.inc_rx_dropped();
            return;
        }
        match eth.ethertype {
            ETHERTYPE_ARP => self.process_arp(payload),
            ETHERTYPE_IPV4 => self.process_ipv4(eth.src, payload),
            _ => self.stats.inc_rx_dropped(),
        }
    }

    fn process_arp(&mut self, payload: &[u8]) {
        match arp::process_arp(
            payload,
            self.config.mac,
            self.config.ip,
            self.config.gateway,
            &mut self.arp,
        ) {
            Ok(ArpResult::Reply { dst, packet }) => {
                self.driver
                    .send_frame(dst, self.config.mac, ETHERTYPE_ARP, &[&packet]);
                self.stats.inc_arp_replies();
            }
            Ok(ArpResult::Handled) => {}
            Err(e) => {
                log::trace!("arp: dropped packet: {:?}", e);
                self.stats.inc_rx_dropped();
            }
        }
    }

    fn process_ipv4(&mut self, src_mac: EthAddr, payload: &[u8]) {
        let Ok((ip, body)) = parse_ipv4(payload) else {
            self.stats.inc_rx_dropped();
            return;
        };
        match Ipv4Proto::from_raw(ip.proto) {
            Some(Ipv4Proto::Icmp) => self.process_icmp(src_mac, ip.src, body),
            Some(Ipv4Proto::Udp) => self.process_udp(src_mac, ip.src, body),
            Some(Ipv4Proto::Tcp) => self.process_tcp(src_mac, ip.src, body),
            None => self.stats.inc_rx_dropped(),
        }
    }

    fn process_icmp(&mut self, src_mac: EthAddr, src_ip: Ipv4Addr, body: &[u8]) {
        let Some(reply) = icmp::build_echo_reply(body) else {
            self.stats.inc_rx_dropped();
            return;
        };
        self.stats.inc_icmp_replies();
        let NetStack {
            driver,
            arp,
            config,
            ident,
            stats,
            ..
        } = self;
        transmit_ipv4(
            driver,
            arp,
            config,
            ident,
            stats,
            None,
            src_ip,
            Some(src_mac),
            Ipv4Proto::Icmp,
            &[&reply],
        );
    }

    fn process_udp(&mut self, src_mac: EthAddr, src_ip: Ipv4Addr, body: &[u8]) {
        let Ok((hdr, payload)) = udp::parse_udp(body) else {
            self.stats.inc_rx_dropped();
            return;
        };
        if hdr.dst_port == DHCP_CLIENT_PORT {
            let event =
                self.dhcp
                    .handle_message(self.config.mac, payload, &mut self.timers, &mut self.rng);
            self.apply_dhcp_event(event);
            return;
        }
        match self
            .sockets
            .demux(Ipv4Proto::Udp, src_ip, hdr.src_port, hdr.dst_port)
        {
            Some(idx) => {
                self.sockets.streams[idx].remote_mac = src_mac;
                if self.sockets.udp_deliver(idx, payload) {
                    self.stats.inc_udp_datagrams();
                } else {
                    self.stats.inc_rx_dropped();
                }
            }
            None => {
                log::trace!("udp: no socket for port {}, dropping", hdr.dst_port);
                self.stats.inc_rx_dropped();
            }
        }
    }

    fn process_tcp(&mut self, src_mac: EthAddr, src_ip: Ipv4Addr, body: &[u8]) {
        let Ok((hdr, options, payload)) = tcp::parse_tcp_header(body) else {
            self.stats.inc_rx_dropped();
            return;
        };
        let Some(idx) = self
            .sockets
            .demux(Ipv4Proto::Tcp, src_ip, hdr.src_port, hdr.dst_port)
        else {
            // No RST here: unmatched segments vanish silently.
            log::trace!("tcp: no stream for port {}, dropping", hdr.dst_port);
            self.stats.inc_rx_dropped();
            return;
        };
        self.stats.inc_tcp_segments();
        let was_listening = self.sockets.streams[idx].state == StreamState::Listen;
        let parent = self.sockets.streams[idx].parent;
        let isn = self.rng.next_u32();

        let NetStack {
            driver,
            timers,
            sockets,
            arp,
            config,
            ident,
            stats,
            ..
        } = self;
        let local_ip = config.ip;
        let stream = &mut sockets.streams[idx];
        stream.remote_mac = src_mac;
        let mut emit = |seg: &[u8]| {
            transmit_ipv4(
                driver,
                arp,
                config,
                ident,
                stats,
                None,
                src_ip,
                Some(src_mac),
                Ipv4Proto::Tcp,
                &[seg],
            );
        };
        let mut ctx = TcpContext {
            local_ip,
            remote_ip: src_ip,
            local_port: hdr.dst_port,
            emit: &mut emit,
        };
        tcp::process_segment(stream, &mut ctx, &hdr, options, payload, isn, timers);

        // The SYN consumed the listener; stand up a fresh one while a
        // slot is free so the port keeps accepting.
        if was_listening && self.sockets.streams[idx].state != StreamState::Listen {
            self.sockets.provision_listener(parent);
        }
    }

    fn apply_dhcp_event(&mut self, event: DhcpEvent) {
        match event {
            DhcpEvent::Nothing => {}
            DhcpEvent::Transmit(send) => self.send_dhcp(send),
            DhcpEvent::Bound { lease, router } => {
                self.config.ip = lease.assigned;
                self.config.gateway = router;
                self.store.store(&lease);
                // Warm the cache so the first off-link packet has a
                // next hop.
                let req =
                    arp::build_arp_request(self.config.mac, self.config.ip, self.config.gateway);
                self.driver
                    .send_frame(EthAddr::BROADCAST, self.config.mac, ETHERTYPE_ARP, &[&req]);
            }
        }
    }

    fn send_dhcp(&mut self, send: DhcpSend) {
        let datagram = udp::build_udp_datagram(
            send.src_ip,
            send.dst_ip,
            DHCP_CLIENT_PORT,
            DHCP_SERVER_PORT,
            &send.payload,
        );
        let NetStack {
            driver,
            arp,
            config,
            ident,
            stats,
            ..
        } = self;
        transmit_ipv4(
            driver,
            arp,
            config,
            ident,
            stats,
            Some(send.src_ip),
            send.dst_ip,
            None,
            Ipv4Proto::Udp,
            &[&datagram],
        );
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Periodic work; call roughly once a second.
    pub fn handle_timers(&mut self) {
        for idx in 0..MAX_STREAMS {
            let stream = &self.sockets.streams[idx];
            if !stream.in_use
                || matches!(
                    stream.state,
                    StreamState::UdpMode | StreamState::Listen | StreamState::Closed
                )
            {
                continue;
            }
            self.with_tcp_ctx(idx, |stream, ctx, timers| {
                tcp::on_timer_tick(stream, ctx, timers);
            });
        }

        if let Some(send) = self
            .dhcp
            .handle_timers(self.config.mac, &mut self.timers, &mut self.rng)
        {
            self.send_dhcp(send);
        }
    }

    // ------------------------------------------------------------------
    // DHCP and ARP surface
    // ------------------------------------------------------------------

    /// Begin address configuration, trying a persisted lease first.
    pub fn dhcp_start(&mut self) {
        let stored = self.store.load();
        let send = self.dhcp.start(self.config.mac, stored, &mut self.rng);
        self.send_dhcp(send);
    }

    /// Is the DHCP-assigned address usable?
    pub fn dhcp_ready(&self) -> bool {
        self.dhcp.ready()
    }

    /// Block (pumping packets) until DHCP has an address.
    pub fn dhcp_wait_ready(&mut self) {
        while !self.dhcp.ready() {
            self.packet_pump();
        }
    }

    /// Broadcast a gratuitous ARP for our address.
    pub fn announce_address(&mut self) {
        if self.config.ip.is_unspecified() {
            return;
        }
        let packet = arp::build_arp_announcement(self.config.mac, self.config.ip);
        self.driver
            .send_frame(EthAddr::BROADCAST, self.config.mac, ETHERTYPE_ARP, &[&packet]);
    }

    // ------------------------------------------------------------------
    // Socket API
    // ------------------------------------------------------------------

    pub fn socket(&mut self, proto: Ipv4Proto) -> Result<SocketHandle, SocketError> {
        self.sockets.open(proto)
    }

    /// Associate a UDP socket with a chosen peer and return a stream
    /// ready for [`Self::send`]; replies from that peer land on it.
    /// The first outbound datagram may be dropped while ARP resolves
    /// the next hop.
    pub fn connect(
        &mut self,
        sock: SocketHandle,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Result<StreamHandle, SocketError> {
        self.sockets.connect(sock, remote_ip, remote_port)
    }

    pub fn bind_listen(&mut self, sock: SocketHandle, port: u16) -> Result<(), SocketError> {
        self.sockets.bind_listen(sock, port)
    }

    /// Release a socket and everything under it.
    pub fn close_socket(&mut self, sock: SocketHandle) -> Result<(), SocketError> {
        self.sockets.close_socket(sock)
    }

    /// Next pending conversation, or `WouldBlock`.
    pub fn try_accept(&mut self, sock: SocketHandle) -> Result<StreamHandle, SocketError> {
        self.sockets.try_accept(sock)
    }

    /// Block (pumping packets) until a conversation arrives.
    pub fn accept(&mut self, sock: SocketHandle) -> Result<StreamHandle, SocketError> {
        loop {
            match self.sockets.try_accept(sock) {
                Err(SocketError::WouldBlock) => self.packet_pump(),
                other => return other,
            }
        }
    }

    /// Read without blocking. UDP yields exactly one datagram; TCP
    /// yields whatever is buffered, `Ok(0)` once the peer has finished
    /// sending and the buffer is drained.
    pub fn try_recv(
        &mut self,
        stream: StreamHandle,
        buf: &mut [u8],
    ) -> Result<usize, SocketError> {
        let state = self.sockets.stream(stream)?.state;
        match state {
            StreamState::UdpMode => self
                .sockets
                .udp_take(stream.0, buf)
                .ok_or(SocketError::WouldBlock),
            _ => {
                let s = self.sockets.stream_mut(stream)?;
                if !s.rx.is_empty() {
                    Ok(s.rx.read(buf))
                } else if s.state.can_receive() {
                    Err(SocketError::WouldBlock)
                } else {
                    Ok(0)
                }
            }
        }
    }

    /// Blocking [`Self::try_recv`].
    pub fn recv(&mut self, stream: StreamHandle, buf: &mut [u8]) -> Result<usize, SocketError> {
        loop {
            match self.try_recv(stream, buf) {
                Err(SocketError::WouldBlock) => self.packet_pump(),
                other => return other,
            }
        }
    }

    /// Queue data on a stream. UDP transmits one datagram immediately
    /// to the recorded peer; TCP queues into the TX ring and sends
    /// what the peer's window allows, returning the bytes taken.
    pub fn send(&mut self, stream: StreamHandle, data: &[u8]) -> Result<usize, SocketError> {
        let (state, parent) = {
            let s = self.sockets.stream(stream)?;
            (s.state, s.parent)
        };
        match state {
            StreamState::UdpMode => {
                let (remote_ip, remote_port, remote_mac) = {
                    let s = self.sockets.stream(stream)?;
                    (s.remote_ip, s.remote_port, s.remote_mac)
                };
                let local_port = self.sockets.sockets[parent].local_port;
                let datagram = udp::build_udp_datagram(
                    self.config.ip,
                    remote_ip,
                    local_port,
                    remote_port,
                    data,
                );
                let NetStack {
                    driver,
                    arp,
                    config,
                    ident,
                    stats,
                    ..
                } = self;
                transmit_ipv4(
                    driver,
                    arp,
                    config,
                    ident,
                    stats,
                    None,
                    remote_ip,
                    (!remote_mac.is_zero()).then_some(remote_mac),
                    Ipv4Proto::Udp,
                    &[&datagram],
                );
                Ok(data.len())
            }
            s if s.can_send() => {
                let taken = self.sockets.stream_mut(stream)?.tx.write(data);
                self.tcp_push(stream.0);
                Ok(taken)
            }
            _ => Err(SocketError::NotConnected),
        }
    }

    /// Begin an orderly shutdown of a stream. UDP associations are
    /// dropped on the spot; TCP sends its FIN and finishes the close
    /// handshake in the background. Closing an already-released
    /// stream is a no-op.
    pub fn close_stream(&mut self, stream: StreamHandle) -> Result<(), SocketError> {
        let Ok(s) = self.sockets.stream(stream) else {
            return Ok(());
        };
        let state = s.state;
        if state == StreamState::UdpMode {
            self.sockets.stream_mut(stream)?.release();
            return Ok(());
        }
        self.with_tcp_ctx(stream.0, |stream, ctx, timers| {
            tcp::close(stream, ctx, timers);
        });
        Ok(())
    }

    /// Push queued TX data for a TCP stream.
    fn tcp_push(&mut self, idx: usize) {
        self.with_tcp_ctx(idx, |stream, ctx, timers| {
            tcp::send_pending(stream, ctx, timers);
        });
    }

    /// Run `f` with a transmit context wired up for stream `idx`.
    fn with_tcp_ctx(
        &mut self,
        idx: usize,
        f: impl FnOnce(&mut crate::socket::Stream, &mut TcpContext<'_>, &mut T),
    ) {
        let remote_ip = self.sockets.streams[idx].remote_ip;
        let remote_mac = self.sockets.streams[idx].remote_mac;
        let local_port = self.sockets.sockets[self.sockets.streams[idx].parent].local_port;
        let NetStack {
            driver,
            timers,
            sockets,
            arp,
            config,
            ident,
            stats,
            ..
        } = self;
        let local_ip = config.ip;
        let stream = &mut sockets.streams[idx];
        let next_hop = (!remote_mac.is_zero()).then_some(remote_mac);
        let mut emit = |seg: &[u8]| {
            transmit_ipv4(
                driver,
                arp,
                config,
                ident,
                stats,
                None,
                remote_ip,
                next_hop,
                Ipv4Proto::Tcp,
                &[seg],
            );
        };
        let mut ctx = TcpContext {
            local_ip,
            remote_ip,
            local_port,
            emit: &mut emit,
        };
        f(stream, &mut ctx, timers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;
    use crate::dhcp::{find_option, parse_bootp, BOOTP_HEADER_LEN};
    use crate::ethernet::build_ethernet_frame;
    use crate::ipv4::Ipv4Header;
    use crate::storage::LeaseRecord;
    use crate::tcp::{
        build_tcp_segment, find_tcp_option, parse_tcp_header, TcpHeader, TCP_FLAG_ACK,
        TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_OPT_MSS,
    };
    use crate::testutil::{FakeTimers, MemStore, MockDriver};
    use crate::udp::{build_udp_datagram, parse_udp};

    const OUR_MAC: EthAddr = EthAddr([0x02, 0, 0, 0, 0, 0x09]);
    const PEER_MAC: EthAddr = EthAddr([0x02, 0, 0, 0, 0, 0x50]);
    const GW_MAC: EthAddr = EthAddr([0x02, 0, 0, 0, 0, 0x01]);
    const OUR_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 9);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 50);
    const GW_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
    const SERVER_PORT: u16 = 80;
    const CLIENT_PORT: u16 = 4000;

    type TestStack = NetStack<MockDriver, FakeTimers, MemStore>;

    fn make_stack() -> (TestStack, MockDriver, FakeTimers, MemStore) {
        let driver = MockDriver::new();
        let timers = FakeTimers::new();
        let store = MemStore::new();
        let stack = NetStack::new(
            driver.clone(),
            timers.clone(),
            store.clone(),
            OUR_MAC,
            0xC0FF_EE11,
        );
        (stack, driver, timers, store)
    }

    fn configured_stack() -> (TestStack, MockDriver, FakeTimers) {
        let (mut stack, driver, timers, _) = make_stack();
        stack.configure(OUR_IP, GW_IP);
        (stack, driver, timers)
    }

    /// Wrap `payload` in IPv4 + Ethernet addressed to us.
    fn ip_frame(src_mac: EthAddr, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, proto: Ipv4Proto, payload: &[u8]) -> Vec<u8> {
        let hdr = build_ipv4_header(src_ip, dst_ip, proto, payload.len(), 99);
        let mut packet = hdr.to_vec();
        packet.extend_from_slice(payload);
        let dst_mac = if dst_ip.is_broadcast() { EthAddr::BROADCAST } else { OUR_MAC };
        build_ethernet_frame(dst_mac, src_mac, ETHERTYPE_IPV4, &packet)
    }

    /// A TCP segment from the test peer's client port to our server.
    fn tcp_from_peer(seq: u32, ack: u32, flags: u8, options: &[u8], payload: &[u8]) -> Vec<u8> {
        let seg = build_tcp_segment(
            PEER_IP, OUR_IP, CLIENT_PORT, SERVER_PORT, seq, ack, flags, 1000, options, payload,
        );
        ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Tcp, &seg)
    }

    /// Unpack the next transmitted frame as a TCP segment.
    fn sent_tcp(driver: &MockDriver) -> (Ipv4Header, TcpHeader, Vec<u8>, Vec<u8>) {
        let frame = driver.take_sent().expect("a frame should have been sent");
        assert_eq!(frame.ethertype, ETHERTYPE_IPV4);
        let (ip, body) = parse_ipv4(&frame.payload).unwrap();
        let (hdr, options, payload) = parse_tcp_header(body).unwrap();
        (ip, hdr, options.to_vec(), payload.to_vec())
    }

    /// Run the three-way handshake; returns (stream handle, server
    /// ISN, next peer seq).
    fn handshake(stack: &mut TestStack, driver: &MockDriver, sock: SocketHandle) -> (StreamHandle, u32, u32) {
        let client_isn = 5000;
        driver.inject(tcp_from_peer(client_isn, 0, TCP_FLAG_SYN, &[3, 3, 1, 0], &[]));
        stack.packet_pump();

        let (ip, syn_ack, options, _) = sent_tcp(driver);
        assert_eq!(ip.dst, PEER_IP);
        assert_eq!(syn_ack.flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(syn_ack.ack, client_isn + 1);
        assert_eq!(
            find_tcp_option(&options, TCP_OPT_MSS),
            Some(&[0x02, 0x18][..]),
            "SYN+ACK must advertise MSS 536"
        );
        let server_isn = syn_ack.seq;

        driver.inject(tcp_from_peer(client_isn + 1, server_isn + 1, TCP_FLAG_ACK, &[], &[]));
        stack.packet_pump();
        let stream = stack.try_accept(sock).expect("connection should be accepted");
        (stream, server_isn, client_isn + 1)
    }

    // ------------------------------------------------------------------
    // ARP / ICMP / filtering
    // ------------------------------------------------------------------

    #[test]
    fn answers_arp_requests_for_our_address() {
        let (mut stack, driver, _) = configured_stack();
        let req = crate::arp::serialize_arp(&crate::arp::ArpPacket {
            op: crate::arp::ArpOp::Request,
            sender_mac: PEER_MAC,
            sender_ip: PEER_IP,
            target_mac: EthAddr::ZERO,
            target_ip: OUR_IP,
        });
        driver.inject(build_ethernet_frame(EthAddr::BROADCAST, PEER_MAC, ETHERTYPE_ARP, &req));
        stack.packet_pump();

        let frame = driver.take_sent().unwrap();
        assert_eq!(frame.ethertype, ETHERTYPE_ARP);
        assert_eq!(frame.dst, PEER_MAC);
        let reply = crate::arp::parse_arp(&frame.payload).unwrap();
        assert_eq!(reply.op, crate::arp::ArpOp::Reply);
        assert_eq!(reply.sender_ip, OUR_IP);
        assert_eq!(reply.sender_mac, OUR_MAC);
        assert_eq!(stack.stats().arp_replies, 1);
    }

    #[test]
    fn echoes_icmp_requests() {
        let (mut stack, driver, _) = configured_stack();
        let mut req = vec![8u8, 0, 0, 0, 0x12, 0x34, 0, 7];
        req.extend_from_slice(b"payload!");
        let sum = checksum::compute(&req);
        req[2..4].copy_from_slice(&sum.to_be_bytes());
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Icmp, &req));
        stack.packet_pump();

        let frame = driver.take_sent().unwrap();
        assert_eq!(frame.dst, PEER_MAC);
        let (ip, body) = parse_ipv4(&frame.payload).unwrap();
        assert_eq!(ip.src, OUR_IP);
        assert_eq!(ip.dst, PEER_IP);
        let (hdr, payload) = crate::icmp::parse_icmp(body).unwrap();
        assert_eq!(hdr.icmp_type, 0);
        assert_eq!(hdr.ident, 0x1234);
        assert_eq!(hdr.seq, 7);
        assert_eq!(payload, b"payload!");
    }

    #[test]
    fn drops_frames_for_other_stations() {
        let (mut stack, driver, _) = configured_stack();
        let other = EthAddr([0x02, 0, 0, 0, 0, 0x77]);
        driver.inject(build_ethernet_frame(other, PEER_MAC, ETHERTYPE_IPV4, &[0u8; 40]));
        stack.packet_pump();
        assert_eq!(driver.sent_count(), 0);
        assert_eq!(stack.stats().rx_dropped, 1);
    }

    // ------------------------------------------------------------------
    // UDP
    // ------------------------------------------------------------------

    #[test]
    fn udp_echo_service() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Udp).unwrap();
        stack.bind_listen(sock, 7).unwrap();

        let dgram = build_udp_datagram(PEER_IP, OUR_IP, CLIENT_PORT, 7, b"marco");
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Udp, &dgram));
        stack.packet_pump();

        let stream = stack.try_accept(sock).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"marco");
        // One datagram per recv.
        assert_eq!(stack.try_recv(stream, &mut buf), Err(SocketError::WouldBlock));

        assert_eq!(stack.send(stream, b"polo"), Ok(4));
        let frame = driver.take_sent().unwrap();
        // Reply goes straight to the MAC the peer used.
        assert_eq!(frame.dst, PEER_MAC);
        let (ip, body) = parse_ipv4(&frame.payload).unwrap();
        assert_eq!(ip.dst, PEER_IP);
        let (hdr, payload) = parse_udp(body).unwrap();
        assert_eq!(hdr.src_port, 7);
        assert_eq!(hdr.dst_port, CLIENT_PORT);
        assert_eq!(payload, b"polo");
        assert_eq!(crate::udp::compute_udp_checksum(OUR_IP, PEER_IP, body), 0);
    }

    #[test]
    fn blocking_recv_pumps_the_network() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Udp).unwrap();
        stack.bind_listen(sock, 7).unwrap();
        let dgram = build_udp_datagram(PEER_IP, OUR_IP, CLIENT_PORT, 7, b"hi");
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Udp, &dgram));

        // The datagram is still in the driver; accept and recv must
        // pump it through.
        let stream = stack.accept(sock).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stack.recv(stream, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"hi");
    }

    #[test]
    fn udp_connect_initiates_a_flow() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Udp).unwrap();
        let stream = stack.connect(sock, PEER_IP, 9000).unwrap();

        // Teach the cache the peer's binding so the send resolves.
        let reply = crate::arp::serialize_arp(&crate::arp::ArpPacket {
            op: crate::arp::ArpOp::Reply,
            sender_mac: PEER_MAC,
            sender_ip: PEER_IP,
            target_mac: OUR_MAC,
            target_ip: OUR_IP,
        });
        driver.inject(build_ethernet_frame(OUR_MAC, PEER_MAC, ETHERTYPE_ARP, &reply));
        stack.packet_pump();

        assert_eq!(stack.send(stream, b"ping"), Ok(4));
        let frame = driver.take_sent().unwrap();
        assert_eq!(frame.dst, PEER_MAC);
        let (ip, body) = parse_ipv4(&frame.payload).unwrap();
        assert_eq!(ip.dst, PEER_IP);
        let (hdr, payload) = parse_udp(body).unwrap();
        assert_eq!(hdr.dst_port, 9000);
        assert_ne!(hdr.src_port, 0, "an ephemeral source port is assigned");
        assert_eq!(payload, b"ping");

        // The peer's answer lands on the connected stream.
        let answer = build_udp_datagram(PEER_IP, OUR_IP, 9000, hdr.src_port, b"pong");
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Udp, &answer));
        stack.packet_pump();
        let mut buf = [0u8; 8];
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"pong");
    }

    // ------------------------------------------------------------------
    // Driver contract
    // ------------------------------------------------------------------

    #[test]
    fn pump_drains_every_pending_frame() {
        let (mut stack, driver, _) = configured_stack();
        for seq in 0..2u16 {
            let mut req = vec![8u8, 0, 0, 0, 0, 1, 0, 0];
            req[6..8].copy_from_slice(&seq.to_be_bytes());
            let sum = checksum::compute(&req);
            req[2..4].copy_from_slice(&sum.to_be_bytes());
            driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Icmp, &req));
        }
        stack.packet_pump();
        assert_eq!(driver.sent_count(), 2);
    }

    #[test]
    fn transmit_respects_driver_buffer_budget() {
        let (mut stack, driver, _) = configured_stack();
        let mut req = vec![8u8, 0, 0, 0, 0, 1, 0, 1];
        let sum = checksum::compute(&req);
        req[2..4].copy_from_slice(&sum.to_be_bytes());

        driver.set_free_space(10);
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Icmp, &req));
        stack.packet_pump();
        assert_eq!(driver.sent_count(), 0);
        assert_eq!(stack.stats().tx_dropped, 1);

        // With room again the same request is answered.
        driver.set_free_space(usize::MAX);
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Icmp, &req));
        stack.packet_pump();
        assert_eq!(driver.sent_count(), 1);
    }

    // ------------------------------------------------------------------
    // TCP
    // ------------------------------------------------------------------

    #[test]
    fn tcp_connect_exchange_close() {
        let (mut stack, driver, timers) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (stream, server_isn, peer_seq) = handshake(&mut stack, &driver, sock);

        // Peer sends "ping"; we ACK it and the app reads it.
        driver.inject(tcp_from_peer(
            peer_seq,
            server_isn + 1,
            TCP_FLAG_ACK | TCP_FLAG_PSH,
            &[],
            b"ping",
        ));
        stack.packet_pump();
        let (_, ack, _, _) = sent_tcp(&driver);
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.ack, peer_seq + 4);
        assert_eq!(ack.seq, server_isn + 1);
        let mut buf = [0u8; 16];
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"ping");

        // App replies "pong".
        assert_eq!(stack.send(stream, b"pong"), Ok(4));
        let (_, data, _, payload) = sent_tcp(&driver);
        assert_eq!(payload, b"pong");
        assert_eq!(data.seq, server_isn + 1);
        assert_eq!(data.flags, TCP_FLAG_ACK | TCP_FLAG_PSH);
        assert_eq!(timers.active(), 1, "retransmit timer should be running");

        // Peer acknowledges.
        driver.inject(tcp_from_peer(peer_seq + 4, server_isn + 5, TCP_FLAG_ACK, &[], &[]));
        stack.packet_pump();

        // Active close: our FIN at the current send point.
        stack.close_stream(stream).unwrap();
        let (_, fin, _, _) = sent_tcp(&driver);
        assert_eq!(fin.flags, TCP_FLAG_FIN | TCP_FLAG_ACK);
        assert_eq!(fin.seq, server_isn + 5);

        // Peer ACKs our FIN, then sends its own.
        driver.inject(tcp_from_peer(peer_seq + 4, server_isn + 6, TCP_FLAG_ACK, &[], &[]));
        stack.packet_pump();
        driver.inject(tcp_from_peer(
            peer_seq + 4,
            server_isn + 6,
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            &[],
            &[],
        ));
        stack.packet_pump();
        let (_, last_ack, _, _) = sent_tcp(&driver);
        assert_eq!(last_ack.flags, TCP_FLAG_ACK);
        assert_eq!(last_ack.ack, peer_seq + 5);

        // TIME_WAIT holds the slot for ten seconds, then releases it.
        stack.handle_timers();
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(0), "EOF while in TIME_WAIT");
        timers.tick(crate::tcp::TIME_WAIT_SECS);
        stack.handle_timers();
        assert_eq!(stack.try_recv(stream, &mut buf), Err(SocketError::InvalidStream));
    }

    #[test]
    fn tcp_out_of_order_payload_dropped_unacked() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (stream, server_isn, peer_seq) = handshake(&mut stack, &driver, sock);

        // A segment from the future: not contiguous with rx.head.
        driver.inject(tcp_from_peer(
            peer_seq + 100,
            server_isn + 1,
            TCP_FLAG_ACK | TCP_FLAG_PSH,
            &[],
            b"late",
        ));
        stack.packet_pump();
        assert_eq!(driver.sent_count(), 0, "no ACK for out-of-order data");
        let mut buf = [0u8; 8];
        assert_eq!(stack.try_recv(stream, &mut buf), Err(SocketError::WouldBlock));

        // The in-order segment is accepted as usual.
        driver.inject(tcp_from_peer(peer_seq, server_isn + 1, TCP_FLAG_ACK, &[], b"ok"));
        stack.packet_pump();
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(2));
    }

    #[test]
    fn tcp_rst_releases_stream() {
        let (mut stack, driver, timers) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (stream, server_isn, peer_seq) = handshake(&mut stack, &driver, sock);

        driver.inject(tcp_from_peer(peer_seq, server_isn + 1, TCP_FLAG_RST, &[], &[]));
        stack.packet_pump();
        let mut buf = [0u8; 8];
        assert_eq!(stack.try_recv(stream, &mut buf), Err(SocketError::InvalidStream));
        assert_eq!(stack.send(stream, b"x"), Err(SocketError::InvalidStream));
        assert_eq!(timers.active(), 0);
    }

    #[test]
    fn tcp_retransmits_unacked_data() {
        let (mut stack, driver, timers) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (stream, server_isn, _) = handshake(&mut stack, &driver, sock);

        assert_eq!(stack.send(stream, b"lost"), Ok(4));
        let (_, first, _, payload) = sent_tcp(&driver);
        assert_eq!(payload, b"lost");

        // No ACK arrives; the 5s timer fires and we rewind.
        timers.tick(crate::tcp::RETRANSMIT_SECS);
        stack.handle_timers();
        let (_, again, _, payload) = sent_tcp(&driver);
        assert_eq!(payload, b"lost");
        assert_eq!(again.seq, first.seq);
        assert_eq!(again.seq, server_isn + 1);
        // And the timer is armed again for the retry.
        assert_eq!(timers.active(), 1);
    }

    #[test]
    fn tcp_accepts_residual_data_after_local_close() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (stream, server_isn, peer_seq) = handshake(&mut stack, &driver, sock);

        // We close first; the peer still has data in flight.
        stack.close_stream(stream).unwrap();
        let (_, fin, _, _) = sent_tcp(&driver);
        assert_eq!(fin.flags, TCP_FLAG_FIN | TCP_FLAG_ACK);
        driver.inject(tcp_from_peer(peer_seq, server_isn + 2, TCP_FLAG_ACK, &[], &[]));
        stack.packet_pump();

        // The late payload is still ACKed and readable in FIN-WAIT.
        driver.inject(tcp_from_peer(
            peer_seq,
            server_isn + 2,
            TCP_FLAG_ACK | TCP_FLAG_PSH,
            &[],
            b"tail",
        ));
        stack.packet_pump();
        let (_, ack, _, _) = sent_tcp(&driver);
        assert_eq!(ack.flags, TCP_FLAG_ACK);
        assert_eq!(ack.ack, peer_seq + 4);
        let mut buf = [0u8; 8];
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"tail");
    }

    #[test]
    fn tcp_out_of_order_fin_ignored() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (stream, server_isn, peer_seq) = handshake(&mut stack, &driver, sock);

        // A FIN ahead of data still in flight must not close anything.
        driver.inject(tcp_from_peer(
            peer_seq + 4,
            server_isn + 1,
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            &[],
            &[],
        ));
        stack.packet_pump();
        assert_eq!(driver.sent_count(), 0, "early FIN must not be ACKed");

        // The retransmitted in-order data is still accepted,
        let mut buf = [0u8; 8];
        driver.inject(tcp_from_peer(peer_seq, server_isn + 1, TCP_FLAG_ACK, &[], b"data"));
        stack.packet_pump();
        let (_, ack, _, _) = sent_tcp(&driver);
        assert_eq!(ack.ack, peer_seq + 4);
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"data");

        // and the FIN counts once it is next in sequence.
        driver.inject(tcp_from_peer(
            peer_seq + 4,
            server_isn + 1,
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            &[],
            &[],
        ));
        stack.packet_pump();
        let (_, ack, _, _) = sent_tcp(&driver);
        assert_eq!(ack.ack, peer_seq + 5);
        assert_eq!(stack.try_recv(stream, &mut buf), Ok(0), "EOF after the peer's FIN");
    }

    #[test]
    fn close_stream_is_idempotent() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (stream, _, _) = handshake(&mut stack, &driver, sock);

        assert_eq!(stack.close_stream(stream), Ok(()));
        assert_eq!(stack.close_stream(stream), Ok(()));

        let udp = stack.socket(Ipv4Proto::Udp).unwrap();
        let flow = stack.connect(udp, PEER_IP, 9000).unwrap();
        assert_eq!(stack.close_stream(flow), Ok(()));
        // The UDP slot is released outright; closing again is a no-op.
        assert_eq!(stack.close_stream(flow), Ok(()));
        assert_eq!(stack.close_socket(udp), Ok(()));
        assert_eq!(stack.close_socket(udp), Ok(()));
    }

    #[test]
    fn tcp_unmatched_syn_dropped_silently() {
        let (mut stack, driver, _) = configured_stack();
        driver.inject(tcp_from_peer(1000, 0, TCP_FLAG_SYN, &[], &[]));
        stack.packet_pump();
        assert_eq!(driver.sent_count(), 0);
        assert_eq!(stack.stats().rx_dropped, 1);
    }

    #[test]
    fn tcp_second_connection_uses_fresh_listener() {
        let (mut stack, driver, _) = configured_stack();
        let sock = stack.socket(Ipv4Proto::Tcp).unwrap();
        stack.bind_listen(sock, SERVER_PORT).unwrap();
        let (first, _, _) = handshake(&mut stack, &driver, sock);

        // A second client (different source port) can connect while
        // the first stream is still open.
        let seg = build_tcp_segment(
            PEER_IP, OUR_IP, CLIENT_PORT + 1, SERVER_PORT, 9000, 0, TCP_FLAG_SYN, 1000, &[], &[],
        );
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Tcp, &seg));
        stack.packet_pump();
        let (_, syn_ack, _, _) = sent_tcp(&driver);
        assert_eq!(syn_ack.flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(syn_ack.ack, 9001);

        let seg = build_tcp_segment(
            PEER_IP, OUR_IP, CLIENT_PORT + 1, SERVER_PORT, 9001, syn_ack.seq + 1, TCP_FLAG_ACK,
            1000, &[], &[],
        );
        driver.inject(ip_frame(PEER_MAC, PEER_IP, OUR_IP, Ipv4Proto::Tcp, &seg));
        stack.packet_pump();
        let second = stack.try_accept(sock).unwrap();
        assert_ne!(first, second);
    }

    // ------------------------------------------------------------------
    // DHCP
    // ------------------------------------------------------------------

    const DHCP_SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
    const OFFERED_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 42);
    const ROUTER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 254);

    fn bootp_reply(xid: u32, msg_type: u8, yiaddr: Ipv4Addr, extra: &[(u8, &[u8])]) -> Vec<u8> {
        let mut buf = vec![0u8; BOOTP_HEADER_LEN];
        buf[0] = 2; // reply
        buf[4..8].copy_from_slice(&xid.to_be_bytes());
        buf[16..20].copy_from_slice(&yiaddr.0);
        buf.extend_from_slice(&[0x63, 0x82, 0x53, 0x63]);
        buf.push(53);
        buf.push(1);
        buf.push(msg_type);
        for (code, value) in extra {
            buf.push(*code);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        }
        buf.push(0xFF);
        buf
    }

    /// Unpack a transmitted frame as a DHCP message.
    fn sent_dhcp(driver: &MockDriver) -> (Ipv4Header, u32, Vec<u8>) {
        let frame = driver.take_sent().unwrap();
        assert_eq!(frame.ethertype, ETHERTYPE_IPV4);
        let (ip, body) = parse_ipv4(&frame.payload).unwrap();
        let (udp_hdr, payload) = parse_udp(body).unwrap();
        assert_eq!(udp_hdr.src_port, DHCP_CLIENT_PORT);
        assert_eq!(udp_hdr.dst_port, DHCP_SERVER_PORT);
        let msg = parse_bootp(payload).unwrap();
        (ip, msg.xid, payload.to_vec())
    }

    fn inject_dhcp(driver: &MockDriver, payload: &[u8]) {
        let dgram = build_udp_datagram(
            DHCP_SERVER_IP,
            Ipv4Addr::BROADCAST,
            DHCP_SERVER_PORT,
            DHCP_CLIENT_PORT,
            payload,
        );
        driver.inject(ip_frame(
            GW_MAC,
            DHCP_SERVER_IP,
            Ipv4Addr::BROADCAST,
            Ipv4Proto::Udp,
            &dgram,
        ));
    }

    #[test]
    fn dhcp_binds_and_persists_lease() {
        let (mut stack, driver, _, store) = make_stack();
        stack.dhcp_start();

        // Discover from 0.0.0.0 to the broadcast address.
        let (ip, xid, payload) = sent_dhcp(&driver);
        assert_eq!(ip.src, Ipv4Addr::UNSPECIFIED);
        assert_eq!(ip.dst, Ipv4Addr::BROADCAST);
        let opts = &payload[BOOTP_HEADER_LEN + 4..];
        assert_eq!(find_option(opts, 53), Some(&[1][..]));

        inject_dhcp(&driver, &bootp_reply(xid, 2, OFFERED_IP, &[(54, &DHCP_SERVER_IP.0)]));
        stack.packet_pump();

        // Request echoes the offer.
        let (_, req_xid, payload) = sent_dhcp(&driver);
        assert_eq!(req_xid, xid);
        let opts = &payload[BOOTP_HEADER_LEN + 4..];
        assert_eq!(find_option(opts, 53), Some(&[3][..]));
        assert_eq!(find_option(opts, 50), Some(&OFFERED_IP.0[..]));
        assert_eq!(find_option(opts, 54), Some(&DHCP_SERVER_IP.0[..]));

        inject_dhcp(
            &driver,
            &bootp_reply(
                xid,
                5,
                OFFERED_IP,
                &[(54, &DHCP_SERVER_IP.0), (3, &ROUTER_IP.0)],
            ),
        );
        stack.packet_pump();

        assert!(stack.dhcp_ready());
        assert_eq!(stack.config().ip, OFFERED_IP);
        assert_eq!(stack.config().gateway, ROUTER_IP);
        assert_eq!(
            store.record(),
            Some(LeaseRecord {
                assigned: OFFERED_IP,
                server: DHCP_SERVER_IP,
            })
        );

        // Binding fires an ARP request to warm the gateway entry.
        let frame = driver.take_sent().unwrap();
        assert_eq!(frame.ethertype, ETHERTYPE_ARP);
        assert_eq!(frame.dst, EthAddr::BROADCAST);
        let req = crate::arp::parse_arp(&frame.payload).unwrap();
        assert_eq!(req.target_ip, ROUTER_IP);
    }

    #[test]
    fn dhcp_reboots_from_stored_lease() {
        let driver = MockDriver::new();
        let timers = FakeTimers::new();
        let store = MemStore::with_record(LeaseRecord {
            assigned: OFFERED_IP,
            server: DHCP_SERVER_IP,
        });
        let mut stack = NetStack::new(
            driver.clone(),
            timers.clone(),
            store.clone(),
            OUR_MAC,
            0xBEEF,
        );
        stack.dhcp_start();

        // Straight to a Request for the remembered address.
        let (_, xid, payload) = sent_dhcp(&driver);
        let opts = &payload[BOOTP_HEADER_LEN + 4..];
        assert_eq!(find_option(opts, 53), Some(&[3][..]));
        assert_eq!(find_option(opts, 50), Some(&OFFERED_IP.0[..]));

        inject_dhcp(&driver, &bootp_reply(xid, 5, OFFERED_IP, &[(54, &DHCP_SERVER_IP.0)]));
        stack.packet_pump();
        assert!(stack.dhcp_ready());
        assert_eq!(stack.config().ip, OFFERED_IP);
    }

    #[test]
    fn dhcp_renews_on_t1_via_timers() {
        let (mut stack, driver, timers, _) = make_stack();
        stack.dhcp_start();
        let (_, xid, _) = sent_dhcp(&driver);
        inject_dhcp(&driver, &bootp_reply(xid, 2, OFFERED_IP, &[(54, &DHCP_SERVER_IP.0)]));
        stack.packet_pump();
        let _ = sent_dhcp(&driver); // the request
        inject_dhcp(
            &driver,
            &bootp_reply(
                xid,
                5,
                OFFERED_IP,
                &[
                    (54, &DHCP_SERVER_IP.0),
                    (58, &300u32.to_be_bytes()),
                    (59, &525u32.to_be_bytes()),
                ],
            ),
        );
        stack.packet_pump();
        let _ = driver.take_sent(); // gateway ARP request
        assert!(stack.dhcp_ready());

        // Answer the gateway probe so the renewal can be addressed.
        let reply = crate::arp::serialize_arp(&crate::arp::ArpPacket {
            op: crate::arp::ArpOp::Reply,
            sender_mac: GW_MAC,
            sender_ip: DHCP_SERVER_IP,
            target_mac: OUR_MAC,
            target_ip: OFFERED_IP,
        });
        driver.inject(build_ethernet_frame(OUR_MAC, GW_MAC, ETHERTYPE_ARP, &reply));
        stack.packet_pump();

        timers.tick(300);
        stack.handle_timers();

        // Renewal is unicast from our address to the lease server.
        let (ip, _, payload) = sent_dhcp(&driver);
        assert_eq!(ip.src, OFFERED_IP);
        assert_eq!(ip.dst, DHCP_SERVER_IP);
        let opts = &payload[BOOTP_HEADER_LEN + 4..];
        assert_eq!(find_option(opts, 53), Some(&[3][..]));
        // ciaddr carries the address instead of option 50.
        assert_eq!(&payload[12..16], &OFFERED_IP.0);
        assert_eq!(find_option(opts, 50), None);
    }

    #[test]
    fn announce_broadcasts_gratuitous_arp() {
        let (mut stack, driver, _) = configured_stack();
        stack.announce_address();
        let frame = driver.take_sent().unwrap();
        assert_eq!(frame.ethertype, ETHERTYPE_ARP);
        assert_eq!(frame.dst, EthAddr::BROADCAST);
        let pkt = crate::arp::parse_arp(&frame.payload).unwrap();
        assert_eq!(pkt.sender_ip, OUR_IP);
        assert_eq!(pkt.target_ip, OUR_IP);
    }
}
