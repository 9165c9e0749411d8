//! Socket and stream registry.
//!
//! Two fixed pools: sockets (a protocol bound to a local port) and
//! streams (one conversation with one peer, with its ring buffers).
//! A TCP socket owns a listening stream plus one stream per live
//! connection; a UDP socket grows one stream per peer that has sent
//! us a datagram.
//!
//! UDP delivery is length-prefixed inside the RX ring: each datagram
//! is stored as a 2-byte little-endian length followed by the payload,
//! all-or-nothing, so datagram boundaries survive the byte ring.

use crate::ethernet::EthAddr;
use crate::ipv4::{Ipv4Addr, Ipv4Proto};
use crate::ring::{RxRing, TxRing};
use crate::timer::TimerHandle;

/// Size of the socket pool.
pub const MAX_SOCKETS: usize = 4;
/// Size of the stream pool.
pub const MAX_STREAMS: usize = 8;

/// Connection state of a stream. TCP states follow RFC 793 naming;
/// `UdpMode` marks a stream that is a UDP peer association instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    UdpMode,
    Listen,
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

impl StreamState {
    /// Can the application still queue data for transmission?
    #[inline]
    pub fn can_send(&self) -> bool {
        matches!(
            self,
            StreamState::Established | StreamState::CloseWait | StreamState::UdpMode
        )
    }

    /// Can more data from the peer still arrive?
    #[inline]
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            StreamState::Established
                | StreamState::FinWait1
                | StreamState::FinWait2
                | StreamState::UdpMode
        )
    }
}

/// A bound endpoint: protocol plus local port.
#[derive(Debug, Clone, Copy)]
pub struct Socket {
    pub in_use: bool,
    pub proto: Ipv4Proto,
    pub local_port: u16,
}

impl Socket {
    const EMPTY: Socket = Socket {
        in_use: false,
        proto: Ipv4Proto::Udp,
        local_port: 0,
    };
}

/// One conversation with one peer.
pub struct Stream {
    pub in_use: bool,
    /// Handed to the application by `accept` yet?
    pub accepted: bool,
    pub state: StreamState,
    /// Index of the owning socket.
    pub parent: usize,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    /// MAC the peer last used, so replies need no ARP round trip.
    pub remote_mac: EthAddr,
    pub timer: Option<TimerHandle>,
    pub rx: RxRing,
    pub tx: TxRing,
}

impl Stream {
    const EMPTY: Stream = Stream {
        in_use: false,
        accepted: false,
        state: StreamState::Closed,
        parent: 0,
        remote_ip: Ipv4Addr::UNSPECIFIED,
        remote_port: 0,
        remote_mac: EthAddr::ZERO,
        timer: None,
        rx: RxRing::new(),
        tx: TxRing::new(),
    };

    /// Return the slot to the pool.
    pub(crate) fn release(&mut self) {
        self.in_use = false;
        self.accepted = false;
        self.state = StreamState::Closed;
        self.remote_ip = Ipv4Addr::UNSPECIFIED;
        self.remote_port = 0;
        self.remote_mac = EthAddr::ZERO;
        self.timer = None;
        self.rx.reset();
        self.tx.reset();
    }
}

/// Handle to a pool socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(pub usize);

/// Handle to a pool stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle(pub usize);

/// Errors surfaced by the socket API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// The socket pool is full.
    SocketsExhausted,
    /// The stream pool is full.
    StreamsExhausted,
    /// Stale or out-of-range socket handle.
    InvalidSocket,
    /// Stale or out-of-range stream handle (including streams torn
    /// down by a peer RST).
    InvalidStream,
    /// Nothing to do right now; retry after pumping packets.
    WouldBlock,
    /// Operation requires a state the stream is not in.
    NotConnected,
}

/// First local port handed to an unbound socket on `connect`.
const EPHEMERAL_BASE: u16 = 0xC000;

/// The fixed socket/stream pools and their bookkeeping.
pub struct SocketTable {
    pub(crate) sockets: [Socket; MAX_SOCKETS],
    pub(crate) streams: [Stream; MAX_STREAMS],
    next_ephemeral: u16,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    pub const fn new() -> Self {
        SocketTable {
            sockets: [Socket::EMPTY; MAX_SOCKETS],
            streams: [Stream::EMPTY; MAX_STREAMS],
            next_ephemeral: EPHEMERAL_BASE,
        }
    }

    // ------------------------------------------------------------------
    // Pool management
    // ------------------------------------------------------------------

    /// Claim a socket for `proto`.
    pub fn open(&mut self, proto: Ipv4Proto) -> Result<SocketHandle, SocketError> {
        for (i, sock) in self.sockets.iter_mut().enumerate() {
            if !sock.in_use {
                *sock = Socket {
                    in_use: true,
                    proto,
                    local_port: 0,
                };
                return Ok(SocketHandle(i));
            }
        }
        Err(SocketError::SocketsExhausted)
    }

    /// Bind a socket to `port` and start listening. For TCP this also
    /// provisions the listening stream.
    pub fn bind_listen(&mut self, sock: SocketHandle, port: u16) -> Result<(), SocketError> {
        let proto = {
            let s = self.socket(sock)?;
            s.proto
        };
        self.sockets[sock.0].local_port = port;
        if proto == Ipv4Proto::Tcp {
            self.provision_listener(sock.0)
                .ok_or(SocketError::StreamsExhausted)?;
        }
        Ok(())
    }

    /// Associate a UDP socket with a chosen peer. The returned stream
    /// is usable immediately: sends go to the peer, and only that
    /// peer's datagrams are delivered to it. An unbound socket is
    /// given an ephemeral local port. TCP sockets only accept inbound
    /// connections, so `connect` on one fails with `NotConnected`.
    pub fn connect(
        &mut self,
        sock: SocketHandle,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Result<StreamHandle, SocketError> {
        if self.socket(sock)?.proto != Ipv4Proto::Udp {
            return Err(SocketError::NotConnected);
        }
        if self.sockets[sock.0].local_port == 0 {
            self.sockets[sock.0].local_port = self.next_ephemeral;
            self.next_ephemeral = self.next_ephemeral.checked_add(1).unwrap_or(EPHEMERAL_BASE);
        }
        let i = self
            .alloc_stream(sock.0, StreamState::UdpMode)
            .ok_or(SocketError::StreamsExhausted)?;
        let stream = &mut self.streams[i];
        stream.remote_ip = remote_ip;
        stream.remote_port = remote_port;
        // The application asked for this flow; it has nothing to accept.
        stream.accepted = true;
        Ok(StreamHandle(i))
    }

    /// Release a socket and every stream it owns. Closing an
    /// already-released socket is a no-op.
    pub fn close_socket(&mut self, sock: SocketHandle) -> Result<(), SocketError> {
        if self.socket(sock).is_err() {
            return Ok(());
        }
        self.sockets[sock.0].in_use = false;
        for stream in self.streams.iter_mut() {
            if stream.in_use && stream.parent == sock.0 {
                stream.release();
            }
        }
        Ok(())
    }

    /// Allocate a fresh stream under `parent`.
    pub(crate) fn alloc_stream(&mut self, parent: usize, state: StreamState) -> Option<usize> {
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if !stream.in_use {
                stream.release();
                stream.in_use = true;
                stream.parent = parent;
                stream.state = state;
                return Some(i);
            }
        }
        None
    }

    /// Make sure a TCP socket has a stream in Listen, so the next SYN
    /// finds a taker. Best effort when the pool is full.
    pub(crate) fn provision_listener(&mut self, parent: usize) -> Option<usize> {
        if let Some(i) = self
            .streams
            .iter()
            .position(|s| s.in_use && s.parent == parent && s.state == StreamState::Listen)
        {
            return Some(i);
        }
        self.alloc_stream(parent, StreamState::Listen)
    }

    // ------------------------------------------------------------------
    // Demultiplexing
    // ------------------------------------------------------------------

    /// Find the stream an inbound segment/datagram belongs to.
    ///
    /// Stage one matches an existing flow by (protocol, peer address,
    /// peer port) under a socket bound to `local_port`. Stage two
    /// matches a listener: the TCP Listen stream, or for UDP a fresh
    /// peer association under the bound socket. `None` means nobody
    /// wants it and the packet is dropped without a response.
    pub(crate) fn demux(
        &mut self,
        proto: Ipv4Proto,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        local_port: u16,
    ) -> Option<usize> {
        // Existing flow.
        for (i, stream) in self.streams.iter().enumerate() {
            if !stream.in_use || stream.state == StreamState::Listen {
                continue;
            }
            let sock = &self.sockets[stream.parent];
            if sock.in_use
                && sock.proto == proto
                && sock.local_port == local_port
                && stream.remote_ip == remote_ip
                && stream.remote_port == remote_port
            {
                return Some(i);
            }
        }
        // Listener.
        let parent = self.sockets.iter().position(|s| {
            s.in_use && s.proto == proto && s.local_port == local_port && local_port != 0
        })?;
        match proto {
            Ipv4Proto::Tcp => self
                .streams
                .iter()
                .position(|s| s.in_use && s.parent == parent && s.state == StreamState::Listen),
            Ipv4Proto::Udp => {
                let i = self.alloc_stream(parent, StreamState::UdpMode)?;
                self.streams[i].remote_ip = remote_ip;
                self.streams[i].remote_port = remote_port;
                Some(i)
            }
            Ipv4Proto::Icmp => None,
        }
    }

    // ------------------------------------------------------------------
    // Application side
    // ------------------------------------------------------------------

    /// Hand out the next un-accepted conversation on `sock`, if any.
    pub fn try_accept(&mut self, sock: SocketHandle) -> Result<StreamHandle, SocketError> {
        self.socket(sock)?;
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if stream.in_use
                && stream.parent == sock.0
                && !stream.accepted
                && matches!(stream.state, StreamState::Established | StreamState::UdpMode)
            {
                stream.accepted = true;
                return Ok(StreamHandle(i));
            }
        }
        Err(SocketError::WouldBlock)
    }

    /// Deliver one UDP datagram into a stream's RX ring, framed with a
    /// little-endian length prefix. All or nothing.
    pub(crate) fn udp_deliver(&mut self, idx: usize, payload: &[u8]) -> bool {
        let stream = &mut self.streams[idx];
        if payload.len() > u16::MAX as usize
            || stream.rx.free() < payload.len() as u32 + 2
        {
            return false;
        }
        let prefix = (payload.len() as u16).to_le_bytes();
        stream.rx.write(&prefix);
        stream.rx.write(payload);
        true
    }

    /// Take one UDP datagram out of a stream's RX ring. Returns the
    /// payload length copied; a datagram longer than `buf` is
    /// truncated and the excess discarded.
    pub(crate) fn udp_take(&mut self, idx: usize, buf: &mut [u8]) -> Option<usize> {
        let stream = &mut self.streams[idx];
        if stream.rx.len() < 2 {
            return None;
        }
        let lo = stream.rx.pop()?;
        let hi = stream.rx.pop()?;
        let len = u16::from_le_bytes([lo, hi]) as usize;
        let n = len.min(buf.len());
        stream.rx.read(&mut buf[..n]);
        if len > n {
            stream.rx.skip((len - n) as u32);
        }
        Some(n)
    }

    pub(crate) fn socket(&self, sock: SocketHandle) -> Result<&Socket, SocketError> {
        self.sockets
            .get(sock.0)
            .filter(|s| s.in_use)
            .ok_or(SocketError::InvalidSocket)
    }

    pub(crate) fn stream(&self, stream: StreamHandle) -> Result<&Stream, SocketError> {
        self.streams
            .get(stream.0)
            .filter(|s| s.in_use)
            .ok_or(SocketError::InvalidStream)
    }

    pub(crate) fn stream_mut(&mut self, stream: StreamHandle) -> Result<&mut Stream, SocketError> {
        self.streams
            .get_mut(stream.0)
            .filter(|s| s.in_use)
            .ok_or(SocketError::InvalidStream)
    }
}
