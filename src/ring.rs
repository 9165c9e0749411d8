//! Fixed-capacity byte rings backing TCP/UDP streams.
//!
//! Counters are free-running `u32`s and never wrap back to an index
//! directly; the buffer index is `counter & (capacity - 1)`, which
//! requires power-of-two capacities. For TCP the counters double as
//! relative sequence numbers: `counter + rawseq` is the on-the-wire
//! sequence number, so acknowledgment arithmetic is plain counter
//! subtraction.

/// Receive ring capacity per stream.
pub const STREAM_RX_CAPACITY: usize = 1024;
/// Transmit ring capacity per stream.
pub const STREAM_TX_CAPACITY: usize = 512;

const _: () = assert!(STREAM_RX_CAPACITY.is_power_of_two());
const _: () = assert!(STREAM_TX_CAPACITY.is_power_of_two());

/// Receive ring: bytes the peer sent that the application has not
/// consumed yet.
///
/// `tail` is the read point, `head` the write point, and for TCP
/// `head + rawseq` is the next in-order sequence number we will
/// accept.
pub struct RxRing {
    pub head: u32,
    pub tail: u32,
    pub rawseq: u32,
    buf: [u8; STREAM_RX_CAPACITY],
}

impl RxRing {
    pub const fn new() -> Self {
        RxRing {
            head: 0,
            tail: 0,
            rawseq: 0,
            buf: [0; STREAM_RX_CAPACITY],
        }
    }

    /// Unread bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Room left for new data; also the TCP window we advertise.
    #[inline]
    pub fn free(&self) -> u32 {
        STREAM_RX_CAPACITY as u32 - self.len()
    }

    /// Write `data` at the head, all or nothing.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if (data.len() as u32) > self.free() {
            return false;
        }
        for &b in data {
            self.buf[(self.head as usize) & (STREAM_RX_CAPACITY - 1)] = b;
            self.head = self.head.wrapping_add(1);
        }
        true
    }

    /// Pop a single byte from the tail.
    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let b = self.buf[(self.tail as usize) & (STREAM_RX_CAPACITY - 1)];
        self.tail = self.tail.wrapping_add(1);
        Some(b)
    }

    /// Read up to `dest.len()` bytes from the tail; returns the count.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let n = (self.len() as usize).min(dest.len());
        for slot in dest[..n].iter_mut() {
            *slot = self.buf[(self.tail as usize) & (STREAM_RX_CAPACITY - 1)];
            self.tail = self.tail.wrapping_add(1);
        }
        n
    }

    /// Drop `n` unread bytes (datagram truncation).
    pub fn skip(&mut self, n: u32) {
        let n = n.min(self.len());
        self.tail = self.tail.wrapping_add(n);
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.rawseq = 0;
    }
}

/// Transmit ring: bytes the application queued that the peer has not
/// acknowledged yet.
///
/// `head` is where the application writes, `next` the first byte not
/// yet on the wire, `tail` the first unacknowledged byte. `window` is
/// the peer's receive window already multiplied by `scale`.
pub struct TxRing {
    pub head: u32,
    pub next: u32,
    pub tail: u32,
    pub window: u32,
    pub scale: u16,
    pub rawseq: u32,
    buf: [u8; STREAM_TX_CAPACITY],
}

impl TxRing {
    pub const fn new() -> Self {
        TxRing {
            head: 0,
            next: 0,
            tail: 0,
            window: 0,
            scale: 1,
            rawseq: 0,
            buf: [0; STREAM_TX_CAPACITY],
        }
    }

    /// Bytes queued but not yet acknowledged.
    #[inline]
    pub fn len(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Room for the application to queue more.
    #[inline]
    pub fn free(&self) -> u32 {
        STREAM_TX_CAPACITY as u32 - self.len()
    }

    /// Queue as much of `data` as fits; returns the count taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = (self.free() as usize).min(data.len());
        for &b in &data[..n] {
            self.buf[(self.head as usize) & (STREAM_TX_CAPACITY - 1)] = b;
            self.head = self.head.wrapping_add(1);
        }
        n
    }

    /// Linearize counters `[from, from + dest.len())` into `dest` for
    /// (re)transmission. The caller guarantees the range is within
    /// `[tail, head)`.
    pub fn copy_range(&self, from: u32, dest: &mut [u8]) {
        for (i, slot) in dest.iter_mut().enumerate() {
            *slot = self.buf[(from.wrapping_add(i as u32) as usize) & (STREAM_TX_CAPACITY - 1)];
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.next = 0;
        self.tail = 0;
        self.window = 0;
        self.scale = 1;
        self.rawseq = 0;
    }
}
