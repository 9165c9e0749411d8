//! Mock link driver, timer pool and lease store shared by the test
//! suites. Each mock is a cheap clone over shared state, so a test
//! keeps a handle for injection and inspection after moving its twin
//! into the stack.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::device::LinkDriver;
use crate::ethernet::{EthAddr, ETH_HLEN};
use crate::storage::{LeaseRecord, LeaseStore};
use crate::timer::{TimerHandle, TimerService};

/// A frame captured from the stack's transmit path.
#[derive(Clone)]
pub struct SentFrame {
    pub dst: EthAddr,
    pub src: EthAddr,
    pub ethertype: u16,
    /// Concatenated payload segments (everything after the Ethernet
    /// header).
    pub payload: Vec<u8>,
}

impl SentFrame {
    /// Re-assemble the frame as raw bytes, header included.
    pub fn flatten(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ETH_HLEN + self.payload.len());
        out.extend_from_slice(&self.dst.0);
        out.extend_from_slice(&self.src.0);
        out.extend_from_slice(&self.ethertype.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

struct DriverState {
    rx_queue: VecDeque<Vec<u8>>,
    sent: VecDeque<SentFrame>,
    free_space: usize,
}

impl Default for DriverState {
    fn default() -> Self {
        DriverState {
            rx_queue: VecDeque::new(),
            sent: VecDeque::new(),
            free_space: usize::MAX,
        }
    }
}

/// In-memory link: frames queued with `inject` appear on the receive
/// side; transmitted frames are collected with `take_sent`.
#[derive(Clone, Default)]
pub struct MockDriver(Rc<RefCell<DriverState>>);

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a complete frame for reception.
    pub fn inject(&self, frame: Vec<u8>) {
        self.0.borrow_mut().rx_queue.push_back(frame);
    }

    /// Pop the oldest transmitted frame.
    pub fn take_sent(&self) -> Option<SentFrame> {
        self.0.borrow_mut().sent.pop_front()
    }

    pub fn sent_count(&self) -> usize {
        self.0.borrow().sent.len()
    }

    /// Constrain the transmit buffer budget reported to the stack.
    pub fn set_free_space(&self, bytes: usize) {
        self.0.borrow_mut().free_space = bytes;
    }
}

impl LinkDriver for MockDriver {
    fn frames_pending(&self) -> usize {
        self.0.borrow().rx_queue.len()
    }

    fn receive_frame(&mut self) -> Option<Vec<u8>> {
        self.0.borrow_mut().rx_queue.pop_front()
    }

    fn send_frame(&mut self, dst: EthAddr, src: EthAddr, ethertype: u16, segments: &[&[u8]]) {
        let mut payload = Vec::new();
        for seg in segments {
            payload.extend_from_slice(seg);
        }
        self.0.borrow_mut().sent.push_back(SentFrame {
            dst,
            src,
            ethertype,
            payload,
        });
    }

    fn free_buffer_space(&self) -> usize {
        self.0.borrow().free_space
    }
}

/// Countdown timer pool advanced manually with [`FakeTimers::tick`].
#[derive(Clone, Default)]
pub struct FakeTimers(Rc<RefCell<[Option<u32>; 8]>>);

impl FakeTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `secs`.
    pub fn tick(&self, secs: u32) {
        for slot in self.0.borrow_mut().iter_mut().flatten() {
            *slot = slot.saturating_sub(secs);
        }
    }

    /// Number of timers currently running.
    pub fn active(&self) -> usize {
        self.0.borrow().iter().flatten().count()
    }
}

impl TimerService for FakeTimers {
    fn start(&mut self, seconds: u32) -> Option<TimerHandle> {
        let mut slots = self.0.borrow_mut();
        let i = slots.iter().position(|s| s.is_none())?;
        slots[i] = Some(seconds);
        Some(TimerHandle(i as u8))
    }

    fn expired(&mut self, timer: TimerHandle) -> bool {
        let mut slots = self.0.borrow_mut();
        if slots[timer.0 as usize] == Some(0) {
            slots[timer.0 as usize] = None;
            true
        } else {
            false
        }
    }

    fn reset(&mut self, timer: TimerHandle, seconds: u32) {
        self.0.borrow_mut()[timer.0 as usize] = Some(seconds);
    }

    fn cancel(&mut self, timer: TimerHandle) {
        self.0.borrow_mut()[timer.0 as usize] = None;
    }
}

/// Lease store backed by shared memory.
#[derive(Clone, Default)]
pub struct MemStore(Rc<RefCell<Option<LeaseRecord>>>);

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: LeaseRecord) -> Self {
        MemStore(Rc::new(RefCell::new(Some(record))))
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        *self.0.borrow()
    }
}

impl LeaseStore for MemStore {
    fn load(&mut self) -> Option<LeaseRecord> {
        *self.0.borrow()
    }

    fn store(&mut self, record: &LeaseRecord) {
        *self.0.borrow_mut() = Some(*record);
    }
}
