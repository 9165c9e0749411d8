//! Countdown timer service, injected by the host.
//!
//! The stack never reads a clock; it asks the host for one-second-
//! resolution countdown timers and polls them. TCP uses them for
//! retransmission and TIME_WAIT, DHCP for T1/T2 renewal.

/// Opaque handle to a running timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(pub u8);

/// Host-provided timer pool.
pub trait TimerService {
    /// Start a countdown of `seconds`. `None` when the pool is
    /// exhausted; callers degrade (the operation relying on the timer
    /// simply won't fire) rather than fail.
    fn start(&mut self, seconds: u32) -> Option<TimerHandle>;

    /// Poll a timer. Returning `true` releases the timer; the handle
    /// must not be used again.
    fn expired(&mut self, timer: TimerHandle) -> bool;

    /// Rewind a running timer to a fresh countdown.
    fn reset(&mut self, timer: TimerHandle, seconds: u32);

    /// Release a timer without waiting for expiry.
    fn cancel(&mut self, timer: TimerHandle);
}
