//! Loop timers
//!
//! One-shot and repeating timers live in a [`TimerTable`] owned by the
//! event-loop thread. Deadlines are 32-bit millisecond stamps from a
//! [`LoopClock`]; they wrap after ~49 days, and every comparison goes
//! through [`is_due`] / [`ms_until`] so the wrap is harmless.
//!
//! # Architecture
//!
//! ```text
//!   set_timeout / set_interval (loop thread)
//!                 │
//!                 ▼
//!   TimerTable: (stamp, seq) ──► SlotId ──► TimerEntry
//!                 │
//!                 ▼
//!   EventLoop::iterate ── pop_due(now) ──► callback in SlotTable
//! ```
//!
//! The timer id handed to callers is the callback's slot id.

mod entry;
mod table;

pub use entry::TimerEntry;
pub use table::{Fired, TimerTable};

use std::time::Instant;

/// Millisecond tick source for timer stamps.
#[derive(Debug, Clone, Copy)]
pub struct LoopClock {
    origin: Instant,
}

impl LoopClock {
    pub fn new() -> Self {
        LoopClock { origin: Instant::now() }
    }

    /// Milliseconds since the clock was created, truncated to 32 bits.
    #[inline]
    pub fn now(&self) -> u32 {
        self.origin.elapsed().as_millis() as u64 as u32
    }
}

impl Default for LoopClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Signed distance from `now` to `stamp`, wrap-safe.
#[inline]
pub fn ms_until(stamp: u32, now: u32) -> i32 {
    stamp.wrapping_sub(now) as i32
}

#[inline]
pub fn is_due(stamp: u32, now: u32) -> bool {
    ms_until(stamp, now) <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_across_wrap() {
        let now = u32::MAX - 5;
        let later = now.wrapping_add(10);
        assert!(later < now);
        assert!(!is_due(later, now));
        assert_eq!(ms_until(later, now), 10);
        assert!(is_due(now, later));
    }

    #[test]
    fn test_clock_moves_forward() {
        let clock = LoopClock::new();
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(3));
        assert!(ms_until(clock.now(), a) >= 2);
    }
}
