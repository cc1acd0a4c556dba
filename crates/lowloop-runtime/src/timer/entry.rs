//! Timer entry

/// Per-timer metadata, stored beside the ordered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    /// Next deadline (loop clock ms).
    pub stamp: u32,
    /// Insertion sequence; orders equal stamps FIFO.
    pub seq: u64,
    pub interval: u32,
    pub oneshot: bool,
    /// Engine-internal timer: kept across a warm reset.
    pub native: bool,
    /// Counts toward the loop's run-ref.
    pub refed: bool,
}

impl TimerEntry {
    /// A ref'd timer due `delay` ms after `now`. Negative delays fire
    /// immediately.
    pub fn new(now: u32, delay: i64, oneshot: bool) -> Self {
        let delay = delay.clamp(0, i32::MAX as i64) as u32;
        TimerEntry {
            stamp: now.wrapping_add(delay),
            seq: 0,
            interval: delay,
            oneshot,
            native: false,
            refed: true,
        }
    }

    pub fn native(mut self, on: bool) -> Self {
        self.native = on;
        self
    }

    #[inline]
    pub fn key(&self) -> (u32, u64) {
        (self.stamp, self.seq)
    }

    /// Advance a repeating timer by one interval; a timer that fell behind
    /// is clamped to `now` instead of firing in a burst.
    pub fn advance(&mut self, now: u32) {
        self.stamp = self.stamp.wrapping_add(self.interval);
        if super::ms_until(self.stamp, now) < 0 {
            self.stamp = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_delay_clamped() {
        let e = TimerEntry::new(100, -50, true);
        assert_eq!(e.stamp, 100);
        assert_eq!(e.interval, 0);
        assert!(e.refed);
    }

    #[test]
    fn test_advance_clamps_when_behind() {
        let mut e = TimerEntry::new(0, 10, false);
        e.advance(15);
        assert_eq!(e.stamp, 20);
        e.advance(500);
        assert_eq!(e.stamp, 500);
    }
}
