//! External poll sources.
//!
//! Something that owns its own handles and deadlines (a non-blocking
//! resolver, a device driver) can ride along in the multiplexer's wait
//! instead of needing a thread of its own.

use std::os::unix::io::RawFd;
use std::time::Duration;

use lowloop_core::Interest;

pub trait PollSource: Send + Sync + 'static {
    /// Handles to watch this pass.
    fn handles(&self, out: &mut Vec<(RawFd, Interest)>);

    /// Longest the multiplexer may sleep on this source's behalf.
    fn next_timeout(&self) -> Option<Duration>;

    /// Called on the multiplexer thread when any handle is ready or the
    /// timeout elapsed. `ready` is empty on a pure timeout.
    fn process(&self, ready: &[(RawFd, Interest)]);
}

/// One source's share of a pass: where its handles sit in the poll array
/// and when it must be processed regardless of readiness.
pub(crate) struct SourceSlot {
    pub start: usize,
    pub len: usize,
    pub deadline: Option<std::time::Instant>,
}
