//! Cross-thread wake abstraction.
//!
//! The multiplexer sleeps in `poll`; anything that changes what it should be
//! watching (interest requests, deletes, shutdown) nudges it through a
//! `Notifier`.
//!
//! # Implementors
//!
//! - `WakePipe` (runtime): writes one byte to a non-blocking pipe. The same
//!   pipe carries signal numbers, so one `poll` slot covers both.

use crate::error::LoopResult;

/// Wakes a thread blocked in the readiness wait.
///
/// **Contract:**
/// - `notify()` must never block.
/// - Calls made before the sleeper drains the channel may coalesce into a
///   single wakeup.
pub trait Notifier: Send + Sync {
    fn notify(&self) -> LoopResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl Notifier for Counting {
        fn notify(&self) -> LoopResult<()> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_trait_object() {
        let n = Counting(AtomicUsize::new(0));
        let dyn_n: &dyn Notifier = &n;
        dyn_n.notify().unwrap();
        dyn_n.notify().unwrap();
        assert_eq!(n.0.load(Ordering::Relaxed), 2);
    }
}
