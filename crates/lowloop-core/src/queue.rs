//! Queue membership flag.
//!
//! Completions and work items live in owned queues (`VecDeque<Arc<_>>`).
//! Each object carries one `QueueLink`; enqueueing an object that is
//! already queued is a no-op, so an object is in at most one queue.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct QueueLink {
    queued: AtomicBool,
}

impl QueueLink {
    pub const fn new() -> Self {
        QueueLink {
            queued: AtomicBool::new(false),
        }
    }

    /// Claim membership. `false` means already queued.
    ///
    /// Call with the owning queue's lock held.
    #[inline]
    pub fn try_link(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    /// Give up membership after the object was popped or removed.
    #[inline]
    pub fn unlink(&self) {
        self.queued.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_once() {
        let link = QueueLink::new();
        assert!(!link.is_linked());
        assert!(link.try_link());
        assert!(!link.try_link());
        link.unlink();
        assert!(link.try_link());
    }
}
