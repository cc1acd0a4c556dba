//! Completion queue: work handed back to the event-loop thread.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use lowloop_core::{LoopResult, QueueLink};

use crate::event_loop::LoopContext;

/// A unit of work for the event loop.
///
/// An object is in the queue at most once; posting it again while it is
/// queued is a no-op. `on_loop` returning `true` keeps the object alive
/// for further posts (a socket), `false` ends it and `on_finish` runs.
pub trait LoopCallback: Send + Sync + 'static {
    fn link(&self) -> &QueueLink;

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool>;

    fn on_finish(&self, _cx: &mut LoopContext) {}

    fn survives_reset(&self) -> bool {
        false
    }
}

#[inline]
fn same(a: &Arc<dyn LoopCallback>, b: &Arc<dyn LoopCallback>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub struct CompletionQueue {
    queue: Mutex<VecDeque<Arc<dyn LoopCallback>>>,
    cond: Condvar,
}

impl CompletionQueue {
    pub fn new() -> Self {
        CompletionQueue {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<dyn LoopCallback>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `cb` unless it is already queued. Callable from any thread.
    pub fn post(&self, cb: Arc<dyn LoopCallback>) -> bool {
        let mut q = self.lock();
        if !cb.link().try_link() {
            return false;
        }
        q.push_back(cb);
        drop(q);
        self.cond.notify_one();
        true
    }

    pub fn pop(&self) -> Option<Arc<dyn LoopCallback>> {
        let mut q = self.lock();
        let cb = q.pop_front()?;
        cb.link().unlink();
        Some(cb)
    }

    /// Remove `cb` if queued. Synchronous: once this returns, `cb` will not
    /// run unless posted again.
    pub fn cancel(&self, cb: &Arc<dyn LoopCallback>) -> bool {
        let mut q = self.lock();
        let Some(pos) = q.iter().position(|c| same(c, cb)) else {
            return false;
        };
        if let Some(removed) = q.remove(pos) {
            removed.link().unlink();
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Block until something is posted, `timeout` elapses, or `woken`
    /// returns true. `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>, woken: impl Fn() -> bool) {
        let q = self.lock();
        if !q.is_empty() || woken() {
            return;
        }
        match timeout {
            Some(t) => drop(self.cond.wait_timeout(q, t)),
            None => drop(self.cond.wait(q)),
        }
    }

    /// Wake a thread blocked in [`wait`](Self::wait) without posting.
    pub fn interrupt(&self) {
        let _q = self.lock();
        self.cond.notify_all();
    }

    /// Remove every entry not marked survive-reset.
    pub fn drain_non_survivors(&self) -> Vec<Arc<dyn LoopCallback>> {
        let mut q = self.lock();
        let mut dropped = Vec::new();
        q.retain(|cb| {
            if cb.survives_reset() {
                return true;
            }
            cb.link().unlink();
            dropped.push(cb.clone());
            false
        });
        dropped
    }

    pub fn drain_all(&self) -> Vec<Arc<dyn LoopCallback>> {
        let mut q = self.lock();
        q.drain(..)
            .map(|cb| {
                cb.link().unlink();
                cb
            })
            .collect()
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        link: QueueLink,
        runs: AtomicUsize,
        survive: bool,
    }

    impl Probe {
        fn new(survive: bool) -> Arc<Probe> {
            Arc::new(Probe {
                link: QueueLink::new(),
                runs: AtomicUsize::new(0),
                survive,
            })
        }
    }

    impl LoopCallback for Probe {
        fn link(&self) -> &QueueLink {
            &self.link
        }
        fn on_loop(&self, _cx: &mut LoopContext) -> LoopResult<bool> {
            self.runs.fetch_add(1, Ordering::Relaxed);
            Ok(false)
        }
        fn survives_reset(&self) -> bool {
            self.survive
        }
    }

    #[test]
    fn test_post_coalesces() {
        let q = CompletionQueue::new();
        let p = Probe::new(false);
        assert!(q.post(p.clone()));
        assert!(!q.post(p.clone()));
        assert!(!q.post(p.clone()));
        assert_eq!(q.len(), 1);
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
        // Popped: may be posted again.
        assert!(q.post(p));
    }

    #[test]
    fn test_fifo_and_cancel() {
        let q = CompletionQueue::new();
        let a = Probe::new(false);
        let b = Probe::new(false);
        let c = Probe::new(false);
        q.post(a.clone());
        q.post(b.clone());
        q.post(c.clone());
        let b_dyn: Arc<dyn LoopCallback> = b.clone();
        assert!(q.cancel(&b_dyn));
        assert!(!q.cancel(&b_dyn));
        assert!(!b.link.is_linked());

        let first = q.pop().unwrap();
        let a_dyn: Arc<dyn LoopCallback> = a;
        assert!(same(&first, &a_dyn));
        let second = q.pop().unwrap();
        let c_dyn: Arc<dyn LoopCallback> = c;
        assert!(same(&second, &c_dyn));
    }

    #[test]
    fn test_drain_keeps_survivors() {
        let q = CompletionQueue::new();
        q.post(Probe::new(true));
        q.post(Probe::new(false));
        q.post(Probe::new(false));
        assert_eq!(q.drain_non_survivors().len(), 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_wait_returns_on_post() {
        let q = Arc::new(CompletionQueue::new());
        let q2 = q.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            q2.post(Probe::new(false));
        });
        while q.is_empty() {
            q.wait(Some(Duration::from_millis(500)), || false);
        }
        t.join().unwrap();
        assert_eq!(q.len(), 1);
    }
}
