//! # Multiplexer - the readiness thread
//!
//! The multiplexer runs on a dedicated OS thread (`lowloop-mux`) and owns the
//! poll set. Each pass it:
//! 1. Builds the poll array: wake pipe, polled descriptors, poll sources
//! 2. Sleeps in `poll(2)`, bounded by the poll sources' deadlines
//! 3. Drains the wake pipe; signal bytes become loop completions
//! 4. Dispatches readiness; a handler returning `false` is unregistered
//!    and retired in place
//! 5. Drains the changed list into the poll set
//! 6. Bumps the pass counter and wakes `clear_and_wait` callers
//!
//! Interest and delete requests come from any thread as queued changes;
//! only this thread edits the poll set.

mod changes;
mod source;

pub use source::PollSource;

use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use lowloop_core::{
    kdebug, kerror, ktrace, DescriptorKind, Interest, LoopError, LoopResult, Notifier, Pollable,
};

use crate::completion::CompletionQueue;
use crate::event_loop::SignalEvent;
use crate::registry::Registry;
use crate::wake::WakePipe;
use changes::{Applied, PollSet};
use source::SourceSlot;

/// Interest → `poll(2)` event bits.
#[inline]
pub fn poll_events(mask: Interest) -> libc::c_short {
    let mut ev = 0;
    if mask.is_readable() {
        ev |= libc::POLLIN;
    }
    if mask.is_writable() {
        ev |= libc::POLLOUT;
    }
    ev
}

/// `poll(2)` revents → Interest. Hang-up also reports READ so readers
/// observe EOF.
#[inline]
pub fn ready_from(revents: libc::c_short) -> Interest {
    let mut ready = Interest::NONE;
    if revents & libc::POLLIN != 0 {
        ready |= Interest::READ;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Interest::WRITE;
    }
    if revents & libc::POLLHUP != 0 {
        ready |= Interest::READ | Interest::ERROR;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= Interest::ERROR;
    }
    ready
}

struct AckState {
    passes: u64,
    stop: bool,
    park: bool,
    parked: bool,
}

/// State shared between the multiplexer thread and everyone who requests
/// interest changes.
pub struct MuxShared {
    wake: WakePipe,
    changes: SegQueue<Arc<dyn Pollable>>,
    ack: Mutex<AckState>,
    ack_cond: Condvar,
    sources: Mutex<Vec<Arc<dyn PollSource>>>,
    registry: Arc<Registry>,
    completions: Arc<CompletionQueue>,
    max_wait: Duration,
    thread_id: OnceLock<ThreadId>,
}

impl MuxShared {
    pub fn new(
        registry: Arc<Registry>,
        completions: Arc<CompletionQueue>,
        max_wait: Duration,
    ) -> LoopResult<Self> {
        Ok(MuxShared {
            wake: WakePipe::create()?,
            changes: SegQueue::new(),
            ack: Mutex::new(AckState {
                passes: 0,
                stop: false,
                park: false,
                parked: false,
            }),
            ack_cond: Condvar::new(),
            sources: Mutex::new(Vec::new()),
            registry,
            completions,
            max_wait,
            thread_id: OnceLock::new(),
        })
    }

    fn lock_ack(&self) -> MutexGuard<'_, AckState> {
        self.ack.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write end of the wake pipe, for the signal handler.
    pub fn wake_write_fd(&self) -> RawFd {
        self.wake.write_fd()
    }

    pub fn wake(&self) {
        if let Err(e) = self.wake.notify() {
            kerror!("mux wake failed: {}", e);
        }
    }

    fn enqueue(&self, obj: &Arc<dyn Pollable>) {
        if obj.descriptor().mark_changed() {
            self.changes.push(obj.clone());
            self.wake();
        }
    }

    /// Replace `obj`'s requested interest. Callable from any thread; any
    /// number of requests before the next pass coalesce into one change.
    pub fn request_interest(&self, obj: &Arc<dyn Pollable>, mask: Interest) {
        obj.descriptor().set_requested(mask);
        self.enqueue(obj);
    }

    /// Ask the multiplexer thread to retire `obj`.
    pub fn mark_delete(&self, obj: &Arc<dyn Pollable>) {
        obj.descriptor().set_pending_delete();
        self.enqueue(obj);
    }

    /// Request no interest and block until the multiplexer has applied it.
    /// Once this returns, `obj` gets no further readiness callbacks.
    pub fn clear_and_wait(&self, obj: &Arc<dyn Pollable>) {
        self.request_interest(obj, Interest::NONE);
        if self.thread_id.get() == Some(&thread::current().id()) {
            return;
        }
        let d = obj.descriptor();
        let mut ack = self.lock_ack();
        while (d.is_polled() || d.is_changed()) && !ack.stop && !ack.parked {
            ack = self.ack_cond.wait(ack).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Destroy `obj` exactly once: unregister, run its retire hook, then
    /// re-arm paused listeners if an accept ran out of descriptors.
    pub fn retire(&self, obj: &Arc<dyn Pollable>) {
        let d = obj.descriptor();
        if !d.try_retire() {
            return;
        }
        self.registry.withdraw(obj.as_ref());
        obj.on_retire();
        if d.is_polled() {
            // Let the poll set drop it before the fd number is reused.
            self.enqueue(obj);
        }
        if self.registry.take_retry_accepts() {
            for listener in self.registry.of_kind(DescriptorKind::Listener) {
                if listener.descriptor().fd() >= 0 {
                    self.request_interest(&listener, Interest::READ);
                }
            }
        }
    }

    pub fn add_source(&self, src: Arc<dyn PollSource>) {
        self.sources.lock().unwrap_or_else(|e| e.into_inner()).push(src);
        self.wake();
    }

    pub fn remove_source(&self, src: &Arc<dyn PollSource>) {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| !std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(src)));
        self.wake();
    }

    pub fn passes(&self) -> u64 {
        self.lock_ack().passes
    }

    /// Block until the multiplexer has completed one more pass.
    pub fn wait_pass(&self) {
        let mut ack = self.lock_ack();
        let start = ack.passes;
        self.wake();
        while ack.passes == start && !ack.stop && !ack.parked {
            ack = self.ack_cond.wait(ack).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Pause the thread between passes and wait until it is idle.
    pub fn park(&self) {
        let mut ack = self.lock_ack();
        ack.park = true;
        self.wake();
        while !ack.parked && !ack.stop {
            ack = self.ack_cond.wait(ack).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn unpark(&self) {
        let mut ack = self.lock_ack();
        ack.park = false;
        drop(ack);
        self.ack_cond.notify_all();
    }

    pub fn stop(&self) {
        let mut ack = self.lock_ack();
        ack.stop = true;
        drop(ack);
        self.ack_cond.notify_all();
        self.wake();
    }

    /// Drop queued changes of everything that will not survive a reset.
    /// Only valid while parked.
    pub fn drain_changes_for_reset(&self) {
        let mut keep = Vec::new();
        while let Some(obj) = self.changes.pop() {
            let d = obj.descriptor();
            if d.survives_reset() && !d.is_retired() {
                keep.push(obj);
            } else {
                d.clear_changed();
            }
        }
        for obj in keep {
            self.changes.push(obj);
        }
    }

    pub fn drain_changes(&self) {
        while let Some(obj) = self.changes.pop() {
            obj.descriptor().clear_changed();
        }
    }

    /// Returns `false` when the thread should exit.
    fn checkpoint(&self) -> bool {
        let mut ack = self.lock_ack();
        if ack.park && !ack.stop {
            ack.parked = true;
            self.ack_cond.notify_all();
            while ack.park && !ack.stop {
                ack = self.ack_cond.wait(ack).unwrap_or_else(|e| e.into_inner());
            }
            ack.parked = false;
        }
        !ack.stop
    }
}

/// Multiplexer thread handle.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Multiplexer {
    pub fn start(shared: Arc<MuxShared>) -> LoopResult<Self> {
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("lowloop-mux".into())
            .spawn(move || mux_loop(thread_shared))
            .map_err(|e| LoopError::Fatal(format!("spawn multiplexer: {}", e)))?;
        Ok(Multiplexer {
            shared,
            thread: Some(thread),
        })
    }

    pub fn shared(&self) -> &Arc<MuxShared> {
        &self.shared
    }

    pub fn shutdown(&mut self) {
        self.shared.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn mux_loop(shared: Arc<MuxShared>) {
    let _ = shared.thread_id.set(thread::current().id());
    kdebug!("multiplexer started");

    let mut set = PollSet::new();
    let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(64);
    let mut targets: Vec<Arc<dyn Pollable>> = Vec::with_capacity(64);
    let mut handles: Vec<(RawFd, Interest)> = Vec::new();
    let mut slots: Vec<SourceSlot> = Vec::new();
    let mut signals: Vec<u8> = Vec::new();
    let mut ready: Vec<(RawFd, Interest)> = Vec::new();

    while shared.checkpoint() {
        // ── Step 1: build the poll array ──
        set.purge_retired();
        pollfds.clear();
        targets.clear();
        pollfds.push(libc::pollfd {
            fd: shared.wake.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for entry in set.iter() {
            pollfds.push(libc::pollfd {
                fd: entry.obj.descriptor().fd(),
                events: poll_events(entry.mask),
                revents: 0,
            });
            targets.push(entry.obj.clone());
        }

        let sources: Vec<Arc<dyn PollSource>> = shared
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let now = Instant::now();
        let mut timeout = shared.max_wait;
        slots.clear();
        for src in &sources {
            handles.clear();
            src.handles(&mut handles);
            let start = pollfds.len();
            for (fd, mask) in &handles {
                pollfds.push(libc::pollfd {
                    fd: *fd,
                    events: poll_events(*mask),
                    revents: 0,
                });
            }
            let wait = src.next_timeout();
            if let Some(w) = wait {
                timeout = timeout.min(w);
            }
            slots.push(SourceSlot {
                start,
                len: handles.len(),
                deadline: wait.map(|w| now + w),
            });
        }

        // ── Step 2: wait ──
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, ms) };
        if n < 0 {
            let err = LoopError::last_os("poll");
            if !err.is_would_block() {
                kerror!("{}", err);
            }
        }

        // ── Step 3: wake pipe / signals ──
        if n > 0 && pollfds[0].revents != 0 {
            signals.clear();
            shared.wake.drain(&mut signals);
            for sig in &signals {
                ktrace!("signal {} received", sig);
                shared.completions.post(SignalEvent::new(*sig as i32));
            }
        }

        // ── Step 4: readiness ──
        if n > 0 {
            for (i, obj) in targets.iter().enumerate() {
                let revents = pollfds[i + 1].revents;
                if revents == 0 {
                    continue;
                }
                let d = obj.descriptor();
                if d.is_retired() {
                    continue;
                }
                if !obj.on_readiness(ready_from(revents)) {
                    set.remove(obj);
                    shared.retire(obj);
                }
            }
        }

        let after = Instant::now();
        for (src, slot) in sources.iter().zip(slots.iter()) {
            ready.clear();
            if n > 0 {
                for pfd in &pollfds[slot.start..slot.start + slot.len] {
                    if pfd.revents != 0 {
                        ready.push((pfd.fd, ready_from(pfd.revents)));
                    }
                }
            }
            let expired = slot.deadline.map(|d| after >= d).unwrap_or(false);
            if !ready.is_empty() || expired {
                src.process(&ready);
            }
        }

        // ── Step 5: drain changes ──
        while let Some(obj) = shared.changes.pop() {
            if set.apply(obj.clone()) == Applied::Delete {
                shared.retire(&obj);
            }
        }

        // ── Step 6: acknowledge ──
        {
            let mut ack = shared.lock_ack();
            ack.passes = ack.passes.wrapping_add(1);
        }
        shared.ack_cond.notify_all();
    }

    set.clear();
    kdebug!("multiplexer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lowloop_core::Descriptor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Read end of a pipe; counts readiness callbacks and drains the pipe.
    struct PipeEnd {
        d: Descriptor,
        hits: AtomicUsize,
        keep: AtomicBool,
        retires: AtomicUsize,
    }

    impl Pollable for PipeEnd {
        fn descriptor(&self) -> &Descriptor {
            &self.d
        }
        fn on_readiness(&self, ready: Interest) -> bool {
            if ready.is_readable() {
                let mut buf = [0u8; 64];
                unsafe {
                    libc::read(self.d.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                }
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.keep.load(Ordering::SeqCst)
        }
        fn on_retire(&self) {
            self.retires.fetch_add(1, Ordering::SeqCst);
            self.d.close_native();
        }
    }

    fn pipe() -> (i32, i32) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        (fds[0], fds[1])
    }

    fn start() -> (Multiplexer, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let completions = Arc::new(CompletionQueue::new());
        let shared =
            Arc::new(MuxShared::new(registry.clone(), completions, Duration::from_millis(100)).unwrap());
        (Multiplexer::start(shared).unwrap(), registry)
    }

    fn write_byte(fd: i32) {
        let b = 1u8;
        unsafe {
            libc::write(fd, &b as *const u8 as *const libc::c_void, 1);
        }
    }

    #[test]
    fn test_translation() {
        assert_eq!(poll_events(Interest::READ | Interest::WRITE), libc::POLLIN | libc::POLLOUT);
        assert_eq!(poll_events(Interest::ERROR), 0);
        assert!(ready_from(libc::POLLHUP).is_readable());
        assert!(ready_from(libc::POLLNVAL).is_error());
    }

    #[test]
    fn test_requests_coalesce_into_one_change() {
        let (mut mux, _reg) = start();
        let (r, w) = pipe();
        let end = Arc::new(PipeEnd {
            d: Descriptor::with_fd(DescriptorKind::Custom, r),
            hits: AtomicUsize::new(0),
            keep: AtomicBool::new(true),
            retires: AtomicUsize::new(0),
        });
        let obj: Arc<dyn Pollable> = end.clone();
        mux.shared().park();
        for _ in 0..100 {
            mux.shared().request_interest(&obj, Interest::READ);
        }
        assert_eq!(mux.shared().changes.len(), 1);
        mux.shared().unpark();
        mux.shared().wait_pass();
        mux.shared().wait_pass();
        assert!(end.d.is_polled());

        write_byte(w);
        for _ in 0..200 {
            if end.hits.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(end.hits.load(Ordering::SeqCst) >= 1);

        mux.shared().clear_and_wait(&obj);
        assert!(!end.d.is_polled());
        let hits = end.hits.load(Ordering::SeqCst);
        write_byte(w);
        mux.shared().wait_pass();
        assert_eq!(end.hits.load(Ordering::SeqCst), hits);

        mux.shutdown();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_false_from_handler_retires_in_place() {
        let (mut mux, reg) = start();
        let (r, w) = pipe();
        let end = Arc::new(PipeEnd {
            d: Descriptor::with_fd(DescriptorKind::Socket, r),
            hits: AtomicUsize::new(0),
            keep: AtomicBool::new(false),
            retires: AtomicUsize::new(0),
        });
        let obj: Arc<dyn Pollable> = end.clone();
        reg.advertise(obj.clone()).unwrap();
        mux.shared().request_interest(&obj, Interest::READ);
        mux.shared().wait_pass();
        write_byte(w);
        for _ in 0..200 {
            if end.retires.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(end.retires.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());
        assert_eq!(end.d.fd(), -1);
        mux.shutdown();
        unsafe {
            libc::close(w);
        }
    }

    #[test]
    fn test_mark_delete_retires_on_mux_thread() {
        let (mut mux, reg) = start();
        let (r, w) = pipe();
        let end = Arc::new(PipeEnd {
            d: Descriptor::with_fd(DescriptorKind::File, r),
            hits: AtomicUsize::new(0),
            keep: AtomicBool::new(true),
            retires: AtomicUsize::new(0),
        });
        let obj: Arc<dyn Pollable> = end.clone();
        reg.advertise(obj.clone()).unwrap();
        mux.shared().mark_delete(&obj);
        mux.shared().wait_pass();
        mux.shared().wait_pass();
        assert_eq!(end.retires.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());
        mux.shutdown();
        unsafe {
            libc::close(w);
        }
    }

    /// Destroying from the loop thread while a delete request is still
    /// queued: the descriptor is retired once, leaves no queued change and
    /// gets no readiness after `clear_and_wait` returns.
    #[test]
    fn test_destroy_right_after_mark_delete() {
        let (mut mux, reg) = start();
        let (r, w) = pipe();
        let end = Arc::new(PipeEnd {
            d: Descriptor::with_fd(DescriptorKind::Socket, r),
            hits: AtomicUsize::new(0),
            keep: AtomicBool::new(true),
            retires: AtomicUsize::new(0),
        });
        let obj: Arc<dyn Pollable> = end.clone();
        reg.advertise(obj.clone()).unwrap();
        mux.shared().request_interest(&obj, Interest::READ);
        mux.shared().wait_pass();
        mux.shared().wait_pass();
        assert!(end.d.is_polled());

        write_byte(w);
        mux.shared().mark_delete(&obj);
        mux.shared().clear_and_wait(&obj);
        mux.shared().retire(&obj);
        assert!(!end.d.is_polled());
        assert_eq!(end.d.fd(), -1);
        let hits = end.hits.load(Ordering::SeqCst);

        write_byte(w);
        mux.shared().wait_pass();
        mux.shared().wait_pass();
        assert_eq!(end.hits.load(Ordering::SeqCst), hits);
        assert_eq!(end.retires.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty());
        assert!(mux.shared().changes.is_empty());
        assert!(!end.d.is_changed());

        mux.shutdown();
        unsafe {
            libc::close(w);
        }
    }

    struct Listener {
        d: Descriptor,
    }

    impl Pollable for Listener {
        fn descriptor(&self) -> &Descriptor {
            &self.d
        }
        fn on_readiness(&self, _ready: Interest) -> bool {
            true
        }
    }

    /// Descriptor exhaustion on accept pauses the listener and raises the
    /// retry flag; the next destruction of *any* descriptor re-arms *every*
    /// listener, not only the one that failed.
    #[test]
    fn test_exhaustion_rearms_all_listeners_on_next_destroy() {
        let (mut mux, reg) = start();
        let (l1r, l1w) = pipe();
        let (l2r, l2w) = pipe();
        let (sr, sw) = pipe();
        let l1: Arc<dyn Pollable> = Arc::new(Listener { d: Descriptor::with_fd(DescriptorKind::Listener, l1r) });
        let l2: Arc<dyn Pollable> = Arc::new(Listener { d: Descriptor::with_fd(DescriptorKind::Listener, l2r) });
        let sock: Arc<dyn Pollable> = Arc::new(Listener { d: Descriptor::with_fd(DescriptorKind::Socket, sr) });
        for obj in [&l1, &l2, &sock] {
            reg.advertise(obj.clone()).unwrap();
        }

        // Both listeners paused (the second one never failed itself).
        mux.shared().request_interest(&l1, Interest::NONE);
        mux.shared().request_interest(&l2, Interest::NONE);
        reg.set_retry_accepts();

        mux.shared().retire(&sock);
        assert_eq!(l1.descriptor().requested(), Interest::READ);
        assert_eq!(l2.descriptor().requested(), Interest::READ);
        assert!(!reg.take_retry_accepts());

        mux.shared().wait_pass();
        mux.shared().wait_pass();
        assert!(l1.descriptor().is_polled());
        assert!(l2.descriptor().is_polled());

        mux.shutdown();
        for obj in [&l1, &l2] {
            mux.shared().retire(obj);
        }
        unsafe {
            libc::close(l1w);
            libc::close(l2w);
            libc::close(sw);
        }
    }

    struct Ticker {
        fired: AtomicUsize,
    }

    impl PollSource for Ticker {
        fn handles(&self, _out: &mut Vec<(RawFd, Interest)>) {}
        fn next_timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(5))
        }
        fn process(&self, ready: &[(RawFd, Interest)]) {
            assert!(ready.is_empty());
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_poll_source_timeout() {
        let (mut mux, _reg) = start();
        let ticker = Arc::new(Ticker { fired: AtomicUsize::new(0) });
        mux.shared().add_source(ticker.clone());
        thread::sleep(Duration::from_millis(60));
        assert!(ticker.fired.load(Ordering::SeqCst) >= 2);
        let src: Arc<dyn PollSource> = ticker.clone();
        mux.shared().remove_source(&src);
        mux.shutdown();
    }
}
