//! The event loop: the one thread that runs callbacks.
//!
//! One iteration:
//! 1. drain next-tick calls
//! 2. if nothing keeps the loop alive, emit before-exit; if still nothing,
//!    emit exit and stop
//! 3. run one completion
//! 4. otherwise run the nearest due timer
//! 5. otherwise block until the next deadline or a post
//!
//! Callbacks never cross threads. They are parked in the [`SlotTable`] and
//! other threads carry only the [`SlotId`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use lowloop_core::{
    kdebug, kwarn, Fetched, LoopError, LoopResult, QueueLink, SlotId, SlotTable,
};

use crate::completion::LoopCallback;
use crate::engine::EngineHandle;
use crate::signal;
use crate::timer::{Fired, LoopClock, TimerEntry, TimerTable};

/// One-shot continuation, run on the loop thread.
pub type Callback<T> = Box<dyn FnOnce(&mut LoopContext, T) -> LoopResult<()>>;

/// Persistent handler (data events, accept, repeating timers).
pub type Handler<T> = Box<dyn FnMut(&mut LoopContext, T) -> LoopResult<()>>;

type Tick = Box<dyn FnOnce(&mut LoopContext) -> LoopResult<()>>;

/// Hooks the embedding application gives the loop.
pub trait LoopHost {
    /// Nothing keeps the loop alive any more; may schedule more work.
    fn before_exit(&mut self, _cx: &mut LoopContext) -> LoopResult<()> {
        Ok(())
    }

    /// Final notification before `run` returns.
    fn exit(&mut self, _cx: &mut LoopContext) {}

    /// An error nobody handled. Return `true` to keep running.
    fn uncaught_error(&mut self, _cx: &mut LoopContext, err: &LoopError) -> bool {
        lowloop_core::kerror!("uncaught error: {} [{}]", err, err.code());
        false
    }

    /// A process signal arrived. Returning `false` for TERM/INT/HUP restores
    /// the default disposition and re-raises it.
    fn signal(&mut self, _cx: &mut LoopContext, _signum: i32) -> bool {
        false
    }
}

/// Host that takes every default.
pub struct DefaultHost;

impl LoopHost for DefaultHost {}

/// Loop-thread state handed to every callback.
pub struct LoopContext {
    handle: EngineHandle,
    slots: SlotTable,
    timers: TimerTable,
    clock: LoopClock,
    ticks: VecDeque<Tick>,
    signals: Vec<i32>,
    stop: bool,
    exit_code: i32,
    rejection_warned: bool,
}

impl LoopContext {
    pub(crate) fn new(handle: EngineHandle, max_slots: usize) -> Self {
        let clock = LoopClock::new();
        let mut timers = TimerTable::new();
        timers.set_epoch(clock.now());
        LoopContext {
            handle,
            slots: SlotTable::new(max_slots),
            timers,
            clock,
            ticks: VecDeque::new(),
            signals: Vec::new(),
            stop: false,
            exit_code: 0,
            rejection_warned: false,
        }
    }

    #[inline]
    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Loop clock, milliseconds.
    #[inline]
    pub fn now(&self) -> u32 {
        self.clock.now()
    }

    // ── retained values ──

    pub fn retain<T: 'static>(&mut self, value: T) -> LoopResult<SlotId> {
        self.slots.retain_value(value)
    }

    pub fn release(&mut self, id: SlotId) -> bool {
        self.slots.release(id)
    }

    pub fn fetch(&mut self, id: SlotId, consume: bool) -> Option<Fetched<'_>> {
        self.slots.fetch(id, consume)
    }

    pub fn slots(&mut self) -> &mut SlotTable {
        &mut self.slots
    }

    /// Retain a one-shot continuation.
    pub fn retain_callback<T: 'static>(
        &mut self,
        f: impl FnOnce(&mut LoopContext, T) -> LoopResult<()> + 'static,
    ) -> LoopResult<SlotId> {
        let cb: Callback<T> = Box::new(f);
        self.slots.retain_value(cb)
    }

    /// Retain a persistent handler.
    pub fn retain_handler<T: 'static>(
        &mut self,
        f: impl FnMut(&mut LoopContext, T) -> LoopResult<()> + 'static,
    ) -> LoopResult<SlotId> {
        let h: Handler<T> = Box::new(f);
        self.slots.retain_value(h)
    }

    /// Consume the continuation in `id` and run it. A missing slot (already
    /// released) is not an error.
    pub fn complete<T: 'static>(&mut self, id: SlotId, value: T) -> LoopResult<()> {
        match self.slots.take_as::<Callback<T>>(id) {
            Some(cb) => cb(self, value),
            None => Ok(()),
        }
    }

    /// Run the handler in `id`, keeping it retained.
    pub fn dispatch<T: 'static>(&mut self, id: SlotId, value: T) -> LoopResult<()> {
        let Some(mut h) = self.slots.lend::<Handler<T>>(id) else {
            return Ok(());
        };
        let result = h(self, value);
        self.slots.put_back(id, h);
        result
    }

    // ── next tick ──

    pub fn next_tick(&mut self, f: impl FnOnce(&mut LoopContext) -> LoopResult<()> + 'static) {
        self.ticks.push_back(Box::new(f));
    }

    fn drain_ticks(&mut self) -> LoopResult<()> {
        while let Some(tick) = self.ticks.pop_front() {
            tick(self)?;
        }
        Ok(())
    }

    // ── timers ──

    fn add_timer(&mut self, id: SlotId, entry: TimerEntry) -> SlotId {
        if entry.refed {
            self.handle.run_ref_add(1);
        }
        self.timers.insert(id, entry);
        id
    }

    /// Run `f` once after `delay_ms`. The returned id cancels it.
    pub fn set_timeout(
        &mut self,
        delay_ms: i64,
        f: impl FnOnce(&mut LoopContext) -> LoopResult<()> + 'static,
    ) -> LoopResult<SlotId> {
        let id = self.retain_callback::<()>(move |cx, ()| f(cx))?;
        let entry = TimerEntry::new(self.now(), delay_ms, true);
        Ok(self.add_timer(id, entry))
    }

    /// Run `f` every `interval_ms`.
    pub fn set_interval(
        &mut self,
        interval_ms: i64,
        mut f: impl FnMut(&mut LoopContext) -> LoopResult<()> + 'static,
    ) -> LoopResult<SlotId> {
        let id = self.retain_handler::<()>(move |cx, ()| f(cx))?;
        let entry = TimerEntry::new(self.now(), interval_ms, false);
        Ok(self.add_timer(id, entry))
    }

    /// Engine-internal repeating timer; survives a warm reset and does not
    /// keep the loop alive.
    pub fn set_native_interval(
        &mut self,
        interval_ms: i64,
        mut f: impl FnMut(&mut LoopContext) -> LoopResult<()> + 'static,
    ) -> LoopResult<SlotId> {
        let id = self.retain_handler::<()>(move |cx, ()| f(cx))?;
        let mut entry = TimerEntry::new(self.now(), interval_ms, false).native(true);
        entry.refed = false;
        Ok(self.add_timer(id, entry))
    }

    /// Cancel a timer. Synchronous: it will not fire after this returns.
    pub fn clear_timer(&mut self, id: SlotId) -> bool {
        let Some(entry) = self.timers.cancel(id) else {
            return false;
        };
        if entry.refed {
            self.handle.run_ref_add(-1);
        }
        self.slots.release(id);
        true
    }

    /// Toggle whether a timer keeps the loop alive.
    pub fn timer_ref(&mut self, id: SlotId, on: bool) -> bool {
        match self.timers.set_ref(id, on) {
            Some(delta) => {
                if delta != 0 {
                    self.handle.run_ref_add(delta);
                }
                true
            }
            None => false,
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    fn fire(&mut self, fired: Fired) -> LoopResult<()> {
        if fired.oneshot {
            if fired.refed {
                self.handle.run_ref_add(-1);
            }
            self.complete::<()>(fired.id, ())
        } else {
            self.dispatch::<()>(fired.id, ())
        }
    }

    // ── liveness ──

    pub fn run_ref_add(&self, delta: isize) {
        self.handle.run_ref_add(delta);
    }

    /// Ask the loop to stop after the current callback.
    pub fn stop(&mut self, code: i32) {
        self.stop = true;
        self.exit_code = code;
    }

    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = code;
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Warn once per engine about a rejected promise nobody observed.
    pub fn report_unhandled_rejection(&mut self, err: &LoopError) {
        if self.rejection_warned {
            return;
        }
        self.rejection_warned = true;
        kwarn!("unhandled rejection: {} [{}]", err, err.code());
    }

    fn is_idle(&self) -> bool {
        self.handle.run_ref() <= 0
            && self.ticks.is_empty()
            && self.signals.is_empty()
            && self.handle.completions_empty()
    }

    pub(crate) fn push_signal(&mut self, signum: i32) {
        self.signals.push(signum);
    }

    /// Drop script state for a warm reset. Native timers and their
    /// handlers stay.
    pub(crate) fn reset(&mut self) {
        self.timers.drain_non_native();
        let keep = self.timers.native_ids();
        self.slots.clear_except(&keep);
        self.ticks.clear();
        self.signals.clear();
        self.stop = false;
        self.exit_code = 0;
        self.rejection_warned = false;
        let refed = self.timers.refed_count() as isize;
        self.handle.run_ref_set(refed);
    }

    pub(crate) fn teardown(&mut self) {
        for (id, _) in self.timers.drain_non_native() {
            self.slots.release(id);
        }
        for id in self.timers.native_ids() {
            self.timers.cancel(id);
        }
        self.slots.clear();
        self.ticks.clear();
        self.signals.clear();
    }
}

/// A signal number relayed by the multiplexer.
pub struct SignalEvent {
    link: QueueLink,
    signum: i32,
}

impl SignalEvent {
    pub fn new(signum: i32) -> Arc<dyn LoopCallback> {
        Arc::new(SignalEvent {
            link: QueueLink::new(),
            signum,
        })
    }
}

impl LoopCallback for SignalEvent {
    fn link(&self) -> &QueueLink {
        &self.link
    }

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool> {
        cx.push_signal(self.signum);
        Ok(false)
    }
}

pub struct EventLoop {
    cx: LoopContext,
    host: Box<dyn LoopHost>,
}

impl EventLoop {
    pub(crate) fn new(cx: LoopContext, host: Box<dyn LoopHost>) -> Self {
        EventLoop { cx, host }
    }

    pub fn context(&mut self) -> &mut LoopContext {
        &mut self.cx
    }

    pub(crate) fn set_host(&mut self, host: Box<dyn LoopHost>) {
        self.host = host;
    }

    /// Run until stopped or idle. Returns the exit code; an uncaught error
    /// the host declines to absorb is returned as `Err`.
    pub fn run(&mut self) -> LoopResult<i32> {
        kdebug!("event loop running");
        loop {
            match self.iterate() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    if !self.host.uncaught_error(&mut self.cx, &err) {
                        return Err(err);
                    }
                }
            }
        }
        self.cx.stop = false;
        Ok(self.cx.exit_code)
    }

    fn iterate(&mut self) -> LoopResult<bool> {
        if self.cx.stop || self.cx.handle.take_stop_request() {
            return Ok(false);
        }
        self.cx.drain_ticks()?;
        self.dispatch_signals()?;

        if self.cx.is_idle() {
            self.host.before_exit(&mut self.cx)?;
            self.cx.drain_ticks()?;
            if self.cx.is_idle() {
                self.host.exit(&mut self.cx);
                return Ok(false);
            }
        }

        if let Some(cb) = self.cx.handle.pop_completion() {
            self.run_completion(cb)?;
            return self.dispatch_signals().map(|_| true);
        }

        let now = self.cx.now();
        if let Some(fired) = self.cx.timers.pop_due(now) {
            self.cx.fire(fired)?;
            return Ok(true);
        }

        if !self.cx.ticks.is_empty() || self.cx.stop {
            return Ok(true);
        }
        let wait = self
            .cx
            .timers
            .next_wait(now)
            .map(|ms| Duration::from_millis(ms.max(0) as u64));
        self.cx.handle.wait_for_completion(wait);
        Ok(true)
    }

    fn run_completion(&mut self, cb: Arc<dyn LoopCallback>) -> LoopResult<()> {
        if !cb.on_loop(&mut self.cx)? {
            cb.on_finish(&mut self.cx);
        }
        Ok(())
    }

    fn dispatch_signals(&mut self) -> LoopResult<()> {
        while !self.cx.signals.is_empty() {
            let signum = self.cx.signals.remove(0);
            let name = signal::signal_name(signum).unwrap_or("?");
            kdebug!("dispatching {}", name);
            if !self.host.signal(&mut self.cx, signum) && signal::is_terminating(signum) {
                signal::restore_default_and_raise(signum)?;
            }
        }
        Ok(())
    }
}
