//! The engine: one event loop, one multiplexer thread, N workers.
//!
//! ```text
//!   EngineHandle (Clone, Send) ─┬─ Registry
//!                               ├─ MuxShared ──── lowloop-mux thread
//!                               ├─ PoolShared ─── lowloop-worker-N threads
//!                               ├─ CompletionQueue
//!                               └─ run-ref counter
//!
//!   Engine (owns threads) ── EventLoop (caller's thread) ── LoopContext
//! ```
//!
//! Everything cross-thread hangs off an explicit `EngineShared`; there are
//! no globals apart from the signal-to-wake translation.

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lowloop_core::{kdebug, kinfo, kprint, Interest, LoopResult, Pollable};

use crate::completion::{CompletionQueue, LoopCallback};
use crate::config::EngineConfig;
use crate::event_loop::{EventLoop, LoopContext, LoopHost};
use crate::mux::{Multiplexer, MuxShared, PollSource};
use crate::pool::{Lane, PoolShared, WorkItem, WorkerPool};
use crate::registry::Registry;
use crate::{signal, stdio};

pub struct EngineShared {
    config: EngineConfig,
    registry: Arc<Registry>,
    completions: Arc<CompletionQueue>,
    mux: Arc<MuxShared>,
    pool: Arc<PoolShared>,
    run_ref: AtomicIsize,
    stop_requested: AtomicBool,
}

/// Cheap, cloneable, `Send` handle to the engine's shared state.
#[derive(Clone)]
pub struct EngineHandle(Arc<EngineShared>);

impl EngineHandle {
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.0.config
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    // ── descriptors ──

    pub fn advertise(&self, obj: Arc<dyn Pollable>) -> LoopResult<i32> {
        self.0.registry.advertise(obj)
    }

    pub fn request_interest(&self, obj: &Arc<dyn Pollable>, mask: Interest) {
        self.0.mux.request_interest(obj, mask);
    }

    /// Loop thread only. Blocks until the multiplexer dropped `obj`.
    pub fn clear_and_wait(&self, obj: &Arc<dyn Pollable>) {
        self.0.mux.clear_and_wait(obj);
    }

    pub fn mark_delete(&self, obj: &Arc<dyn Pollable>) {
        self.0.mux.mark_delete(obj);
    }

    /// Retire on the calling thread.
    pub fn retire(&self, obj: &Arc<dyn Pollable>) {
        self.0.mux.retire(obj);
    }

    /// Stop polling `obj` and retire it.
    pub fn destroy(&self, obj: &Arc<dyn Pollable>) {
        self.clear_and_wait(obj);
        self.retire(obj);
    }

    pub fn add_poll_source(&self, src: Arc<dyn PollSource>) {
        self.0.mux.add_source(src);
    }

    pub fn remove_poll_source(&self, src: &Arc<dyn PollSource>) {
        self.0.mux.remove_source(src);
    }

    // ── completions ──

    /// Queue `cb` for the loop thread. Callable from any thread.
    pub fn post(&self, cb: Arc<dyn LoopCallback>) -> bool {
        self.0.completions.post(cb)
    }

    pub fn cancel(&self, cb: &Arc<dyn LoopCallback>) -> bool {
        self.0.completions.cancel(cb)
    }

    pub(crate) fn pop_completion(&self) -> Option<Arc<dyn LoopCallback>> {
        self.0.completions.pop()
    }

    pub(crate) fn completions_empty(&self) -> bool {
        self.0.completions.is_empty()
    }

    pub(crate) fn wait_for_completion(&self, timeout: Option<Duration>) {
        let shared = &self.0;
        shared
            .completions
            .wait(timeout, || shared.stop_requested.load(Ordering::Acquire));
    }

    // ── workers ──

    pub fn submit(&self, item: Arc<dyn WorkItem>, lane: Lane) -> LoopResult<bool> {
        self.0.pool.submit(item, lane)
    }

    /// Synchronous: once this returns the item is neither queued nor running.
    pub fn cancel_work(&self, item: &Arc<dyn WorkItem>) -> bool {
        self.0.pool.cancel(item)
    }

    // ── liveness ──

    #[inline]
    pub fn run_ref_add(&self, delta: isize) {
        self.0.run_ref.fetch_add(delta, Ordering::AcqRel);
    }

    #[inline]
    pub fn run_ref(&self) -> isize {
        self.0.run_ref.load(Ordering::Acquire)
    }

    pub(crate) fn run_ref_set(&self, value: isize) {
        self.0.run_ref.store(value, Ordering::Release);
    }

    /// Ask the loop to return from `run`. Callable from any thread.
    pub fn stop_loop(&self) {
        self.0.stop_requested.store(true, Ordering::Release);
        self.0.completions.interrupt();
    }

    pub(crate) fn take_stop_request(&self) -> bool {
        self.0.stop_requested.swap(false, Ordering::AcqRel)
    }
}

pub struct Engine {
    handle: EngineHandle,
    mux: Multiplexer,
    pool: WorkerPool,
    event_loop: EventLoop,
    signals_installed: bool,
    shut_down: bool,
}

impl Engine {
    /// Start the multiplexer and worker threads. Any failure tears down
    /// what was started and reports a fatal error.
    pub fn new(config: EngineConfig, host: Box<dyn LoopHost>) -> LoopResult<Engine> {
        kprint::init();
        config.validate()?;

        let registry = Arc::new(Registry::new());
        let completions = Arc::new(CompletionQueue::new());
        let mux_shared = Arc::new(MuxShared::new(
            registry.clone(),
            completions.clone(),
            config.max_poll_wait,
        )?);
        let mut mux = Multiplexer::start(mux_shared.clone())?;
        let pool = match WorkerPool::start(config.num_workers, completions.clone()) {
            Ok(pool) => pool,
            Err(e) => {
                mux.shutdown();
                return Err(e);
            }
        };

        let handle = EngineHandle(Arc::new(EngineShared {
            config: config.clone(),
            registry,
            completions,
            mux: mux_shared.clone(),
            pool: pool.shared().clone(),
            run_ref: AtomicIsize::new(0),
            stop_requested: AtomicBool::new(false),
        }));

        let cx = LoopContext::new(handle.clone(), config.max_slots);
        let mut engine = Engine {
            handle,
            mux,
            pool,
            event_loop: EventLoop::new(cx, host),
            signals_installed: false,
            shut_down: false,
        };

        if config.install_signals {
            signal::install(mux_shared.wake_write_fd())?;
            engine.signals_installed = true;
        }
        if config.stdio_baseline {
            stdio::install(&engine.handle)?;
        }
        kinfo!("engine started with {} workers", config.num_workers);
        Ok(engine)
    }

    #[inline]
    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    pub fn set_host(&mut self, host: Box<dyn LoopHost>) {
        self.event_loop.set_host(host);
    }

    /// Run on the calling thread until idle or stopped.
    pub fn run(&mut self) -> LoopResult<i32> {
        self.event_loop.run()
    }

    /// Loop-thread access outside of `run` (setup, tests).
    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut LoopContext) -> R) -> R {
        f(self.event_loop.context())
    }

    /// Warm reset: park the threads, drop everything not marked
    /// survive-reset, recreate the stdio baseline and resume.
    pub fn reset(&mut self) -> LoopResult<()> {
        let shared = self.handle.0.clone();
        shared.mux.park();
        shared.pool.park();

        let dropped_callbacks = shared.completions.drain_non_survivors();
        let dropped_work = shared.pool.drain_non_survivors();
        let doomed = shared.registry.drain_non_survivors();
        for obj in &doomed {
            shared.mux.retire(obj);
        }
        shared.mux.drain_changes_for_reset();
        self.event_loop.context().reset();
        shared.stop_requested.store(false, Ordering::Release);
        kdebug!(
            "reset dropped {} completions, {} work items, {} descriptors",
            dropped_callbacks.len(),
            dropped_work.len(),
            doomed.len()
        );
        drop(dropped_callbacks);
        drop(dropped_work);
        drop(doomed);

        let result = if shared.config.stdio_baseline {
            stdio::install(&self.handle)
        } else {
            Ok(())
        };
        shared.mux.unpark();
        shared.pool.unpark();
        result
    }

    /// Stop and join every thread, then destroy every descriptor. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let shared = self.handle.0.clone();

        self.pool.shutdown();
        self.mux.shutdown();
        if self.signals_installed {
            signal::uninstall();
        }

        for obj in shared.registry.drain_all() {
            shared.mux.retire(&obj);
        }
        drop(shared.completions.drain_all());
        drop(shared.pool.drain_non_survivors());
        shared.mux.drain_changes();
        self.event_loop.context().teardown();
        kdebug!("engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
