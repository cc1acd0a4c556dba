//! Blocking operations: run on a worker, deliver on the loop.
//!
//! A [`BlockingOp`] is split in two halves. `run_blocking` executes on a
//! `lowloop-worker-N` thread and produces an `Output`; the output travels
//! back inside the same job object, which the worker posts as a completion.
//! On the loop thread the continuation retained under the job's [`SlotId`]
//! consumes it.
//!
//! ```text
//!   loop: submit_blocking ──► pool lane ──► worker: run_blocking
//!                                                 │ post
//!   loop: continuation(output) ◄── completion ◄───┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use lowloop_core::{LoopError, LoopResult, QueueLink, SlotId};

use crate::completion::LoopCallback;
use crate::engine::EngineHandle;
use crate::event_loop::LoopContext;
use crate::pool::{Lane, WorkItem};

/// One blocking operation.
pub trait BlockingOp: Send + 'static {
    type Output: Send + 'static;

    fn lane(&self) -> Lane;

    /// Runs on a worker thread.
    fn run_blocking(&mut self) -> Self::Output;
}

/// Closure-backed op, for `run_on_worker`.
pub struct FnOp<F> {
    lane: Lane,
    f: Option<F>,
}

impl<F> FnOp<F> {
    pub fn new(lane: Lane, f: F) -> Self {
        FnOp { lane, f: Some(f) }
    }
}

impl<F, R> BlockingOp for FnOp<F>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    type Output = Option<R>;

    fn lane(&self) -> Lane {
        self.lane
    }

    fn run_blocking(&mut self) -> Option<R> {
        self.f.take().map(|f| f())
    }
}

struct BlockingJob<Op: BlockingOp> {
    work_link: QueueLink,
    loop_link: QueueLink,
    op: Mutex<Option<Op>>,
    output: Mutex<Option<Op::Output>>,
    deliver: SlotId,
    done: AtomicBool,
}

impl<Op: BlockingOp> WorkItem for BlockingJob<Op> {
    fn link(&self) -> &QueueLink {
        &self.work_link
    }

    fn run_blocking(self: Arc<Self>) -> Option<Arc<dyn LoopCallback>> {
        let op = self.op.lock().unwrap_or_else(|e| e.into_inner()).take();
        let mut op = op?;
        let out = op.run_blocking();
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = Some(out);
        Some(self)
    }
}

impl<Op: BlockingOp> LoopCallback for BlockingJob<Op> {
    fn link(&self) -> &QueueLink {
        &self.loop_link
    }

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        cx.run_ref_add(-1);
        let out = self.output.lock().unwrap_or_else(|e| e.into_inner()).take();
        match out {
            Some(out) => cx.complete::<Op::Output>(self.deliver, out)?,
            None => {
                cx.release(self.deliver);
            }
        }
        Ok(false)
    }
}

trait DoneFlag: Send + Sync {
    fn done(&self) -> &AtomicBool;
}

impl<Op: BlockingOp> DoneFlag for BlockingJob<Op> {
    fn done(&self) -> &AtomicBool {
        &self.done
    }
}

/// Handle to a submitted job, for cancellation.
pub struct PendingJob {
    work: Arc<dyn WorkItem>,
    completion: Arc<dyn LoopCallback>,
    flag: Arc<dyn DoneFlag>,
    deliver: SlotId,
}

impl PendingJob {
    /// Whether the continuation already ran or the job was cancelled.
    pub fn is_done(&self) -> bool {
        self.flag.done().load(Ordering::Acquire)
    }

    /// Cancel synchronously. Once this returns the continuation will not
    /// run. Returns `false` if it already ran.
    pub fn cancel(&self, cx: &mut LoopContext) -> bool {
        let handle = cx.handle().clone();
        handle.cancel_work(&self.work);
        handle.cancel(&self.completion);
        if self.flag.done().swap(true, Ordering::AcqRel) {
            return false;
        }
        cx.run_ref_add(-1);
        cx.release(self.deliver);
        true
    }
}

impl LoopContext {
    /// Run `op` on a worker and hand its output to `cb` on this thread. The
    /// pending job keeps the loop alive.
    pub fn submit_blocking<Op: BlockingOp>(
        &mut self,
        op: Op,
        cb: impl FnOnce(&mut LoopContext, Op::Output) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let lane = op.lane();
        let deliver = self.retain_callback::<Op::Output>(cb)?;
        let job = Arc::new(BlockingJob {
            work_link: QueueLink::new(),
            loop_link: QueueLink::new(),
            op: Mutex::new(Some(op)),
            output: Mutex::new(None),
            deliver,
            done: AtomicBool::new(false),
        });
        let work: Arc<dyn WorkItem> = job.clone();
        if let Err(e) = self.handle().submit(work.clone(), lane) {
            self.release(deliver);
            return Err(e);
        }
        self.run_ref_add(1);
        Ok(PendingJob {
            work,
            completion: job.clone(),
            flag: job,
            deliver,
        })
    }

    /// Run a closure on a worker; `cb` receives its return value.
    pub fn run_on_worker<R: Send + 'static>(
        &mut self,
        lane: Lane,
        f: impl FnOnce() -> R + Send + 'static,
        cb: impl FnOnce(&mut LoopContext, R) -> LoopResult<()> + 'static,
    ) -> LoopResult<PendingJob> {
        let op = FnOp { lane, f: Some(f) };
        self.submit_blocking(op, move |cx, out: Option<R>| match out {
            Some(r) => cb(cx, r),
            None => Err(LoopError::os(libc::ECANCELED, "run_on_worker")),
        })
    }
}

type LoopFn = Box<dyn FnOnce(&mut LoopContext) -> LoopResult<()> + Send>;

struct LoopTask {
    link: QueueLink,
    f: Mutex<Option<LoopFn>>,
}

impl LoopCallback for LoopTask {
    fn link(&self) -> &QueueLink {
        &self.link
    }

    fn on_loop(&self, cx: &mut LoopContext) -> LoopResult<bool> {
        let f = self.f.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(f) = f {
            f(cx)?;
        }
        Ok(false)
    }
}

impl EngineHandle {
    /// Queue `f` to run on the loop thread. Callable from any thread.
    pub fn run_on_loop(
        &self,
        f: impl FnOnce(&mut LoopContext) -> LoopResult<()> + Send + 'static,
    ) -> Arc<dyn LoopCallback> {
        let f: LoopFn = Box::new(f);
        let task: Arc<dyn LoopCallback> = Arc::new(LoopTask {
            link: QueueLink::new(),
            f: Mutex::new(Some(f)),
        });
        self.post(task.clone());
        task
    }

    /// Run `op` on a worker and block the caller until it finishes.
    pub fn run_sync<Op: BlockingOp>(&self, op: Op) -> LoopResult<Op::Output> {
        let job = Arc::new(SyncJob {
            link: QueueLink::new(),
            lane: op.lane(),
            state: Mutex::new(SyncState {
                op: Some(op),
                output: None,
            }),
            cond: Condvar::new(),
        });
        let lane = job.lane;
        self.submit(job.clone(), lane)?;
        let mut st = job.state.lock().unwrap_or_else(|e| e.into_inner());
        while st.output.is_none() {
            st = job.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.output
            .take()
            .ok_or_else(|| LoopError::os(libc::ECANCELED, "run_sync"))
    }
}

struct SyncState<Op: BlockingOp> {
    op: Option<Op>,
    output: Option<Op::Output>,
}

struct SyncJob<Op: BlockingOp> {
    link: QueueLink,
    lane: Lane,
    state: Mutex<SyncState<Op>>,
    cond: Condvar,
}

impl<Op: BlockingOp> WorkItem for SyncJob<Op> {
    fn link(&self) -> &QueueLink {
        &self.link
    }

    fn run_blocking(self: Arc<Self>) -> Option<Arc<dyn LoopCallback>> {
        let op = self.state.lock().unwrap_or_else(|e| e.into_inner()).op.take();
        if let Some(mut op) = op {
            let out = op.run_blocking();
            self.state.lock().unwrap_or_else(|e| e.into_inner()).output = Some(out);
        }
        self.cond.notify_all();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::event_loop::DefaultHost;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    fn engine() -> Engine {
        let config = EngineConfig::new()
            .num_workers(2)
            .install_signals(false)
            .stdio_baseline(false);
        Engine::new(config, Box::new(DefaultHost)).unwrap()
    }

    struct Square(u64);

    impl BlockingOp for Square {
        type Output = u64;
        fn lane(&self) -> Lane {
            Lane::Read
        }
        fn run_blocking(&mut self) -> u64 {
            self.0 * self.0
        }
    }

    #[test]
    fn test_submit_blocking_delivers_on_loop() {
        let mut e = engine();
        let got = Rc::new(Cell::new(0));
        let loop_thread = std::thread::current().id();
        e.with_context(|cx| {
            let got = got.clone();
            cx.submit_blocking(Square(12), move |_, out| {
                assert_eq!(std::thread::current().id(), loop_thread);
                got.set(out);
                Ok(())
            })
            .unwrap();
        });
        assert_eq!(e.handle().run_ref(), 1);
        e.run().unwrap();
        assert_eq!(got.get(), 144);
        assert_eq!(e.handle().run_ref(), 0);
    }

    #[test]
    fn test_run_on_worker_runs_off_loop() {
        let mut e = engine();
        let name = Rc::new(RefCell::new(String::new()));
        e.with_context(|cx| {
            let name = name.clone();
            cx.run_on_worker(
                Lane::Modify,
                || std::thread::current().name().unwrap_or("").to_string(),
                move |_, n| {
                    *name.borrow_mut() = n;
                    Ok(())
                },
            )
            .unwrap();
        });
        e.run().unwrap();
        assert!(name.borrow().starts_with("lowloop-worker-"));
    }

    #[test]
    fn test_cancel_before_delivery() {
        let mut e = engine();
        let fired = Rc::new(Cell::new(false));
        e.with_context(|cx| {
            let f = fired.clone();
            let job = cx
                .run_on_worker(
                    Lane::Read,
                    || std::thread::sleep(Duration::from_millis(20)),
                    move |_, ()| {
                        f.set(true);
                        Ok(())
                    },
                )
                .unwrap();
            assert!(job.cancel(cx));
            assert!(job.is_done());
            assert!(!job.cancel(cx));
        });
        assert_eq!(e.handle().run_ref(), 0);
        e.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn test_run_on_loop_from_other_thread() {
        let mut e = engine();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        e.handle().run_ref_add(1);
        let h = e.handle().clone();
        let hits2 = hits.clone();
        let t = std::thread::spawn(move || {
            h.run_on_loop(move |cx| {
                hits2.fetch_add(1, Ordering::SeqCst);
                cx.run_ref_add(-1);
                Ok(())
            });
        });
        e.run().unwrap();
        t.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_sync_blocks_for_result() {
        let e = engine();
        assert_eq!(e.handle().run_sync(Square(9)).unwrap(), 81);
    }
}
