//! `WorkerPool`: blocking-syscall threads draining two priority lanes.
//!
//! Spawns N OS threads at engine start. Workers pop the read lane before
//! the modify lane, FIFO within a lane, under one mutex/condvar pair, and
//! sleep when both lanes are empty. A finished item either hands back a
//! completion (posted to the event loop) or is dropped.
//!
//! No dynamic scaling.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use lowloop_core::{kdebug, LoopError, LoopResult, QueueLink};

use crate::completion::{CompletionQueue, LoopCallback};

/// Worker lane. Read-only work is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Read = 0,
    Modify = 1,
}

/// A blocking operation consumed by exactly one worker.
pub trait WorkItem: Send + Sync + 'static {
    fn link(&self) -> &QueueLink;

    /// Runs on a worker thread and may block. `Some` is posted to the event
    /// loop; `None` means the item is done.
    fn run_blocking(self: Arc<Self>) -> Option<Arc<dyn LoopCallback>>;

    fn survives_reset(&self) -> bool {
        false
    }
}

#[inline]
fn addr(item: &Arc<dyn WorkItem>) -> usize {
    Arc::as_ptr(item) as *const () as usize
}

struct PoolState {
    lanes: [VecDeque<Arc<dyn WorkItem>>; 2],
    /// Items currently executing, by address.
    in_flight: Vec<usize>,
    stop: bool,
    park: bool,
    parked: usize,
}

impl PoolState {
    /// First item not already executing, read lane first.
    fn pop_runnable(&mut self) -> Option<Arc<dyn WorkItem>> {
        let in_flight = &self.in_flight;
        for lane in self.lanes.iter_mut() {
            let pos = lane.iter().position(|it| !in_flight.contains(&addr(it)));
            if let Some(pos) = pos {
                return lane.remove(pos);
            }
        }
        None
    }
}

pub struct PoolShared {
    state: Mutex<PoolState>,
    /// Work arrived, or stop/park changed.
    work_cond: Condvar,
    /// An item finished, or a worker parked.
    idle_cond: Condvar,
    completions: Arc<CompletionQueue>,
    total: usize,
}

impl PoolShared {
    pub fn new(total: usize, completions: Arc<CompletionQueue>) -> Self {
        PoolShared {
            state: Mutex::new(PoolState {
                lanes: [VecDeque::new(), VecDeque::new()],
                in_flight: Vec::new(),
                stop: false,
                park: false,
                parked: 0,
            }),
            work_cond: Condvar::new(),
            idle_cond: Condvar::new(),
            completions,
            total,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `item` on `lane`. Returns `false` if it was already queued.
    pub fn submit(&self, item: Arc<dyn WorkItem>, lane: Lane) -> LoopResult<bool> {
        let mut st = self.lock();
        if st.stop {
            return Err(LoopError::os(libc::ECANCELED, "submit"));
        }
        if !item.link().try_link() {
            return Ok(false);
        }
        st.lanes[lane as usize].push_back(item);
        drop(st);
        self.work_cond.notify_one();
        Ok(true)
    }

    /// Remove `item` from its lane; if a worker is running it, wait until
    /// it finishes. Returns `true` if the item was still queued.
    pub fn cancel(&self, item: &Arc<dyn WorkItem>) -> bool {
        let key = addr(item);
        let mut st = self.lock();
        let mut removed = false;
        for lane in st.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|it| addr(it) == key) {
                if let Some(it) = lane.remove(pos) {
                    it.link().unlink();
                }
                removed = true;
                break;
            }
        }
        while st.in_flight.contains(&key) && !st.stop {
            st = self.idle_cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        removed
    }

    pub fn queued(&self) -> usize {
        let st = self.lock();
        st.lanes[0].len() + st.lanes[1].len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Stop handing out work and wait until every worker is idle.
    pub fn park(&self) {
        let mut st = self.lock();
        st.park = true;
        self.work_cond.notify_all();
        while st.parked < self.total && !st.stop {
            st = self.idle_cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn unpark(&self) {
        let mut st = self.lock();
        st.park = false;
        drop(st);
        self.work_cond.notify_all();
    }

    /// Remove every queued item not marked survive-reset.
    pub fn drain_non_survivors(&self) -> Vec<Arc<dyn WorkItem>> {
        let mut st = self.lock();
        let mut dropped = Vec::new();
        for lane in st.lanes.iter_mut() {
            lane.retain(|it| {
                if it.survives_reset() {
                    return true;
                }
                it.link().unlink();
                dropped.push(it.clone());
                false
            });
        }
        dropped
    }

    pub fn stop(&self) {
        let mut st = self.lock();
        st.stop = true;
        drop(st);
        self.work_cond.notify_all();
        self.idle_cond.notify_all();
    }
}

/// Worker threads plus their shared state.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers. On spawn failure the already started workers are
    /// stopped and joined before the error is returned.
    pub fn start(n: usize, completions: Arc<CompletionQueue>) -> LoopResult<Self> {
        let n = n.max(1);
        let shared = Arc::new(PoolShared::new(n, completions));
        let mut pool = WorkerPool {
            shared: shared.clone(),
            handles: Vec::with_capacity(n),
        };
        for worker_id in 0..n {
            let shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("lowloop-worker-{}", worker_id))
                .spawn(move || worker_loop(shared, worker_id));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(LoopError::Fatal(format!("spawn worker {}: {}", worker_id, e)));
                }
            }
        }
        Ok(pool)
    }

    pub fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Stop flag, broadcast, join every worker.
    pub fn shutdown(&mut self) {
        self.shared.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>, worker_id: usize) {
    kdebug!("worker {} started", worker_id);
    let mut st = shared.lock();
    loop {
        if st.stop {
            break;
        }
        if st.park {
            st.parked += 1;
            shared.idle_cond.notify_all();
            while st.park && !st.stop {
                st = shared.work_cond.wait(st).unwrap_or_else(|e| e.into_inner());
            }
            st.parked -= 1;
            continue;
        }
        let Some(item) = st.pop_runnable() else {
            st = shared.work_cond.wait(st).unwrap_or_else(|e| e.into_inner());
            continue;
        };
        item.link().unlink();
        let key = addr(&item);
        st.in_flight.push(key);
        drop(st);

        if let Some(done) = item.run_blocking() {
            shared.completions.post(done);
        }

        st = shared.lock();
        if let Some(pos) = st.in_flight.iter().position(|k| *k == key) {
            st.in_flight.swap_remove(pos);
        }
        shared.idle_cond.notify_all();
    }
    kdebug!("worker {} exiting", worker_id);
}
