//! Descriptor registry: advertised handle → live object.
//!
//! A descriptor is in the registry iff its advertised handle is >= 0, and
//! while registered the advertised handle equals its native handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lowloop_core::{DescriptorKind, LoopError, LoopResult, Pollable};

pub struct Registry {
    map: Mutex<HashMap<i32, Arc<dyn Pollable>>>,
    /// Set when a listener paused on descriptor exhaustion.
    retry_accepts: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            map: Mutex::new(HashMap::new()),
            retry_accepts: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, Arc<dyn Pollable>>> {
        // A panic on another thread must not wedge teardown.
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `obj` under its native handle.
    pub fn advertise(&self, obj: Arc<dyn Pollable>) -> LoopResult<i32> {
        let d = obj.descriptor();
        let fd = d.fd();
        if fd < 0 || d.is_retired() {
            return Err(LoopError::os(libc::EBADF, "advertise"));
        }
        d.set_advertised(fd);
        let prev = self.lock().insert(fd, obj);
        if let Some(prev) = prev {
            // Stale entry for a recycled fd number.
            prev.descriptor().set_advertised(-1);
        }
        Ok(fd)
    }

    /// Remove `obj` if it is the registered owner of its handle.
    pub fn withdraw(&self, obj: &dyn Pollable) -> bool {
        let d = obj.descriptor();
        let handle = d.advertised();
        if handle < 0 {
            return false;
        }
        let mut map = self.lock();
        let owned = map
            .get(&handle)
            .map(|cur| std::ptr::addr_eq(Arc::as_ptr(cur), obj as *const dyn Pollable))
            .unwrap_or(false);
        if owned {
            map.remove(&handle);
        }
        drop(map);
        d.set_advertised(-1);
        owned
    }

    pub fn get(&self, handle: i32) -> Option<Arc<dyn Pollable>> {
        self.lock().get(&handle).cloned()
    }

    pub fn of_kind(&self, kind: DescriptorKind) -> Vec<Arc<dyn Pollable>> {
        self.lock()
            .values()
            .filter(|p| p.descriptor().kind() == kind)
            .cloned()
            .collect()
    }

    /// Remove and return every entry not marked survive-reset.
    pub fn drain_non_survivors(&self) -> Vec<Arc<dyn Pollable>> {
        let mut map = self.lock();
        let handles: Vec<i32> = map
            .iter()
            .filter(|(_, p)| !p.descriptor().survives_reset())
            .map(|(h, _)| *h)
            .collect();
        handles.into_iter().filter_map(|h| map.remove(&h)).collect()
    }

    pub fn drain_all(&self) -> Vec<Arc<dyn Pollable>> {
        self.lock().drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn set_retry_accepts(&self) {
        self.retry_accepts.store(true, Ordering::Release);
    }

    /// Consume the retry flag.
    #[inline]
    pub fn take_retry_accepts(&self) -> bool {
        self.retry_accepts.swap(false, Ordering::AcqRel)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
