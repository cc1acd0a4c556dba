//! The multiplexer's poll set and how queued changes are applied to it.
//!
//! Owned by the multiplexer thread; nothing else touches it.

use std::collections::HashMap;
use std::sync::Arc;

use lowloop_core::{Interest, Pollable};

#[inline]
pub(crate) fn key_of(obj: &Arc<dyn Pollable>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

pub(crate) struct PollEntry {
    pub obj: Arc<dyn Pollable>,
    pub mask: Interest,
}

/// What applying one change did, for the caller's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Upserted,
    Removed,
    /// Pending delete: removed, and the caller must retire it.
    Delete,
}

#[derive(Default)]
pub(crate) struct PollSet {
    entries: HashMap<usize, PollEntry>,
}

impl PollSet {
    pub fn new() -> Self {
        PollSet { entries: HashMap::new() }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PollEntry> {
        self.entries.values()
    }

    pub fn remove(&mut self, obj: &Arc<dyn Pollable>) {
        self.entries.remove(&key_of(obj));
        obj.descriptor().set_polled(false);
    }

    /// Drop entries whose descriptor was retired behind our back.
    pub fn purge_retired(&mut self) {
        self.entries.retain(|_, e| {
            let d = e.obj.descriptor();
            if d.is_retired() || d.fd() < 0 {
                d.set_polled(false);
                return false;
            }
            true
        });
    }

    /// Apply the descriptor's current request. The changed flag is cleared
    /// first so a request racing with us re-queues the descriptor.
    pub fn apply(&mut self, obj: Arc<dyn Pollable>) -> Applied {
        let d = obj.descriptor();
        d.clear_changed();
        if d.is_retired() {
            self.remove(&obj);
            return Applied::Removed;
        }
        if d.is_pending_delete() {
            self.remove(&obj);
            return Applied::Delete;
        }
        let mask = d.requested();
        if d.fd() < 0 || mask.is_empty() {
            self.remove(&obj);
            return Applied::Removed;
        }
        d.set_polled(true);
        self.entries.insert(key_of(&obj), PollEntry { obj, mask });
        Applied::Upserted
    }

    pub fn clear(&mut self) {
        for e in self.entries.values() {
            e.obj.descriptor().set_polled(false);
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lowloop_core::{Descriptor, DescriptorKind};

    struct Dummy(Descriptor);

    impl Pollable for Dummy {
        fn descriptor(&self) -> &Descriptor {
            &self.0
        }
        fn on_readiness(&self, _ready: Interest) -> bool {
            true
        }
    }

    fn dummy(fd: i32) -> Arc<dyn Pollable> {
        Arc::new(Dummy(Descriptor::with_fd(DescriptorKind::Custom, fd)))
    }

    #[test]
    fn test_apply_upsert_and_remove() {
        let mut set = PollSet::new();
        let obj = dummy(5000);
        obj.descriptor().set_requested(Interest::READ);
        obj.descriptor().mark_changed();
        assert_eq!(set.apply(obj.clone()), Applied::Upserted);
        assert!(obj.descriptor().is_polled());
        assert!(!obj.descriptor().is_changed());

        obj.descriptor().set_requested(Interest::READ | Interest::WRITE);
        assert_eq!(set.apply(obj.clone()), Applied::Upserted);
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap().mask, Interest::READ | Interest::WRITE);

        obj.descriptor().set_requested(Interest::NONE);
        assert_eq!(set.apply(obj.clone()), Applied::Removed);
        assert!(!obj.descriptor().is_polled());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_pending_delete() {
        let mut set = PollSet::new();
        let obj = dummy(5001);
        obj.descriptor().set_requested(Interest::READ);
        set.apply(obj.clone());
        obj.descriptor().set_pending_delete();
        assert_eq!(set.apply(obj), Applied::Delete);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_purge_retired() {
        let mut set = PollSet::new();
        let a = dummy(5002);
        let b = dummy(5003);
        for o in [&a, &b] {
            o.descriptor().set_requested(Interest::READ);
            set.apply(o.clone());
        }
        assert!(a.descriptor().try_retire());
        set.purge_retired();
        assert_eq!(set.len(), 1);
        assert!(!a.descriptor().is_polled());
        assert!(b.descriptor().is_polled());
    }
}
