//! Wrap-safe deadline index.

use std::collections::{BTreeMap, HashMap};

use lowloop_core::SlotId;

use super::entry::TimerEntry;
use super::{is_due, ms_until};

/// A timer that just fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub id: SlotId,
    /// The timer is gone; its run-ref (if any) was dropped with it.
    pub oneshot: bool,
    pub refed: bool,
}

pub struct TimerTable {
    by_time: BTreeMap<(u32, u64), SlotId>,
    entries: HashMap<SlotId, TimerEntry>,
    /// Stamp of the last timer serviced; lookups start here.
    last_serviced: u32,
    next_seq: u64,
}

impl TimerTable {
    pub fn new() -> Self {
        TimerTable {
            by_time: BTreeMap::new(),
            entries: HashMap::new(),
            last_serviced: 0,
            next_seq: 0,
        }
    }

    /// Anchor the wrap-safe lookup; call once with the clock's start.
    pub fn set_epoch(&mut self, now: u32) {
        self.last_serviced = now;
    }

    pub fn insert(&mut self, id: SlotId, mut entry: TimerEntry) {
        if let Some(old) = self.entries.remove(&id) {
            self.by_time.remove(&old.key());
        }
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.by_time.insert(entry.key(), id);
        self.entries.insert(id, entry);
    }

    pub fn cancel(&mut self, id: SlotId) -> Option<TimerEntry> {
        let entry = self.entries.remove(&id)?;
        self.by_time.remove(&entry.key());
        Some(entry)
    }

    /// Toggle the keep-alive flag. Returns the run-ref delta (-1, 0, +1),
    /// `None` for an unknown timer.
    pub fn set_ref(&mut self, id: SlotId, on: bool) -> Option<isize> {
        let entry = self.entries.get_mut(&id)?;
        if entry.refed == on {
            return Some(0);
        }
        entry.refed = on;
        Some(if on { 1 } else { -1 })
    }

    pub fn get(&self, id: SlotId) -> Option<&TimerEntry> {
        self.entries.get(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Nearest timer in wrap order: first entry at or after the last
    /// serviced stamp, else the earliest entry.
    fn nearest(&self) -> Option<((u32, u64), SlotId)> {
        self.by_time
            .range((self.last_serviced, 0)..)
            .next()
            .or_else(|| self.by_time.iter().next())
            .map(|(k, v)| (*k, *v))
    }

    /// Milliseconds until the nearest timer (<= 0 when due).
    pub fn next_wait(&self, now: u32) -> Option<i32> {
        self.nearest().map(|((stamp, _), _)| ms_until(stamp, now))
    }

    /// Remove the nearest timer if due. Repeating timers are rescheduled
    /// before returning.
    pub fn pop_due(&mut self, now: u32) -> Option<Fired> {
        let (key, id) = self.nearest()?;
        if !is_due(key.0, now) {
            return None;
        }
        self.last_serviced = key.0;
        self.by_time.remove(&key);

        let entry = self.entries.get_mut(&id)?;
        if entry.oneshot {
            let refed = entry.refed;
            self.entries.remove(&id);
            return Some(Fired { id, oneshot: true, refed });
        }
        entry.advance(now);
        entry.seq = self.next_seq;
        self.next_seq += 1;
        let refed = entry.refed;
        let key = entry.key();
        self.by_time.insert(key, id);
        Some(Fired { id, oneshot: false, refed })
    }

    /// Remove every non-native timer.
    pub fn drain_non_native(&mut self) -> Vec<(SlotId, TimerEntry)> {
        let ids: Vec<SlotId> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.native)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.cancel(id).map(|e| (id, e)))
            .collect()
    }

    pub fn native_ids(&self) -> Vec<SlotId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.native)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn refed_count(&self) -> usize {
        self.entries.values().filter(|e| e.refed).count()
    }
}

impl Default for TimerTable {
    fn default() -> Self {
        Self::new()
    }
}
