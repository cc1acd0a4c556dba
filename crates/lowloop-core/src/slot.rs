//! Retained-value slots.
//!
//! Keeps loop-thread values (callbacks, handler closures, script objects)
//! alive while some other thread holds only the integer handle. The table is
//! deliberately `!Send`: it is resolved on the event-loop thread only.
//!
//! Uses a LIFO free stack so recently released slots are reused first. Each
//! slot carries a generation bumped on every free, so a handle kept past its
//! release never resolves to the slot's next occupant.

use std::any::Any;

use crate::error::{LoopError, LoopResult};

/// Handle to a retained value: slot index plus the slot's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: u32,
    gen: u32,
}

impl SlotId {
    #[inline]
    pub const fn new(index: u32, gen: u32) -> Self {
        SlotId { index, gen }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.gen
    }

    /// Both halves packed into one integer for the script side.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        ((self.gen as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        SlotId {
            index: raw as u32,
            gen: (raw >> 32) as u32,
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.gen)
    }
}

enum Entry {
    Free,
    Held(Box<dyn Any>),
    /// Value is out on loan (a handler currently running).
    Lent,
    /// Released while on loan; dropped when it comes back.
    Orphaned,
}

struct Slot {
    gen: u32,
    entry: Entry,
}

/// Result of [`SlotTable::fetch`].
pub enum Fetched<'a> {
    /// `consume = true`: the slot is free again.
    Owned(Box<dyn Any>),
    Borrowed(&'a mut dyn Any),
}

pub struct SlotTable {
    slots: Vec<Slot>,
    /// LIFO stack of free indices.
    free: Vec<u32>,
    max_slots: usize,
    live: usize,
}

impl SlotTable {
    pub fn new(max_slots: usize) -> Self {
        SlotTable {
            slots: Vec::new(),
            free: Vec::new(),
            max_slots: max_slots.max(1),
            live: 0,
        }
    }

    fn entry(&self, id: SlotId) -> Option<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.gen == id.gen)
            .map(|s| &s.entry)
    }

    fn entry_mut(&mut self, id: SlotId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.gen == id.gen)
            .map(|s| &mut s.entry)
    }

    /// Mark slot `idx` free and retire its generation.
    fn free_slot(&mut self, idx: u32) -> Entry {
        let slot = &mut self.slots[idx as usize];
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(idx);
        self.live -= 1;
        std::mem::replace(&mut slot.entry, Entry::Free)
    }

    /// Retain `value`, returning its handle.
    pub fn retain(&mut self, value: Box<dyn Any>) -> LoopResult<SlotId> {
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.entry = Entry::Held(value);
            self.live += 1;
            return Ok(SlotId::new(idx, slot.gen));
        }
        if self.slots.len() >= self.max_slots {
            return Err(LoopError::Exhausted { what: "slot" });
        }
        let idx = self.slots.len() as u32;
        self.slots.push(Slot {
            gen: 0,
            entry: Entry::Held(value),
        });
        self.live += 1;
        Ok(SlotId::new(idx, 0))
    }

    #[inline]
    pub fn retain_value<T: 'static>(&mut self, value: T) -> LoopResult<SlotId> {
        self.retain(Box::new(value))
    }

    /// Drop the value behind `id`. Returns `false` for an unknown or stale
    /// handle.
    pub fn release(&mut self, id: SlotId) -> bool {
        match self.entry_mut(id) {
            Some(Entry::Held(_)) => {
                drop(self.free_slot(id.index));
                true
            }
            Some(entry) if matches!(entry, Entry::Lent) => {
                *entry = Entry::Orphaned;
                true
            }
            _ => false,
        }
    }

    /// Resolve `id`. With `consume` the value is moved out and the slot freed.
    pub fn fetch(&mut self, id: SlotId, consume: bool) -> Option<Fetched<'_>> {
        if !matches!(self.entry(id), Some(Entry::Held(_))) {
            return None;
        }
        if consume {
            return match self.free_slot(id.index) {
                Entry::Held(value) => Some(Fetched::Owned(value)),
                _ => None,
            };
        }
        match self.entry_mut(id) {
            Some(Entry::Held(value)) => Some(Fetched::Borrowed(value.as_mut())),
            _ => None,
        }
    }

    /// Consume the slot as a `T`. A type mismatch leaves the slot untouched.
    pub fn take_as<T: 'static>(&mut self, id: SlotId) -> Option<T> {
        if !self.is_a::<T>(id) {
            return None;
        }
        match self.fetch(id, true) {
            Some(Fetched::Owned(value)) => value.downcast::<T>().ok().map(|b| *b),
            _ => None,
        }
    }

    pub fn get_mut<T: 'static>(&mut self, id: SlotId) -> Option<&mut T> {
        match self.entry_mut(id) {
            Some(Entry::Held(value)) => value.downcast_mut::<T>(),
            _ => None,
        }
    }

    pub fn is_a<T: 'static>(&self, id: SlotId) -> bool {
        matches!(self.entry(id), Some(Entry::Held(v)) if v.is::<T>())
    }

    /// Move a `T` out for the duration of a call; the slot stays reserved.
    pub fn lend<T: 'static>(&mut self, id: SlotId) -> Option<T> {
        if !self.is_a::<T>(id) {
            return None;
        }
        let entry = self.entry_mut(id)?;
        match std::mem::replace(entry, Entry::Lent) {
            Entry::Held(value) => value.downcast::<T>().ok().map(|b| *b),
            other => {
                *entry = other;
                None
            }
        }
    }

    /// Return a lent value. If the slot was released meanwhile the value is
    /// dropped and the slot freed.
    pub fn put_back<T: 'static>(&mut self, id: SlotId, value: T) {
        match self.entry_mut(id) {
            Some(entry) if matches!(entry, Entry::Lent) => {
                *entry = Entry::Held(Box::new(value));
            }
            Some(Entry::Orphaned) => {
                self.free_slot(id.index);
            }
            _ => {}
        }
    }

    #[inline]
    pub fn contains(&self, id: SlotId) -> bool {
        matches!(self.entry(id), Some(Entry::Held(_)) | Some(Entry::Lent))
    }

    /// Number of live (held or lent) slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Drop every value. Lent values are dropped when put back.
    pub fn clear(&mut self) {
        self.clear_except(&[]);
    }

    /// Like [`clear`](Self::clear) but keeps the slots listed in `keep`.
    pub fn clear_except(&mut self, keep: &[SlotId]) {
        let mut dropped = Vec::new();
        for idx in 0..self.slots.len() as u32 {
            let id = SlotId::new(idx, self.slots[idx as usize].gen);
            if keep.contains(&id) {
                continue;
            }
            match self.entry_mut(id) {
                Some(Entry::Held(_)) => dropped.push(self.free_slot(idx)),
                Some(entry) if matches!(entry, Entry::Lent) => *entry = Entry::Orphaned,
                _ => {}
            }
        }
        // Values may own other handles; drop them after the table is consistent.
        drop(dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_release_reuse() {
        let mut table = SlotTable::new(16);
        let a = table.retain_value(1u32).unwrap();
        let b = table.retain_value(2u32).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);

        assert!(table.release(a));
        assert!(!table.release(a));
        // LIFO reuse, under a new generation
        let c = table.retain_value(3u32).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(table.get_mut::<u32>(c).copied(), Some(3));
    }

    #[test]
    fn test_stale_handle_misses_reused_slot() {
        let mut table = SlotTable::new(4);
        let old = table.retain_value(1u8).unwrap();
        assert_eq!(table.take_as::<u8>(old), Some(1));
        let new = table.retain_value(2u8).unwrap();
        assert_eq!(new.index(), old.index());

        assert!(!table.contains(old));
        assert!(table.get_mut::<u8>(old).is_none());
        assert!(table.lend::<u8>(old).is_none());
        assert!(!table.release(old));
        assert_eq!(table.get_mut::<u8>(new).copied(), Some(2));
        assert_eq!(SlotId::from_u64(new.as_u64()), new);
    }

    #[test]
    fn test_fetch_consume() {
        let mut table = SlotTable::new(4);
        let id = table.retain_value(String::from("kept")).unwrap();
        match table.fetch(id, false) {
            Some(Fetched::Borrowed(v)) => assert_eq!(v.downcast_ref::<String>().unwrap(), "kept"),
            _ => panic!("expected borrowed"),
        }
        assert!(table.contains(id));
        match table.fetch(id, true) {
            Some(Fetched::Owned(v)) => assert_eq!(*v.downcast::<String>().unwrap(), "kept"),
            _ => panic!("expected owned"),
        }
        assert!(!table.contains(id));
        assert!(table.fetch(id, true).is_none());
    }

    #[test]
    fn test_take_as_wrong_type_keeps_value() {
        let mut table = SlotTable::new(4);
        let id = table.retain_value(7i64).unwrap();
        assert!(table.take_as::<u8>(id).is_none());
        assert_eq!(table.take_as::<i64>(id), Some(7));
        assert!(table.is_empty());
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut table = SlotTable::new(2);
        table.retain_value(()).unwrap();
        table.retain_value(()).unwrap();
        let err = table.retain_value(()).unwrap_err();
        assert_eq!(err.code(), "ENOMEM");
    }

    #[test]
    fn test_lend_and_put_back() {
        let mut table = SlotTable::new(4);
        let id = table.retain_value(vec![1u8]).unwrap();
        let mut v = table.lend::<Vec<u8>>(id).unwrap();
        assert!(table.contains(id));
        assert!(table.lend::<Vec<u8>>(id).is_none());
        v.push(2);
        table.put_back(id, v);
        assert_eq!(table.get_mut::<Vec<u8>>(id).unwrap(), &vec![1, 2]);
    }

    #[test]
    fn test_release_while_lent() {
        let mut table = SlotTable::new(4);
        let id = table.retain_value(5u16).unwrap();
        let v = table.lend::<u16>(id).unwrap();
        assert!(table.release(id));
        table.put_back(id, v);
        assert!(!table.contains(id));
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut table = SlotTable::new(8);
        for i in 0..5u32 {
            table.retain_value(i).unwrap();
        }
        table.clear();
        assert!(table.is_empty());
        table.retain_value(9u32).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_clear_except() {
        let mut table = SlotTable::new(8);
        let a = table.retain_value(1u8).unwrap();
        let b = table.retain_value(2u8).unwrap();
        table.clear_except(&[b]);
        assert!(!table.contains(a));
        assert_eq!(table.get_mut::<u8>(b).copied(), Some(2));
        assert_eq!(table.len(), 1);
    }
}
