//! Generation-checked handle arena.
//!
//! Objects handed to API callers (devices, event pools, events) live in a
//! [`HandleTable`] owned by the driver or context. Callers hold an opaque
//! [`RawHandle`]; releasing the handle returns the slot to the table and bumps
//! its generation so stale handles are rejected instead of aliasing a new
//! object.

use crate::error::{Result, SyncError};

/// Opaque handle: slot index in the low 32 bits, generation in the high 32.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(u64);

impl RawHandle {
    /// Never issued by any table.
    pub const NULL: Self = Self(0);

    fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    fn index(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    #[inline]
    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct Slot<T> {
    // Generations start at 1 so `RawHandle::NULL` never resolves.
    generation: u32,
    value: Option<T>,
}

pub struct HandleTable<T> {
    kind: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    /// `kind` names the object type in stale-handle errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> RawHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return RawHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        RawHandle::new(index, 1)
    }

    pub fn get(&self, handle: RawHandle) -> Result<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| self.stale(handle))
    }

    /// Release the slot and return its value. The handle is stale afterwards.
    pub fn remove(&mut self, handle: RawHandle) -> Result<T> {
        let stale = self.stale(handle);
        let slot = self
            .slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .ok_or(stale)?;
        let value = slot.value.take().ok_or_else(|| SyncError::StaleHandle {
            kind: self.kind,
            handle: handle.as_u64(),
        })?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index() as u32);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (RawHandle::new(index as u32, slot.generation), value))
        })
    }

    fn stale(&self, handle: RawHandle) -> SyncError {
        SyncError::StaleHandle {
            kind: self.kind,
            handle: handle.as_u64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_never_resolves() {
        let mut table = HandleTable::new("event");
        table.insert(5u32);
        assert!(table.get(RawHandle::NULL).is_err());
    }

    #[test]
    fn released_slot_rejects_stale_handle() {
        let mut table = HandleTable::new("event");
        let first = table.insert("a");
        assert_eq!(table.remove(first).expect("live handle"), "a");

        let second = table.insert("b");
        assert_ne!(first, second, "reused slot must carry a new generation");
        assert!(table.get(first).is_err());
        assert_eq!(*table.get(second).expect("live handle"), "b");
        assert!(table.remove(first).is_err());
    }

    #[test]
    fn iter_yields_live_entries_only() {
        let mut table = HandleTable::new("pool");
        let a = table.insert(1);
        let _b = table.insert(2);
        table.remove(a).expect("live handle");
        let live: Vec<_> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![2]);
        assert_eq!(table.len(), 1);
    }
}
