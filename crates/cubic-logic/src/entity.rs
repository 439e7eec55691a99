//! Managed entity identifiers.
//!
//! A managed entity is an opaque reference to a scene object (a cube in the
//! CubicMusic scene). The logic core never looks inside it: an [`EntityId`] is
//! only a key into the per-entity behavior bindings held by an
//! [`ObjectGroup`](crate::group::ObjectGroup).
//!
//! Ids are generational: the high 32 bits hold a generation counter and the
//! low 32 bits a slot index. When a slot is freed its generation is bumped, so
//! a stale id left behind by a removed cube never aliases the cube that later
//! reuses the slot.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Generational handle of a managed entity.
///
/// Layout: `[generation: u32 | slot: u32]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Build an id from a slot index and a generation.
    #[inline]
    pub fn new(slot: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | slot as u64)
    }

    /// Slot index (low 32 bits).
    #[inline]
    pub fn slot(self) -> u32 {
        self.0 as u32
    }

    /// Generation (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` form, as handed across the script sandbox boundary.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Rebuild an id from its raw `u64` form.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}g{})", self.slot(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}g{}", self.slot(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Hands out [`EntityId`]s and recycles the slots of freed ones.
///
/// Freed slots are reused in FIFO order.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    /// Current generation of every slot ever handed out.
    generations: Vec<u32>,
    /// Liveness flag per slot.
    live: Vec<bool>,
    /// Slots waiting to be reused.
    free_slots: VecDeque<u32>,
    /// Number of live ids.
    live_count: usize,
}

impl EntityAllocator {
    /// Create an allocator with no live ids.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a fresh id, reusing the oldest freed slot when one exists.
    pub fn allocate(&mut self) -> EntityId {
        self.live_count += 1;
        match self.free_slots.pop_front() {
            Some(slot) => {
                self.live[slot as usize] = true;
                EntityId::new(slot, self.generations[slot as usize])
            }
            None => {
                let slot = self.generations.len() as u32;
                self.generations.push(0);
                self.live.push(true);
                EntityId::new(slot, 0)
            }
        }
    }

    /// Free `id`. Returns `false` when it was already freed or is stale.
    pub fn free(&mut self, id: EntityId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        let slot = id.slot() as usize;
        self.live[slot] = false;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        self.free_slots.push_back(id.slot());
        self.live_count -= 1;
        true
    }

    /// `true` if `id` is live and its generation is current.
    pub fn is_live(&self, id: EntityId) -> bool {
        let slot = id.slot() as usize;
        slot < self.generations.len() && self.live[slot] && self.generations[slot] == id.generation()
    }

    /// Number of live ids.
    pub fn live_count(&self) -> usize {
        self.live_count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ids_are_distinct() {
        let mut alloc = EntityAllocator::new();
        let mut ids: Vec<EntityId> = (0..64).map(|_| alloc.allocate()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 64);
        assert_eq!(alloc.live_count(), 64);
    }

    #[test]
    fn freed_slot_comes_back_with_next_generation() {
        let mut alloc = EntityAllocator::new();
        let first = alloc.allocate();
        assert!(alloc.free(first));

        let second = alloc.allocate();
        assert_eq!(second.slot(), first.slot());
        assert_eq!(second.generation(), first.generation() + 1);
        assert_ne!(first, second);
    }

    #[test]
    fn stale_id_is_not_live() {
        let mut alloc = EntityAllocator::new();
        let cube = alloc.allocate();
        alloc.free(cube);
        let _reuse = alloc.allocate();
        assert!(!alloc.is_live(cube), "old generation must stay dead");
    }

    #[test]
    fn freeing_twice_is_rejected() {
        let mut alloc = EntityAllocator::new();
        let cube = alloc.allocate();
        assert!(alloc.free(cube));
        assert!(!alloc.free(cube));
        assert_eq!(alloc.live_count(), 0);
    }

    #[test]
    fn raw_form_preserves_slot_and_generation() {
        let id = EntityId::new(9, 3);
        let back = EntityId::from_raw(id.to_raw());
        assert_eq!(back.slot(), 9);
        assert_eq!(back.generation(), 3);
        assert_eq!(format!("{id}"), "9g3");
    }
}
