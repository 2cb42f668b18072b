//! Global unit registry: address lookup plus the all-units/dead/to-flush/
//! to-free lists shared by every cache.
//!
//! Holds the one piece of truly global, cross-cache state: a pc-to-unit
//! interval map, and the four unit lists threaded through a unit's life:
//! live, dead (parked for reuse), staged for flush, and staged for final
//! reclamation. Lock ranking follows the order the cache manager relies
//! on: `unit_flush_lock` (lowest) below `allunits_lock` (mid) below any
//! per-cache lock (highest); the interval map's reader-writer lock is an
//! independent rank, never held while attempting to acquire any of the
//! other three.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use crate::memory::provider::MemoryProvider;
use crate::memory::unit::{Unit, UnitId};

/// A unit staged on the to-free list, carrying the flushtime at which it
/// was retired.
struct PendingFree {
    unit: UnitId,
    flushtime: u32,
}

/// Generational slab plus the four cross-cache unit lists and the
/// pc-to-unit interval index.
pub struct UnitRegistry {
    slab: Mutex<Slab>,
    /// Live all-units list and dead (reusable) list.
    allunits: Mutex<AllUnits>,
    /// To-flush and to-free lists.
    unit_flush: Mutex<UnitFlush>,
    /// `[start_pc, reserved_end_pc) -> UnitId`, non-overlapping.
    intervals: RwLock<BTreeMap<usize, IntervalEntry>>,
}

struct IntervalEntry {
    end: usize,
    unit: UnitId,
}

struct Slab {
    units: Vec<Option<Unit>>,
    generations: Vec<u32>,
    free_slots: Vec<u32>,
}

impl Slab {
    fn new() -> Self {
        Self {
            units: Vec::new(),
            generations: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    fn insert(&mut self, build: impl FnOnce(UnitId) -> Unit) -> UnitId {
        if let Some(index) = self.free_slots.pop() {
            let generation = self.generations[index as usize];
            let id = UnitId { index, generation };
            self.units[index as usize] = Some(build(id));
            id
        } else {
            let index = u32::try_from(self.units.len()).expect("unit count fits in u32");
            let id = UnitId {
                index,
                generation: 0,
            };
            self.generations.push(0);
            self.units.push(Some(build(id)));
            id
        }
    }

    fn get(&self, id: UnitId) -> Option<&Unit> {
        if self.generations.get(id.index as usize).copied() != Some(id.generation) {
            return None;
        }
        self.units.get(id.index as usize)?.as_ref()
    }

    fn get_mut(&mut self, id: UnitId) -> Option<&mut Unit> {
        if self.generations.get(id.index as usize).copied() != Some(id.generation) {
            return None;
        }
        self.units.get_mut(id.index as usize)?.as_mut()
    }

    fn remove(&mut self, id: UnitId) -> Option<Unit> {
        if self.generations.get(id.index as usize).copied() != Some(id.generation) {
            return None;
        }
        let taken = self.units.get_mut(id.index as usize)?.take()?;
        self.generations[id.index as usize] = self.generations[id.index as usize].wrapping_add(1);
        self.free_slots.push(id.index);
        Some(taken)
    }
}

#[derive(Default)]
struct AllUnits {
    live: Vec<UnitId>,
    /// Dead (parked) units, kept in ascending reservation-size order for
    /// `take_dead`'s first-fit scan.
    dead: Vec<UnitId>,
}

#[derive(Default)]
struct UnitFlush {
    to_flush: Vec<UnitId>,
    /// Sorted by ascending flushtime; appended at the tail since
    /// flushtime is stamped monotonically.
    to_free: Vec<PendingFree>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slab: Mutex::new(Slab::new()),
            allunits: Mutex::new(AllUnits::default()),
            unit_flush: Mutex::new(UnitFlush::default()),
            intervals: RwLock::new(BTreeMap::new()),
        }
    }

    /// Reserves a new unit through `provider`, registers its address range,
    /// and adds it to the live all-units list.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::FcacheError::OutOfReservation`].
    pub fn create_unit(
        &self,
        provider: &dyn MemoryProvider,
        reserved_size: usize,
        initial_commit_size: usize,
    ) -> Result<UnitId, crate::error::FcacheError> {
        let base = provider.reserve(reserved_size, initial_commit_size)?;
        let mut slab = self.slab.lock().expect("unit slab poisoned");
        let id = slab.insert(|id| Unit::from_reserved(id, base, reserved_size, initial_commit_size));
        self.register_range(&slab, id);
        drop(slab);
        self.allunits.lock().expect("allunits lock poisoned").live.push(id);
        Ok(id)
    }

    fn register_range(&self, slab: &Slab, id: UnitId) {
        let unit = slab.get(id).expect("just inserted");
        let mut intervals = self.intervals.write().expect("interval map poisoned");
        intervals.insert(
            unit.start_pc(),
            IntervalEntry {
                end: unit.reserved_end_pc(),
                unit: id,
            },
        );
    }

    /// Re-registers `id`'s address range after its reservation has grown
    /// in place (start_pc unchanged, reserved_end_pc grown).
    pub fn reregister(&self, id: UnitId) {
        let slab = self.slab.lock().expect("unit slab poisoned");
        self.register_range(&slab, id);
    }

    /// Removes `id`'s address range from the interval map.
    pub fn unregister(&self, id: UnitId) {
        let start = {
            let slab = self.slab.lock().expect("unit slab poisoned");
            slab.get(id).map(Unit::start_pc)
        };
        if let Some(start) = start {
            let mut intervals = self.intervals.write().expect("interval map poisoned");
            intervals.remove(&start);
        }
    }

    /// Looks up the unit owning `pc`, if any.
    #[must_use]
    pub fn lookup(&self, pc: usize) -> Option<UnitId> {
        let intervals = self.intervals.read().expect("interval map poisoned");
        intervals
            .range(..=pc)
            .next_back()
            .filter(|(_, entry)| pc < entry.end)
            .map(|(_, entry)| entry.unit)
    }

    /// Runs `f` with shared access to `id`'s unit.
    pub fn with_unit<R>(&self, id: UnitId, f: impl FnOnce(&Unit) -> R) -> Option<R> {
        let slab = self.slab.lock().expect("unit slab poisoned");
        slab.get(id).map(f)
    }

    /// Runs `f` with exclusive access to `id`'s unit.
    pub fn with_unit_mut<R>(&self, id: UnitId, f: impl FnOnce(&mut Unit) -> R) -> Option<R> {
        let mut slab = self.slab.lock().expect("unit slab poisoned");
        slab.get_mut(id).map(f)
    }

    /// First-fit scan of the dead list for a unit whose reservation is
    /// `>= min_size` and, if `max_total` is nonzero, does not push
    /// `current_total + reservation` past it.
    #[must_use]
    pub fn take_dead(&self, min_size: usize, current_total: usize, max_total: usize) -> Option<UnitId> {
        let mut allunits = self.allunits.lock().expect("allunits lock poisoned");
        let slab = self.slab.lock().expect("unit slab poisoned");
        let pos = allunits.dead.iter().position(|&id| {
            let Some(unit) = slab.get(id) else {
                return false;
            };
            let reservation = unit.reserved_end_pc() - unit.start_pc();
            reservation >= min_size && (max_total == 0 || current_total + reservation <= max_total)
        })?;
        Some(allunits.dead.remove(pos))
    }

    /// Parks `id` on the dead list in ascending-reservation-size order, if
    /// the dead list is under its bound; otherwise unmaps it immediately
    /// and returns `false`.
    ///
    /// `bound` is the caller-computed `max(5, thread_count / 4)` heuristic.
    pub fn park_dead(&self, id: UnitId, bound: usize, provider: &dyn MemoryProvider) -> bool {
        let mut allunits = self.allunits.lock().expect("allunits lock poisoned");
        if allunits.dead.len() >= bound {
            drop(allunits);
            self.reclaim_unmap(id, provider);
            return false;
        }
        let slab = self.slab.lock().expect("unit slab poisoned");
        let reservation = slab
            .get(id)
            .map_or(0, |u| u.reserved_end_pc() - u.start_pc());
        let pos = allunits
            .dead
            .iter()
            .position(|&other| {
                slab.get(other)
                    .map_or(0, |u| u.reserved_end_pc() - u.start_pc())
                    >= reservation
            })
            .unwrap_or(allunits.dead.len());
        allunits.dead.insert(pos, id);
        true
    }

    /// Removes `id` from the live all-units list (called when a unit is
    /// staged for flush).
    pub fn remove_live(&self, id: UnitId) {
        let mut allunits = self.allunits.lock().expect("allunits lock poisoned");
        allunits.live.retain(|&other| other != id);
    }

    #[must_use]
    pub fn live_units(&self) -> Vec<UnitId> {
        self.allunits.lock().expect("allunits lock poisoned").live.clone()
    }

    /// Atomically steals the entire to-flush list, returning its contents.
    pub fn steal_to_flush(&self) -> Vec<UnitId> {
        let mut guard = self.unit_flush.lock().expect("unit-flush lock poisoned");
        std::mem::take(&mut guard.to_flush)
    }

    /// Stages `id` for flush (added to the to-flush list).
    pub fn stage_to_flush(&self, id: UnitId) {
        self.unit_flush
            .lock()
            .expect("unit-flush lock poisoned")
            .to_flush
            .push(id);
    }

    /// Appends a chain of units to the to-free list, all stamped with
    /// `flushtime`. Asserts the chain does not violate the list's
    /// ascending-flushtime invariant.
    pub fn append_to_free(&self, chain: impl IntoIterator<Item = UnitId>, flushtime: u32) {
        let mut guard = self.unit_flush.lock().expect("unit-flush lock poisoned");
        debug_assert!(
            guard.to_free.last().is_none_or(|tail| tail.flushtime <= flushtime),
            "to-free list must stay sorted by ascending flushtime"
        );
        for unit in chain {
            guard.to_free.push(PendingFree { unit, flushtime });
        }
    }

    /// The owners of every to-free unit that [`UnitRegistry::reap_free`]
    /// would reclaim for the same `upto_flushtime`, resolved before the
    /// reclaim runs: `reap_free` clears a unit's owner as part of parking
    /// it for reuse, so a caller that wants to attribute the reclaim to a
    /// particular cache's stats must look this up first.
    #[must_use]
    pub fn owners_pending_reap(&self, upto_flushtime: u32) -> Vec<(UnitId, Option<crate::cache::CacheOwner>)> {
        let ids: Vec<UnitId> = {
            let guard = self.unit_flush.lock().expect("unit-flush lock poisoned");
            guard.to_free.iter().take_while(|h| h.flushtime <= upto_flushtime).map(|h| h.unit).collect()
        };
        ids.into_iter().map(|id| (id, self.with_unit(id, Unit::owner).flatten())).collect()
    }

    /// Reclaims every unit on the to-free list whose flushtime is
    /// `<= upto_flushtime`, stopping at the first one above (the list is
    /// sorted). Reclaimed units are parked on the dead list, or unmapped
    /// if the dead list is full.
    pub fn reap_free(&self, upto_flushtime: u32, dead_bound: usize, provider: &dyn MemoryProvider) -> Vec<UnitId> {
        let mut reclaimed = Vec::new();
        loop {
            let next = {
                let mut guard = self.unit_flush.lock().expect("unit-flush lock poisoned");
                if guard.to_free.first().is_some_and(|h| h.flushtime <= upto_flushtime) {
                    Some(guard.to_free.remove(0).unit)
                } else {
                    None
                }
            };
            let Some(id) = next else {
                break;
            };
            self.unregister(id);
            self.park_dead(id, dead_bound, provider);
            self.with_unit_mut(id, Unit::reset_for_reuse);
            reclaimed.push(id);
        }
        reclaimed
    }

    fn reclaim_unmap(&self, id: UnitId, provider: &dyn MemoryProvider) {
        self.unregister(id);
        let mut slab = self.slab.lock().expect("unit slab poisoned");
        if let Some(unit) = slab.remove(id) {
            unit.unmap(provider);
        }
    }

    /// Total count of units currently parked on the dead list.
    #[must_use]
    pub fn dead_count(&self) -> usize {
        self.allunits.lock().expect("allunits lock poisoned").dead.len()
    }

    /// Total count of units currently staged on the to-free list.
    #[must_use]
    pub fn to_free_count(&self) -> usize {
        self.unit_flush.lock().expect("unit-flush lock poisoned").to_free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::provider::MmapMemoryProvider;

    #[test]
    fn create_and_lookup_roundtrip() {
        let provider = MmapMemoryProvider::new();
        let registry = UnitRegistry::new();
        let id = registry.create_unit(&provider, 8192, 4096).unwrap();
        let start = registry.with_unit(id, |u| u.start_pc()).unwrap();
        assert_eq!(registry.lookup(start), Some(id));
        assert_eq!(registry.lookup(start + 100), Some(id));
        assert_eq!(registry.lookup(start + 8192), None);
    }

    #[test]
    fn dead_list_first_fit_by_size() {
        let provider = MmapMemoryProvider::new();
        let registry = UnitRegistry::new();
        let small = registry.create_unit(&provider, 4096, 4096).unwrap();
        let big = registry.create_unit(&provider, 16384, 4096).unwrap();
        registry.remove_live(small);
        registry.remove_live(big);
        assert!(registry.park_dead(small, 5, &provider));
        assert!(registry.park_dead(big, 5, &provider));

        let taken = registry.take_dead(8192, 0, 0).unwrap();
        assert_eq!(taken, big);
        assert_eq!(registry.dead_count(), 1);
    }

    #[test]
    fn park_dead_unmaps_past_bound() {
        let provider = MmapMemoryProvider::new();
        let registry = UnitRegistry::new();
        let a = registry.create_unit(&provider, 4096, 4096).unwrap();
        let b = registry.create_unit(&provider, 4096, 4096).unwrap();
        registry.remove_live(a);
        registry.remove_live(b);
        assert!(registry.park_dead(a, 1, &provider));
        assert!(!registry.park_dead(b, 1, &provider));
        assert_eq!(registry.dead_count(), 1);
    }

    #[test]
    fn reap_free_stops_at_first_unreached_flushtime() {
        let provider = MmapMemoryProvider::new();
        let registry = UnitRegistry::new();
        let a = registry.create_unit(&provider, 4096, 4096).unwrap();
        let b = registry.create_unit(&provider, 4096, 4096).unwrap();
        registry.remove_live(a);
        registry.remove_live(b);
        registry.append_to_free([a], 1);
        registry.append_to_free([b], 2);

        let reclaimed = registry.reap_free(1, 5, &provider);
        assert_eq!(reclaimed, vec![a]);
        assert_eq!(registry.to_free_count(), 1);
        assert_eq!(registry.dead_count(), 1);
    }
}
