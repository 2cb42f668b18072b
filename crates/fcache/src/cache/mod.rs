//! A logical collection of units holding fragments of one kind and
//! sharing mode, and the placement/eviction machinery that operates on
//! them.

pub mod fifo;
pub mod free_list;
pub mod wset;

pub use fifo::{Fifo, FifoNodeId};
pub use free_list::{FreeList, MAX_FREE_ENTRY_SIZE, SIZES as FREE_LIST_SIZES};
pub use wset::WsetState;

use crate::config::CacheOptions;
use crate::error::FcacheError;
use crate::external::ExternalHooks;
use crate::fragment::{Fragment, FragmentFlags, FragmentId, SlotLocation};
use crate::memory::{FreeEntryId, MemoryProvider, SlotKind, SlotRecord, UnitId, UnitRegistry};
use crate::stats::CacheStats;

/// Assumed overhead of a live fragment's in-cache header. Coarse caches
/// carry no header at all.
pub const FRAGMENT_HEADER_SIZE: usize = 16;

/// `{next, prev}` pointers plus a `{flags, size}` word, sized for a
/// 64-bit host's free-list entry header.
pub const FREE_LIST_HEADER_SIZE: usize = 24;

/// Trailing `{size}` word used for backward coalescing.
pub const FREE_LIST_FOOTER_SIZE: usize = 4;

const BB_MIN_EMPTY_HOLE: usize = 32;
const TRACE_MIN_EMPTY_HOLE: usize = 64;

/// Doubling (rather than quadrupling) multiplier used once a unit's
/// current size exceeds `unit_quadruple`.
const RESIZE_DOUBLE: usize = 2;
const RESIZE_QUADRUPLE: usize = 4;

/// Minimum resize target relative to the fragment that triggered it, so a
/// single oversized fragment does not force an undersized resize.
const SINGLE_MAX_MULT: usize = 2;

fn align_up(x: usize, align: usize) -> usize {
    x.div_ceil(align) * align
}

/// What kind of fragments a cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Single basic blocks.
    Bb,
    /// Traces (chains of basic blocks).
    Trace,
    /// Coarse-grain basic blocks: no in-cache header, walked via an
    /// external htable.
    CoarseBb,
}

/// Whether a cache is owned by one thread or visible to all workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sharing {
    Private,
    Shared,
}

/// A unit's back-link to the logical cache that owns it (§3's "back-link
/// to its Cache" field), carried on the [`crate::memory::Unit`] itself so
/// the flush engine and `pclookup` can find the owning cache from a bare
/// `UnitId` without a separate reverse index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOwner {
    /// Owned by one worker thread's private basic-block or trace cache.
    Private { thread_id: u64, kind: CacheKind },
    /// Owned by a process-wide shared cache.
    Shared { kind: CacheKind },
}

enum Eviction {
    Fifo(Fifo),
    FreeList(FreeList),
    None,
}

struct FragmentEntry {
    fragment: Fragment,
    /// Set while the fragment is live in a private cache's FIFO.
    fifo_node: Option<FifoNodeId>,
}

/// A logical cache: an ordered list of units, the eviction structure that
/// matches its sharing mode, and the working-set and sizing state that
/// governs when it grows.
pub struct Cache {
    kind: CacheKind,
    sharing: Sharing,
    owner: CacheOwner,
    options: CacheOptions,
    /// Cache-local unit list; `units[0]` is the head (the only unit that
    /// may still be non-full).
    units: Vec<UnitId>,
    total_size: usize,
    wset: WsetState,
    eviction: Eviction,
    frag_slab: Vec<Option<FragmentEntry>>,
    frag_generations: Vec<u32>,
    frag_free_slots: Vec<u32>,
    stats: CacheStats,
    /// False during an in-place resize; pclookup must fall back to the
    /// external htable while this is false.
    consistent: bool,
    /// `stats.total_units_created` as of this cache's last proactive reset,
    /// the baseline `should_reset` measures `reset_every_nth_unit` against.
    units_at_last_reset: u64,
}

impl Cache {
    /// Creates an empty cache of the given kind and sharing mode.
    ///
    /// `owner` is stamped onto every unit this cache creates, so the flush
    /// engine and `pclookup` can recover the owning cache from a bare
    /// `UnitId` (see [`CacheOwner`]).
    #[must_use]
    pub fn new(kind: CacheKind, sharing: Sharing, owner: CacheOwner, options: CacheOptions) -> Self {
        let eviction = match (kind, sharing) {
            (CacheKind::CoarseBb, _) => Eviction::None,
            (_, Sharing::Shared) => Eviction::FreeList(FreeList::new()),
            (_, Sharing::Private) => Eviction::Fifo(Fifo::new()),
        };
        Self {
            kind,
            sharing,
            owner,
            options,
            units: Vec::new(),
            total_size: 0,
            wset: WsetState::new(),
            eviction,
            frag_slab: Vec::new(),
            frag_generations: Vec::new(),
            frag_free_slots: Vec::new(),
            stats: CacheStats::new(),
            consistent: true,
            units_at_last_reset: 0,
        }
    }

    #[must_use]
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    #[must_use]
    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    #[must_use]
    pub fn owner(&self) -> CacheOwner {
        self.owner
    }

    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.consistent
    }

    /// Forces the consistency flag for tests that need to exercise the
    /// pclookup htable fallback without driving a real concurrent resize.
    #[cfg(test)]
    pub(crate) fn set_consistent_for_test(&mut self, value: bool) {
        self.consistent = value;
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[must_use]
    pub fn units(&self) -> &[UnitId] {
        &self.units
    }

    fn is_shared(&self) -> bool {
        self.sharing == Sharing::Shared
    }

    fn min_fcache_slot_size(&self) -> usize {
        align_up(FREE_LIST_HEADER_SIZE + FREE_LIST_FOOTER_SIZE, self.options.align)
    }

    fn min_empty_hole(&self) -> usize {
        let per_kind = match self.kind {
            CacheKind::Trace => TRACE_MIN_EMPTY_HOLE,
            CacheKind::Bb | CacheKind::CoarseBb => BB_MIN_EMPTY_HOLE,
        };
        self.min_fcache_slot_size().max(per_kind)
    }

    fn min_tail_hole(&self) -> usize {
        2 * self.min_empty_hole()
    }

    fn header_size(&self, flags: FragmentFlags) -> usize {
        if flags.contains(FragmentFlags::COARSE) {
            0
        } else {
            FRAGMENT_HEADER_SIZE
        }
    }

    fn compute_slot_size(&self, body_size: usize, flags: FragmentFlags) -> usize {
        let raw = align_up(body_size + self.header_size(flags), self.options.align);
        raw.max(self.min_fcache_slot_size())
    }

    fn base_flags(&self) -> FragmentFlags {
        let mut flags = FragmentFlags::empty();
        if self.sharing == Sharing::Shared {
            flags |= FragmentFlags::SHARED;
        }
        if self.kind == CacheKind::CoarseBb {
            flags |= FragmentFlags::COARSE;
        }
        if self.kind == CacheKind::Trace {
            flags |= FragmentFlags::IS_TRACE;
        }
        flags
    }

    fn alloc_fragment(&mut self, fragment: Fragment) -> FragmentId {
        if let Some(index) = self.frag_free_slots.pop() {
            let generation = self.frag_generations[index as usize];
            self.frag_slab[index as usize] = Some(FragmentEntry {
                fragment,
                fifo_node: None,
            });
            FragmentId {
                index,
                generation,
            }
        } else {
            let index = u32::try_from(self.frag_slab.len()).expect("fragment count fits in u32");
            self.frag_generations.push(0);
            self.frag_slab.push(Some(FragmentEntry {
                fragment,
                fifo_node: None,
            }));
            FragmentId {
                index,
                generation: 0,
            }
        }
    }

    fn free_fragment(&mut self, id: FragmentId) -> Option<Fragment> {
        if self.frag_generations.get(id.index as usize).copied() != Some(id.generation) {
            return None;
        }
        let entry = self.frag_slab.get_mut(id.index as usize)?.take()?;
        self.frag_generations[id.index as usize] =
            self.frag_generations[id.index as usize].wrapping_add(1);
        self.frag_free_slots.push(id.index);
        Some(entry.fragment)
    }

    /// Looks up a fragment's current descriptor.
    #[must_use]
    pub fn fragment(&self, id: FragmentId) -> Option<&Fragment> {
        if self.frag_generations.get(id.index as usize).copied() != Some(id.generation) {
            return None;
        }
        self.frag_slab.get(id.index as usize)?.as_ref().map(|e| &e.fragment)
    }

    fn fragment_mut(&mut self, id: FragmentId) -> Option<&mut Fragment> {
        if self.frag_generations.get(id.index as usize).copied() != Some(id.generation) {
            return None;
        }
        self.frag_slab.get_mut(id.index as usize)?.as_mut().map(|e| &mut e.fragment)
    }

    fn fifo(&self) -> &Fifo {
        match &self.eviction {
            Eviction::Fifo(f) => f,
            _ => panic!("cache has no FIFO"),
        }
    }

    fn fifo_mut(&mut self) -> &mut Fifo {
        match &mut self.eviction {
            Eviction::Fifo(f) => f,
            _ => panic!("cache has no FIFO"),
        }
    }

    fn free_list_mut(&mut self) -> &mut FreeList {
        match &mut self.eviction {
            Eviction::FreeList(f) => f,
            _ => panic!("cache has no free list"),
        }
    }

    // ---- 4.3.1 add-fragment ---------------------------------------

    /// Adds a new fragment of `body_size` bytes with `flags`, returning a
    /// handle to it once placed.
    ///
    /// # Errors
    ///
    /// Returns [`FcacheError::FragmentExceedsCapacity`] if the computed
    /// slot size cannot fit even an empty cache, or propagates whatever
    /// [`Cache::place`] could not locally recover from.
    pub fn add_fragment(
        &mut self,
        tag: u64,
        body_size: usize,
        extra_flags: FragmentFlags,
        registry: &UnitRegistry,
        provider: &dyn MemoryProvider,
        hooks: &mut ExternalHooks<'_>,
    ) -> Result<FragmentId, FcacheError> {
        let flags = self.base_flags() | extra_flags;
        let slot_size = self.compute_slot_size(body_size, flags);
        if self.options.max_size > 0 && slot_size > self.options.max_size {
            return Err(FcacheError::FragmentExceedsCapacity {
                slot_size,
                max_size: self.options.max_size,
            });
        }

        let mut fragment = Fragment::new(tag, body_size, flags);
        fragment.slot_extra = slot_size - body_size;
        let id = self.alloc_fragment(fragment);

        match self.place(id, slot_size, registry, provider, hooks) {
            Ok(location) => {
                if let Some(f) = self.fragment_mut(id) {
                    f.location = Some(location);
                }
                self.stats.live_fragments += 1;
                self.stats.total_placed += 1;
                Ok(id)
            }
            Err(e) => {
                self.free_fragment(id);
                Err(e)
            }
        }
    }

    // ---- 4.3.2 Placer::place ---------------------------------------

    fn place(
        &mut self,
        frag_id: FragmentId,
        slot_size: usize,
        registry: &UnitRegistry,
        provider: &dyn MemoryProvider,
        hooks: &mut ExternalHooks<'_>,
    ) -> Result<SlotLocation, FcacheError> {
        // Step 1: free-list fit (shared non-coarse caches only).
        if matches!(self.eviction, Eviction::FreeList(_)) && self.options.shared_free_list {
            if let Some(loc) = self.try_free_list_fit(frag_id, slot_size, registry) {
                self.stats.free_list_hits += 1;
                self.record_placement_accounting(frag_id, hooks);
                return Ok(loc);
            }
        }

        // Step 2: FIFO empty-slot fit (private caches).
        if matches!(self.eviction, Eviction::Fifo(_)) {
            if let Some(loc) = self.try_fifo_empty_fit(frag_id, slot_size, registry, hooks)? {
                self.stats.fifo_empty_hits += 1;
                self.record_placement_accounting(frag_id, hooks);
                return Ok(loc);
            }
        }

        // Step 3: bump-allocate at the head unit.
        if let Some(loc) = self.try_bump_head(frag_id, slot_size, registry) {
            self.stats.bump_allocations += 1;
            self.record_placement_accounting(frag_id, hooks);
            return Ok(loc);
        }

        // Step 4: grow, then restart from step 1.
        if self.try_grow(slot_size, registry, provider, hooks)? {
            self.stats.grows += 1;
            return self.place(frag_id, slot_size, registry, provider, hooks);
        }

        // Steps 5-6: FIFO victim eviction, retried once after aborting an
        // in-progress trace.
        if matches!(self.eviction, Eviction::Fifo(_)) {
            if let Some(loc) = self.try_fifo_eviction(frag_id, slot_size, registry, hooks)? {
                self.stats.evictions += 1;
                self.record_placement_accounting(frag_id, hooks);
                return Ok(loc);
            }
            hooks.trace.abort_in_progress_trace();
            if let Some(loc) = self.try_fifo_eviction(frag_id, slot_size, registry, hooks)? {
                self.stats.evictions += 1;
                self.record_placement_accounting(frag_id, hooks);
                return Ok(loc);
            }
            return Err(FcacheError::NoEvictionPossible);
        }

        Err(FcacheError::NoEvictionPossible)
    }

    fn record_placement_accounting(&mut self, frag_id: FragmentId, hooks: &mut ExternalHooks<'_>) {
        if !self.options.finite {
            return;
        }
        if self.wset.should_record(self.is_shared()) {
            let tag = self.fragment(frag_id).map(|f| f.tag);
            let regenerated = tag.is_some_and(|t| hooks.table.lookup_deleted(t));
            self.wset.record_placement(regenerated);
        }
    }

    fn try_free_list_fit(
        &mut self,
        frag_id: FragmentId,
        slot_size: usize,
        registry: &UnitRegistry,
    ) -> Option<SlotLocation> {
        let entry_id = self.free_list_mut().find_first_fit(slot_size)?;
        let (unit, offset, actual_size) = self.free_list_mut().remove(entry_id);
        let min_empty_hole = self.min_empty_hole();

        registry.with_unit_mut(unit, |u| {
            let idx = u.slot_index_at(offset).expect("free entry offset must match a slot");
            let leftover = actual_size - slot_size;
            if leftover > min_empty_hole {
                u.slots_mut()[idx] = SlotRecord {
                    offset,
                    size: slot_size,
                    kind: SlotKind::Live(frag_id),
                    follows_free_entry: u.slots()[idx].follows_free_entry,
                };
                let new_offset = offset + slot_size;
                u.slots_mut().insert(
                    idx + 1,
                    SlotRecord {
                        offset: new_offset,
                        size: leftover,
                        kind: SlotKind::Free(FreeEntryId::default_placeholder()),
                        follows_free_entry: false,
                    },
                );
            } else {
                u.slots_mut()[idx] = SlotRecord {
                    offset,
                    size: actual_size,
                    kind: SlotKind::Live(frag_id),
                    follows_free_entry: u.slots()[idx].follows_free_entry,
                };
                if let Some(next) = u.slots_mut().get_mut(idx + 1) {
                    next.follows_free_entry = false;
                }
            }
        });

        if actual_size - slot_size > min_empty_hole {
            let leftover = actual_size - slot_size;
            let new_id = self.free_list_mut().insert(unit, offset + slot_size, leftover);
            registry.with_unit_mut(unit, |u| {
                let idx = u.slot_index_at(offset + slot_size).expect("just inserted");
                u.slots_mut()[idx].kind = SlotKind::Free(new_id);
            });
        }

        self.total_size_recompute_noop();
        Some(SlotLocation {
            unit,
            offset: offset + self.header_size(self.fragment(frag_id).map_or(FragmentFlags::empty(), |f| f.flags)),
        })
    }

    fn total_size_recompute_noop(&self) {}

    fn try_fifo_empty_fit(
        &mut self,
        frag_id: FragmentId,
        slot_size: usize,
        registry: &UnitRegistry,
        hooks: &mut ExternalHooks<'_>,
    ) -> Result<Option<SlotLocation>, FcacheError> {
        let mut cursor = self.fifo().head();
        while let Some(node) = cursor {
            let Some((unit, offset, _size)) = self.fifo().empty_at(node) else {
                break;
            };
            let end_pc = registry.with_unit(unit, crate::memory::Unit::end_pc).unwrap_or(0);
            let start_pc = registry.with_unit(unit, crate::memory::Unit::start_pc).unwrap_or(0);
            if end_pc.saturating_sub(start_pc + offset) >= slot_size {
                if let Some(loc) = self.replace_run(unit, offset, slot_size, registry, hooks, frag_id)? {
                    return Ok(Some(loc));
                }
            }
            cursor = self.fifo().next(node);
        }
        Ok(None)
    }

    fn try_bump_head(
        &mut self,
        frag_id: FragmentId,
        slot_size: usize,
        registry: &UnitRegistry,
    ) -> Option<SlotLocation> {
        let head = *self.units.first()?;
        let min_tail = self.min_tail_hole();
        let offset = registry.with_unit_mut(head, |u| {
            if u.is_full() || u.tail_space() < slot_size {
                return None;
            }
            Some(u.bump(slot_size, min_tail, None))
        })??;
        registry.with_unit_mut(head, |u| {
            u.slots_mut().push(SlotRecord {
                offset,
                size: slot_size,
                kind: SlotKind::Live(frag_id),
                follows_free_entry: false,
            });
        });
        if self.options.finite && !self.wset.should_record(self.is_shared()) {
            self.wset.record_placement(false);
        }
        Some(SlotLocation {
            unit: head,
            offset: offset + self.header_size(self.fragment(frag_id).map_or(FragmentFlags::empty(), |f| f.flags)),
        })
    }

    // ---- 4.3.3 Placer::replace --------------------------------------

    fn replace_run(
        &mut self,
        unit: UnitId,
        start_offset: usize,
        slot_size: usize,
        registry: &UnitRegistry,
        hooks: &mut ExternalHooks<'_>,
        frag_id: FragmentId,
    ) -> Result<Option<SlotLocation>, FcacheError> {
        let snapshot = registry.with_unit(unit, |u| u.slots().to_vec());
        let Some(slots) = snapshot else {
            return Ok(None);
        };
        let Some(start_idx) = slots.iter().position(|s| s.offset == start_offset) else {
            return Ok(None);
        };

        let mut acc = 0usize;
        let mut consumed = Vec::new();
        let mut idx = start_idx;
        while acc < slot_size && idx < slots.len() {
            let slot = slots[idx];
            if let SlotKind::Live(fid) = slot.kind {
                if self
                    .fragment(fid)
                    .is_some_and(|f| f.flags.contains(FragmentFlags::CANNOT_DELETE))
                {
                    return Ok(None);
                }
            }
            acc += slot.size;
            consumed.push(slot);
            idx += 1;
        }

        let (cur_offset, end_offset, start_pc) =
            registry.with_unit(unit, |u| (u.cur_pc() - u.start_pc(), u.end_pc() - u.start_pc(), u.start_pc())).unwrap();
        let mut bumped = 0usize;
        if acc < slot_size {
            let deficit = slot_size - acc;
            if end_offset - cur_offset < deficit {
                return Ok(None);
            }
            registry.with_unit_mut(unit, |u| {
                let _ = u.bump(deficit, self.min_tail_hole(), None);
            });
            bumped = deficit;
            acc += deficit;
        }

        for slot in &consumed {
            if let SlotKind::Live(fid) = slot.kind {
                if let Some(entry) = self.frag_slab.get_mut(fid.index as usize).and_then(Option::as_mut) {
                    if let Some(node) = entry.fifo_node.take() {
                        self.fifo_mut().remove(node);
                    }
                }
                hooks.linker.unlink_incoming(fid);
                self.free_fragment(fid);
                self.stats.live_fragments = self.stats.live_fragments.saturating_sub(1);
                self.stats.total_removed += 1;
            } else if let SlotKind::Empty = slot.kind {
                if let Some(node) = self.fifo().find_empty_at(unit, slot.offset) {
                    self.fifo_mut().remove_empty(node);
                }
            }
        }

        let min_empty_hole = self.min_empty_hole();
        let delta = acc - slot_size;
        registry.with_unit_mut(unit, |u| {
            let slots = u.slots_mut();
            slots.retain(|s| s.offset < start_offset || s.offset >= start_offset + acc);
            let insert_at = slots.partition_point(|s| s.offset < start_offset);
            if delta > min_empty_hole {
                slots.insert(
                    insert_at,
                    SlotRecord {
                        offset: start_offset,
                        size: slot_size,
                        kind: SlotKind::Live(frag_id),
                        follows_free_entry: false,
                    },
                );
                slots.insert(
                    insert_at + 1,
                    SlotRecord {
                        offset: start_offset + slot_size,
                        size: delta,
                        kind: SlotKind::Empty,
                        follows_free_entry: false,
                    },
                );
            } else {
                slots.insert(
                    insert_at,
                    SlotRecord {
                        offset: start_offset,
                        size: acc,
                        kind: SlotKind::Live(frag_id),
                        follows_free_entry: false,
                    },
                );
            }
        });
        if delta > min_empty_hole {
            self.fifo_mut().prepend_empty(unit, start_offset + slot_size, delta);
        }

        let node = self.fifo_mut().append(frag_id);
        if let Some(entry) = self.frag_slab.get_mut(frag_id.index as usize).and_then(Option::as_mut) {
            entry.fifo_node = Some(node);
        }
        if self.options.finite {
            self.wset.record_replacement();
        }
        let _ = bumped;

        Some(SlotLocation {
            unit,
            offset: start_offset + self.header_size(self.fragment(frag_id).map_or(FragmentFlags::empty(), |f| f.flags)),
        })
        .map(Ok)
        .unwrap_or(Ok(None))
    }

    fn try_fifo_eviction(
        &mut self,
        frag_id: FragmentId,
        slot_size: usize,
        registry: &UnitRegistry,
        hooks: &mut ExternalHooks<'_>,
    ) -> Result<Option<SlotLocation>, FcacheError> {
        let mut cursor = self.fifo().head();
        // Skip the leading empty run; eviction starts at the first live
        // fragment.
        while let Some(node) = cursor {
            if self.fifo().fragment_at(node).is_some() {
                break;
            }
            cursor = self.fifo().next(node);
        }
        while let Some(node) = cursor {
            let Some(fid) = self.fifo().fragment_at(node) else {
                cursor = self.fifo().next(node);
                continue;
            };
            let Some(loc) = self.fragment(fid).and_then(|f| f.location) else {
                cursor = self.fifo().next(node);
                continue;
            };
            let unit = loc.unit;
            let offset = registry.with_unit(unit, |u| u.slot_index_at(loc.offset - self.header_size(self.fragment(fid).unwrap().flags)));
            let Some(Some(_)) = offset else {
                cursor = self.fifo().next(node);
                continue;
            };
            let header_offset = loc.offset - self.header_size(self.fragment(fid).unwrap().flags);
            if let Some(l) = self.replace_run(unit, header_offset, slot_size, registry, hooks, frag_id)? {
                return Ok(Some(l));
            }
            cursor = self.fifo().next(node);
        }
        Ok(None)
    }

    // ---- 4.3.4 working-set-gated growth -------------------------------

    fn try_grow(
        &mut self,
        slot_size: usize,
        registry: &UnitRegistry,
        provider: &dyn MemoryProvider,
        hooks: &mut ExternalHooks<'_>,
    ) -> Result<bool, FcacheError> {
        if self.options.finite {
            let decision = self.wset.permit_growth(&self.options, self.total_size, slot_size, self.is_shared());
            if !decision.permit {
                return Ok(false);
            }
            if decision.flush_oldest {
                self.stage_oldest_for_flush(registry);
            }
        } else if self.options.max_size > 0 && self.total_size + slot_size > self.options.max_size {
            return Ok(false);
        }

        if let Some(&head) = self.units.first() {
            let (reserved_end, end_pc) =
                registry.with_unit(head, |u| (u.reserved_end_pc(), u.end_pc())).unwrap();
            if reserved_end > end_pc {
                let delta = self.options.commit_increment.min(reserved_end - end_pc);
                let extended = registry
                    .with_unit_mut(head, |u| u.extend_commit(provider, delta))
                    .unwrap_or(Ok(()));
                extended?;
                registry.reregister(head);
                self.total_size += delta;
                return Ok(true);
            }

            let unit_size = registry.with_unit(head, |u| u.reserved_end_pc() - u.start_pc()).unwrap_or(0);
            let private_resizable = self.sharing == Sharing::Private && self.kind != CacheKind::CoarseBb;
            if unit_size < self.options.unit_max && private_resizable {
                self.resize_head_unit(registry, provider, hooks, slot_size)?;
                return Ok(true);
            }
        }

        self.create_unit(registry, provider, slot_size)?;
        Ok(true)
    }

    fn stage_oldest_for_flush(&mut self, registry: &UnitRegistry) {
        if self.units.len() < 2 {
            return;
        }
        let oldest = *self.units.last().expect("checked len >= 2");
        self.mark_unit_for_flush(oldest, registry);
    }

    /// `FlushEngine::mark`: moves `unit` from this cache's local unit list
    /// and the registry's live list onto the to-flush list. Returns
    /// `false` if `unit` is not (or no longer) one of this cache's units.
    ///
    /// Called before any quiesce is requested; the slot walk that chains
    /// this unit's live fragments for unlinking happens later, once the
    /// unit has actually been stolen off the to-flush list under quiesce
    /// (see [`crate::flush::FlushEngine::flush_pending`] and
    /// [`Cache::prepare_unit_for_flush`]).
    pub fn mark_unit_for_flush(&mut self, unit: UnitId, registry: &UnitRegistry) -> bool {
        let Some(pos) = self.units.iter().position(|&u| u == unit) else {
            return false;
        };
        self.units.remove(pos);
        let size = registry.with_unit(unit, crate::memory::Unit::size).unwrap_or(0);
        self.total_size = self.total_size.saturating_sub(size);
        registry.remove_live(unit);
        registry.stage_to_flush(unit);
        self.stats.units_flushed += 1;
        tracing::info!(unit = unit.index, kind = ?self.kind, "marked fcache unit for flush");
        true
    }

    /// `FlushEngine::chain`'s per-unit preparation, run once per stolen
    /// unit while the quiesce is in effect (step 3 of §4.6): classifies
    /// every slot, unlinks free-list entries from this cache's buckets,
    /// and collects the fragment ids of every live fragment the unit
    /// held so the caller can hand them to the linker as one chain.
    ///
    /// The fragment slab entries are released here: once the unit is
    /// `pending_free` its memory is about to be discarded, so there is
    /// nothing left for [`Cache::remove_fragment`] to act on later.
    pub fn prepare_unit_for_flush(&mut self, unit: UnitId, registry: &UnitRegistry) -> Vec<FragmentId> {
        let slots = registry.with_unit(unit, |u| u.slots().to_vec()).unwrap_or_default();
        let mut chain = Vec::new();
        for slot in slots {
            match slot.kind {
                SlotKind::Free(entry_id) => {
                    if let Eviction::FreeList(_) = &self.eviction {
                        self.free_list_mut().remove(entry_id);
                    }
                }
                SlotKind::Live(fid) => {
                    if let Some(entry) = self.frag_slab.get_mut(fid.index as usize).and_then(Option::as_mut) {
                        if let Some(node) = entry.fifo_node.take() {
                            self.fifo_mut().remove(node);
                        }
                    }
                    chain.push(fid);
                    self.free_fragment(fid);
                    self.stats.live_fragments = self.stats.live_fragments.saturating_sub(1);
                }
                SlotKind::Empty => {
                    if let Some(node) = self.fifo().find_empty_at(unit, slot.offset) {
                        self.fifo_mut().remove_empty(node);
                    }
                }
            }
        }
        self.stats.live_units = self.stats.live_units.saturating_sub(1);
        chain
    }

    /// A proactive reset's per-cache preparation: removes `unit` from this
    /// cache's local unit list (the registry's live-list removal and
    /// `pending_free` stamp are the caller's job, see
    /// [`crate::flush::FlushEngine::proactive_reset`]) and runs the same
    /// slot walk [`Cache::prepare_unit_for_flush`] does.
    pub fn retire_unit_for_reset(&mut self, unit: UnitId, registry: &UnitRegistry) -> Vec<FragmentId> {
        if let Some(pos) = self.units.iter().position(|&u| u == unit) {
            self.units.remove(pos);
            let size = registry.with_unit(unit, crate::memory::Unit::size).unwrap_or(0);
            self.total_size = self.total_size.saturating_sub(size);
        }
        self.prepare_unit_for_flush(unit, registry)
    }

    /// Every non-head unit this cache currently owns, i.e. the set a
    /// capacity-driven proactive reset retires (the head stays so the
    /// cache keeps somewhere to place into immediately afterwards).
    #[must_use]
    pub fn non_head_units(&self) -> Vec<UnitId> {
        self.units.iter().copied().skip(1).collect()
    }

    /// Whether this cache's unit-creation count has crossed its configured
    /// `reset_at_nth_unit` (before any reset) or `reset_every_nth_unit`
    /// (after the first) threshold. Zero disables the corresponding check.
    #[must_use]
    pub fn should_reset(&self) -> bool {
        let created = self.stats.total_units_created;
        if self.stats.proactive_resets == 0 {
            self.options.reset_at_nth_unit > 0
                && created >= u64::from(self.options.reset_at_nth_unit)
        } else {
            self.options.reset_every_nth_unit > 0
                && created.saturating_sub(self.units_at_last_reset)
                    >= u64::from(self.options.reset_every_nth_unit)
        }
    }

    /// Records that this cache just participated in a proactive reset, so
    /// the next `reset_every_nth_unit` window starts counting from here.
    pub fn note_reset(&mut self) {
        self.units_at_last_reset = self.stats.total_units_created;
        self.stats.proactive_resets += 1;
    }

    /// Records that one of this cache's units was physically reclaimed by
    /// [`crate::flush::FlushEngine::reap`]. Attribution happens at the
    /// [`crate::manager::CacheManager`] level, which is the only place
    /// that still knows a reclaimed unit's owner.
    pub fn note_unit_reaped(&mut self) {
        self.stats.units_reaped += 1;
    }

    fn create_unit(
        &mut self,
        registry: &UnitRegistry,
        provider: &dyn MemoryProvider,
        slot_size: usize,
    ) -> Result<UnitId, FcacheError> {
        // A fresh unit reserves only as much as it initially commits: for a
        // shared cache `unit_init == unit_max` so this is the same either
        // way, but a private cache's first unit must NOT reserve unit_max
        // up front, or it would never hit the `unit_size < unit_max` branch
        // in `try_grow` and in-place resize (with its shift/relink pass)
        // would be unreachable. `resize_head_unit` reserves `unit_max` for
        // the unit it grows into, so growth past the first resize is a
        // cheap commit extension rather than another move.
        let commit = self.options.unit_init.max(slot_size);
        let reserved = commit;
        let id = match registry.take_dead(reserved, self.total_size, self.options.max_size) {
            Some(id) => {
                registry.with_unit_mut(id, crate::memory::Unit::reset_for_reuse);
                let committed = registry.with_unit(id, crate::memory::Unit::size).unwrap_or(0);
                if committed < commit {
                    let delta = commit - committed;
                    let _ = registry.with_unit_mut(id, |u| u.extend_commit(provider, delta));
                }
                registry.reregister(id);
                id
            }
            None => registry.create_unit(provider, reserved, commit)?,
        };
        registry.with_unit_mut(id, |u| u.set_owner(self.owner));
        let committed = registry.with_unit(id, crate::memory::Unit::size).unwrap_or(0);
        self.units.insert(0, id);
        self.total_size += committed;
        self.stats.live_units += 1;
        self.stats.total_units_created += 1;
        tracing::info!(
            unit = id.index,
            kind = ?self.kind,
            sharing = ?self.sharing,
            committed,
            "created fcache unit"
        );
        Ok(id)
    }

    // ---- 4.3.5 in-place resize (private only) -------------------------

    fn resize_head_unit(
        &mut self,
        registry: &UnitRegistry,
        provider: &dyn MemoryProvider,
        hooks: &mut ExternalHooks<'_>,
        slot_size: usize,
    ) -> Result<(), FcacheError> {
        let old = *self.units.first().expect("caller checked a head unit exists");
        let old_size = registry.with_unit(old, crate::memory::Unit::size).unwrap_or(0);
        let multiplier = if old_size * RESIZE_QUADRUPLE <= self.options.unit_quadruple {
            RESIZE_QUADRUPLE
        } else {
            RESIZE_DOUBLE
        };
        let new_size = (old_size * multiplier)
            .max(slot_size * SINGLE_MAX_MULT)
            .min(self.options.unit_max);

        self.consistent = false;
        let new_id = registry.create_unit(provider, self.options.unit_max, new_size)?;
        registry.with_unit_mut(new_id, |u| u.set_owner(self.owner));
        tracing::info!(old_size, new_size, "resizing fcache unit in place");

        let (old_start, shifted) = registry
            .with_unit(old, |u| (u.start_pc(), u.slots().to_vec()))
            .unwrap_or((0, Vec::new()));
        let new_start = registry.with_unit(new_id, crate::memory::Unit::start_pc).unwrap_or(0);
        let shift: isize = isize::try_from(new_start).unwrap_or(0) - isize::try_from(old_start).unwrap_or(0);

        registry.with_unit_mut(new_id, |u| {
            for slot in &shifted {
                u.slots_mut().push(*slot);
            }
            let bumped = shifted.iter().map(|s| s.size).sum();
            let _ = u.bump(bumped, self.min_tail_hole(), None);
        });

        for slot in &shifted {
            if let SlotKind::Live(fid) = slot.kind {
                let header = self.header_size(self.fragment(fid).map_or(FragmentFlags::empty(), |f| f.flags));
                hooks.shifter.shift(fid, shift, old_start, old_start + old_size);
                if let Some(f) = self.fragment_mut(fid) {
                    f.location = Some(SlotLocation {
                        unit: new_id,
                        offset: slot.offset + header,
                    });
                }
                hooks.linker.link_incoming(fid, fid);
            }
        }

        registry.unregister(old);
        registry.with_unit_mut(old, crate::memory::Unit::mark_pending_free);
        registry.park_dead(old, 5, provider);

        self.units[0] = new_id;
        self.total_size = self.total_size - old_size
            + registry.with_unit(new_id, crate::memory::Unit::size).unwrap_or(0);
        self.consistent = true;
        Ok(())
    }

    // ---- 4.3.6 remove-fragment ---------------------------------------

    /// Removes `id` from the cache, returning its slot to the free list
    /// (shared) or a FIFO empty placeholder (private).
    ///
    /// No-op (besides bookkeeping) if the owning unit is already
    /// `pending_free`: the whole unit will be reclaimed shortly by the
    /// flush protocol.
    pub fn remove_fragment(&mut self, id: FragmentId, registry: &UnitRegistry) {
        let Some(location) = self.fragment(id).and_then(|f| f.location) else {
            return;
        };
        let header = self.header_size(self.fragment(id).map(|f| f.flags).unwrap_or_default());
        let offset = location.offset - header;

        let pending_free = registry.with_unit(location.unit, crate::memory::Unit::is_pending_free).unwrap_or(true);
        if pending_free {
            self.free_fragment(id);
            return;
        }

        let slot_size = registry
            .with_unit(location.unit, |u| u.slot_index_at(offset).map(|i| u.slots()[i].size))
            .flatten()
            .unwrap_or(0);

        if let Some(entry) = self.frag_slab.get_mut(id.index as usize).and_then(Option::as_mut) {
            if let Some(node) = entry.fifo_node.take() {
                self.fifo_mut().remove(node);
            }
        }

        match &self.eviction {
            Eviction::FreeList(_) => self.free_list_add(location.unit, offset, slot_size, registry),
            Eviction::Fifo(_) => {
                self.fifo_mut().prepend_empty(location.unit, offset, slot_size);
                registry.with_unit_mut(location.unit, |u| {
                    if let Some(idx) = u.slot_index_at(offset) {
                        u.slots_mut()[idx].kind = SlotKind::Empty;
                    }
                });
            }
            Eviction::None => {}
        }

        self.free_fragment(id);
        self.stats.live_fragments = self.stats.live_fragments.saturating_sub(1);
        self.stats.total_removed += 1;
    }

    // ---- 4.4 FreeList::add ---------------------------------------

    fn free_list_add(&mut self, unit: UnitId, pc: usize, size: usize, registry: &UnitRegistry) {
        if size > MAX_FREE_ENTRY_SIZE {
            self.stats.leaked_free_entries += 1;
            registry.with_unit_mut(unit, |u| {
                if let Some(idx) = u.slot_index_at(pc) {
                    u.slots_mut().remove(idx);
                }
            });
            return;
        }

        let mut pc = pc;
        let mut size = size;

        // Return-to-tail: shrink the bump pointer instead of creating an
        // entry, if this is the head unit's current tail.
        let is_head_tail = self.units.first() == Some(&unit)
            && registry.with_unit(unit, |u| u.cur_pc() - u.start_pc() == pc + size).unwrap_or(false);
        if is_head_tail {
            registry.with_unit_mut(unit, |u| {
                if let Some(idx) = u.slot_index_at(pc) {
                    u.slots_mut().remove(idx);
                }
                u.retract_bump_to(pc);
            });
            return;
        }

        // Forward coalesce.
        let next_offset = pc + size;
        let next_kind = registry.with_unit(unit, |u| u.slot_index_at(next_offset).map(|i| u.slots()[i].kind));
        if let Some(Some(SlotKind::Free(_))) = next_kind {
            if let Some(next_id) = self.free_list_mut().find_at(unit, next_offset) {
                let (_, _, next_size) = self.free_list_mut().remove(next_id);
                if size + next_size <= MAX_FREE_ENTRY_SIZE {
                    size += next_size;
                    registry.with_unit_mut(unit, |u| {
                        if let Some(idx) = u.slot_index_at(next_offset) {
                            u.slots_mut().remove(idx);
                        }
                    });
                }
            }
        } else if let Some(Some(SlotKind::Live(_))) = next_kind {
            registry.with_unit_mut(unit, |u| {
                if let Some(idx) = u.slot_index_at(next_offset) {
                    u.slots_mut()[idx].follows_free_entry = true;
                }
            });
        }

        // Backward coalesce via `FOLLOWS_FREE_ENTRY`.
        let follows_free = registry
            .with_unit(unit, |u| u.slot_index_at(pc).map(|i| u.slots()[i].follows_free_entry))
            .flatten()
            .unwrap_or(false);
        if follows_free {
            if let Some(prev_id) = self.find_preceding_free(unit, pc, registry) {
                let (_, prev_offset, prev_size) = self.free_list_mut().remove(prev_id);
                if prev_size + size <= MAX_FREE_ENTRY_SIZE {
                    registry.with_unit_mut(unit, |u| {
                        if let Some(idx) = u.slot_index_at(pc) {
                            u.slots_mut().remove(idx);
                        }
                    });
                    pc = prev_offset;
                    size += prev_size;
                }
            }
        }

        let id = self.free_list_mut().insert(unit, pc, size);
        registry.with_unit_mut(unit, |u| {
            if let Some(idx) = u.slot_index_at(pc) {
                u.slots_mut()[idx] = SlotRecord {
                    offset: pc,
                    size,
                    kind: SlotKind::Free(id),
                    follows_free_entry: u.slots()[idx].follows_free_entry,
                };
            } else {
                let insert_at = u.slots().partition_point(|s| s.offset < pc);
                u.slots_mut().insert(
                    insert_at,
                    SlotRecord {
                        offset: pc,
                        size,
                        kind: SlotKind::Free(id),
                        follows_free_entry: false,
                    },
                );
            }
        });
    }

    fn find_preceding_free(&self, unit: UnitId, pc: usize, registry: &UnitRegistry) -> Option<FreeEntryId> {
        let prev_offset = registry.with_unit(unit, |u| {
            let idx = u.slot_index_at(pc)?;
            idx.checked_sub(1).map(|i| u.slots()[i].offset)
        })??;
        self.free_list_mut_ref().find_at(unit, prev_offset)
    }

    fn free_list_mut_ref(&self) -> &FreeList {
        match &self.eviction {
            Eviction::FreeList(f) => f,
            _ => panic!("cache has no free list"),
        }
    }

    // ---- 4.7 pclookup --------------------------------------------

    /// Resolves `pc` to the fragment owning it, walking contiguous slots
    /// from the unit's `start_pc`. Returns `None` if `pc` is not claimed
    /// by any live fragment in any unit this cache owns.
    #[must_use]
    pub fn pclookup_in_unit(&self, unit: UnitId, pc: usize, registry: &UnitRegistry) -> Option<FragmentId> {
        registry.with_unit(unit, |u| {
            let target = pc.checked_sub(u.start_pc())?;
            for slot in u.slots() {
                if slot.offset > target {
                    break;
                }
                if let SlotKind::Live(fid) = slot.kind {
                    if target < slot.offset + slot.size {
                        return Some(fid);
                    }
                }
            }
            None
        })?
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("kind", &self.kind)
            .field("sharing", &self.sharing)
            .field("total_size", &self.total_size)
            .field("units", &self.units.len())
            .field("consistent", &self.consistent)
            .finish()
    }
}

impl FreeEntryId {
    /// Placeholder used only transiently while splitting a free-list fit;
    /// overwritten with the real id before any code observes it.
    fn default_placeholder() -> Self {
        Self(u32::MAX, u32::MAX)
    }
}
