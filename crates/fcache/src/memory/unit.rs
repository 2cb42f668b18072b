//! A single contiguous executable memory region owned by a cache.
//!
//! A `Unit` reserves `[start_pc, reserved_end_pc)`, commits a prefix
//! `[start_pc, end_pc)`, and hands out space from a bump pointer `cur_pc`
//! below which every byte belongs to exactly one slot. Classic dynamic
//! binary translators pack a `flags` word at a fixed offset shared by
//! three different struct layouts so one read can classify a slot; here
//! that trick is replaced by an explicit tagged union, [`SlotKind`], so
//! the in-cache walker classifies a slot from this record, not a raw byte
//! read.

use crate::error::FcacheError;
use crate::fragment::FragmentId;
use crate::memory::provider::{MemoryProvider, Protection};

/// Stable identifier for a [`Unit`] inside a [`crate::memory::UnitRegistry`].
///
/// An index into the registry's unit slab, paired with a generation so a
/// reused slab slot cannot be confused with a stale `UnitId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Identifies the free-list entry occupying a slot, for slots classified
/// as [`SlotKind::Free`]. Defined here (rather than in the cache module)
/// so `Unit`'s slot bookkeeping does not need to depend on the cache.
/// `.0` is the slab index, `.1` the generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreeEntryId(pub(crate) u32, pub(crate) u32);

/// What occupies a slot, as classified by the cache that wrote it.
///
/// A tagged union in place of the original's offset-coincident `flags`
/// trick: classification is a plain Rust enum match, not a raw memory
/// read at a magic offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// A live, placed fragment.
    Live(FragmentId),
    /// A FIFO empty placeholder (private caches only).
    Empty,
    /// A free-list entry (shared non-coarse caches only).
    Free(FreeEntryId),
}

/// One maximally-packed subrange of a [`Unit`]: a header plus a body.
///
/// The ordered list of a unit's `SlotRecord`s *is* the contiguous walk
/// walking from index 0 and summing `size` always lands exactly on the
/// next header, and the walk terminates at `cur_pc` by construction,
/// since records are only ever appended or mutated in place, never left
/// with gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRecord {
    /// Byte offset of this slot's header from the unit's `start_pc`.
    pub offset: usize,
    /// Total slot size (header + body + any absorbed padding).
    pub size: usize,
    /// What this slot currently holds.
    pub kind: SlotKind,
    /// Set when the slot immediately preceding this one is a free-list
    /// entry (mirrors `FRAG_FOLLOWS_FREE_ENTRY`); meaningless for
    /// non-`Live` slots.
    pub follows_free_entry: bool,
}

/// A contiguous executable memory region owned by exactly one cache.
pub struct Unit {
    id: UnitId,
    base: *mut u8,
    reserved_size: usize,
    /// Bytes committed so far: `end_pc == start_pc + committed_size`.
    committed_size: usize,
    /// Bump offset from `start_pc`: `cur_pc == start_pc + bump_offset`.
    bump_offset: usize,
    /// No more bump allocation is possible (tail absorbed as overhead or
    /// too small to hold another slot).
    full: bool,
    /// Current page protection: `true` means RWX, `false` means RX.
    writable: bool,
    /// Retired: contents are about to be discarded once flushtime drains.
    pending_free: bool,
    /// Monotonic epoch stamped when retired; zero while live.
    flushtime: u32,
    /// Contiguous-walk slot records, in physical order.
    slots: Vec<SlotRecord>,
    /// Back-link to the logical cache that owns this unit. `None` only
    /// between `create`/`from_reserved` and the owning `Cache` stamping
    /// itself on; every unit observable outside `Cache::create_unit` has
    /// one.
    owner: Option<crate::cache::CacheOwner>,
}

// SAFETY: `base` points at memory this `Unit` exclusively owns for its
// lifetime; all mutation goes through `&mut self` methods, so there is no
// concurrent raw access through the pointer itself.
unsafe impl Send for Unit {}

impl Unit {
    /// Reserves and commits a new unit through `provider`, returning a
    /// fresh, empty `Unit` at `cur_pc == start_pc`.
    ///
    /// # Errors
    ///
    /// Propagates [`FcacheError::OutOfReservation`] from the provider.
    pub fn create(
        id: UnitId,
        provider: &dyn MemoryProvider,
        reserved_size: usize,
        initial_commit_size: usize,
    ) -> Result<Self, FcacheError> {
        let base = provider.reserve(reserved_size, initial_commit_size)?;
        Ok(Self::from_reserved(id, base, reserved_size, initial_commit_size))
    }

    /// Builds a `Unit` around an already-reserved range. Used by
    /// [`crate::memory::UnitRegistry::create_unit`], which must reserve
    /// memory before it can claim a slab slot for the unit's identifier.
    #[must_use]
    pub fn from_reserved(id: UnitId, base: *mut u8, reserved_size: usize, committed_size: usize) -> Self {
        Self {
            id,
            base,
            reserved_size,
            committed_size,
            bump_offset: 0,
            full: false,
            writable: true,
            pending_free: false,
            flushtime: 0,
            slots: Vec::new(),
            owner: None,
        }
    }

    /// Stamps (or re-stamps, after reuse from the dead list) the owning
    /// cache's identity.
    pub fn set_owner(&mut self, owner: crate::cache::CacheOwner) {
        self.owner = Some(owner);
    }

    /// The logical cache that owns this unit, if stamped.
    #[must_use]
    pub fn owner(&self) -> Option<crate::cache::CacheOwner> {
        self.owner
    }

    /// This unit's identifier.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Start of the reserved range, as an address (for interval-map keys
    /// and pc arithmetic).
    #[must_use]
    pub fn start_pc(&self) -> usize {
        self.base as usize
    }

    /// End of the committed range (`start_pc + committed_size`).
    #[must_use]
    pub fn end_pc(&self) -> usize {
        self.start_pc() + self.committed_size
    }

    /// End of the reserved range (`start_pc + reserved_size`).
    #[must_use]
    pub fn reserved_end_pc(&self) -> usize {
        self.start_pc() + self.reserved_size
    }

    /// Current bump pointer (`start_pc + bump_offset`).
    #[must_use]
    pub fn cur_pc(&self) -> usize {
        self.start_pc() + self.bump_offset
    }

    /// Bytes still uncommitted within the reservation.
    #[must_use]
    pub fn uncommitted(&self) -> usize {
        self.reserved_size - self.committed_size
    }

    /// Bytes committed but not yet claimed by any slot.
    #[must_use]
    pub fn tail_space(&self) -> usize {
        self.committed_size - self.bump_offset
    }

    /// Total committed size of this unit.
    #[must_use]
    pub fn size(&self) -> usize {
        self.committed_size
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn set_full(&mut self, full: bool) {
        self.full = full;
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub fn is_pending_free(&self) -> bool {
        self.pending_free
    }

    pub fn mark_pending_free(&mut self) {
        self.pending_free = true;
    }

    #[must_use]
    pub fn flushtime(&self) -> u32 {
        self.flushtime
    }

    pub fn set_flushtime(&mut self, t: u32) {
        self.flushtime = t;
    }

    /// Clears retirement state so a unit can be reused from the dead list.
    pub fn reset_for_reuse(&mut self) {
        self.pending_free = false;
        self.flushtime = 0;
        self.full = false;
        self.bump_offset = 0;
        self.slots.clear();
        self.owner = None;
    }

    /// The contiguous-walk slot records, in physical order.
    #[must_use]
    pub fn slots(&self) -> &[SlotRecord] {
        &self.slots
    }

    #[must_use]
    pub fn slots_mut(&mut self) -> &mut Vec<SlotRecord> {
        &mut self.slots
    }

    /// Finds the index into [`Unit::slots`] of the record whose header
    /// starts at `offset`, if any.
    #[must_use]
    pub fn slot_index_at(&self, offset: usize) -> Option<usize> {
        self.slots.binary_search_by_key(&offset, |s| s.offset).ok()
    }

    /// Grows `end_pc` by `delta` (a multiple of the commit increment),
    /// without moving `reserved_end_pc`.
    ///
    /// # Errors
    ///
    /// Returns [`FcacheError::OutOfReservation`] if `delta` would push
    /// `end_pc` past `reserved_end_pc`, or if the provider's commitment
    /// call fails.
    pub fn extend_commit(
        &mut self,
        provider: &dyn MemoryProvider,
        delta: usize,
    ) -> Result<(), FcacheError> {
        if self.committed_size + delta > self.reserved_size {
            return Err(FcacheError::OutOfReservation { requested: delta });
        }
        // SAFETY: `end_pc()` is within `[base, base + reserved_size)`,
        // which this unit exclusively owns.
        let end_ptr = unsafe { self.base.add(self.committed_size) };
        provider.extend_commitment(end_ptr, delta)?;
        self.committed_size += delta;
        Ok(())
    }

    /// Returns `cur_pc` and advances it by `n` bytes, claiming
    /// `[cur_pc, cur_pc + n)` for a new slot.
    ///
    /// If the remaining tail after the bump is smaller than `min_tail_hole`,
    /// the unit is marked `full`: when `rest_empty` is set the leftover is
    /// turned into a single empty/free slot record (caller-supplied via
    /// `tail_kind`) rather than silently absorbed as overhead.
    ///
    /// # Panics
    ///
    /// Panics if `n` would advance `cur_pc` past `end_pc`; callers must
    /// check `tail_space() >= n` first; this is an internal bug, not a
    /// recoverable condition.
    pub fn bump(
        &mut self,
        n: usize,
        min_tail_hole: usize,
        rest_empty: Option<SlotKind>,
    ) -> usize {
        assert!(
            self.bump_offset + n <= self.committed_size,
            "bump() called without sufficient tail space"
        );
        let offset = self.bump_offset;
        self.bump_offset += n;
        let remaining = self.committed_size - self.bump_offset;
        if remaining < min_tail_hole {
            if remaining > 0 {
                if let Some(kind) = rest_empty {
                    self.slots.push(SlotRecord {
                        offset: self.bump_offset,
                        size: remaining,
                        kind,
                        follows_free_entry: false,
                    });
                    self.bump_offset = self.committed_size;
                }
            }
            self.full = true;
        }
        offset
    }

    /// Retracts the bump pointer to `offset`, reclaiming a trailing slot
    /// that just became free as unclaimed tail space instead of a tracked
    /// free-list entry. Clears `full` since the unit can bump-allocate
    /// into the reclaimed space again.
    pub fn retract_bump_to(&mut self, offset: usize) {
        self.bump_offset = offset;
        self.full = false;
    }

    /// Transitions page protection between RX and RWX. A no-op if already
    /// in the requested state.
    pub fn set_writable(&mut self, provider: &dyn MemoryProvider, writable: bool) {
        if self.writable == writable {
            return;
        }
        let prot = if writable {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadExecute
        };
        provider.set_protection(self.base, self.committed_size, prot);
        self.writable = writable;
    }

    /// Releases this unit's reservation back to the host.
    pub fn unmap(&self, provider: &dyn MemoryProvider) {
        provider.unmap(self.base, self.reserved_size);
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("start_pc", &format_args!("{:#x}", self.start_pc()))
            .field("cur_pc", &format_args!("{:#x}", self.cur_pc()))
            .field("end_pc", &format_args!("{:#x}", self.end_pc()))
            .field("reserved_end_pc", &format_args!("{:#x}", self.reserved_end_pc()))
            .field("full", &self.full)
            .field("writable", &self.writable)
            .field("pending_free", &self.pending_free)
            .field("flushtime", &self.flushtime)
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::provider::MmapMemoryProvider;

    fn test_id() -> UnitId {
        UnitId {
            index: 0,
            generation: 0,
        }
    }

    #[test]
    fn create_reserves_and_commits() {
        let provider = MmapMemoryProvider::new();
        let unit = Unit::create(test_id(), &provider, 64 * 1024, 4096).unwrap();
        assert_eq!(unit.size(), 4096);
        assert_eq!(unit.cur_pc(), unit.start_pc());
        assert_eq!(unit.end_pc() - unit.start_pc(), 4096);
        assert_eq!(unit.reserved_end_pc() - unit.start_pc(), 64 * 1024);
        assert!(!unit.is_full());
        unit.unmap(&provider);
    }

    #[test]
    fn bump_advances_and_marks_full_on_small_tail() {
        let provider = MmapMemoryProvider::new();
        let mut unit = Unit::create(test_id(), &provider, 8192, 128).unwrap();
        let off = unit.bump(120, 16, None);
        assert_eq!(off, 0);
        assert!(unit.is_full(), "remaining 8 bytes < min_tail_hole 16");
        unit.unmap(&provider);
    }

    #[test]
    fn bump_rest_empty_creates_trailing_slot() {
        let provider = MmapMemoryProvider::new();
        let mut unit = Unit::create(test_id(), &provider, 8192, 128).unwrap();
        let _ = unit.bump(100, 16, Some(SlotKind::Empty));
        assert!(unit.is_full());
        assert_eq!(unit.cur_pc(), unit.end_pc(), "tail absorbed into a slot");
        assert_eq!(unit.slots().len(), 1);
        assert_eq!(unit.slots()[0].size, 28);
        unit.unmap(&provider);
    }

    #[test]
    fn extend_commit_rejects_crossing_reservation() {
        let provider = MmapMemoryProvider::new();
        let mut unit = Unit::create(test_id(), &provider, 4096, 4096).unwrap();
        let err = unit.extend_commit(&provider, 4096).unwrap_err();
        assert!(matches!(err, FcacheError::OutOfReservation { .. }));
        unit.unmap(&provider);
    }

    #[test]
    fn set_writable_is_idempotent() {
        let provider = MmapMemoryProvider::new();
        let mut unit = Unit::create(test_id(), &provider, 4096, 4096).unwrap();
        assert!(unit.is_writable());
        unit.set_writable(&provider, true);
        assert!(unit.is_writable());
        unit.set_writable(&provider, false);
        assert!(!unit.is_writable());
        unit.unmap(&provider);
    }
}
