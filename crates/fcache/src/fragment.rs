//! Fragment descriptors and the flags that classify a slot.
//!
//! The translator, linker, and fragment table are external collaborators
//! (out of scope for this crate); what the cache needs from a fragment is
//! the small, fixed descriptor defined here. The cache is the sole owner of
//! [`Fragment`] records; callers receive an opaque [`FragmentId`] handle
//! back from [`crate::cache::Cache::add_fragment`] and look up fields
//! through it.

use bitflags::bitflags;

bitflags! {
    /// Bits describing a fragment's kind and placement state.
    ///
    /// `fcache.c` derives `USE_FIFO`/`USE_FREE_LIST` purely from these bits
    /// on the fragment rather than only from the owning cache, which keeps
    /// a fragment descriptor self-describing; this crate preserves that.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FragmentFlags: u32 {
        /// This fragment is a trace (as opposed to a single basic block).
        const IS_TRACE = 1 << 0;
        /// This fragment lives in a process-shared cache.
        const SHARED = 1 << 1;
        /// This fragment lives in a coarse-grain cache (no in-cache header).
        const COARSE = 1 << 2;
        /// This slot is an empty placeholder, not a live fragment.
        const IS_EMPTY_SLOT = 1 << 3;
        /// This slot is a free-list entry, not a live fragment.
        const FCACHE_FREE_LIST = 1 << 4;
        /// The slot immediately preceding this fragment in its unit is a
        /// free-list entry; enables backward coalescing via the footer.
        const FOLLOWS_FREE_ENTRY = 1 << 5;
        /// This fragment must not be evicted (e.g. currently executing or
        /// linked to by an in-progress trace).
        const CANNOT_DELETE = 1 << 6;
        /// At least one other fragment's direct exit has been linked to
        /// this fragment's entry point.
        const LINKED_INCOMING = 1 << 7;
        /// This fragment was logically deleted while still physically
        /// present (lazy deletion pending a flush).
        const WAS_DELETED = 1 << 8;
        /// This fragment is sandboxed for self-modifying-code detection.
        const SELFMOD_SANDBOXED = 1 << 9;
        /// This is a synthetic fragment used only for internal bookkeeping
        /// (never really executed).
        const FAKE = 1 << 10;
    }
}

/// Opaque handle to a fragment owned by a [`crate::cache::Cache`].
///
/// Stable for the fragment's lifetime in the cache; becomes invalid once
/// the fragment is removed (via [`crate::cache::Cache::remove_fragment`])
/// or its unit is flushed. Carries a generation counter so a reused arena
/// slot cannot be mistaken for a stale handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// The physical location of a fragment's slot: which unit it lives in, and
/// its byte offset from that unit's `start_pc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLocation {
    /// The unit this slot lives in.
    pub unit: crate::memory::UnitId,
    /// Byte offset of the slot header from the unit's `start_pc`.
    pub offset: usize,
}

/// A fragment descriptor as understood by the cache.
///
/// Populated at `add_fragment` time from the caller's requested tag/size/
/// flags; `start_pc` and `slot_extra` are filled in by the placer once a
/// slot has been chosen (mirroring the usual add-fragment contract:
/// record the address written into the fragment's `start_pc`).
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Guest PC (or other translator-assigned tag) this fragment
    /// represents. Opaque to the cache; used only for table lookups by
    /// the external fragment table.
    pub tag: u64,
    /// Requested body size in bytes, as given by the caller at
    /// `add_fragment` time.
    pub body_size: usize,
    /// Classification and state bits.
    pub flags: FragmentFlags,
    /// Padding bytes between the end of the body and the end of the slot;
    /// lets the translator locate the header from the body's end.
    pub slot_extra: usize,
    /// Where this fragment's slot physically lives, once placed.
    pub location: Option<SlotLocation>,
}

impl Fragment {
    /// Creates a new, not-yet-placed fragment descriptor.
    #[must_use]
    pub fn new(tag: u64, body_size: usize, flags: FragmentFlags) -> Self {
        Self {
            tag,
            body_size,
            flags,
            slot_extra: 0,
            location: None,
        }
    }

    /// Whether this fragment belongs to a shared (non-coarse) cache and
    /// therefore must be placed via the free list rather than the FIFO.
    #[must_use]
    pub fn uses_free_list(&self) -> bool {
        self.flags.contains(FragmentFlags::SHARED) && !self.flags.contains(FragmentFlags::COARSE)
    }

    /// Whether this fragment belongs to a private cache and therefore must
    /// be placed and evicted via the FIFO.
    #[must_use]
    pub fn uses_fifo(&self) -> bool {
        !self.flags.contains(FragmentFlags::SHARED)
    }
}

/// Builds a `FragmentId` for use in unit tests of other modules that need
/// a stand-in identifier without a real `Cache` to place it in.
#[cfg(test)]
pub(crate) fn test_fragment_id(index: u32) -> FragmentId {
    FragmentId {
        index,
        generation: 0,
    }
}
