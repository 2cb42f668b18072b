//! Error types for the fragment cache manager.
//!
//! This module defines the failure modes the cache manager can surface. It
//! provides:
//! 1. **`FcacheError`:** The unified error type returned by fallible public
//!    operations (placement, configuration, flush).
//! 2. **Propagation policy:** Most internal failures are handled locally by
//!    retrying an alternative placement strategy; only capacity overflow,
//!    unrecoverable eviction failure, quiesce refusal, and invariant
//!    violations are meant to reach a caller.

use thiserror::Error;

/// Errors surfaced by the fragment cache manager.
///
/// Routine placement setbacks (a free-list miss, a bump that doesn't fit,
/// a growth request denied by the working-set policy) are not represented
/// here; `Placer` retries the next strategy internally. Only the failure
/// modes that cannot be locally recovered from are exposed.
#[derive(Debug, Error)]
pub enum FcacheError {
    /// The memory provider could not satisfy a reservation request.
    ///
    /// Raised from [`crate::memory::Unit::create`] when `reserve` fails.
    /// `Placer` responds by retrying with a smaller unit size, or, for an
    /// unbounded shared cache, by flushing the oldest unit and retrying.
    #[error("failed to reserve {requested} bytes of executable memory")]
    OutOfReservation {
        /// The number of bytes that could not be reserved.
        requested: usize,
    },

    /// A fragment's computed slot size exceeds the cache's configured
    /// maximum total size. This is a fatal configuration error: the
    /// fragment can never fit no matter how the cache is rearranged.
    #[error("fragment slot size {slot_size} exceeds cache capacity {max_size}")]
    FragmentExceedsCapacity {
        /// The slot size that was requested.
        slot_size: usize,
        /// The cache's configured maximum total size.
        max_size: usize,
    },

    /// Every candidate victim in the FIFO eviction chain carries
    /// `CANNOT_DELETE`, so no contiguous run of victims can be assembled.
    /// `Placer` aborts the in-progress trace and retries once; this error
    /// is only returned if that retry also fails, which indicates a
    /// programming error in the caller (an in-progress trace abort should
    /// always clear at least one `CANNOT_DELETE` flag).
    #[error("no evictable run of fragments found (all candidates are pinned)")]
    NoEvictionPossible,

    /// The quiesce collaborator refused to synchronize all worker threads.
    /// A proactive reset aborts cleanly and may be retried later; any
    /// flushes already staged before the refusal remain staged and will
    /// complete at the next safe opportunity.
    #[error("quiesce request was refused: {reason}")]
    QuiesceFailure {
        /// The reason the quiescer gave for refusing.
        reason: String,
    },

    /// A debug-mode consistency check detected a corrupted cache: an
    /// unrecognized slot header, a slot size mismatch during a contiguous
    /// walk, or a `FOLLOWS_FREE_ENTRY` marker that disagrees with the
    /// physical layout. Fatal in debug builds; release builds should stop
    /// the walk defensively rather than construct this.
    #[error("cache invariant violated: {detail}")]
    InvariantViolation {
        /// A human-readable description of which invariant failed.
        detail: String,
    },

    /// An [`crate::config::FcacheOptions`] value failed the init-time
    /// parameter compatibility checks (unit sizing ladder out of order,
    /// a shared cache configured to resize, a regen/replace ratio that
    /// cannot be satisfied, or a unit size that does not fit in 32 bits).
    #[error("invalid fcache configuration: {detail}")]
    InvalidConfig {
        /// A human-readable description of which check failed.
        detail: String,
    },
}
