//! Contracts for the collaborators this crate consumes but does not
//! implement: the translator/emitter, the linker, the fragment table, and
//! the quiesce mechanism. Each is a trait so a host runtime can supply its
//! own implementation; this crate ships none beyond test doubles.

use crate::fragment::FragmentId;

/// Relocates a fragment's intra-cache and cache-exit references after its
/// unit has moved (in-place resize).
pub trait Shifter {
    /// Shifts every address `fragment` refers to within `[old_start,
    /// old_end)` by `delta`, and rewrites the header backpointer at the
    /// fragment's new location. Called once per fragment, in physical
    /// walk order, during an in-place resize.
    fn shift(&mut self, fragment: FragmentId, delta: isize, old_start: usize, old_end: usize);
}

/// Patches direct/indirect control transfers between fragments.
pub trait Linker {
    /// Removes incoming links pointing at `fragment`.
    fn unlink_incoming(&mut self, fragment: FragmentId);

    /// Re-links everything that used to point at `old` to point at `new`
    /// instead (used after an in-place resize's shift pass).
    fn link_incoming(&mut self, old: FragmentId, new: FragmentId);

    /// Unlinks and stages an entire flush chain for deletion. Called only
    /// while a quiesce is in effect.
    fn unlink_and_stage_for_deletion(&mut self, chain: &[FragmentId]);
}

/// The fragment table / coarse-grain pc-lookup htable.
pub trait FragmentTable {
    /// Coarse-cache fallback lookup: resolves `pc` to a `(tag, body_pc)`
    /// pair without any in-cache header.
    fn coarse_pclookup(&self, pc: usize) -> Option<(u64, usize)>;

    /// Consistency-fallback lookup used while a cache's `consistent` flag
    /// is false (mid-resize).
    fn pclookup_htable(&self, pc: usize) -> Option<FragmentId>;

    /// Looks up `tag` in the deleted-fragment table; if present, clears its
    /// `WAS_DELETED` bit and returns `true` (counted as a working-set
    /// regeneration).
    fn lookup_deleted(&mut self, tag: u64) -> bool;
}

/// Lets the placer free up `CANNOT_DELETE` fragments by abandoning
/// whatever trace the calling thread is mid-recording, when every FIFO
/// eviction candidate is pinned.
pub trait TraceController {
    /// Aborts the calling thread's in-progress trace recording, if any.
    /// A no-op if no trace is in progress.
    fn abort_in_progress_trace(&mut self);
}

/// Bundles the collaborators a single placement call may need, so cache
/// methods take one borrow instead of four.
pub struct ExternalHooks<'a> {
    pub shifter: &'a mut dyn Shifter,
    pub linker: &'a mut dyn Linker,
    pub table: &'a mut dyn FragmentTable,
    pub trace: &'a mut dyn TraceController,
}

/// The global thread-synchronization primitive used by flush and
/// proactive reset.
pub trait Quiescer {
    /// Requests that every other worker thread exit the cache and
    /// re-enter through dispatch before returning `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an error message if synchronization is refused (e.g.
    /// another thread is mid-link and cannot safely be paused).
    fn synch_all_threads(&mut self) -> Result<(), String>;

    /// Ends a quiesce begun by a successful `synch_all_threads`.
    fn end_synch(&mut self);
}
