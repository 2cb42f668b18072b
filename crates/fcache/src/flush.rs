//! Unit-flush protocol (§4.6): the only way to reclaim shared-cache
//! memory, since a shared cache cannot evict individual fragments the way
//! a private cache's FIFO does.
//!
//! ```text
//! Live ──mark_for_flush──▶ PendingFlush ──post_quiesce──▶ PendingFree ──flushtime_drains──▶ DeadOrUnmapped
//! ```
//!
//! [`Cache::mark_unit_for_flush`](crate::cache::Cache::mark_unit_for_flush)
//! performs the first transition outside of any quiesce. Everything from
//! here on: stealing the to-flush list, requesting a quiesce, chaining
//! each unit's live fragments, handing them to the linker, and staging
//! the units on the to-free list, is [`FlushEngine`]'s job. The engine
//! itself holds no cache state: it takes the unit-owning `Cache`'s
//! per-unit preparation as a callback so this module does not need to
//! know about `CacheManager`'s private/shared cache bookkeeping.

use crate::error::FcacheError;
use crate::external::{Linker, Quiescer};
use crate::fragment::FragmentId;
use crate::memory::{MemoryProvider, Unit, UnitId, UnitRegistry};

/// Outcome of one [`FlushEngine::flush_pending`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// How many units were stolen off the to-flush list and retired.
    pub units_flushed: usize,
    /// How many live fragments were chained and handed to the linker.
    pub fragments_unlinked: usize,
    /// The flushtime stamped on every unit this call retired. Zero if
    /// nothing was pending (`units_flushed == 0`).
    pub flushtime: u32,
}

/// Stateless driver for the unit-flush protocol. Every method takes the
/// collaborators it needs explicitly rather than owning them, so a
/// `CacheManager` can hold exactly one `UnitRegistry` and pass it (and a
/// per-unit preparation closure bound to the right owning cache) into
/// whichever of these runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushEngine;

impl FlushEngine {
    /// `flush_pending(worker_thread)`: steals the to-flush list, quiesces
    /// every other worker, chains every stolen unit's live fragments via
    /// `prepare_unit`, hands the combined chain to the linker in one call,
    /// stamps the current flushtime, and appends the units to the to-free
    /// list.
    ///
    /// `prepare_unit` is expected to be
    /// [`Cache::prepare_unit_for_flush`](crate::cache::Cache::prepare_unit_for_flush)
    /// bound to whichever cache owns the unit passed to it (the caller
    /// resolves ownership via [`Unit::owner`]).
    ///
    /// Returns a zeroed [`FlushReport`] without quiescing at all if
    /// nothing was staged; an idle flush call must not pay for a
    /// synchronization round trip.
    ///
    /// # Errors
    ///
    /// Returns [`FcacheError::QuiesceFailure`] if the quiescer refuses to
    /// synchronize. Units already stolen off the to-flush list are lost
    /// from that list, matching the source's documented behavior of
    /// retrying a flush from scratch rather than attempting a partial
    /// rollback; callers that care should re-stage via
    /// `mark_unit_for_flush` on the next safe opportunity.
    pub fn flush_pending(
        registry: &UnitRegistry,
        quiescer: &mut dyn Quiescer,
        linker: &mut dyn Linker,
        next_flushtime: impl FnOnce() -> u32,
        mut prepare_unit: impl FnMut(UnitId) -> Vec<FragmentId>,
    ) -> Result<FlushReport, FcacheError> {
        let units = registry.steal_to_flush();
        if units.is_empty() {
            return Ok(FlushReport::default());
        }

        quiescer
            .synch_all_threads()
            .map_err(|reason| FcacheError::QuiesceFailure { reason })?;

        let mut chain = Vec::new();
        for &unit in &units {
            registry.with_unit_mut(unit, Unit::mark_pending_free);
            chain.extend(prepare_unit(unit));
        }

        linker.unlink_and_stage_for_deletion(&chain);

        let flushtime = next_flushtime();
        for &unit in &units {
            registry.with_unit_mut(unit, |u| u.set_flushtime(flushtime));
        }
        registry.append_to_free(units.iter().copied(), flushtime);

        quiescer.end_synch();

        tracing::info!(
            units = units.len(),
            fragments = chain.len(),
            flushtime,
            "flushed fcache units"
        );

        Ok(FlushReport {
            units_flushed: units.len(),
            fragments_unlinked: chain.len(),
            flushtime,
        })
    }

    /// `reap(flushtime_drained)`: reclaims every unit on the to-free list
    /// whose flushtime is `<= flushtime_drained`, parking each on the dead
    /// list (or unmapping it if the dead list is full). Stops at the
    /// first unit above the drained flushtime, since the list is kept
    /// sorted ascending.
    pub fn reap(
        registry: &UnitRegistry,
        flushtime_drained: u32,
        dead_bound: usize,
        provider: &dyn MemoryProvider,
    ) -> Vec<UnitId> {
        let reclaimed = registry.reap_free(flushtime_drained, dead_bound, provider);
        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), flushtime_drained, "reaped fcache units");
        }
        reclaimed
    }

    /// A whole-cache teardown triggered by capacity pressure or a policy
    /// counter (the `reset_at_nth_*_unit`/`reset_every_nth_*_unit`
    /// options), distinct from a single-unit consistency flush.
    ///
    /// Marks all but one unit of every cache passed in `caches` for
    /// flush, quiesces once for the whole batch, stamps every retired
    /// unit with the same flushtime, and appends them directly to the
    /// to-free list, bypassing the to-flush list entirely, since a
    /// proactive reset already holds the one quiesce it needs and has no
    /// reason to stage-then-steal.
    ///
    /// `mark_and_prepare` is called once per cache with that cache's
    /// current unit list (head excluded) and must return the flattened
    /// chain of every live fragment those units held, having already
    /// removed them from the cache's own bookkeeping (free list buckets,
    /// FIFO). This mirrors
    /// [`Cache::prepare_unit_for_flush`](crate::cache::Cache::prepare_unit_for_flush),
    /// just invoked directly instead of via the to-flush list.
    ///
    /// # Errors
    ///
    /// Returns [`FcacheError::QuiesceFailure`] if the quiescer refuses;
    /// per §7, the reset aborts cleanly and may be retried later.
    pub fn proactive_reset(
        registry: &UnitRegistry,
        quiescer: &mut dyn Quiescer,
        linker: &mut dyn Linker,
        next_flushtime: impl FnOnce() -> u32,
        units_to_retire: Vec<UnitId>,
        mut mark_and_prepare: impl FnMut(UnitId) -> Vec<FragmentId>,
    ) -> Result<FlushReport, FcacheError> {
        if units_to_retire.is_empty() {
            return Ok(FlushReport::default());
        }

        quiescer
            .synch_all_threads()
            .map_err(|reason| FcacheError::QuiesceFailure { reason })?;

        let mut chain = Vec::new();
        for &unit in &units_to_retire {
            registry.remove_live(unit);
            registry.with_unit_mut(unit, Unit::mark_pending_free);
            chain.extend(mark_and_prepare(unit));
        }
        linker.unlink_and_stage_for_deletion(&chain);

        let flushtime = next_flushtime();
        for &unit in &units_to_retire {
            registry.with_unit_mut(unit, |u| u.set_flushtime(flushtime));
        }
        registry.append_to_free(units_to_retire.iter().copied(), flushtime);

        quiescer.end_synch();

        tracing::warn!(
            units = units_to_retire.len(),
            fragments = chain.len(),
            flushtime,
            "proactive fcache reset"
        );

        Ok(FlushReport {
            units_flushed: units_to_retire.len(),
            fragments_unlinked: chain.len(),
            flushtime,
        })
    }
}
