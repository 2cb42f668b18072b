//! `CacheManager`: the single entry point a host runtime talks to.
//!
//! Owns the one [`UnitRegistry`] and [`MemoryProvider`] shared by every
//! cache, the global flushtime counter, and the caches themselves: one
//! private [`Cache`] per `(thread, kind)` pair created lazily on first use,
//! plus up to three shared caches created eagerly at construction time per
//! their configured options. Everything a private-cache holder needs to do
//! (add, remove, pclookup, flush, reset) is reached through this type
//! rather than by reaching into `Cache` directly, so the per-cache mutexes
//! stay an implementation detail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{Cache, CacheKind, CacheOwner, Sharing};
use crate::config::FcacheOptions;
use crate::error::FcacheError;
use crate::external::{ExternalHooks, FragmentTable, Linker, Quiescer};
use crate::flush::{FlushEngine, FlushReport};
use crate::fragment::{FragmentFlags, FragmentId};
use crate::memory::{MemoryProvider, Unit, UnitId, UnitRegistry};

/// Outcome of a top-level `pclookup` call (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcLookupResult {
    /// `pc` resolved to a live fragment with an in-cache header.
    Hit(FragmentId),
    /// `pc` resolved to a coarse-grain fragment, which carries no header;
    /// the translator must re-derive the body from `(tag, body_pc)`.
    Coarse {
        /// The external fragment table's tag for this address.
        tag: u64,
        /// The body's start address, as the coarse table recorded it.
        body_pc: usize,
    },
    /// `pc` falls inside a known unit but no live fragment claims it
    /// (stale handle, or the unit is mid-resize and the htable fallback
    /// also missed).
    Miss,
}

/// A private cache slot, keyed by the owning thread and cache kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PrivateKey {
    thread_id: u64,
    kind: CacheKind,
}

/// Owns every cache in the system and the state shared across all of them.
pub struct CacheManager {
    registry: UnitRegistry,
    provider: Arc<dyn MemoryProvider>,
    options: FcacheOptions,
    /// Monotonically increasing; `0` is reserved for "never flushed" so the
    /// first real flushtime handed out is `1`.
    flushtime: AtomicU32,
    private: Mutex<HashMap<PrivateKey, Cache>>,
    bb_shared: Option<Mutex<Cache>>,
    trace_shared: Option<Mutex<Cache>>,
    coarse_bb: Option<Mutex<Cache>>,
}

impl CacheManager {
    /// Validates `options` and builds a manager with every shared cache
    /// created eagerly (private caches are created lazily, one per thread
    /// that actually uses them).
    ///
    /// # Errors
    ///
    /// Propagates [`FcacheError::InvalidConfig`] from [`FcacheOptions::validate`].
    pub fn new(mut options: FcacheOptions, provider: Arc<dyn MemoryProvider>) -> Result<Self, FcacheError> {
        options.validate()?;

        let bb_shared = options.bb_shared.clone().map(|opts| {
            Mutex::new(Cache::new(
                CacheKind::Bb,
                Sharing::Shared,
                CacheOwner::Shared { kind: CacheKind::Bb },
                opts,
            ))
        });
        let trace_shared = options.trace_shared.clone().map(|opts| {
            Mutex::new(Cache::new(
                CacheKind::Trace,
                Sharing::Shared,
                CacheOwner::Shared { kind: CacheKind::Trace },
                opts,
            ))
        });
        let coarse_bb = options.coarse_bb.clone().map(|opts| {
            Mutex::new(Cache::new(
                CacheKind::CoarseBb,
                Sharing::Shared,
                CacheOwner::Shared { kind: CacheKind::CoarseBb },
                opts,
            ))
        });

        tracing::info!(
            shared_bb = bb_shared.is_some(),
            shared_trace = trace_shared.is_some(),
            coarse_bb = coarse_bb.is_some(),
            "fcache manager initialized"
        );

        Ok(Self {
            registry: UnitRegistry::new(),
            provider,
            options,
            flushtime: AtomicU32::new(0),
            private: Mutex::new(HashMap::new()),
            bb_shared,
            trace_shared,
            coarse_bb,
        })
    }

    fn next_flushtime(&self) -> u32 {
        self.flushtime.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn private_options(&self, kind: CacheKind) -> Result<crate::config::CacheOptions, FcacheError> {
        match kind {
            CacheKind::Bb => Ok(self.options.bb_private.clone()),
            CacheKind::Trace => Ok(self.options.trace_private.clone()),
            CacheKind::CoarseBb => Err(FcacheError::InvalidConfig {
                detail: "coarse-grain caches are always shared, never private".to_owned(),
            }),
        }
    }

    fn shared_slot(&self, kind: CacheKind) -> Option<&Mutex<Cache>> {
        match kind {
            CacheKind::Bb => self.bb_shared.as_ref(),
            CacheKind::Trace => self.trace_shared.as_ref(),
            CacheKind::CoarseBb => self.coarse_bb.as_ref(),
        }
    }

    /// Adds a fragment to `thread_id`'s private cache of the given kind,
    /// creating that cache on first use.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Cache::add_fragment`] could not place.
    pub fn add_private_fragment(
        &self,
        thread_id: u64,
        kind: CacheKind,
        tag: u64,
        body_size: usize,
        extra_flags: FragmentFlags,
        hooks: &mut ExternalHooks<'_>,
    ) -> Result<FragmentId, FcacheError> {
        let options = self.private_options(kind)?;
        let key = PrivateKey { thread_id, kind };
        let mut private = self.private.lock().expect("private cache map poisoned");
        let cache = private.entry(key).or_insert_with(|| {
            Cache::new(kind, Sharing::Private, CacheOwner::Private { thread_id, kind }, options)
        });
        let id = cache.add_fragment(tag, body_size, extra_flags, &self.registry, self.provider.as_ref(), hooks)?;
        let reset_due = cache.should_reset();
        drop(private);
        if reset_due {
            tracing::info!(thread_id, kind = ?kind, "private fcache cache crossed its reset threshold");
        }
        Ok(id)
    }

    /// Removes a previously added private fragment.
    pub fn remove_private_fragment(&self, thread_id: u64, kind: CacheKind, id: FragmentId) {
        let key = PrivateKey { thread_id, kind };
        let mut private = self.private.lock().expect("private cache map poisoned");
        if let Some(cache) = private.get_mut(&key) {
            cache.remove_fragment(id, &self.registry);
        }
    }

    /// Adds a fragment to the process-wide shared cache of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`FcacheError::InvalidConfig`] if no shared cache of that
    /// kind was configured, or propagates whatever [`Cache::add_fragment`]
    /// could not place.
    pub fn add_shared_fragment(
        &self,
        kind: CacheKind,
        tag: u64,
        body_size: usize,
        extra_flags: FragmentFlags,
        hooks: &mut ExternalHooks<'_>,
    ) -> Result<FragmentId, FcacheError> {
        let slot = self.shared_slot(kind).ok_or_else(|| FcacheError::InvalidConfig {
            detail: format!("no shared {kind:?} cache configured"),
        })?;
        let mut cache = slot.lock().expect("shared cache poisoned");
        cache.add_fragment(tag, body_size, extra_flags, &self.registry, self.provider.as_ref(), hooks)
    }

    /// Removes a previously added shared fragment. A no-op if no shared
    /// cache of that kind exists.
    pub fn remove_shared_fragment(&self, kind: CacheKind, id: FragmentId) {
        if let Some(slot) = self.shared_slot(kind) {
            slot.lock().expect("shared cache poisoned").remove_fragment(id, &self.registry);
        }
    }

    /// Resolves `pc` to the fragment (or coarse tag) that claims it,
    /// falling back to the external fragment table while the owning
    /// cache's unit is mid-resize (`consistent == false`) or the unit is
    /// coarse-grain (no in-cache header at all).
    pub fn pclookup(&self, pc: usize, table: &mut dyn FragmentTable) -> PcLookupResult {
        let Some(unit) = self.registry.lookup(pc) else {
            return PcLookupResult::Miss;
        };
        let owner = self.registry.with_unit(unit, Unit::owner).flatten();
        let Some(owner) = owner else {
            return PcLookupResult::Miss;
        };

        match owner {
            CacheOwner::Private { thread_id, kind } => {
                let key = PrivateKey { thread_id, kind };
                let private = self.private.lock().expect("private cache map poisoned");
                let Some(cache) = private.get(&key) else {
                    return PcLookupResult::Miss;
                };
                self.lookup_in_cache(cache, unit, pc, table)
            }
            CacheOwner::Shared { kind } => {
                let Some(slot) = self.shared_slot(kind) else {
                    return PcLookupResult::Miss;
                };
                let cache = slot.lock().expect("shared cache poisoned");
                self.lookup_in_cache(&cache, unit, pc, table)
            }
        }
    }

    fn lookup_in_cache(&self, cache: &Cache, unit: UnitId, pc: usize, table: &mut dyn FragmentTable) -> PcLookupResult {
        if cache.kind() == CacheKind::CoarseBb {
            return match table.coarse_pclookup(pc) {
                Some((tag, body_pc)) => PcLookupResult::Coarse { tag, body_pc },
                None => PcLookupResult::Miss,
            };
        }
        if cache.is_consistent() {
            match cache.pclookup_in_unit(unit, pc, &self.registry) {
                Some(fid) => PcLookupResult::Hit(fid),
                None => PcLookupResult::Miss,
            }
        } else {
            match table.pclookup_htable(pc) {
                Some(fid) => PcLookupResult::Hit(fid),
                None => PcLookupResult::Miss,
            }
        }
    }

    /// Marks `unit` for flush. A no-op returning `false` if `unit` has no
    /// known owner (already flushed, or a stale id).
    pub fn mark_unit_for_flush(&self, unit: UnitId) -> bool {
        let Some(owner) = self.registry.with_unit(unit, Unit::owner).flatten() else {
            return false;
        };
        match owner {
            CacheOwner::Private { thread_id, kind } => {
                let key = PrivateKey { thread_id, kind };
                let mut private = self.private.lock().expect("private cache map poisoned");
                private.get_mut(&key).is_some_and(|c| c.mark_unit_for_flush(unit, &self.registry))
            }
            CacheOwner::Shared { kind } => self.shared_slot(kind).is_some_and(|slot| {
                slot.lock().expect("shared cache poisoned").mark_unit_for_flush(unit, &self.registry)
            }),
        }
    }

    fn prepare_unit(&self, unit: UnitId) -> Vec<FragmentId> {
        let Some(owner) = self.registry.with_unit(unit, Unit::owner).flatten() else {
            return Vec::new();
        };
        match owner {
            CacheOwner::Private { thread_id, kind } => {
                let key = PrivateKey { thread_id, kind };
                let mut private = self.private.lock().expect("private cache map poisoned");
                private
                    .get_mut(&key)
                    .map(|c| c.prepare_unit_for_flush(unit, &self.registry))
                    .unwrap_or_default()
            }
            CacheOwner::Shared { kind } => self
                .shared_slot(kind)
                .map(|slot| {
                    slot.lock()
                        .expect("shared cache poisoned")
                        .prepare_unit_for_flush(unit, &self.registry)
                })
                .unwrap_or_default(),
        }
    }

    /// Runs [`FlushEngine::flush_pending`] against this manager's registry,
    /// resolving each stolen unit's owning cache to prepare it.
    ///
    /// # Errors
    ///
    /// Propagates [`FcacheError::QuiesceFailure`].
    pub fn flush_pending(
        &self,
        quiescer: &mut dyn Quiescer,
        linker: &mut dyn Linker,
    ) -> Result<FlushReport, FcacheError> {
        FlushEngine::flush_pending(
            &self.registry,
            quiescer,
            linker,
            || self.next_flushtime(),
            |unit| self.prepare_unit(unit),
        )
    }

    /// Reclaims every to-free unit whose flushtime is `<= flushtime_drained`,
    /// parking at most `dead_bound` of them and unmapping the rest.
    pub fn reap(&self, flushtime_drained: u32, dead_bound: usize) -> Vec<UnitId> {
        // Resolved before reclaiming: `reap_free` clears a unit's owner as
        // part of parking it for reuse, so this is the last point a caller
        // can still attribute the reclaim to the cache that held it.
        let owners = self.registry.owners_pending_reap(flushtime_drained);
        let reclaimed = FlushEngine::reap(&self.registry, flushtime_drained, dead_bound, self.provider.as_ref());
        for (unit, owner) in owners {
            if reclaimed.contains(&unit) {
                if let Some(owner) = owner {
                    self.note_unit_reaped(owner);
                }
            }
        }
        reclaimed
    }

    fn note_unit_reaped(&self, owner: CacheOwner) {
        match owner {
            CacheOwner::Private { thread_id, kind } => {
                let key = PrivateKey { thread_id, kind };
                let mut private = self.private.lock().expect("private cache map poisoned");
                if let Some(cache) = private.get_mut(&key) {
                    cache.note_unit_reaped();
                }
            }
            CacheOwner::Shared { kind } => {
                if let Some(slot) = self.shared_slot(kind) {
                    slot.lock().expect("shared cache poisoned").note_unit_reaped();
                }
            }
        }
    }

    /// Checks whether any cache just crossed its configured reset
    /// threshold and, if so, runs one global proactive reset retiring
    /// every non-head unit of every cache in the system.
    ///
    /// Call this after an `add_*_fragment` call that returned successfully;
    /// it is cheap (one stat comparison per cache) when nothing is due.
    ///
    /// # Errors
    ///
    /// Propagates [`FcacheError::QuiesceFailure`]; the reset may be retried
    /// on a later call.
    pub fn maybe_reset(
        &self,
        quiescer: &mut dyn Quiescer,
        linker: &mut dyn Linker,
    ) -> Result<Option<FlushReport>, FcacheError> {
        if !self.any_cache_due_for_reset() {
            return Ok(None);
        }
        self.proactive_reset(quiescer, linker).map(Some)
    }

    fn any_cache_due_for_reset(&self) -> bool {
        if self
            .private
            .lock()
            .expect("private cache map poisoned")
            .values()
            .any(Cache::should_reset)
        {
            return true;
        }
        [&self.bb_shared, &self.trace_shared, &self.coarse_bb].into_iter().flatten().any(|slot| {
            slot.lock().expect("shared cache poisoned").should_reset()
        })
    }

    /// Unconditionally resets every cache in the system: retires every
    /// non-head unit, under one quiesce, and stamps `should_reset` caches
    /// with a fresh baseline.
    ///
    /// # Errors
    ///
    /// Propagates [`FcacheError::QuiesceFailure`].
    pub fn proactive_reset(
        &self,
        quiescer: &mut dyn Quiescer,
        linker: &mut dyn Linker,
    ) -> Result<FlushReport, FcacheError> {
        let mut units = Vec::new();
        {
            let private = self.private.lock().expect("private cache map poisoned");
            for cache in private.values() {
                units.extend(cache.non_head_units());
            }
        }
        for slot in [&self.bb_shared, &self.trace_shared, &self.coarse_bb].into_iter().flatten() {
            units.extend(slot.lock().expect("shared cache poisoned").non_head_units());
        }

        let report = FlushEngine::proactive_reset(
            &self.registry,
            quiescer,
            linker,
            || self.next_flushtime(),
            units,
            |unit| self.prepare_unit_for_reset(unit),
        )?;

        {
            let mut private = self.private.lock().expect("private cache map poisoned");
            for cache in private.values_mut() {
                if cache.should_reset() {
                    cache.note_reset();
                }
            }
        }
        for slot in [&self.bb_shared, &self.trace_shared, &self.coarse_bb].into_iter().flatten() {
            let mut cache = slot.lock().expect("shared cache poisoned");
            if cache.should_reset() {
                cache.note_reset();
            }
        }

        Ok(report)
    }

    fn prepare_unit_for_reset(&self, unit: UnitId) -> Vec<FragmentId> {
        let Some(owner) = self.registry.with_unit(unit, Unit::owner).flatten() else {
            return Vec::new();
        };
        match owner {
            CacheOwner::Private { thread_id, kind } => {
                let key = PrivateKey { thread_id, kind };
                let mut private = self.private.lock().expect("private cache map poisoned");
                private
                    .get_mut(&key)
                    .map(|c| c.retire_unit_for_reset(unit, &self.registry))
                    .unwrap_or_default()
            }
            CacheOwner::Shared { kind } => self
                .shared_slot(kind)
                .map(|slot| {
                    slot.lock()
                        .expect("shared cache poisoned")
                        .retire_unit_for_reset(unit, &self.registry)
                })
                .unwrap_or_default(),
        }
    }
}
