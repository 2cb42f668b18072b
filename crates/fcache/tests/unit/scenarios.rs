//! Lettered scenario walkthroughs exercised directly against `Cache`
//! (Scenarios A, B, C, D, E, each naming the collaborator structure they
//! drive) and `FlushEngine` (Scenario E's drain half). Scenario F
//! (pclookup under resize inconsistency) lives in `manager.rs`'s own test
//! module, since it needs `CacheManager`'s htable-fallback wiring.

use fcache::cache::{Cache, CacheKind, CacheOwner, Sharing};
use fcache::external::{ExternalHooks, Linker};
use fcache::flush::FlushEngine;
use fcache::fragment::FragmentFlags;
use fcache::memory::{MemoryProvider, MmapMemoryProvider, SlotKind, Unit, UnitRegistry};
use fcache::CacheOptions;
use mockall::predicate::eq;
use rstest::rstest;

use crate::common::{
    hooks, init_test_logging, unbounded_options, MockTestLinker, NoopQuiescer, NoopShifter, NoopTable, NoopTrace,
    RecordingLinker,
};

fn private_bb_options() -> CacheOptions {
    let mut opts = unbounded_options();
    // Denies growth unconditionally (replace > 0, regen == 0), so a full
    // head unit with no commit headroom has nowhere to go but FIFO
    // eviction.
    opts.finite = true;
    opts.regen = 0;
    opts.replace = 1;
    opts.align = 8;
    opts.unit_init = 512;
    opts.unit_quadruple = 512;
    opts.unit_max = 512;
    opts
}

/// Scenario A: a private FIFO cache whose head unit fills exactly, so the
/// next fragment must evict the oldest live one (FIFO head) rather than
/// grow or bump into leftover space.
#[rstest]
fn fifo_evicts_oldest_fragment_on_exact_fit() {
    init_test_logging();
    let provider = MmapMemoryProvider::new();
    let registry = UnitRegistry::new();
    let mut cache = Cache::new(
        CacheKind::Bb,
        Sharing::Private,
        CacheOwner::Private { thread_id: 1, kind: CacheKind::Bb },
        private_bb_options(),
    );
    let (mut shifter, mut linker, mut table, mut trace) =
        (NoopShifter::default(), RecordingLinker::default(), NoopTable, NoopTrace::default());

    // Each body of 48 bytes plus the 16-byte header aligns to a 64-byte
    // slot; 512 / 64 == 8 fragments fill the head unit exactly.
    let mut ids = Vec::new();
    for tag in 0..8u64 {
        let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
        let id = cache.add_fragment(tag, 48, FragmentFlags::empty(), &registry, &provider, &mut h).unwrap();
        ids.push(id);
    }
    assert_eq!(cache.stats().live_fragments, 8);
    assert_eq!(cache.stats().evictions, 0);

    let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
    let new_id = cache.add_fragment(99, 48, FragmentFlags::empty(), &registry, &provider, &mut h).unwrap();

    assert_eq!(cache.stats().evictions, 1, "the 9th fragment must evict, not grow");
    assert_eq!(cache.stats().live_fragments, 8, "one out, one in");
    assert_eq!(linker.unlinked_incoming, vec![ids[0]], "fragment 0 (the FIFO head) was evicted");
    assert!(cache.fragment(ids[0]).is_none(), "evicted fragment's id is no longer valid");

    let new_loc = cache.fragment(new_id).unwrap().location.unwrap();
    assert_eq!(new_loc.offset, 16, "new fragment reuses fragment 0's freed slot (header + 0)");
}

fn shared_bb_options() -> CacheOptions {
    let mut opts = unbounded_options();
    opts.finite = false;
    opts.align = 8;
    opts.unit_init = 4096;
    opts.unit_quadruple = 4096;
    opts.unit_max = 4096;
    opts.shared_free_list = true;
    opts
}

/// Scenario B: removing b, then c, then a from a run of four adjacent
/// shared-cache fragments must forward- and backward-coalesce into one
/// free entry spanning all three, leaving d live as the tail sentinel.
#[rstest]
fn free_list_coalesces_forward_and_backward() {
    init_test_logging();
    let provider = MmapMemoryProvider::new();
    let registry = UnitRegistry::new();
    let mut cache = Cache::new(
        CacheKind::Bb,
        Sharing::Shared,
        CacheOwner::Shared { kind: CacheKind::Bb },
        shared_bb_options(),
    );
    let (mut shifter, mut linker, mut table, mut trace) =
        (NoopShifter::default(), RecordingLinker::default(), NoopTable, NoopTrace::default());

    let mut add = |cache: &mut Cache, body: usize| {
        let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
        cache.add_fragment(0, body, FragmentFlags::empty(), &registry, &provider, &mut h).unwrap()
    };
    let a = add(&mut cache, 48); // slot 64
    let b = add(&mut cache, 56); // slot 72
    let c = add(&mut cache, 48); // slot 64
    let d = add(&mut cache, 48); // slot 64, stays live as the tail sentinel

    cache.remove_fragment(b, &registry);
    cache.remove_fragment(c, &registry);
    cache.remove_fragment(a, &registry);

    let unit = cache.units()[0];
    let slots = registry.with_unit(unit, |u| u.slots().to_vec()).unwrap();
    assert_eq!(slots.len(), 2, "a+b+c merged into one free entry, d stays live");
    let free_slot = slots.iter().find(|s| matches!(s.kind, SlotKind::Free(_))).unwrap();
    assert_eq!(free_slot.offset, 0);
    assert_eq!(free_slot.size, 64 + 72 + 64, "forward and backward coalescing merged all three");

    let d_slot = slots.iter().find(|s| matches!(s.kind, SlotKind::Live(_))).unwrap();
    assert_eq!(cache.fragment(d).unwrap().location.unwrap().offset, d_slot.offset + 16);
}

fn private_trace_options() -> CacheOptions {
    let mut opts = unbounded_options();
    opts.finite = false;
    opts.align = 8;
    opts.unit_init = 4096;
    opts.unit_quadruple = 16384;
    opts.unit_max = 16384;
    opts
}

/// Scenario D: a private trace cache's head unit is too small for an
/// incoming fragment and must resize in place (quadrupling, since
/// `4096 * 4 <= unit_quadruple`), shifting every live fragment's
/// references to its new base and relinking exactly once each.
#[rstest]
fn resize_shifts_and_relinks_every_live_fragment() {
    init_test_logging();
    let provider = MmapMemoryProvider::new();
    let registry = UnitRegistry::new();
    let mut cache = Cache::new(
        CacheKind::Trace,
        Sharing::Private,
        CacheOwner::Private { thread_id: 9, kind: CacheKind::Trace },
        private_trace_options(),
    );
    let (mut shifter, mut table, mut trace) = (NoopShifter::default(), NoopTable, NoopTrace::default());
    let mut linker = MockTestLinker::new();
    linker.expect_link_incoming().times(3).returning(|_, _| ());

    let mut ids = Vec::new();
    for tag in 0..3u64 {
        let mut h = ExternalHooks { shifter: &mut shifter, linker: &mut linker, table: &mut table, trace: &mut trace };
        let id = cache.add_fragment(tag, 48, FragmentFlags::IS_TRACE, &registry, &provider, &mut h).unwrap();
        ids.push(id);
    }
    let old_unit = cache.units()[0];

    // A body this large cannot fit in the 3904 bytes of tail space left in
    // a 4096-byte unit; the head must resize before it can be placed.
    let mut h = ExternalHooks { shifter: &mut shifter, linker: &mut linker, table: &mut table, trace: &mut trace };
    let big = cache.add_fragment(99, 8160, FragmentFlags::IS_TRACE, &registry, &provider, &mut h).unwrap();

    assert!(cache.is_consistent(), "resize completes synchronously within one call");
    assert_eq!(cache.units().len(), 1, "the old unit was retired, not kept alongside the new one");
    let new_unit = cache.units()[0];
    assert_ne!(old_unit, new_unit);

    assert_eq!(shifter.shifts.len(), 3, "every live fragment was shifted exactly once");
    for (fid, _, old_start, old_end) in &shifter.shifts {
        assert!(ids.contains(fid));
        assert_eq!(*old_end - *old_start, 4096);
    }
    for fid in &ids {
        assert_eq!(cache.fragment(*fid).unwrap().location.unwrap().unit, new_unit);
    }
    assert_eq!(cache.fragment(big).unwrap().location.unwrap().unit, new_unit);
    assert_eq!(registry.with_unit(new_unit, Unit::size).unwrap(), 16384);
}

fn private_wset_options() -> CacheOptions {
    let mut opts = unbounded_options();
    opts.finite = true;
    opts.align = 8;
    opts.unit_init = 512;
    opts.unit_quadruple = 512;
    opts.unit_max = 512;
    // A tiny free-upgrade threshold: the very first unit already exceeds
    // it, so every add after the first is evaluated against the
    // regen/replace ratio rather than granted unconditionally.
    opts.free_upgrade_size = 64;
    opts.regen = 4;
    opts.replace = 4;
    opts
}

/// Scenario C: a private cache's bump allocations fill its one resizable
/// unit without ever consulting the growth gate (bump is `Placer::place`
/// step 3, ahead of grow); once the unit is full and total size is past
/// `free_upgrade_size`, the next placement's growth request is gated by
/// the regen/replace ratio. A private cache's bump placements count only
/// toward `num_replaced`, never `num_regenerated` (that requires a
/// fragment-table hit on a since-deleted tag), so the ratio can never be
/// met here: growth is denied and eviction is the only avenue left.
#[rstest]
fn working_set_gate_forces_eviction_once_past_free_upgrade() {
    init_test_logging();
    let provider = MmapMemoryProvider::new();
    let registry = UnitRegistry::new();
    let mut cache = Cache::new(
        CacheKind::Bb,
        Sharing::Private,
        CacheOwner::Private { thread_id: 2, kind: CacheKind::Bb },
        private_wset_options(),
    );
    let (mut shifter, mut linker, mut table, mut trace) =
        (NoopShifter::default(), RecordingLinker::default(), NoopTable, NoopTrace::default());

    // Each 48-byte body aligns to a 64-byte slot; 512 / 64 == 8 fragments
    // fill the head unit exactly, all via bump.
    for tag in 0..8u64 {
        let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
        cache.add_fragment(tag, 48, FragmentFlags::empty(), &registry, &provider, &mut h).unwrap();
    }
    assert_eq!(cache.stats().bump_allocations, 8);
    assert_eq!(cache.stats().grows, 0, "unit_max == unit_init leaves no room to grow anyway");

    // The unit is now full and total_size (512) is far past free_upgrade
    // (64); with unit_max == unit_init there is no commit headroom or
    // resize room left, so `try_grow` would have to create a whole new
    // unit, gated by the ratio, which a private cache can never satisfy
    // through bump placements alone.
    let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
    cache.add_fragment(99, 48, FragmentFlags::empty(), &registry, &provider, &mut h).unwrap();

    assert_eq!(cache.stats().grows, 0, "the ratio gate denied growth past the free-upgrade threshold");
    assert_eq!(cache.stats().evictions, 1, "eviction is the only avenue left once growth is denied");
}

/// Scenario E: marking a shared cache's older unit for flush, running the
/// flush protocol, and reaping must fully drain it from the cache's unit
/// list, the live fragment count, and the registry's interval map.
#[rstest]
fn flush_and_reap_drains_a_marked_unit() {
    init_test_logging();
    let provider = MmapMemoryProvider::new();
    let registry = UnitRegistry::new();
    let mut cache = Cache::new(
        CacheKind::Bb,
        Sharing::Shared,
        CacheOwner::Shared { kind: CacheKind::Bb },
        {
            let mut o = unbounded_options();
            o.finite = false;
            o.align = 8;
            o.unit_init = 64;
            o.unit_quadruple = 64;
            o.unit_max = 64;
            o
        },
    );
    let (mut shifter, mut linker, mut table, mut trace) =
        (NoopShifter::default(), RecordingLinker::default(), NoopTable, NoopTrace::default());

    let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
    // Exactly fills the 64-byte unit (one 64-byte slot), forcing the next
    // add to create a second unit.
    cache.add_fragment(1, 48, FragmentFlags::empty(), &registry, &provider, &mut h).unwrap();
    let old_unit = cache.units()[0];

    let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
    cache.add_fragment(2, 48, FragmentFlags::empty(), &registry, &provider, &mut h).unwrap();
    assert_eq!(cache.units().len(), 2, "the second fragment forced a new unit");
    assert_ne!(cache.units()[0], old_unit, "the new unit became the head");

    let old_start = registry.with_unit(old_unit, Unit::start_pc).unwrap();
    let old_size = registry.with_unit(old_unit, Unit::size).unwrap();
    let size_before = cache.total_size();

    assert!(cache.mark_unit_for_flush(old_unit, &registry));
    assert_eq!(cache.units().len(), 1, "marking removes the unit from this cache's own list");
    assert_eq!(cache.total_size(), size_before - old_size);

    let mut quiescer = NoopQuiescer;
    let report = FlushEngine::flush_pending(
        &registry,
        &mut quiescer,
        &mut linker,
        || 7,
        |unit| cache.prepare_unit_for_flush(unit, &registry),
    )
    .unwrap();
    assert_eq!(report.units_flushed, 1);
    assert_eq!(report.fragments_unlinked, 1);
    assert_eq!(report.flushtime, 7);
    assert!(registry.with_unit(old_unit, Unit::is_pending_free).unwrap());

    assert!(FlushEngine::reap(&registry, 6, 5, &provider).is_empty(), "flushtime 6 has not drained yet");
    let reclaimed = FlushEngine::reap(&registry, 7, 5, &provider);
    assert_eq!(reclaimed, vec![old_unit]);
    assert_eq!(registry.lookup(old_start), None, "the interval map no longer resolves the reclaimed unit");
}
