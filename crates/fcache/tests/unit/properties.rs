//! Property-style invariant checks for the free list and fifo structures
//! under randomized insert/remove sequences, plus whole-`Cache` consistency
//! under randomized add/remove traffic.

use fcache::cache::{Cache, CacheKind, CacheOwner, FreeList, Sharing};
use fcache::fragment::FragmentFlags;
use fcache::memory::{MmapMemoryProvider, UnitRegistry};
use fcache::CacheOptions;
use proptest::prelude::*;

use crate::common::{hooks, unbounded_options, NoopShifter, NoopTable, NoopTrace, RecordingLinker};

/// A single free-list op: insert a slot of `size` bytes, or remove the
/// `nth` currently-live entry (taken modulo the live count, so every
/// generated index is always meaningful).
#[derive(Debug, Clone)]
enum FreeListOp {
    Insert(usize),
    RemoveNth(usize),
}

fn free_list_op() -> impl Strategy<Value = FreeListOp> {
    prop_oneof![
        (1usize..256).prop_map(FreeListOp::Insert),
        (0usize..64).prop_map(FreeListOp::RemoveNth),
    ]
}

proptest! {
    /// After any sequence of inserts and removes, every live entry must
    /// still sit in the bucket its size maps to and its forward/backward
    /// links must be mutually consistent (the doubly-linked invariant
    /// `FreeList::check_invariants` exists to police).
    #[test]
    fn free_list_invariants_survive_random_traffic(ops in prop::collection::vec(free_list_op(), 0..200)) {
        let registry = UnitRegistry::new();
        let provider = MmapMemoryProvider::new();
        let unit = registry.create_unit(&provider, 1 << 20, 1 << 16).unwrap();

        let mut fl = FreeList::new();
        let mut live = Vec::new();
        let mut next_offset = 0usize;
        let mut expected_total = 0usize;

        for op in ops {
            match op {
                FreeListOp::Insert(size) => {
                    let id = fl.insert(unit, next_offset, size);
                    next_offset += size;
                    expected_total += size;
                    live.push(id);
                }
                FreeListOp::RemoveNth(n) => {
                    if live.is_empty() {
                        continue;
                    }
                    let id = live.remove(n % live.len());
                    let (_, _, size) = fl.remove(id);
                    expected_total -= size;
                }
            }
            prop_assert_eq!(fl.check_invariants(), None);
            prop_assert_eq!(fl.total_free(), expected_total);
        }
    }
}

/// A single `Cache` traffic op: add a fragment of `body_size` bytes, or
/// remove the `nth` currently-live fragment.
#[derive(Debug, Clone)]
enum CacheOp {
    Add(usize),
    RemoveNth(usize),
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (8usize..96).prop_map(CacheOp::Add),
        (0usize..32).prop_map(CacheOp::RemoveNth),
    ]
}

fn generous_options() -> CacheOptions {
    let mut opts = unbounded_options();
    opts.finite = false;
    opts.align = 8;
    opts.unit_init = 4096;
    opts.unit_quadruple = 16384;
    opts.unit_max = 16384;
    opts
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A private (FIFO-evicting) cache driven through randomized
    /// add/remove traffic must stay internally consistent: every live
    /// fragment handle the cache still reports resolves to a real slot,
    /// and `is_consistent` never goes false absent an in-progress resize.
    #[test]
    fn private_cache_stays_consistent_under_random_traffic(ops in prop::collection::vec(cache_op(), 0..150)) {
        let provider = MmapMemoryProvider::new();
        let registry = UnitRegistry::new();
        let mut cache = Cache::new(
            CacheKind::Bb,
            Sharing::Private,
            CacheOwner::Private { thread_id: 1, kind: CacheKind::Bb },
            generous_options(),
        );
        let (mut shifter, mut linker, mut table, mut trace) =
            (NoopShifter::default(), RecordingLinker::default(), NoopTable, NoopTrace::default());

        let mut live = Vec::new();
        let mut next_tag = 0u64;
        for op in ops {
            match op {
                CacheOp::Add(body_size) => {
                    let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
                    if let Ok(id) = cache.add_fragment(next_tag, body_size, FragmentFlags::empty(), &registry, &provider, &mut h) {
                        live.push(id);
                    }
                    next_tag += 1;
                }
                CacheOp::RemoveNth(n) => {
                    if live.is_empty() {
                        continue;
                    }
                    let id = live.remove(n % live.len());
                    cache.remove_fragment(id, &registry);
                }
            }
            prop_assert!(cache.is_consistent());
            prop_assert_eq!(cache.stats().live_fragments as usize, live.len());
            for id in &live {
                prop_assert!(cache.fragment(*id).is_some(), "every still-tracked handle must resolve");
            }
        }

        // Draining everything must leave no live fragments behind.
        for id in live {
            cache.remove_fragment(id, &registry);
        }
        prop_assert_eq!(cache.stats().live_fragments, 0);
    }

    /// A shared (free-list-placing) cache must keep its free-list
    /// invariants intact across the same kind of randomized traffic,
    /// since removal there drives coalescing rather than FIFO eviction.
    #[test]
    fn shared_cache_stays_consistent_under_random_traffic(ops in prop::collection::vec(cache_op(), 0..150)) {
        let provider = MmapMemoryProvider::new();
        let registry = UnitRegistry::new();
        let mut opts = generous_options();
        opts.shared_free_list = true;
        let mut cache = Cache::new(
            CacheKind::Bb,
            Sharing::Shared,
            CacheOwner::Shared { kind: CacheKind::Bb },
            opts,
        );
        let (mut shifter, mut linker, mut table, mut trace) =
            (NoopShifter::default(), RecordingLinker::default(), NoopTable, NoopTrace::default());

        let mut live = Vec::new();
        let mut next_tag = 0u64;
        for op in ops {
            match op {
                CacheOp::Add(body_size) => {
                    let mut h = hooks(&mut shifter, &mut linker, &mut table, &mut trace);
                    if let Ok(id) = cache.add_fragment(next_tag, body_size, FragmentFlags::SHARED, &registry, &provider, &mut h) {
                        live.push(id);
                    }
                    next_tag += 1;
                }
                CacheOp::RemoveNth(n) => {
                    if live.is_empty() {
                        continue;
                    }
                    let id = live.remove(n % live.len());
                    cache.remove_fragment(id, &registry);
                }
            }
            prop_assert!(cache.is_consistent());
            prop_assert_eq!(cache.stats().live_fragments as usize, live.len());
        }
    }
}
