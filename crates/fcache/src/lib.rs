//! Fragment code cache manager for a dynamic binary translator.
//!
//! This crate implements the memory manager that backs a translator's code
//! cache, with the following pieces:
//! 1. **Memory:** executable `Unit`s, their registry (address lookup plus
//!    the live/dead/to-flush/to-free lifecycle lists), and the `mmap`-backed
//!    provider that reserves and commits their address space.
//! 2. **Cache:** the per-kind, per-sharing-mode `Cache` that places and
//!    evicts fragments (free list for shared caches, FIFO for private
//!    caches), its working-set growth policy, and the flush protocol that
//!    reclaims a shared cache's memory a whole unit at a time.
//! 3. **Manager:** `CacheManager`, the entry point that owns every cache in
//!    the system plus the state shared across all of them (the registry,
//!    the memory provider, the global flushtime counter).
//! 4. **Config:** sizing, alignment, and working-set options, deserializable
//!    from any `serde::Deserialize` source.
//! 5. **External:** the trait contracts this crate consumes but does not
//!    implement: the translator's shifter, the linker, the fragment table,
//!    trace control, and the quiesce mechanism.

/// Logical caches: placement, eviction, working-set sizing, and the
/// flush-preparation half of the unit-flush protocol.
pub mod cache;
/// Sizing, alignment, and working-set options.
pub mod config;
/// Failure modes surfaced by fallible public operations.
pub mod error;
/// Trait contracts for the translator, linker, fragment table, and
/// quiescer this crate relies on but does not implement.
pub mod external;
/// The unit-flush protocol: quiesce, chain, unlink, stage for reclamation.
pub mod flush;
/// Fragment descriptors and the flags that classify a cache slot.
pub mod fragment;
/// `CacheManager`: owns every cache and the state shared across them.
pub mod manager;
/// Executable memory units, their registry, and the `mmap` provider.
pub mod memory;
/// Per-cache running counters.
pub mod stats;

/// Sizing and working-set options for a single cache kind.
pub use crate::config::CacheOptions;
/// Aggregate options for every cache kind the manager owns.
pub use crate::config::FcacheOptions;
/// Unified error type for fallible public operations.
pub use crate::error::FcacheError;
/// Bundled collaborator references a single placement call may need.
pub use crate::external::ExternalHooks;
/// Outcome of one flush or proactive-reset call.
pub use crate::flush::FlushReport;
/// Fragment classification bits.
pub use crate::fragment::FragmentFlags;
/// Opaque handle to a placed fragment.
pub use crate::fragment::FragmentId;
/// The top-level entry point for adding, removing, and looking up fragments.
pub use crate::manager::{CacheManager, PcLookupResult};
