//! # Fragment Cache Integration Tests
//!
//! Central entry point for the fragment cache manager's integration test
//! suite: end-to-end scenario coverage over `Cache`/`CacheManager`/
//! `FlushEngine` working together, plus cross-module invariant properties,
//! built on shared test doubles for the external collaborator traits.

/// Shared test infrastructure: external-collaborator doubles (linker,
/// quiescer, fragment table, shifter) and small option builders.
pub mod common;

/// Scenario and property tests exercising the cache, flush, and manager
/// layers together.
pub mod unit;
