//! End-to-end scenario coverage and cross-module invariant properties.

/// Table-style scenario tests: the lettered walkthroughs covering fifo
/// eviction, free-list coalescing, working-set gating, in-place resize,
/// flush-and-drain, and pclookup under an in-progress resize.
pub mod scenarios;

/// Property-style invariant checks for the free list and fifo structures
/// under randomized insert/remove sequences.
pub mod properties;
