//! Toy driver for the `fcache` crate.
//!
//! Exercises `CacheManager` end to end with a synthetic translator: adds a
//! batch of fake fragments across a handful of simulated worker threads,
//! occasionally removes some, marks a unit for flush, and walks the
//! flush/reap protocol to completion. Useful for manual inspection under
//! `RUST_LOG=fcache=trace` and as a compile-time check that the public API
//! composes the way the library intends.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;

use clap::Parser;

use fcache::cache::CacheKind;
use fcache::external::{ExternalHooks, FragmentTable, Linker, Quiescer, Shifter, TraceController};
use fcache::fragment::{FragmentFlags, FragmentId};
use fcache::memory::MmapMemoryProvider;
use fcache::{CacheManager, FcacheOptions};

#[derive(Parser, Debug)]
#[command(
    name = "fcache-harness",
    author,
    version,
    about = "Drives fcache::CacheManager with a synthetic translator for manual inspection"
)]
struct Cli {
    /// Optional JSON file deserializing to `fcache::FcacheOptions`. Falls
    /// back to `FcacheOptions::default()` if omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Simulated worker thread count.
    #[arg(short, long, default_value_t = 3)]
    threads: u64,

    /// Fragments added per thread.
    #[arg(short, long, default_value_t = 200)]
    fragments: usize,

    /// Requested body size per fragment, in bytes.
    #[arg(short, long, default_value_t = 48)]
    body_size: usize,

    /// Remove every Nth fragment right after adding it, to exercise the
    /// free-list/FIFO reclaim paths. Zero disables removal.
    #[arg(short, long, default_value_t = 4)]
    remove_every: usize,
}

/// Records the chains handed off for deletion; a real runtime would patch
/// branch instructions instead.
#[derive(Default)]
struct ToyLinker {
    unlinked_chains: usize,
    fragments_unlinked: usize,
}

impl Linker for ToyLinker {
    fn unlink_incoming(&mut self, fragment: FragmentId) {
        tracing::debug!(?fragment, "unlink_incoming");
    }

    fn link_incoming(&mut self, old: FragmentId, new: FragmentId) {
        tracing::debug!(?old, ?new, "link_incoming");
    }

    fn unlink_and_stage_for_deletion(&mut self, chain: &[FragmentId]) {
        self.unlinked_chains += 1;
        self.fragments_unlinked += chain.len();
        tracing::info!(count = chain.len(), "unlink_and_stage_for_deletion");
    }
}

/// Pretends to relocate in-cache references during an in-place resize.
struct ToyShifter;

impl Shifter for ToyShifter {
    fn shift(&mut self, fragment: FragmentId, delta: isize, old_start: usize, old_end: usize) {
        tracing::trace!(?fragment, delta, old_start, old_end, "shift");
    }
}

/// A fragment table that never claims a coarse or deleted hit; the harness
/// only drives private bb/trace caches, so these paths are exercised but
/// always miss.
#[derive(Default)]
struct ToyTable {
    deleted: HashSet<u64>,
    coarse: HashMap<usize, (u64, usize)>,
}

impl FragmentTable for ToyTable {
    fn coarse_pclookup(&self, pc: usize) -> Option<(u64, usize)> {
        self.coarse.get(&pc).copied()
    }

    fn pclookup_htable(&self, _pc: usize) -> Option<FragmentId> {
        None
    }

    fn lookup_deleted(&mut self, tag: u64) -> bool {
        self.deleted.remove(&tag)
    }
}

struct ToyTrace {
    aborted: usize,
}

impl TraceController for ToyTrace {
    fn abort_in_progress_trace(&mut self) {
        self.aborted += 1;
        tracing::warn!("abort_in_progress_trace");
    }
}

/// The harness runs single-threaded, so "quiescing every other worker" is
/// always immediately satisfied.
struct ToyQuiescer;

impl Quiescer for ToyQuiescer {
    fn synch_all_threads(&mut self) -> Result<(), String> {
        tracing::info!("synch_all_threads");
        Ok(())
    }

    fn end_synch(&mut self) {
        tracing::info!("end_synch");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let options = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("failed to read {path}: {e}");
                std::process::exit(1);
            });
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                eprintln!("failed to parse {path}: {e}");
                std::process::exit(1);
            })
        }
        None => FcacheOptions::default(),
    };

    let provider: Arc<dyn fcache::memory::MemoryProvider> = Arc::new(MmapMemoryProvider::new());
    let manager = CacheManager::new(options, provider).unwrap_or_else(|e| {
        eprintln!("invalid fcache configuration: {e}");
        std::process::exit(1);
    });

    let mut shifter = ToyShifter;
    let mut linker = ToyLinker::default();
    let mut table = ToyTable::default();
    let mut trace = ToyTrace { aborted: 0 };
    let mut quiescer = ToyQuiescer;

    let mut placed = Vec::new();
    for thread_id in 0..cli.threads {
        for i in 0..cli.fragments {
            let tag = (thread_id << 32) | i as u64;
            let mut hooks = ExternalHooks {
                shifter: &mut shifter,
                linker: &mut linker,
                table: &mut table,
                trace: &mut trace,
            };
            match manager.add_private_fragment(
                thread_id,
                CacheKind::Bb,
                tag,
                cli.body_size,
                FragmentFlags::empty(),
                &mut hooks,
            ) {
                Ok(id) => {
                    if cli.remove_every > 0 && i % cli.remove_every == 0 {
                        manager.remove_private_fragment(thread_id, CacheKind::Bb, id);
                    } else {
                        placed.push((thread_id, id));
                    }
                }
                Err(e) => tracing::error!(thread_id, i, error = %e, "add_private_fragment failed"),
            }
        }

        if let Err(e) = manager.maybe_reset(&mut quiescer, &mut linker) {
            tracing::error!(error = %e, "proactive reset refused");
        }
    }

    match manager.flush_pending(&mut quiescer, &mut linker) {
        Ok(report) if report.units_flushed > 0 => {
            tracing::info!(?report, "flush_pending reclaimed units");
            let reaped = manager.reap(report.flushtime, 8);
            tracing::info!(count = reaped.len(), "reap parked units on the dead list");
        }
        Ok(_) => tracing::info!("nothing was staged for flush"),
        Err(e) => tracing::error!(error = %e, "flush_pending failed"),
    }

    println!(
        "placed {} fragments across {} threads; {} chains unlinked ({} fragments); {} traces aborted",
        placed.len(),
        cli.threads,
        linker.unlinked_chains,
        linker.fragments_unlinked,
        trace.aborted,
    );
}
