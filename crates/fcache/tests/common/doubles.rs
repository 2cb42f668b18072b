use fcache::external::{ExternalHooks, FragmentTable, Linker, Quiescer, Shifter, TraceController};
use fcache::FragmentId;

/// Records every shift this fragment's intra-cache references underwent,
/// for scenarios that verify a resize relinked exactly what moved.
#[derive(Default)]
pub struct NoopShifter {
    pub shifts: Vec<(FragmentId, isize, usize, usize)>,
}

impl Shifter for NoopShifter {
    fn shift(&mut self, fragment: FragmentId, delta: isize, old_start: usize, old_end: usize) {
        self.shifts.push((fragment, delta, old_start, old_end));
    }
}

/// Records unlink/link/flush-chain calls without actually patching any
/// code, so scenario tests can assert on exactly what the cache asked the
/// linker to do.
#[derive(Default)]
pub struct RecordingLinker {
    pub unlinked_incoming: Vec<FragmentId>,
    pub relinked: Vec<(FragmentId, FragmentId)>,
    pub flush_chains: Vec<Vec<FragmentId>>,
}

impl Linker for RecordingLinker {
    fn unlink_incoming(&mut self, fragment: FragmentId) {
        self.unlinked_incoming.push(fragment);
    }

    fn link_incoming(&mut self, old: FragmentId, new: FragmentId) {
        self.relinked.push((old, new));
    }

    fn unlink_and_stage_for_deletion(&mut self, chain: &[FragmentId]) {
        self.flush_chains.push(chain.to_vec());
    }
}

/// A fragment table that never resolves a coarse or htable lookup and
/// never reports a regeneration; scenarios that need one to hit configure
/// a real `HashMap` double inline instead.
#[derive(Default)]
pub struct NoopTable;

impl FragmentTable for NoopTable {
    fn coarse_pclookup(&self, _pc: usize) -> Option<(u64, usize)> {
        None
    }

    fn pclookup_htable(&self, _pc: usize) -> Option<FragmentId> {
        None
    }

    fn lookup_deleted(&mut self, _tag: u64) -> bool {
        false
    }
}

#[derive(Default)]
pub struct NoopTrace {
    pub aborts: usize,
}

impl TraceController for NoopTrace {
    fn abort_in_progress_trace(&mut self) {
        self.aborts += 1;
    }
}

/// Always grants a quiesce, as if every other worker immediately parked.
pub struct NoopQuiescer;

impl Quiescer for NoopQuiescer {
    fn synch_all_threads(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn end_synch(&mut self) {}
}

/// Bundles four borrowed doubles into one `ExternalHooks`, matching the one
/// borrow `Cache::add_fragment` and friends expect.
pub fn hooks<'a>(
    shifter: &'a mut NoopShifter,
    linker: &'a mut RecordingLinker,
    table: &'a mut NoopTable,
    trace: &'a mut NoopTrace,
) -> ExternalHooks<'a> {
    ExternalHooks {
        shifter,
        linker,
        table,
        trace,
    }
}
