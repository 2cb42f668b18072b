//! Adaptive working-set sizing: decides whether a cache may grow past its
//! free-upgrade threshold, trading off against a regenerate/replace ratio
//! so a cache settles at roughly the size it needs rather than growing
//! without bound.

use crate::config::CacheOptions;

/// Result of a `permit_growth` check: whether growth is allowed, and
/// whether the oldest unit in the cache should also be flushed to keep
/// total size roughly constant (shared caches only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthDecision {
    pub permit: bool,
    pub flush_oldest: bool,
}

/// Per-cache working-set counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsetState {
    num_regenerated: u32,
    num_replaced: u32,
    /// Batches ratio checks for private caches so they aren't re-evaluated
    /// on every single placement when `regen` is much smaller than
    /// `replace`.
    wset_check: u32,
    /// Once set, every placement counts toward `num_replaced` even for a
    /// private cache (mirrors crossing the free-upgrade threshold once).
    record_wset: bool,
}

impl WsetState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether `add_size` more bytes may be committed to the
    /// cache, per the regen/replace working-set ratio.
    ///
    /// `is_shared` controls whether a denied-but-eligible request is
    /// instead granted with `flush_oldest = true` (shared caches trade a
    /// flush for bounded growth instead of being denied outright).
    pub fn permit_growth(
        &mut self,
        opts: &CacheOptions,
        current_size: usize,
        add_size: usize,
        is_shared: bool,
    ) -> GrowthDecision {
        let deny = GrowthDecision {
            permit: false,
            flush_oldest: false,
        };
        let grant = GrowthDecision {
            permit: true,
            flush_oldest: false,
        };

        if opts.max_size > 0 && current_size + add_size > opts.max_size {
            return deny;
        }
        if !opts.finite || opts.replace == 0 {
            return grant;
        }
        if opts.regen == 0 {
            return deny;
        }
        if self.wset_check > 0 {
            self.wset_check -= 1;
            return deny;
        }
        if current_size < opts.free_upgrade_size {
            if !is_shared {
                self.wset_check = opts.replace;
            } else if current_size + add_size >= opts.free_upgrade_size {
                self.record_wset = true;
            }
            return grant;
        }

        if self.num_replaced >= opts.replace && self.num_regenerated >= opts.regen {
            while self.num_replaced >= opts.replace && self.num_regenerated >= opts.regen {
                self.num_replaced -= opts.replace;
                self.num_regenerated -= opts.regen;
            }
            self.wset_check = opts.replace;
            return grant;
        }

        if is_shared {
            GrowthDecision {
                permit: true,
                flush_oldest: true,
            }
        } else {
            deny
        }
    }

    /// Whether this placement should be counted toward `num_replaced`
    /// (every shared-cache placement, or a private-cache placement after
    /// `record_wset` has latched true).
    #[must_use]
    pub fn should_record(&self, is_shared: bool) -> bool {
        is_shared || self.record_wset
    }

    /// Accounts for a placement: increments `num_replaced`, and if
    /// `regenerated` (the tag was found in the external deleted-fragment
    /// table) also increments `num_regenerated`.
    pub fn record_placement(&mut self, regenerated: bool) {
        self.num_replaced += 1;
        if regenerated {
            self.num_regenerated += 1;
        }
    }

    /// Accounts for a FIFO eviction in a private finite cache.
    pub fn record_replacement(&mut self) {
        self.num_replaced += 1;
    }

    #[must_use]
    pub fn num_regenerated(&self) -> u32 {
        self.num_regenerated
    }

    #[must_use]
    pub fn num_replaced(&self) -> u32 {
        self.num_replaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> CacheOptions {
        let mut o = CacheOptions::unbounded();
        o.finite = true;
        o.free_upgrade_size = 64 * 1024;
        o.regen = 10;
        o.replace = 50;
        o
    }

    #[test]
    fn free_upgrade_always_grants_below_threshold() {
        let mut w = WsetState::new();
        let d = w.permit_growth(&opts(), 0, 4096, true);
        assert!(d.permit);
    }

    #[test]
    fn denies_past_upgrade_without_enough_regen() {
        let mut w = WsetState::new();
        let o = opts();
        let _ = w.permit_growth(&o, 0, o.free_upgrade_size, false);
        for _ in 0..49 {
            w.record_placement(false);
        }
        let d = w.permit_growth(&o, o.free_upgrade_size, 4096, false);
        assert!(!d.permit, "private cache with insufficient regen must deny");
    }

    #[test]
    fn shared_cache_grants_with_flush_when_ratio_unmet() {
        let mut w = WsetState::new();
        let o = opts();
        let d = w.permit_growth(&o, o.free_upgrade_size, 4096, true);
        assert!(d.permit);
        assert!(d.flush_oldest, "shared cache trades a flush for growth");
    }

    #[test]
    fn grants_and_decrements_when_ratio_met() {
        let mut w = WsetState::new();
        let o = opts();
        for _ in 0..50 {
            w.record_placement(true);
        }
        let d = w.permit_growth(&o, o.free_upgrade_size, 4096, true);
        assert!(d.permit);
        assert!(!d.flush_oldest);
        assert_eq!(w.num_replaced(), 0);
        assert_eq!(w.num_regenerated(), 0);
    }

    #[test]
    fn cap_denies_regardless_of_ratio() {
        let mut w = WsetState::new();
        let mut o = opts();
        o.max_size = 1024;
        let d = w.permit_growth(&o, 1000, 100, true);
        assert!(!d.permit);
    }
}
