//! Options structure for the fragment cache manager.
//!
//! This module defines the small, fixed set of options the core consumes.
//! It provides:
//! 1. **Defaults:** Baseline unit-sizing and working-set constants.
//! 2. **`CacheOptions`:** Per-cache-kind sizing, alignment, and working-set
//!    parameters.
//! 3. **`FcacheOptions`:** The aggregate options structure for all cache
//!    kinds, plus the init-time parameter compatibility checks.
//!
//! Options are supplied via `serde_json` (or any `serde::Deserialize`
//! source) or built with [`FcacheOptions::default`].

use serde::Deserialize;

use crate::error::FcacheError;

/// Default sizing and working-set constants.
///
/// These mirror reasonable defaults for a basic-block-sized private cache;
/// trace and shared caches typically override several of them.
mod defaults {
    /// Default initial unit commit size (32 KiB).
    pub const UNIT_INIT: usize = 32 * 1024;

    /// Default unit size past which quadrupling (instead of doubling) stops
    /// being used for in-place resize (256 KiB).
    pub const UNIT_QUADRUPLE: usize = 256 * 1024;

    /// Default maximum unit size (1 MiB).
    pub const UNIT_MAX: usize = 1024 * 1024;

    /// Default free-upgrade threshold: total cache size below which growth
    /// is always permitted regardless of the working-set ratio (64 KiB).
    pub const UNIT_UPGRADE: usize = 64 * 1024;

    /// Default slot header/footer alignment in bytes.
    pub const ALIGN: usize = 8;

    /// Default commit granularity (one 4 KiB page).
    pub const COMMIT_INCREMENT: usize = 4096;

    /// Default working-set "regenerated" numerator.
    pub const REGEN: u32 = 10;

    /// Default working-set "replaced" denominator.
    pub const REPLACE: u32 = 50;
}

/// Sizing and working-set options for a single cache kind.
///
/// One instance of this exists per logical cache (bb-private, trace-private,
/// bb-shared, trace-shared, coarse-bb); [`FcacheOptions`] aggregates them.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheOptions {
    /// Hard cap on total committed size across all units in this cache.
    /// Zero means unbounded.
    #[serde(default)]
    pub max_size: usize,

    /// Initial commit size for a freshly created unit.
    #[serde(default = "CacheOptions::default_unit_init")]
    pub unit_init: usize,

    /// Unit size past which doubling (rather than quadrupling) is used for
    /// in-place resize.
    #[serde(default = "CacheOptions::default_unit_quadruple")]
    pub unit_quadruple: usize,

    /// Maximum size a single unit may grow to, whether by commit extension,
    /// in-place resize, or (for shared caches) initial sizing.
    #[serde(default = "CacheOptions::default_unit_max")]
    pub unit_max: usize,

    /// Total cache size below which growth is always permitted, regardless
    /// of the working-set regen/replace ratio.
    #[serde(default = "CacheOptions::default_unit_upgrade")]
    pub free_upgrade_size: usize,

    /// Slot header alignment, in bytes. Also the minimum granularity for
    /// padding absorption.
    #[serde(default = "CacheOptions::default_align")]
    pub align: usize,

    /// Page commit granularity used by `extend_commit`.
    #[serde(default = "CacheOptions::default_commit_increment")]
    pub commit_increment: usize,

    /// Working-set "regenerated" numerator. Zero means growth is never
    /// permitted past the free upgrade.
    #[serde(default = "CacheOptions::default_regen")]
    pub regen: u32,

    /// Working-set "replaced" denominator. Zero disables the working-set
    /// policy entirely (growth is always permitted, subject only to
    /// `max_size`).
    #[serde(default = "CacheOptions::default_replace")]
    pub replace: u32,

    /// Enables the working-set policy (`finite_*_cache`). When `false`,
    /// growth is always permitted.
    #[serde(default = "CacheOptions::default_finite")]
    pub finite: bool,

    /// Enables free-list machinery for a shared cache (`cache_shared_free_list`).
    /// Ignored for private and coarse caches.
    #[serde(default = "CacheOptions::default_shared_free_list")]
    pub shared_free_list: bool,

    /// Proactively reset this cache after it has created this many units
    /// (0 disables). Mirrors `reset_at_nth_*_unit`.
    #[serde(default)]
    pub reset_at_nth_unit: u32,

    /// Proactively reset this cache every time it creates this many more
    /// units after the first reset (0 disables). Mirrors
    /// `reset_every_nth_*_unit`.
    #[serde(default)]
    pub reset_every_nth_unit: u32,
}

impl CacheOptions {
    fn default_unit_init() -> usize {
        defaults::UNIT_INIT
    }

    fn default_unit_quadruple() -> usize {
        defaults::UNIT_QUADRUPLE
    }

    fn default_unit_max() -> usize {
        defaults::UNIT_MAX
    }

    fn default_unit_upgrade() -> usize {
        defaults::UNIT_UPGRADE
    }

    fn default_align() -> usize {
        defaults::ALIGN
    }

    fn default_commit_increment() -> usize {
        defaults::COMMIT_INCREMENT
    }

    fn default_regen() -> u32 {
        defaults::REGEN
    }

    fn default_replace() -> u32 {
        defaults::REPLACE
    }

    const fn default_finite() -> bool {
        true
    }

    const fn default_shared_free_list() -> bool {
        true
    }

    /// Builds options for a private, unbounded, non-finite cache, the
    /// common case used by tests and by `FcacheOptions::default`'s
    /// basic-block cache.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_size: 0,
            unit_init: defaults::UNIT_INIT,
            unit_quadruple: defaults::UNIT_QUADRUPLE,
            unit_max: defaults::UNIT_MAX,
            free_upgrade_size: defaults::UNIT_UPGRADE,
            align: defaults::ALIGN,
            commit_increment: defaults::COMMIT_INCREMENT,
            regen: 0,
            replace: 0,
            finite: false,
            shared_free_list: true,
            reset_at_nth_unit: 0,
            reset_every_nth_unit: 0,
        }
    }

    /// Checks that this cache's sizing ladder and working-set ratio are
    /// internally consistent, clamping `regen` down to `replace` when it
    /// exceeds it rather than rejecting the configuration outright.
    pub fn validate(&mut self, is_shared: bool) -> Result<(), FcacheError> {
        if self.unit_init > self.unit_quadruple || self.unit_quadruple > self.unit_max {
            return Err(FcacheError::InvalidConfig {
                detail: format!(
                    "unit_init ({}) <= unit_quadruple ({}) <= unit_max ({}) does not hold",
                    self.unit_init, self.unit_quadruple, self.unit_max
                ),
            });
        }
        if self.max_size != 0 && self.unit_max > self.max_size {
            return Err(FcacheError::InvalidConfig {
                detail: format!(
                    "unit_max ({}) exceeds cache max_size ({})",
                    self.unit_max, self.max_size
                ),
            });
        }
        if is_shared && self.unit_init != self.unit_max {
            return Err(FcacheError::InvalidConfig {
                detail: "shared caches must not resize: unit_init must equal unit_max".to_owned(),
            });
        }
        if u64::try_from(self.unit_max).unwrap_or(u64::MAX) > u64::from(u32::MAX) {
            return Err(FcacheError::InvalidConfig {
                detail: "unit_max must fit in 32 bits".to_owned(),
            });
        }
        if self.regen > 0 && self.replace > 0 && self.regen > self.replace {
            self.regen = self.replace;
        }
        Ok(())
    }
}

/// Aggregate options for every cache kind the manager owns.
///
/// Corresponds to the full options structure a cache manager exposes at
/// init time (`cache_bb_max`, `cache_trace_max`,
/// `cache_shared_bb_max`, `cache_shared_trace_max`, `cache_coarse_bb_max`,
/// and the per-kind sizing/alignment/working-set families).
#[derive(Debug, Clone, Deserialize)]
pub struct FcacheOptions {
    /// Options for the private basic-block cache.
    pub bb_private: CacheOptions,
    /// Options for the private trace cache.
    pub trace_private: CacheOptions,
    /// Options for the shared basic-block cache, present only if
    /// `shared_bbs` is enabled.
    #[serde(default)]
    pub bb_shared: Option<CacheOptions>,
    /// Options for the shared trace cache, present only if `shared_traces`
    /// is enabled.
    #[serde(default)]
    pub trace_shared: Option<CacheOptions>,
    /// Options for the coarse-grain basic-block cache, present only if
    /// coarse-grain units are enabled.
    #[serde(default)]
    pub coarse_bb: Option<CacheOptions>,
}

impl Default for FcacheOptions {
    fn default() -> Self {
        let mut trace_private = CacheOptions::unbounded();
        // Traces are larger than basic blocks on average; give them a
        // larger starting unit.
        trace_private.unit_init = defaults::UNIT_INIT * 2;
        trace_private.unit_max = defaults::UNIT_MAX * 2;
        trace_private.unit_quadruple = defaults::UNIT_QUADRUPLE * 2;

        Self {
            bb_private: CacheOptions::unbounded(),
            trace_private,
            bb_shared: None,
            trace_shared: None,
            coarse_bb: None,
        }
    }
}

impl FcacheOptions {
    /// Runs the init-time parameter compatibility checks on every
    /// configured cache kind.
    pub fn validate(&mut self) -> Result<(), FcacheError> {
        self.bb_private.validate(false)?;
        self.trace_private.validate(false)?;
        if let Some(opts) = self.bb_shared.as_mut() {
            opts.validate(true)?;
        }
        if let Some(opts) = self.trace_shared.as_mut() {
            opts.validate(true)?;
        }
        if let Some(opts) = self.coarse_bb.as_mut() {
            opts.validate(true)?;
        }
        Ok(())
    }
}
