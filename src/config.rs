//! Process-wide configuration (spec §6).
//!
//! Mirrors the teacher's approach of plain, explicitly-constructed data
//! (`GuestState::new`, `MemRegion::new`) rather than a magic global: callers
//! build a [`Config`] once at startup and pass it (or a shared reference to
//! it) down into the decoder, frontend, and caches that need it.

/// Granularity of self-modifying-code (SMC) detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmcMode {
    /// No SMC tracking at all; guest writes to translated pages are undefined.
    None,
    /// Track at page granularity (spec default).
    #[default]
    Page,
    /// Track at individual translated-block granularity. More precise,
    /// more bookkeeping.
    Block,
}

/// Memory-ordering emulation mode for the host's weaker-than-TSO memory model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TsoMode {
    /// No atomic emulation; assume single-threaded optimistic execution.
    #[default]
    Optimistic,
    /// Atomic emulation enabled unconditionally.
    Enabled,
    /// Atomic emulation enabled, plus the most conservative possible
    /// instruction selection (every memory op treated as if it could race).
    Paranoid,
}

/// Selects how (or whether) the async object-cache service persists
/// translations across runs (spec §6 `CacheObjectCodeCompilation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectCacheMode {
    /// AOCS disabled entirely: no persistence, no background thread.
    #[default]
    None,
    /// Read existing cache files but never write new ones.
    ReadOnly,
    /// Full read/write persistence (the steady-state mode).
    ReadWrite,
}

/// Ahead-of-time IR cache behavior (spec §6 `AOTIRLoad`/`Capture`/`Generate`).
///
/// Distinct from [`ObjectCacheMode`]: this controls a separate IR-level
/// cache that the emitter (out of scope here) may consult; the core only
/// needs to plumb the selected mode through to callers that ask for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AotIrMode {
    /// No AOT IR cache use.
    #[default]
    Disabled,
    /// Load a previously captured AOT IR cache if present.
    Load,
    /// Capture IR as it's generated, for a later `Generate` pass.
    Capture,
    /// Generate (finalize) a capture into a loadable cache file.
    Generate,
}

/// Process-wide configuration controlling the decoder, frontend, and caches.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enables multi-block discovery in the frontend (spec §6 `Multiblock`).
    pub multiblock: bool,
    /// Caps instructions per translation unit; `0` means "use the default".
    pub max_inst_per_block: u32,
    /// Selects 64-bit decoding defaults; otherwise 32-bit.
    pub is_64bit_mode: bool,
    /// Memory-ordering emulation mode.
    pub tso_mode: TsoMode,
    /// Whether the host lacks hardware TSO and auto-migration between
    /// optimistic/atomic modes is disabled (forces atomic emulation on).
    pub tso_auto_migration: bool,
    /// SMC detection granularity.
    pub smc_checks: SmcMode,
    /// Object-cache persistence mode.
    pub object_cache: ObjectCacheMode,
    /// Use a 64-bit f64 backend for x87 rather than emulating 80-bit precision.
    pub x87_reduced_precision: bool,
    /// AOT IR cache mode.
    pub aot_ir: AotIrMode,
}

/// Default instruction budget per translation unit when `max_inst_per_block == 0`.
pub const DEFAULT_MAX_INST_PER_BLOCK: u32 = 256;

impl Config {
    /// Returns the effective instruction budget, resolving the
    /// "0 means default" convention from spec §6.
    pub fn effective_max_inst_per_block(&self) -> u32 {
        if self.max_inst_per_block == 0 {
            DEFAULT_MAX_INST_PER_BLOCK
        } else {
            self.max_inst_per_block
        }
    }

    /// Whether atomic (TSO) emulation should be active right now, given
    /// whether any memory has been marked shared (spec §5 `mark_shared`).
    pub fn atomics_enabled(&self, any_memory_shared: bool) -> bool {
        match self.tso_mode {
            TsoMode::Enabled | TsoMode::Paranoid => true,
            TsoMode::Optimistic => any_memory_shared || self.tso_auto_migration == false,
        }
    }

    /// The `serialization_config` tuple from spec §4.3 "Fingerprint": any
    /// mismatch between a cached entry's config and the live config forces
    /// recompilation rather than reuse.
    pub fn serialization_config(&self) -> SerializationConfig {
        SerializationConfig {
            is_64bit_mode: self.is_64bit_mode,
            multiblock: self.multiblock,
            max_inst_per_block: self.effective_max_inst_per_block(),
            tso_mode: self.tso_mode,
            tso_auto_migration: self.tso_auto_migration,
            smc_checks: self.smc_checks,
            x87_reduced_precision: self.x87_reduced_precision,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            multiblock: true,
            max_inst_per_block: 0,
            is_64bit_mode: true,
            tso_mode: TsoMode::default(),
            tso_auto_migration: true,
            smc_checks: SmcMode::default(),
            object_cache: ObjectCacheMode::default(),
            x87_reduced_precision: false,
            aot_ir: AotIrMode::default(),
        }
    }
}

/// The subset of [`Config`] that determines whether a cached translation is
/// still valid for the current process configuration (spec §4.3
/// "Fingerprint"). Kept as a separate, `Copy`, `Eq` type so it can be
/// compared cheaply and embedded in the on-disk header (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializationConfig {
    pub is_64bit_mode: bool,
    pub multiblock: bool,
    pub max_inst_per_block: u32,
    pub tso_mode: TsoMode,
    pub tso_auto_migration: bool,
    pub smc_checks: SmcMode,
    pub x87_reduced_precision: bool,
}

impl SerializationConfig {
    /// Packs this configuration into the `flags` bitfield defined by spec §6:
    /// bit0 Multiblock, bit1 TSOEnabled, bit2 ParanoidTSO, bit3 Is64BitMode,
    /// bit4 x87ReducedPrecision, bit5 MemcpySetTSO (unused here, always 0),
    /// bit8..11 SMCChecks.
    pub fn to_flags_word(&self) -> u32 {
        let mut flags = 0u32;
        if self.multiblock {
            flags |= 1 << 0;
        }
        if matches!(self.tso_mode, TsoMode::Enabled | TsoMode::Paranoid) {
            flags |= 1 << 1;
        }
        if matches!(self.tso_mode, TsoMode::Paranoid) {
            flags |= 1 << 2;
        }
        if self.is_64bit_mode {
            flags |= 1 << 3;
        }
        if self.x87_reduced_precision {
            flags |= 1 << 4;
        }
        let smc: u32 = match self.smc_checks {
            SmcMode::None => 0,
            SmcMode::Page => 1,
            SmcMode::Block => 2,
        };
        flags |= (smc & 0xf) << 8;
        flags
    }

    /// Inverse of [`Self::to_flags_word`], used when loading a cached header.
    pub fn from_flags_word(flags: u32, max_inst_per_block: u32) -> Self {
        let tso_enabled = flags & (1 << 1) != 0;
        let paranoid = flags & (1 << 2) != 0;
        SerializationConfig {
            multiblock: flags & (1 << 0) != 0,
            tso_mode: if paranoid {
                TsoMode::Paranoid
            } else if tso_enabled {
                TsoMode::Enabled
            } else {
                TsoMode::Optimistic
            },
            is_64bit_mode: flags & (1 << 3) != 0,
            x87_reduced_precision: flags & (1 << 4) != 0,
            tso_auto_migration: true,
            smc_checks: match (flags >> 8) & 0xf {
                0 => SmcMode::None,
                1 => SmcMode::Page,
                _ => SmcMode::Block,
            },
            max_inst_per_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resolves_max_inst_per_block() {
        let cfg = Config::default();
        assert_eq!(cfg.effective_max_inst_per_block(), DEFAULT_MAX_INST_PER_BLOCK);
    }

    #[test]
    fn explicit_max_inst_per_block_overrides_default() {
        let cfg = Config {
            max_inst_per_block: 16,
            ..Config::default()
        };
        assert_eq!(cfg.effective_max_inst_per_block(), 16);
    }

    #[test]
    fn flags_word_round_trips() {
        let cfg = Config {
            tso_mode: TsoMode::Paranoid,
            smc_checks: SmcMode::Block,
            x87_reduced_precision: true,
            ..Config::default()
        };
        let sc = cfg.serialization_config();
        let flags = sc.to_flags_word();
        let back = SerializationConfig::from_flags_word(flags, sc.max_inst_per_block);
        assert_eq!(back.multiblock, sc.multiblock);
        assert_eq!(back.tso_mode, sc.tso_mode);
        assert_eq!(back.is_64bit_mode, sc.is_64bit_mode);
        assert_eq!(back.x87_reduced_precision, sc.x87_reduced_precision);
        assert_eq!(back.smc_checks, sc.smc_checks);
    }

    #[test]
    fn atomics_enabled_follows_mark_shared() {
        let mut cfg = Config::default();
        cfg.tso_mode = TsoMode::Optimistic;
        cfg.tso_auto_migration = true;
        assert!(!cfg.atomics_enabled(false));
        assert!(cfg.atomics_enabled(true));

        cfg.tso_auto_migration = false;
        assert!(cfg.atomics_enabled(false));
    }
}
