//! Error kinds for the translation pipeline.
//!
//! Most of these are not "errors" in the sense that they abort anything —
//! see spec §7 for the propagation rules followed here. `CacheMiss` in
//! particular never appears as an error: callers model it as `Option::None`.

use thiserror::Error;

/// Failures that can occur while decoding a single x86 instruction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The opcode byte(s) did not resolve to any known instruction, or an
    /// encoding-specific constraint was violated (e.g. an EVEX prefix, or a
    /// VEX map selector outside `[1,3]`).
    #[error("unrecognized or unsupported encoding at byte {offset}")]
    InvalidEncoding {
        /// Byte offset (from the start of the instruction) where decoding gave up.
        offset: usize,
    },

    /// More than [`crate::decode::MAX_INST_SIZE`] bytes were consumed while
    /// decoding a single instruction. Fatal to the enclosing block.
    #[error("instruction exceeded maximum size of {max} bytes")]
    SizeOverflow {
        /// The architectural maximum (15 for x86).
        max: usize,
    },

    /// The byte stream ended before the instruction could be fully decoded.
    #[error("instruction stream truncated after {available} bytes")]
    Truncated {
        /// Bytes actually available before the stream ended.
        available: usize,
    },
}

/// Failures from the translation cache coordinator (TCC).
#[derive(Debug, Error)]
pub enum CacheError {
    /// A resource (decode pool, region map slot, compile job) could not be
    /// allocated. Per spec §7 this is fatal only to the specific request;
    /// the caller should treat it as a cache miss and recompile.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(&'static str),
}

/// Failures from the async object-cache service (AOCS).
#[derive(Debug, Error)]
pub enum ObjectCacheError {
    /// The on-disk header's cookie/version did not match what this process
    /// expects. Per spec §6, a mismatch means the cache is ignored, not
    /// deleted.
    #[error("object cache cookie/version mismatch (found {found:#x}, expected {expected:#x})")]
    CookieMismatch {
        /// Value actually read from the file.
        found: u64,
        /// Value this process's build expects.
        expected: u64,
    },

    /// The file was shorter than the header claims, or a section's hash did
    /// not match at load time. Recovered: the entry is marked `Corrupt`.
    #[error("object cache file corrupt: {0}")]
    Corrupt(&'static str),

    /// The guest code hash observed when a serialization job was dequeued
    /// differs from the hash computed when it was enqueued, meaning the
    /// guest code was backpatched in between. The job is dropped silently;
    /// this variant exists so callers can log it at trace level.
    #[error("invalidation race detected for guest rip {guest_rip:#x}")]
    InvalidationRace {
        /// The guest instruction pointer the job was serializing.
        guest_rip: u64,
    },

    /// Underlying file I/O failure.
    #[error("object cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}
