//! Decoder state machine (spec §4.1 state table).
//!
//! [`crate::decode::Decoder::decode_one`] walks these states in order,
//! though several are skipped for any given instruction (a ModRM-less
//! instruction goes straight from `Primary` to `ImmBytes`, or `Done`).

/// One state in the per-instruction decode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Consuming legacy prefixes (lock/rep/repne, segment overrides,
    /// operand-size/address-size overrides) and an optional REX byte.
    Prefix,
    /// Saw `0x0F`; deciding between the one-byte escape table, the
    /// `0x0F 0x38`/`0x0F 0x3A` three-byte escape maps (not modeled), and
    /// the x87 range (handled directly from `Prefix`, not through here).
    Escape,
    /// Saw `0xC4`/`0xC5`; decoding the VEX prefix bytes (map select, `pp`,
    /// `vvvv`, `L`, `W`) before resolving the real opcode underneath.
    Vex,
    /// Opcode resolved to an [`crate::opcode::InstInfo`]; reading its ModRM
    /// byte if [`crate::opcode::InstFlags::HAS_MODRM`] is set.
    ModRm,
    /// `ModRM.mod != 0b11 && ModRM.rm == 0b100` in 32/64-bit addressing:
    /// reading the SIB byte.
    Sib,
    /// Reading 0, 1, or 4 literal displacement bytes per the addressing
    /// form resolved from ModRM/SIB.
    Displacement,
    /// Reading the instruction's literal immediate bytes, if any.
    ImmBytes,
    /// Decoding finished successfully.
    Done,
    /// Decoding failed; see the [`crate::error::DecodeError`] that
    /// accompanies this state.
    Invalid,
}
