//! Opcode Dictionary (OD) — spec §2 item 1, §3 `InstInfo`.
//!
//! A static, immutable dictionary mapping encoded opcode bytes (with
//! prefix/escape/VEX disambiguation) to [`InstInfo`] records. Initialized
//! once at process startup and indexed by composite opcode keys built by
//! [`tables`].
//!
//! The dispatcher field on `InstInfo` follows the design note in spec §9:
//! rather than the teacher's raw-`fn`-pointer-plus-`transmute` table
//! (`lift::dispatch::ArmFn`), every table entry shares one concrete
//! function signature, so no `unsafe` transmute is needed to populate it.

pub mod tables;
pub mod group;

use bitflags::bitflags;

bitflags! {
    /// Per-instruction flag bits carried on [`InstInfo`].
    ///
    /// These mirror the distinctions the decoder's state machine (spec
    /// §4.1 table) needs to make *before* it has fully decoded an
    /// instruction: whether a ModRM byte follows, how operand size is
    /// determined, and which operand-size defaults apply.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct InstFlags: u32 {
        /// A ModRM byte follows the opcode (possibly SIB/displacement too).
        const HAS_MODRM        = 1 << 0;
        /// Instruction carries 0..8 literal immediate bytes after any
        /// ModRM/SIB/displacement (count given by [`InstInfo::imm_bytes`]).
        const HAS_IMMEDIATE    = 1 << 1;
        /// This entry is a group tag (`GROUP_1..GROUP_P`); ModRM.reg
        /// selects the real instruction via a secondary table.
        const IS_GROUP         = 1 << 2;
        /// Operates on XMM registers; implies a 64-bit-wide default even
        /// outside 64-bit mode (spec §4.1 "XMM flags group").
        const XMM_FLAGS        = 1 << 3;
        /// A narrowing `0x66` prefix shrinks this instruction's default
        /// operand size (64->32, 32->16) rather than being ignored
        /// (spec §4.1 "widening 64 unless narrowing").
        const NARROW_ON_OSIZE  = 1 << 4;
        /// This entry is only valid when a VEX prefix is present.
        const VEX_ONLY         = 1 << 5;
        /// This entry unconditionally changes the guest instruction
        /// pointer (call/jmp/ret/loop); used by the frontend to detect
        /// block-ending instructions.
        const BRANCH           = 1 << 6;
        /// Unconditional direct branch with an immediate target
        /// (`JMP rel`, `CALL rel`).
        const BRANCH_DIRECT    = 1 << 7;
        /// Conditional branch (`Jcc rel`); frontend must also queue the
        /// fall-through address.
        const BRANCH_COND      = 1 << 8;
        /// `CALL rel32`/`CALL rel8` — external by default (spec §4.1),
        /// except for the "jump past self" idiom.
        const CALL              = 1 << 9;
        /// Terminates a block unconditionally with no known target
        /// (`RET`, indirect `JMP`/`CALL`).
        const BRANCH_INDIRECT  = 1 << 10;
    }
}

/// Which size-determination signal wins for this instruction's operands,
/// in the priority order from spec §4.1 ("Operand-size determination"):
/// VEX.L, REX.W, operand-size override, default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeHint {
    /// Operand size is fixed regardless of prefixes/REX (e.g. byte ops).
    Fixed8,
    /// Standard size-resolution: default (16/32/64 depending on CS) is
    /// adjusted by `0x66`, REX.W, VEX.L/W per the priority order.
    Default,
    /// This instruction implies a 64-bit operand size whenever XMM/VEX
    /// flags are present, even outside 64-bit mode.
    XmmDefault64,
}

/// A dispatcher function invoked by an external IR emitter once it has
/// consumed a [`crate::decode::DecodedInst`] of this kind (spec §6
/// "Decoder interface to the IR emitter": "one function per instruction
/// kind, looked up via a dispatch pointer on `InstInfo`"). Spec §9's design
/// note applies: a plain `fn` with one shared signature, not a raw pointer
/// requiring `unsafe` transmutation like the teacher's `ArmFn`/`ThumbFn`.
///
/// The emitter itself is out of scope (spec §1); this crate only owns the
/// table slot and the capability trait ([`crate::emitter::OperandSource`])
/// the emitter is polymorphic over. The default entry in every table below
/// points at [`crate::emitter::unimplemented`], mirroring the teacher's
/// `arm_unimpl_instr`/`thumb_unimpl_instr` fallback handlers.
pub type Dispatch = fn(&mut dyn crate::emitter::OperandSource, &crate::decode::DecodedInst);

/// An opcode dictionary entry (spec §3 `InstInfo`).
///
/// Immutable after table initialization. Indexed by a composite opcode key
/// (primary byte, or `(escape, opcode)`, or `(group, prefix_class, reg)` —
/// see [`tables`] and [`group`]).
#[derive(Clone, Copy)]
pub struct InstInfo {
    /// Human-readable mnemonic, for disassembly/telemetry/logging.
    pub mnemonic: &'static str,
    /// Coarse instruction-type tag used for dispatch grouping.
    pub kind: InstKind,
    /// Behavior flags.
    pub flags: InstFlags,
    /// Number of literal immediate bytes following the operands, or `None`
    /// if the count depends on operand size (resolved at decode time).
    pub imm_bytes: Option<u8>,
    /// How this instruction's operand size is determined.
    pub size_hint: SizeHint,
    /// The function that finishes decoding this instruction once its
    /// class is known. `None` for group tags, which re-dispatch instead.
    pub dispatch: Option<Dispatch>,
}

impl std::fmt::Debug for InstInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstInfo")
            .field("mnemonic", &self.mnemonic)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("imm_bytes", &self.imm_bytes)
            .field("size_hint", &self.size_hint)
            .finish()
    }
}

/// Coarse classification of an opcode-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstKind {
    /// A normal, fully-specified instruction.
    Normal,
    /// A group tag: ModRM.reg plus prefix class selects the real
    /// instruction via [`group`]'s secondary tables.
    Group(GroupId),
    /// The x87 escape range (`0xD8..0xDF`), dispatched through
    /// [`group::X87_TABLE`].
    X87,
    /// Opcode did not resolve to anything the dictionary knows, including
    /// EVEX (recognized but unsupported per spec §4.1).
    Invalid,
}

/// Identifies one of the sixteen group-instruction secondary tables
/// (`GROUP_1..GROUP_P` in spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupId {
    Group1,
    Group1A,
    Group2,
    Group3,
    Group4,
    Group5,
    Group6,
    Group7,
    Group8,
    Group9,
    Group11,
    Group12,
    Group13,
    Group14,
    Group15,
    Group16,
}

/// The default "invalid instruction" entry, returned by every table lookup
/// miss. Mirrors the teacher's `ArmFn(arm_unimpl_instr)` default-fill
/// pattern in `lift::lut::ArmLut::create_lut`, but as data (`InstKind::Invalid`)
/// rather than a call to a panicking handler — an unrecognized guest opcode
/// is an architectural possibility (spec §7 `DecodeFailure`), not a bug.
pub const INVALID_INST_INFO: InstInfo = InstInfo {
    mnemonic: "(invalid)",
    kind: InstKind::Invalid,
    flags: InstFlags::empty(),
    imm_bytes: Some(0),
    size_hint: SizeHint::Default,
    dispatch: None,
};

/// Sixteen-entry register map used to resolve a ModRM reg/rm field plus the
/// relevant REX extension bit to a concrete register identifier (spec
/// §4.1 "Register map"). Index is `(rex_bit << 3) | field_bits`.
///
/// Entries `4..7` without a REX prefix present select the legacy
/// high-byte aliases (`AH`..`BH`) instead of `SPL`..`BPL`; callers
/// distinguish this case explicitly since it depends on REX *presence*,
/// not just its bit pattern (the zero REX byte `0x40` still counts as
/// "has REX" for this purpose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GprId {
    Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
    /// High-byte alias, only reachable for byte operands without REX.
    Ah, Ch, Dh, Bh,
    Invalid,
}

/// Resolve a 4-bit `(rex_bit, field)` pair to a [`GprId`] for byte operands
/// (spec §4.1: "byte registers 4..7 without REX" select high-byte aliases).
pub fn map_byte_register(rex_bit: bool, field: u8, has_rex: bool) -> GprId {
    let idx = ((rex_bit as u8) << 3) | (field & 0b111);
    if !has_rex && (4..=7).contains(&field) {
        return match field {
            4 => GprId::Ah,
            5 => GprId::Ch,
            6 => GprId::Dh,
            7 => GprId::Bh,
            _ => unreachable!(),
        };
    }
    map_gpr_index(idx)
}

/// Resolve a 4-bit `(rex_bit, field)` pair to a [`GprId`] for word/dword/
/// qword operands and for XMM/MM register fields (no high-byte aliasing
/// applies to these sizes).
pub fn map_register(rex_bit: bool, field: u8) -> GprId {
    map_gpr_index(((rex_bit as u8) << 3) | (field & 0b111))
}

fn map_gpr_index(idx: u8) -> GprId {
    const TABLE: [GprId; 16] = [
        GprId::Rax, GprId::Rcx, GprId::Rdx, GprId::Rbx,
        GprId::Rsp, GprId::Rbp, GprId::Rsi, GprId::Rdi,
        GprId::R8, GprId::R9, GprId::R10, GprId::R11,
        GprId::R12, GprId::R13, GprId::R14, GprId::R15,
    ];
    TABLE[(idx & 0xf) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_register_high_alias_without_rex() {
        assert_eq!(map_byte_register(false, 4, false), GprId::Ah);
        assert_eq!(map_byte_register(false, 7, false), GprId::Bh);
    }

    #[test]
    fn byte_register_spl_with_rex() {
        assert_eq!(map_byte_register(false, 4, true), GprId::Rsp);
    }

    #[test]
    fn register_map_extends_with_rex_bit() {
        assert_eq!(map_register(false, 0), GprId::Rax);
        assert_eq!(map_register(true, 0), GprId::R8);
        assert_eq!(map_register(true, 7), GprId::R15);
    }
}
