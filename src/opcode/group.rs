//! Secondary group-instruction tables and the x87 escape table (spec §4.1:
//! "Group instructions and escape prefixes").
//!
//! Group opcodes (`0x80/0x81/0x83`, `0x8F`, `0xC0/0xC1`, `0xC6/0xC7`,
//! `0xD0..0xD3`, `0xF6/0xF7`, `0xFE/0xFF`, and the two-byte `0x0F 0x00/0x01`
//! system groups) share one primary-table slot across up to eight distinct
//! instructions, selected by `ModRM.reg`. The x87 escape range (`0xD8..0xDF`)
//! goes one step further: the full ModRM byte participates in selection,
//! because the memory-operand forms (`modrm.mod != 0b11`) differ in meaning
//! from the register-stack forms (`modrm.mod == 0b11`) at the same `reg`.
//!
//! Same construction discipline as [`super::tables`]: everything is a
//! `const fn` evaluated once into a `static` array, no runtime setup.

use super::{GprId, GroupId, InstFlags, InstInfo, InstKind, SizeHint, INVALID_INST_INFO};
use crate::emitter::unimplemented;

const fn entry(mnemonic: &'static str, flags: InstFlags, imm_bytes: Option<u8>) -> InstInfo {
    InstInfo {
        mnemonic,
        kind: InstKind::Normal,
        flags,
        imm_bytes,
        size_hint: SizeHint::Default,
        dispatch: Some(unimplemented),
    }
}

const MODRM: InstFlags = InstFlags::HAS_MODRM;

/// Eight-entry secondary table for one `GroupId`, indexed by `ModRM.reg`.
pub type SecondaryTable = [InstInfo; 8];

const MODRM_IMM: InstFlags = MODRM.union(InstFlags::HAS_IMMEDIATE);

/// Every Group1 (`0x80`/`0x81`/`0x83`) entry always carries an immediate;
/// its width is pinned by the caller from the primary-table variant that
/// selected this group (see [`crate::decode::Decoder::step_modrm`]).
const fn group1() -> SecondaryTable {
    [
        entry("add", MODRM_IMM, None),
        entry("or", MODRM_IMM, None),
        entry("adc", MODRM_IMM, None),
        entry("sbb", MODRM_IMM, None),
        entry("and", MODRM_IMM, None),
        entry("sub", MODRM_IMM, None),
        entry("xor", MODRM_IMM, None),
        entry("cmp", MODRM_IMM, None),
    ]
}

const fn group1a() -> SecondaryTable {
    [
        entry("pop", MODRM, None),
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
    ]
}

/// Group2 (shifts/rotates) spans four primary-opcode variants with
/// different shift-count encodings (`0xC0`/`0xC1` take `Ib`; `0xD0`/`0xD1`
/// shift by 1 with no operand bytes; `0xD2`/`0xD3` shift by `CL`, also no
/// operand bytes) — the caller pins the width per variant the same way as
/// [`group1`], down to zero for the `CL`/shift-by-1 forms.
const fn group2() -> SecondaryTable {
    [
        entry("rol", MODRM_IMM, None),
        entry("ror", MODRM_IMM, None),
        entry("rcl", MODRM_IMM, None),
        entry("rcr", MODRM_IMM, None),
        entry("shl", MODRM_IMM, None),
        entry("shr", MODRM_IMM, None),
        entry("sal", MODRM_IMM, None), // alias of shl, kept distinct per encoding
        entry("sar", MODRM_IMM, None),
    ]
}

const fn group3() -> SecondaryTable {
    [
        entry("test", MODRM.union(InstFlags::HAS_IMMEDIATE), None),
        entry("test", MODRM.union(InstFlags::HAS_IMMEDIATE), None), // reg=1 is an undocumented alias of test
        entry("not", MODRM, Some(0)),
        entry("neg", MODRM, Some(0)),
        entry("mul", MODRM, Some(0)),
        entry("imul", MODRM, Some(0)),
        entry("div", MODRM, Some(0)),
        entry("idiv", MODRM, Some(0)),
    ]
}

const fn group4() -> SecondaryTable {
    [
        entry("inc", MODRM, Some(0)),
        entry("dec", MODRM, Some(0)),
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
    ]
}

const fn group5() -> SecondaryTable {
    [
        entry("inc", MODRM, Some(0)),
        entry("dec", MODRM, Some(0)),
        entry("call", MODRM.union(InstFlags::BRANCH_INDIRECT), Some(0)), // near indirect call
        entry("callf", MODRM.union(InstFlags::BRANCH_INDIRECT), Some(0)), // far call, not modeled further
        entry("jmp", MODRM.union(InstFlags::BRANCH_INDIRECT), Some(0)), // near indirect jmp
        entry("jmpf", MODRM.union(InstFlags::BRANCH_INDIRECT), Some(0)),
        entry("push", MODRM, Some(0)),
        INVALID_INST_INFO,
    ]
}

const fn group6() -> SecondaryTable {
    [
        entry("sldt", MODRM, Some(0)),
        entry("str", MODRM, Some(0)),
        entry("lldt", MODRM, Some(0)),
        entry("ltr", MODRM, Some(0)),
        entry("verr", MODRM, Some(0)),
        entry("verw", MODRM, Some(0)),
        INVALID_INST_INFO,
        INVALID_INST_INFO,
    ]
}

const fn group7() -> SecondaryTable {
    [
        entry("sgdt", MODRM, Some(0)),
        entry("sidt", MODRM, Some(0)),
        entry("lgdt", MODRM, Some(0)),
        entry("lidt", MODRM, Some(0)),
        entry("smsw", MODRM, Some(0)),
        INVALID_INST_INFO,
        entry("lmsw", MODRM, Some(0)),
        entry("invlpg", MODRM, Some(0)),
    ]
}

const fn group8() -> SecondaryTable {
    [
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        entry("bt", MODRM.union(InstFlags::HAS_IMMEDIATE), Some(1)),
        entry("bts", MODRM.union(InstFlags::HAS_IMMEDIATE), Some(1)),
        entry("btr", MODRM.union(InstFlags::HAS_IMMEDIATE), Some(1)),
        entry("btc", MODRM.union(InstFlags::HAS_IMMEDIATE), Some(1)),
    ]
}

const fn group9() -> SecondaryTable {
    [
        INVALID_INST_INFO,
        entry("cmpxchg8b", MODRM, Some(0)),
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
    ]
}

const fn group11() -> SecondaryTable {
    [
        entry("mov", MODRM.union(InstFlags::HAS_IMMEDIATE), None),
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
        INVALID_INST_INFO,
    ]
}

/// Groups 12..16 (SSE shift-immediate and prefetch groups) are stubbed: they
/// resolve to a single placeholder mnemonic regardless of `reg`, since the
/// XMM operand forms they select between are all equally out of scope here.
const fn sse_stub(mnemonic: &'static str) -> SecondaryTable {
    [
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
        entry(mnemonic, MODRM.union(InstFlags::XMM_FLAGS), Some(1)),
    ]
}

static GROUP1: SecondaryTable = group1();
static GROUP1A: SecondaryTable = group1a();
static GROUP2: SecondaryTable = group2();
static GROUP3: SecondaryTable = group3();
static GROUP4: SecondaryTable = group4();
static GROUP5: SecondaryTable = group5();
static GROUP6: SecondaryTable = group6();
static GROUP7: SecondaryTable = group7();
static GROUP8: SecondaryTable = group8();
static GROUP9: SecondaryTable = group9();
static GROUP11: SecondaryTable = group11();
static GROUP12: SecondaryTable = sse_stub("psllw_grp12");
static GROUP13: SecondaryTable = sse_stub("pslld_grp13");
static GROUP14: SecondaryTable = sse_stub("psllq_grp14");
static GROUP15: SecondaryTable = sse_stub("fxsave_grp15");
static GROUP16: SecondaryTable = sse_stub("prefetch_grp16");

/// Resolves `(group, modrm.reg)` to the real instruction, per spec §4.1:
/// "the decoder reads ModRM, derives `(group, prefix_class, reg)`, and
/// re-dispatches through a secondary table." `prefix_class` only affects a
/// handful of SSE groups not modeled individually here, so it is accepted
/// for interface symmetry but unused by this representative table set.
pub fn lookup(group: GroupId, reg: u8) -> InstInfo {
    let table: &SecondaryTable = match group {
        GroupId::Group1 => &GROUP1,
        GroupId::Group1A => &GROUP1A,
        GroupId::Group2 => &GROUP2,
        GroupId::Group3 => &GROUP3,
        GroupId::Group4 => &GROUP4,
        GroupId::Group5 => &GROUP5,
        GroupId::Group6 => &GROUP6,
        GroupId::Group7 => &GROUP7,
        GroupId::Group8 => &GROUP8,
        GroupId::Group9 => &GROUP9,
        GroupId::Group11 => &GROUP11,
        GroupId::Group12 => &GROUP12,
        GroupId::Group13 => &GROUP13,
        GroupId::Group14 => &GROUP14,
        GroupId::Group15 => &GROUP15,
        GroupId::Group16 => &GROUP16,
    };
    table[(reg & 0b111) as usize]
}

/// `((opcode - 0xD8) << 8) | modrm` keyed x87 table; 8 opcodes * 256 ModRM
/// values. Populated with a representative set of the most common stack and
/// memory forms, following the teacher's `ArmLut::create_lut` approach of
/// filling a `const fn`-built array with `INVALID_INST_INFO` and overwriting
/// specific indices.
const fn build_x87() -> [InstInfo; 8 * 256] {
    let mut table = [INVALID_INST_INFO; 8 * 256];

    // D8: FADD/FMUL/.../FDIV on memory (modrm.mod != 11) or ST(i) (mod == 11).
    let mut modrm = 0usize;
    while modrm < 256 {
        let reg = (modrm >> 3) & 0b111;
        let mnemonic = match reg {
            0 => "fadd",
            1 => "fmul",
            2 => "fcom",
            3 => "fcomp",
            4 => "fsub",
            5 => "fsubr",
            6 => "fdiv",
            _ => "fdivr",
        };
        table[0 * 256 + modrm] = entry(mnemonic, MODRM, Some(0));
        modrm += 1;
    }

    // D9: FLD/FST/FSTP memory forms, plus a few fixed register-stack opcodes.
    modrm = 0;
    while modrm < 256 {
        let reg = (modrm >> 3) & 0b111;
        let mnemonic = match reg {
            0 => "fld",
            2 => "fst",
            3 => "fstp",
            5 => "fldcw",
            7 => "fstcw",
            _ => "(x87 d9)",
        };
        table[1 * 256 + modrm] = entry(mnemonic, MODRM, Some(0));
        modrm += 1;
    }
    table[1 * 256 + 0xE0] = entry("fchs", InstFlags::empty(), Some(0));
    table[1 * 256 + 0xE1] = entry("fabs", InstFlags::empty(), Some(0));
    table[1 * 256 + 0xE8] = entry("fld1", InstFlags::empty(), Some(0));
    table[1 * 256 + 0xEE] = entry("fldz", InstFlags::empty(), Some(0));

    // DB: FILD/FIST/FISTP dword integer memory forms.
    modrm = 0;
    while modrm < 256 {
        let reg = (modrm >> 3) & 0b111;
        let mnemonic = match reg {
            0 => "fild",
            2 => "fist",
            3 => "fistp",
            _ => "(x87 db)",
        };
        table[3 * 256 + modrm] = entry(mnemonic, MODRM, Some(0));
        modrm += 1;
    }

    // DD: FLD/FST/FSTP double-precision memory forms.
    modrm = 0;
    while modrm < 256 {
        let reg = (modrm >> 3) & 0b111;
        let mnemonic = match reg {
            0 => "fld",
            2 => "fst",
            3 => "fstp",
            _ => "(x87 dd)",
        };
        table[5 * 256 + modrm] = entry(mnemonic, MODRM, Some(0));
        modrm += 1;
    }

    table
}

static X87_TABLE: [InstInfo; 8 * 256] = build_x87();

/// Resolves a fully-decoded x87 opcode (`0xD8..0xDF`) plus ModRM byte to its
/// real instruction, per spec §4.1's `((opcode-0xD8)<<8)|modrm` key.
pub fn lookup_x87(opcode: u8, modrm: u8) -> InstInfo {
    debug_assert!((0xD8..=0xDF).contains(&opcode));
    let idx = ((opcode - 0xD8) as usize) << 8 | modrm as usize;
    X87_TABLE[idx]
}

/// Register field decoded from an x87 ModRM byte when `mod == 0b11`
/// (register-stack form): `ST(i)` rather than a GPR.
pub fn st_register(modrm: u8) -> GprId {
    super::map_register(false, modrm & 0b111)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group1_reg_selects_alu_op() {
        assert_eq!(lookup(GroupId::Group1, 0).mnemonic, "add");
        assert_eq!(lookup(GroupId::Group1, 7).mnemonic, "cmp");
    }

    #[test]
    fn group1a_only_reg0_is_valid() {
        assert_eq!(lookup(GroupId::Group1A, 0).mnemonic, "pop");
        assert!(matches!(lookup(GroupId::Group1A, 1).kind, InstKind::Invalid));
    }

    #[test]
    fn group3_test_carries_immediate() {
        let info = lookup(GroupId::Group3, 0);
        assert_eq!(info.mnemonic, "test");
        assert!(info.flags.contains(InstFlags::HAS_IMMEDIATE));
    }

    #[test]
    fn x87_d9_memory_and_register_forms() {
        assert_eq!(lookup_x87(0xD9, 0x00).mnemonic, "fld"); // mod=00, reg=0, rm=0
        assert_eq!(lookup_x87(0xD9, 0xE1).mnemonic, "fabs");
    }

    #[test]
    fn x87_d8_reg_field_selects_arith_op() {
        assert_eq!(lookup_x87(0xD8, 0b11_000_000).mnemonic, "fadd");
        assert_eq!(lookup_x87(0xD8, 0b11_110_000).mnemonic, "fdiv");
    }
}
