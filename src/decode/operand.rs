//! ModRM/SIB decoding and operand-size resolution (spec §4.1).
//!
//! Grounded in the original `DecodeModRM_64`/`DecodeModRM_16` displacement
//! rules (original_source `Frontend.cpp`) and restated here as small pure
//! functions rather than inline state inside the decode loop, following
//! the teacher's habit of separating "parse a field" from "drive the state
//! machine" (`lift::decode` vs `lift::dispatch`).

use crate::opcode::{map_byte_register, map_register, GprId, InstFlags, InstInfo, SizeHint};

/// A decoded ModRM byte, split into its three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub m0d: u8,
    pub reg: u8,
    pub rm: u8,
}

pub fn decode_modrm(byte: u8) -> ModRm {
    ModRm {
        m0d: (byte >> 6) & 0b11,
        reg: (byte >> 3) & 0b111,
        rm: byte & 0b111,
    }
}

/// A decoded SIB byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sib {
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

pub fn decode_sib(byte: u8) -> Sib {
    Sib {
        scale: (byte >> 6) & 0b11,
        index: (byte >> 3) & 0b111,
        base: byte & 0b111,
    }
}

/// Number of literal displacement bytes that follow ModRM (and SIB, if
/// present), for 32/64-bit addressing (`DecodeModRM_64`).
pub fn displacement_size_32_64(modrm: ModRm, sib: Option<Sib>) -> u8 {
    match modrm.m0d {
        0b00 => {
            if modrm.rm == 0b100 {
                // SIB present: base==101 with mod==00 means disp32, no base register.
                match sib {
                    Some(s) if s.base == 0b101 => 4,
                    _ => 0,
                }
            } else if modrm.rm == 0b101 {
                4 // RIP-relative in 64-bit mode, disp32 absolute otherwise
            } else {
                0
            }
        }
        0b01 => 1,
        0b10 => 4,
        0b11 => 0,
        _ => unreachable!(),
    }
}

/// Number of literal displacement bytes for 16-bit addressing (`DecodeModRM_16`).
pub fn displacement_size_16(modrm: ModRm) -> u8 {
    match modrm.m0d {
        0b00 => {
            if modrm.rm == 0b110 {
                2
            } else {
                0
            }
        }
        0b01 => 1,
        0b10 => 2,
        0b11 => 0,
        _ => unreachable!(),
    }
}

/// Sign-extends a little-endian literal displacement of `size` bytes (0, 1,
/// 2, or 4) read out of `raw` to a full `i32`.
pub fn sign_extend_displacement(raw: u64, size: u8) -> i32 {
    match size {
        0 => 0,
        1 => raw as u8 as i8 as i32,
        2 => raw as u16 as i16 as i32,
        4 => raw as u32 as i32,
        _ => unreachable!("displacement size must be 0, 1, 2, or 4"),
    }
}

/// Resolved addressing-mode classification for a ModRM byte with
/// `mod != 0b11` in 32/64-bit addressing, used to build the final
/// [`crate::decode::DecodedOperand::Mem`]/`RipRelative`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<GprId>,
    pub index: Option<(GprId, u8)>,
    pub disp: i32,
    pub rip_relative: bool,
}

/// Builds the addressing-mode description for a memory ModRM operand
/// (`modrm.mod != 0b11`), given the already-decoded SIB byte if present and
/// the REX.B/REX.X extension bits.
pub fn resolve_memory_operand(
    modrm: ModRm,
    sib: Option<Sib>,
    disp: i32,
    rex_b: bool,
    rex_x: bool,
    is_64bit_mode: bool,
) -> MemOperand {
    if modrm.rm == 0b100 {
        let sib = sib.expect("SIB must have been read when modrm.rm == 0b100");
        let index = if sib.index == 0b100 && !rex_x {
            None // 0b100 with no REX.X extension means "no index register"
        } else {
            Some((map_register(rex_x, sib.index), 1u8 << sib.scale))
        };
        let base = if modrm.m0d == 0b00 && sib.base == 0b101 {
            None // disp32, no base
        } else {
            Some(map_register(rex_b, sib.base))
        };
        MemOperand { base, index, disp, rip_relative: false }
    } else if modrm.m0d == 0b00 && modrm.rm == 0b101 {
        MemOperand { base: None, index: None, disp, rip_relative: is_64bit_mode }
    } else {
        MemOperand {
            base: Some(map_register(rex_b, modrm.rm)),
            index: None,
            disp,
            rip_relative: false,
        }
    }
}

/// Register selected by `ModRM.reg`, resolving byte-operand high-byte
/// aliasing via [`map_byte_register`].
pub fn reg_field_register(modrm: ModRm, rex_r: bool, has_rex: bool, is_byte_operand: bool) -> GprId {
    if is_byte_operand {
        map_byte_register(rex_r, modrm.reg, has_rex)
    } else {
        map_register(rex_r, modrm.reg)
    }
}

/// Operand width actually selected for this instruction, resolving the
/// priority order from spec §4.1: VEX.L, REX.W, `0x66` operand-size
/// override, default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    Size8,
    Size16,
    Size32,
    Size64,
}

pub fn resolve_operand_size(
    info: &InstInfo,
    rex_w: bool,
    osize_override: bool,
    vex_l: Option<bool>,
    is_64bit_mode: bool,
) -> OperandSize {
    if matches!(info.size_hint, SizeHint::Fixed8) {
        return OperandSize::Size8;
    }
    if matches!(info.size_hint, SizeHint::XmmDefault64) || info.flags.contains(InstFlags::XMM_FLAGS) {
        return OperandSize::Size64;
    }
    if let Some(true) = vex_l {
        return OperandSize::Size64;
    }
    if rex_w {
        return OperandSize::Size64;
    }
    if osize_override {
        return if info.flags.contains(InstFlags::NARROW_ON_OSIZE) || !is_64bit_mode {
            OperandSize::Size16
        } else {
            OperandSize::Size32
        };
    }
    let _ = is_64bit_mode; // default operand size is 32 bits regardless of mode absent REX.W
    OperandSize::Size32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modrm_fields_split_correctly() {
        let m = decode_modrm(0b11_010_101);
        assert_eq!(m.m0d, 0b11);
        assert_eq!(m.reg, 0b010);
        assert_eq!(m.rm, 0b101);
    }

    #[test]
    fn mod00_rm101_is_rip_relative_disp32() {
        let m = ModRm { m0d: 0b00, reg: 0, rm: 0b101 };
        assert_eq!(displacement_size_32_64(m, None), 4);
        let resolved = resolve_memory_operand(m, None, 0x1234, false, false, true);
        assert!(resolved.rip_relative);
        assert_eq!(resolved.disp, 0x1234);
    }

    #[test]
    fn mod00_rm100_sib_base101_is_disp32_no_base() {
        let m = ModRm { m0d: 0b00, reg: 0, rm: 0b100 };
        let sib = Sib { scale: 0, index: 0b100, base: 0b101 };
        assert_eq!(displacement_size_32_64(m, Some(sib)), 4);
        let resolved = resolve_memory_operand(m, Some(sib), 0x10, false, false, true);
        assert!(resolved.base.is_none());
        assert!(!resolved.rip_relative);
    }

    #[test]
    fn sib_index_100_without_rex_x_means_no_index() {
        let m = ModRm { m0d: 0b01, reg: 0, rm: 0b100 };
        let sib = Sib { scale: 2, index: 0b100, base: 0b011 };
        let resolved = resolve_memory_operand(m, Some(sib), 4, false, false, true);
        assert!(resolved.index.is_none());
        assert_eq!(resolved.base, Some(map_register(false, 0b011)));
    }

    #[test]
    fn displacement_sign_extends() {
        assert_eq!(sign_extend_displacement(0xFF, 1), -1);
        assert_eq!(sign_extend_displacement(0xFFFF, 2), -1);
        assert_eq!(sign_extend_displacement(0xFFFF_FFFF, 4), -1);
    }
}
