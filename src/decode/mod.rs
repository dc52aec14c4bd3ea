//! x86 Instruction Decoder (DEC) — spec §2 item 2, §4.1.
//!
//! A single-instruction decoder: given a byte slice and the guest `rip` it
//! starts at, produces one [`DecodedInst`] or a [`DecodeError`]. Owns no
//! mutable state across calls except the optional streaming cursor used by
//! its [`crate::emitter::OperandSource`] implementation — [`Decoder::decode_one`]
//! itself is pure, matching spec §8's purity/determinism requirement for
//! the frontend built on top of it.
//!
//! Grounded in the original `Decoder` class (`original_source` `Decoder.h`/
//! `Frontend.cpp`: `ReadByte`/`PeekByte`/`ReadData`/`DecodeInstruction`), and
//! in the teacher's `lift::decode` module for how a byte-cursor-driven
//! decode loop is organized in this codebase's idiom.

pub mod operand;
pub mod state;

use crate::config::Config;
use crate::error::DecodeError;
use crate::opcode::{
    group, map_byte_register, tables, GprId, InstFlags, InstInfo, InstKind, INVALID_INST_INFO,
};
use operand::{
    decode_modrm, decode_sib, displacement_size_16, displacement_size_32_64, reg_field_register,
    resolve_memory_operand, resolve_operand_size, sign_extend_displacement, ModRm, OperandSize, Sib,
};
use state::DecodeState;

/// Architectural maximum encoded instruction length (spec §4.1).
pub const MAX_INST_SIZE: usize = 15;

/// Process-wide count of rejected EVEX prefixes (spec §8 scenario 4:
/// "EVEX telemetry counter incremented"). EVEX is recognized but never
/// supported (spec §4.1), so this is the only telemetry the decoder emits
/// for it rather than a richer per-opcode breakdown.
static EVEX_REJECTIONS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Current value of the EVEX-rejection counter.
pub fn evex_rejections() -> u64 {
    EVEX_REJECTIONS.load(std::sync::atomic::Ordering::Relaxed)
}

/// A single decoded operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedOperand {
    None,
    Gpr(GprId),
    Mem {
        base: Option<GprId>,
        index: Option<(GprId, u8)>,
        disp: i32,
    },
    RipRelative(i32),
    Imm(i64),
}

/// Legacy-prefix bits accumulated while in [`DecodeState::Prefix`].
#[derive(Debug, Clone, Copy, Default)]
struct Prefixes {
    rep: bool,
    repne: bool,
    osize_override: bool,
    asize_override: bool,
    lock: bool,
    rex: Option<u8>,
    /// `VEX.L`, once a VEX prefix has been decoded (spec §4.1 operand-size
    /// priority order: VEX.L outranks REX.W/`0x66`/default).
    vex_l: Option<bool>,
}

impl Prefixes {
    fn rex_w(&self) -> bool {
        self.rex.map_or(false, |r| r & 0b1000 != 0)
    }
    fn rex_r(&self) -> bool {
        self.rex.map_or(false, |r| r & 0b0100 != 0)
    }
    fn rex_x(&self) -> bool {
        self.rex.map_or(false, |r| r & 0b0010 != 0)
    }
    fn rex_b(&self) -> bool {
        self.rex.map_or(false, |r| r & 0b0001 != 0)
    }
    fn has_rex(&self) -> bool {
        self.rex.is_some()
    }
}

/// A fully decoded x86 instruction (spec §3 `InstInfo`/decoded-instruction
/// record).
#[derive(Debug, Clone)]
pub struct DecodedInst {
    /// Guest instruction pointer this instruction starts at.
    pub pc: u64,
    /// Total encoded length in bytes, `1..=MAX_INST_SIZE`.
    pub size: u8,
    /// The opcode-table entry this instruction resolved to.
    pub info: InstInfo,
    /// Up to two destination operands (`num_dests` of them are meaningful).
    pub dests: [DecodedOperand; 2],
    pub num_dests: u8,
    /// Up to three source operands (`num_srcs` of them are meaningful).
    pub srcs: [DecodedOperand; 3],
    pub num_srcs: u8,
    /// Resolved operand width, after applying the VEX.L/REX.W/`0x66`/default
    /// priority order.
    pub operand_size: OperandSize,
    /// This instruction's literal immediate, sign-extended to 64 bits, if
    /// it carries one. For branch/call instructions this is the encoded
    /// `rel8`/`rel16`/`rel32` displacement, used by the multi-block
    /// frontend (spec §4.1) to compute the target RIP.
    pub imm: Option<i64>,
    /// Raw encoded bytes, `raw[..size]` valid.
    pub raw: [u8; MAX_INST_SIZE],
}

impl DecodedInst {
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw[..self.size as usize]
    }
}

/// Stateless-per-call cursor over a byte slice, used while decoding a
/// single instruction. Mirrors the original `Decoder::ReadByte`/`PeekByte`/
/// `ReadData`/`SkipBytes` primitives.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn peek_byte(&self, offset: usize) -> Result<u8, DecodeError> {
        self.bytes
            .get(self.pos + offset)
            .copied()
            .ok_or(DecodeError::Truncated { available: self.bytes.len() })
    }

    fn read_byte(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek_byte(0)?;
        self.advance(1)?;
        Ok(b)
    }

    fn read_data(&mut self, n: u8) -> Result<u64, DecodeError> {
        let mut v: u64 = 0;
        for i in 0..n {
            v |= (self.peek_byte(i as usize)? as u64) << (8 * i);
        }
        self.advance(n as usize)?;
        Ok(v)
    }

    fn advance(&mut self, n: usize) -> Result<(), DecodeError> {
        let new_pos = self.pos + n;
        if new_pos > MAX_INST_SIZE {
            return Err(DecodeError::SizeOverflow { max: MAX_INST_SIZE });
        }
        self.pos = new_pos;
        Ok(())
    }
}

/// x86 instruction decoder. Holds only the configuration needed to resolve
/// ambiguous encodings (64-bit vs 32-bit addressing/operand defaults); all
/// per-instruction state lives in the local [`Cursor`] inside
/// [`Self::decode_one`].
#[derive(Debug, Clone)]
pub struct Decoder {
    cfg: Config,
}

impl Decoder {
    pub fn new(cfg: Config) -> Self {
        Decoder { cfg }
    }

    /// Decodes exactly one instruction starting at `bytes[0]`, which is
    /// assumed to correspond to guest address `pc`. Pure: the same
    /// `(bytes, pc)` always yields the same result (spec §8).
    pub fn decode_one(&self, bytes: &[u8], pc: u64) -> Result<DecodedInst, DecodeError> {
        let mut cur = Cursor::new(bytes);
        let mut prefixes = Prefixes::default();
        let mut state = DecodeState::Prefix;
        let mut info = INVALID_INST_INFO;
        let mut modrm: Option<ModRm> = None;
        let mut sib: Option<Sib> = None;
        let mut disp: i32 = 0;
        let mut x87_opcode: Option<u8> = None;
        let mut imm: Option<i64> = None;

        loop {
            state = match state {
                DecodeState::Prefix => self.step_prefix(&mut cur, &mut prefixes)?,
                DecodeState::Escape => self.step_escape(&mut cur, &mut info, &mut x87_opcode)?,
                DecodeState::Vex => self.step_vex(&mut cur, &mut prefixes, &mut info)?,
                DecodeState::ModRm => {
                    self.step_modrm(&mut cur, &mut info, &mut modrm, &mut x87_opcode)?
                }
                DecodeState::Sib => self.step_sib(&mut cur, &modrm, &mut sib)?,
                DecodeState::Displacement => {
                    self.step_displacement(&mut cur, &modrm, &sib, &mut disp)?
                }
                DecodeState::ImmBytes => self.step_imm(&mut cur, &info, &mut imm)?,
                DecodeState::Done => break,
                DecodeState::Invalid => {
                    return Err(DecodeError::InvalidEncoding { offset: cur.pos });
                }
            };
        }

        let size = cur.pos as u8;
        let mut raw = [0u8; MAX_INST_SIZE];
        raw[..cur.pos].copy_from_slice(&bytes[..cur.pos]);

        let operand_size = resolve_operand_size(
            &info,
            prefixes.rex_w(),
            prefixes.osize_override,
            prefixes.vex_l,
            self.cfg.is_64bit_mode,
        );

        let (dests, num_dests, srcs, num_srcs) =
            self.build_operands(&info, modrm, sib, disp, &prefixes, x87_opcode);

        Ok(DecodedInst {
            pc,
            size,
            info,
            dests,
            num_dests,
            srcs,
            num_srcs,
            operand_size,
            imm,
            raw,
        })
    }

    fn step_prefix(&self, cur: &mut Cursor, prefixes: &mut Prefixes) -> Result<DecodeState, DecodeError> {
        loop {
            let b = cur.peek_byte(0)?;
            match b {
                0xF0 => {
                    prefixes.lock = true;
                    cur.advance(1)?;
                }
                0xF2 => {
                    prefixes.repne = true;
                    cur.advance(1)?;
                }
                0xF3 => {
                    prefixes.rep = true;
                    cur.advance(1)?;
                }
                0x66 => {
                    prefixes.osize_override = true;
                    cur.advance(1)?;
                }
                0x67 => {
                    prefixes.asize_override = true;
                    cur.advance(1)?;
                }
                0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 => {
                    cur.advance(1)?; // segment override, not modeled further
                }
                0x40..=0x4F if self.cfg.is_64bit_mode => {
                    prefixes.rex = Some(b);
                    cur.advance(1)?;
                    // REX is always the last prefix byte.
                    return self.after_prefixes(cur);
                }
                0x62 => {
                    // EVEX: recognized, rejected (spec §4.1).
                    EVEX_REJECTIONS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Ok(DecodeState::Invalid);
                }
                _ => return self.after_prefixes(cur),
            }
        }
    }

    fn after_prefixes(&self, cur: &Cursor) -> Result<DecodeState, DecodeError> {
        let b = cur.peek_byte(0)?;
        Ok(match b {
            0x0F => DecodeState::Escape,
            0xC4 | 0xC5 => DecodeState::Vex,
            _ => DecodeState::ModRm, // re-enters via step_modrm, which reads the primary opcode first
        })
    }

    fn step_escape(
        &self,
        cur: &mut Cursor,
        info: &mut InstInfo,
        x87_opcode: &mut Option<u8>,
    ) -> Result<DecodeState, DecodeError> {
        cur.advance(1)?; // consume 0x0F
        let b = cur.peek_byte(0)?;
        if b == 0x38 || b == 0x3A {
            // Three-byte escape maps: not modeled, spec §1 scoping.
            return Ok(DecodeState::Invalid);
        }
        cur.advance(1)?;
        *info = tables::ESCAPE_0F_TABLE[b as usize];
        let _ = x87_opcode;
        Ok(self.post_opcode_state(info))
    }

    /// Decodes a two-byte (`0xC5`) or three-byte (`0xC4`) VEX prefix (spec
    /// §4.1 `Vex` state: "decodes `map_select`, `pp`, `vvvv`, `L`, `W`;
    /// rejects maps outside `[1,3]`"). `R`/`X`/`B`/`W` are folded into a
    /// synthesized REX byte so [`Prefixes::rex_w`]/`rex_r`/`rex_x`/`rex_b`
    /// serve VEX-encoded instructions the same way they serve legacy ones;
    /// `vvvv` selects a second source register, not modeled as an operand
    /// slot here (spec §9: out-of-scope union/register-class detail).
    fn step_vex(
        &self,
        cur: &mut Cursor,
        prefixes: &mut Prefixes,
        info: &mut InstInfo,
    ) -> Result<DecodeState, DecodeError> {
        let lead = cur.read_byte()?;
        let (map_select, w, l, pp, rex) = if lead == 0xC5 {
            let b2 = cur.read_byte()?;
            let rex_r = !(b2 >> 7) & 1;
            let l = (b2 >> 2) & 1 != 0;
            let pp = b2 & 0b11;
            (1u8, false, l, pp, rex_r << 2)
        } else {
            let b2 = cur.read_byte()?;
            let rex_r = !(b2 >> 7) & 1;
            let rex_x = !(b2 >> 6) & 1;
            let rex_b = !(b2 >> 5) & 1;
            let map_select = b2 & 0b1_1111;
            let b3 = cur.read_byte()?;
            let w = (b3 >> 7) & 1 != 0;
            let l = (b3 >> 2) & 1 != 0;
            let pp = b3 & 0b11;
            (map_select, w, l, pp, (rex_r << 2) | (rex_x << 1) | rex_b)
        };

        if !(1..=3).contains(&map_select) {
            return Ok(DecodeState::Invalid);
        }

        prefixes.vex_l = Some(l);
        prefixes.rex = Some(rex | if w { 0b1000 } else { 0 });
        match pp {
            0b01 => prefixes.osize_override = true,
            0b10 => prefixes.rep = true,
            0b11 => prefixes.repne = true,
            _ => {}
        }

        if map_select != 1 {
            // VEX map 2/3 (0F38/0F3A-equivalent): not modeled, same scoping
            // as the legacy three-byte escapes in `step_escape`.
            return Ok(DecodeState::Invalid);
        }

        let op = cur.read_byte()?;
        *info = tables::ESCAPE_0F_TABLE[op as usize];
        Ok(self.post_opcode_state(info))
    }

    fn step_modrm(
        &self,
        cur: &mut Cursor,
        info: &mut InstInfo,
        modrm: &mut Option<ModRm>,
        x87_opcode: &mut Option<u8>,
    ) -> Result<DecodeState, DecodeError> {
        // On first entry (no opcode resolved yet and no ModRM read yet),
        // consume the primary opcode byte.
        if matches!(info.kind, InstKind::Invalid) && modrm.is_none() && x87_opcode.is_none() {
            let op = cur.read_byte()?;
            if (0xD8..=0xDF).contains(&op) {
                *x87_opcode = Some(op);
                *info = tables::PRIMARY_TABLE[op as usize];
            } else {
                *info = tables::PRIMARY_TABLE[op as usize];
            }
            if !info.flags.contains(InstFlags::HAS_MODRM) && x87_opcode.is_none() {
                return Ok(self.post_opcode_state(info));
            }
        }

        let byte = cur.read_byte()?;
        let m = decode_modrm(byte);

        if let Some(op) = *x87_opcode {
            *info = group::lookup_x87(op, byte);
        } else if let InstKind::Group(gid) = info.kind {
            // The primary table entry pins the immediate-byte count for
            // opcodes that share a group across several encodings (e.g.
            // 0x80/0x81/0x83 all select Group1 but disagree on Ib vs Iz);
            // the secondary table only knows the operation, so carry the
            // primary entry's imm_bytes forward when it specified one.
            let imm_override = info.imm_bytes;
            *info = group::lookup(gid, m.reg);
            if let (Some(n), true) = (imm_override, info.flags.contains(InstFlags::HAS_IMMEDIATE)) {
                info.imm_bytes = Some(n);
            }
        }

        *modrm = Some(m);

        if m.m0d != 0b11 && m.rm == 0b100 {
            Ok(DecodeState::Sib)
        } else {
            Ok(DecodeState::Displacement)
        }
    }

    fn post_opcode_state(&self, info: &InstInfo) -> DecodeState {
        if matches!(info.kind, InstKind::Invalid) {
            DecodeState::Invalid
        } else if info.flags.contains(InstFlags::HAS_MODRM) || matches!(info.kind, InstKind::X87) {
            DecodeState::ModRm
        } else if info.flags.contains(InstFlags::HAS_IMMEDIATE) {
            DecodeState::ImmBytes
        } else {
            DecodeState::Done
        }
    }

    fn step_sib(
        &self,
        cur: &mut Cursor,
        modrm: &Option<ModRm>,
        sib: &mut Option<Sib>,
    ) -> Result<DecodeState, DecodeError> {
        let byte = cur.read_byte()?;
        *sib = Some(decode_sib(byte));
        let _ = modrm;
        Ok(DecodeState::Displacement)
    }

    fn step_displacement(
        &self,
        cur: &mut Cursor,
        modrm: &Option<ModRm>,
        sib: &Option<Sib>,
        disp: &mut i32,
    ) -> Result<DecodeState, DecodeError> {
        let m = modrm.expect("ModRM must be decoded before Displacement");
        let size = if self.cfg.is_64bit_mode {
            displacement_size_32_64(m, *sib)
        } else {
            displacement_size_16(m)
        };
        let raw = cur.read_data(size)?;
        *disp = sign_extend_displacement(raw, size);
        Ok(DecodeState::ImmBytes)
    }

    fn step_imm(
        &self,
        cur: &mut Cursor,
        info: &InstInfo,
        imm: &mut Option<i64>,
    ) -> Result<DecodeState, DecodeError> {
        if info.flags.contains(InstFlags::HAS_IMMEDIATE) {
            let n = info.imm_bytes.unwrap_or(4);
            let raw = cur.read_data(n)?;
            *imm = Some(sign_extend_immediate(raw, n));
        } else if let Some(n) = info.imm_bytes {
            if n > 0 {
                let raw = cur.read_data(n)?;
                *imm = Some(sign_extend_immediate(raw, n));
            }
        }
        Ok(DecodeState::Done)
    }

    fn build_operands(
        &self,
        info: &InstInfo,
        modrm: Option<ModRm>,
        sib: Option<Sib>,
        disp: i32,
        prefixes: &Prefixes,
        x87_opcode: Option<u8>,
    ) -> ([DecodedOperand; 2], u8, [DecodedOperand; 3], u8) {
        let mut dests = [DecodedOperand::None, DecodedOperand::None];
        let mut srcs = [DecodedOperand::None, DecodedOperand::None, DecodedOperand::None];
        let mut num_dests = 0u8;
        let mut num_srcs = 0u8;

        if let Some(m) = modrm {
            let is_byte = matches!(info.size_hint, crate::opcode::SizeHint::Fixed8);
            let reg_operand =
                DecodedOperand::Gpr(reg_field_register(m, prefixes.rex_r(), prefixes.has_rex(), is_byte));

            let rm_operand = if m.m0d == 0b11 {
                if x87_opcode.is_some() {
                    DecodedOperand::Gpr(group::st_register(byte_from_modrm(m)))
                } else {
                    DecodedOperand::Gpr(if is_byte {
                        map_byte_register(prefixes.rex_b(), m.rm, prefixes.has_rex())
                    } else {
                        crate::opcode::map_register(prefixes.rex_b(), m.rm)
                    })
                }
            } else {
                let mem = resolve_memory_operand(
                    m,
                    sib,
                    disp,
                    prefixes.rex_b(),
                    prefixes.rex_x(),
                    self.cfg.is_64bit_mode,
                );
                if mem.rip_relative {
                    DecodedOperand::RipRelative(mem.disp)
                } else {
                    DecodedOperand::Mem { base: mem.base, index: mem.index, disp: mem.disp }
                }
            };

            dests[0] = reg_operand;
            num_dests = 1;
            srcs[0] = rm_operand;
            num_srcs = 1;
        }

        (dests, num_dests, srcs, num_srcs)
    }
}

/// Sign-extends a little-endian literal immediate of `n` bytes (1, 2, 4, or
/// 8) to `i64`. Branch/call `rel8`/`rel16`/`rel32` immediates are signed
/// displacements; `mov reg, imm64` is the only 8-byte case and needs no
/// extension beyond its own width.
fn sign_extend_immediate(raw: u64, n: u8) -> i64 {
    match n {
        1 => raw as u8 as i8 as i64,
        2 => raw as u16 as i16 as i64,
        4 => raw as u32 as i32 as i64,
        8 => raw as i64,
        _ => raw as i64,
    }
}

fn byte_from_modrm(m: ModRm) -> u8 {
    (m.m0d << 6) | (m.reg << 3) | m.rm
}

/// Streaming decoder bound to a contiguous instruction stream, implementing
/// [`crate::emitter::OperandSource`] for the external IR emitter (spec §6).
/// Advances its own cursor as instructions/bytes are consumed; unlike
/// [`Decoder::decode_one`] this is explicitly stateful across calls.
pub struct StreamDecoder<'a> {
    decoder: Decoder,
    stream: &'a [u8],
    base_pc: u64,
    cursor: usize,
}

impl<'a> StreamDecoder<'a> {
    pub fn new(cfg: Config, stream: &'a [u8], base_pc: u64) -> Self {
        StreamDecoder { decoder: Decoder::new(cfg), stream, base_pc, cursor: 0 }
    }

    pub fn current_pc(&self) -> u64 {
        self.base_pc + self.cursor as u64
    }
}

impl<'a> crate::emitter::OperandSource for StreamDecoder<'a> {
    fn decode_instruction(&mut self) -> Result<DecodedInst, DecodeError> {
        let pc = self.current_pc();
        let inst = self.decoder.decode_one(&self.stream[self.cursor..], pc)?;
        self.cursor += inst.size as usize;
        Ok(inst)
    }

    fn peek_byte(&self, offset: usize) -> u8 {
        self.stream.get(self.cursor + offset).copied().unwrap_or(0)
    }

    fn read_byte(&mut self) -> u8 {
        let b = self.peek_byte(0);
        self.cursor += 1;
        b
    }

    fn skip_bytes(&mut self, n: usize) {
        self.cursor += n;
    }

    fn read_data(&mut self, n: u8) -> u64 {
        let mut v = 0u64;
        for i in 0..n {
            v |= (self.peek_byte(i as usize) as u64) << (8 * i);
        }
        self.cursor += n as usize;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn decoder() -> Decoder {
        Decoder::new(Config::default())
    }

    #[test]
    fn decodes_mov_rm_to_reg() {
        // mov eax, [rbx]  ->  8b 03
        let bytes = [0x8B, 0x03];
        let inst = decoder().decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(inst.size, 2);
        assert_eq!(inst.info.mnemonic, "mov");
    }

    #[test]
    fn decodes_call_rel32() {
        let bytes = [0xE8, 0x00, 0x01, 0x00, 0x00];
        let inst = decoder().decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(inst.size, 5);
        assert!(inst.info.flags.contains(InstFlags::CALL));
    }

    #[test]
    fn decodes_group1_through_secondary_table() {
        // add byte [rax], 0x05  -> 80 00 05
        let bytes = [0x80, 0x00, 0x05];
        let inst = decoder().decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(inst.size, 3);
        assert_eq!(inst.info.mnemonic, "add");
    }

    #[test]
    fn rejects_evex_prefix() {
        let before = evex_rejections();
        let bytes = [0x62, 0xF1, 0x7C, 0x08, 0x10, 0xC0];
        let err = decoder().decode_one(&bytes, 0x1000).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidEncoding { .. }));
        assert_eq!(evex_rejections(), before + 1);
    }

    #[test]
    fn decodes_two_byte_vex_movups() {
        // vmovups xmm0, xmm0 -> C5 F8 10 C0 (VEX.128.0F.WIG, pp=00, L=0)
        let bytes = [0xC5, 0xF8, 0x10, 0xC0];
        let inst = decoder().decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(inst.size, 4);
        assert_eq!(inst.info.mnemonic, "movups");
        // XMM_FLAGS always resolves to a 64-bit-wide default, independent of VEX.L.
        assert_eq!(inst.operand_size, OperandSize::Size64);
    }

    #[test]
    fn decodes_three_byte_vex_with_rex_b_and_w() {
        // vmovups xmm8, xmm0 with VEX.W/B set via the 3-byte form:
        // C4 41 78 10 C0 (map_select=1, R=1(inverted 0)->rex.r set here instead)
        let bytes = [0xC4, 0x41, 0x78, 0x10, 0xC0];
        let inst = decoder().decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(inst.size, 5);
        assert_eq!(inst.info.mnemonic, "movups");
    }

    #[test]
    fn rejects_vex_map_outside_one_to_three() {
        // C4 with map_select = 0 (reserved) in the lower 5 bits of byte 2.
        let bytes = [0xC4, 0xE0, 0x78, 0x10, 0xC0];
        let err = decoder().decode_one(&bytes, 0x1000).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidEncoding { .. }));
    }

    #[test]
    fn truncated_stream_is_reported() {
        let bytes = [0x8B];
        let err = decoder().decode_one(&bytes, 0x1000).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn rip_relative_disp32_memory_operand() {
        // mov eax, [rip+0x10]  -> 8b 05 10 00 00 00
        let bytes = [0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        let inst = decoder().decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(inst.size, 6);
        assert!(matches!(inst.srcs[0], DecodedOperand::RipRelative(0x10)));
    }

    #[test]
    fn rex_widens_to_64_bit_operand_size() {
        // REX.W + mov rax, [rbx]  -> 48 8b 03
        let bytes = [0x48, 0x8B, 0x03];
        let inst = decoder().decode_one(&bytes, 0x1000).unwrap();
        assert_eq!(inst.operand_size, OperandSize::Size64);
    }

    #[test]
    fn streaming_decoder_advances_cursor_across_calls() {
        use crate::emitter::OperandSource;
        let bytes = [0x90, 0x90, 0xC3];
        let mut sd = StreamDecoder::new(Config::default(), &bytes, 0x2000);
        let first = sd.decode_instruction().unwrap();
        assert_eq!(first.pc, 0x2000);
        let second = sd.decode_instruction().unwrap();
        assert_eq!(second.pc, 0x2001);
        let third = sd.decode_instruction().unwrap();
        assert_eq!(third.pc, 0x2002);
        assert!(third.info.flags.contains(InstFlags::BRANCH_INDIRECT));
    }
}
