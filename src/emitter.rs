//! Glue into the external IR emitter (spec §2 item 6, §6).
//!
//! The host code generator is explicitly out of scope (spec §1): "only its
//! contract as a consumer of decoded IR matters here." This module defines
//! that contract — the capability set the emitter is polymorphic over, and
//! the block-level handoff from the multi-block frontend — without
//! implementing an emitter itself.
//!
//! Grounded in the teacher's `block::emitter` module, which plays the same
//! role (consumes `BasicBlock`/`Instruction` data to produce host machine
//! code) but is concrete rather than a trait, because the teacher's host
//! emitter (x86-64 via `dynasmrt`) *was* in scope there. Here it is not:
//! AArch64 code generation is named as an external collaborator, so this
//! module stops at the interface.

use crate::decode::DecodedInst;
use crate::error::DecodeError;
use crate::frontend::DecodedBlocks;

/// The capability set an IR emitter needs while walking a decoded
/// instruction stream (spec §6: "polymorphic over
/// `{decode_instruction, peek_byte, read_byte, skip_bytes, read_data(n)}`").
///
/// Implemented by [`crate::decode::Decoder`] for emitters that want to
/// re-read raw bytes alongside the already-decoded operand form (e.g. to
/// recover an immediate's original encoding width for a relocation).
pub trait OperandSource {
    /// Decode the next instruction from the current position.
    fn decode_instruction(&mut self) -> Result<DecodedInst, DecodeError>;
    /// Look at the byte `offset` positions past the current cursor without
    /// consuming it.
    fn peek_byte(&self, offset: usize) -> u8;
    /// Consume and return the next byte.
    fn read_byte(&mut self) -> u8;
    /// Advance the cursor by `n` bytes without interpreting them.
    fn skip_bytes(&mut self, n: usize);
    /// Read `n` (1..=8) bytes as a little-endian integer and advance the
    /// cursor past them.
    fn read_data(&mut self, n: u8) -> u64;
}

/// Receives completed [`DecodedBlocks`] from the multi-block frontend.
///
/// This is the producer side of the "Glue into IR emitter" interface (spec
/// §2 item 6): the frontend calls [`Self::consume_block`] once per
/// discovered block, handing over a borrow of that block's slice into the
/// decoder's instruction pool. The emitter is expected to translate each
/// instruction using [`crate::opcode::InstInfo::dispatch`] and register the
/// resulting host code with the translation cache coordinator itself —
/// both of which happen entirely on the emitter's side of this boundary.
pub trait HostCodeConsumer {
    /// Called once per block in entry-address order after `decode_at_entry`
    /// completes (spec §2 control flow: "MB runs DEC to produce a BlockInfo
    /// -> emitter consumes it").
    fn consume_block(&mut self, block: &DecodedBlocks, insts: &[DecodedInst]);
}

impl<T: HostCodeConsumer + ?Sized> HostCodeConsumer for &mut T {
    fn consume_block(&mut self, block: &DecodedBlocks, insts: &[DecodedInst]) {
        (**self).consume_block(block, insts)
    }
}

/// Default dispatch target for every opcode-table entry that has no
/// dedicated emitter handler wired up. Mirrors the teacher's
/// `arm_unimpl_instr`/`thumb_unimpl_instr` — since the real work here
/// belongs to the (out of scope) emitter, this crate cannot do anything
/// more useful than record that the slot was reached.
pub fn unimplemented(_src: &mut dyn OperandSource, inst: &DecodedInst) {
    tracing::warn!(
        rip = inst.pc,
        mnemonic = inst.info.mnemonic,
        "reached emitter dispatch slot with no handler wired up"
    );
}
