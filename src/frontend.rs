//! Multi-block Frontend (MB) — spec §2 item 3, §4.1 "Multi-block discovery".
//!
//! Drives [`crate::decode::Decoder`] over a guest byte stream starting at an
//! entry address, discovering branch targets reachable without crossing a
//! page boundary and bounding the translation unit by instruction count.
//! Produces a [`BlockInfo`]: an ordered set of [`DecodedBlocks`] sharing one
//! arena of [`DecodedInst`]s.
//!
//! Grounded in the original `Frontend::DecodeInstructionsAtEntry` (BFS over
//! a worklist of candidate block entries, `SymbolMinAddress`/`SymbolMaxAddress`
//! bounding, early-termination on a double-zero heuristic) and in spec §9's
//! design note to replace the original's pointer/union `DecodedBlocks` with
//! arena indices rather than raw pointers into a shared pool.

use std::collections::HashSet;

use crate::config::Config;
use crate::decode::{Decoder, DecodedInst};
use crate::opcode::InstFlags;

/// One contiguously-decoded block inside a [`BlockInfo`].
///
/// `insts` indexes a half-open range `[start, start + count)` into the
/// owning `BlockInfo`'s shared instruction pool — spec §9's "arena+index
/// handles" in place of the original's raw pointer into a shared pool.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlocks {
    /// Guest instruction pointer this block starts at.
    pub entry: u64,
    /// Offset of this block's first instruction within the owning
    /// `BlockInfo`'s pool.
    pub start: usize,
    /// Number of instructions in this block.
    pub num_instructions: usize,
    /// Set when decoding failed inside this block (spec §3 `DecodedBlocks`
    /// invariant: `if TableInfo==null then HasInvalidInstruction must be
    /// set on the enclosing block`).
    pub has_invalid_instruction: bool,
}

impl DecodedBlocks {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.num_instructions
    }
}

/// The result of one [`MultiBlockFrontend::decode_at_entry`] call: every
/// block discovered within this translation unit, plus the shared
/// instruction pool they index into.
///
/// Valid until the next call on the same [`MultiBlockFrontend`] instance
/// (spec §4.1 contract); the next call clears and reuses the pool rather
/// than allocating fresh storage every time.
#[derive(Debug, Default)]
pub struct BlockInfo {
    /// Blocks sorted by entry address (spec §3 invariant), each unique.
    pub blocks: Vec<DecodedBlocks>,
    /// Shared pool backing every block's instruction range.
    pub pool: Vec<DecodedInst>,
    /// Guest addresses reached via a branch this translation unit declined
    /// to inline (cross-page, external call, or budget exhausted) — handed
    /// back to the emitter/TCC so it can arrange its own translations.
    pub external_branches: Vec<u64>,
}

impl BlockInfo {
    /// Spec §8: `B.TotalInstructionCount == sum of block instruction counts`.
    pub fn total_instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.num_instructions).sum()
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.pool.clear();
        self.external_branches.clear();
    }
}

const PAGE_SIZE: u64 = 0x1000;

fn align_up(addr: u64, align: u64) -> u64 {
    (addr + align - 1) & !(align - 1)
}

fn page_base(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Callback invoked once per page touched while decoding, so the
/// translation cache coordinator can arrange SMC tracking (spec §4.1
/// `notify_page_fn(entry, page_base, page_size)`).
pub trait PageObserver {
    fn notify_page(&mut self, entry: u64, page_base: u64, page_size: u64);
}

impl<F: FnMut(u64, u64, u64)> PageObserver for F {
    fn notify_page(&mut self, entry: u64, page_base: u64, page_size: u64) {
        self(entry, page_base, page_size)
    }
}

/// Bounds on the address range the frontend is allowed to walk into while
/// discovering multi-block targets (spec §4.1: `SymbolMinAddress`/
/// `SymbolMaxAddress`).
#[derive(Debug, Clone, Copy)]
pub struct SymbolRange {
    pub min: u64,
    pub max: u64,
}

/// Drives [`Decoder`] across one translation unit, discovering reachable
/// basic blocks bounded by page crossings, the symbol range, and the
/// configured instruction budget.
pub struct MultiBlockFrontend {
    decoder: Decoder,
    cfg: Config,
}

impl MultiBlockFrontend {
    pub fn new(cfg: Config) -> Self {
        MultiBlockFrontend { decoder: Decoder::new(cfg.clone()), cfg }
    }

    /// Spec §4.1 `decode_at_entry(instr_stream, pc, max_inst, notify_page_fn)`.
    ///
    /// `instr_stream` is a host-visible view of guest bytes whose index `0`
    /// corresponds to guest address `pc`; `fetch` must return the bytes
    /// visible at any guest address reachable from `pc` within this
    /// translation unit (entry page plus, when multi-block is enabled, any
    /// page a discovered branch target falls on).
    pub fn decode_at_entry(
        &self,
        out: &mut BlockInfo,
        fetch: impl Fn(u64) -> Option<&'static [u8]>,
        pc: u64,
        max_inst: u32,
        symbol_range: SymbolRange,
        mut notify_page: impl PageObserver,
    ) {
        out.clear();

        let budget = if max_inst == 0 { self.cfg.effective_max_inst_per_block() } else { max_inst } as usize;

        // Worklist of block entries still to decode; `entry_block` marks the
        // one whose decode errors must not be rolled back (spec §4.1 "Early
        // termination": "non-entry blocks are then rolled back so that only
        // the entry block exposes the error").
        let mut worklist: Vec<u64> = vec![pc];
        let mut queued: HashSet<u64> = HashSet::from([pc]);
        let mut seen_pages: HashSet<u64> = HashSet::new();
        let mut total_instructions = 0usize;

        while let Some(entry) = worklist.pop() {
            if total_instructions >= budget {
                if entry != pc {
                    out.external_branches.push(entry);
                }
                continue;
            }

            let is_entry_block = entry == pc;
            let result = self.decode_one_block(
                out,
                &fetch,
                entry,
                budget - total_instructions,
                is_entry_block,
                &mut seen_pages,
                &mut notify_page,
            );

            let Some((block, new_targets)) = result else {
                // Non-entry block failed to decode at all (e.g. unmapped
                // page): silently dropped, it simply never appears.
                continue;
            };

            if block.has_invalid_instruction && !is_entry_block {
                // Spec §4.1: non-entry blocks with a decode failure are
                // rolled back entirely so only the entry block exposes it.
                out.pool.truncate(block.start);
                continue;
            }

            total_instructions += block.num_instructions;
            out.blocks.push(block);

            for (target, force_external, branch_end) in new_targets {
                if force_external || !self.classify_branch_target(target, branch_end, symbol_range) {
                    out.external_branches.push(target);
                    continue;
                }
                if queued.insert(target) {
                    worklist.push(target);
                }
            }

            if !self.cfg.multiblock {
                break;
            }
        }

        out.blocks.sort_by_key(|b| b.entry);
        out.blocks.dedup_by_key(|b| b.entry);
    }

    /// Decodes instructions starting at `entry` until a block-ending
    /// instruction, the early-termination heuristic, or the remaining
    /// budget is hit. Returns the block plus any branch targets it raised,
    /// or `None` if the very first instruction couldn't be fetched at all.
    fn decode_one_block(
        &self,
        out: &mut BlockInfo,
        fetch: &impl Fn(u64) -> Option<&'static [u8]>,
        entry: u64,
        remaining_budget: usize,
        is_entry_block: bool,
        seen_pages: &mut HashSet<u64>,
        notify_page: &mut impl PageObserver,
    ) -> Option<(DecodedBlocks, Vec<(u64, bool, u64)>)> {
        let start = fetch(entry)?;
        let mut cur_pc = entry;
        let mut cur_bytes = start;
        let mut count = 0usize;
        let mut has_invalid = false;
        let mut targets: Vec<(u64, bool, u64)> = Vec::new();
        let pool_start = out.pool.len();

        loop {
            if count >= remaining_budget {
                break;
            }

            let this_page = page_base(cur_pc);
            if seen_pages.insert(this_page) {
                notify_page.notify_page(entry, this_page, PAGE_SIZE);
            }

            // Early termination heuristic (spec §4.1, original
            // `Frontend.cpp` `PeekByte(0)==0 && PeekByte(1)==0`): two
            // consecutive zero bytes on the same page, checked before
            // decoding, for every block but the entry block.
            if !is_entry_block && cur_bytes.len() >= 2 && cur_bytes[0] == 0 && cur_bytes[1] == 0 {
                break;
            }

            match self.decoder.decode_one(cur_bytes, cur_pc) {
                Ok(inst) => {
                    let size = inst.size as u64;
                    let is_branch = inst.info.flags.contains(InstFlags::BRANCH)
                        || inst.info.flags.contains(InstFlags::BRANCH_DIRECT)
                        || inst.info.flags.contains(InstFlags::BRANCH_COND)
                        || inst.info.flags.contains(InstFlags::BRANCH_INDIRECT)
                        || inst.info.flags.contains(InstFlags::CALL);
                    let cond = inst.info.flags.contains(InstFlags::BRANCH_COND);
                    let is_call = inst.info.flags.contains(InstFlags::CALL);
                    let direct_target = direct_branch_target(&inst);

                    count += 1;
                    out.pool.push(inst);
                    cur_pc += size;

                    if is_branch {
                        if let Some(target) = direct_target {
                            // Calls are external unless the immediate is
                            // exactly "jump past self" (spec §4.1: a
                            // GOT-relative idiom the emitter can collapse).
                            let inline_call = is_call && target == cur_pc;
                            targets.push((target, is_call && !inline_call, cur_pc));
                        }
                        if cond {
                            // Conditional branches also add the fall-through
                            // as a separate block target; a Jcc is still a
                            // block-ending instruction (original
                            // `Frontend.cpp`: `CanContinue=false`), so this
                            // block stops here rather than decoding the
                            // fall-through inline.
                            targets.push((cur_pc, false, cur_pc));
                        }
                        break;
                    }

                    cur_bytes = match fetch(cur_pc) {
                        Some(b) => b,
                        None => break,
                    };
                }
                Err(_) => {
                    // Spec §8 scenario 4: the failed decode itself is not
                    // counted towards `num_instructions`.
                    has_invalid = true;
                    break;
                }
            }
        }

        Some((
            DecodedBlocks {
                entry,
                start: pool_start,
                num_instructions: count,
                has_invalid_instruction: has_invalid,
            },
            targets,
        ))
    }

    /// Spec §4.1 "Multi-block discovery" predicate: is `target` reachable
    /// without crossing a page boundary from the current instruction, and
    /// within the symbol range?
    fn classify_branch_target(&self, target: u64, current_end: u64, range: SymbolRange) -> bool {
        if !self.cfg.multiblock {
            return false;
        }
        let page_limit = align_up(current_end, PAGE_SIZE).min(range.max);
        target >= range.min && target < page_limit
    }
}

/// Extracts the immediate target of a direct branch/call, if this
/// instruction encodes one (spec §4.1: conditional/unconditional branches
/// with an immediate target).
fn direct_branch_target(inst: &DecodedInst) -> Option<u64> {
    if inst.info.flags.contains(InstFlags::BRANCH_INDIRECT) {
        return None;
    }
    inst.imm
        .map(|rel| (inst.pc as i64 + inst.size as i64 + rel) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_range() -> SymbolRange {
        SymbolRange { min: 0, max: u64::MAX }
    }

    fn fetch_over(base: u64, bytes: &'static [u8]) -> impl Fn(u64) -> Option<&'static [u8]> {
        move |addr: u64| {
            if addr < base {
                return None;
            }
            let off = (addr - base) as usize;
            if off >= bytes.len() {
                None
            } else {
                Some(&bytes[off..])
            }
        }
    }

    #[test]
    fn align_up_rounds_to_page() {
        assert_eq!(align_up(0x400ffd, PAGE_SIZE), 0x401000);
        assert_eq!(align_up(0x401000, PAGE_SIZE), 0x401000);
    }

    #[test]
    fn page_base_masks_low_bits() {
        assert_eq!(page_base(0x401abc), 0x401000);
    }

    // Spec §8 scenario 1: `mov rbp, rsp; ret` at 0x400000, multi-block off.
    #[test]
    fn single_block_decode() {
        let cfg = Config { multiblock: false, ..Config::default() };
        let mb = MultiBlockFrontend::new(cfg);
        static BYTES: [u8; 4] = [0x48, 0x89, 0xE5, 0xC3];
        let mut info = BlockInfo::default();
        let mut pages = Vec::new();
        mb.decode_at_entry(
            &mut info,
            fetch_over(0x400000, &BYTES),
            0x400000,
            0,
            full_range(),
            |entry: u64, base: u64, size: u64| pages.push((entry, base, size)),
        );

        assert_eq!(info.blocks.len(), 1);
        assert_eq!(info.blocks[0].entry, 0x400000);
        assert_eq!(info.blocks[0].num_instructions, 2);
        assert!(!info.blocks[0].has_invalid_instruction);
        assert_eq!(pages, vec![(0x400000, 0x400000, PAGE_SIZE)]);
    }

    // Spec §8 scenario 2: `test eax,eax; jz +3; nop; nop; nop; ret`,
    // multi-block on. The `jz` is a block-ending instruction: the entry
    // block must stop at exactly `{test, jz}` (2 instructions) rather than
    // decoding the fall-through inline, while the fall-through (`0x401004`)
    // and the branch target (`0x401007`, which lands on the `ret`) are each
    // queued as their own block. Total instructions across all three
    // blocks is `7` — matching spec §8 scenario 2's literal total — which
    // only holds if the entry block does not overrun past the `jz`.
    #[test]
    fn conditional_multi_block() {
        let cfg = Config { multiblock: true, ..Config::default() };
        let mb = MultiBlockFrontend::new(cfg);
        #[rustfmt::skip]
        static BYTES: [u8; 8] = [
            0x85, 0xC0, // test eax, eax (2 bytes) @ 0x401000
            0x74, 0x03, // jz +3          (2 bytes) @ 0x401002, target 0x401007
            0x90,       // nop                      @ 0x401004
            0x90,       // nop                      @ 0x401005
            0x90,       // nop                      @ 0x401006
            0xC3,       // ret                      @ 0x401007
        ];
        let mut info = BlockInfo::default();
        mb.decode_at_entry(
            &mut info,
            fetch_over(0x401000, &BYTES),
            0x401000,
            0,
            full_range(),
            |_, _, _| {},
        );

        assert_eq!(info.total_instruction_count(), 7);
        assert_eq!(
            info.total_instruction_count(),
            info.blocks.iter().map(|b| b.num_instructions).sum::<usize>()
        );

        let by_entry: HashMap<u64, usize> =
            info.blocks.iter().map(|b| (b.entry, b.num_instructions)).collect();
        assert_eq!(by_entry.len(), 3, "expected exactly three distinct blocks, got {by_entry:?}");
        assert_eq!(by_entry.get(&0x401000), Some(&2)); // test, jz — must not run past the jz
        assert_eq!(by_entry.get(&0x401004), Some(&4)); // fall-through: nop, nop, nop, ret
        assert_eq!(by_entry.get(&0x401007), Some(&1)); // branch target: ret

        assert_eq!(info.blocks, {
            let mut sorted = info.blocks.clone();
            sorted.sort_by_key(|b| b.entry);
            sorted
        });
    }

    // Spec §8 scenario 3: unconditional JMP to a different page is external.
    #[test]
    fn cross_page_branch_is_external() {
        let cfg = Config { multiblock: true, ..Config::default() };
        let mb = MultiBlockFrontend::new(cfg);
        // jmp rel32 to one page forward: E9 + disp32
        static BYTES: [u8; 5] = [0xE9, 0x00, 0x10, 0x00, 0x00];
        let mut info = BlockInfo::default();
        mb.decode_at_entry(
            &mut info,
            fetch_over(0x400ff0, &BYTES),
            0x400ff0,
            0,
            full_range(),
            |_, _, _| {},
        );

        assert_eq!(info.blocks.len(), 1);
        assert_eq!(info.external_branches.len(), 1);
    }

    // Spec §8 scenario 4: EVEX prefix is rejected and flags the entry block.
    #[test]
    fn evex_prefix_marks_invalid_instruction() {
        let cfg = Config::default();
        let mb = MultiBlockFrontend::new(cfg);
        static BYTES: [u8; 6] = [0x62, 0xF1, 0x7C, 0x08, 0x10, 0xC0];
        let mut info = BlockInfo::default();
        mb.decode_at_entry(
            &mut info,
            fetch_over(0x402000, &BYTES),
            0x402000,
            0,
            full_range(),
            |_, _, _| {},
        );

        assert_eq!(info.blocks.len(), 1);
        assert!(info.blocks[0].has_invalid_instruction);
        assert_eq!(info.blocks[0].num_instructions, 0);
    }
}
