//! Backwards taint propagation over a recorded instruction trace.
//!
//! Grounded on `se_main.c`'s `fix_address_space()`: given the address that just faulted and
//! the instructions executed leading up to the fault, walk backwards to find every register
//! that, at some point, held a copy of the bad address. Those registers are reported to the
//! driver (as `guest_state_offset`s) so it can decide how to reallocate the object the pointer
//! was meant to reference.
//!
//! The original walks VEX IR statements within one basic block at a time and restarts the
//! walk of the *current* block whenever an already-tracked value gets re-tainted from a new
//! source partway through (a temp that looked resolved turns out to flow from something else).
//! There is no VEX IR here, only a flat `Vec<Step>` of single-stepped instructions, so block
//! boundaries are inferred from control-flow discontinuities in `rip`, and the restart is an
//! explicit loop-index reset rather than recursion, matching the original's
//! `stmt_idx = orig_stmt_idx` reset.

use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use iced_x86::{Decoder, DecoderOptions, Instruction, InstructionInfoFactory, InstructionInfoOptions, OpKind, Register};

use crate::executor::trace::{MemoryOp, Step};
use crate::iovec::GprSlot;

/// A value the backward walk is currently tracking as "derived from the bad address".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    Memory(u64),
    Register(Register),
}

/// The outcome of a completed walk: the address that faulted, and every register
/// `guest_state_offset` implicated as a carrier of that address along the way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaintResult {
    pub tainted_address: u64,
    pub locations: Vec<i64>,
}

/// `SE_(send_new_alloc)`'s wire payload: `[tainted_address: u64][count: u64][location: i64]*`.
pub fn encode_new_alloc(result: &TaintResult) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16 + result.locations.len() * 8);
    bytes.extend_from_slice(&result.tainted_address.to_ne_bytes());
    bytes.extend_from_slice(&(result.locations.len() as u64).to_ne_bytes());
    for loc in &result.locations {
        bytes.extend_from_slice(&loc.to_ne_bytes());
    }
    bytes
}

fn gpr_slot_for_register(reg: Register) -> Option<GprSlot> {
    use Register::*;
    Some(match reg {
        AL | AH | AX | EAX | RAX => GprSlot::Rax,
        BL | BH | BX | EBX | RBX => GprSlot::Rbx,
        CL | CH | CX | ECX | RCX => GprSlot::Rcx,
        DL | DH | DX | EDX | RDX => GprSlot::Rdx,
        SIL | SI | ESI | RSI => GprSlot::Rsi,
        DIL | DI | EDI | RDI => GprSlot::Rdi,
        BPL | BP | EBP | RBP => GprSlot::Rbp,
        SPL | SP | ESP | RSP => GprSlot::Rsp,
        R8L | R8W | R8D | R8 => GprSlot::R8,
        R9L | R9W | R9D | R9 => GprSlot::R9,
        R10L | R10W | R10D | R10 => GprSlot::R10,
        R11L | R11W | R11D | R11 => GprSlot::R11,
        R12L | R12W | R12D | R12 => GprSlot::R12,
        R13L | R13W | R13D | R13 => GprSlot::R13,
        R14L | R14W | R14D | R14 => GprSlot::R14,
        R15L | R15W | R15D | R15 => GprSlot::R15,
        EIP | RIP => GprSlot::Rip,
        _ => return None,
    })
}

/// Two registers "overlap" for taint purposes if they name the same architectural GPR at
/// different widths (`eax` and `rax` are the same carrier; `eax` and `ebx` are not).
fn same_gpr(a: Register, b: Register) -> bool {
    match (gpr_slot_for_register(a), gpr_slot_for_register(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn decode(step: &Step, bitness: u32) -> Instruction {
    let mut decoder = Decoder::new(bitness, &step.instr, DecoderOptions::NONE);
    decoder.set_ip(step.regs.rip);
    decoder.decode()
}

/// A step starts a new block if it doesn't fall through from the previous one, either because
/// control jumped or because this is the very first recorded step.
fn compute_block_starts(steps: &[Step]) -> Vec<usize> {
    let mut starts = vec![0];
    for i in 1..steps.len() {
        let prev = &steps[i - 1];
        let fallthrough = prev.regs.rip + prev.instr.len() as u64;
        if steps[i].regs.rip != fallthrough {
            starts.push(i);
        }
    }
    starts
}

fn block_start_at_or_before(block_starts: &[usize], idx: usize) -> usize {
    *block_starts.iter().rev().find(|&&s| s <= idx).unwrap_or(&0)
}

/// If `instr` (executed as `step`) is a memory access whose effective address is `addr`,
/// returns the base/index registers that fed that address calculation.
fn memory_access_registers(instr: &Instruction, step: &Step, addr: u64) -> Option<Vec<Register>> {
    let touches = step.hints.iter().any(|h| h.address == addr);
    if !touches {
        return None;
    }

    let mut factory = InstructionInfoFactory::new();
    let info = factory.info_options(instr, InstructionInfoOptions::NO_REGISTER_USAGE).clone();

    for used_mem in info.used_memory() {
        let effective = used_mem.try_virtual_address(0, |reg, _, _| step.regs.value(reg).ok()).unwrap_or(u64::MAX);
        if effective != addr {
            continue;
        }

        let mut regs = vec![];
        if used_mem.base() != Register::None {
            regs.push(used_mem.base());
        }
        if used_mem.index() != Register::None {
            regs.push(used_mem.index());
        }
        if !regs.is_empty() {
            return Some(regs);
        }
    }

    None
}

enum Source {
    Register(Register),
    Memory(u64),
}

/// If `instr` writes to a register overlapping `reg`, returns what that write's value came
/// from: another register, a memory load, or `None` if it came from an immediate/unknown
/// source (a dead end — `reg` is a root and gets recorded as a location).
fn register_write_source(instr: &Instruction, step: &Step, reg: Register) -> Option<Source> {
    if instr.op_count() == 0 {
        return None;
    }
    if instr.op0_kind() != OpKind::Register || !same_gpr(instr.op0_register(), reg) {
        return None;
    }

    if instr.op_count() >= 2 {
        match instr.op1_kind() {
            OpKind::Register => return Some(Source::Register(instr.op1_register())),
            OpKind::Memory => {
                let mut factory = InstructionInfoFactory::new();
                let info = factory.info_options(instr, InstructionInfoOptions::NO_REGISTER_USAGE).clone();
                for used_mem in info.used_memory() {
                    if used_mem.access() == iced_x86::OpAccess::Read || used_mem.access() == iced_x86::OpAccess::CondRead {
                        if let Some(addr) = used_mem.try_virtual_address(0, |r, _, _| step.regs.value(r).ok()) {
                            return Some(Source::Memory(addr));
                        }
                    }
                }
                None
            }
            _ => None,
        }
    } else {
        // A destination-only write (e.g. pop) with no explicit second operand: attribute it
        // to whatever memory read landed in this step, if any.
        step.hints.iter().find(|h| h.operation == MemoryOp::Read).map(|h| Source::Memory(h.address))
    }
}

/// Walks `steps` backwards from the end, starting from `faulting_address`, and returns every
/// register implicated as a past carrier of that address.
pub fn find_tainted_locations(steps: &[Step], bitness: u32, faulting_address: u64) -> Result<TaintResult> {
    if steps.is_empty() {
        return Err(anyhow!("no steps recorded before the fault"));
    }

    let block_starts = compute_block_starts(steps);
    let mut locations: BTreeSet<i64> = BTreeSet::new();
    let mut pending: Vec<Pending> = vec![Pending::Memory(faulting_address)];

    let mut cursor = steps.len();
    let mut block_top = steps.len();

    while cursor > 0 && !pending.is_empty() {
        let block_start = block_start_at_or_before(&block_starts, cursor - 1);

        let mut retainted_in_block = false;
        let mut idx = cursor;
        while idx > block_start {
            idx -= 1;
            let step = &steps[idx];
            let instr = decode(step, bitness);

            let current = std::mem::take(&mut pending);
            let mut next = Vec::with_capacity(current.len());

            for item in current {
                match item {
                    Pending::Memory(addr) => {
                        if let Some(regs) = memory_access_registers(&instr, step, addr) {
                            for r in regs {
                                next.push(Pending::Register(r));
                            }
                            retainted_in_block = true;
                        } else {
                            next.push(Pending::Memory(addr));
                        }
                    }
                    Pending::Register(reg) => match register_write_source(&instr, step, reg) {
                        Some(Source::Register(src)) => {
                            next.push(Pending::Register(src));
                            retainted_in_block = true;
                        }
                        Some(Source::Memory(addr)) => {
                            next.push(Pending::Memory(addr));
                            retainted_in_block = true;
                        }
                        None if instr_writes_reg(&instr, reg) => {
                            if let Some(slot) = gpr_slot_for_register(reg) {
                                locations.insert(slot.offset());
                            }
                        }
                        None => next.push(Pending::Register(reg)),
                    },
                }
            }

            pending = next;
            if pending.is_empty() {
                break;
            }
        }

        if retainted_in_block {
            // Restart-on-retaint: re-walk this same block from the top with the updated
            // pending set, rather than descending into the caller's block with stale taint.
            // `se_main.c` resets its statement index unconditionally here too
            // (`stmt_idx = orig_stmt_idx; i = irsb->stmts_used;`) and only makes
            // `in_first_block` matter for the forced value of `found_faulting_addr`. That
            // flag has no analog to gate here: our walk seeds `pending` directly from
            // `faulting_address` instead of re-scanning for the IMark that matches it, so
            // propagation is already active from the first step regardless of block number.
            cursor = block_top;
            continue;
        }

        cursor = block_start;
        block_top = block_start;
    }

    for item in &pending {
        if let Pending::Register(reg) = item {
            if let Some(slot) = gpr_slot_for_register(*reg) {
                locations.insert(slot.offset());
            }
        }
    }

    Ok(TaintResult { tainted_address: faulting_address, locations: locations.into_iter().collect() })
}

fn instr_writes_reg(instr: &Instruction, reg: Register) -> bool {
    instr.op_count() > 0 && instr.op0_kind() == OpKind::Register && same_gpr(instr.op0_register(), reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::trace::{MemoryHint, MemoryMask, RegisterFile};

    fn step(rip: u64, bytes: &[u8], regs: RegisterFile, hints: Vec<MemoryHint>) -> Step {
        Step { instr: bytes.to_vec(), regs: RegisterFile { rip, ..regs }, hints }
    }

    #[test]
    fn test_walks_register_chain_to_root() {
        // mov rcx, rdi ; mov rbx, rcx ; mov rax, [rbx]
        let mut regs = RegisterFile { rdi: 0x4141_4141, ..Default::default() };
        let step0 = step(0x1000, &[0x48, 0x89, 0xF9], regs, vec![]);

        regs.rcx = 0x4141_4141;
        let step1 = step(0x1003, &[0x48, 0x89, 0xCB], regs, vec![]);

        regs.rbx = 0x4141_4141;
        let fault_addr = 0x4141_4141;
        let step2 = step(
            0x1006,
            &[0x48, 0x8B, 0x03],
            regs,
            vec![MemoryHint { address: fault_addr, operation: MemoryOp::Read, mask: MemoryMask::QWord, data: 0 }],
        );

        let steps = vec![step0, step1, step2];
        let result = find_tainted_locations(&steps, 64, fault_addr).expect("walk");

        assert_eq!(result.tainted_address, fault_addr);
        assert_eq!(result.locations, vec![GprSlot::Rdi.offset()]);
    }

    #[test]
    fn test_restarts_block_on_retaint_across_boundary() {
        // Block A (the block containing the fault): mov rbx, rcx ; mov rax, [rbx]
        // Block B (earlier, reached only by jumping, simulated via a rip discontinuity):
        //   mov rcx, rsi ; mov rcx, rdi
        // The walk must notice, while re-scanning block A a second time after crossing into
        // block B and re-tainting, that rcx in block A should trace back through the *last*
        // definition it finds scanning backward within block B (rdi), not silently stop at
        // the first boundary crossing.
        let mut regs = RegisterFile { rdi: 0x5000, rsi: 0x9999, ..Default::default() };

        // Block B, two non-contiguous-looking steps at a lower address range.
        let step_b0 = step(0x2000, &[0x48, 0x89, 0xF1], regs, vec![]); // mov rcx, rsi
        regs.rcx = 0x9999;
        let step_b1 = step(0x2003, &[0x48, 0x89, 0xF9], regs, vec![]); // mov rcx, rdi (overwrites)
        regs.rcx = 0x5000;

        // Block A starts at a non-fallthrough rip relative to step_b1, forcing a boundary.
        let step_a0 = step(0x3000, &[0x48, 0x89, 0xCB], regs, vec![]); // mov rbx, rcx
        regs.rbx = 0x5000;
        let fault_addr = 0x5000;
        let step_a1 = step(
            0x3003,
            &[0x48, 0x8B, 0x03],
            regs,
            vec![MemoryHint { address: fault_addr, operation: MemoryOp::Read, mask: MemoryMask::QWord, data: 0 }],
        );

        let steps = vec![step_b0, step_b1, step_a0, step_a1];
        let result = find_tainted_locations(&steps, 64, fault_addr).expect("walk");

        assert_eq!(result.tainted_address, fault_addr);
        assert_eq!(result.locations, vec![GprSlot::Rdi.offset()]);
    }

    #[test]
    fn test_restarts_within_first_block_on_retaint() {
        // All four steps fall through one another, so this is a single block and the fault
        // is in the block the walk starts in (`in_first_block` would be true throughout).
        // mov rcx, rax ; mov rbx, rdx ; mov rdx, rsi ; mov rax, [rbx]
        //
        // The walk resolves the fault to rbx, then (scanning further back) rbx to rdx. That
        // retaint happens one step after rdx's own definition (`mov rdx, rsi`) has already
        // been passed over in this same backward pass, so without restarting the block, rdx
        // is wrongly reported as a root instead of being traced back to rsi.
        let regs = RegisterFile::default();

        let step0 = step(0x1000, &[0x48, 0x89, 0xC1], regs, vec![]); // mov rcx, rax
        let step1 = step(0x1003, &[0x48, 0x89, 0xD3], regs, vec![]); // mov rbx, rdx
        let step2 = step(0x1006, &[0x48, 0x89, 0xF2], regs, vec![]); // mov rdx, rsi

        let mut fault_regs = regs;
        let fault_addr = 0x8000;
        fault_regs.rbx = fault_addr;
        let step3 = step(
            0x1009,
            &[0x48, 0x8B, 0x03],
            fault_regs,
            vec![MemoryHint { address: fault_addr, operation: MemoryOp::Read, mask: MemoryMask::QWord, data: 0 }],
        ); // mov rax, [rbx]

        let steps = vec![step0, step1, step2, step3];
        let result = find_tainted_locations(&steps, 64, fault_addr).expect("walk");

        assert_eq!(result.tainted_address, fault_addr);
        assert_eq!(result.locations, vec![GprSlot::Rsi.offset()]);
    }

    #[test]
    fn test_encode_new_alloc_payload_shape() {
        let result = TaintResult { tainted_address: 0xdead_beef, locations: vec![GprSlot::Rdi.offset(), GprSlot::Rsi.offset()] };
        let bytes = encode_new_alloc(&result);

        assert_eq!(bytes.len(), 8 + 8 + 2 * 8);
        assert_eq!(u64::from_ne_bytes(bytes[0..8].try_into().unwrap()), 0xdead_beef);
        assert_eq!(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()), 2);
    }
}
