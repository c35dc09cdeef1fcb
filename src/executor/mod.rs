//! Drives a traced child from process start to the target function, through however many
//! times it's called (including recursively), to either a clean return or a fault.
//!
//! Grounded on `mttn::trace::{Tracer, Tracee}` for the ptrace plumbing and on `se_main.c`'s
//! `jump_to_target_function`/`record_current_state`/`maybe_report_success_to_commader`/
//! `SE_(signal_handler)` for the control flow. The original reached the target by rewriting
//! its VEX IR to insert calls to instrumentation functions; there is no IR here, so entry and
//! exit are detected directly against the traced instruction stream instead, using one of two
//! `EntryStrategy`s to first reach the function.

pub mod symbols;
pub mod trace;

use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use spawn_ptrace::CommandPtraceSpawn;

use crate::iovec::{GprSlot, IoVec, ProgramState, RegisterValue, ReturnValue};
use crate::taint::{self, TaintResult};
use trace::{RegisterFile, Step, Tracee};

/// Launches `target_path` under `PTRACE_TRACEME`, or attaches to an already-running
/// `tracee_pid`, and waits for the initial stop. Mirrors `mttn::trace::Tracer::trace`.
pub fn spawn_or_attach(
    target_path: Option<&Path>,
    tracee_args: &[String],
    tracee_pid: Option<i32>,
    bitness: u32,
    ignore_unsupported_memops: bool,
    debug_on_fault: bool,
) -> Result<Tracee> {
    let pid = match (target_path, tracee_pid) {
        (_, Some(pid)) => {
            let pid = Pid::from_raw(pid);
            ptrace::attach(pid).context("ptrace attach failed")?;
            waitpid(pid, None)?;
            pid
        }
        (Some(path), None) => {
            let child = Command::new(path)
                .args(tracee_args)
                .spawn_ptrace()
                .with_context(|| format!("failed to spawn {} under ptrace", path.display()))?;
            Pid::from_raw(child.id() as i32)
        }
        (None, None) => return Err(anyhow!("no target binary or pid given")),
    };

    ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACEEXIT)?;

    Tracee::new(pid, bitness, ignore_unsupported_memops, debug_on_fault)
}

/// Adds a PIE binary's runtime load bias to a file-relative symbol address, found by matching
/// `path`'s file name against the tracee's memory mappings. Non-PIE addresses are already
/// absolute and pass through unchanged.
pub fn resolve_runtime_address(pid: Pid, path: &Path, file_relative_addr: u64, is_pie: bool) -> Result<u64> {
    if !is_pie {
        return Ok(file_relative_addr);
    }

    let file_name = path.file_name().ok_or_else(|| anyhow!("target path {} has no file name", path.display()))?;

    for map in rsprocmaps::from_pid(pid.as_raw())? {
        let map = map?;
        if let rsprocmaps::Pathname::Path(mapped_path) = &map.pathname {
            if Path::new(mapped_path).file_name() == Some(file_name) {
                return Ok(map.address_range.begin + file_relative_addr);
            }
        }
    }

    Err(anyhow!("{} is not mapped into pid {}", path.display(), pid))
}

/// How the executor gets control to the target function's first instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStrategy {
    /// Plant a `0xCC` at the target's entry point, `PTRACE_CONT` until it traps there, then
    /// restore the original byte and rewind `rip`. Cheap, but requires a writable text page.
    Breakpoint,
    /// Single-step from the very first instruction, checking `rip` against the target after
    /// every step. Slower, but works against read-only or unmapped text.
    SingleStep,
}

/// Where the executor is in a run: still working toward the target function's first
/// instruction, or inside one or more (possibly recursive) invocations of it.
#[derive(Clone, Debug)]
enum Phase {
    AwaitingTarget,
    InTarget {
        recursive_depth: u32,
        /// `rsp` recorded at each nested call entry, innermost last, used to tell a `ret`
        /// returning out of the target apart from a `ret` inside a helper function it calls.
        frame_entry_rsp: Vec<u64>,
    },
}

/// What running the target produced.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The target ran to completion (possibly recursively) without faulting.
    Success { return_value: ReturnValue, syscalls: BTreeSet<i64>, coverage: BTreeSet<u64> },
    /// A memory access faulted; taint analysis implicates these locations.
    Fault(TaintResult),
    /// `FetchInitialState`: the target's entry register file, captured without running it.
    InitialState(RegisterFile),
}

pub struct Executor {
    tracee: Tracee,
    target_func_addr: u64,
    bitness: u32,
    strategy: EntryStrategy,
    phase: Phase,
    steps: Vec<Step>,
    syscalls: BTreeSet<i64>,
    /// Unique instruction pointers observed while inside the target, reported as a `Coverage`
    /// message when requested. Mirrors `program_states`' role in `write_coverage_to_cmd_server`.
    coverage: BTreeSet<u64>,
}

impl Executor {
    pub fn new(tracee: Tracee, target_func_addr: u64, bitness: u32, strategy: EntryStrategy) -> Self {
        Self {
            tracee,
            target_func_addr,
            bitness,
            strategy,
            phase: Phase::AwaitingTarget,
            steps: Vec::new(),
            syscalls: BTreeSet::new(),
            coverage: BTreeSet::new(),
        }
    }

    /// Runs the tracee forward until it reaches the target function, then either installs
    /// `io_vec`'s initial register state and enters it (`getting_init_state == false`), or
    /// snapshots the entry register file without entering (`getting_init_state == true`).
    ///
    /// On return, the caller should call [`Executor::run_target`] unless this returned
    /// `InitialState`, in which case the run is already over.
    pub fn run_to_target(&mut self, io_vec: &IoVec, getting_init_state: bool) -> Result<Option<ExecutionOutcome>> {
        self.jump_to_target_function()?;

        let entry_regs = self.tracee.peek_registers()?;

        if getting_init_state {
            return Ok(Some(ExecutionOutcome::InitialState(entry_regs)));
        }

        let mut regs = entry_regs;
        for reg in &io_vec.initial_state.register_state {
            regs.set_by_slot_offset(reg.guest_state_offset, reg.value);
        }
        self.tracee.poke_registers(&regs)?;

        self.phase = Phase::InTarget { recursive_depth: 1, frame_entry_rsp: vec![regs.rsp] };
        self.record_current_state(self.target_func_addr, &regs);

        Ok(None)
    }

    /// Runs one (possibly recursive) invocation of the target to completion, or until a fault.
    /// Must only be called after `run_to_target` returned `Ok(None)`.
    pub fn run_target(&mut self) -> Result<ExecutionOutcome> {
        loop {
            if self.tracee.is_terminated() {
                return Err(anyhow!("tracee exited before the target function returned"));
            }

            let step = match self.tracee.step() {
                Ok(step) => step,
                Err(e) => return self.maybe_fix_address_space(e),
            };

            let decoded = {
                let mut decoder = Decoder::new(self.bitness, &step.instr, DecoderOptions::NONE);
                decoder.set_ip(step.regs.rip);
                decoder.decode()
            };

            self.steps.push(step.clone());
            if matches!(self.phase, Phase::InTarget { .. }) {
                self.coverage.insert(step.regs.rip);

                // `SE_(pre_syscall)`: no `PTRACE_O_TRACESYSGOOD` stop is needed since the
                // instruction stream is already decoded one-by-one here; `rax` at the
                // pre-step register snapshot is the syscall number, per the x86-64 ABI.
                if decoded.mnemonic() == Mnemonic::Syscall {
                    self.note_syscall(step.regs.rax as i64);
                }
            }

            if step.regs.rip == self.target_func_addr {
                self.enter_recursive_call(&step.regs);
                continue;
            }

            if decoded.mnemonic() == Mnemonic::Ret {
                if let Some(outcome) = self.maybe_report_success(&step.regs)? {
                    return Ok(outcome);
                }
            }
        }
    }

    fn enter_recursive_call(&mut self, regs: &RegisterFile) {
        match &mut self.phase {
            Phase::InTarget { recursive_depth, frame_entry_rsp } => {
                *recursive_depth += 1;
                frame_entry_rsp.push(regs.rsp);
            }
            Phase::AwaitingTarget => {
                self.phase = Phase::InTarget { recursive_depth: 1, frame_entry_rsp: vec![regs.rsp] };
            }
        }
        self.record_current_state(self.target_func_addr, regs);
    }

    /// `maybe_report_success_to_commader`: a `ret` only counts as leaving the target if the
    /// post-`ret` stack pointer has popped back past the frame that was pushed on entry to the
    /// innermost pending call.
    fn maybe_report_success(&mut self, post_ret_regs: &RegisterFile) -> Result<Option<ExecutionOutcome>> {
        let (recursive_depth, frame_entry_rsp) = match &mut self.phase {
            Phase::InTarget { recursive_depth, frame_entry_rsp } => (recursive_depth, frame_entry_rsp),
            Phase::AwaitingTarget => return Ok(None),
        };

        let entry_rsp = match frame_entry_rsp.last() {
            Some(rsp) => *rsp,
            None => return Ok(None),
        };

        if post_ret_regs.rsp <= entry_rsp {
            // Returned out of a helper the target called, not out of the target itself.
            return Ok(None);
        }

        frame_entry_rsp.pop();
        *recursive_depth -= 1;

        if *recursive_depth > 0 {
            return Ok(None);
        }

        let return_value = ReturnValue::from_u64(post_ret_regs.rax, false);
        Ok(Some(ExecutionOutcome::Success {
            return_value,
            syscalls: std::mem::take(&mut self.syscalls),
            coverage: std::mem::take(&mut self.coverage),
        }))
    }

    fn maybe_fix_address_space(&mut self, fault: anyhow::Error) -> Result<ExecutionOutcome> {
        let faulting_regs = self.tracee.peek_registers().unwrap_or_default();
        let faulting_address = self.guess_faulting_address(&faulting_regs);

        log::warn!("fault while stepping: {:#}; running taint analysis from 0x{:x}", fault, faulting_address);

        if self.steps.is_empty() {
            return Err(anyhow!("fault before any instructions were recorded: {:#}", fault));
        }

        taint::find_tainted_locations(&self.steps, self.bitness, faulting_address).map(ExecutionOutcome::Fault)
    }

    /// Without a signal-delivery path (the tracer observes the fault as a `ptrace` error, not
    /// a caught `SIGSEGV`), the best available guess at the faulting address is the last
    /// memory hint recorded before the step failed.
    fn guess_faulting_address(&self, regs: &RegisterFile) -> u64 {
        self.steps.last().and_then(|s| s.hints.last()).map(|h| h.address).unwrap_or(regs.rip)
    }

    /// Reaches the target function's first instruction, via whichever `EntryStrategy` this
    /// executor was built with.
    fn jump_to_target_function(&mut self) -> Result<()> {
        match self.strategy {
            EntryStrategy::Breakpoint => self.run_to_target_via_breakpoint(),
            EntryStrategy::SingleStep => self.run_to_target_via_single_step(),
        }
    }

    fn run_to_target_via_breakpoint(&mut self) -> Result<()> {
        let original_byte = self.tracee.poke_byte(self.target_func_addr, 0xCC)?;

        loop {
            match self.tracee.cont_to_next_stop()? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let mut regs = self.tracee.peek_registers()?;
                    if regs.rip == self.target_func_addr + 1 {
                        regs.rip -= 1;
                        self.tracee.poke_registers(&regs)?;
                        self.tracee.poke_byte(self.target_func_addr, original_byte)?;
                        return Ok(());
                    }
                }
                WaitStatus::Exited(..) => {
                    return Err(anyhow!("tracee exited before reaching the target function"));
                }
                status => log::debug!("ignoring wait status while seeking target: {:?}", status),
            }
        }
    }

    fn run_to_target_via_single_step(&mut self) -> Result<()> {
        loop {
            let regs = self.tracee.peek_registers()?;
            if regs.rip == self.target_func_addr {
                return Ok(());
            }
            if self.tracee.is_terminated() {
                return Err(anyhow!("tracee exited before reaching the target function"));
            }
            self.tracee.step()?;
        }
    }

    /// `record_current_state`, minus the VEX guest-state snapshot (ptrace reads it live instead
    /// of needing it handed in). Only meaningful once inside the target, since that's the only
    /// time `Phase::InTarget` exists.
    ///
    /// Called right at target entry and at each recursive re-entry, before `run_target`'s
    /// per-instruction loop has taken a single step, so `addr` (the target's own entry point)
    /// would otherwise never show up in `coverage` or `syscalls` bookkeeping: the loop only
    /// records the instruction pointer *after* a step executes.
    fn record_current_state(&mut self, addr: u64, regs: &RegisterFile) {
        if !matches!(self.phase, Phase::InTarget { .. }) {
            return;
        }
        let mut recorded = *regs;
        recorded.rip = addr;
        log::trace!("recording state at 0x{:x}", recorded.rip);
        self.coverage.insert(recorded.rip);
    }

    /// `SE_(pre_syscall)`/`SE_(post_syscall)`: records every syscall number the target issues.
    pub fn note_syscall(&mut self, syscall_no: i64) {
        self.syscalls.insert(syscall_no);
    }

    pub fn tracee_mut(&mut self) -> &mut Tracee {
        &mut self.tracee
    }
}

/// Reads live memory for each tracked range of `initial_state.address_state` (skipping
/// pointer-valued subobjects, which can't be compared byte-for-byte across runs) and returns
/// the resulting snapshot, to be stored as a fresh `IoVec::expected_state`.
pub fn capture_expected_state(tracee: &Tracee, initial_state: &ProgramState) -> crate::iovec::AddrRangeMap<u8> {
    use crate::iovec::ObjTag;

    let mut expected = crate::iovec::AddrRangeMap::new();
    let mut in_obj = false;

    for (min, max, tag) in initial_state.address_state.iter() {
        if tag.contains(ObjTag::OBJ_START) {
            in_obj = true;
        }
        if !tag.contains(ObjTag::OBJ_ALLOCATED) {
            in_obj = false;
        }

        if in_obj && !tag.contains(ObjTag::ALLOCATED_SUBPTR) {
            if let Ok(bytes) = tracee.peek_data(min, (max - min + 1) as usize) {
                for (offset, byte) in bytes.into_iter().enumerate() {
                    expected.insert(min + offset as u64, min + offset as u64, byte);
                }
            }
        }

        if tag.contains(ObjTag::OBJ_END) {
            in_obj = false;
        }
    }

    expected
}

/// Loads an `IoVec`'s argument registers out of a live `RegisterFile`, used by `FETCH_INITIAL_STATE`
/// and by `FUZZ` to seed a fresh `IoVec` from whatever the tracee's registers hold at target entry.
pub fn register_state_from(regs: &RegisterFile) -> Vec<RegisterValue> {
    use crate::iovec::ARG_REGISTER_SLOTS;

    ARG_REGISTER_SLOTS
        .iter()
        .map(|slot| RegisterValue { guest_state_offset: slot.offset(), value: value_for_slot(regs, *slot), is_ptr: false })
        .collect()
}

fn value_for_slot(regs: &RegisterFile, slot: GprSlot) -> u64 {
    match slot {
        GprSlot::Rax => regs.rax,
        GprSlot::Rbx => regs.rbx,
        GprSlot::Rcx => regs.rcx,
        GprSlot::Rdx => regs.rdx,
        GprSlot::Rsi => regs.rsi,
        GprSlot::Rdi => regs.rdi,
        GprSlot::Rbp => regs.rbp,
        GprSlot::Rsp => regs.rsp,
        GprSlot::R8 => regs.r8,
        GprSlot::R9 => regs.r9,
        GprSlot::R10 => regs.r10,
        GprSlot::R11 => regs.r11,
        GprSlot::R12 => regs.r12,
        GprSlot::R13 => regs.r13,
        GprSlot::R14 => regs.r14,
        GprSlot::R15 => regs.r15,
        GprSlot::Rip => regs.rip,
        GprSlot::Rflags => regs.rflags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_state_from_round_trips_arg_registers() {
        let regs = RegisterFile { rdi: 1, rsi: 2, rdx: 3, rcx: 4, r8: 5, r9: 6, ..Default::default() };
        let state = register_state_from(&regs);

        assert_eq!(state.len(), 6);
        assert_eq!(state[0].value, 1);
        assert_eq!(state[5].value, 6);
    }
}
