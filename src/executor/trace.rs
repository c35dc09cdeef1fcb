//! Single-step `ptrace` tracing primitives: register snapshots, instruction decoding, and
//! two-phase memory-hint capture. Adapted from a whole-program tracer into a building block
//! the [`super::Executor`] drives one instruction at a time, with register-writeback added
//! so the executor can load an `IoVec`'s initial state into the tracee.

use anyhow::{anyhow, Context, Result};
use iced_x86::{
    Code, Decoder, DecoderOptions, Instruction, InstructionInfoFactory, InstructionInfoOptions,
    MemorySize, Mnemonic, OpAccess, Register,
};
use nix::sys::ptrace;
use nix::sys::signal;
use nix::sys::uio;
use nix::sys::wait;
use nix::unistd::Pid;
use rangemap::RangeMap;

use std::convert::{TryFrom, TryInto};

const MAX_INSTR_LEN: usize = 15;

/// The width of a concrete memory operation. All operations this crate models are 1, 2, 4, or
/// 8 bytes; larger ones are either ignored (if configured) or cause a fatal error.
#[derive(Clone, Copy, Debug)]
pub enum MemoryMask {
    Byte = 1,
    Word = 2,
    DWord = 4,
    QWord = 8,
}

impl TryFrom<u64> for MemoryMask {
    type Error = anyhow::Error;

    fn try_from(size: u64) -> Result<Self> {
        Ok(match size {
            1 => MemoryMask::Byte,
            2 => MemoryMask::Word,
            4 => MemoryMask::DWord,
            8 => MemoryMask::QWord,
            _ => return Err(anyhow!("size {} doesn't have a supported mask", size)),
        })
    }
}

impl TryFrom<Register> for MemoryMask {
    type Error = anyhow::Error;

    fn try_from(reg: Register) -> Result<Self> {
        (reg.info().size() as u64).try_into()
    }
}

/// The access disposition of a concrete memory operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MemoryOp {
    Read,
    Write,
}

/// A single traced memory access: its kind, size, concrete address, and actual data.
#[derive(Clone, Debug)]
pub struct MemoryHint {
    pub address: u64,
    pub operation: MemoryOp,
    pub mask: MemoryMask,
    pub data: u64,
}

/// One recorded instruction: its pre-execution register file, raw bytes, and resulting
/// memory hints. The taint engine walks a `Vec<Step>` backwards.
#[derive(Clone, Debug)]
pub struct Step {
    pub instr: Vec<u8>,
    pub regs: RegisterFile,
    pub hints: Vec<MemoryHint>,
}

/// The (usermode) register file. Only the standard addressable registers, plus `RFLAGS`, are
/// tracked; all segment base addresses other than `FS`/`GS` are assumed `0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterFile {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub fs_base: u64,
    pub gs_base: u64,
}

impl RegisterFile {
    /// Given a symbolic iced-x86 register, concretize it against the register file, narrowing
    /// as appropriate. Untracked registers result in an `Err`. Visible crate-wide so the taint
    /// engine can resolve effective addresses the same way the tracer does.
    pub(crate) fn value(&self, reg: Register) -> Result<u64> {
        match reg {
            Register::AL => Ok((self.rax as u8).into()),
            Register::BL => Ok((self.rbx as u8).into()),
            Register::CL => Ok((self.rcx as u8).into()),
            Register::DL => Ok((self.rdx as u8).into()),
            Register::AH => Ok(((self.rax >> 8) as u8).into()),
            Register::BH => Ok(((self.rbx >> 8) as u8).into()),
            Register::CH => Ok(((self.rcx >> 8) as u8).into()),
            Register::DH => Ok(((self.rdx >> 8) as u8).into()),
            Register::R8L => Ok((self.r8 as u8).into()),
            Register::R9L => Ok((self.r9 as u8).into()),
            Register::R10L => Ok((self.r10 as u8).into()),
            Register::R11L => Ok((self.r11 as u8).into()),
            Register::R12L => Ok((self.r12 as u8).into()),
            Register::R13L => Ok((self.r13 as u8).into()),
            Register::R14L => Ok((self.r14 as u8).into()),
            Register::R15L => Ok((self.r15 as u8).into()),

            Register::AX => Ok((self.rax as u16).into()),
            Register::BX => Ok((self.rbx as u16).into()),
            Register::CX => Ok((self.rcx as u16).into()),
            Register::DX => Ok((self.rdx as u16).into()),
            Register::SI => Ok((self.rsi as u16).into()),
            Register::DI => Ok((self.rdi as u16).into()),
            Register::SP => Ok((self.rsp as u16).into()),
            Register::BP => Ok((self.rbp as u16).into()),
            Register::R8W => Ok((self.r8 as u16).into()),
            Register::R9W => Ok((self.r9 as u16).into()),
            Register::R10W => Ok((self.r10 as u16).into()),
            Register::R11W => Ok((self.r11 as u16).into()),
            Register::R12W => Ok((self.r12 as u16).into()),
            Register::R13W => Ok((self.r13 as u16).into()),
            Register::R14W => Ok((self.r14 as u16).into()),
            Register::R15W => Ok((self.r15 as u16).into()),

            Register::EAX => Ok((self.rax as u32).into()),
            Register::EBX => Ok((self.rbx as u32).into()),
            Register::ECX => Ok((self.rcx as u32).into()),
            Register::EDX => Ok((self.rdx as u32).into()),
            Register::ESI => Ok((self.rsi as u32).into()),
            Register::EDI => Ok((self.rdi as u32).into()),
            Register::ESP => Ok((self.rsp as u32).into()),
            Register::EBP => Ok((self.rbp as u32).into()),
            Register::R8D => Ok((self.r8 as u32).into()),
            Register::R9D => Ok((self.r9 as u32).into()),
            Register::R10D => Ok((self.r10 as u32).into()),
            Register::R11D => Ok((self.r11 as u32).into()),
            Register::R12D => Ok((self.r12 as u32).into()),
            Register::R13D => Ok((self.r13 as u32).into()),
            Register::R14D => Ok((self.r14 as u32).into()),
            Register::R15D => Ok((self.r15 as u32).into()),
            Register::EIP => Ok((self.rip as u32).into()),

            Register::RAX => Ok(self.rax),
            Register::RBX => Ok(self.rbx),
            Register::RCX => Ok(self.rcx),
            Register::RDX => Ok(self.rdx),
            Register::RSI => Ok(self.rsi),
            Register::RDI => Ok(self.rdi),
            Register::RSP => Ok(self.rsp),
            Register::RBP => Ok(self.rbp),
            Register::R8 => Ok(self.r8),
            Register::R9 => Ok(self.r9),
            Register::R10 => Ok(self.r10),
            Register::R11 => Ok(self.r11),
            Register::R12 => Ok(self.r12),
            Register::R13 => Ok(self.r13),
            Register::R14 => Ok(self.r14),
            Register::R15 => Ok(self.r15),
            Register::RIP => Ok(self.rip),

            Register::FS => Ok(self.fs_base),
            Register::GS => Ok(self.gs_base),

            Register::SS | Register::CS | Register::DS | Register::ES => Ok(0),

            _ => Err(anyhow!("untracked register requested: {:?}", reg)),
        }
    }

    /// Sets one of the tracked general-purpose 64-bit registers by `GprSlot` offset (see
    /// `crate::iovec::GprSlot`), used to load an `IoVec`'s argument registers before entering
    /// the target function.
    pub fn set_by_slot_offset(&mut self, offset: i64, value: u64) {
        match offset {
            0 => self.rax = value,
            8 => self.rbx = value,
            16 => self.rcx = value,
            24 => self.rdx = value,
            32 => self.rsi = value,
            40 => self.rdi = value,
            48 => self.rbp = value,
            56 => self.rsp = value,
            64 => self.r8 = value,
            72 => self.r9 = value,
            80 => self.r10 = value,
            88 => self.r11 = value,
            96 => self.r12 = value,
            104 => self.r13 = value,
            112 => self.r14 = value,
            120 => self.r15 = value,
            128 => self.rip = value,
            136 => self.rflags = value,
            other => log::warn!("ignoring register_value with unknown guest_state_offset {}", other),
        }
    }

    /// Merges the tracked fields back into a previously-read `user_regs_struct`, leaving
    /// segment selectors and `orig_rax` untouched.
    pub fn merge_into(&self, mut base: libc::user_regs_struct) -> libc::user_regs_struct {
        base.rax = self.rax;
        base.rbx = self.rbx;
        base.rcx = self.rcx;
        base.rdx = self.rdx;
        base.rsi = self.rsi;
        base.rdi = self.rdi;
        base.rsp = self.rsp;
        base.rbp = self.rbp;
        base.r8 = self.r8;
        base.r9 = self.r9;
        base.r10 = self.r10;
        base.r11 = self.r11;
        base.r12 = self.r12;
        base.r13 = self.r13;
        base.r14 = self.r14;
        base.r15 = self.r15;
        base.rip = self.rip;
        base.eflags = self.rflags;
        base.fs_base = self.fs_base;
        base.gs_base = self.gs_base;
        base
    }
}

impl From<libc::user_regs_struct> for RegisterFile {
    fn from(user_regs: libc::user_regs_struct) -> Self {
        Self {
            rax: user_regs.rax,
            rbx: user_regs.rbx,
            rcx: user_regs.rcx,
            rdx: user_regs.rdx,
            rsi: user_regs.rsi,
            rdi: user_regs.rdi,
            rsp: user_regs.rsp,
            rbp: user_regs.rbp,
            r8: user_regs.r8,
            r9: user_regs.r9,
            r10: user_regs.r10,
            r11: user_regs.r11,
            r12: user_regs.r12,
            r13: user_regs.r13,
            r14: user_regs.r14,
            r15: user_regs.r15,
            rip: user_regs.rip,
            rflags: user_regs.eflags,
            fs_base: user_regs.fs_base,
            gs_base: user_regs.gs_base,
        }
    }
}

/// An actively traced process, stepped one instruction at a time by its owning `Executor`.
pub struct Tracee {
    pub(crate) terminated: bool,
    pub(crate) pid: Pid,
    ignore_unsupported_memops: bool,
    debug_on_fault: bool,
    bitness: u32,
    info_factory: InstructionInfoFactory,
    register_file: RegisterFile,
    executable_pages: RangeMap<u64, Vec<u8>>,
}

impl Tracee {
    /// Wraps an already-traced (`PTRACE_TRACEME`'d or attached) process.
    pub fn new(pid: Pid, bitness: u32, ignore_unsupported_memops: bool, debug_on_fault: bool) -> Result<Self> {
        let mut tracee = Self {
            terminated: false,
            pid,
            ignore_unsupported_memops,
            debug_on_fault,
            bitness,
            info_factory: InstructionInfoFactory::new(),
            register_file: Default::default(),
            executable_pages: Default::default(),
        };

        tracee.find_exec_pages()?;

        Ok(tracee)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Reads the tracee's live registers without stepping.
    pub fn peek_registers(&mut self) -> Result<RegisterFile> {
        self.tracee_regs()?;
        Ok(self.register_file)
    }

    /// Overwrites the tracee's live registers, preserving segment selectors and `orig_rax`.
    pub fn poke_registers(&mut self, regs: &RegisterFile) -> Result<()> {
        let base = ptrace::getregs(self.pid)?;
        let merged = regs.merge_into(base);
        ptrace::setregs(self.pid, merged)?;
        self.register_file = *regs;
        Ok(())
    }

    /// Reads up to `PTR_WIDTH` bytes of live memory at `addr`, used by
    /// `iovec::current_state_matches_expected`'s accessor callbacks.
    pub fn peek_data(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.tracee_data(addr, size)
    }

    /// Overwrites a single byte of live memory, read-modify-write against the containing
    /// aligned word since `PTRACE_POKEDATA` only operates word-at-a-time. Returns the byte
    /// that was there before, so the caller can restore it (used to plant and then remove a
    /// software breakpoint at the target function's entry point).
    pub fn poke_byte(&self, addr: u64, value: u8) -> Result<u8> {
        let aligned = addr & !7;
        let shift = ((addr - aligned) * 8) as u32;

        let word = ptrace::read(self.pid, aligned as ptrace::AddressType)? as u64;
        let original_byte = ((word >> shift) & 0xff) as u8;

        let mask = !(0xffu64 << shift);
        let new_word = (word & mask) | ((value as u64) << shift);

        unsafe {
            ptrace::write(self.pid, aligned as ptrace::AddressType, new_word as *mut libc::c_void)?;
        }

        Ok(original_byte)
    }

    /// True if `addr` falls inside a page this crate has observed as executable, readable, or
    /// writable for the client — a coarse stand-in for an address-space validity query, backed
    /// by the pages captured at attach time plus a direct one-byte read probe.
    pub fn is_accessible(&self, addr: u64) -> bool {
        if self.executable_pages.get(&addr).is_some() {
            return true;
        }
        self.tracee_data(addr, 1).is_ok()
    }

    /// Steps the tracee forward by one instruction, returning the resulting `Step`.
    pub fn step(&mut self) -> Result<Step> {
        self.tracee_regs()?;
        let (instr, instr_bytes) = self.tracee_instr()?;

        let mut hints = self.tracee_hints_stage1(&instr)?;

        ptrace::step(self.pid, None)?;

        self.tracee_hints_stage2(&mut hints)?;

        match wait::waitpid(self.pid, None)? {
            wait::WaitStatus::Exited(_, status) => {
                log::debug!("exited with {}", status);
                self.terminated = true;
            }
            wait::WaitStatus::Signaled(_, _, _) => {
                log::debug!("signaled");
                self.terminated = true;
            }
            wait::WaitStatus::Stopped(_, signal) => {
                log::debug!("stopped with {:?}", signal);
            }
            wait::WaitStatus::StillAlive => {
                log::debug!("still alive");
            }
            s => {
                log::debug!("{:?}", s);
                self.terminated = true;
            }
        }

        Ok(Step { instr: instr_bytes[0..instr.len()].to_vec(), regs: self.register_file, hints })
    }

    /// Waits for the next `ptrace` stop without single-stepping, used while fast-forwarding to
    /// the target function under `PTRACE_CONT`. Returns the resulting wait status.
    pub fn cont_to_next_stop(&mut self) -> Result<wait::WaitStatus> {
        ptrace::cont(self.pid, None)?;
        let status = wait::waitpid(self.pid, None)?;
        if let wait::WaitStatus::Exited(..) = status {
            self.terminated = true;
        }
        Ok(status)
    }

    fn tracee_regs(&mut self) -> Result<()> {
        self.register_file = RegisterFile::from(ptrace::getregs(self.pid)?);
        Ok(())
    }

    /// Returns the decoded instruction and raw bytes at the tracee's current `rip`.
    pub fn tracee_instr(&self) -> Result<(Instruction, Vec<u8>)> {
        let mut bytes = vec![0u8; MAX_INSTR_LEN];
        let remote_iov = uio::RemoteIoVec { base: self.register_file.rip as usize, len: MAX_INSTR_LEN };

        uio::process_vm_readv(self.pid, &[uio::IoVec::from_mut_slice(&mut bytes)], &[remote_iov])?;

        log::debug!("fetched instruction bytes: {:?}", bytes);

        let mut decoder = Decoder::new(self.bitness, &bytes, DecoderOptions::NONE);
        decoder.set_ip(self.register_file.rip);

        let instr = decoder.decode();
        log::debug!("instr: {:?}", instr.code());

        match instr.code() {
            Code::INVALID => Err(anyhow!("invalid instruction")),
            _ => Ok((instr, bytes)),
        }
    }

    fn tracee_data_by_mask(&self, addr: u64, mask: MemoryMask) -> Result<u64> {
        let bytes = self.tracee_data(addr, mask as usize)?;

        Ok(match mask {
            MemoryMask::Byte => bytes[0] as u64,
            MemoryMask::Word => u16::from_le_bytes(bytes.as_slice().try_into()?) as u64,
            MemoryMask::DWord => u32::from_le_bytes(bytes.as_slice().try_into()?) as u64,
            MemoryMask::QWord => u64::from_le_bytes(bytes.as_slice().try_into()?) as u64,
        })
    }

    fn tracee_data(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        log::debug!("attempting to read tracee @ 0x{:x} ({:?})", addr, size);

        let mut bytes = vec![0u8; size];
        let remote_iov = uio::RemoteIoVec { base: addr as usize, len: size };

        if let Err(e) = uio::process_vm_readv(self.pid, &[uio::IoVec::from_mut_slice(&mut bytes)], &[remote_iov]) {
            if self.debug_on_fault {
                log::error!("suspending the tracee ({}), detaching and exiting", self.pid);
                ptrace::detach(self.pid, Some(signal::Signal::SIGSTOP))?;
            }

            return Err(e).with_context(|| format!("fault: size: {:?}, address: {:x}", size, addr));
        }

        log::debug!("fetched data bytes: {:?}", bytes);
        Ok(bytes)
    }

    fn find_exec_pages(&mut self) -> Result<()> {
        for map in rsprocmaps::from_pid(self.pid.as_raw())? {
            let map = map?;
            if !map.permissions.executable {
                continue;
            }

            let exec_range = {
                let size = map.address_range.end - map.address_range.begin;
                match self.tracee_data(map.address_range.begin, size as usize) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("skipping unreadable executable page at 0x{:x}: {}", map.address_range.begin, e);
                        continue;
                    }
                }
            };

            self.executable_pages.insert(map.address_range.begin..map.address_range.end, exec_range);
        }

        Ok(())
    }

    fn mask_from_str_instr(&self, instr: &Instruction) -> Result<MemoryMask> {
        Ok(match instr.mnemonic() {
            Mnemonic::Lodsb | Mnemonic::Stosb | Mnemonic::Movsb | Mnemonic::Cmpsb | Mnemonic::Scasb => {
                MemoryMask::Byte
            }
            Mnemonic::Lodsw | Mnemonic::Stosw | Mnemonic::Movsw | Mnemonic::Cmpsw | Mnemonic::Scasw => {
                MemoryMask::Word
            }
            Mnemonic::Lodsd | Mnemonic::Stosd | Mnemonic::Movsd | Mnemonic::Cmpsd | Mnemonic::Scasd => {
                MemoryMask::DWord
            }
            Mnemonic::Lodsq | Mnemonic::Stosq | Mnemonic::Movsq | Mnemonic::Cmpsq | Mnemonic::Scasq => {
                MemoryMask::QWord
            }
            _ => return Err(anyhow!("unknown mask for instruction: {:?}", instr.code())),
        })
    }

    fn tracee_hints_stage1(&mut self, instr: &Instruction) -> Result<Vec<MemoryHint>> {
        log::debug!("memory hints stage 1");
        let mut hints = vec![];

        let info = self.info_factory.info_options(instr, InstructionInfoOptions::NO_REGISTER_USAGE).clone();

        for used_mem in info.used_memory() {
            let ops: &[MemoryOp] = match used_mem.access() {
                OpAccess::Read => &[MemoryOp::Read],
                OpAccess::CondRead => &[MemoryOp::Read],
                OpAccess::Write => &[MemoryOp::Write],
                OpAccess::CondWrite => &[MemoryOp::Write],
                OpAccess::ReadWrite => &[MemoryOp::Read, MemoryOp::Write],
                OpAccess::ReadCondWrite => &[MemoryOp::Read, MemoryOp::Write],
                op => return Err(anyhow!("unsupported memop: {:?}", op)),
            };

            let mask = match used_mem.memory_size() {
                MemorySize::UInt8 | MemorySize::Int8 => MemoryMask::Byte,
                MemorySize::UInt16 | MemorySize::Int16 => MemoryMask::Word,
                MemorySize::UInt32 | MemorySize::Int32 => MemoryMask::DWord,
                MemorySize::UInt64 | MemorySize::Int64 => MemoryMask::QWord,
                MemorySize::Unknown => self.mask_from_str_instr(instr)?,
                size => {
                    if self.ignore_unsupported_memops {
                        log::warn!("unsupported memop size: {:?}: not generating a memory hint", size);
                        continue;
                    } else {
                        return Err(anyhow!("unsupported memsize: {:?}", size));
                    }
                }
            };

            let addr = used_mem
                .try_virtual_address(0, |reg, _, _| self.register_file.value(reg).ok())
                .ok_or_else(|| anyhow!("effective address calculation failed"))?;

            log::debug!("effective virtual addr: {:x}", addr);

            for op in ops {
                let data = match op {
                    MemoryOp::Read => self.tracee_data_by_mask(addr, mask)?,
                    MemoryOp::Write => 0,
                };

                hints.push(MemoryHint { address: addr, operation: *op, mask, data });
            }

            log::debug!("{:?}", used_mem);
        }

        Ok(hints)
    }

    fn tracee_hints_stage2(&self, hints: &mut Vec<MemoryHint>) -> Result<()> {
        log::debug!("memory hints stage 2");

        // Fast-string-op reordering workaround: give the CPU a chance to retire the write
        // before we read it back.
        std::thread::sleep(std::time::Duration::from_millis(1));

        for hint in hints.iter_mut() {
            if hint.operation != MemoryOp::Write {
                continue;
            }

            hint.data = self.tracee_data_by_mask(hint.address, hint.mask)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_regs() -> RegisterFile {
        RegisterFile { rax: 0x9900aabbccddeeff, rdi: 0x00000000feedface, ..Default::default() }
    }

    #[test]
    fn test_register_file_value() {
        let regs = dummy_regs();

        assert_eq!(regs.value(Register::AL).unwrap(), 0xff);
        assert_eq!(regs.value(Register::AH).unwrap(), 0xee);
        assert_eq!(regs.value(Register::AX).unwrap(), 0xeeff);
        assert_eq!(regs.value(Register::EAX).unwrap(), 0xccddeeff);
        assert_eq!(regs.value(Register::RAX).unwrap(), 0x9900aabbccddeeff);

        assert_eq!(regs.value(Register::SS).unwrap(), 0);
        assert_eq!(regs.value(Register::CS).unwrap(), 0);
        assert_eq!(regs.value(Register::DS).unwrap(), 0);
        assert_eq!(regs.value(Register::ES).unwrap(), 0);
        assert_eq!(regs.value(Register::FS).unwrap(), 0);
        assert_eq!(regs.value(Register::GS).unwrap(), 0);

        assert!(regs.value(Register::ST0).is_err());
    }

    #[test]
    fn test_set_by_slot_offset_matches_sysv_arg_registers() {
        use crate::iovec::{GprSlot, ARG_REGISTER_SLOTS};

        let mut regs = RegisterFile::default();
        let values: [u64; 6] = [1, 2, 3, 4, 5, 6];
        for (slot, value) in ARG_REGISTER_SLOTS.iter().zip(values.iter()) {
            regs.set_by_slot_offset(slot.offset(), *value);
        }

        assert_eq!(regs.rdi, 1);
        assert_eq!(regs.rsi, 2);
        assert_eq!(regs.rdx, 3);
        assert_eq!(regs.rcx, 4);
        assert_eq!(regs.r8, 5);
        assert_eq!(regs.r9, 6);
        let _ = GprSlot::Rax;
    }
}
