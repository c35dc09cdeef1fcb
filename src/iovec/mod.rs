//! `IoVec`: the serializable program-state fixture exchanged between the driver and the
//! harness. Grounded on `se_io_vec.c`'s `SE_(io_vec)`/`SE_(program_state)` and the
//! `current_state_matches_expected`/`return_values_same`/`translate_io_vec_to_host` family.

pub mod codec;
pub mod rangemap;

use std::collections::BTreeSet;

use bitflags::bitflags;
use log::warn;

pub use rangemap::AddrRangeMap;

/// Pointer width on the only host this crate targets.
pub const PTR_WIDTH: usize = 8;

/// A canonical, word-granularity slot identifier for the general-purpose registers this
/// crate cares about, used as the `guest_state_offset` carried in the wire format. Offsets
/// are word indices (not VEX guest-state byte offsets, since there is no VEX guest state
/// here), multiplied by 8 to keep the wire shape stable if more slots are added.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum GprSlot {
    Rax = 0,
    Rbx = 1,
    Rcx = 2,
    Rdx = 3,
    Rsi = 4,
    Rdi = 5,
    Rbp = 6,
    Rsp = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,
    Rflags = 17,
}

impl GprSlot {
    pub fn offset(self) -> i64 {
        self as i64 * 8
    }
}

/// `SE_O_GPRS` / `SE_NUM_GPRS`: the registers the System V AMD64 ABI uses for the first six
/// integer/pointer arguments, in argument order.
pub const ARG_REGISTER_SLOTS: [GprSlot; 6] =
    [GprSlot::Rdi, GprSlot::Rsi, GprSlot::Rdx, GprSlot::Rcx, GprSlot::R8, GprSlot::R9];

bitflags! {
    /// Region-metadata tags bound to address ranges in `address_state`.
    pub struct ObjTag: u64 {
        const OBJ_START        = 0b0001;
        const OBJ_ALLOCATED    = 0b0010;
        const ALLOCATED_SUBPTR = 0b0100;
        const OBJ_END          = 0b1000;
    }
}

/// One GPR's value at a snapshot point, mirroring `SE_(register_value)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterValue {
    pub guest_state_offset: i64,
    pub value: u64,
    pub is_ptr: bool,
}

/// A full register + memory snapshot, mirroring `SE_(program_state)`.
#[derive(Clone, Debug, Default)]
pub struct ProgramState {
    pub register_state: Vec<RegisterValue>,
    pub address_state: AddrRangeMap<ObjTag>,
    pub pointer_member_locations: AddrRangeMap<u64>,
}

impl ProgramState {
    fn new_with_arg_registers() -> Self {
        let register_state = ARG_REGISTER_SLOTS
            .iter()
            .map(|slot| RegisterValue { guest_state_offset: slot.offset(), value: 0, is_ptr: false })
            .collect();
        Self { register_state, address_state: AddrRangeMap::new(), pointer_member_locations: AddrRangeMap::new() }
    }

    /// `SE_(ppProgramState)`, returned as a string for the caller to log.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        out.push_str("allocated addresses:\n");
        for (min, max, tag) in self.address_state.iter() {
            out.push_str(&format!("\t0x{:016x} -- 0x{:016x} = {:?}\n", min, max, tag));
        }
        out.push_str("pointer_member_locations:\n");
        for (min, _max, target) in self.pointer_member_locations.iter() {
            if *target > 0 {
                out.push_str(&format!("\t0x{:016x} = 0x{:016x}\n", min, target));
            }
        }
        out.push_str("register_state:\n");
        for reg in &self.register_state {
            out.push_str(&format!(
                "\t{}\t= 0x{:016x} {}\n",
                reg.guest_state_offset,
                reg.value,
                if reg.is_ptr { "O" } else { "X" }
            ));
        }
        out
    }
}

/// Host architecture tag carried in the wire format. This crate targets exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Arch {
    X86_64 = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Endness {
    Little = 0,
    Big = 1,
}

/// A function's observed or expected return value, mirroring `SE_(return_value)`. `bytes` is
/// always `PTR_WIDTH` long and interpreted as a little-endian `i64`/pointer depending on
/// `is_ptr`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnValue {
    pub bytes: [u8; PTR_WIDTH],
    pub is_ptr: bool,
}

impl ReturnValue {
    pub fn zero() -> Self {
        Self { bytes: [0u8; PTR_WIDTH], is_ptr: false }
    }

    pub fn from_i64(value: i64, is_ptr: bool) -> Self {
        Self { bytes: value.to_le_bytes(), is_ptr }
    }

    pub fn from_u64(value: u64, is_ptr: bool) -> Self {
        Self { bytes: value.to_le_bytes(), is_ptr }
    }

    pub fn as_i64(&self) -> i64 {
        i64::from_le_bytes(self.bytes)
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.bytes)
    }
}

/// `SE_(io_vec)`: an initial program state, an expected post-call memory snapshot, an
/// expected return value, and an expected syscall set.
#[derive(Clone, Debug)]
pub struct IoVec {
    pub host_arch: Arch,
    pub host_endness: Endness,
    pub random_seed: u32,
    pub initial_state: ProgramState,
    pub expected_state: AddrRangeMap<u8>,
    pub return_value: ReturnValue,
    pub system_calls: BTreeSet<i64>,
}

impl Default for IoVec {
    fn default() -> Self {
        Self::new()
    }
}

impl IoVec {
    /// `SE_(create_io_vec)`.
    pub fn new() -> Self {
        Self {
            host_arch: Arch::X86_64,
            host_endness: Endness::Little,
            random_seed: 0,
            initial_state: ProgramState::new_with_arg_registers(),
            expected_state: AddrRangeMap::new(),
            return_value: ReturnValue::zero(),
            system_calls: BTreeSet::new(),
        }
    }

    /// `SE_(ppIOVec)`, returned as a string for the caller to log rather than printed
    /// directly.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        out.push_str(&"=".repeat(80));
        out.push('\n');
        out.push_str(&format!("host_arch:    {:?}\n", self.host_arch));
        out.push_str(&format!("host_endness: {:?}\n", self.host_endness));
        out.push_str(&format!("random_seed:  {}\n", self.random_seed));
        out.push_str(&format!(
            "return_value: 0x{:x} {}\n",
            self.return_value.as_u64(),
            if self.return_value.is_ptr { "O" } else { "X" }
        ));
        out.push_str("system_calls: ");
        for s in &self.system_calls {
            out.push_str(&format!("{} ", s));
        }
        out.push('\n');
        out.push_str("initial state:\n");
        out.push_str(&self.initial_state.pretty_print());
        out.push_str("expected state:\n");
        for (min, max, val) in self.expected_state.iter() {
            out.push_str(&format!("\t[ 0x{:x} -- 0x{:x} ] = 0x{:02x}\n", min, max, val));
        }
        out.push_str(&"=".repeat(80));
        out.push('\n');
        out
    }
}

/// `SE_(return_values_same)`: equality up to sign, not bitwise equality. Two non-pointer
/// return values match if they're both zero, both negative, or both positive; pointer-ness
/// must match exactly and pointer values are otherwise ignored (the harness cannot predict
/// a concrete heap address across runs).
pub fn return_values_same(a: &ReturnValue, b: &ReturnValue) -> bool {
    if a.is_ptr != b.is_ptr {
        return false;
    }
    if a.is_ptr {
        return true;
    }

    let (v1, v2) = (a.as_i64(), b.as_i64());
    match (v1.signum(), v2.signum()) {
        (x, y) if x == y => true,
        _ => false,
    }
}

/// `SE_(current_state_matches_expected)`. The caller supplies accessors for the actual
/// traced process's memory since this module has no process of its own to inspect.
///
/// - `read_byte(addr)`: read one byte of live client memory, `None` if unreadable.
/// - `read_word(addr)`: read `PTR_WIDTH` bytes as a little-endian `u64`, `None` if unreadable.
/// - `is_accessible(addr)`: true if `addr` is currently readable, writable, or executable by
///   the client (mirrors `VG_(am_is_valid_for_client)` read-or-write-or-exec).
pub fn current_state_matches_expected(
    io_vec: &IoVec,
    actual_return: &ReturnValue,
    actual_syscalls: &BTreeSet<i64>,
    mut read_byte: impl FnMut(u64) -> Option<u8>,
    mut read_word: impl FnMut(u64) -> Option<u64>,
    mut is_accessible: impl FnMut(u64) -> bool,
) -> bool {
    if !return_values_same(&io_vec.return_value, actual_return) {
        return false;
    }

    if actual_syscalls.len() != io_vec.system_calls.len() {
        return false;
    }
    if !actual_syscalls.iter().all(|s| io_vec.system_calls.contains(s)) {
        return false;
    }

    let mut in_obj = false;
    for (min, max, tag) in io_vec.initial_state.address_state.iter() {
        if tag.contains(ObjTag::OBJ_START) {
            in_obj = true;
        }
        if !tag.contains(ObjTag::OBJ_ALLOCATED) {
            in_obj = false;
        }

        if in_obj && !tag.contains(ObjTag::ALLOCATED_SUBPTR) {
            for addr in min..=max {
                let expected = io_vec.expected_state.lookup(addr).map(|(_, _, v)| *v).unwrap_or(0);
                match read_byte(addr) {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                }
            }
        } else if in_obj && tag.contains(ObjTag::ALLOCATED_SUBPTR) {
            let pointee = match read_word(min) {
                Some(v) => v,
                None => return false,
            };
            if !is_accessible(pointee) {
                return false;
            }
        }

        if tag.contains(ObjTag::OBJ_END) {
            in_obj = false;
        }
    }

    true
}

/// `SE_(translate_io_vec_to_host)`: copies `original` into `host`, truncating the register
/// list if the host uses fewer argument registers than the original was recorded with.
pub fn translate_to_host(original: &IoVec, host: &mut IoVec) {
    host.random_seed = original.random_seed;

    let host_reg_count = host.initial_state.register_state.len();
    let orig_reg_count = original.initial_state.register_state.len();
    let reg_count = if orig_reg_count > host_reg_count {
        warn!(
            "original IOVec has {} register values, host only uses {}; truncating",
            orig_reg_count, host_reg_count
        );
        host_reg_count
    } else {
        orig_reg_count
    };

    for i in 0..reg_count {
        host.initial_state.register_state[i].value = original.initial_state.register_state[i].value;
        host.initial_state.register_state[i].is_ptr = original.initial_state.register_state[i].is_ptr;
    }

    host.initial_state.address_state.copy_from(&original.initial_state.address_state);
    host.initial_state.pointer_member_locations.copy_from(&original.initial_state.pointer_member_locations);
    host.expected_state.copy_from(&original.expected_state);

    host.return_value = original.return_value.clone();
    host.system_calls = original.system_calls.clone();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_values_same_sign_triple() {
        assert!(return_values_same(&ReturnValue::from_i64(5, false), &ReturnValue::from_i64(9000, false)));
        assert!(return_values_same(&ReturnValue::from_i64(-1, false), &ReturnValue::from_i64(-9000, false)));
        assert!(return_values_same(&ReturnValue::from_i64(0, false), &ReturnValue::from_i64(0, false)));
        assert!(!return_values_same(&ReturnValue::from_i64(0, false), &ReturnValue::from_i64(1, false)));
        assert!(!return_values_same(&ReturnValue::from_i64(-1, false), &ReturnValue::from_i64(1, false)));
    }

    #[test]
    fn test_return_values_same_pointer_ignores_magnitude() {
        assert!(return_values_same(&ReturnValue::from_u64(0x4000, true), &ReturnValue::from_u64(0x9000, true)));
        assert!(!return_values_same(&ReturnValue::from_u64(0x4000, true), &ReturnValue::from_u64(0x4000, false)));
    }

    #[test]
    fn test_matches_expected_accepts_identical_bytes() {
        let mut io_vec = IoVec::new();
        io_vec.initial_state.address_state.insert(0x1000, 0x1007, ObjTag::OBJ_START | ObjTag::OBJ_ALLOCATED | ObjTag::OBJ_END);
        io_vec.expected_state.insert(0x1000, 0x1007, 0xAB);
        io_vec.return_value = ReturnValue::from_i64(0, false);

        let mem = [0xABu8; 8];
        let ok = current_state_matches_expected(
            &io_vec,
            &ReturnValue::from_i64(0, false),
            &BTreeSet::new(),
            |addr| Some(mem[(addr - 0x1000) as usize]),
            |_| None,
            |_| false,
        );
        assert!(ok);
    }

    #[test]
    fn test_matches_expected_rejects_byte_mismatch() {
        let mut io_vec = IoVec::new();
        io_vec.initial_state.address_state.insert(0x1000, 0x1000, ObjTag::OBJ_START | ObjTag::OBJ_ALLOCATED | ObjTag::OBJ_END);
        io_vec.expected_state.insert(0x1000, 0x1000, 0xAB);

        let ok = current_state_matches_expected(
            &io_vec,
            &ReturnValue::zero(),
            &BTreeSet::new(),
            |_| Some(0xCD),
            |_| None,
            |_| false,
        );
        assert!(!ok);
    }

    #[test]
    fn test_matches_expected_subptr_requires_accessible_pointee() {
        let mut io_vec = IoVec::new();
        io_vec.initial_state.address_state.insert(
            0x2000,
            0x2007,
            ObjTag::OBJ_START | ObjTag::OBJ_ALLOCATED | ObjTag::ALLOCATED_SUBPTR | ObjTag::OBJ_END,
        );

        let ok = current_state_matches_expected(
            &io_vec,
            &ReturnValue::zero(),
            &BTreeSet::new(),
            |_| None,
            |addr| if addr == 0x2000 { Some(0x3000) } else { None },
            |addr| addr == 0x3000,
        );
        assert!(ok);

        let rejected = current_state_matches_expected(
            &io_vec,
            &ReturnValue::zero(),
            &BTreeSet::new(),
            |_| None,
            |addr| if addr == 0x2000 { Some(0x3000) } else { None },
            |_| false,
        );
        assert!(!rejected);
    }

    #[test]
    fn test_translate_to_host_truncates_extra_registers() {
        let mut original = IoVec::new();
        original.initial_state.register_state.push(RegisterValue { guest_state_offset: 99, value: 42, is_ptr: false });
        original.random_seed = 7;

        let mut host = IoVec::new();
        translate_to_host(&original, &mut host);

        assert_eq!(host.random_seed, 7);
        assert_eq!(host.initial_state.register_state.len(), ARG_REGISTER_SLOTS.len());
    }
}
