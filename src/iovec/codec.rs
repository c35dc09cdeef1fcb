//! Binary (de)serialization of an [`IoVec`], mirroring `write_io_vec_to_buf`/
//! `read_io_vec_from_buf`. Every variable-length section is `[count: u64][entries...]`;
//! every fixed field is written in host-native byte order.

use std::collections::BTreeSet;
use std::convert::TryInto;

use anyhow::{anyhow, Result};

use super::{Arch, Endness, IoVec, ObjTag, ProgramState, RegisterValue, ReturnValue, PTR_WIDTH};

struct Writer(Vec<u8>);

impl Writer {
    fn new() -> Self {
        Self(Vec::new())
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_ne_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_ne_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.0.extend_from_slice(&v.to_ne_bytes());
    }
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.off + n > self.buf.len() {
            return Err(anyhow!("truncated IOVec buffer (wanted {} bytes at offset {})", n, self.off));
        }
        let slice = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

/// `SE_(write_io_vec_to_buf)`. Produces a self-contained, length-prefixed byte buffer.
pub fn write_io_vec(io_vec: &IoVec) -> Vec<u8> {
    let mut w = Writer::new();

    w.u32(io_vec.host_arch as u32);
    w.u32(io_vec.host_endness as u32);
    w.u32(io_vec.random_seed);

    w.u64(io_vec.initial_state.register_state.len() as u64);
    for reg in &io_vec.initial_state.register_state {
        w.i64(reg.guest_state_offset);
        w.u64(reg.value);
        w.u8(reg.is_ptr as u8);
    }

    w.u64(io_vec.initial_state.address_state.len() as u64);
    for (min, max, tag) in io_vec.initial_state.address_state.iter() {
        w.u64(min);
        w.u64(max);
        w.u64(tag.bits());
    }

    w.u64(io_vec.initial_state.pointer_member_locations.len() as u64);
    for (min, max, target) in io_vec.initial_state.pointer_member_locations.iter() {
        w.u64(min);
        w.u64(max);
        w.u64(*target);
    }

    w.u64(io_vec.expected_state.len() as u64);
    for (min, max, val) in io_vec.expected_state.iter() {
        w.u64(min);
        w.u64(max);
        w.u64(*val as u64);
    }

    w.u64(PTR_WIDTH as u64);
    w.bytes(&io_vec.return_value.bytes);
    w.u8(io_vec.return_value.is_ptr as u8);

    w.u64(io_vec.system_calls.len() as u64);
    for syscall in &io_vec.system_calls {
        w.i64(*syscall);
    }

    w.0
}

/// `SE_(read_io_vec_from_buf)`.
pub fn read_io_vec(bytes: &[u8]) -> Result<IoVec> {
    let mut r = Reader::new(bytes);

    let host_arch = match r.u32()? {
        0 => Arch::X86_64,
        other => return Err(anyhow!("unrecognized host_arch tag {}", other)),
    };
    let host_endness = match r.u32()? {
        0 => Endness::Little,
        1 => Endness::Big,
        other => return Err(anyhow!("unrecognized host_endness tag {}", other)),
    };
    let random_seed = r.u32()?;

    let reg_count = r.u64()?;
    let mut register_state = Vec::with_capacity(reg_count as usize);
    for _ in 0..reg_count {
        let guest_state_offset = r.i64()?;
        let value = r.u64()?;
        let is_ptr = r.u8()? != 0;
        register_state.push(RegisterValue { guest_state_offset, value, is_ptr });
    }

    let mut address_state = super::AddrRangeMap::new();
    let addr_count = r.u64()?;
    for _ in 0..addr_count {
        let min = r.u64()?;
        let max = r.u64()?;
        let bits = r.u64()?;
        let tag = ObjTag::from_bits(bits).ok_or_else(|| anyhow!("unrecognized ObjTag bits 0x{:x}", bits))?;
        address_state.insert(min, max, tag);
    }

    let mut pointer_member_locations = super::AddrRangeMap::new();
    let ptr_count = r.u64()?;
    for _ in 0..ptr_count {
        let min = r.u64()?;
        let max = r.u64()?;
        let target = r.u64()?;
        pointer_member_locations.insert(min, max, target);
    }

    let mut expected_state = super::AddrRangeMap::new();
    let exp_count = r.u64()?;
    for _ in 0..exp_count {
        let min = r.u64()?;
        let max = r.u64()?;
        let val = r.u64()? as u8;
        expected_state.insert(min, max, val);
    }

    let return_len = r.u64()? as usize;
    if return_len != PTR_WIDTH {
        return Err(anyhow!("unsupported return value width {} (expected {})", return_len, PTR_WIDTH));
    }
    let return_bytes = r.take(PTR_WIDTH)?;
    let mut bytes = [0u8; PTR_WIDTH];
    bytes.copy_from_slice(return_bytes);
    let is_ptr = r.u8()? != 0;
    let return_value = ReturnValue { bytes, is_ptr };

    let syscall_count = r.u64()?;
    let mut system_calls = BTreeSet::new();
    for _ in 0..syscall_count {
        system_calls.insert(r.i64()?);
    }

    Ok(IoVec {
        host_arch,
        host_endness,
        random_seed,
        initial_state: ProgramState { register_state, address_state, pointer_member_locations },
        expected_state,
        return_value,
        system_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iovec::ARG_REGISTER_SLOTS;

    #[test]
    fn test_roundtrip_default() {
        let io_vec = IoVec::new();
        let bytes = write_io_vec(&io_vec);
        let back = read_io_vec(&bytes).expect("decode");

        assert_eq!(back.host_arch, io_vec.host_arch);
        assert_eq!(back.host_endness, io_vec.host_endness);
        assert_eq!(back.random_seed, io_vec.random_seed);
        assert_eq!(back.initial_state.register_state.len(), ARG_REGISTER_SLOTS.len());
        assert_eq!(back.return_value, io_vec.return_value);
    }

    #[test]
    fn test_roundtrip_populated() {
        let mut io_vec = IoVec::new();
        io_vec.random_seed = 0xdead_beef;
        io_vec.initial_state.register_state[0].value = 0x4141_4141;
        io_vec.initial_state.register_state[0].is_ptr = true;
        io_vec.initial_state.address_state.insert(0x1000, 0x1007, ObjTag::OBJ_START | ObjTag::OBJ_ALLOCATED | ObjTag::OBJ_END);
        io_vec.initial_state.pointer_member_locations.insert(0x2000, 0x2007, 0x3000);
        io_vec.expected_state.insert(0x1000, 0x1000, 0x41);
        io_vec.return_value = ReturnValue::from_i64(-7, false);
        io_vec.system_calls.insert(0);
        io_vec.system_calls.insert(231);

        let bytes = write_io_vec(&io_vec);
        let back = read_io_vec(&bytes).expect("decode");

        assert_eq!(back.random_seed, 0xdead_beef);
        assert_eq!(back.initial_state.register_state[0].value, 0x4141_4141);
        assert!(back.initial_state.register_state[0].is_ptr);
        assert_eq!(back.initial_state.address_state.lookup(0x1003).unwrap().2.bits(), ObjTag::OBJ_START.bits() | ObjTag::OBJ_ALLOCATED.bits() | ObjTag::OBJ_END.bits());
        assert_eq!(back.initial_state.pointer_member_locations.lookup(0x2000), Some((0x2000, 0x2007, &0x3000)));
        assert_eq!(back.expected_state.lookup(0x1000), Some((0x1000, 0x1000, &0x41)));
        assert_eq!(back.return_value.as_i64(), -7);
        assert_eq!(back.system_calls, io_vec.system_calls);
    }

    #[test]
    fn test_truncated_buffer_errors() {
        let io_vec = IoVec::new();
        let mut bytes = write_io_vec(&io_vec);
        bytes.truncate(bytes.len() - 4);

        assert!(read_io_vec(&bytes).is_err());
    }
}
