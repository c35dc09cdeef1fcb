//! Wire framing for the command pipe (driver ↔ server) and the executor pipe
//! (server ↔ forked child). Every frame is `[tag: u32][length: u32][payload: length]`,
//! written and read in host-native byte order; cross-host exchange is not supported.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use anyhow::{anyhow, Result};

/// A non-owning `Read + Write` handle over a raw file descriptor: unlike `std::fs::File`, it
/// never closes the descriptor on drop, since the command pipe and executor pipe fds outlive
/// any one `Message` exchange and are closed explicitly by their owner.
pub struct FdStream(pub RawFd);

fn to_io_error(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.0, buf).map_err(to_io_error)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(to_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The set of messages that can cross the command pipe or the executor pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Tag {
    Ready = 0,
    Ack = 1,
    Ok = 2,
    Fail = 3,
    SetTgt = 4,
    SetSoTgt = 5,
    Exit = 6,
    Fuzz = 7,
    Execute = 8,
    SetCtx = 9,
    Reset = 10,
    Coverage = 11,
    NewAlloc = 12,
    FetchInitialState = 13,
}

impl TryFrom<u32> for Tag {
    type Error = anyhow::Error;

    fn try_from(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Tag::Ready,
            1 => Tag::Ack,
            2 => Tag::Ok,
            3 => Tag::Fail,
            4 => Tag::SetTgt,
            5 => Tag::SetSoTgt,
            6 => Tag::Exit,
            7 => Tag::Fuzz,
            8 => Tag::Execute,
            9 => Tag::SetCtx,
            10 => Tag::Reset,
            11 => Tag::Coverage,
            12 => Tag::NewAlloc,
            13 => Tag::FetchInitialState,
            other => return Err(anyhow!("unrecognized message tag: {}", other)),
        })
    }
}

/// A single framed message: a tag plus an opaque, tag-defined payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn empty(tag: Tag) -> Self {
        Self { tag, payload: Vec::new() }
    }

    pub fn ok(payload: Vec<u8>) -> Self {
        Self { tag: Tag::Ok, payload }
    }

    /// A `FAIL` message carrying a human-readable reason, mirroring the original's
    /// `SE_(create_cmd_msg)(SEMSG_FAIL, msg_len, msg)`.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self { tag: Tag::Fail, payload: reason.into().into_bytes() }
    }

    pub fn fail_empty() -> Self {
        Self::empty(Tag::Fail)
    }

    /// Interprets the payload as a UTF-8 failure reason, if any was attached.
    pub fn reason(&self) -> Option<String> {
        if self.payload.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.payload).into_owned())
        }
    }
}

/// Retries a write until `buf` is fully written, treating `Interrupted` as retryable.
/// Mirrors the "partial writes are retried internally" requirement.
fn write_all_retrying(w: &mut impl Write, buf: &[u8]) -> io::Result<()> {
    let mut off = 0;
    while off < buf.len() {
        match w.write(&buf[off..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "short write")),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Retries a read until `buf` is fully filled, treating `Interrupted` as retryable.
/// Returns `Ok(false)` on a clean EOF with zero bytes read so far (the "short read after
/// EOF" case), `Ok(true)` on success.
fn read_exact_retrying(r: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut off = 0;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => {
                return if off == 0 {
                    Ok(false)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "frame truncated mid-read",
                    ))
                };
            }
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Writes one framed message. Returns the number of bytes written (tag + length + payload).
pub fn write_message(w: &mut impl Write, msg: &Message) -> Result<usize> {
    let tag = msg.tag as u32;
    let len = msg.payload.len() as u32;

    let mut header = Vec::with_capacity(8);
    header.extend_from_slice(&tag.to_ne_bytes());
    header.extend_from_slice(&len.to_ne_bytes());

    write_all_retrying(w, &header)?;
    write_all_retrying(w, &msg.payload)?;
    w.flush()?;

    Ok(header.len() + msg.payload.len())
}

/// Reads one framed message. A short read after EOF or a malformed tag yields the `nil`
/// message (`Fail` with no payload) rather than an error, matching the original's
/// "caller surfaces it as FAIL" behavior.
pub fn read_message(r: &mut impl Read) -> Result<Message> {
    let mut tag_buf = [0u8; 4];
    if !read_exact_retrying(r, &mut tag_buf)? {
        return Ok(Message::fail_empty());
    }
    let raw_tag = u32::from_ne_bytes(tag_buf);
    let tag = match Tag::try_from(raw_tag) {
        Ok(t) => t,
        Err(_) => return Ok(Message::fail_empty()),
    };

    let mut len_buf = [0u8; 4];
    if !read_exact_retrying(r, &mut len_buf)? {
        return Ok(Message::fail_empty());
    }
    let len = u32::from_ne_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if len > 0 && !read_exact_retrying(r, &mut payload)? {
        return Ok(Message::fail_empty());
    }

    Ok(Message { tag, payload })
}

/// The type tag attached to a [`MemoizedObject`], mirroring `SE_(memoized_object_t)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    IoVec,
    OSetWord,
    ReturnValue,
    ArchState,
}

/// A typed, length-prefixed blob, used to carry sets and IOVecs inside a [`Message`] payload.
#[derive(Clone, Debug)]
pub struct MemoizedObject {
    pub kind: ObjectKind,
    pub bytes: Vec<u8>,
}

impl MemoizedObject {
    pub fn new(kind: ObjectKind, bytes: Vec<u8>) -> Self {
        Self { kind, bytes }
    }
}

/// Serializes a syscall set as `[count: usize][value: i64]*`, mirroring
/// `SE_(Memoize_OSetWord)`.
pub fn memoize_oset(values: &std::collections::BTreeSet<i64>) -> MemoizedObject {
    let mut bytes = Vec::with_capacity(8 + values.len() * 8);
    bytes.extend_from_slice(&(values.len() as u64).to_ne_bytes());
    for v in values {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    MemoizedObject::new(ObjectKind::OSetWord, bytes)
}

pub fn read_memoized_oset(bytes: &[u8]) -> Result<std::collections::BTreeSet<i64>> {
    if bytes.len() < 8 {
        return Err(anyhow!("truncated OSetWord payload"));
    }
    let count = u64::from_ne_bytes(bytes[0..8].try_into().unwrap()) as usize;
    let mut out = std::collections::BTreeSet::new();
    let mut off = 8;
    for _ in 0..count {
        if off + 8 > bytes.len() {
            return Err(anyhow!("truncated OSetWord entry"));
        }
        out.insert(i64::from_ne_bytes(bytes[off..off + 8].try_into().unwrap()));
        off += 8;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).expect("write");
        let mut cursor = io::Cursor::new(buf);
        let read_back = read_message(&mut cursor).expect("read");
        assert_eq!(read_back, msg);
    }

    #[test]
    fn test_roundtrip_all_tags_empty_payload() {
        for tag in [
            Tag::Ready,
            Tag::Ack,
            Tag::Ok,
            Tag::Fail,
            Tag::SetTgt,
            Tag::SetSoTgt,
            Tag::Exit,
            Tag::Fuzz,
            Tag::Execute,
            Tag::SetCtx,
            Tag::Reset,
            Tag::Coverage,
            Tag::NewAlloc,
            Tag::FetchInitialState,
        ] {
            roundtrip(Message::empty(tag));
        }
    }

    #[test]
    fn test_roundtrip_with_payload() {
        roundtrip(Message::fail("timed out"));
        roundtrip(Message { tag: Tag::SetTgt, payload: b"target_fn".to_vec() });
    }

    #[test]
    fn test_malformed_tag_yields_fail() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&999u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());

        let mut cursor = io::Cursor::new(buf);
        let msg = read_message(&mut cursor).expect("read should not error");
        assert_eq!(msg, Message::fail_empty());
    }

    #[test]
    fn test_eof_before_header_yields_fail() {
        let mut cursor = io::Cursor::new(Vec::<u8>::new());
        let msg = read_message(&mut cursor).expect("read should not error");
        assert_eq!(msg, Message::fail_empty());
    }

    #[test]
    fn test_oset_roundtrip() {
        let mut set = std::collections::BTreeSet::new();
        set.insert(0i64);
        set.insert(57i64);
        set.insert(231i64);

        let memo = memoize_oset(&set);
        let back = read_memoized_oset(&memo.bytes).expect("decode");
        assert_eq!(back, set);
    }
}
