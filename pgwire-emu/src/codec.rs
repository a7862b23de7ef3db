//! Wire framing: length-prefixed, big-endian message boundaries.
//!
//! A typed frame is `(type: u8, length: u32, payload: bytes)` where `length`
//! counts itself plus the payload (`4 + |payload|`). The very first frame of
//! a session is untyped (no leading type byte) and is read with
//! [`Codec::try_decode_startup`] instead of [`Codec::try_decode`].
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Default ceiling on a single frame's declared length, bounding allocation
/// from an adversarial or buggy peer. See [`Codec::with_max_frame_len`].
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

const READ_GROWTH: usize = 8 * 1024;

/// Buffered read/write halves of a session's wire connection.
///
/// `Codec` owns no socket; the reactor feeds bytes in via [`Codec::read_buf_mut`]
/// and drains [`Codec::write_buf_mut`] to the socket. This keeps the codec
/// free of I/O and trivially unit-testable.
#[derive(Debug)]
pub struct Codec {
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_frame_len: u32,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: u32) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(READ_GROWTH),
            write_buf: BytesMut::with_capacity(READ_GROWTH),
            max_frame_len,
        }
    }

    pub fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    pub fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    pub fn write_buf(&self) -> &BytesMut {
        &self.write_buf
    }

    /// Ensure there is room to read more bytes without reallocating every call.
    pub fn reserve_read(&mut self) {
        if self.read_buf.spare_capacity_mut().is_empty() {
            self.read_buf.reserve(READ_GROWTH);
        }
    }

    /// Try to pull one typed frame out of the read buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds an incomplete frame (the
    /// caller should read more bytes and retry); a frame never leaks
    /// partially across two calls.
    pub fn try_decode(&mut self) -> Result<Option<(u8, Bytes)>, ProtocolError> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }

        let msgtype = self.read_buf[0];
        let len = u32::from_be_bytes([
            self.read_buf[1], self.read_buf[2], self.read_buf[3], self.read_buf[4],
        ]);

        let (body_len, total) = validate_len(len, self.max_frame_len)?;

        if self.read_buf.len() < total {
            return Ok(None);
        }

        self.read_buf.advance(5);
        let body = self.read_buf.split_to(body_len).freeze();
        Ok(Some((msgtype, body)))
    }

    /// Try to pull the untyped startup-class frame (StartupMessage,
    /// SSLRequest, CancelRequest, GSSENCRequest) out of the read buffer.
    pub fn try_decode_startup(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.read_buf[0], self.read_buf[1], self.read_buf[2], self.read_buf[3],
        ]);

        let (body_len, total) = validate_len(len, self.max_frame_len)?;

        if self.read_buf.len() < total {
            return Ok(None);
        }

        self.read_buf.advance(4);
        let body = self.read_buf.split_to(body_len).freeze();
        Ok(Some(body))
    }

    /// Queue a backend message for the next flush. See [`crate::response`].
    pub fn send<E: Encode>(&mut self, msg: E) {
        write_frame(msg, &mut self.write_buf);
    }
}

/// `length` must cover itself; `4 <= length <= max_frame_len`.
fn validate_len(len: u32, max_frame_len: u32) -> Result<(usize, usize), ProtocolError> {
    if len < 4 {
        return Err(ProtocolError::violation(format!("invalid frame length {len}")));
    }
    if len > max_frame_len {
        return Err(ProtocolError::violation(format!(
            "frame length {len} exceeds configured maximum {max_frame_len}"
        )));
    }
    let body_len = (len - 4) as usize;
    Ok((body_len, 4 + body_len))
}

/// A type that can be encoded into a backend wire message.
///
/// Mirrors the teacher's frontend-message encode trait, mirrored onto
/// backend messages: a server emits these instead of a client's requests.
pub trait Encode {
    /// The message type byte, e.g. `b'Z'` for `ReadyForQuery`.
    const MSGTYPE: u8;

    /// Size of the body only (excludes the type byte and the length itself).
    fn size_hint(&self) -> u32;

    /// Write the body. Must write exactly [`Encode::size_hint`] bytes.
    fn encode(self, buf: &mut BytesMut);
}

/// Checked typed-field primitives for reading a message payload.
///
/// [`bytes::Buf`]'s own getters panic on truncation; a payload's field
/// lengths are attacker-controlled, so every read here is checked and turns
/// a short buffer into a `08P01` [`ProtocolError`] instead of a panic.
pub mod field {
    use super::*;
    use crate::{common::ByteStr, ext::BytesExt};

    pub fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::violation("truncated byte field"));
        }
        Ok(buf.get_u8())
    }

    pub fn get_i16(buf: &mut Bytes) -> Result<i16, ProtocolError> {
        if buf.remaining() < 2 {
            return Err(ProtocolError::violation("truncated int16 field"));
        }
        Ok(buf.get_i16())
    }

    pub fn get_i32(buf: &mut Bytes) -> Result<i32, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::violation("truncated int32 field"));
        }
        Ok(buf.get_i32())
    }

    pub fn get_u32(buf: &mut Bytes) -> Result<u32, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::violation("truncated int32 field"));
        }
        Ok(buf.get_u32())
    }

    /// `Byte[n]`: the next `n` bytes verbatim.
    pub fn get_byten(buf: &mut Bytes, n: usize) -> Result<Bytes, ProtocolError> {
        if buf.remaining() < n {
            return Err(ProtocolError::violation("declared length exceeds remaining payload"));
        }
        Ok(buf.split_to(n))
    }

    /// `String`: NUL-terminated, forbids embedded NUL.
    pub fn get_cstr(buf: &mut Bytes) -> Result<ByteStr, ProtocolError> {
        buf.get_nul_bytestr()
    }

    /// `Int16` count followed by `count` elements, each read by `f`.
    pub fn get_array<T>(
        buf: &mut Bytes,
        mut f: impl FnMut(&mut Bytes) -> Result<T, ProtocolError>,
    ) -> Result<Vec<T>, ProtocolError> {
        let count = get_i16(buf)?;
        if count < 0 {
            return Err(ProtocolError::violation("negative array count"));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(f(buf)?);
        }
        Ok(out)
    }
}

/// Write a backend message to `buf`: type byte, length, then body.
pub fn write_frame<E: Encode>(msg: E, buf: &mut BytesMut) {
    const PREFIX: usize = 1 + 4;

    let size_hint = msg.size_hint();
    buf.reserve(PREFIX + size_hint as usize);

    let offset = buf.len();
    buf.put_u8(E::MSGTYPE);
    buf.put_u32(4 + size_hint);

    msg.encode(buf);

    debug_assert_eq!(
        buf.len() - offset,
        PREFIX + size_hint as usize,
        "backend message body size did not match size_hint",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let mut codec = Codec::new();
        codec.read_buf_mut().extend_from_slice(&[b'Q', 0, 0, 0]);
        assert!(codec.try_decode().unwrap().is_none());
    }

    #[test]
    fn complete_frame_decodes_and_drains_buffer() {
        let mut codec = Codec::new();
        codec.read_buf_mut().extend_from_slice(&[b'Q', 0, 0, 0, 6, b'h', b'i']);
        let (msgtype, body) = codec.try_decode().unwrap().unwrap();
        assert_eq!(msgtype, b'Q');
        assert_eq!(&body[..], b"hi");
        assert!(codec.read_buf_mut().is_empty());
    }

    #[test]
    fn frame_crossing_boundary_does_not_leak() {
        let mut codec = Codec::new();
        codec.read_buf_mut().extend_from_slice(&[b'Q', 0, 0, 0, 6, b'h']);
        assert!(codec.try_decode().unwrap().is_none());
        codec.read_buf_mut().extend_from_slice(b"i");
        let (msgtype, body) = codec.try_decode().unwrap().unwrap();
        assert_eq!(msgtype, b'Q');
        assert_eq!(&body[..], b"hi");
    }

    #[test]
    fn length_below_four_is_a_violation() {
        let mut codec = Codec::new();
        codec.read_buf_mut().extend_from_slice(&[b'Q', 0, 0, 0, 2]);
        let err = codec.try_decode().unwrap_err();
        assert_eq!(err.sqlstate, "08P01");
    }

    #[test]
    fn oversize_length_is_a_violation() {
        let mut codec = Codec::with_max_frame_len(16);
        codec.read_buf_mut().extend_from_slice(&[b'Q', 0, 0, 0, 255]);
        let err = codec.try_decode().unwrap_err();
        assert_eq!(err.sqlstate, "08P01");
    }

    #[test]
    fn empty_payload_frame_decodes() {
        let mut codec = Codec::new();
        codec.read_buf_mut().extend_from_slice(&[b'S', 0, 0, 0, 4]);
        let (msgtype, body) = codec.try_decode().unwrap().unwrap();
        assert_eq!(msgtype, b'S');
        assert!(body.is_empty());
    }

    #[test]
    fn startup_frame_has_no_type_byte() {
        let mut codec = Codec::new();
        codec.read_buf_mut().extend_from_slice(&[0, 0, 0, 8, 4, 210, 22, 47]);
        let body = codec.try_decode_startup().unwrap().unwrap();
        assert_eq!(&body[..], &[4, 210, 22, 47]);
    }
}
