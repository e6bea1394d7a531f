//! Binary message framing
//!
//! Every frame starts with a message type byte followed by a type specific
//! payload. Numbers are little endian, strings carry a one byte length.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::geom::Vec2;

/// Initial size of a writer's buffer
pub const STREAM_CAPACITY: usize = 32 * 1024;
const MAX_STRING_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is empty")]
    Empty,
    #[error("frame ended early, {needed} more bytes expected")]
    UnexpectedEof { needed: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("message type {0} is not accepted here")]
    Unexpected(u8),
    #[error("string is not valid utf-8")]
    InvalidString,
}

/// Growable output buffer. Taking a frame keeps the allocation for the next one.
#[derive(Debug)]
pub struct MsgWriter {
    buf: BytesMut,
}

impl MsgWriter {
    pub fn new() -> Self {
        Self::with_capacity(STREAM_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn write_vec2(&mut self, v: Vec2) {
        self.write_f32(v.x);
        self.write_f32(v.y);
    }

    /// Strings longer than 255 bytes are cut at the last char boundary that fits
    pub fn write_string(&mut self, s: &str) {
        let mut end = s.len().min(MAX_STRING_LEN);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_u8(end as u8);
        self.buf.put_slice(&s.as_bytes()[..end]);
    }

    /// Hand out everything written so far
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl Default for MsgWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over one received frame
#[derive(Debug)]
pub struct MsgReader<'a> {
    buf: &'a [u8],
}

impl<'a> MsgReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::UnexpectedEof {
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_vec2(&mut self) -> Result<Vec2, ProtocolError> {
        Ok(Vec2::new(self.read_f32()?, self.read_f32()?))
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u8()? as usize;
        self.need(len)?;
        let (text, rest) = self.buf.split_at(len);
        self.buf = rest;
        std::str::from_utf8(text)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidString)
    }
}
