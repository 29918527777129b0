//! Growable Byte Buffer With Independent Cursors
//!
//! [`ChannelBuffer`] is a thin cursor layer over `BytesMut`. The `BytesMut`
//! length is the writer index; the reader index and its mark are tracked
//! alongside it. Growing the buffer is delegated to `BytesMut::reserve`, and
//! compaction ([`ChannelBuffer::discard_read_bytes`]) is a cheap `advance` that
//! lets `BytesMut` reclaim the space on its next reservation.
//!
//! A buffer is owned by exactly one thread at a time (the worker that owns
//! the channel), so nothing here is synchronized.

use crate::error::{NetError, NetResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Default capacity for buffers created with [`ChannelBuffer::new`].
const DEFAULT_CAPACITY: usize = 256;

/// A growable byte buffer with separate reader and writer indices.
///
/// # Example
///
/// ```
/// use netpipe::buffer::ChannelBuffer;
///
/// let mut buf = ChannelBuffer::new();
/// buf.write_i32(0); // placeholder for a length header
/// buf.write_bytes(b"payload");
/// let body_len = (buf.writer_index() - 4) as i32;
/// buf.set_i32(0, body_len).unwrap();
///
/// assert_eq!(buf.read_i32().unwrap(), 7);
/// assert_eq!(buf.readable_bytes(), 7);
/// ```
#[derive(Clone, Default)]
pub struct ChannelBuffer {
    /// Written bytes; `data.len()` is the writer index
    data: BytesMut,

    /// Offset of the next byte to read
    reader_index: usize,

    /// Saved reader index for speculative reads
    marked_reader_index: usize,
}

impl ChannelBuffer {
    /// Creates an empty buffer with a small default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty buffer able to hold `capacity` bytes without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            reader_index: 0,
            marked_reader_index: 0,
        }
    }

    /// Number of bytes the buffer can hold before it has to grow.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.data.len()
    }

    /// Moves the reader index to an absolute position.
    ///
    /// Fails if `index` is past the writer index.
    pub fn set_reader_index(&mut self, index: usize) -> NetResult<()> {
        if index > self.writer_index() {
            return Err(NetError::IndexOutOfBounds {
                index,
                len: 0,
                limit: self.writer_index(),
            });
        }
        self.reader_index = index;
        Ok(())
    }

    /// Number of bytes between the reader and writer indices.
    pub fn readable_bytes(&self) -> usize {
        self.data.len() - self.reader_index
    }

    /// Returns true if at least one byte can be read.
    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Remembers the current reader index.
    pub fn mark_reader_index(&mut self) {
        self.marked_reader_index = self.reader_index;
    }

    /// Rewinds the reader index to the last mark.
    pub fn reset_reader_index(&mut self) {
        self.reader_index = self.marked_reader_index;
    }

    /// Discards everything written, resetting both cursors and the mark.
    pub fn clear(&mut self) {
        self.data.clear();
        self.reader_index = 0;
        self.marked_reader_index = 0;
    }

    /// Slides the unread region to offset 0.
    ///
    /// Both cursors (and the mark) move down by the old reader index, so the
    /// readable content is unchanged.
    pub fn discard_read_bytes(&mut self) {
        if self.reader_index == 0 {
            return;
        }
        let discarded = self.reader_index;
        self.data.advance(discarded);
        self.marked_reader_index = self.marked_reader_index.saturating_sub(discarded);
        self.reader_index = 0;
    }

    /// The readable region as a slice.
    pub fn as_readable(&self) -> &[u8] {
        &self.data[self.reader_index..]
    }

    /// Finds `needle` in the readable region.
    ///
    /// Returns its offset relative to the reader index.
    pub fn index_of(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() {
            return Some(0);
        }
        self.as_readable()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    // ========================================================================
    // Relative reads
    // ========================================================================

    fn ensure_readable(&self, requested: usize) -> NetResult<()> {
        let readable = self.readable_bytes();
        if requested > readable {
            return Err(NetError::BufferUnderflow {
                requested,
                readable,
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> NetResult<u8> {
        self.ensure_readable(1)?;
        let value = self.data[self.reader_index];
        self.reader_index += 1;
        Ok(value)
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> NetResult<u16> {
        let value = self.get_u16_at(self.reader_index).map_err(|_| NetError::BufferUnderflow {
            requested: 2,
            readable: self.readable_bytes(),
        })?;
        self.reader_index += 2;
        Ok(value)
    }

    /// Reads a big-endian `i32`.
    pub fn read_i32(&mut self) -> NetResult<i32> {
        self.ensure_readable(4)?;
        let value = self.get_i32_at(self.reader_index)?;
        self.reader_index += 4;
        Ok(value)
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> NetResult<u32> {
        self.read_i32().map(|v| v as u32)
    }

    /// Reads `len` bytes into a new buffer, advancing the reader index.
    pub fn read_bytes(&mut self, len: usize) -> NetResult<ChannelBuffer> {
        self.ensure_readable(len)?;
        let start = self.reader_index;
        let frame = ChannelBuffer::from(&self.data[start..start + len]);
        self.reader_index += len;
        Ok(frame)
    }

    /// Advances the reader index by `len` bytes without copying them.
    pub fn skip_bytes(&mut self, len: usize) -> NetResult<()> {
        self.ensure_readable(len)?;
        self.reader_index += len;
        Ok(())
    }

    // ========================================================================
    // Relative writes
    // ========================================================================

    /// Appends `src`, growing the buffer if needed.
    pub fn write_bytes(&mut self, src: &[u8]) {
        self.data.extend_from_slice(src);
    }

    /// Moves every readable byte of `src` into this buffer.
    pub fn write_buffer(&mut self, src: &mut ChannelBuffer) {
        self.write_bytes(src.as_readable());
        src.reader_index = src.writer_index();
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Appends a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    /// Appends a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.data.put_i32(value);
    }

    /// Appends a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    // ========================================================================
    // Absolute access
    // ========================================================================

    fn check_index(&self, index: usize, len: usize) -> NetResult<()> {
        let limit = self.writer_index();
        if index.checked_add(len).map_or(true, |end| end > limit) {
            return Err(NetError::IndexOutOfBounds { index, len, limit });
        }
        Ok(())
    }

    pub fn get_u8_at(&self, index: usize) -> NetResult<u8> {
        self.check_index(index, 1)?;
        Ok(self.data[index])
    }

    /// Reads a big-endian `u16` at an absolute offset.
    pub fn get_u16_at(&self, index: usize) -> NetResult<u16> {
        self.check_index(index, 2)?;
        Ok(u16::from_be_bytes([self.data[index], self.data[index + 1]]))
    }

    /// Reads a big-endian `i32` at an absolute offset.
    pub fn get_i32_at(&self, index: usize) -> NetResult<i32> {
        self.check_index(index, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.data[index..index + 4]);
        Ok(i32::from_be_bytes(raw))
    }

    /// Overwrites a big-endian `i32` at an absolute offset.
    ///
    /// The target range must already be written; neither cursor moves.
    pub fn set_i32(&mut self, index: usize, value: i32) -> NetResult<()> {
        self.check_index(index, 4)?;
        self.data[index..index + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn set_u8(&mut self, index: usize, value: u8) -> NetResult<()> {
        self.check_index(index, 1)?;
        self.data[index] = value;
        Ok(())
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    /// Copies the readable region into an immutable `Bytes`.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_readable())
    }

    /// Converts the readable region into `Bytes` without copying.
    pub fn into_bytes(mut self) -> Bytes {
        self.data.advance(self.reader_index);
        self.data.freeze()
    }

    /// Decodes the readable region as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_readable()).into_owned()
    }
}

impl Buf for ChannelBuffer {
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    fn chunk(&self) -> &[u8] {
        self.as_readable()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.readable_bytes(),
            "cannot advance past the writer index: {} > {}",
            cnt,
            self.readable_bytes()
        );
        self.reader_index += cnt;
    }
}

impl From<&[u8]> for ChannelBuffer {
    fn from(src: &[u8]) -> Self {
        Self::from(BytesMut::from(src))
    }
}

impl From<&str> for ChannelBuffer {
    fn from(src: &str) -> Self {
        Self::from(src.as_bytes())
    }
}

impl From<Vec<u8>> for ChannelBuffer {
    fn from(src: Vec<u8>) -> Self {
        Self::from(BytesMut::from(&src[..]))
    }
}

impl From<Bytes> for ChannelBuffer {
    fn from(src: Bytes) -> Self {
        Self::from(&src[..])
    }
}

impl From<BytesMut> for ChannelBuffer {
    fn from(data: BytesMut) -> Self {
        Self {
            data,
            reader_index: 0,
            marked_reader_index: 0,
        }
    }
}

/// Two buffers are equal when their readable regions are equal.
impl PartialEq for ChannelBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_readable() == other.as_readable()
    }
}

impl Eq for ChannelBuffer {}

impl fmt::Debug for ChannelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelBuffer(ridx: {}, widx: {}, cap: {})",
            self.reader_index,
            self.writer_index(),
            self.capacity()
        )
    }
}
