//! Positioned byte streams.
//!
//! [`ContentReader`] and [`ContentWriter`] are the sequential halves used by
//! full reads and writes. [`RandomIo`] adds positioning for in-place partial
//! writes and pointer walking. All multi-byte words are little-endian.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;

use crate::error::{StoreError, StoreResult};
use crate::varint::{encode_varint, VarintDecoder};

/// Sequential source of bytes with exact-length semantics.
///
/// A short read is an error, never a partial success.
pub trait ContentReader {
    /// Fill `buf` completely or fail with [`StoreError::UnexpectedEof`].
    fn read_exact(&mut self, buf: &mut [u8]) -> StoreResult<()>;

    /// Advance past `n` bytes without returning them.
    fn skip_exact(&mut self, n: u64) -> StoreResult<()> {
        let mut scratch = [0u8; 256];
        let mut left = n;
        while left > 0 {
            let step = left.min(scratch.len() as u64) as usize;
            self.read_exact(&mut scratch[..step])?;
            left -= step as u64;
        }
        Ok(())
    }

    /// Read `len` bytes whose length came from the stream itself.
    ///
    /// The buffer grows in bounded steps, so a corrupt length fails with
    /// [`StoreError::UnexpectedEof`] once the input runs out instead of
    /// reserving `len` bytes up front.
    fn read_bytes(&mut self, len: u64) -> StoreResult<Vec<u8>> {
        const STEP: u64 = 64 * 1024;
        let mut bytes = Vec::with_capacity(len.min(STEP) as usize);
        let mut left = len;
        while left > 0 {
            let step = left.min(STEP) as usize;
            let start = bytes.len();
            bytes.resize(start + step, 0);
            self.read_exact(&mut bytes[start..]).map_err(|err| match err {
                StoreError::UnexpectedEof { available, .. } => StoreError::UnexpectedEof {
                    needed: len,
                    available: start as u64 + available,
                },
                other => other,
            })?;
            left -= step as u64;
        }
        Ok(bytes)
    }

    fn read_u8(&mut self) -> StoreResult<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Read an unsigned little-endian word of `width` bytes (at most 8).
    fn read_word(&mut self, width: u64) -> StoreResult<u64> {
        if width > 8 {
            return Err(StoreError::InvalidWordWidth(width));
        }
        let mut b = [0u8; 8];
        self.read_exact(&mut b[..width as usize])?;
        Ok(u64::from_le_bytes(b))
    }

    fn read_u32_le(&mut self) -> StoreResult<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    fn read_u64_le(&mut self) -> StoreResult<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    fn read_varint(&mut self) -> StoreResult<u64> {
        let mut decoder = VarintDecoder::default();
        loop {
            if let Some(value) = decoder.push(self.read_u8()?)? {
                return Ok(value);
            }
        }
    }
}

/// Sequential sink of bytes.
pub trait ContentWriter {
    fn write_all(&mut self, buf: &[u8]) -> StoreResult<()>;

    fn write_u8(&mut self, value: u8) -> StoreResult<()> {
        self.write_all(&[value])
    }

    /// Write the low `width` bytes of `value` little-endian (at most 8).
    fn write_word(&mut self, width: u64, value: u64) -> StoreResult<()> {
        if width > 8 {
            return Err(StoreError::InvalidWordWidth(width));
        }
        self.write_all(&value.to_le_bytes()[..width as usize])
    }

    fn write_u32_le(&mut self, value: u32) -> StoreResult<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_u64_le(&mut self, value: u64) -> StoreResult<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_varint(&mut self, value: u64) -> StoreResult<()> {
        let mut buf = Vec::with_capacity(10);
        encode_varint(&mut buf, value);
        self.write_all(&buf)
    }
}

/// A seekable stream that can be both read and written.
pub trait RandomIo: ContentReader + ContentWriter {
    fn position(&self) -> u64;

    /// Move the cursor. Positions past the end are allowed; a later write
    /// zero-fills the gap.
    fn set_position(&mut self, pos: u64);

    fn size(&self) -> u64;

    /// Truncate or zero-extend the stream.
    fn set_size(&mut self, size: u64) -> StoreResult<()>;

    /// Bytes between the cursor and the end.
    fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.position())
    }
}

impl ContentReader for &[u8] {
    fn read_exact(&mut self, buf: &mut [u8]) -> StoreResult<()> {
        if buf.len() > self.len() {
            return Err(StoreError::UnexpectedEof {
                needed: buf.len() as u64,
                available: self.len() as u64,
            });
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }

    fn skip_exact(&mut self, n: u64) -> StoreResult<()> {
        if n > self.len() as u64 {
            return Err(StoreError::UnexpectedEof {
                needed: n,
                available: self.len() as u64,
            });
        }
        *self = &self[n as usize..];
        Ok(())
    }
}

impl ContentWriter for Vec<u8> {
    fn write_all(&mut self, buf: &[u8]) -> StoreResult<()> {
        self.extend_from_slice(buf);
        Ok(())
    }
}

/// Growable byte vector a [`MemoryIo`] can sit on.
pub trait ByteBuffer {
    fn bytes(&self) -> &Vec<u8>;
    fn bytes_mut(&mut self) -> &mut Vec<u8>;
}

impl ByteBuffer for Vec<u8> {
    fn bytes(&self) -> &Vec<u8> {
        self
    }

    fn bytes_mut(&mut self) -> &mut Vec<u8> {
        self
    }
}

impl ByteBuffer for &mut Vec<u8> {
    fn bytes(&self) -> &Vec<u8> {
        self
    }

    fn bytes_mut(&mut self) -> &mut Vec<u8> {
        self
    }
}

impl ByteBuffer for ArcMutexGuard<RawMutex, Vec<u8>> {
    fn bytes(&self) -> &Vec<u8> {
        self
    }

    fn bytes_mut(&mut self) -> &mut Vec<u8> {
        self
    }
}

/// In-memory [`RandomIo`] over a growable byte vector.
///
/// `D` is an owned vector, a mutable borrow or a chunk lock guard.
#[derive(Debug)]
pub struct MemoryIo<D = Vec<u8>> {
    data: D,
    pos: u64,
}

impl MemoryIo<Vec<u8>> {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::over(Vec::new())
    }

    /// Take back the bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Default for MemoryIo<Vec<u8>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ByteBuffer> MemoryIo<D> {
    /// Wrap existing storage with the cursor at 0.
    pub fn over(data: D) -> Self {
        Self { data, pos: 0 }
    }

    /// The full contents.
    pub fn as_slice(&self) -> &[u8] {
        self.data.bytes().as_slice()
    }
}

impl<D: ByteBuffer> ContentReader for MemoryIo<D> {
    fn read_exact(&mut self, buf: &mut [u8]) -> StoreResult<()> {
        let available = self.remaining();
        if buf.len() as u64 > available {
            return Err(StoreError::UnexpectedEof {
                needed: buf.len() as u64,
                available,
            });
        }
        let start = self.pos as usize;
        buf.copy_from_slice(&self.data.bytes()[start..start + buf.len()]);
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn skip_exact(&mut self, n: u64) -> StoreResult<()> {
        let available = self.remaining();
        if n > available {
            return Err(StoreError::UnexpectedEof { needed: n, available });
        }
        self.pos += n;
        Ok(())
    }
}

impl<D: ByteBuffer> ContentWriter for MemoryIo<D> {
    fn write_all(&mut self, buf: &[u8]) -> StoreResult<()> {
        let start = self.pos as usize;
        let end = start + buf.len();
        let data = self.data.bytes_mut();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(())
    }
}

impl<D: ByteBuffer> RandomIo for MemoryIo<D> {
    fn position(&self) -> u64 {
        self.pos
    }

    fn set_position(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn size(&self) -> u64 {
        self.data.bytes().len() as u64
    }

    fn set_size(&mut self, size: u64) -> StoreResult<()> {
        self.data.bytes_mut().resize(size as usize, 0);
        Ok(())
    }
}

/// Writer adapter that counts the bytes passing through it.
pub struct CountingWriter<'a> {
    inner: &'a mut dyn ContentWriter,
    written: u64,
}

impl<'a> CountingWriter<'a> {
    pub fn new(inner: &'a mut dyn ContentWriter) -> Self {
        Self { inner, written: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl ContentWriter for CountingWriter<'_> {
    fn write_all(&mut self, buf: &[u8]) -> StoreResult<()> {
        self.inner.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }
}

/// Reader adapter that counts the bytes consumed through it.
pub struct CountingReader<'a> {
    inner: &'a mut dyn ContentReader,
    consumed: u64,
}

impl<'a> CountingReader<'a> {
    pub fn new(inner: &'a mut dyn ContentReader) -> Self {
        Self { inner, consumed: 0 }
    }

    /// Bytes consumed so far, including skipped ones.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl ContentReader for CountingReader<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> StoreResult<()> {
        self.inner.read_exact(buf)?;
        self.consumed += buf.len() as u64;
        Ok(())
    }

    fn skip_exact(&mut self, n: u64) -> StoreResult<()> {
        self.inner.skip_exact(n)?;
        self.consumed += n;
        Ok(())
    }
}
