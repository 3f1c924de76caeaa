//! Scoped all-or-nothing write buffering over a [`RandomIo`].

use crate::error::{StoreError, StoreResult};
use crate::io::{ContentReader, ContentWriter, RandomIo};

#[derive(Debug)]
enum PendingOp {
    Write { offset: u64, data: Vec<u8> },
    Resize(u64),
}

/// Transaction over a byte stream.
///
/// Every write issued through the buffer is held in an overlay. Reads see
/// the overlay on top of the target, so code running inside the scope
/// observes its own writes. [`commit`](AtomicWriteBuffer::commit) applies the
/// writes to the target in issue order; dropping the buffer without
/// committing discards all of them and leaves the target untouched.
pub struct AtomicWriteBuffer<'a> {
    target: &'a mut dyn RandomIo,
    ops: Vec<PendingOp>,
    pos: u64,
    size: u64,
}

impl<'a> AtomicWriteBuffer<'a> {
    /// Open a transaction with the cursor at the target's current position.
    pub fn new(target: &'a mut dyn RandomIo) -> Self {
        let pos = target.position();
        let size = target.size();
        Self {
            target,
            ops: Vec::new(),
            pos,
            size,
        }
    }

    /// Run `f` inside a transaction and commit only if it succeeds.
    pub fn scope<T, E, F>(target: &'a mut dyn RandomIo, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut AtomicWriteBuffer<'a>) -> Result<T, E>,
    {
        let mut buf = AtomicWriteBuffer::new(target);
        let out = f(&mut buf)?;
        buf.commit()?;
        Ok(out)
    }

    /// Number of pending writes and resizes.
    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Apply every pending operation to the target.
    ///
    /// The target cursor ends where the buffer's cursor was.
    pub fn commit(self) -> StoreResult<()> {
        let AtomicWriteBuffer { target, ops, pos, .. } = self;
        for op in ops {
            match op {
                PendingOp::Write { offset, data } => {
                    target.set_position(offset);
                    target.write_all(&data)?;
                }
                PendingOp::Resize(size) => target.set_size(size)?,
            }
        }
        target.set_position(pos);
        Ok(())
    }

    /// Materialize `len` bytes at `offset` as seen through the overlay.
    fn view(&mut self, offset: u64, len: u64) -> StoreResult<Vec<u8>> {
        let end = offset + len;
        let mut out = vec![0u8; len as usize];

        // Visible target bytes are the ones no pending resize has cut off.
        let mut base_limit = self.target.size();
        for op in &self.ops {
            if let PendingOp::Resize(size) = op {
                base_limit = base_limit.min(*size);
            }
        }
        let base_end = end.min(base_limit);
        if offset < base_end {
            let saved = self.target.position();
            self.target.set_position(offset);
            let res = self
                .target
                .read_exact(&mut out[..(base_end - offset) as usize]);
            self.target.set_position(saved);
            res?;
        }

        for op in &self.ops {
            match op {
                PendingOp::Write { offset: w_off, data } => {
                    let w_end = w_off + data.len() as u64;
                    let lo = offset.max(*w_off);
                    let hi = end.min(w_end);
                    if lo < hi {
                        let dst = (lo - offset) as usize..(hi - offset) as usize;
                        let src = (lo - w_off) as usize..(hi - w_off) as usize;
                        out[dst].copy_from_slice(&data[src]);
                    }
                }
                PendingOp::Resize(size) => {
                    // Bytes past a shrink read back as zeros until rewritten.
                    if *size < end {
                        let from = size.saturating_sub(offset).min(len) as usize;
                        out[from..].fill(0);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl ContentReader for AtomicWriteBuffer<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> StoreResult<()> {
        let available = self.size.saturating_sub(self.pos);
        if buf.len() as u64 > available {
            return Err(StoreError::UnexpectedEof {
                needed: buf.len() as u64,
                available,
            });
        }
        let bytes = self.view(self.pos, buf.len() as u64)?;
        buf.copy_from_slice(&bytes);
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn skip_exact(&mut self, n: u64) -> StoreResult<()> {
        let available = self.size.saturating_sub(self.pos);
        if n > available {
            return Err(StoreError::UnexpectedEof { needed: n, available });
        }
        self.pos += n;
        Ok(())
    }
}

impl ContentWriter for AtomicWriteBuffer<'_> {
    fn write_all(&mut self, buf: &[u8]) -> StoreResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        // Coalesce with the previous write when contiguous.
        if let Some(PendingOp::Write { offset, data }) = self.ops.last_mut() {
            if *offset + data.len() as u64 == self.pos {
                data.extend_from_slice(buf);
                self.pos += buf.len() as u64;
                self.size = self.size.max(self.pos);
                return Ok(());
            }
        }
        self.ops.push(PendingOp::Write {
            offset: self.pos,
            data: buf.to_vec(),
        });
        self.pos += buf.len() as u64;
        self.size = self.size.max(self.pos);
        Ok(())
    }
}

impl RandomIo for AtomicWriteBuffer<'_> {
    fn position(&self) -> u64 {
        self.pos
    }

    fn set_position(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn set_size(&mut self, size: u64) -> StoreResult<()> {
        self.ops.push(PendingOp::Resize(size));
        self.size = size;
        Ok(())
    }
}
