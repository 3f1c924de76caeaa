use cairn_types::ChunkPointer;

use crate::error::StoreResult;
use crate::io::RandomIo;

/// Allocation request for a new chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocateTicket {
    /// Expected number of bytes the chunk will hold.
    pub size_hint: u64,
    /// Place the chunk near this one when the backend has locality.
    pub position_hint: Option<ChunkPointer>,
}

impl AllocateTicket {
    pub fn new(size_hint: u64) -> Self {
        Self {
            size_hint,
            position_hint: None,
        }
    }

    pub fn near(mut self, ptr: ChunkPointer) -> Self {
        self.position_hint = Some(ptr);
        self
    }
}

/// Chunk allocator and random-access chunk storage.
///
/// All implementations must satisfy these invariants:
/// - `allocate` never returns the null pointer and never hands out a
///   pointer that is still live.
/// - A handle returned by `open` has exclusive access to its chunk until it
///   is dropped; the release happens on every exit path.
/// - Freeing a pointer that is not live is an error, not a no-op, so that
///   double frees surface.
pub trait ChunkStore: Send + Sync {
    /// Allocate an empty chunk.
    fn allocate(&self, ticket: AllocateTicket) -> StoreResult<ChunkPointer>;

    /// Release chunks. Fails without freeing anything if one is not live.
    fn free(&self, ptrs: &[ChunkPointer]) -> StoreResult<()>;

    /// Open a chunk for positioned reading and writing.
    fn open(&self, ptr: ChunkPointer) -> StoreResult<Box<dyn RandomIo>>;

    /// Check whether a chunk is live.
    fn contains(&self, ptr: ChunkPointer) -> bool;

    /// Number of live chunks.
    fn len(&self) -> usize;

    /// Returns `true` if no chunk is live.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a whole chunk.
    ///
    /// Default implementation opens the chunk and reads it front to back.
    fn read_all(&self, ptr: ChunkPointer) -> StoreResult<Vec<u8>> {
        let mut io = self.open(ptr)?;
        let mut buf = vec![0u8; io.size() as usize];
        io.set_position(0);
        io.read_exact(&mut buf)?;
        Ok(buf)
    }
}
