use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use tracing::debug;

use cairn_types::ChunkPointer;

use crate::error::{StoreError, StoreResult};
use crate::io::{MemoryIo, RandomIo};
use crate::traits::{AllocateTicket, ChunkStore};

type ChunkCell = Arc<Mutex<Vec<u8>>>;

/// Handle to one open in-memory chunk. Holds the chunk's lock until dropped.
pub type ChunkIo = MemoryIo<ArcMutexGuard<RawMutex, Vec<u8>>>;

/// In-memory, HashMap-based chunk store.
///
/// Intended for tests and embedding. The chunk table sits behind a `RwLock`
/// and every chunk has its own mutex, so opening two different chunks never
/// contends. Chunk ids are handed out monotonically starting at 1 and are
/// never reused.
pub struct InMemoryChunkStore {
    chunks: RwLock<HashMap<ChunkPointer, ChunkCell>>,
    next_id: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl InMemoryChunkStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        }
    }

    /// Total bytes across all live chunks.
    ///
    /// Locks every chunk in turn, so it must not be called while this thread
    /// holds an open chunk handle.
    pub fn total_bytes(&self) -> u64 {
        self.chunks
            .read()
            .values()
            .map(|cell| cell.lock().len() as u64)
            .sum()
    }

    /// Number of successful allocations since creation.
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of chunks freed since creation.
    pub fn free_count(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Return a sorted list of all live pointers.
    pub fn live_pointers(&self) -> Vec<ChunkPointer> {
        let map = self.chunks.read();
        let mut ptrs: Vec<ChunkPointer> = map.keys().copied().collect();
        ptrs.sort();
        ptrs
    }

    fn cell(&self, ptr: ChunkPointer) -> StoreResult<ChunkCell> {
        self.chunks
            .read()
            .get(&ptr)
            .cloned()
            .ok_or(StoreError::ChunkNotFound(ptr))
    }
}

impl Default for InMemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore for InMemoryChunkStore {
    fn allocate(&self, ticket: AllocateTicket) -> StoreResult<ChunkPointer> {
        let ptr = ChunkPointer::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cell = Arc::new(Mutex::new(Vec::with_capacity(ticket.size_hint as usize)));
        self.chunks.write().insert(ptr, cell);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(
            chunk = %ptr,
            size_hint = ticket.size_hint,
            near = ?ticket.position_hint,
            "chunk allocated"
        );
        Ok(ptr)
    }

    fn free(&self, ptrs: &[ChunkPointer]) -> StoreResult<()> {
        let mut map = self.chunks.write();
        if let Some(missing) = ptrs.iter().find(|p| !map.contains_key(p)) {
            return Err(StoreError::ChunkNotFound(*missing));
        }
        for ptr in ptrs {
            map.remove(ptr);
        }
        self.frees.fetch_add(ptrs.len() as u64, Ordering::Relaxed);
        debug!(count = ptrs.len(), "chunks freed");
        Ok(())
    }

    fn open(&self, ptr: ChunkPointer) -> StoreResult<Box<dyn RandomIo>> {
        let cell = self.cell(ptr)?;
        let io: ChunkIo = MemoryIo::over(cell.lock_arc());
        Ok(Box::new(io))
    }

    fn contains(&self, ptr: ChunkPointer) -> bool {
        self.chunks.read().contains_key(&ptr)
    }

    fn len(&self) -> usize {
        self.chunks.read().len()
    }
}

impl std::fmt::Debug for InMemoryChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChunkStore")
            .field("chunk_count", &self.len())
            .field("allocations", &self.allocation_count())
            .field("frees", &self.free_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ContentReader, ContentWriter};

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    #[test]
    fn allocate_hands_out_distinct_non_null_pointers() {
        let store = InMemoryChunkStore::new();
        let a = store.allocate(AllocateTicket::new(16)).unwrap();
        let b = store.allocate(AllocateTicket::new(16)).unwrap();
        assert!(!a.is_null());
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
        assert_eq!(store.allocation_count(), 2);
    }

    #[test]
    fn new_chunk_is_empty() {
        let store = InMemoryChunkStore::new();
        let ptr = store.allocate(AllocateTicket::new(64)).unwrap();
        assert!(store.read_all(ptr).unwrap().is_empty());
    }

    #[test]
    fn position_hint_is_accepted() {
        let store = InMemoryChunkStore::new();
        let a = store.allocate(AllocateTicket::new(8)).unwrap();
        let b = store.allocate(AllocateTicket::new(8).near(a)).unwrap();
        assert!(store.contains(b));
    }

    // -----------------------------------------------------------------------
    // Open / read / write
    // -----------------------------------------------------------------------

    #[test]
    fn write_then_read_back() {
        let store = InMemoryChunkStore::new();
        let ptr = store.allocate(AllocateTicket::new(4)).unwrap();
        {
            let mut io = store.open(ptr).unwrap();
            io.write_u32_le(0xDEAD_BEEF).unwrap();
        }
        {
            let mut io = store.open(ptr).unwrap();
            assert_eq!(io.size(), 4);
            assert_eq!(io.read_u32_le().unwrap(), 0xDEAD_BEEF);
        }
        assert_eq!(store.total_bytes(), 4);
    }

    #[test]
    fn open_missing_chunk_fails() {
        let store = InMemoryChunkStore::new();
        let err = store.open(ChunkPointer::new(99)).err().unwrap();
        assert_eq!(err, StoreError::ChunkNotFound(ChunkPointer::new(99)));
    }

    // -----------------------------------------------------------------------
    // Free
    // -----------------------------------------------------------------------

    #[test]
    fn free_removes_chunk() {
        let store = InMemoryChunkStore::new();
        let ptr = store.allocate(AllocateTicket::new(1)).unwrap();
        store.free(&[ptr]).unwrap();
        assert!(!store.contains(ptr));
        assert!(store.is_empty());
        assert_eq!(store.free_count(), 1);
    }

    #[test]
    fn double_free_is_an_error() {
        let store = InMemoryChunkStore::new();
        let ptr = store.allocate(AllocateTicket::new(1)).unwrap();
        store.free(&[ptr]).unwrap();
        let err = store.free(&[ptr]).unwrap_err();
        assert_eq!(err, StoreError::ChunkNotFound(ptr));
    }

    #[test]
    fn failed_free_frees_nothing() {
        let store = InMemoryChunkStore::new();
        let a = store.allocate(AllocateTicket::new(1)).unwrap();
        let bogus = ChunkPointer::new(1000);
        assert!(store.free(&[a, bogus]).is_err());
        assert!(store.contains(a));
    }

    #[test]
    fn ids_are_never_reused() {
        let store = InMemoryChunkStore::new();
        let a = store.allocate(AllocateTicket::new(1)).unwrap();
        store.free(&[a]).unwrap();
        let b = store.allocate(AllocateTicket::new(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.live_pointers(), vec![b]);
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_writes_to_distinct_chunks() {
        use std::thread;

        let store = Arc::new(InMemoryChunkStore::new());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let ptr = store.allocate(AllocateTicket::new(8)).unwrap();
                    store.open(ptr).unwrap().write_u64_le(i).unwrap();
                    (ptr, i)
                })
            })
            .collect();

        for h in handles {
            let (ptr, i) = h.join().expect("thread should not panic");
            let mut io = store.open(ptr).unwrap();
            assert_eq!(io.read_u64_le().unwrap(), i);
        }
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn debug_format() {
        let store = InMemoryChunkStore::new();
        let debug = format!("{store:?}");
        assert!(debug.contains("InMemoryChunkStore"));
        assert!(debug.contains("chunk_count"));
    }
}
