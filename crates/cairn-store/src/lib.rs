//! Storage collaborators for the Cairn object codec.
//!
//! This crate provides everything the schema-compiled I/O layer consumes
//! through narrow interfaces: positioned byte streams, a chunk allocator
//! and a scoped atomic write buffer.
//!
//! # Components
//!
//! - [`ContentReader`] / [`ContentWriter`] / [`RandomIo`] -- exact-length
//!   little-endian byte streams
//! - [`MemoryIo`] -- growable in-memory stream
//! - [`ChunkStore`] -- chunk allocation, freeing and random access
//! - [`InMemoryChunkStore`] -- `HashMap`-based store for tests and embedding
//! - [`AtomicWriteBuffer`] -- all-or-nothing scope over a stream
//!
//! # Design Rules
//!
//! 1. Short reads are errors, never partial results.
//! 2. An open chunk handle is exclusive until dropped.
//! 3. Freed chunk ids are never handed out again.
//! 4. Nothing in this crate interprets chunk contents.

pub mod atomic;
pub mod error;
pub mod io;
pub mod memory;
pub mod traits;
pub mod varint;

pub use atomic::AtomicWriteBuffer;
pub use error::{StoreError, StoreResult};
pub use io::{
    ByteBuffer, ContentReader, ContentWriter, CountingReader, CountingWriter, MemoryIo, RandomIo,
};
pub use memory::{ChunkIo, InMemoryChunkStore};
pub use traits::{AllocateTicket, ChunkStore};
pub use varint::{encode_varint, varint_len, VarintDecoder};
