//! Foundation types for Cairn.
//!
//! This crate provides the small value types shared by the byte-stream layer
//! (`cairn-store`) and the schema-compiled I/O core (`cairn-pipe`).
//!
//! # Key Types
//!
//! - [`ChunkPointer`] -- Pointer into the chunk store (`0` is null)
//! - [`NumberSize`] -- Byte width of a dynamically sized unsigned number
//! - [`PrimitiveKind`] -- Fixed-width scalar kinds
//! - [`SizeDescriptor`] -- Fixed vs. bounded-dynamic byte size classification

pub mod error;
pub mod number;
pub mod pointer;
pub mod size;

pub use error::TypeError;
pub use number::{NumberSize, PrimitiveKind};
pub use pointer::ChunkPointer;
pub use size::SizeDescriptor;
