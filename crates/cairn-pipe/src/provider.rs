//! Context handed to every pipe and storage operation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, warn};

use cairn_store::{AllocateTicket, ChunkStore, RandomIo};
use cairn_types::ChunkPointer;

use crate::config::PipeConfig;
use crate::error::{PipeError, PipeResult};
use crate::pipe::StructPipe;
use crate::registry::TypeRegistry;
use crate::value::{Handle, Instance};

/// Chunk store, type registry and configuration.
pub struct DataProvider {
    store: Arc<dyn ChunkStore>,
    registry: TypeRegistry,
    config: PipeConfig,
    /// Open rollback scopes per thread, innermost last.
    journal: Mutex<HashMap<ThreadId, Vec<Vec<ChunkPointer>>>>,
}

impl DataProvider {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self {
            store,
            registry: TypeRegistry::new(),
            config: PipeConfig::default(),
            journal: Mutex::new(HashMap::new()),
        }
    }

    /// Provider with an explicit configuration, validated up front.
    pub fn with_config(store: Arc<dyn ChunkStore>, config: PipeConfig) -> PipeResult<Self> {
        config.validate().map_err(|reason| PipeError::InvalidSchema {
            schema: "PipeConfig".into(),
            reason,
        })?;
        Ok(Self {
            store,
            registry: TypeRegistry::new(),
            config,
            journal: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Allocate a chunk and fill it with `populate`.
    ///
    /// If `populate` fails the chunk is freed before the error is returned,
    /// together with anything `populate` allocated itself.
    pub fn allocate_with<F>(&self, size_hint: u64, populate: F) -> PipeResult<ChunkPointer>
    where
        F: FnOnce(&mut dyn RandomIo) -> PipeResult<()>,
    {
        let ticket = AllocateTicket::new(size_hint + self.config.reference_slack);
        let ptr = self.store.allocate(ticket)?;
        let filled = self.rollback_scope(|| {
            let mut io = self.store.open(ptr)?;
            populate(io.as_mut())
        });
        match filled {
            Ok(()) => {
                self.record(ptr);
                Ok(ptr)
            }
            Err(err) => {
                warn!(chunk = %ptr, error = %err, "populate failed, freeing chunk");
                self.release(&[ptr]);
                Err(err)
            }
        }
    }

    /// Run `write`; if it fails, free every chunk allocated while it ran.
    ///
    /// Scopes nest per thread. Chunks of a scope that succeeds move to the
    /// enclosing scope, so a later failure further out still frees them.
    pub fn rollback_scope<T, F>(&self, write: F) -> PipeResult<T>
    where
        F: FnOnce() -> PipeResult<T>,
    {
        let thread = thread::current().id();
        self.journal.lock().entry(thread).or_default().push(Vec::new());
        let result = write();

        let allocated = {
            let mut journal = self.journal.lock();
            let frames = journal.entry(thread).or_default();
            let top = frames.pop().unwrap_or_default();
            let orphaned = match (&result, frames.last_mut()) {
                (Ok(_), Some(parent)) => {
                    parent.extend(top);
                    Vec::new()
                }
                (Ok(_), None) => Vec::new(),
                (Err(_), _) => top,
            };
            if frames.is_empty() {
                journal.remove(&thread);
            }
            orphaned
        };
        if !allocated.is_empty() {
            debug!(count = allocated.len(), "write failed, freeing its chunks");
            self.release(&allocated);
        }
        result
    }

    fn record(&self, ptr: ChunkPointer) {
        let mut journal = self.journal.lock();
        if let Some(top) = journal.get_mut(&thread::current().id()).and_then(|f| f.last_mut()) {
            top.push(ptr);
        }
    }

    fn release(&self, ptrs: &[ChunkPointer]) {
        if let Err(err) = self.store.free(ptrs) {
            warn!(count = ptrs.len(), error = %err, "rollback free failed");
        }
    }

    pub fn free(&self, ptrs: &[ChunkPointer]) -> PipeResult<()> {
        if ptrs.is_empty() {
            return Ok(());
        }
        debug!(count = ptrs.len(), "freeing chunks");
        Ok(self.store.free(ptrs)?)
    }

    pub fn open(&self, ptr: ChunkPointer) -> PipeResult<Box<dyn RandomIo>> {
        Ok(self.store.open(ptr)?)
    }

    /// Write an unmanaged instance into a chunk of its own.
    pub fn store_unmanaged(&self, instance: &mut Instance) -> PipeResult<Handle> {
        let schema = Arc::clone(instance.schema());
        if !schema.is_unmanaged() {
            return Err(PipeError::mismatch("an unmanaged type", schema.name()));
        }
        let pipe = StructPipe::standard(&schema)?;
        let hint = pipe.size_of(self, instance)?;
        let ptr = self.allocate_with(hint, |io| pipe.write(self, io, instance))?;
        Ok(Handle::new(&schema, ptr))
    }
}

impl fmt::Debug for DataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProvider")
            .field("chunks", &self.store.len())
            .field("types", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Handle {
    /// Decode the instance this handle points at.
    pub fn load(&self, provider: &DataProvider) -> PipeResult<Instance> {
        let pipe = StructPipe::standard(self.schema())?;
        let mut io = provider.open(self.ptr())?;
        pipe.read_new(provider, io.as_mut())
    }

    /// Overwrite the pointee with `instance`.
    pub fn store(&self, provider: &DataProvider, instance: &mut Instance) -> PipeResult<()> {
        if instance.schema().id() != self.schema().id() {
            return Err(PipeError::mismatch(self.schema().name(), instance.schema().name()));
        }
        let pipe = StructPipe::standard(self.schema())?;
        let mut io = provider.open(self.ptr())?;
        io.set_position(0);
        pipe.write(provider, io.as_mut(), instance)?;
        let end = io.position();
        io.set_size(end)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::{ContentWriter, InMemoryChunkStore, StoreError};
    use cairn_types::PrimitiveKind;

    use crate::schema::{DeclaredType, FieldDef, Schema};
    use crate::value::Value;

    fn provider() -> (Arc<InMemoryChunkStore>, DataProvider) {
        let store = Arc::new(InMemoryChunkStore::new());
        let provider = DataProvider::new(store.clone());
        (store, provider)
    }

    #[test]
    fn allocate_with_keeps_chunk_on_success() {
        let (store, provider) = provider();
        let ptr = provider
            .allocate_with(4, |io| Ok(io.write_u32_le(7)?))
            .unwrap();
        assert!(store.contains(ptr));
        assert_eq!(store.read_all(ptr).unwrap(), 7u32.to_le_bytes());
    }

    #[test]
    fn allocate_with_frees_on_failure() {
        let (store, provider) = provider();
        let err = provider
            .allocate_with(4, |io| {
                io.write_u8(1)?;
                Err(PipeError::Store(StoreError::Corrupt("boom".into())))
            })
            .unwrap_err();
        assert!(matches!(err, PipeError::Store(_)));
        assert!(store.is_empty());
        assert_eq!(store.allocation_count(), 1);
        assert_eq!(store.free_count(), 1);
    }

    #[test]
    fn rollback_scope_frees_what_inner_scopes_kept() {
        let (store, provider) = provider();
        let mut inner = ChunkPointer::null();
        let res: PipeResult<()> = provider.rollback_scope(|| {
            inner = provider.rollback_scope(|| provider.allocate_with(1, |io| Ok(io.write_u8(1)?)))?;
            provider.allocate_with(1, |io| Ok(io.write_u8(2)?))?;
            Err(PipeError::Store(StoreError::Corrupt("late".into())))
        });
        assert!(res.is_err());
        assert!(!inner.is_null());
        assert!(store.is_empty());
        assert_eq!(store.free_count(), 2);

        let kept = provider
            .rollback_scope(|| provider.allocate_with(1, |io| Ok(io.write_u8(3)?)))
            .unwrap();
        assert!(store.contains(kept));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store = Arc::new(InMemoryChunkStore::new());
        let config = PipeConfig {
            reference_slack: u64::MAX,
            ..Default::default()
        };
        assert!(DataProvider::with_config(store, config).is_err());
    }

    #[test]
    fn unmanaged_store_and_load() {
        let (store, provider) = provider();
        let schema = Schema::builder("Blob")
            .field(FieldDef::primitive("id", PrimitiveKind::U32))
            .field(FieldDef::value("label", DeclaredType::String))
            .unmanaged()
            .build()
            .unwrap();
        let mut inst = Instance::new(&schema)
            .with("id", 9u32)
            .unwrap()
            .with("label", "nine")
            .unwrap();
        let handle = provider.store_unmanaged(&mut inst).unwrap();
        assert!(store.contains(handle.ptr()));
        assert_eq!(handle.load(&provider).unwrap(), inst);

        inst.set("label", "ix").unwrap();
        handle.store(&provider, &mut inst).unwrap();
        let back = handle.load(&provider).unwrap();
        assert_eq!(back.get("label"), Some(&Value::Str("ix".into())));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn managed_types_are_not_stored_by_handle() {
        let (_, provider) = provider();
        let schema = Schema::builder("Plain").build().unwrap();
        let mut inst = Instance::new(&schema);
        assert!(provider.store_unmanaged(&mut inst).is_err());
    }
}
