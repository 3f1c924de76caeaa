//! Structs and wrappers encoded inline through a nested pipe.

use std::fmt;
use std::sync::{Arc, OnceLock};

use cairn_store::{ContentReader, ContentWriter};
use cairn_types::SizeDescriptor;

use crate::error::{PipeError, PipeResult};
use crate::pipe::StructPipe;
use crate::provider::DataProvider;
use crate::schema::{Schema, WrapperType};
use crate::value::{Instance, Value};

/// A nested pipe, compiled on first use.
///
/// A storage for a type that embeds itself is created while the outer
/// pipe is still compiling, so the nested standard pipe cannot be built
/// eagerly.
pub struct PipeRef {
    schema: Arc<Schema>,
    cell: OnceLock<Arc<StructPipe>>,
}

impl PipeRef {
    pub(crate) fn lazy(schema: &Arc<Schema>) -> Self {
        Self {
            schema: Arc::clone(schema),
            cell: OnceLock::new(),
        }
    }

    pub(crate) fn ready(pipe: Arc<StructPipe>) -> Self {
        Self {
            schema: Arc::clone(pipe.schema()),
            cell: OnceLock::from(pipe),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn get(&self) -> PipeResult<Arc<StructPipe>> {
        if let Some(pipe) = self.cell.get() {
            return Ok(Arc::clone(pipe));
        }
        let pipe = StructPipe::standard(&self.schema)?;
        Ok(Arc::clone(self.cell.get_or_init(|| pipe)))
    }

    /// Descriptor of the nested pipe. Unknown while that pipe is still
    /// being compiled further up the stack.
    pub(crate) fn size_descriptor(&self) -> SizeDescriptor {
        self.get()
            .map(|pipe| pipe.size_descriptor())
            .unwrap_or(SizeDescriptor::unknown(0))
    }

    pub(crate) fn needs_removal(&self) -> bool {
        self.get().map_or(true, |pipe| pipe.needs_removal())
    }
}

impl fmt::Debug for PipeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeRef")
            .field("schema", &self.schema.name())
            .field("compiled", &self.cell.get().is_some())
            .finish()
    }
}

pub(crate) fn expect_instance<'a>(schema: &Schema, value: &'a mut Value) -> PipeResult<&'a mut Instance> {
    if !matches!(&*value, Value::Struct(inst) if inst.schema().id() == schema.id()) {
        return Err(PipeError::mismatch(schema.name(), value.type_name()));
    }
    match value {
        Value::Struct(inst) => Ok(inst),
        _ => Err(PipeError::mismatch(schema.name(), "value")),
    }
}

fn expect_ref<'a>(schema: &Schema, value: &'a Value) -> PipeResult<&'a Instance> {
    match value {
        Value::Struct(inst) if inst.schema().id() == schema.id() => Ok(inst),
        other => Err(PipeError::mismatch(schema.name(), other.type_name())),
    }
}

pub(crate) fn write_struct(
    provider: &DataProvider,
    pipe: &PipeRef,
    dest: &mut dyn ContentWriter,
    value: &mut Value,
) -> PipeResult<()> {
    let inst = expect_instance(pipe.schema(), value)?;
    pipe.get()?.write(provider, dest, inst)
}

pub(crate) fn read_struct(
    provider: &DataProvider,
    pipe: &PipeRef,
    src: &mut dyn ContentReader,
) -> PipeResult<Value> {
    Ok(Value::Struct(pipe.get()?.read_new(provider, src)?))
}

pub(crate) fn size_struct(provider: &DataProvider, pipe: &PipeRef, value: &Value) -> PipeResult<u64> {
    let inst = expect_ref(pipe.schema(), value)?;
    pipe.get()?.size_of(provider, inst)
}

fn expect_carrier<'a>(wrapper: &WrapperType, value: &'a mut Value) -> PipeResult<&'a mut Instance> {
    if !matches!(&*value, Value::Wrapped(w, _) if **w == *wrapper) {
        return Err(PipeError::mismatch(wrapper.name(), value.type_name()));
    }
    match value {
        Value::Wrapped(_, carrier) => Ok(carrier),
        _ => Err(PipeError::mismatch(wrapper.name(), "value")),
    }
}

pub(crate) fn write_wrapped(
    provider: &DataProvider,
    wrapper: &WrapperType,
    pipe: &PipeRef,
    dest: &mut dyn ContentWriter,
    value: &mut Value,
) -> PipeResult<()> {
    let carrier = expect_carrier(wrapper, value)?;
    pipe.get()?.write(provider, dest, carrier)
}

pub(crate) fn read_wrapped(
    provider: &DataProvider,
    wrapper: &Arc<WrapperType>,
    pipe: &PipeRef,
    src: &mut dyn ContentReader,
) -> PipeResult<Value> {
    let carrier = pipe.get()?.read_new(provider, src)?;
    Ok(Value::Wrapped(Arc::clone(wrapper), Box::new(carrier)))
}

pub(crate) fn size_wrapped(
    provider: &DataProvider,
    wrapper: &WrapperType,
    pipe: &PipeRef,
    value: &Value,
) -> PipeResult<u64> {
    match value {
        Value::Wrapped(w, carrier) if **w == *wrapper => pipe.get()?.size_of(provider, carrier),
        other => Err(PipeError::mismatch(wrapper.name(), other.type_name())),
    }
}
