//! Fields bound to a concrete encoding, and ordered field sets.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use cairn_store::{varint_len, ContentReader, ContentWriter, RandomIo, StoreError};
use cairn_types::{ChunkPointer, NumberSize, PrimitiveKind, SizeDescriptor};

use crate::error::{PipeError, PipeResult};
use crate::provider::DataProvider;
use crate::schema::FieldDef;
use crate::storage::scalar::{read_primitive, write_primitive};
use crate::storage::ValueStorage;
use crate::value::{Instance, Value};

/// How a bound field encodes its slot.
#[derive(Clone, Debug)]
pub enum FieldCodec {
    Primitive(PrimitiveKind),
    NumSize,
    /// Number whose width is the value of the `governor` slot.
    DynNumber { governor: usize },
    /// Number forced to a fixed width by a fixed layout.
    ForcedNumber { width: NumberSize },
    VarInt,
    /// Primitive elements; the element count is the value of slot `len`.
    Array { elem: PrimitiveKind, len: usize },
    /// Encoded through a value storage. `presence` adds a one-byte null
    /// marker for storages that cannot encode null themselves.
    Storage {
        storage: Arc<ValueStorage>,
        presence: bool,
    },
}

impl FieldCodec {
    /// Static size classification of this encoding.
    pub fn size_descriptor(&self) -> SizeDescriptor {
        match self {
            FieldCodec::Primitive(kind) => SizeDescriptor::Fixed(kind.bytes()),
            FieldCodec::NumSize => SizeDescriptor::Fixed(1),
            FieldCodec::DynNumber { .. } => SizeDescriptor::bounded(0, NumberSize::MAX.bytes()),
            FieldCodec::ForcedNumber { width } => SizeDescriptor::Fixed(width.bytes()),
            FieldCodec::VarInt => SizeDescriptor::bounded(1, cairn_store::varint::MAX_VARINT_LEN),
            FieldCodec::Array { .. } => SizeDescriptor::unknown(0),
            FieldCodec::Storage { storage, presence } => {
                let inner = storage.size_descriptor();
                if !*presence {
                    inner
                } else if inner.has_fixed() {
                    SizeDescriptor::Fixed(1) + inner
                } else {
                    SizeDescriptor::Fixed(1) + inner.union(SizeDescriptor::Fixed(0))
                }
            }
        }
    }
}

/// Write-time derivation, resolved to slot indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldGenerator {
    ArrayLen { source: usize },
    NumSizeOf { sources: Vec<usize> },
}

impl FieldGenerator {
    pub fn sources(&self) -> &[usize] {
        match self {
            FieldGenerator::ArrayLen { source } => std::slice::from_ref(source),
            FieldGenerator::NumSizeOf { sources } => sources,
        }
    }
}

/// A field of a schema bound to an encoding.
///
/// Fields are immutable once a pipe is compiled and are compared by slot
/// index within their field set.
pub struct Field {
    owner: String,
    name: String,
    index: usize,
    type_name: String,
    nullable: bool,
    codec: FieldCodec,
    size: SizeDescriptor,
    governor: Option<usize>,
    dependencies: Vec<usize>,
    generator: Option<FieldGenerator>,
    governs: bool,
}

impl Field {
    pub(crate) fn new(
        owner: &str,
        def: &FieldDef,
        index: usize,
        codec: FieldCodec,
        dependencies: Vec<usize>,
        generator: Option<FieldGenerator>,
    ) -> Self {
        let governor = match &codec {
            FieldCodec::DynNumber { governor } => Some(*governor),
            FieldCodec::Array { len, .. } => Some(*len),
            _ => None,
        };
        let type_name = match &codec {
            FieldCodec::ForcedNumber { width } => format!("{}:{:?}", def.kind.type_name(), width),
            _ => def.kind.type_name(),
        };
        Self {
            owner: owner.to_string(),
            name: def.name.clone(),
            index,
            type_name,
            nullable: def.nullable,
            size: codec.size_descriptor(),
            codec,
            governor,
            dependencies,
            generator,
            governs: false,
        }
    }

    pub(crate) fn set_governs(&mut self, governs: bool) {
        self.governs = governs;
    }

    /// Name of the schema this field belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot index in the owning schema.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn codec(&self) -> &FieldCodec {
        &self.codec
    }

    pub fn size_descriptor(&self) -> SizeDescriptor {
        self.size
    }

    /// Slot whose value decides this field's byte size.
    pub fn governor(&self) -> Option<usize> {
        self.governor
    }

    /// Returns `true` if another field's size depends on this field's value.
    pub fn is_governor(&self) -> bool {
        self.governs
    }

    /// Slots this field depends on, explicit and governing.
    pub fn dependencies(&self) -> &[usize] {
        &self.dependencies
    }

    pub fn generator(&self) -> Option<&FieldGenerator> {
        self.generator.as_ref()
    }

    pub fn get<'a>(&self, instance: &'a Instance) -> &'a Value {
        instance.slot(self.index)
    }

    pub fn set(&self, instance: &mut Instance, value: impl Into<Value>) {
        *instance.slot_mut(self.index) = value.into();
    }

    pub fn needs_removal(&self) -> bool {
        match &self.codec {
            FieldCodec::Storage { storage, .. } => storage.needs_removal(),
            _ => false,
        }
    }

    fn context(&self, err: PipeError) -> PipeError {
        err.in_field(&self.owner, &self.name, &self.type_name)
    }

    // -----------------------------------------------------------------------
    // Value helpers
    // -----------------------------------------------------------------------

    fn unsigned(&self, value: &Value) -> PipeResult<u64> {
        value
            .as_u64()
            .ok_or_else(|| PipeError::mismatch("unsigned number", value.type_name()))
    }

    fn width_at(&self, instance: &Instance, slot: usize) -> PipeResult<NumberSize> {
        match instance.slot(slot) {
            Value::NumSize(size) => Ok(*size),
            other => Err(PipeError::mismatch("numsize", other.type_name())),
        }
    }

    fn governed_width(&self, instance: Option<&Instance>, slot: usize) -> PipeResult<NumberSize> {
        match instance {
            Some(inst) => self.width_at(inst, slot),
            None => Err(self.missing_governor()),
        }
    }

    fn governed_count(&self, instance: Option<&Instance>, slot: usize) -> PipeResult<u64> {
        match instance {
            Some(inst) => self.unsigned(inst.slot(slot)),
            None => Err(self.missing_governor()),
        }
    }

    fn missing_governor(&self) -> PipeError {
        PipeError::InvalidSchema {
            schema: self.owner.clone(),
            reason: format!("{} skipped without its governing field", self.name),
        }
    }

    fn invariant(&self, reason: String) -> PipeError {
        PipeError::GeneratorInvariant {
            schema: self.owner.clone(),
            field: self.name.clone(),
            reason,
        }
    }

    // -----------------------------------------------------------------------
    // Encoding
    // -----------------------------------------------------------------------

    pub fn write(
        &self,
        provider: &DataProvider,
        dest: &mut dyn ContentWriter,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        self.write_raw(provider, dest, instance)
            .map_err(|e| self.context(e))
    }

    fn write_raw(
        &self,
        provider: &DataProvider,
        dest: &mut dyn ContentWriter,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        match &self.codec {
            FieldCodec::Primitive(kind) => write_primitive(dest, *kind, instance.slot(self.index)),
            FieldCodec::NumSize => match instance.slot(self.index) {
                Value::NumSize(size) => Ok(dest.write_u8(size.ordinal())?),
                other => Err(PipeError::mismatch("numsize", other.type_name())),
            },
            FieldCodec::DynNumber { governor } => {
                let width = self.width_at(instance, *governor)?;
                let value = self.unsigned(instance.slot(self.index))?;
                if !width.can_fit(value) {
                    return Err(self.invariant(format!("{value} does not fit {width:?}")));
                }
                Ok(dest.write_word(width.bytes(), value)?)
            }
            FieldCodec::ForcedNumber { width } => {
                let value = self.unsigned(instance.slot(self.index))?;
                if !width.can_fit(value) {
                    return Err(PipeError::VaryingSizeTooSmall {
                        field: format!("{}.{}", self.owner, self.name),
                        width: *width,
                        value,
                    });
                }
                Ok(dest.write_word(width.bytes(), value)?)
            }
            FieldCodec::VarInt => {
                let value = self.unsigned(instance.slot(self.index))?;
                Ok(dest.write_varint(value)?)
            }
            FieldCodec::Array { elem, len } => {
                let count = self.unsigned(instance.slot(*len))?;
                let items = match instance.slot(self.index) {
                    Value::List(items) => items,
                    other => return Err(PipeError::mismatch("list", other.type_name())),
                };
                if items.len() as u64 != count {
                    return Err(self.invariant(format!(
                        "{} elements but length field says {count}",
                        items.len()
                    )));
                }
                for item in items {
                    write_primitive(dest, *elem, item)?;
                }
                Ok(())
            }
            FieldCodec::Storage { storage, presence } => {
                let (value, reference) = instance.slot_and_reference(self.index);
                if value.is_null() {
                    if !self.nullable {
                        return Err(PipeError::NullValue {
                            schema: self.owner.clone(),
                            field: self.name.clone(),
                        });
                    }
                    if *presence {
                        dest.write_u8(0)?;
                        if let Some(width) = storage.inline_size() {
                            write_zeros(dest, width)?;
                        }
                        return Ok(());
                    }
                } else if *presence {
                    dest.write_u8(1)?;
                }
                storage.write(provider, dest, value, reference)
            }
        }
    }

    pub fn read(
        &self,
        provider: &DataProvider,
        src: &mut dyn ContentReader,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        self.read_raw(provider, src, instance)
            .map_err(|e| self.context(e))
    }

    fn read_raw(
        &self,
        provider: &DataProvider,
        src: &mut dyn ContentReader,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        let value = match &self.codec {
            FieldCodec::Primitive(kind) => read_primitive(src, *kind)?,
            FieldCodec::NumSize => Value::NumSize(NumberSize::from_ordinal(src.read_u8()?)?),
            FieldCodec::DynNumber { governor } => {
                let width = self.width_at(instance, *governor)?;
                Value::U64(src.read_word(width.bytes())?)
            }
            FieldCodec::ForcedNumber { width } => Value::U64(src.read_word(width.bytes())?),
            FieldCodec::VarInt => Value::U64(src.read_varint()?),
            FieldCodec::Array { elem, len } => {
                let count = self.unsigned(instance.slot(*len))?;
                let mut items = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    items.push(read_primitive(src, *elem)?);
                }
                Value::List(items)
            }
            FieldCodec::Storage { storage, presence } => {
                if *presence && !read_presence(src)? {
                    if let Some(width) = storage.inline_size() {
                        src.skip_exact(width)?;
                    }
                    let (slot, reference) = instance.slot_and_reference(self.index);
                    *slot = Value::Null;
                    *reference = ChunkPointer::null();
                    return Ok(());
                }
                let (slot, reference) = instance.slot_and_reference(self.index);
                *slot = storage.read_new(provider, src, reference)?;
                return Ok(());
            }
        };
        *instance.slot_mut(self.index) = value;
        Ok(())
    }

    /// Advance past this field.
    ///
    /// `instance` must hold the governing values of governed fields.
    pub fn skip(
        &self,
        provider: &DataProvider,
        src: &mut dyn ContentReader,
        instance: Option<&Instance>,
    ) -> PipeResult<()> {
        self.skip_raw(provider, src, instance)
            .map_err(|e| self.context(e))
    }

    fn skip_raw(
        &self,
        provider: &DataProvider,
        src: &mut dyn ContentReader,
        instance: Option<&Instance>,
    ) -> PipeResult<()> {
        match &self.codec {
            FieldCodec::DynNumber { governor } => {
                let width = self.governed_width(instance, *governor)?;
                Ok(src.skip_exact(width.bytes())?)
            }
            FieldCodec::VarInt => {
                src.read_varint()?;
                Ok(())
            }
            FieldCodec::Array { elem, len } => {
                let count = self.governed_count(instance, *len)?;
                let bytes = count
                    .checked_mul(elem.bytes())
                    .ok_or_else(|| StoreError::Corrupt(format!("array length {count} overflows")))?;
                Ok(src.skip_exact(bytes)?)
            }
            FieldCodec::Storage { storage, presence } => {
                if *presence && !read_presence(src)? {
                    return Ok(src.skip_exact(storage.inline_size().unwrap_or(0))?);
                }
                storage.skip(provider, src)
            }
            fixed => match fixed.size_descriptor().fixed() {
                Some(n) => Ok(src.skip_exact(n)?),
                None => Err(self.missing_governor()),
            },
        }
    }

    /// Encoded size of this field's current value.
    pub fn size_of(&self, provider: &DataProvider, instance: &Instance) -> PipeResult<u64> {
        match &self.codec {
            FieldCodec::DynNumber { governor } => Ok(self.width_at(instance, *governor)?.bytes()),
            FieldCodec::VarInt => Ok(varint_len(self.unsigned(instance.slot(self.index))?)),
            FieldCodec::Array { elem, .. } => match instance.slot(self.index) {
                Value::List(items) => Ok(items.len() as u64 * elem.bytes()),
                other => Err(PipeError::mismatch("list", other.type_name())),
            },
            FieldCodec::Storage { storage, presence } => {
                let value = instance.slot(self.index);
                let marker = u64::from(*presence);
                if value.is_null() && *presence {
                    return Ok(marker + storage.inline_size().unwrap_or(0));
                }
                Ok(marker + storage.size_of(provider, value)?)
            }
            fixed => Ok(fixed.size_descriptor().fixed().unwrap_or(0)),
        }
    }

    /// Report the chunk pointers held by this field's encoded bytes.
    ///
    /// Positioned at the field's start; leaves `io` after it. Governing
    /// values are read into `scratch` so later fields can be skipped.
    pub fn notify_removal(
        &self,
        provider: &DataProvider,
        io: &mut dyn RandomIo,
        scratch: &mut Instance,
        dereference: bool,
    ) -> PipeResult<Vec<ChunkPointer>> {
        match &self.codec {
            FieldCodec::Storage { storage, presence } if storage.needs_removal() => self
                .storage_removal(provider, storage, *presence, io, dereference)
                .map_err(|e| self.context(e)),
            _ if self.governs => {
                self.read(provider, io, scratch)?;
                Ok(Vec::new())
            }
            _ => {
                self.skip(provider, io, Some(scratch))?;
                Ok(Vec::new())
            }
        }
    }

    fn storage_removal(
        &self,
        provider: &DataProvider,
        storage: &ValueStorage,
        presence: bool,
        io: &mut dyn RandomIo,
        dereference: bool,
    ) -> PipeResult<Vec<ChunkPointer>> {
        if presence && !read_presence(&mut *io)? {
            io.skip_exact(storage.inline_size().unwrap_or(0))?;
            return Ok(Vec::new());
        }
        storage.notify_removal(provider, io, dereference)
    }

    // -----------------------------------------------------------------------
    // Generators
    // -----------------------------------------------------------------------

    fn generated_value(&self, generator: &FieldGenerator, instance: &Instance) -> PipeResult<Value> {
        match generator {
            FieldGenerator::ArrayLen { source } => {
                let len = match instance.slot(*source) {
                    Value::List(items) => items.len() as u64,
                    other => return Err(PipeError::mismatch("list", other.type_name())),
                };
                self.count_value(len)
            }
            FieldGenerator::NumSizeOf { sources } => {
                let mut widest = 0;
                for source in sources {
                    widest = widest.max(self.unsigned(instance.slot(*source))?);
                }
                Ok(Value::NumSize(NumberSize::fitting(widest)))
            }
        }
    }

    fn count_value(&self, n: u64) -> PipeResult<Value> {
        let kind = match &self.codec {
            FieldCodec::Primitive(kind) => Some(*kind),
            FieldCodec::Storage { storage, .. } => match storage.as_ref() {
                ValueStorage::Primitive(kind) => Some(*kind),
                _ => None,
            },
            _ => None,
        };
        match kind {
            Some(kind) => Value::integer(kind, n)
                .ok_or_else(|| self.invariant(format!("count {n} does not fit {}", kind.name()))),
            None => Ok(Value::U64(n)),
        }
    }

    /// Recompute a generated field from its sources.
    pub(crate) fn generate(&self, instance: &mut Instance) -> PipeResult<()> {
        if let Some(generator) = &self.generator {
            let value = self.generated_value(generator, instance)?;
            *instance.slot_mut(self.index) = value;
        }
        Ok(())
    }

    /// Check that the stored value satisfies this field's generator and
    /// width constraints.
    pub(crate) fn check(&self, instance: &Instance) -> PipeResult<()> {
        match &self.generator {
            Some(FieldGenerator::NumSizeOf { sources }) => {
                let width = self.width_at(instance, self.index)?;
                for source in sources {
                    let value = self.unsigned(instance.slot(*source))?;
                    if !width.can_fit(value) {
                        return Err(self.invariant(format!("{width:?} cannot hold {value}")));
                    }
                }
            }
            Some(generator @ FieldGenerator::ArrayLen { .. }) => {
                let expected = self.generated_value(generator, instance)?;
                let actual = instance.slot(self.index);
                if actual.as_u64() != expected.as_u64() {
                    return Err(self.invariant(format!(
                        "holds {actual:?}, array length is {expected:?}"
                    )));
                }
            }
            None => {}
        }
        if let FieldCodec::DynNumber { governor } = &self.codec {
            let width = self.width_at(instance, *governor)?;
            let value = self.unsigned(instance.slot(self.index))?;
            if !width.can_fit(value) {
                return Err(self.invariant(format!("{value} does not fit {width:?}")));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("type", &self.type_name)
            .field("size", &self.size)
            .finish()
    }
}

fn read_presence(src: &mut dyn ContentReader) -> PipeResult<bool> {
    match src.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StoreError::Corrupt(format!("presence marker {other}")).into()),
    }
}

pub(crate) fn write_zeros(dest: &mut dyn ContentWriter, n: u64) -> PipeResult<()> {
    const ZEROS: [u8; 64] = [0; 64];
    let mut left = n;
    while left > 0 {
        let step = left.min(ZEROS.len() as u64) as usize;
        dest.write_all(&ZEROS[..step])?;
        left -= step as u64;
    }
    Ok(())
}

/// Ordered, de-duplicated fields of one schema, compared by slot index.
#[derive(Clone, Default)]
pub struct FieldSet {
    fields: Arc<[Arc<Field>]>,
}

impl FieldSet {
    /// Keep the first occurrence of every slot, in the given order.
    pub fn new(fields: impl IntoIterator<Item = Arc<Field>>) -> Self {
        let mut seen = HashSet::new();
        let fields: Vec<Arc<Field>> = fields
            .into_iter()
            .filter(|f| seen.insert(f.index()))
            .collect();
        Self {
            fields: fields.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Field>> {
        self.fields.iter()
    }

    pub fn as_slice(&self) -> &[Arc<Field>] {
        &self.fields
    }

    pub fn get(&self, position: usize) -> Option<&Arc<Field>> {
        self.fields.get(position)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Field>> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn contains(&self, field: &Field) -> bool {
        self.fields.iter().any(|f| f.index() == field.index())
    }

    /// Slot indices in set order. Used as a cache key.
    pub fn ids(&self) -> Vec<usize> {
        self.fields.iter().map(|f| f.index()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name()).collect()
    }
}

impl PartialEq for FieldSet {
    fn eq(&self, other: &Self) -> bool {
        self.ids() == other.ids()
    }
}

impl Eq for FieldSet {}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::InMemoryChunkStore;

    use crate::schema::{DeclaredType, Schema, StorageRule};
    use crate::storage::make_storage;

    fn provider() -> DataProvider {
        DataProvider::new(Arc::new(InMemoryChunkStore::new()))
    }

    fn counted() -> (Arc<Schema>, Field, Field, Field) {
        let schema = Schema::builder("Counted")
            .field(FieldDef::num_size("size").size_of_numbers(&["n"]))
            .field(FieldDef::dyn_number("n", "size"))
            .field(FieldDef::varint("len").len_of("xs"))
            .field(FieldDef::array("xs", PrimitiveKind::U16, "len"))
            .build()
            .unwrap();
        let defs = schema.fields();
        let mut size = Field::new(
            "Counted",
            &defs[0],
            0,
            FieldCodec::NumSize,
            vec![],
            Some(FieldGenerator::NumSizeOf { sources: vec![1] }),
        );
        size.set_governs(true);
        let n = Field::new("Counted", &defs[1], 1, FieldCodec::DynNumber { governor: 0 }, vec![0], None);
        let xs = Field::new(
            "Counted",
            &defs[3],
            3,
            FieldCodec::Array {
                elem: PrimitiveKind::U16,
                len: 2,
            },
            vec![2],
            None,
        );
        (schema, size, n, xs)
    }

    // -----------------------------------------------------------------------
    // Size descriptors
    // -----------------------------------------------------------------------

    #[test]
    fn codec_descriptors() {
        assert_eq!(FieldCodec::Primitive(PrimitiveKind::I32).size_descriptor(), SizeDescriptor::Fixed(4));
        assert_eq!(FieldCodec::NumSize.size_descriptor(), SizeDescriptor::Fixed(1));
        assert_eq!(
            FieldCodec::VarInt.size_descriptor(),
            SizeDescriptor::Unknown { min: 1, max: Some(10) }
        );
        assert_eq!(
            FieldCodec::ForcedNumber { width: NumberSize::Int }.size_descriptor(),
            SizeDescriptor::Fixed(4)
        );
    }

    #[test]
    fn presence_byte_adds_to_descriptor() {
        let storage = make_storage(&DeclaredType::String, StorageRule::FixedOnly).unwrap();
        let codec = FieldCodec::Storage { storage, presence: true };
        assert_eq!(codec.size_descriptor(), SizeDescriptor::Fixed(9));

        let storage = make_storage(&DeclaredType::String, StorageRule::Default).unwrap();
        let codec = FieldCodec::Storage { storage, presence: true };
        assert_eq!(codec.size_descriptor(), SizeDescriptor::unknown(1));
    }

    // -----------------------------------------------------------------------
    // Governed fields
    // -----------------------------------------------------------------------

    #[test]
    fn dyn_number_uses_governor_width() {
        let provider = provider();
        let (schema, size, n, _) = counted();
        let mut inst = Instance::new(&schema).with("n", 300u64).unwrap();
        size.generate(&mut inst).unwrap();
        assert_eq!(inst.get("size"), Some(&Value::NumSize(NumberSize::Short)));

        let mut out = Vec::new();
        size.write(&provider, &mut out, &mut inst).unwrap();
        n.write(&provider, &mut out, &mut inst).unwrap();
        assert_eq!(out, vec![NumberSize::Short.ordinal(), 0x2C, 0x01]);
        assert_eq!(n.size_of(&provider, &inst).unwrap(), 2);

        let mut back = Instance::new(&schema);
        let mut src: &[u8] = &out;
        size.read(&provider, &mut src, &mut back).unwrap();
        n.read(&provider, &mut src, &mut back).unwrap();
        assert_eq!(back.get("n"), Some(&Value::U64(300)));
    }

    #[test]
    fn dyn_number_too_wide_is_an_invariant_error() {
        let provider = provider();
        let (schema, _, n, _) = counted();
        let mut inst = Instance::new(&schema)
            .with("size", NumberSize::Byte)
            .unwrap()
            .with("n", 256u64)
            .unwrap();
        let err = n.write(&provider, &mut Vec::new(), &mut inst).unwrap_err();
        assert!(matches!(err, PipeError::GeneratorInvariant { .. }));
        assert!(n.check(&inst).is_err());
    }

    #[test]
    fn array_length_must_match() {
        let provider = provider();
        let (schema, _, _, xs) = counted();
        let mut inst = Instance::new(&schema)
            .with("len", 3u64)
            .unwrap()
            .with("xs", vec![Value::U16(1)])
            .unwrap();
        let err = xs.write(&provider, &mut Vec::new(), &mut inst).unwrap_err();
        assert!(matches!(err, PipeError::GeneratorInvariant { .. }));
    }

    #[test]
    fn skipping_governed_field_needs_governor() {
        let provider = provider();
        let (schema, _, n, _) = counted();
        let mut src: &[u8] = &[1, 2, 3];
        assert!(n.skip(&provider, &mut src, None).is_err());

        let inst = Instance::new(&schema).with("size", NumberSize::Short).unwrap();
        let mut src: &[u8] = &[1, 2, 3];
        n.skip(&provider, &mut src, Some(&inst)).unwrap();
        assert_eq!(src, &[3]);
    }

    #[test]
    fn short_read_carries_field_context() {
        let provider = provider();
        let (schema, _, n, _) = counted();
        let mut inst = Instance::new(&schema).with("size", NumberSize::Int).unwrap();
        let mut src: &[u8] = &[1, 2];
        let err = n.read(&provider, &mut src, &mut inst).unwrap_err();
        match err {
            PipeError::InField { schema, field, .. } => {
                assert_eq!(schema, "Counted");
                assert_eq!(field, "n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // FieldSet
    // -----------------------------------------------------------------------

    #[test]
    fn field_set_dedups_by_slot() {
        let (_, size, n, xs) = counted();
        let size = Arc::new(size);
        let set = FieldSet::new(vec![size.clone(), Arc::new(n), size.clone(), Arc::new(xs)]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.ids(), vec![0, 1, 3]);
        assert!(set.contains(&size));
        assert_eq!(set.by_name("xs").map(|f| f.index()), Some(3));
        assert_eq!(format!("{set:?}"), r#"["size", "n", "xs"]"#);
    }

    #[test]
    fn write_zeros_emits_exact_count() {
        let mut out = Vec::new();
        write_zeros(&mut out, 130).unwrap();
        assert_eq!(out.len(), 130);
        assert!(out.iter().all(|b| *b == 0));
    }
}
