//! Dynamic values and schema instances.

use std::fmt;
use std::sync::Arc;

use cairn_types::{ChunkPointer, NumberSize, PrimitiveKind};

use crate::error::{PipeError, PipeResult};
use crate::schema::{DeclaredType, FieldKind, Schema, WrapperType};

/// A runtime value held in an instance slot.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    NumSize(NumberSize),
    Str(String),
    List(Vec<Value>),
    Struct(Instance),
    /// A wrapper value, held as an instance of the wrapper's carrier schema.
    Wrapped(Arc<WrapperType>, Box<Instance>),
    Handle(Handle),
}

impl Value {
    /// Zero value of a primitive kind.
    pub fn zero(kind: PrimitiveKind) -> Value {
        match kind {
            PrimitiveKind::Bool => Value::Bool(false),
            PrimitiveKind::I8 => Value::I8(0),
            PrimitiveKind::I16 => Value::I16(0),
            PrimitiveKind::I32 => Value::I32(0),
            PrimitiveKind::I64 => Value::I64(0),
            PrimitiveKind::U8 => Value::U8(0),
            PrimitiveKind::U16 => Value::U16(0),
            PrimitiveKind::U32 => Value::U32(0),
            PrimitiveKind::U64 => Value::U64(0),
            PrimitiveKind::F32 => Value::F32(0.0),
            PrimitiveKind::F64 => Value::F64(0.0),
        }
    }

    /// An integer of `kind` holding `n`, if it is representable.
    pub fn integer(kind: PrimitiveKind, n: u64) -> Option<Value> {
        Some(match kind {
            PrimitiveKind::I8 => Value::I8(i8::try_from(n).ok()?),
            PrimitiveKind::I16 => Value::I16(i16::try_from(n).ok()?),
            PrimitiveKind::I32 => Value::I32(i32::try_from(n).ok()?),
            PrimitiveKind::I64 => Value::I64(i64::try_from(n).ok()?),
            PrimitiveKind::U8 => Value::U8(u8::try_from(n).ok()?),
            PrimitiveKind::U16 => Value::U16(u16::try_from(n).ok()?),
            PrimitiveKind::U32 => Value::U32(u32::try_from(n).ok()?),
            PrimitiveKind::U64 => Value::U64(n),
            PrimitiveKind::Bool | PrimitiveKind::F32 | PrimitiveKind::F64 => return None,
        })
    }

    /// Wrap `inner` in the carrier instance of `wrapper`.
    pub fn wrap(wrapper: &Arc<WrapperType>, inner: Value) -> Value {
        let mut carrier = Instance::new(wrapper.carrier());
        *carrier.slot_mut(0) = inner;
        Value::Wrapped(Arc::clone(wrapper), Box::new(carrier))
    }

    /// The wrapped value, if this is a wrapper.
    pub fn unwrapped(&self) -> Option<&Value> {
        match self {
            Value::Wrapped(_, carrier) => carrier.slots.first(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Non-negative integer content.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v as u64),
            Value::U16(v) => Some(v as u64),
            Value::U32(v) => Some(v as u64),
            Value::U64(v) => Some(v),
            Value::I8(v) => u64::try_from(v).ok(),
            Value::I16(v) => u64::try_from(v).ok(),
            Value::I32(v) => u64::try_from(v).ok(),
            Value::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Instance> {
        match self {
            Value::Struct(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Handle(h) => Some(h),
            _ => None,
        }
    }

    /// Short description of the runtime type, for error messages.
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Bool(_) => "bool".into(),
            Value::I8(_) => "i8".into(),
            Value::I16(_) => "i16".into(),
            Value::I32(_) => "i32".into(),
            Value::I64(_) => "i64".into(),
            Value::U8(_) => "u8".into(),
            Value::U16(_) => "u16".into(),
            Value::U32(_) => "u32".into(),
            Value::U64(_) => "u64".into(),
            Value::F32(_) => "f32".into(),
            Value::F64(_) => "f64".into(),
            Value::NumSize(_) => "numsize".into(),
            Value::Str(_) => "string".into(),
            Value::List(_) => "list".into(),
            Value::Struct(inst) => inst.schema.name().to_string(),
            Value::Wrapped(w, _) => w.name().to_string(),
            Value::Handle(h) => format!("handle<{}>", h.schema.name()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    NumberSize => NumSize,
    String => Str,
    Vec<Value> => List,
    Instance => Struct,
    Handle => Handle,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A pointer to an unmanaged instance living in its own chunk.
#[derive(Clone)]
pub struct Handle {
    schema: Arc<Schema>,
    ptr: ChunkPointer,
}

impl Handle {
    pub fn new(schema: &Arc<Schema>, ptr: ChunkPointer) -> Self {
        Self {
            schema: Arc::clone(schema),
            ptr,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn ptr(&self) -> ChunkPointer {
        self.ptr
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.schema.id() == other.schema.id() && self.ptr == other.ptr
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({})", self.schema.name(), self.ptr)
    }
}

/// An instance of a schema: one value per field plus a hidden chunk
/// pointer per field for reference-based storage.
///
/// The companion pointers are what lets a reference slot be rewritten in
/// place: the first non-null write allocates a chunk and records it here,
/// later writes reuse it. They do not take part in equality, and a clone
/// starts with none: the chunks stay owned by the instance they came from.
pub struct Instance {
    schema: Arc<Schema>,
    slots: Vec<Value>,
    refs: Vec<ChunkPointer>,
}

impl Instance {
    /// A fresh instance with every slot at its default.
    pub fn new(schema: &Arc<Schema>) -> Self {
        let slots = schema
            .fields()
            .iter()
            .map(|def| match &def.kind {
                FieldKind::Primitive(kind)
                | FieldKind::Value {
                    ty: DeclaredType::Primitive(kind),
                    ..
                } => Value::zero(*kind),
                FieldKind::NumSize => Value::NumSize(NumberSize::Void),
                FieldKind::DynNumber { .. } | FieldKind::VarInt => Value::U64(0),
                FieldKind::Array { .. } => Value::List(Vec::new()),
                FieldKind::Value { .. } => Value::Null,
            })
            .collect();
        Self {
            schema: Arc::clone(schema),
            slots,
            refs: vec![ChunkPointer::null(); schema.len()],
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema.field_index(name).map(|i| &self.slots[i])
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> PipeResult<()> {
        let index = self.index_of(name)?;
        self.slots[index] = value.into();
        Ok(())
    }

    /// Builder-style [`set`](Instance::set).
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> PipeResult<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn slots(&self) -> &[Value] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> &Value {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Value {
        &mut self.slots[index]
    }

    /// Chunk currently backing the reference slot of a field.
    pub fn reference(&self, name: &str) -> Option<ChunkPointer> {
        self.schema.field_index(name).map(|i| self.refs[i])
    }

    pub(crate) fn reference_at(&self, index: usize) -> ChunkPointer {
        self.refs[index]
    }

    pub(crate) fn slot_and_reference(&mut self, index: usize) -> (&mut Value, &mut ChunkPointer) {
        (&mut self.slots[index], &mut self.refs[index])
    }

    pub(crate) fn references_snapshot(&self) -> Vec<ChunkPointer> {
        self.refs.clone()
    }

    pub(crate) fn restore_references(&mut self, refs: Vec<ChunkPointer>) {
        debug_assert_eq!(refs.len(), self.refs.len());
        self.refs = refs;
    }

    /// Reinterpret the slots under another schema with the same fields.
    pub(crate) fn retarget(self, schema: &Arc<Schema>) -> Instance {
        Instance {
            schema: Arc::clone(schema),
            slots: self.slots,
            refs: self.refs,
        }
    }

    fn index_of(&self, name: &str) -> PipeResult<usize> {
        self.schema
            .field_index(name)
            .ok_or_else(|| PipeError::InvalidSchema {
                schema: self.schema.name().to_string(),
                reason: format!("no field named {name}"),
            })
    }
}

impl Clone for Instance {
    fn clone(&self) -> Self {
        Self {
            schema: Arc::clone(&self.schema),
            slots: self.slots.clone(),
            refs: vec![ChunkPointer::null(); self.refs.len()],
        }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.schema.id() == other.schema.id() && self.slots == other.slots
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.schema.name());
        for (def, value) in self.schema.fields().iter().zip(&self.slots) {
            s.field(&def.name, value);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;

    fn sample() -> Arc<Schema> {
        Schema::builder("Sample")
            .field(FieldDef::primitive("a", PrimitiveKind::I32))
            .field(FieldDef::varint("n"))
            .field(FieldDef::num_size("size"))
            .field(FieldDef::array("xs", PrimitiveKind::U8, "n"))
            .field(FieldDef::value("name", DeclaredType::String).nullable())
            .build()
            .unwrap()
    }

    #[test]
    fn new_instance_has_defaults() {
        let inst = Instance::new(&sample());
        assert_eq!(inst.get("a"), Some(&Value::I32(0)));
        assert_eq!(inst.get("n"), Some(&Value::U64(0)));
        assert_eq!(inst.get("size"), Some(&Value::NumSize(NumberSize::Void)));
        assert_eq!(inst.get("xs"), Some(&Value::List(vec![])));
        assert_eq!(inst.get("name"), Some(&Value::Null));
        assert_eq!(inst.reference("name"), Some(ChunkPointer::null()));
    }

    #[test]
    fn set_unknown_field_fails() {
        let mut inst = Instance::new(&sample());
        assert!(inst.set("missing", 1i32).is_err());
        inst.set("a", 7i32).unwrap();
        assert_eq!(inst.get("a"), Some(&Value::I32(7)));
    }

    #[test]
    fn equality_ignores_references() {
        let schema = sample();
        let a = Instance::new(&schema).with("name", "x").unwrap();
        let mut b = a.clone();
        *b.slot_and_reference(4).1 = ChunkPointer::new(5);
        assert_eq!(a, b);

        let other = Instance::new(&sample());
        assert_ne!(Instance::new(&schema), other);
    }

    #[test]
    fn clone_does_not_share_chunks() {
        let schema = sample();
        let mut a = Instance::new(&schema).with("name", "x").unwrap();
        *a.slot_and_reference(4).1 = ChunkPointer::new(9);
        let b = a.clone();
        assert_eq!(a.reference("name"), Some(ChunkPointer::new(9)));
        assert_eq!(b.reference("name"), Some(ChunkPointer::null()));
        assert_eq!(b.get("name"), Some(&Value::Str("x".into())));
    }

    #[test]
    fn integer_conversion_checks_range() {
        assert_eq!(Value::integer(PrimitiveKind::U8, 255), Some(Value::U8(255)));
        assert_eq!(Value::integer(PrimitiveKind::U8, 256), None);
        assert_eq!(Value::integer(PrimitiveKind::I16, 5), Some(Value::I16(5)));
        assert_eq!(Value::integer(PrimitiveKind::F32, 5), None);
        assert_eq!(Value::I32(-1).as_u64(), None);
        assert_eq!(Value::I32(3).as_u64(), Some(3));
    }

    #[test]
    fn wrap_and_unwrap() {
        let w = WrapperType::new("Age", DeclaredType::Primitive(PrimitiveKind::U8)).unwrap();
        let v = Value::wrap(&w, Value::U8(42));
        assert_eq!(v.unwrapped(), Some(&Value::U8(42)));
        assert_eq!(v.type_name(), "Age");
    }

    #[test]
    fn option_converts_to_null() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Str("a".into()));
    }

    #[test]
    fn debug_shows_field_names() {
        let inst = Instance::new(&sample()).with("a", 3i32).unwrap();
        let text = format!("{inst:?}");
        assert!(text.starts_with("Sample"));
        assert!(text.contains("a: I32(3)"));
    }
}
