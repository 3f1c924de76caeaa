//! Declarative description of structured types.
//!
//! A [`Schema`] is an ordered list of [`FieldDef`]s plus a construction kind.
//! Schemas are immutable once built and shared through `Arc`; pipes and
//! storages compiled from them are cached by [`SchemaId`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde::{Deserialize, Serialize};

use cairn_types::PrimitiveKind;

use crate::error::{PipeError, PipeResult};
use crate::value::Instance;

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);

fn next_type_id() -> u64 {
    NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Process-unique identity of a schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(u64);

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal validation of an immutable type, run after decoding.
pub type BuildCheck = Arc<dyn Fn(&Instance) -> Result<(), String> + Send + Sync>;

/// How instances of a schema come into existence.
#[derive(Clone)]
pub enum SchemaKind {
    /// Default-constructible; read in place.
    Managed,
    /// No default construction; always stored behind a pointer.
    Unmanaged,
    /// Decoded through a builder surrogate, then checked.
    Immutable(BuildCheck),
}

impl fmt::Debug for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Managed => f.write_str("Managed"),
            SchemaKind::Unmanaged => f.write_str("Unmanaged"),
            SchemaKind::Immutable(_) => f.write_str("Immutable"),
        }
    }
}

/// Layout constraint a value slot is compiled under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageRule {
    /// Smallest encoding; variable-size values are embedded.
    #[default]
    Default,
    /// The slot must have a fixed width.
    FixedOnly,
    /// Fixed width inside a layout whose number widths are chosen per
    /// instance. Storage selection is the same as `FixedOnly`.
    VariableFixed,
}

impl StorageRule {
    pub fn is_fixed(self) -> bool {
        !matches!(self, StorageRule::Default)
    }
}

/// Write-time derivation of a field from other fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generator {
    /// The target holds the element count of an array field.
    ArrayLen { source: String },
    /// The target holds the smallest `NumberSize` fitting every source.
    NumSizeOf { sources: Vec<String> },
}

impl Generator {
    pub fn sources(&self) -> Vec<&str> {
        match self {
            Generator::ArrayLen { source } => vec![source.as_str()],
            Generator::NumSizeOf { sources } => sources.iter().map(String::as_str).collect(),
        }
    }
}

/// Storage kind of one field.
#[derive(Clone, Debug)]
pub enum FieldKind {
    Primitive(PrimitiveKind),
    /// A one-byte `NumberSize` ordinal.
    NumSize,
    /// Unsigned number stored in the width held by `size_field`.
    DynNumber { size_field: String },
    /// LEB128 unsigned number.
    VarInt,
    /// `len_field` primitives, back to back.
    Array {
        elem: PrimitiveKind,
        len_field: String,
    },
    /// Any declared type, encoded through a value storage.
    Value { ty: DeclaredType, rule: StorageRule },
}

impl FieldKind {
    /// The field whose value decides this field's byte size.
    pub fn governor(&self) -> Option<&str> {
        match self {
            FieldKind::DynNumber { size_field } => Some(size_field),
            FieldKind::Array { len_field, .. } => Some(len_field),
            _ => None,
        }
    }

    /// Returns `true` if the field holds an unsigned count.
    pub fn is_count(&self) -> bool {
        match self {
            FieldKind::VarInt | FieldKind::DynNumber { .. } => true,
            FieldKind::Primitive(kind) => kind.is_integer(),
            FieldKind::Value {
                ty: DeclaredType::Primitive(kind),
                ..
            } => kind.is_integer(),
            _ => false,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            FieldKind::Primitive(kind) => kind.name().to_string(),
            FieldKind::NumSize => "numsize".to_string(),
            FieldKind::DynNumber { .. } => "number".to_string(),
            FieldKind::VarInt => "varint".to_string(),
            FieldKind::Array { elem, .. } => format!("[{}]", elem.name()),
            FieldKind::Value { ty, .. } => ty.name(),
        }
    }
}

/// Declaration of one field.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Fields that must be read or written together with this one.
    pub dependencies: Vec<String>,
    pub generator: Option<Generator>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            dependencies: Vec::new(),
            generator: None,
        }
    }

    pub fn primitive(name: impl Into<String>, kind: PrimitiveKind) -> Self {
        Self::new(name, FieldKind::Primitive(kind))
    }

    pub fn num_size(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::NumSize)
    }

    pub fn dyn_number(name: impl Into<String>, size_field: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::DynNumber {
                size_field: size_field.into(),
            },
        )
    }

    pub fn varint(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::VarInt)
    }

    pub fn array(
        name: impl Into<String>,
        elem: PrimitiveKind,
        len_field: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            FieldKind::Array {
                elem,
                len_field: len_field.into(),
            },
        )
    }

    pub fn value(name: impl Into<String>, ty: DeclaredType) -> Self {
        Self::new(
            name,
            FieldKind::Value {
                ty,
                rule: StorageRule::Default,
            },
        )
    }

    /// Set the storage rule of a value field. Other kinds ignore it.
    pub fn rule(mut self, rule: StorageRule) -> Self {
        if let FieldKind::Value { rule: r, .. } = &mut self.kind {
            *r = rule;
        }
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn depends_on(mut self, field: impl Into<String>) -> Self {
        self.dependencies.push(field.into());
        self
    }

    pub fn generated(mut self, generator: Generator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Generate this field as the length of array `source`.
    pub fn len_of(self, source: impl Into<String>) -> Self {
        self.generated(Generator::ArrayLen {
            source: source.into(),
        })
    }

    /// Generate this field as the `NumberSize` fitting every source.
    pub fn size_of_numbers(self, sources: &[&str]) -> Self {
        self.generated(Generator::NumSizeOf {
            sources: sources.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Explicit dependencies plus the governing field, if any.
    pub(crate) fn all_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies
            .iter()
            .map(String::as_str)
            .chain(self.kind.governor())
    }
}

/// Identity key of a declared type, used by compile caches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Any,
    Primitive(PrimitiveKind),
    String,
    Wrapper(u64),
    Sealed(u64),
    Struct(SchemaId),
}

/// The declared type of a value slot.
#[derive(Clone)]
pub enum DeclaredType {
    /// Open slot; the runtime type is recorded next to the value.
    Any,
    Primitive(PrimitiveKind),
    String,
    Wrapper(Arc<WrapperType>),
    Sealed(Arc<SealedType>),
    Struct(Arc<Schema>),
    /// The schema being built, as seen from its own fields.
    SelfRef(SelfRef),
}

/// Weak back-reference from a recursive schema's fields to the schema.
#[derive(Clone)]
pub struct SelfRef {
    id: SchemaId,
    name: String,
    schema: Weak<Schema>,
}

impl SelfRef {
    pub fn id(&self) -> SchemaId {
        self.id
    }

    pub fn upgrade(&self) -> PipeResult<Arc<Schema>> {
        self.schema.upgrade().ok_or_else(|| PipeError::InvalidSchema {
            schema: self.name.clone(),
            reason: "recursive reference outlived its schema".into(),
        })
    }
}

impl DeclaredType {
    pub fn name(&self) -> String {
        match self {
            DeclaredType::Any => "any".to_string(),
            DeclaredType::Primitive(kind) => kind.name().to_string(),
            DeclaredType::String => "string".to_string(),
            DeclaredType::Wrapper(w) => w.name().to_string(),
            DeclaredType::Sealed(s) => s.name().to_string(),
            DeclaredType::Struct(s) => s.name().to_string(),
            DeclaredType::SelfRef(r) => r.name.clone(),
        }
    }

    pub fn key(&self) -> TypeKey {
        match self {
            DeclaredType::Any => TypeKey::Any,
            DeclaredType::Primitive(kind) => TypeKey::Primitive(*kind),
            DeclaredType::String => TypeKey::String,
            DeclaredType::Wrapper(w) => TypeKey::Wrapper(w.id),
            DeclaredType::Sealed(s) => TypeKey::Sealed(s.id),
            DeclaredType::Struct(s) => TypeKey::Struct(s.id()),
            DeclaredType::SelfRef(r) => TypeKey::Struct(r.id),
        }
    }

    /// Replace a self reference by the schema it points at.
    pub fn resolve(&self) -> PipeResult<DeclaredType> {
        match self {
            DeclaredType::SelfRef(r) => Ok(DeclaredType::Struct(r.upgrade()?)),
            other => Ok(other.clone()),
        }
    }

    /// The structured schema this type names, if any.
    pub fn schema(&self) -> Option<Arc<Schema>> {
        match self {
            DeclaredType::Struct(s) => Some(Arc::clone(s)),
            DeclaredType::SelfRef(r) => r.schema.upgrade(),
            _ => None,
        }
    }
}

impl fmt::Debug for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A structured type.
pub struct Schema {
    id: SchemaId,
    name: String,
    kind: SchemaKind,
    fields: Vec<FieldDef>,
    surrogate: OnceLock<Arc<Schema>>,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            kind: SchemaKind::Managed,
            fields: Vec::new(),
        }
    }

    pub fn id(&self) -> SchemaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &SchemaKind {
        &self.kind
    }

    /// Fields in declaration order. Slot indices follow this order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn is_unmanaged(&self) -> bool {
        matches!(self.kind, SchemaKind::Unmanaged)
    }

    pub fn is_immutable(&self) -> bool {
        matches!(self.kind, SchemaKind::Immutable(_))
    }

    pub fn key(&self) -> TypeKey {
        TypeKey::Struct(self.id)
    }

    /// The declared type of a slot holding instances of this schema.
    pub fn declared(self: &Arc<Self>) -> DeclaredType {
        DeclaredType::Struct(Arc::clone(self))
    }

    /// The mutable surrogate an immutable type is decoded into.
    ///
    /// Same fields, managed construction, distinct identity. Created once.
    pub fn builder_surrogate(&self) -> Arc<Schema> {
        Arc::clone(self.surrogate.get_or_init(|| {
            Arc::new(Schema {
                id: SchemaId(next_type_id()),
                name: format!("{}$Builder", self.name),
                kind: SchemaKind::Managed,
                fields: self.fields.clone(),
                surrogate: OnceLock::new(),
            })
        }))
    }

    /// Run the terminal check of an immutable type.
    pub(crate) fn check_build(&self, instance: &Instance) -> PipeResult<()> {
        match &self.kind {
            SchemaKind::Immutable(check) => check(instance).map_err(|reason| PipeError::Build {
                schema: self.name.clone(),
                reason,
            }),
            _ => Ok(()),
        }
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Schema {}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field(
                "fields",
                &self.fields.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Incremental construction of a [`Schema`].
pub struct SchemaBuilder {
    name: String,
    kind: SchemaKind,
    fields: Vec<FieldDef>,
}

impl SchemaBuilder {
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    pub fn fields(mut self, defs: impl IntoIterator<Item = FieldDef>) -> Self {
        self.fields.extend(defs);
        self
    }

    pub fn unmanaged(mut self) -> Self {
        self.kind = SchemaKind::Unmanaged;
        self
    }

    /// Make the type immutable, validated by `check` after every decode.
    pub fn immutable<F>(mut self, check: F) -> Self
    where
        F: Fn(&Instance) -> Result<(), String> + Send + Sync + 'static,
    {
        self.kind = SchemaKind::Immutable(Arc::new(check));
        self
    }

    fn validate(&self) -> PipeResult<()> {
        let invalid = |reason: String| PipeError::InvalidSchema {
            schema: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("empty schema name".into()));
        }

        let mut seen = HashSet::new();
        for def in &self.fields {
            if def.name.is_empty() {
                return Err(invalid("empty field name".into()));
            }
            if !seen.insert(def.name.as_str()) {
                return Err(invalid(format!("duplicate field {}", def.name)));
            }
        }

        let lookup = |name: &str| self.fields.iter().find(|f| f.name == name);
        for def in &self.fields {
            let name = &def.name;
            if def.nullable {
                match &def.kind {
                    FieldKind::Value {
                        ty: DeclaredType::Primitive(_),
                        ..
                    } => return Err(invalid(format!("primitive field {name} cannot be nullable"))),
                    FieldKind::Value { .. } => {}
                    _ => return Err(invalid(format!("field {name} cannot be nullable"))),
                }
            }
            for dep in &def.dependencies {
                if dep == name {
                    return Err(invalid(format!("field {name} depends on itself")));
                }
                if lookup(dep).is_none() {
                    return Err(invalid(format!("field {name} depends on unknown field {dep}")));
                }
            }
            match &def.kind {
                FieldKind::DynNumber { size_field } => match lookup(size_field) {
                    Some(FieldDef {
                        kind: FieldKind::NumSize,
                        ..
                    }) => {}
                    _ => {
                        return Err(invalid(format!(
                            "size field {size_field} of {name} must be a numsize field"
                        )))
                    }
                },
                FieldKind::Array { len_field, .. } => match lookup(len_field) {
                    Some(len) if len.kind.is_count() && !len.nullable => {}
                    _ => {
                        return Err(invalid(format!(
                            "length field {len_field} of {name} must be an unsigned count"
                        )))
                    }
                },
                _ => {}
            }
            match &def.generator {
                None => {}
                Some(Generator::ArrayLen { source }) => {
                    if !def.kind.is_count() {
                        return Err(invalid(format!("generated length {name} must be a count")));
                    }
                    match lookup(source) {
                        Some(FieldDef {
                            kind: FieldKind::Array { len_field, .. },
                            ..
                        }) if len_field == name => {}
                        _ => {
                            return Err(invalid(format!(
                                "{name} must be the length field of array {source}"
                            )))
                        }
                    }
                }
                Some(Generator::NumSizeOf { sources }) => {
                    if !matches!(def.kind, FieldKind::NumSize) {
                        return Err(invalid(format!("generated size {name} must be a numsize field")));
                    }
                    if sources.is_empty() {
                        return Err(invalid(format!("generated size {name} has no sources")));
                    }
                    for source in sources {
                        match lookup(source) {
                            Some(FieldDef {
                                kind: FieldKind::DynNumber { .. } | FieldKind::VarInt,
                                ..
                            }) => {}
                            _ => {
                                return Err(invalid(format!(
                                    "source {source} of {name} must be a number field"
                                )))
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Validate the field list and freeze the schema.
    pub fn build(self) -> PipeResult<Arc<Schema>> {
        self.validate()?;
        Ok(Arc::new(Schema {
            id: SchemaId(next_type_id()),
            name: self.name,
            kind: self.kind,
            fields: self.fields,
            surrogate: OnceLock::new(),
        }))
    }

    /// Build a schema whose fields refer to the schema itself.
    ///
    /// `fields` receives the type of the schema under construction and
    /// returns the fields to append. The back-reference is weak, so a
    /// recursive schema is freed like any other.
    pub fn build_recursive<F>(self, fields: F) -> PipeResult<Arc<Schema>>
    where
        F: FnOnce(DeclaredType) -> Vec<FieldDef>,
    {
        let id = SchemaId(next_type_id());
        let mut failure = None;
        let schema = Arc::new_cyclic(|weak| {
            let this = DeclaredType::SelfRef(SelfRef {
                id,
                name: self.name.clone(),
                schema: weak.clone(),
            });
            let mut builder = self;
            builder.fields.extend(fields(this));
            if let Err(err) = builder.validate() {
                failure = Some(err);
            }
            Schema {
                id,
                name: builder.name,
                kind: builder.kind,
                fields: builder.fields,
                surrogate: OnceLock::new(),
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(schema),
        }
    }
}

/// A closed set of structured variants distinguished by a tag.
///
/// Tags are `variant index + 1`; `0` encodes null.
pub struct SealedType {
    id: u64,
    name: String,
    variants: Vec<Arc<Schema>>,
}

impl SealedType {
    pub fn new(name: impl Into<String>, variants: Vec<Arc<Schema>>) -> PipeResult<Arc<Self>> {
        let name = name.into();
        let invalid = |reason: String| PipeError::InvalidSchema {
            schema: name.clone(),
            reason,
        };
        if variants.is_empty() {
            return Err(invalid("sealed type without variants".into()));
        }
        let mut ids = HashSet::new();
        for v in &variants {
            if !ids.insert(v.id()) {
                return Err(invalid(format!("variant {} listed twice", v.name())));
            }
            if v.is_unmanaged() {
                return Err(invalid(format!("variant {} is unmanaged", v.name())));
            }
        }
        Ok(Arc::new(Self {
            id: next_type_id(),
            name,
            variants,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variants(&self) -> &[Arc<Schema>] {
        &self.variants
    }

    /// Tag of the variant `schema`, if it is one.
    pub fn tag_of(&self, schema: &Schema) -> Option<u32> {
        self.variants
            .iter()
            .position(|v| v.id() == schema.id())
            .map(|i| i as u32 + 1)
    }

    /// Variant for a non-zero tag.
    pub fn variant(&self, tag: u32) -> Option<&Arc<Schema>> {
        (tag as usize)
            .checked_sub(1)
            .and_then(|i| self.variants.get(i))
    }
}

impl PartialEq for SealedType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for SealedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedType")
            .field("name", &self.name)
            .field(
                "variants",
                &self.variants.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A named single-value wrapper, carried by a one-field schema.
pub struct WrapperType {
    id: u64,
    name: String,
    inner: DeclaredType,
    carrier: Arc<Schema>,
}

impl WrapperType {
    /// Name of the carrier schema's only field.
    pub const VALUE_FIELD: &'static str = "value";

    pub fn new(name: impl Into<String>, inner: DeclaredType) -> PipeResult<Arc<Self>> {
        let name = name.into();
        let carrier = Schema::builder(name.clone())
            .field(FieldDef::value(Self::VALUE_FIELD, inner.clone()))
            .build()?;
        Ok(Arc::new(Self {
            id: next_type_id(),
            name,
            inner,
            carrier,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inner(&self) -> &DeclaredType {
        &self.inner
    }

    pub fn carrier(&self) -> &Arc<Schema> {
        &self.carrier
    }
}

impl PartialEq for WrapperType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for WrapperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapperType")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .finish()
    }
}
