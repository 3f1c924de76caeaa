//! Runtime type ids for open (`Any`-typed) slots.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use cairn_types::PrimitiveKind;

use crate::error::{PipeError, PipeResult};
use crate::schema::{DeclaredType, TypeKey};
use crate::value::Value;

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, u32>,
    types: Vec<DeclaredType>,
}

/// Thread-safe bidirectional map between type names and small ids.
///
/// Ids start at 1; 0 encodes null. Primitives and `string` are registered
/// up front so their ids are the same in every registry.
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
        };
        {
            let mut inner = registry.inner.write();
            for kind in PrimitiveKind::ALL {
                Self::insert(&mut inner, DeclaredType::Primitive(kind));
            }
            Self::insert(&mut inner, DeclaredType::String);
        }
        registry
    }

    fn insert(inner: &mut RegistryInner, ty: DeclaredType) -> u32 {
        inner.types.push(ty.clone());
        let id = inner.types.len() as u32;
        inner.by_name.insert(ty.name(), id);
        id
    }

    /// Id of `ty`, registering it on first use.
    ///
    /// Fails if a different type with the same name is already registered.
    pub fn register(&self, ty: &DeclaredType) -> PipeResult<u32> {
        if matches!(ty, DeclaredType::Any) {
            return Err(PipeError::mismatch("a concrete type", "any"));
        }
        let ty = &ty.resolve()?;
        let name = ty.name();
        if let Some(id) = self.lookup(&name, ty)? {
            return Ok(id);
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_name.get(&name) {
            return Self::same_or_clash(&inner.types[id as usize - 1], ty, id);
        }
        let id = Self::insert(&mut inner, ty.clone());
        debug!(ty = %name, id, "type registered");
        Ok(id)
    }

    fn lookup(&self, name: &str, ty: &DeclaredType) -> PipeResult<Option<u32>> {
        let inner = self.inner.read();
        match inner.by_name.get(name) {
            Some(&id) => Self::same_or_clash(&inner.types[id as usize - 1], ty, id).map(Some),
            None => Ok(None),
        }
    }

    fn same_or_clash(existing: &DeclaredType, ty: &DeclaredType, id: u32) -> PipeResult<u32> {
        if existing.key() == ty.key() {
            Ok(id)
        } else {
            Err(PipeError::InvalidSchema {
                schema: ty.name(),
                reason: format!("type name already registered with id {id}"),
            })
        }
    }

    /// Id of the runtime type of `value`; 0 for null.
    pub fn id_of(&self, value: &Value) -> PipeResult<u32> {
        let ty = match value {
            Value::Null => return Ok(0),
            Value::Bool(_) => DeclaredType::Primitive(PrimitiveKind::Bool),
            Value::I8(_) => DeclaredType::Primitive(PrimitiveKind::I8),
            Value::I16(_) => DeclaredType::Primitive(PrimitiveKind::I16),
            Value::I32(_) => DeclaredType::Primitive(PrimitiveKind::I32),
            Value::I64(_) => DeclaredType::Primitive(PrimitiveKind::I64),
            Value::U8(_) => DeclaredType::Primitive(PrimitiveKind::U8),
            Value::U16(_) => DeclaredType::Primitive(PrimitiveKind::U16),
            Value::U32(_) => DeclaredType::Primitive(PrimitiveKind::U32),
            Value::U64(_) => DeclaredType::Primitive(PrimitiveKind::U64),
            Value::F32(_) => DeclaredType::Primitive(PrimitiveKind::F32),
            Value::F64(_) => DeclaredType::Primitive(PrimitiveKind::F64),
            Value::Str(_) => DeclaredType::String,
            Value::Struct(inst) => inst.schema().declared(),
            Value::Handle(h) => h.schema().declared(),
            Value::Wrapped(w, _) => DeclaredType::Wrapper(w.clone()),
            Value::NumSize(_) | Value::List(_) => {
                return Err(PipeError::mismatch("a registrable value", value.type_name()))
            }
        };
        self.register(&ty)
    }

    /// The type registered under a non-zero id.
    pub fn resolve(&self, id: u32) -> PipeResult<DeclaredType> {
        let inner = self.inner.read();
        (id as usize)
            .checked_sub(1)
            .and_then(|i| inner.types.get(i))
            .cloned()
            .ok_or(PipeError::UnknownTypeId(id))
    }

    /// Returns `true` if `key` is registered.
    pub fn contains(&self, key: &TypeKey) -> bool {
        self.inner.read().types.iter().any(|t| &t.key() == key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, Schema};
    use crate::value::Instance;

    #[test]
    fn builtins_are_preregistered() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.len(), PrimitiveKind::ALL.len() + 1);
        assert_eq!(registry.id_of(&Value::Bool(true)).unwrap(), 1);
        let string_id = registry.id_of(&Value::Str("x".into())).unwrap();
        assert!(matches!(registry.resolve(string_id).unwrap(), DeclaredType::String));
        assert_eq!(registry.len(), PrimitiveKind::ALL.len() + 1);
    }

    #[test]
    fn null_is_zero() {
        let registry = TypeRegistry::new();
        assert_eq!(registry.id_of(&Value::Null).unwrap(), 0);
        assert_eq!(registry.resolve(0).unwrap_err(), PipeError::UnknownTypeId(0));
    }

    #[test]
    fn structs_register_on_first_use() {
        let registry = TypeRegistry::new();
        let schema = Schema::builder("Point")
            .field(FieldDef::primitive("x", PrimitiveKind::I32))
            .build()
            .unwrap();
        assert!(!registry.contains(&schema.key()));
        let value = Value::Struct(Instance::new(&schema));
        let id = registry.id_of(&value).unwrap();
        assert_eq!(registry.id_of(&value).unwrap(), id);
        assert!(registry.contains(&schema.key()));
        match registry.resolve(id).unwrap() {
            DeclaredType::Struct(s) => assert_eq!(s.id(), schema.id()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn name_clash_is_an_error() {
        let registry = TypeRegistry::new();
        let a = Schema::builder("Same").build().unwrap();
        let b = Schema::builder("Same").build().unwrap();
        registry.register(&a.declared()).unwrap();
        assert!(registry.register(&b.declared()).is_err());
    }

    #[test]
    fn lists_are_not_registrable() {
        let registry = TypeRegistry::new();
        assert!(registry.id_of(&Value::List(vec![])).is_err());
        assert!(registry.register(&DeclaredType::Any).is_err());
    }
}
