//! Field compilers: bind a schema's declarations to encodings and put them
//! in canonical order.
//!
//! Canonical order is a topological order over field dependencies with
//! ties broken by size class and then by name. It never depends on the
//! order fields were declared in, because byte offsets are positional.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use cairn_types::NumberSize;

use crate::error::{PipeError, PipeResult};
use crate::field::{Field, FieldCodec, FieldGenerator, FieldSet};
use crate::schema::{DeclaredType, FieldDef, FieldKind, Generator, Schema, StorageRule};
use crate::storage::make_storage;

/// Identity of a compiler, part of the pipe cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompilerKey {
    Standard,
    Fixed,
    Varying(Vec<NumberSize>),
}

/// Strategy that decides the field list a pipe runs.
pub trait PipeFieldCompiler: Send + Sync {
    fn key(&self) -> CompilerKey;

    /// Bind and order the fields of `schema`.
    fn compile(&self, schema: &Arc<Schema>) -> PipeResult<FieldSet>;
}

/// Every field as declared, in canonical order.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardCompiler;

impl PipeFieldCompiler for StandardCompiler {
    fn key(&self) -> CompilerKey {
        CompilerKey::Standard
    }

    fn compile(&self, schema: &Arc<Schema>) -> PipeResult<FieldSet> {
        compile_fields(schema, Layout::Standard)
    }
}

/// Every field forced to a fixed width; numbers take the widest size.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedCompiler;

impl PipeFieldCompiler for FixedCompiler {
    fn key(&self) -> CompilerKey {
        CompilerKey::Fixed
    }

    fn compile(&self, schema: &Arc<Schema>) -> PipeResult<FieldSet> {
        check_inline_cycle(schema)?;
        compile_fields(schema, Layout::Fixed { widths: None })
    }
}

/// Fixed layout whose forced numbers take caller-chosen widths, one per
/// forced field in canonical order.
#[derive(Clone, Debug)]
pub struct VaryingCompiler {
    widths: Vec<NumberSize>,
}

impl VaryingCompiler {
    pub fn new(widths: Vec<NumberSize>) -> Self {
        Self { widths }
    }

    pub fn widths(&self) -> &[NumberSize] {
        &self.widths
    }
}

impl PipeFieldCompiler for VaryingCompiler {
    fn key(&self) -> CompilerKey {
        CompilerKey::Varying(self.widths.clone())
    }

    fn compile(&self, schema: &Arc<Schema>) -> PipeResult<FieldSet> {
        check_inline_cycle(schema)?;
        compile_fields(
            schema,
            Layout::Fixed {
                widths: Some(&self.widths),
            },
        )
    }
}

#[derive(Clone, Copy)]
enum Layout<'a> {
    Standard,
    Fixed { widths: Option<&'a [NumberSize]> },
}

/// A declaration bound to a codec, before ordering.
struct Bound<'a> {
    def: &'a FieldDef,
    index: usize,
    codec: FieldCodec,
    dependencies: Vec<usize>,
    generator: Option<FieldGenerator>,
}

impl Bound<'_> {
    fn is_variable(&self) -> bool {
        !self.codec.size_descriptor().has_fixed()
    }
}

fn unsupported(schema: &Schema, reason: String) -> PipeError {
    PipeError::UnsupportedStructLayout {
        schema: schema.name().to_string(),
        reason,
    }
}

/// Reject a fixed layout for a type that embeds itself through struct or
/// wrapper fields. Such a type has no finite inline width, and detecting it
/// before binding keeps the outcome independent of which type is compiled
/// first.
fn check_inline_cycle(schema: &Arc<Schema>) -> PipeResult<()> {
    fn embedded(def: &FieldDef) -> Option<Arc<Schema>> {
        match &def.kind {
            FieldKind::Value {
                ty: DeclaredType::Wrapper(w),
                ..
            } => Some(Arc::clone(w.carrier())),
            FieldKind::Value { ty, .. } => ty.schema().filter(|s| !s.is_unmanaged()),
            _ => None,
        }
    }

    let mut seen = HashSet::new();
    let mut stack: Vec<Arc<Schema>> = schema.fields().iter().filter_map(embedded).collect();
    while let Some(next) = stack.pop() {
        if next.id() == schema.id() {
            return Err(PipeError::RecursiveCompile {
                key: format!("fixed layout of {}", schema.name()),
            });
        }
        if seen.insert(next.id()) {
            stack.extend(next.fields().iter().filter_map(embedded));
        }
    }
    Ok(())
}

fn compile_fields(schema: &Arc<Schema>, layout: Layout<'_>) -> PipeResult<FieldSet> {
    let defs = schema.fields();
    let slot = |name: &str| {
        schema.field_index(name).ok_or_else(|| PipeError::InvalidSchema {
            schema: schema.name().to_string(),
            reason: format!("unknown field {name}"),
        })
    };

    let mut bound = Vec::with_capacity(defs.len());
    for (index, def) in defs.iter().enumerate() {
        let codec = bind(schema, def, layout, &slot)?;
        let dependencies = def
            .all_dependencies()
            .map(&slot)
            .collect::<PipeResult<Vec<_>>>()?;
        let generator = match &def.generator {
            None => None,
            Some(Generator::ArrayLen { source }) => Some(FieldGenerator::ArrayLen {
                source: slot(source)?,
            }),
            Some(Generator::NumSizeOf { sources }) => Some(FieldGenerator::NumSizeOf {
                sources: sources.iter().map(|s| slot(s)).collect::<PipeResult<_>>()?,
            }),
        };
        bound.push(Bound {
            def,
            index,
            codec,
            dependencies,
            generator,
        });
    }

    let order = canonical_order(schema, &bound)?;

    if let Layout::Fixed {
        widths: Some(widths),
    } = layout
    {
        assign_widths(schema, &mut bound, &order, widths)?;
    }

    let governors: HashSet<usize> = bound
        .iter()
        .filter_map(|b| match &b.codec {
            FieldCodec::DynNumber { governor } => Some(*governor),
            FieldCodec::Array { len, .. } => Some(*len),
            _ => None,
        })
        .collect();

    let mut fields: Vec<Option<Field>> = bound
        .into_iter()
        .map(|b| {
            let mut field = Field::new(
                schema.name(),
                b.def,
                b.index,
                b.codec,
                b.dependencies,
                b.generator,
            );
            field.set_governs(governors.contains(&b.index));
            Some(field)
        })
        .collect();

    Ok(FieldSet::new(
        order
            .into_iter()
            .filter_map(|i| fields[i].take().map(Arc::new)),
    ))
}

fn bind(
    schema: &Schema,
    def: &FieldDef,
    layout: Layout<'_>,
    slot: &impl Fn(&str) -> PipeResult<usize>,
) -> PipeResult<FieldCodec> {
    let fixed = matches!(layout, Layout::Fixed { .. });
    let codec = match &def.kind {
        FieldKind::Primitive(kind) => FieldCodec::Primitive(*kind),
        FieldKind::NumSize => FieldCodec::NumSize,
        FieldKind::DynNumber { .. } | FieldKind::VarInt if fixed => FieldCodec::ForcedNumber {
            width: NumberSize::MAX,
        },
        FieldKind::DynNumber { size_field } => FieldCodec::DynNumber {
            governor: slot(size_field)?,
        },
        FieldKind::VarInt => FieldCodec::VarInt,
        FieldKind::Array { .. } if fixed => {
            return Err(unsupported(
                schema,
                format!("array field {} has no fixed width", def.name),
            ))
        }
        FieldKind::Array { elem, len_field } => FieldCodec::Array {
            elem: *elem,
            len: slot(len_field)?,
        },
        FieldKind::Value { ty, rule } => {
            let rule = match layout {
                Layout::Standard => *rule,
                Layout::Fixed { widths: None } => StorageRule::FixedOnly,
                Layout::Fixed { widths: Some(_) } => StorageRule::VariableFixed,
            };
            make_storage(ty, rule)?.field(def)
        }
    };
    if fixed && !codec.size_descriptor().has_fixed() {
        return Err(unsupported(
            schema,
            format!("field {} of type {} has no fixed width", def.name, def.kind.type_name()),
        ));
    }
    Ok(codec)
}

/// Kahn's algorithm over dependencies; among ready fields, fixed-size ones
/// come first, then by name.
fn canonical_order(schema: &Schema, bound: &[Bound<'_>]) -> PipeResult<Vec<usize>> {
    let mut pending: Vec<usize> = bound.iter().map(|b| b.dependencies.len()).collect();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for b in bound {
        for dep in &b.dependencies {
            dependents.entry(*dep).or_default().push(b.index);
        }
    }

    let rank = |i: usize| (bound[i].is_variable(), bound[i].def.name.as_str(), i);
    let mut ready: BTreeSet<_> = bound
        .iter()
        .filter(|b| b.dependencies.is_empty())
        .map(|b| rank(b.index))
        .collect();

    let mut order = Vec::with_capacity(bound.len());
    while let Some(next) = ready.pop_first() {
        let i = next.2;
        order.push(i);
        for &d in dependents.get(&i).into_iter().flatten() {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.insert(rank(d));
            }
        }
    }

    if order.len() != bound.len() {
        let stuck: Vec<&str> = bound
            .iter()
            .filter(|b| pending[b.index] > 0)
            .map(|b| b.def.name.as_str())
            .collect();
        return Err(PipeError::InvalidSchema {
            schema: schema.name().to_string(),
            reason: format!("dependency cycle among {}", stuck.join(", ")),
        });
    }
    Ok(order)
}

fn assign_widths(
    schema: &Schema,
    bound: &mut [Bound<'_>],
    order: &[usize],
    widths: &[NumberSize],
) -> PipeResult<()> {
    let forced: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| matches!(bound[i].codec, FieldCodec::ForcedNumber { .. }))
        .collect();
    if forced.len() != widths.len() {
        return Err(PipeError::InvalidSchema {
            schema: schema.name().to_string(),
            reason: format!("{} widths given for {} number fields", widths.len(), forced.len()),
        });
    }
    for (i, width) in forced.into_iter().zip(widths) {
        bound[i].codec = FieldCodec::ForcedNumber { width: *width };
    }
    Ok(())
}

/// Number fields a fixed layout forces, in canonical order.
pub(crate) fn forced_fields(fields: &FieldSet) -> Vec<Arc<Field>> {
    fields
        .iter()
        .filter(|f| matches!(f.codec(), FieldCodec::ForcedNumber { .. }))
        .cloned()
        .collect()
}
