//! Compiled write, read and skip programs for a schema.
//!
//! A [`StructPipe`] is built once per schema and field compiler, cached for
//! the life of the process, and shared. Fields are always visited in the
//! compiler's canonical order, since later fields' widths may depend on
//! earlier fields' values.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::debug;

use cairn_store::{AtomicWriteBuffer, ContentReader, ContentWriter, CountingWriter, RandomIo};
use cairn_types::{ChunkPointer, SizeDescriptor};

use crate::cache::CompileCache;
use crate::compiler::{CompilerKey, FixedCompiler, PipeFieldCompiler, StandardCompiler};
use crate::dependency::{DependencyResolver, Ticket};
use crate::error::{PipeError, PipeResult};
use crate::field::{Field, FieldCodec, FieldSet};
use crate::provider::DataProvider;
use crate::schema::{Schema, SchemaId};
use crate::value::{Instance, Value};

static PIPE_CACHE: LazyLock<CompileCache<(SchemaId, CompilerKey), Arc<StructPipe>>> =
    LazyLock::new(|| CompileCache::new("pipe"));

/// One step of a skip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipCommand {
    /// Advance over a run of fixed-size fields.
    SkipFixed(u64),
    /// Skip the field at this position using its own encoding.
    Skip(usize),
    /// Decode the field at this position; a later field's width needs it.
    Read(usize),
}

/// Part of the holistic size computation.
#[derive(Clone, Copy, Debug)]
enum SizeTerm {
    /// `count` numbers whose width is held by the `governor` slot.
    Widths { governor: usize, count: u64 },
    /// Arrays whose shared length is held by the `governor` slot; `stride`
    /// is the sum of their element widths.
    Counts { governor: usize, stride: u64 },
    /// A variable field measured on its own.
    Field(usize),
}

/// Decoding path of an immutable schema through its mutable surrogate.
struct BuilderLink {
    pipe: Arc<StructPipe>,
    tickets: Mutex<HashMap<Vec<usize>, Arc<Ticket>>>,
}

/// Compiled program for one schema under one field compiler.
pub struct StructPipe {
    schema: Arc<Schema>,
    key: CompilerKey,
    fields: FieldSet,
    size: SizeDescriptor,
    fixed_part: u64,
    terms: Vec<SizeTerm>,
    skip_program: Vec<SkipCommand>,
    generators: Vec<Arc<Field>>,
    resolver: DependencyResolver,
    needs_removal: bool,
    builder: Option<BuilderLink>,
}

impl StructPipe {
    /// Pipe over every field, variable widths allowed.
    pub fn standard(schema: &Arc<Schema>) -> PipeResult<Arc<StructPipe>> {
        Self::of(schema, &StandardCompiler)
    }

    /// Pipe whose every instance has the same encoded width.
    pub fn fixed(schema: &Arc<Schema>) -> PipeResult<Arc<StructPipe>> {
        Self::of(schema, &FixedCompiler)
    }

    /// Pipe for `schema` under `compiler`, compiled on first use.
    ///
    /// Failures are cached too: a schema that cannot be compiled fails the
    /// same way on every call.
    pub fn of(schema: &Arc<Schema>, compiler: &dyn PipeFieldCompiler) -> PipeResult<Arc<StructPipe>> {
        PIPE_CACHE.get_or_compile(&(schema.id(), compiler.key()), || {
            Self::compile(schema, compiler).map(Arc::new)
        })
    }

    fn compile(schema: &Arc<Schema>, compiler: &dyn PipeFieldCompiler) -> PipeResult<StructPipe> {
        let fields = compiler.compile(schema)?;

        let builder = if schema.is_immutable() {
            Some(BuilderLink {
                pipe: Self::of(&schema.builder_surrogate(), compiler)?,
                tickets: Mutex::new(HashMap::new()),
            })
        } else {
            None
        };

        let size: SizeDescriptor = fields.iter().map(|f| f.size_descriptor()).sum();
        let (fixed_part, terms) = size_terms(&fields);
        let skip_program = skip_program(&fields);
        let generators: Vec<Arc<Field>> = fields
            .iter()
            .filter(|f| f.generator().is_some())
            .cloned()
            .collect();
        let needs_removal = fields.iter().any(|f| f.needs_removal());

        debug!(
            schema = schema.name(),
            compiler = ?compiler.key(),
            fields = fields.len(),
            size = ?size,
            skip_steps = skip_program.len(),
            "pipe compiled"
        );

        Ok(StructPipe {
            schema: Arc::clone(schema),
            key: compiler.key(),
            resolver: DependencyResolver::new(fields.clone()),
            fields,
            size,
            fixed_part,
            terms,
            skip_program,
            generators,
            needs_removal,
            builder,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn compiler_key(&self) -> &CompilerKey {
        &self.key
    }

    /// Fields in canonical order.
    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn size_descriptor(&self) -> SizeDescriptor {
        self.size
    }

    pub fn skip_program(&self) -> &[SkipCommand] {
        &self.skip_program
    }

    /// Dependency resolver over this pipe's fields.
    pub fn dependencies(&self) -> &DependencyResolver {
        &self.resolver
    }

    /// Whether encoded instances may hold chunk pointers.
    pub fn needs_removal(&self) -> bool {
        self.needs_removal
    }

    /// Pipe of the mutable surrogate, for immutable schemas.
    pub fn builder(&self) -> Option<&Arc<StructPipe>> {
        self.builder.as_ref().map(|link| &link.pipe)
    }

    fn check_instance(&self, instance: &Instance) -> PipeResult<()> {
        if instance.schema().id() == self.schema.id() {
            Ok(())
        } else {
            Err(PipeError::mismatch(self.schema.name(), instance.schema().name()))
        }
    }

    // -----------------------------------------------------------------------
    // Full access
    // -----------------------------------------------------------------------

    /// Regenerate every generated field from its sources, including those
    /// of structs embedded inline.
    pub fn generate(&self, instance: &mut Instance) -> PipeResult<()> {
        self.check_instance(instance)?;
        for field in self.fields.iter() {
            if let FieldCodec::Storage { storage, .. } = field.codec() {
                storage.generate(instance.slot_mut(field.index()))?;
            }
        }
        for field in &self.generators {
            field.generate(instance)?;
        }
        Ok(())
    }

    /// Check generator invariants and that the per-field sizes add up to
    /// the holistic size.
    pub fn validate(&self, provider: &DataProvider, instance: &Instance) -> PipeResult<()> {
        self.validated_size(provider, instance).map(|_| ())
    }

    fn validated_size(&self, provider: &DataProvider, instance: &Instance) -> PipeResult<u64> {
        let mut measured = 0;
        for field in self.fields.iter() {
            field.check(instance)?;
            measured += field.size_of(provider, instance)?;
        }
        let holistic = self.size_of(provider, instance)?;
        let mismatch = |what: &str, expected: u64, actual: u64| PipeError::SizeMismatch {
            schema: self.schema.name().to_string(),
            what: what.to_string(),
            expected,
            actual,
        };
        if measured != holistic {
            return Err(mismatch("sum of field sizes", holistic, measured));
        }
        if let Some(fixed) = self.size.fixed() {
            if holistic != fixed {
                return Err(mismatch("fixed size", fixed, holistic));
            }
        } else if !self.size.contains(holistic) {
            return Err(mismatch("size within bounds", self.size.min(), holistic));
        }
        Ok(holistic)
    }

    /// Encoded size of `instance`. Groups of fields sized by one governor
    /// are costed once per group.
    pub fn size_of(&self, provider: &DataProvider, instance: &Instance) -> PipeResult<u64> {
        let mut total = self.fixed_part;
        for term in &self.terms {
            total += match *term {
                SizeTerm::Widths { governor, count } => match instance.slot(governor) {
                    Value::NumSize(width) => width.bytes() * count,
                    other => return Err(PipeError::mismatch("numsize", other.type_name())),
                },
                SizeTerm::Counts { governor, stride } => {
                    let value = instance.slot(governor);
                    let n = value
                        .as_u64()
                        .ok_or_else(|| PipeError::mismatch("count", value.type_name()))?;
                    n * stride
                }
                SizeTerm::Field(pos) => self.fields.as_slice()[pos].size_of(provider, instance)?,
            };
        }
        Ok(total)
    }

    /// Write every field of `instance`, regenerating generated fields
    /// first. With write validation on, sizes are checked before and after.
    ///
    /// A failed write frees the chunks it allocated and restores the
    /// instance's chunk pointers.
    pub fn write(
        &self,
        provider: &DataProvider,
        dest: &mut dyn ContentWriter,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        self.check_instance(instance)?;
        let companions = instance.references_snapshot();
        let result = provider.rollback_scope(|| self.write_body(provider, dest, instance));
        if result.is_err() {
            instance.restore_references(companions);
        }
        result
    }

    fn write_body(
        &self,
        provider: &DataProvider,
        dest: &mut dyn ContentWriter,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        self.generate(instance)?;
        if !provider.config().validate_writes {
            return self.write_fields(provider, dest, instance);
        }
        let expected = self.validated_size(provider, instance)?;
        let mut counter = CountingWriter::new(dest);
        self.write_fields(provider, &mut counter, instance)?;
        if counter.written() != expected {
            return Err(PipeError::SizeMismatch {
                schema: self.schema.name().to_string(),
                what: "written bytes".into(),
                expected,
                actual: counter.written(),
            });
        }
        Ok(())
    }

    fn write_fields(
        &self,
        provider: &DataProvider,
        dest: &mut dyn ContentWriter,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        for field in self.fields.iter() {
            field.write(provider, dest, instance)?;
        }
        Ok(())
    }

    /// Decode a new instance.
    pub fn read_new(&self, provider: &DataProvider, src: &mut dyn ContentReader) -> PipeResult<Instance> {
        if let Some(link) = &self.builder {
            let draft = link.pipe.read_new(provider, src)?;
            self.schema.check_build(&draft)?;
            return Ok(draft.retarget(&self.schema));
        }
        let mut instance = Instance::new(&self.schema);
        self.read(provider, src, &mut instance)?;
        Ok(instance)
    }

    /// Decode into an existing instance.
    pub fn read(
        &self,
        provider: &DataProvider,
        src: &mut dyn ContentReader,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        self.check_instance(instance)?;
        for field in self.fields.iter() {
            field.read(provider, src, instance)?;
        }
        self.schema.check_build(instance)
    }

    /// Advance past one encoded instance without building it.
    pub fn skip(&self, provider: &DataProvider, src: &mut dyn ContentReader) -> PipeResult<()> {
        let mut scratch: Option<Instance> = None;
        for command in &self.skip_program {
            match *command {
                SkipCommand::SkipFixed(n) => src.skip_exact(n)?,
                SkipCommand::Skip(pos) => {
                    self.fields.as_slice()[pos].skip(provider, src, scratch.as_ref())?
                }
                SkipCommand::Read(pos) => {
                    let scratch = scratch.get_or_insert_with(|| Instance::new(&self.schema));
                    self.fields.as_slice()[pos].read(provider, src, scratch)?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Partial access
    // -----------------------------------------------------------------------

    /// Ticket of the surrogate pipe matching `ticket`, cached by request.
    pub fn builder_ticket(&self, ticket: &Ticket) -> PipeResult<Arc<Ticket>> {
        let link = self.builder.as_ref().ok_or_else(|| PipeError::InvalidSchema {
            schema: self.schema.name().to_string(),
            reason: "not an immutable type".into(),
        })?;
        let key = ticket.requested().ids();
        if let Some(found) = link.tickets.lock().get(&key) {
            return Ok(Arc::clone(found));
        }
        let translated = self.resolver.translate(ticket, link.pipe.dependencies())?;
        Ok(Arc::clone(link.tickets.lock().entry(key).or_insert(translated)))
    }

    /// Read only the ticket's read fields, skipping the rest in one pass.
    ///
    /// An immutable schema's partial reads go into a surrogate instance.
    pub fn read_deps(
        &self,
        provider: &DataProvider,
        src: &mut dyn ContentReader,
        ticket: &Ticket,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        if let Some(link) = &self.builder {
            if instance.schema().id() == link.pipe.schema.id() {
                let ticket = self.builder_ticket(ticket)?;
                return link.pipe.read_deps(provider, src, &ticket, instance);
            }
        }
        if ticket.full_read() {
            return self.read(provider, src, instance);
        }
        self.check_instance(instance)?;

        let wanted = ticket.read_fields().as_slice();
        let mut next = 0;
        for field in self.fields.iter() {
            if wanted.get(next).is_some_and(|w| w.index() == field.index()) {
                field.read(provider, src, instance)?;
                next += 1;
            } else {
                field.skip(provider, src, Some(instance))?;
            }
        }
        if next != wanted.len() {
            return Err(self.foreign_ticket());
        }
        Ok(())
    }

    /// Rewrite the ticket's write fields in place, leaving every other
    /// field's bytes untouched.
    ///
    /// `io` must be positioned at the start of an instance that ends its
    /// stream: rewriting a variable-size tail truncates the stream after it.
    /// More than one field is written inside an atomic scope.
    pub fn write_deps(
        &self,
        provider: &DataProvider,
        io: &mut dyn RandomIo,
        ticket: &Ticket,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        self.check_instance(instance)?;
        for field in ticket.generators() {
            field.generate(instance)?;
        }
        if provider.config().validate_writes {
            for field in ticket.write_fields().iter() {
                field.check(instance)?;
            }
        }
        let companions = instance.references_snapshot();
        let result = provider.rollback_scope(|| {
            if ticket.write_fields().len() > 1 {
                AtomicWriteBuffer::scope(io, |tx| self.write_walk(provider, tx, ticket, instance))
            } else {
                self.write_walk(provider, io, ticket, instance)
            }
        });
        if result.is_err() {
            instance.restore_references(companions);
        }
        result
    }

    fn write_walk(
        &self,
        provider: &DataProvider,
        io: &mut dyn RandomIo,
        ticket: &Ticket,
        instance: &mut Instance,
    ) -> PipeResult<()> {
        let wanted = ticket.write_fields().as_slice();
        let last = self.fields.len().saturating_sub(1);
        let mut next = 0;
        let mut scratch: Option<Instance> = None;
        for (pos, field) in self.fields.iter().enumerate() {
            if next == wanted.len() {
                break;
            }
            if wanted[next].index() == field.index() {
                field.write(provider, io, instance)?;
                next += 1;
                if pos == last && !self.size.has_fixed() {
                    let end = io.position();
                    io.set_size(end)?;
                }
            } else if field.is_governor() {
                let scratch = scratch.get_or_insert_with(|| Instance::new(&self.schema));
                field.read(provider, io, scratch)?;
            } else {
                field.skip(provider, io, scratch.as_ref())?;
            }
        }
        if next != wanted.len() {
            return Err(self.foreign_ticket());
        }
        Ok(())
    }

    fn foreign_ticket(&self) -> PipeError {
        PipeError::InvalidSchema {
            schema: self.schema.name().to_string(),
            reason: "ticket fields are not in this pipe's order".into(),
        }
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    /// Walk one encoded instance and return every chunk pointer it holds,
    /// nested ones included. With `dereference` set, reference slots are
    /// zeroed as they are reported.
    pub fn notify_removal(
        &self,
        provider: &DataProvider,
        io: &mut dyn RandomIo,
        dereference: bool,
    ) -> PipeResult<Vec<ChunkPointer>> {
        if !self.needs_removal {
            self.skip(provider, io)?;
            return Ok(Vec::new());
        }
        let mut scratch = Instance::new(&self.schema);
        let mut found = Vec::new();
        for field in self.fields.iter() {
            found.extend(field.notify_removal(provider, io, &mut scratch, dereference)?);
        }
        Ok(found)
    }
}

impl fmt::Debug for StructPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructPipe")
            .field("schema", &self.schema.name())
            .field("compiler", &self.key)
            .field("fields", &self.fields)
            .field("size", &self.size)
            .finish()
    }
}

fn size_terms(fields: &FieldSet) -> (u64, Vec<SizeTerm>) {
    let mut fixed_part = 0;
    let mut terms: Vec<SizeTerm> = Vec::new();
    let mut groups: HashMap<usize, usize> = HashMap::new();
    for (pos, field) in fields.iter().enumerate() {
        match field.codec() {
            FieldCodec::DynNumber { governor } => {
                let at = *groups.entry(*governor).or_insert_with(|| {
                    terms.push(SizeTerm::Widths {
                        governor: *governor,
                        count: 0,
                    });
                    terms.len() - 1
                });
                if let SizeTerm::Widths { count, .. } = &mut terms[at] {
                    *count += 1;
                }
            }
            FieldCodec::Array { elem, len } => {
                let at = *groups.entry(*len).or_insert_with(|| {
                    terms.push(SizeTerm::Counts {
                        governor: *len,
                        stride: 0,
                    });
                    terms.len() - 1
                });
                if let SizeTerm::Counts { stride, .. } = &mut terms[at] {
                    *stride += elem.bytes();
                }
            }
            _ => match field.size_descriptor().fixed() {
                Some(n) => fixed_part += n,
                None => terms.push(SizeTerm::Field(pos)),
            },
        }
    }
    (fixed_part, terms)
}

/// Merge runs of fixed-size fields; read governors so later governed
/// fields can be skipped.
fn skip_program(fields: &FieldSet) -> Vec<SkipCommand> {
    let mut program = Vec::new();
    let mut run = 0;
    for (pos, field) in fields.iter().enumerate() {
        if field.is_governor() {
            if run > 0 {
                program.push(SkipCommand::SkipFixed(run));
                run = 0;
            }
            program.push(SkipCommand::Read(pos));
        } else if let Some(n) = field.size_descriptor().fixed() {
            run += n;
        } else {
            if run > 0 {
                program.push(SkipCommand::SkipFixed(run));
                run = 0;
            }
            program.push(SkipCommand::Skip(pos));
        }
    }
    if run > 0 {
        program.push(SkipCommand::SkipFixed(run));
    }
    program
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::{InMemoryChunkStore, MemoryIo};
    use cairn_types::{NumberSize, PrimitiveKind};

    use crate::config::PipeConfig;
    use crate::schema::{DeclaredType, FieldDef, StorageRule};

    fn provider() -> DataProvider {
        DataProvider::with_config(Arc::new(InMemoryChunkStore::new()), PipeConfig::validating())
            .unwrap()
    }

    fn counted() -> Arc<Schema> {
        Schema::builder("Counted")
            .field(FieldDef::primitive("a", PrimitiveKind::I32))
            .field(FieldDef::varint("count").len_of("items"))
            .field(FieldDef::array("items", PrimitiveKind::I32, "count"))
            .build()
            .unwrap()
    }

    fn texts() -> Arc<Schema> {
        Schema::builder("Texts")
            .field(FieldDef::primitive("a", PrimitiveKind::I32))
            .field(FieldDef::value("name", DeclaredType::String))
            .field(FieldDef::value("note", DeclaredType::String))
            .build()
            .unwrap()
    }

    fn items(values: &[i32]) -> Value {
        Value::List(values.iter().map(|v| Value::I32(*v)).collect())
    }

    fn encode(p: &DataProvider, pipe: &StructPipe, inst: &mut Instance) -> MemoryIo {
        let mut io = MemoryIo::new();
        pipe.write(p, &mut io, inst).unwrap();
        io.set_position(0);
        io
    }

    // -----------------------------------------------------------------------
    // Compilation
    // -----------------------------------------------------------------------

    #[test]
    fn pipes_are_cached_per_schema_and_compiler() {
        let schema = counted();
        let a = StructPipe::standard(&schema).unwrap();
        let b = StructPipe::standard(&schema).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let fixed = StructPipe::fixed(&schema);
        // arrays have no fixed layout
        assert!(fixed.unwrap_err().is_layout());
    }

    #[test]
    fn skip_program_merges_fixed_runs_and_reads_governors() {
        let pipe = StructPipe::standard(&counted()).unwrap();
        assert_eq!(pipe.fields().names(), vec!["a", "count", "items"]);
        assert_eq!(
            pipe.skip_program(),
            &[SkipCommand::SkipFixed(4), SkipCommand::Read(1), SkipCommand::Skip(2)]
        );

        let schema = Schema::builder("Flat")
            .field(FieldDef::primitive("a", PrimitiveKind::I32))
            .field(FieldDef::primitive("b", PrimitiveKind::I64))
            .build()
            .unwrap();
        let pipe = StructPipe::standard(&schema).unwrap();
        assert_eq!(pipe.skip_program(), &[SkipCommand::SkipFixed(12)]);
        assert_eq!(pipe.size_descriptor(), SizeDescriptor::Fixed(12));
    }

    #[test]
    fn fixed_pipe_widens_numbers() {
        let schema = Schema::builder("Wide")
            .field(FieldDef::primitive("a", PrimitiveKind::U32))
            .field(FieldDef::varint("n"))
            .build()
            .unwrap();
        let p = provider();
        let pipe = StructPipe::fixed(&schema).unwrap();
        assert_eq!(pipe.size_descriptor(), SizeDescriptor::Fixed(12));
        let mut inst = Instance::new(&schema).with("a", 1u32).unwrap().with("n", 5u64).unwrap();
        let io = encode(&p, &pipe, &mut inst);
        assert_eq!(io.as_slice().len(), 12);
    }

    // -----------------------------------------------------------------------
    // Full access
    // -----------------------------------------------------------------------

    #[test]
    fn write_generates_counts_and_reads_back() {
        let p = provider();
        let schema = counted();
        let pipe = StructPipe::standard(&schema).unwrap();
        let mut inst = Instance::new(&schema)
            .with("a", 7i32)
            .unwrap()
            .with("items", items(&[1, 2, 3]))
            .unwrap();
        let mut io = encode(&p, &pipe, &mut inst);
        assert_eq!(inst.get("count"), Some(&Value::U64(3)));
        assert_eq!(io.as_slice().len() as u64, pipe.size_of(&p, &inst).unwrap());
        assert_eq!(pipe.read_new(&p, &mut io).unwrap(), inst);
    }

    #[test]
    fn size_of_counts_shared_widths_once_per_field() {
        let p = provider();
        let schema = Schema::builder("Widths")
            .field(FieldDef::num_size("width").size_of_numbers(&["x", "y"]))
            .field(FieldDef::dyn_number("x", "width"))
            .field(FieldDef::dyn_number("y", "width"))
            .build()
            .unwrap();
        let pipe = StructPipe::standard(&schema).unwrap();
        let mut inst = Instance::new(&schema).with("x", 300u64).unwrap().with("y", 5u64).unwrap();
        let io = encode(&p, &pipe, &mut inst);
        assert_eq!(inst.get("width"), Some(&Value::NumSize(NumberSize::Short)));
        assert_eq!(pipe.size_of(&p, &inst).unwrap(), 5);
        assert_eq!(io.as_slice().len(), 5);
    }

    #[test]
    fn validate_reports_stale_generated_width() {
        let p = provider();
        let schema = Schema::builder("Stale")
            .field(FieldDef::num_size("width").size_of_numbers(&["x"]))
            .field(FieldDef::dyn_number("x", "width"))
            .build()
            .unwrap();
        let pipe = StructPipe::standard(&schema).unwrap();
        let inst = Instance::new(&schema)
            .with("width", NumberSize::Byte)
            .unwrap()
            .with("x", 300u64)
            .unwrap();
        let err = pipe.validate(&p, &inst).unwrap_err();
        assert!(matches!(err, PipeError::GeneratorInvariant { .. }), "{err}");
    }

    #[test]
    fn skip_lands_on_the_next_instance() {
        let p = provider();
        let schema = counted();
        let pipe = StructPipe::standard(&schema).unwrap();
        let mut first = Instance::new(&schema).with("items", items(&[9, 9])).unwrap();
        let mut second = Instance::new(&schema).with("a", -1i32).unwrap();
        let mut io = MemoryIo::new();
        pipe.write(&p, &mut io, &mut first).unwrap();
        pipe.write(&p, &mut io, &mut second).unwrap();
        io.set_position(0);
        pipe.skip(&p, &mut io).unwrap();
        assert_eq!(pipe.read_new(&p, &mut io).unwrap(), second);
        assert_eq!(io.remaining(), 0);
    }

    #[test]
    fn foreign_instances_are_rejected() {
        let p = provider();
        let pipe = StructPipe::standard(&counted()).unwrap();
        let mut other = Instance::new(&texts());
        let err = pipe.write(&p, &mut MemoryIo::new(), &mut other).unwrap_err();
        assert!(matches!(err, PipeError::TypeMismatch { .. }));
    }

    #[test]
    fn immutable_types_decode_through_their_builder() {
        let p = provider();
        let schema = Schema::builder("Positive")
            .field(FieldDef::primitive("a", PrimitiveKind::I32))
            .field(FieldDef::value("name", DeclaredType::String))
            .immutable(|inst| match inst.get("a") {
                Some(Value::I32(a)) if *a > 0 => Ok(()),
                other => Err(format!("a must be positive, got {other:?}")),
            })
            .build()
            .unwrap();
        let pipe = StructPipe::standard(&schema).unwrap();
        let builder = pipe.builder().unwrap();
        assert_ne!(builder.schema().id(), schema.id());

        let mut good = Instance::new(&schema).with("a", 3i32).unwrap().with("name", "x").unwrap();
        let mut io = encode(&p, &pipe, &mut good);
        let back = pipe.read_new(&p, &mut io).unwrap();
        assert_eq!(back.schema().id(), schema.id());
        assert_eq!(back, good);

        let mut bad = Instance::new(&schema).with("name", "x").unwrap();
        let mut io = encode(&p, &pipe, &mut bad);
        let err = pipe.read_new(&p, &mut io).unwrap_err();
        assert!(matches!(err, PipeError::Build { .. }));

        // partial reads go into the surrogate and skip the build check
        io.set_position(0);
        let ticket = pipe.dependencies().get_deps_by_name("name").unwrap();
        let mut draft = Instance::new(builder.schema());
        pipe.read_deps(&p, &mut io, &ticket, &mut draft).unwrap();
        assert_eq!(draft.get("name"), Some(&Value::from("x")));
    }

    // -----------------------------------------------------------------------
    // Partial access
    // -----------------------------------------------------------------------

    #[test]
    fn read_deps_reads_only_the_ticket() {
        let p = provider();
        let schema = texts();
        let pipe = StructPipe::standard(&schema).unwrap();
        let mut full = Instance::new(&schema)
            .with("a", 4i32)
            .unwrap()
            .with("name", "n")
            .unwrap()
            .with("note", "m")
            .unwrap();
        let mut io = encode(&p, &pipe, &mut full);

        let ticket = pipe.dependencies().get_deps_by_name("note").unwrap();
        let mut inst = Instance::new(&schema);
        pipe.read_deps(&p, &mut io, &ticket, &mut inst).unwrap();
        assert_eq!(inst.get("note"), Some(&Value::from("m")));
        assert_eq!(inst.get("name"), Some(&Value::Null));
        assert_eq!(inst.get("a"), Some(&Value::I32(0)));
    }

    #[test]
    fn write_deps_rewrites_a_fixed_field_in_place() {
        let p = provider();
        let schema = texts();
        let pipe = StructPipe::standard(&schema).unwrap();
        let mut inst = Instance::new(&schema)
            .with("name", "n")
            .unwrap()
            .with("note", "m")
            .unwrap();
        let mut io = encode(&p, &pipe, &mut inst);
        let before = io.as_slice().to_vec();

        inst.set("a", 0x0102_0304i32).unwrap();
        let ticket = pipe.dependencies().get_deps_by_name("a").unwrap();
        assert_eq!(ticket.write_fields().names(), vec!["a"]);
        pipe.write_deps(&p, &mut io, &ticket, &mut inst).unwrap();

        assert_eq!(&io.as_slice()[4..], &before[4..]);
        io.set_position(0);
        assert_eq!(pipe.read_new(&p, &mut io).unwrap(), inst);
    }

    #[test]
    fn write_deps_rewrites_the_variable_tail() {
        let p = provider();
        let schema = texts();
        let pipe = StructPipe::standard(&schema).unwrap();
        let mut inst = Instance::new(&schema)
            .with("a", 1i32)
            .unwrap()
            .with("name", "short")
            .unwrap()
            .with("note", "tail")
            .unwrap();
        let mut io = encode(&p, &pipe, &mut inst);
        let ticket = pipe.dependencies().get_deps_by_name("name").unwrap();
        assert_eq!(ticket.write_fields().names(), vec!["name", "note"]);

        for name in ["a considerably longer name", "x"] {
            inst.set("name", name).unwrap();
            io.set_position(0);
            pipe.write_deps(&p, &mut io, &ticket, &mut inst).unwrap();
            assert_eq!(io.size(), pipe.size_of(&p, &inst).unwrap());
            io.set_position(0);
            assert_eq!(pipe.read_new(&p, &mut io).unwrap(), inst);
        }
    }

    #[test]
    fn write_deps_skips_governed_fields_it_does_not_write() {
        let p = provider();
        let schema = Schema::builder("Governed")
            .field(FieldDef::varint("count").len_of("items"))
            .field(FieldDef::array("items", PrimitiveKind::I32, "count"))
            .field(FieldDef::value("zname", DeclaredType::String))
            .build()
            .unwrap();
        let pipe = StructPipe::standard(&schema).unwrap();
        assert_eq!(pipe.fields().names(), vec!["count", "items", "zname"]);

        let mut inst = Instance::new(&schema)
            .with("items", items(&[5, 6]))
            .unwrap()
            .with("zname", "first")
            .unwrap();
        let mut io = encode(&p, &pipe, &mut inst);
        inst.set("zname", "last").unwrap();
        let ticket = pipe.dependencies().get_deps_by_name("zname").unwrap();
        assert_eq!(ticket.write_fields().names(), vec!["zname"]);
        pipe.write_deps(&p, &mut io, &ticket, &mut inst).unwrap();
        io.set_position(0);
        assert_eq!(pipe.read_new(&p, &mut io).unwrap(), inst);
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    #[test]
    fn notify_removal_reports_reference_chunks() {
        let p = provider();
        let schema = Schema::builder("Labelled")
            .field(FieldDef::primitive("id", PrimitiveKind::U32))
            .field(FieldDef::value("label", DeclaredType::String).rule(StorageRule::FixedOnly))
            .build()
            .unwrap();
        let pipe = StructPipe::standard(&schema).unwrap();
        assert!(pipe.needs_removal());
        let mut inst = Instance::new(&schema).with("label", "far away").unwrap();
        let mut io = encode(&p, &pipe, &mut inst);
        let ptr = inst.reference("label").unwrap();
        assert!(!ptr.is_null());

        assert_eq!(pipe.notify_removal(&p, &mut io, true).unwrap(), vec![ptr]);
        io.set_position(0);
        assert!(pipe.notify_removal(&p, &mut io, false).unwrap().is_empty());
        assert!(!StructPipe::standard(&texts()).unwrap().needs_removal());
    }
}
