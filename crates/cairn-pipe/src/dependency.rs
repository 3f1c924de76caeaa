//! Minimal field subsets for partial reads and writes.
//!
//! A [`Ticket`] lists, in canonical pipe order, the fields that must be
//! read or written to access a chosen subset of a schema's fields. Tickets
//! are resolved per field, unioned for multi-field requests and cached in
//! copy-on-write maps.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PipeError, PipeResult};
use crate::field::{Field, FieldSet};

/// Resolved access plan for a field subset.
#[derive(Clone)]
pub struct Ticket {
    requested: FieldSet,
    full_write: bool,
    full_read: bool,
    write_fields: FieldSet,
    read_fields: FieldSet,
    generators: Vec<Arc<Field>>,
    hash: u64,
}

impl Ticket {
    /// The fields the ticket was resolved for.
    pub fn requested(&self) -> &FieldSet {
        &self.requested
    }

    /// `true` when a write touches every field.
    pub fn full_write(&self) -> bool {
        self.full_write
    }

    /// `true` when a read touches every field.
    pub fn full_read(&self) -> bool {
        self.full_read
    }

    pub fn write_fields(&self) -> &FieldSet {
        &self.write_fields
    }

    pub fn read_fields(&self) -> &FieldSet {
        &self.read_fields
    }

    /// Generated fields among the write fields, regenerated before writing.
    pub fn generators(&self) -> &[Arc<Field>] {
        &self.generators
    }

    /// Stable fingerprint of the write and read sets.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.write_fields == other.write_fields && self.read_fields == other.read_fields
    }
}

impl Eq for Ticket {}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("requested", &self.requested)
            .field("full_write", &self.full_write)
            .field("full_read", &self.full_read)
            .field("write", &self.write_fields)
            .field("read", &self.read_fields)
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

/// Append-only map replaced wholesale on insert, so readers never block
/// behind a resolution in progress.
struct CowMap<K, V> {
    map: RwLock<Arc<HashMap<K, V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> CowMap<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let snapshot = Arc::clone(&self.map.read());
        snapshot.get(key).cloned()
    }

    fn insert(&self, key: K, value: V) -> V {
        let mut guard = self.map.write();
        if let Some(existing) = guard.get(&key) {
            return existing.clone();
        }
        let mut next = HashMap::clone(&guard);
        next.insert(key, value.clone());
        *guard = Arc::new(next);
        value
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }
}

/// Dependency graph of one compiled field list.
pub struct DependencyResolver {
    fields: FieldSet,
    /// Slot index to canonical position.
    position: HashMap<usize, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Generated fields fed by each position.
    generated_from: Vec<Vec<usize>>,
    /// Sources of each generated position.
    sources: Vec<Vec<usize>>,
    governor: Vec<Option<usize>>,
    variable: Vec<bool>,
    single: CowMap<usize, Arc<Ticket>>,
    multi: CowMap<Vec<usize>, Arc<Ticket>>,
    full: Arc<Ticket>,
}

impl DependencyResolver {
    pub fn new(fields: FieldSet) -> Self {
        let n = fields.len();
        let position: HashMap<usize, usize> = fields
            .iter()
            .enumerate()
            .map(|(pos, f)| (f.index(), pos))
            .collect();
        let at = |slot: &usize| position.get(slot).copied();

        let mut deps = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        let mut generated_from = vec![Vec::new(); n];
        let mut sources = vec![Vec::new(); n];
        let mut governor = vec![None; n];
        let mut variable = vec![false; n];
        for (pos, field) in fields.iter().enumerate() {
            for dep in field.dependencies().iter().filter_map(at) {
                deps[pos].push(dep);
                dependents[dep].push(pos);
            }
            if let Some(generator) = field.generator() {
                for src in generator.sources().iter().filter_map(at) {
                    generated_from[src].push(pos);
                    sources[pos].push(src);
                }
            }
            governor[pos] = field.governor().as_ref().and_then(at);
            variable[pos] = !field.size_descriptor().has_fixed();
        }

        let all: Vec<usize> = (0..n).collect();
        let full = Arc::new(Self::ticket_from(&fields, all.clone(), all.clone(), all));
        Self {
            fields,
            position,
            deps,
            dependents,
            generated_from,
            sources,
            governor,
            variable,
            single: CowMap::new(),
            multi: CowMap::new(),
            full,
        }
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Ticket covering every field.
    pub fn full(&self) -> Arc<Ticket> {
        Arc::clone(&self.full)
    }

    /// Ticket for one field.
    pub fn get_deps(&self, field: &Field) -> PipeResult<Arc<Ticket>> {
        let pos = self.position_of(field)?;
        if let Some(ticket) = self.single.get(&pos) {
            return Ok(ticket);
        }
        let ticket = Arc::new(Self::ticket_from(
            &self.fields,
            vec![pos],
            self.write_closure(pos),
            self.read_closure(pos),
        ));
        Ok(self.single.insert(pos, ticket))
    }

    pub fn get_deps_by_name(&self, name: &str) -> PipeResult<Arc<Ticket>> {
        let field = self.field_named(name)?;
        self.get_deps(&field)
    }

    /// Ticket for several fields: the union of their single-field tickets.
    pub fn get_deps_set(&self, fields: &FieldSet) -> PipeResult<Arc<Ticket>> {
        let mut key = fields
            .iter()
            .map(|f| self.position_of(f))
            .collect::<PipeResult<Vec<_>>>()?;
        key.sort_unstable();
        key.dedup();
        match key.as_slice() {
            [] => return Err(self.unknown("empty field set")),
            [one] => return self.get_deps(&self.fields.as_slice()[*one]),
            _ => {}
        }
        if let Some(ticket) = self.multi.get(&key) {
            return Ok(ticket);
        }

        let n = self.fields.len();
        let mut write = vec![false; n];
        let mut read = vec![false; n];
        for &pos in &key {
            let field = Arc::clone(&self.fields.as_slice()[pos]);
            let single = self.get_deps(&field)?;
            for f in single.write_fields.iter() {
                write[self.position[&f.index()]] = true;
            }
            for f in single.read_fields.iter() {
                read[self.position[&f.index()]] = true;
            }
        }
        let ticket = Arc::new(Self::ticket_from(
            &self.fields,
            key.clone(),
            marked(&write),
            marked(&read),
        ));
        Ok(self.multi.insert(key, ticket))
    }

    pub fn get_deps_names(&self, names: &[&str]) -> PipeResult<Arc<Ticket>> {
        let fields = names
            .iter()
            .map(|name| self.field_named(name))
            .collect::<PipeResult<Vec<_>>>()?;
        self.get_deps_set(&FieldSet::new(fields))
    }

    /// Resolve the same request against another field list, by name.
    pub fn translate(&self, ticket: &Ticket, into: &DependencyResolver) -> PipeResult<Arc<Ticket>> {
        if ticket.full_read && ticket.full_write {
            return Ok(into.full());
        }
        into.get_deps_names(&ticket.requested.names())
    }

    /// Number of cached single- and multi-field tickets.
    pub fn cached(&self) -> (usize, usize) {
        (self.single.len(), self.multi.len())
    }

    fn position_of(&self, field: &Field) -> PipeResult<usize> {
        self.position
            .get(&field.index())
            .copied()
            .filter(|&pos| self.fields.as_slice()[pos].name() == field.name())
            .ok_or_else(|| self.unknown(&format!("field {} is not part of this pipe", field.name())))
    }

    fn field_named(&self, name: &str) -> PipeResult<Arc<Field>> {
        self.fields
            .by_name(name)
            .cloned()
            .ok_or_else(|| self.unknown(&format!("no field named {name}")))
    }

    fn unknown(&self, reason: &str) -> PipeError {
        PipeError::InvalidSchema {
            schema: self
                .fields
                .get(0)
                .map(|f| f.owner().to_string())
                .unwrap_or_default(),
            reason: reason.to_string(),
        }
    }

    /// Fields touched when writing `start`: its dependencies and dependents,
    /// fields generated from it or feeding its generator, and everything
    /// after any variable-size field in the closure.
    fn write_closure(&self, start: usize) -> Vec<usize> {
        let n = self.fields.len();
        let mut seen = vec![false; n];
        let mut queue = VecDeque::from([start]);
        seen[start] = true;
        while let Some(pos) = queue.pop_front() {
            let tail = if self.variable[pos] { pos + 1..n } else { 0..0 };
            let next = self.deps[pos]
                .iter()
                .chain(&self.dependents[pos])
                .chain(&self.generated_from[pos])
                .chain(&self.sources[pos])
                .copied()
                .chain(tail);
            for other in next {
                if !seen[other] {
                    seen[other] = true;
                    queue.push_back(other);
                }
            }
        }
        marked(&seen)
    }

    /// Fields decoded when reading `start`: its transitive dependencies,
    /// then the governors of every skipped field until nothing changes.
    fn read_closure(&self, start: usize) -> Vec<usize> {
        let n = self.fields.len();
        let mut seen = vec![false; n];
        let mut queue = VecDeque::from([start]);
        seen[start] = true;
        loop {
            while let Some(pos) = queue.pop_front() {
                for &dep in &self.deps[pos] {
                    if !seen[dep] {
                        seen[dep] = true;
                        queue.push_back(dep);
                    }
                }
            }
            for pos in 0..n {
                if seen[pos] {
                    continue;
                }
                if let Some(g) = self.governor[pos] {
                    if !seen[g] {
                        seen[g] = true;
                        queue.push_back(g);
                    }
                }
            }
            if queue.is_empty() {
                break;
            }
        }
        marked(&seen)
    }

    fn ticket_from(
        fields: &FieldSet,
        requested: Vec<usize>,
        write: Vec<usize>,
        read: Vec<usize>,
    ) -> Ticket {
        let pick = |positions: &[usize]| {
            FieldSet::new(positions.iter().map(|&p| Arc::clone(&fields.as_slice()[p])))
        };
        let write_fields = pick(&write);
        let read_fields = pick(&read);
        let generators = write_fields
            .iter()
            .filter(|f| f.generator().is_some())
            .cloned()
            .collect();

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"w");
        for f in write_fields.iter() {
            hasher.update(&(f.index() as u64).to_le_bytes());
        }
        hasher.update(b"r");
        for f in read_fields.iter() {
            hasher.update(&(f.index() as u64).to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);

        Ticket {
            requested: pick(&requested),
            full_write: write.len() == fields.len(),
            full_read: read.len() == fields.len(),
            write_fields,
            read_fields,
            generators,
            hash: u64::from_le_bytes(head),
        }
    }
}

impl fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (single, multi) = self.cached();
        f.debug_struct("DependencyResolver")
            .field("fields", &self.fields)
            .field("single", &single)
            .field("multi", &multi)
            .finish()
    }
}

/// Positions whose flag is set, in ascending order.
fn marked(flags: &[bool]) -> Vec<usize> {
    flags
        .iter()
        .enumerate()
        .filter_map(|(i, &on)| on.then_some(i))
        .collect()
}
