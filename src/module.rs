//! The note graph: base note, id-addressed notes, their compiled
//! expressions, the dependency graph, the evaluation cache, and the dirty
//! set.
//!
//! This is the top-level orchestration layer: the piece that owns state
//! and wires the stateless pieces (parser, compiler, VM) together, over a
//! table of interdependent expression trees rather than a single one.
//! `rustc_hash::FxHashMap<NoteId, Note>` is the note registry: ids are
//! caller-meaningful and never reused, so a generational slot map's extra
//! identity check would buy nothing here.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::{Bytecode, Instruction};
use crate::compiler;
use crate::core::note_id::NoteId;
use crate::core::property::ALL_PROPERTIES;
use crate::core::{BigRational, CoreError, Property, Value};
use crate::decompiler;
use crate::evaluator::{self, EvalOutcome, Resolver};
use crate::graph::{DependencyGraph, PropertyRef};
use crate::parser;
use crate::parser::dialect::Dialect;

/// Source-text overrides for the base note's five directly-settable
/// properties, defaulting to `frequency=440`, `startTime=0`, `duration=1`,
/// `tempo=60`, `beatsPerMeasure=4`. `measure_length` is never part of this
/// struct: it is always derived from `tempo` and `beats_per_measure`.
#[derive(Debug, Clone, Default)]
pub struct BaseNoteOverrides {
    /// Override for the base frequency, in Hz. Defaults to `"440"`.
    pub frequency: Option<String>,
    /// Override for the base start time, in seconds. Defaults to `"0"`.
    pub start_time: Option<String>,
    /// Override for the base duration, in seconds. Defaults to `"1"`.
    pub duration: Option<String>,
    /// Override for the base tempo, in beats per minute. Defaults to `"60"`.
    pub tempo: Option<String>,
    /// Override for the base beats-per-measure. Defaults to `"4"`.
    pub beats_per_measure: Option<String>,
}

/// Source-text initializer for a new or JSON-loaded note. Any field left
/// `None` leaves that property unset, inheriting from its parent chain.
#[derive(Debug, Clone, Default)]
pub struct NoteEdits {
    /// `frequency` expression source.
    pub frequency: Option<String>,
    /// `startTime` expression source.
    pub start_time: Option<String>,
    /// `duration` expression source.
    pub duration: Option<String>,
    /// `tempo` expression source.
    pub tempo: Option<String>,
    /// `beatsPerMeasure` expression source.
    pub beats_per_measure: Option<String>,
    /// `measureLength` expression source. Rarely set directly — most notes
    /// leave this `None` and inherit via `find_measure_length`.
    pub measure_length: Option<String>,
    /// Display color, e.g. `"#ff0000"`.
    pub color: Option<String>,
    /// Instrument name; `None` inherits per `find_instrument`.
    pub instrument: Option<String>,
}

/// How [`Module::remove_note`] should treat notes that still reference the
/// one being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// Fail with [`CoreError::ReferenceError`] if any note still depends on
    /// the one being removed.
    Strict,
    /// Inline the removed note's own expressions into every dependent that
    /// referenced it, then remove it.
    KeepDependencies,
}

/// A compiled expression attached to one of a note's six properties.
/// Replaced wholesale on every edit; never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression(Bytecode);

impl CompiledExpression {
    /// The underlying bytecode.
    #[must_use]
    pub fn bytecode(&self) -> &Bytecode {
        &self.0
    }
}

/// One note (or the base note, stored at [`NoteId::BASE`]): up to six
/// compiled property expressions plus two free-form display attributes.
#[derive(Debug, Clone)]
pub struct Note {
    properties: [Option<CompiledExpression>; 6],
    /// Display color, e.g. `"#ff0000"`.
    pub color: Option<String>,
    /// Instrument name, if set explicitly on this note.
    pub instrument: Option<String>,
}

impl Note {
    fn new(color: Option<String>, instrument: Option<String>) -> Self {
        Note {
            properties: [None, None, None, None, None, None],
            color,
            instrument,
        }
    }

    /// This note's compiled expression for `property`, if any.
    #[must_use]
    pub fn expression(&self, property: Property) -> Option<&CompiledExpression> {
        self.properties[usize::from(property.var_index())].as_ref()
    }

    fn set(&mut self, property: Property, expr: Option<CompiledExpression>) {
        self.properties[usize::from(property.var_index())] = expr;
    }
}

/// A note's cached evaluated values, one slot per property, with a
/// corruption bit per slot.
#[derive(Debug, Clone, Default)]
struct EvaluatedNote {
    values: [Option<Value>; 6],
    corruption: u8,
}

impl EvaluatedNote {
    fn value(&self, property: Property) -> Option<&Value> {
        self.values[usize::from(property.var_index())].as_ref()
    }

    fn is_corrupted(&self, property: Property) -> bool {
        self.corruption & (1 << property.var_index()) != 0
    }

    fn set(&mut self, property: Property, value: Value, corrupted: bool) {
        let bit = 1 << property.var_index();
        self.values[usize::from(property.var_index())] = Some(value);
        if corrupted {
            self.corruption |= bit;
        } else {
            self.corruption &= !bit;
        }
    }
}

/// One entry of [`Module::generate_measures`]: the measure's start time and
/// its ordinal index relative to the reference note.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasureEntry {
    /// The measure's start time, in seconds.
    pub time: BigRational,
    /// The measure's ordinal index, starting at 0.
    pub index: u32,
}

/// The note graph: base note, id-addressed notes, the dependency graph
/// between their property expressions, the evaluation cache, and the set of
/// notes awaiting re-evaluation.
#[derive(Debug)]
pub struct Module {
    notes: FxHashMap<NoteId, Note>,
    next_id: u32,
    graph: DependencyGraph,
    cache: FxHashMap<NoteId, EvaluatedNote>,
    dirty: FxHashSet<NoteId>,
}

impl Default for Module {
    /// # Panics
    /// Never panics in practice: the hard-coded base-note defaults
    /// (`"440"`, `"0"`, `"1"`, `"60"`, `"4"`) always parse, compile, and
    /// evaluate successfully.
    fn default() -> Self {
        Module::new(BaseNoteOverrides::default())
            .expect("the default base note overrides always compile and evaluate")
    }
}

impl Module {
    /// Build a module with a base note constructed from `overrides`,
    /// falling back to hard-coded defaults for any field left unset.
    /// `measure_length` is derived from the resulting tempo and
    /// beats-per-measure.
    ///
    /// # Errors
    /// Returns whatever error an override's source text produces while
    /// parsing or compiling. A base note cannot reference other notes,
    /// since none exist yet at construction time; an override that tries
    /// to will fail with [`CoreError::ReferenceError`].
    pub fn new(overrides: BaseNoteOverrides) -> Result<Self, CoreError> {
        let mut module = Module {
            notes: FxHashMap::default(),
            next_id: 1,
            graph: DependencyGraph::new(),
            cache: FxHashMap::default(),
            dirty: FxHashSet::default(),
        };

        let edits = NoteEdits {
            frequency: Some(overrides.frequency.unwrap_or_else(|| "440".to_owned())),
            start_time: Some(overrides.start_time.unwrap_or_else(|| "0".to_owned())),
            duration: Some(overrides.duration.unwrap_or_else(|| "1".to_owned())),
            tempo: Some(overrides.tempo.unwrap_or_else(|| "60".to_owned())),
            beats_per_measure: Some(overrides.beats_per_measure.unwrap_or_else(|| "4".to_owned())),
            measure_length: None,
            color: None,
            instrument: None,
        };
        module.install_note(NoteId::BASE, edits)?;

        let tempo = module.resolve_property(NoteId::BASE, Property::Tempo)?.value;
        let bpm = module.resolve_property(NoteId::BASE, Property::BeatsPerMeasure)?.value;
        let scaled = bpm.mul(&Value::int(60));
        let measure_length = scaled.value.div(&tempo)?;
        let literal = decompiler::render_dsl_number(&to_rational(&measure_length.value));
        module.set_expression(NoteId::BASE, Property::MeasureLength, &literal)?;

        Ok(module)
    }

    /// Add a new note, allocating the next unused id.
    ///
    /// # Errors
    /// Returns [`CoreError::ReferenceError`] if any of `edits`' expressions
    /// references a note id that does not exist, or whatever parse/compile
    /// error the source text produces.
    pub fn add_note(&mut self, edits: NoteEdits) -> Result<NoteId, CoreError> {
        let id = NoteId::from(self.next_id);
        self.install_note(id, edits)?;
        self.next_id += 1;
        Ok(id)
    }

    /// Look up a note (or the base note, via [`NoteId::BASE`]) by id.
    #[must_use]
    pub fn get_note(&self, id: NoteId) -> Option<&Note> {
        self.notes.get(&id)
    }

    /// Remove a note. The base note cannot be removed.
    ///
    /// # Errors
    /// Returns [`CoreError::ReferenceError`] if `id` is the base note, does
    /// not exist, or (in [`RemoveMode::Strict`]) still has dependents.
    pub fn remove_note(&mut self, id: NoteId, mode: RemoveMode) -> Result<(), CoreError> {
        if id.is_base() || !self.notes.contains_key(&id) {
            return Err(CoreError::ReferenceError { note: id.value() });
        }

        let dependents = self.graph.dependents(id);

        if mode == RemoveMode::Strict {
            if !dependents.is_empty() {
                return Err(CoreError::ReferenceError { note: id.value() });
            }
        } else {
            let Some(removed_note) = self.notes.get(&id).cloned() else {
                return Err(CoreError::ReferenceError { note: id.value() });
            };

            for dependent_id in &dependents {
                for property in ALL_PROPERTIES {
                    let Some(bytecode) = self
                        .notes
                        .get(dependent_id)
                        .and_then(|n| n.expression(property))
                        .map(|e| e.bytecode().clone())
                    else {
                        continue;
                    };
                    if !bytecode.dependencies().contains(&id) {
                        continue;
                    }
                    let text = decompiler::decompile(&bytecode, Dialect::Dsl)?;
                    let spliced = splice_out(&text, id, &removed_note)?;
                    let expr = parser::parse_as(&spliced, Dialect::Dsl)?;
                    let bc = compiler::compile(&expr, spliced)?;
                    self.apply_compiled(*dependent_id, property, bc)?;
                }

                let dependent_has_instrument =
                    self.notes.get(dependent_id).is_some_and(|n| n.instrument.is_some());
                if !dependent_has_instrument {
                    if let Some(instrument) = removed_note.instrument.clone() {
                        if let Some(dependent_note) = self.notes.get_mut(dependent_id) {
                            dependent_note.instrument = Some(instrument);
                        }
                    }
                }
            }
        }

        self.notes.remove(&id);
        self.graph.remove_note(id);
        self.cache.remove(&id);
        self.dirty.remove(&id);
        for dependent_id in dependents {
            self.mark_dirty(dependent_id);
        }
        Ok(())
    }

    /// Replace `id`'s expression for `property`. Rejected edits leave the
    /// module unchanged.
    ///
    /// # Errors
    /// Returns [`CoreError::ReferenceError`] if `id` does not exist or the
    /// new expression references a note that does not exist,
    /// [`CoreError::CycleError`] if it would close a dependency cycle, or
    /// whatever parse/compile error the source text produces.
    pub fn set_expression(&mut self, id: NoteId, property: Property, src: &str) -> Result<(), CoreError> {
        if !self.notes.contains_key(&id) {
            return Err(CoreError::ReferenceError { note: id.value() });
        }
        let bc = compile_source(src)?;
        self.apply_compiled(id, property, bc)
    }

    /// Apply several edits as one unit: every edit is validated, and the
    /// combined dependency graph they produce is checked for cycles once,
    /// before any of them is committed.
    ///
    /// # Errors
    /// Returns [`CoreError::ReferenceError`] if any target id or referenced
    /// dependency does not exist, [`CoreError::CycleError`] if the combined
    /// edits would close a cycle, or whatever parse/compile error a source
    /// string produces. On error, no edit in the batch is applied.
    pub fn batch_set_expressions(&mut self, edits: Vec<(NoteId, Property, String)>) -> Result<(), CoreError> {
        let mut compiled = Vec::with_capacity(edits.len());
        for (id, property, src) in &edits {
            if !self.notes.contains_key(id) {
                return Err(CoreError::ReferenceError { note: id.value() });
            }
            let bc = compile_source(src)?;
            for dep in bc.dependencies() {
                if !self.notes.contains_key(dep) {
                    return Err(CoreError::ReferenceError { note: dep.value() });
                }
            }
            compiled.push((*id, *property, bc));
        }

        let mut trial = self.graph.clone();
        for (id, property, bc) in &compiled {
            trial.set_property_edges(*id, *property, property_refs_of(bc));
        }
        if trial.has_cycle() {
            let offending = compiled.first().map_or(NoteId::BASE, |(id, _, _)| *id);
            return Err(CoreError::CycleError { note: offending.value() });
        }

        for (id, property, bc) in compiled {
            self.commit_compiled(id, property, bc);
        }
        Ok(())
    }

    /// Every note id `id` directly references, across all six properties.
    #[must_use]
    pub fn get_direct_dependencies(&self, id: NoteId) -> FxHashSet<NoteId> {
        self.graph.direct_dependencies(id)
    }

    /// Every note id that directly references `id`, in any property.
    #[must_use]
    pub fn get_dependents(&self, id: NoteId) -> FxHashSet<NoteId> {
        self.graph.dependents(id)
    }

    /// For each property, the set of note ids whose expression (in any of
    /// their own properties) loads `id`'s value of that property.
    #[must_use]
    pub fn get_dependents_by_property(&self, id: NoteId) -> FxHashMap<Property, FxHashSet<NoteId>> {
        let mut result = FxHashMap::default();
        for property in ALL_PROPERTIES {
            let ids = self
                .graph
                .property_dependents(id, property)
                .into_iter()
                .map(|(dependent_id, _)| dependent_id)
                .collect();
            result.insert(property, ids);
        }
        result
    }

    /// Walk `id`'s per-`property` parent chain to a fixed point, returning
    /// the visited ids in order starting with `id` itself. At each step
    /// the parent is the lowest-id note
    /// referenced by the current note's `property` expression; the walk
    /// stops at the base note or at a note with no further link.
    #[must_use]
    pub fn get_parent_chain(&self, id: NoteId, property: Property) -> Vec<NoteId> {
        let mut chain = Vec::new();
        let mut current = id;
        loop {
            chain.push(current);
            if current.is_base() {
                break;
            }
            let refs = self.graph.property_outgoing(current, property);
            let Some(parent) = refs.iter().map(|(note, _)| *note).min() else {
                break;
            };
            if chain.contains(&parent) {
                break;
            }
            current = parent;
        }
        chain
    }

    /// Breadth-first walk of `id`'s per-`property` dependents, returning
    /// `(descendant id, depth)` pairs with `id` itself excluded.
    #[must_use]
    pub fn get_children_tree(&self, id: NoteId, property: Property) -> Vec<(NoteId, usize)> {
        let mut result = Vec::new();
        let mut visited = FxHashSet::default();
        let mut queue: VecDeque<(NoteId, usize)> = VecDeque::new();
        queue.push_back((id, 0));
        visited.insert(id);
        while let Some((current, depth)) = queue.pop_front() {
            if current != id {
                result.push((current, depth));
            }
            for (child_id, _) in self.graph.property_dependents(current, property) {
                if visited.insert(child_id) {
                    queue.push_back((child_id, depth + 1));
                }
            }
        }
        result
    }

    /// This note's effective tempo: its own expression's value if it has
    /// one, otherwise its frequency-parent chain's, otherwise the base
    /// note's.
    ///
    /// # Errors
    /// Propagates whatever error evaluating the relevant expression
    /// produces.
    pub fn find_tempo(&mut self, note: NoteId) -> Result<Value, CoreError> {
        Ok(self.resolve_property(note, Property::Tempo)?.value)
    }

    /// This note's effective measure length: `beats_per_measure(note) * 60
    /// / tempo(note)`, recomputed from this note's own resolved
    /// `beats_per_measure` and `tempo` (each inheriting per
    /// [`Module::find_tempo`]'s rule) rather than read from a stored
    /// `measure_length` expression — a note never inherits another note's
    /// `measure_length` value directly, only its tempo/bpm ancestry.
    ///
    /// # Errors
    /// Propagates whatever error evaluating `beats_per_measure` or `tempo`
    /// produces, or [`CoreError::DivideByZero`] if the resolved tempo is
    /// zero.
    pub fn find_measure_length(&mut self, note: NoteId) -> Result<Value, CoreError> {
        let bpm = self.resolve_property(note, Property::BeatsPerMeasure)?.value;
        let tempo = self.resolve_property(note, Property::Tempo)?.value;
        let scaled = bpm.mul(&Value::int(60));
        Ok(scaled.value.div(&tempo)?.value)
    }

    /// This note's effective instrument: its own if set, otherwise the
    /// nearest ancestor's in the frequency-parent chain, otherwise
    /// `"sine-wave"`.
    #[must_use]
    pub fn find_instrument(&self, note: NoteId) -> String {
        let mut current = note;
        loop {
            let Some(n) = self.notes.get(&current) else {
                return "sine-wave".to_owned();
            };
            if let Some(instrument) = &n.instrument {
                return instrument.clone();
            }
            if current.is_base() {
                return "sine-wave".to_owned();
            }
            let Some(parent) = self.frequency_parent(current) else {
                return "sine-wave".to_owned();
            };
            current = parent;
        }
    }

    /// Generate `count` successive measure boundaries starting at `from`'s
    /// start time, stepping by `from`'s measure length.
    ///
    /// # Errors
    /// Propagates whatever error evaluating `from`'s start time or measure
    /// length produces.
    pub fn generate_measures(&mut self, from: NoteId, count: u32) -> Result<Vec<MeasureEntry>, CoreError> {
        let start = self.resolve_property(from, Property::StartTime)?.value;
        let step = self.find_measure_length(from)?;
        let start = to_rational(&start);
        let step = to_rational(&step);

        let mut entries = Vec::with_capacity(usize::try_from(count).unwrap_or(usize::MAX));
        for index in 0..count {
            let offset = step.mul(&BigRational::from_int(i64::from(index)));
            entries.push(MeasureEntry {
                time: start.add(&offset),
                index,
            });
        }
        Ok(entries)
    }

    /// Mark `id` and its transitive dependents dirty.
    pub fn mark_dirty(&mut self, id: NoteId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if self.dirty.insert(current) {
                stack.extend(self.graph.dependents(current));
            }
        }
    }

    /// Re-evaluate every dirty note, in an order where each note's
    /// dependencies are resolved before it is, then clear the dirty set.
    ///
    /// # Errors
    /// Propagates whatever error running an expression's bytecode
    /// produces, or [`CoreError::MalformedBytecode`] if the dirty subgraph
    /// contains a cycle that earlier edit-time checks somehow missed.
    pub fn evaluate(&mut self) -> Result<(), CoreError> {
        let dirty: FxHashSet<NoteId> = self.dirty.clone();
        let order = self.topological_order(&dirty)?;
        for id in order {
            for property in ALL_PROPERTIES {
                let Some(bytecode) = self
                    .notes
                    .get(&id)
                    .and_then(|n| n.expression(property))
                    .map(|e| e.bytecode().clone())
                else {
                    continue;
                };
                let outcome = evaluator::run(&bytecode, self)?;
                self.cache.entry(id).or_default().set(property, outcome.value, outcome.corrupted);
            }
            self.dirty.remove(&id);
        }
        Ok(())
    }

    /// Drop every cached value and mark every note dirty.
    pub fn invalidate_all(&mut self) {
        self.cache.clear();
        let ids: Vec<NoteId> = self.notes.keys().copied().collect();
        self.dirty.extend(ids);
    }

    /// Serialize this module to its JSON document shape: expressions are
    /// canonicalized to DSL source text.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut base_obj = serde_json::Map::new();
        if let Some(base) = self.notes.get(&NoteId::BASE) {
            for property in settable_properties() {
                if let Some(expr) = base.expression(property) {
                    if let Ok(text) = decompiler::decompile(expr.bytecode(), Dialect::Dsl) {
                        base_obj.insert(property.json_field().to_owned(), serde_json::Value::String(text));
                    }
                }
            }
        }

        let mut ids: Vec<NoteId> = self.notes.keys().copied().filter(|id| !id.is_base()).collect();
        ids.sort_by_key(NoteId::value);

        let mut notes_arr = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(note) = self.notes.get(&id) else { continue };
            let mut obj = serde_json::Map::new();
            obj.insert("id".to_owned(), serde_json::Value::from(id.value()));
            for property in settable_properties() {
                if let Some(expr) = note.expression(property) {
                    if let Ok(text) = decompiler::decompile(expr.bytecode(), Dialect::Dsl) {
                        obj.insert(property.json_field().to_owned(), serde_json::Value::String(text));
                    }
                }
            }
            if let Some(color) = &note.color {
                obj.insert("color".to_owned(), serde_json::Value::String(color.clone()));
            }
            if let Some(instrument) = &note.instrument {
                obj.insert("instrument".to_owned(), serde_json::Value::String(instrument.clone()));
            }
            notes_arr.push(serde_json::Value::Object(obj));
        }

        let mut root = serde_json::Map::new();
        root.insert("baseNote".to_owned(), serde_json::Value::Object(base_obj));
        root.insert("notes".to_owned(), serde_json::Value::Array(notes_arr));
        serde_json::Value::Object(root)
    }

    /// Load a module from its JSON document shape. Every expression
    /// string is parsed with dialect auto-detection.
    ///
    /// # Errors
    /// Returns [`CoreError::ParseError`] if `json` is not an object, a note
    /// entry is not an object, a note id is missing, not an integer, does
    /// not fit `u32`, or is `0` (reserved for the base note); otherwise
    /// propagates whatever error building the base note or a note's
    /// expressions produces.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        let root = json
            .as_object()
            .ok_or_else(|| CoreError::parse("module document must be a JSON object"))?;

        let mut overrides = BaseNoteOverrides::default();
        if let Some(base) = root.get("baseNote").and_then(serde_json::Value::as_object) {
            overrides.frequency = json_string(base, "frequency");
            overrides.start_time = json_string(base, "startTime");
            overrides.duration = json_string(base, "duration");
            overrides.tempo = json_string(base, "tempo");
            overrides.beats_per_measure = json_string(base, "beatsPerMeasure");
        }
        let mut module = Module::new(overrides)?;

        let notes = root.get("notes").and_then(serde_json::Value::as_array);
        for entry in notes.into_iter().flatten() {
            let obj = entry
                .as_object()
                .ok_or_else(|| CoreError::parse("note entry must be a JSON object"))?;
            let raw_id = obj
                .get("id")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| CoreError::parse("note entry missing integer 'id'"))?;
            let raw_id = u32::try_from(raw_id).map_err(|_| CoreError::parse("note id does not fit u32"))?;
            if raw_id == 0 {
                return Err(CoreError::parse("note id 0 is reserved for the base note"));
            }

            let edits = NoteEdits {
                frequency: json_string(obj, "frequency"),
                start_time: json_string(obj, "startTime"),
                duration: json_string(obj, "duration"),
                tempo: json_string(obj, "tempo"),
                beats_per_measure: json_string(obj, "beatsPerMeasure"),
                measure_length: None,
                color: json_string(obj, "color"),
                instrument: json_string(obj, "instrument"),
            };
            let id = NoteId::from(raw_id);
            module.install_note(id, edits)?;
            if raw_id >= module.next_id {
                module.next_id = raw_id + 1;
            }
        }
        Ok(module)
    }

    /// Insert a brand-new note at `id` (which must not already exist):
    /// compile each present property, validate that every dependency it
    /// references already exists, install the note and its graph edges,
    /// and mark it dirty.
    fn install_note(&mut self, id: NoteId, edits: NoteEdits) -> Result<(), CoreError> {
        if self.notes.contains_key(&id) {
            return Err(CoreError::parse(format!("duplicate note id {}", id.value())));
        }

        let specs: [(Property, Option<&str>); 6] = [
            (Property::StartTime, edits.start_time.as_deref()),
            (Property::Duration, edits.duration.as_deref()),
            (Property::Frequency, edits.frequency.as_deref()),
            (Property::Tempo, edits.tempo.as_deref()),
            (Property::BeatsPerMeasure, edits.beats_per_measure.as_deref()),
            (Property::MeasureLength, edits.measure_length.as_deref()),
        ];

        let mut compiled: Vec<(Property, Bytecode)> = Vec::new();
        for (property, src) in specs {
            let Some(src) = src else { continue };
            let bc = compile_source(src)?;
            for dep in bc.dependencies() {
                if !self.notes.contains_key(dep) {
                    return Err(CoreError::ReferenceError { note: dep.value() });
                }
            }
            compiled.push((property, bc));
        }

        let mut note = Note::new(edits.color, edits.instrument);
        for (property, bc) in &compiled {
            note.set(*property, Some(CompiledExpression(bc.clone())));
        }
        self.notes.insert(id, note);
        for (property, bc) in compiled {
            let refs = property_refs_of(&bc);
            self.graph.set_property_edges(id, property, refs);
        }
        self.mark_dirty(id);
        Ok(())
    }

    /// Validate and install a single compiled property expression on an
    /// existing note: dependency existence, then cycle-freedom against the
    /// graph as it stands before this edit.
    fn apply_compiled(&mut self, id: NoteId, property: Property, bc: Bytecode) -> Result<(), CoreError> {
        for dep in bc.dependencies() {
            if !self.notes.contains_key(dep) {
                return Err(CoreError::ReferenceError { note: dep.value() });
            }
        }
        if self.graph.would_cycle(id, bc.dependencies()) {
            return Err(CoreError::CycleError { note: id.value() });
        }
        self.commit_compiled(id, property, bc);
        Ok(())
    }

    /// Install a single compiled property expression without any
    /// validation — used once validity has already been established,
    /// either by [`Module::apply_compiled`] or by a batch's whole-graph
    /// cycle check.
    fn commit_compiled(&mut self, id: NoteId, property: Property, bc: Bytecode) {
        let refs = property_refs_of(&bc);
        if let Some(note) = self.notes.get_mut(&id) {
            note.set(property, Some(CompiledExpression(bc)));
        }
        self.graph.set_property_edges(id, property, refs);
        self.mark_dirty(id);
    }

    /// The lowest-id note referenced by `note`'s own frequency expression,
    /// if any — the single hop used by [`Module::find_instrument`] and the
    /// tempo/measure-length inheritance chain.
    fn frequency_parent(&self, note: NoteId) -> Option<NoteId> {
        let refs = self.graph.property_outgoing(note, Property::Frequency);
        refs.iter().map(|(id, _)| *id).min()
    }

    /// Resolve `(note, property)` to a value: from cache if fresh, else by
    /// running its own expression (recursing through this same resolver
    /// for any cross-note loads it makes), else by the inheritance
    /// fallback.
    fn resolve_property(&mut self, note: NoteId, property: Property) -> Result<EvalOutcome, CoreError> {
        if !self.dirty.contains(&note) {
            if let Some(entry) = self.cache.get(&note) {
                if let Some(value) = entry.value(property) {
                    return Ok(EvalOutcome {
                        value: value.clone(),
                        corrupted: entry.is_corrupted(property),
                    });
                }
            }
        }

        let Some(target) = self.notes.get(&note) else {
            return Err(CoreError::ReferenceError { note: note.value() });
        };

        let outcome = if let Some(expr) = target.expression(property) {
            let bytecode = expr.bytecode().clone();
            evaluator::run(&bytecode, self)?
        } else if matches!(
            property,
            Property::Tempo | Property::BeatsPerMeasure | Property::MeasureLength
        ) {
            match self.frequency_parent(note) {
                Some(parent) => self.resolve_property(parent, property)?,
                None if note.is_base() => EvalOutcome {
                    value: Value::int(default_literal(property)),
                    corrupted: false,
                },
                None => self.resolve_property(NoteId::BASE, property)?,
            }
        } else if note.is_base() {
            EvalOutcome {
                value: Value::int(default_literal(property)),
                corrupted: false,
            }
        } else {
            self.resolve_property(NoteId::BASE, property)?
        };

        self.cache.entry(note).or_default().set(property, outcome.value.clone(), outcome.corrupted);
        Ok(outcome)
    }

    /// Kahn's-algorithm topological order over `subset`, considering only
    /// edges between members of `subset` (edges leaving it point at
    /// already-stable, non-dirty notes). Ties break on ascending note id.
    fn topological_order(&self, subset: &FxHashSet<NoteId>) -> Result<Vec<NoteId>, CoreError> {
        let mut indegree: FxHashMap<NoteId, usize> = subset.iter().map(|&id| (id, 0)).collect();
        for &id in subset {
            for dep in self.graph.direct_dependencies(id) {
                if subset.contains(&dep) {
                    *indegree.entry(id).or_insert(0) += 1;
                }
            }
        }

        let mut remaining = indegree.clone();
        let mut heap: BinaryHeap<Reverse<u32>> = indegree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&id, _)| Reverse(id.value()))
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        while let Some(Reverse(raw)) = heap.pop() {
            let current = NoteId::from(raw);
            order.push(current);
            for dependent in self.graph.dependents(current) {
                if !subset.contains(&dependent) {
                    continue;
                }
                if let Some(degree) = remaining.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(Reverse(dependent.value()));
                    }
                }
            }
        }

        if order.len() != subset.len() {
            return Err(CoreError::MalformedBytecode {
                msg: "dependency graph contains a cycle despite edit-time cycle checks".to_owned(),
            });
        }
        Ok(order)
    }
}

impl Resolver for Module {
    fn resolve(&mut self, note: NoteId, property: Property) -> Result<EvalOutcome, CoreError> {
        self.resolve_property(note, property)
    }
}

/// The five properties carried in the JSON document shape; `measure_length`
/// is always derived and never serialized.
fn settable_properties() -> [Property; 5] {
    [
        Property::Frequency,
        Property::StartTime,
        Property::Duration,
        Property::Tempo,
        Property::BeatsPerMeasure,
    ]
}

fn json_string(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(serde_json::Value::as_str).map(str::to_owned)
}

fn compile_source(src: &str) -> Result<Bytecode, CoreError> {
    let expr = parser::parse(src)?;
    compiler::compile(&expr, src)
}

fn default_literal(property: Property) -> i64 {
    match property {
        Property::Frequency => 440,
        Property::StartTime => 0,
        Property::Duration => 1,
        Property::Tempo => 60,
        Property::BeatsPerMeasure => 4,
        Property::MeasureLength => 1,
    }
}

fn to_rational(value: &Value) -> BigRational {
    match value {
        Value::Rational(r) => r.clone(),
        Value::Symbolic { base, exp, coef } => {
            BigRational::from_f64_approx(coef.to_f64() * base.to_f64().powf(exp.to_f64()))
        }
    }
}

/// The `(note, property)` pairs `bc` directly loads from, via either
/// `LOAD_REF` or `LOAD_BASE`.
fn property_refs_of(bc: &Bytecode) -> FxHashSet<PropertyRef> {
    let mut set = FxHashSet::default();
    for instr in bc.instructions() {
        match instr {
            Instruction::LoadRef { note, var_idx } => {
                if let Ok(property) = Property::from_var_index(*var_idx) {
                    set.insert((*note, property));
                }
            }
            Instruction::LoadBase { var_idx } => {
                if let Ok(property) = Property::from_var_index(*var_idx) {
                    set.insert((NoteId::BASE, property));
                }
            }
            _ => {}
        }
    }
    set
}

/// The canonical DSL spelling of a load of `(id, property)`, matching what
/// [`decompiler::decompile`] always produces for that property (helper-call
/// form for tempo/measure-length, dotted form otherwise).
fn canonical_token(id: NoteId, property: Property) -> String {
    match property {
        Property::Tempo => format!("tempo([{}])", id.value()),
        Property::MeasureLength => format!("measure([{}])", id.value()),
        other => format!("[{}].{}", id.value(), other.short_name()),
    }
}

/// Replace every occurrence of a reference to `removed_id` in `text` with
/// the removed note's own expression for that property, parenthesized.
/// Properties the removed note had no expression for are left as-is (the
/// caller's subsequent recompile will then surface the dangling reference
/// as a `ReferenceError`).
fn splice_out(text: &str, removed_id: NoteId, removed_note: &Note) -> Result<String, CoreError> {
    let mut result = text.to_owned();
    for property in ALL_PROPERTIES {
        let token = canonical_token(removed_id, property);
        if !result.contains(&token) {
            continue;
        }
        let Some(expr) = removed_note.expression(property) else {
            continue;
        };
        let replacement = format!("({})", decompiler::decompile(expr.bytecode(), Dialect::Dsl)?);
        result = result.replace(&token, &replacement);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_module_has_base_note_with_derived_measure_length() {
        let module = Module::default();
        let base = module.get_note(NoteId::BASE).expect("base note exists");
        assert!(base.expression(Property::MeasureLength).is_some());
    }

    #[test]
    fn add_note_allocates_monotonic_ids_never_reusing_deleted_ones() {
        let mut module = Module::default();
        let first = module.add_note(NoteEdits::default()).expect("adds");
        let second = module.add_note(NoteEdits::default()).expect("adds");
        assert_eq!(first, NoteId::from(1));
        assert_eq!(second, NoteId::from(2));

        module.remove_note(first, RemoveMode::Strict).expect("removes");
        let third = module.add_note(NoteEdits::default()).expect("adds");
        assert_eq!(third, NoteId::from(3));
    }

    #[test]
    fn set_expression_rejects_reference_to_missing_note() {
        let mut module = Module::default();
        let id = module.add_note(NoteEdits::default()).expect("adds");
        let err = module.set_expression(id, Property::Frequency, "[99].f").unwrap_err();
        assert!(matches!(err, CoreError::ReferenceError { note: 99 }));
    }

    #[test]
    fn set_expression_rejects_cycles_and_leaves_module_unchanged() {
        let mut module = Module::default();
        let n1 = module.add_note(NoteEdits::default()).expect("adds");
        let n2 = module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f", n1.value())),
                ..NoteEdits::default()
            })
            .expect("adds");
        let n3 = module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f", n2.value())),
                ..NoteEdits::default()
            })
            .expect("adds");

        let err = module
            .set_expression(n1, Property::Frequency, &format!("[{}].f", n3.value()))
            .unwrap_err();
        assert!(matches!(err, CoreError::CycleError { .. }));
        assert!(module.get_note(n1).expect("exists").expression(Property::Frequency).is_none());
    }

    #[test]
    fn dependency_diff_updates_inverse_edges_and_references_base() {
        let mut module = Module::default();
        let n1 = module.add_note(NoteEdits::default()).expect("adds");
        let n2 = module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f", n1.value())),
                ..NoteEdits::default()
            })
            .expect("adds");
        assert!(module.get_dependents(n1).contains(&n2));

        module.set_expression(n2, Property::Frequency, "base.f").expect("sets");
        assert!(!module.get_dependents(n1).contains(&n2));
        let bc = module
            .get_note(n2)
            .expect("exists")
            .expression(Property::Frequency)
            .expect("set");
        assert!(bc.bytecode().references_base());
    }

    #[test]
    fn mark_dirty_propagates_through_transitive_dependents() {
        let mut module = Module::default();
        let n1 = module.add_note(NoteEdits::default()).expect("adds");
        let n2 = module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f", n1.value())),
                ..NoteEdits::default()
            })
            .expect("adds");
        module.dirty.clear();
        module.mark_dirty(n1);
        assert!(module.dirty.contains(&n1));
        assert!(module.dirty.contains(&n2));
    }

    #[test]
    fn octave_closure_evaluates_exactly_with_corruption_only_on_intermediates() {
        let mut module = Module::default();
        let mut ids = Vec::new();
        for i in 1..=12u32 {
            let id = module
                .add_note(NoteEdits {
                    frequency: Some(format!("base.f*(2^({i}/12))")),
                    ..NoteEdits::default()
                })
                .expect("adds");
            ids.push(id);
        }
        module.evaluate().expect("evaluates");

        let twelfth = module.resolve_property(ids[11], Property::Frequency).expect("cached");
        assert_eq!(twelfth.value, Value::Rational(BigRational::from_int(880)));
        assert!(!twelfth.corrupted);

        let first = module.resolve_property(ids[0], Property::Frequency).expect("cached");
        assert!(first.corrupted);
    }

    #[test]
    fn major_scale_intervals_evaluate_to_exact_expected_frequencies() {
        let mut module = Module::default();
        let ratios = ["9/8", "5/4", "4/3", "3/2", "5/3", "15/8", "2/1"];
        let mut ids = Vec::new();
        for ratio in ratios {
            let id = module
                .add_note(NoteEdits {
                    frequency: Some(format!("base.f*({ratio})")),
                    ..NoteEdits::default()
                })
                .expect("adds");
            ids.push(id);
        }
        module.evaluate().expect("evaluates");

        let expected = [495, 550, 660, 733, 825, 880];
        // 586.666... (4/3 of 440) is not an integer; check it and the
        // remaining integral ones against their exact rationals instead.
        let third = module.resolve_property(ids[2], Property::Frequency).expect("cached");
        assert_eq!(third.value, Value::Rational(BigRational::new(1760, 3).expect("valid")));
        assert!(!third.corrupted);

        for (idx, hz) in [0, 1, 3, 4, 5].into_iter().zip([expected[0], expected[1], expected[3], expected[4], expected[5]])
        {
            let outcome = module.resolve_property(ids[idx], Property::Frequency).expect("cached");
            assert_eq!(outcome.value, Value::Rational(BigRational::from_int(hz)));
            assert!(!outcome.corrupted);
        }

        let sixth = module.resolve_property(ids[6], Property::Frequency).expect("cached");
        assert_eq!(sixth.value, Value::Rational(BigRational::from_int(880)));
    }

    #[test]
    fn inheritance_falls_back_to_base_tempo_and_sine_wave_instrument() {
        let mut module = Module::default();
        let parent = module.add_note(NoteEdits::default()).expect("adds");
        let child = module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f", parent.value())),
                ..NoteEdits::default()
            })
            .expect("adds");

        let tempo = module.find_tempo(child).expect("resolves");
        assert_eq!(tempo, Value::int(60));
        assert_eq!(module.find_instrument(child), "sine-wave");
    }

    #[test]
    fn find_instrument_inherits_through_frequency_chain() {
        let mut module = Module::default();
        let parent = module
            .add_note(NoteEdits {
                instrument: Some("piano".to_owned()),
                ..NoteEdits::default()
            })
            .expect("adds");
        let child = module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f", parent.value())),
                ..NoteEdits::default()
            })
            .expect("adds");
        assert_eq!(module.find_instrument(child), "piano");
    }

    #[test]
    fn remove_keep_dependencies_splices_removed_expression_and_propagates_instrument() {
        let mut module = Module::default();
        let removed = module
            .add_note(NoteEdits {
                frequency: Some("base.f*(5/4)".to_owned()),
                instrument: Some("violin".to_owned()),
                ..NoteEdits::default()
            })
            .expect("adds");
        let dependent = module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f*2", removed.value())),
                ..NoteEdits::default()
            })
            .expect("adds");

        module.remove_note(removed, RemoveMode::KeepDependencies).expect("removes");

        assert!(module.get_note(removed).is_none());
        assert_eq!(module.find_instrument(dependent), "violin");
        module.evaluate().expect("evaluates");
        let outcome = module.resolve_property(dependent, Property::Frequency).expect("cached");
        assert_eq!(outcome.value, Value::Rational(BigRational::new(1100, 1).expect("valid")));
    }

    #[test]
    fn remove_strict_rejects_when_dependents_remain() {
        let mut module = Module::default();
        let removed = module.add_note(NoteEdits::default()).expect("adds");
        module
            .add_note(NoteEdits {
                frequency: Some(format!("[{}].f", removed.value())),
                ..NoteEdits::default()
            })
            .expect("adds");
        let err = module.remove_note(removed, RemoveMode::Strict).unwrap_err();
        assert!(matches!(err, CoreError::ReferenceError { .. }));
    }

    #[test]
    fn json_round_trip_preserves_notes_and_attributes() {
        let mut module = Module::default();
        module
            .add_note(NoteEdits {
                frequency: Some("base.f*(5/4)".to_owned()),
                color: Some("#ff0000".to_owned()),
                instrument: Some("piano".to_owned()),
                ..NoteEdits::default()
            })
            .expect("adds");

        let json = module.to_json();
        let reloaded = Module::from_json(&json).expect("reloads");
        let note = reloaded.get_note(NoteId::from(1)).expect("note present");
        assert_eq!(note.color.as_deref(), Some("#ff0000"));
        assert_eq!(note.instrument.as_deref(), Some("piano"));
        assert!(note.expression(Property::Frequency).is_some());
    }

    #[test]
    fn generate_measures_steps_by_measure_length_from_reference_note() {
        let mut module = Module::default();
        let entries = module.generate_measures(NoteId::BASE, 3).expect("generates");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].time, BigRational::zero());
        // base tempo=60, bpm=4 => measure_length = 4 seconds.
        assert_eq!(entries[1].time, BigRational::from_int(4));
        assert_eq!(entries[2].time, BigRational::from_int(8));
    }

    #[test]
    fn find_measure_length_recomputes_from_tempo_and_bpm_instead_of_inheriting() {
        let mut module = Module::default();
        // bpm=4, tempo=120 referencing base => 4*60/120 = 2, not base's
        // stored measure_length of 4.
        let dependent = module
            .add_note(NoteEdits {
                tempo: Some("120".to_owned()),
                beats_per_measure: Some("base.bpm".to_owned()),
                ..NoteEdits::default()
            })
            .expect("adds");
        let measure_length = module.find_measure_length(dependent).expect("computes");
        assert_eq!(measure_length, Value::int(2));
    }

    #[test]
    fn find_measure_length_on_base_reflects_updated_tempo() {
        let mut module = Module::default();
        module
            .set_expression(NoteId::BASE, Property::Tempo, "120")
            .expect("sets");
        let measure_length = module.find_measure_length(NoteId::BASE).expect("computes");
        assert_eq!(measure_length, Value::int(2));
    }

    #[test]
    fn end_to_end_major_triad_evaluates_expected_timeline() {
        let mut module = Module::default();
        let n1 = module
            .add_note(NoteEdits {
                frequency: Some("base.f".to_owned()),
                start_time: Some("0".to_owned()),
                duration: Some("beat(base)".to_owned()),
                ..NoteEdits::default()
            })
            .expect("adds");
        let n2 = module
            .add_note(NoteEdits {
                frequency: Some("base.f*(5/4)".to_owned()),
                start_time: Some(format!("[{}].t+[{}].d", n1.value(), n1.value())),
                duration: Some("beat(base)".to_owned()),
                ..NoteEdits::default()
            })
            .expect("adds");
        let n3 = module
            .add_note(NoteEdits {
                frequency: Some("base.f*(3/2)".to_owned()),
                start_time: Some(format!("[{}].t+[{}].d", n2.value(), n2.value())),
                duration: Some("beat(base)".to_owned()),
                ..NoteEdits::default()
            })
            .expect("adds");

        module.evaluate().expect("evaluates");

        let freqs = [440, 550, 660];
        let starts = [0, 1, 2];
        for (id, (freq, start)) in [n1, n2, n3].into_iter().zip(freqs.into_iter().zip(starts)) {
            let f = module.resolve_property(id, Property::Frequency).expect("cached");
            assert_eq!(f.value, Value::int(freq));
            let t = module.resolve_property(id, Property::StartTime).expect("cached");
            assert_eq!(t.value, Value::int(start));
            let d = module.resolve_property(id, Property::Duration).expect("cached");
            assert_eq!(d.value, Value::int(1));
        }
    }
}
