//! Dependency graph: per-note forward/inverse edges and the finer
//! per-(id, property) dependent index.
//!
//! Owns its state directly rather than through a global registry;
//! `rustc-hash` backs the adjacency maps since note ids are not
//! adversarial input and a faster, non-DoS-resistant hasher is the right
//! tradeoff here.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::note_id::NoteId;
use crate::core::property::{ALL_PROPERTIES, Property};

/// A `(note, property)` pair, used as both a dependency-graph node and an
/// edge endpoint.
pub type PropertyRef = (NoteId, Property);

/// Forward/inverse dependency edges between notes, plus the finer
/// per-(note, property) dependent index used by
/// [`get_dependents_by_property`](crate::module::Module::get_dependents_by_property)
/// and the parent/children-tree walks.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// `(note, property) -> the (note, property) pairs it directly loads`.
    outgoing: FxHashMap<PropertyRef, FxHashSet<PropertyRef>>,
    /// `(note, property) -> the (note, property) pairs that load it`.
    incoming: FxHashMap<PropertyRef, FxHashSet<PropertyRef>>,
    /// Note-level forward edges: the union, over a note's six properties,
    /// of every note id it references.
    forward: FxHashMap<NoteId, FxHashSet<NoteId>>,
    /// Note-level inverse edges: the ids that reference this note, in any
    /// property.
    inverse: FxHashMap<NoteId, FxHashSet<NoteId>>,
}

impl DependencyGraph {
    /// A fresh, empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the outgoing edges for `(note, property)` with `deps`,
    /// updating the incoming index and the note-level forward/inverse
    /// views to match.
    pub fn set_property_edges(
        &mut self,
        note: NoteId,
        property: Property,
        deps: FxHashSet<PropertyRef>,
    ) {
        let key = (note, property);
        if let Some(old) = self.outgoing.remove(&key) {
            for dep in &old {
                if let Some(set) = self.incoming.get_mut(dep) {
                    set.remove(&key);
                }
            }
        }
        for dep in &deps {
            self.incoming.entry(*dep).or_default().insert(key);
        }
        self.outgoing.insert(key, deps);
        self.recompute_note_level(note);
    }

    /// Recompute the note-level forward/inverse views for `note` from its
    /// six properties' outgoing sets.
    fn recompute_note_level(&mut self, note: NoteId) {
        let mut targets = FxHashSet::default();
        for property in ALL_PROPERTIES {
            if let Some(deps) = self.outgoing.get(&(note, property)) {
                targets.extend(deps.iter().map(|(id, _)| *id));
            }
        }
        let old_targets = self.forward.remove(&note).unwrap_or_default();
        for removed in old_targets.difference(&targets) {
            if let Some(set) = self.inverse.get_mut(removed) {
                set.remove(&note);
            }
        }
        for added in targets.difference(&old_targets) {
            self.inverse.entry(*added).or_default().insert(note);
        }
        self.forward.insert(note, targets);
    }

    /// Remove every edge touching `note` (both as a source and a target),
    /// across all six properties.
    pub fn remove_note(&mut self, note: NoteId) {
        for property in ALL_PROPERTIES {
            self.set_property_edges(note, property, FxHashSet::default());
        }
        self.forward.remove(&note);
        self.inverse.remove(&note);
        for property in ALL_PROPERTIES {
            self.incoming.remove(&(note, property));
        }
    }

    /// Every note id `note` directly references, across all six
    /// properties.
    #[must_use]
    pub fn direct_dependencies(&self, note: NoteId) -> FxHashSet<NoteId> {
        self.forward.get(&note).cloned().unwrap_or_default()
    }

    /// Every note id that directly references `note`, in any property.
    #[must_use]
    pub fn dependents(&self, note: NoteId) -> FxHashSet<NoteId> {
        self.inverse.get(&note).cloned().unwrap_or_default()
    }

    /// The `(dependent id, dependent property)` pairs that load
    /// `(note, property)`.
    #[must_use]
    pub fn property_dependents(&self, note: NoteId, property: Property) -> FxHashSet<PropertyRef> {
        self.incoming.get(&(note, property)).cloned().unwrap_or_default()
    }

    /// The `(note, property)` pairs that `(note, property)` directly loads —
    /// used by the parent-chain walk, which cares which specific property of
    /// a parent note was referenced, not just that the parent was.
    #[must_use]
    pub fn property_outgoing(&self, note: NoteId, property: Property) -> FxHashSet<PropertyRef> {
        self.outgoing.get(&(note, property)).cloned().unwrap_or_default()
    }

    /// Whether the note-level forward graph, taken as a whole, contains a
    /// cycle. Used by batched edits, which validate the combined result of
    /// several simultaneous edge changes rather than checking each one in
    /// isolation against a graph the others haven't been applied to yet.
    #[must_use]
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: FxHashMap<NoteId, Mark> = FxHashMap::default();
        let ids: FxHashSet<NoteId> = self.forward.keys().chain(self.inverse.keys()).copied().collect();

        for start in ids {
            if marks.contains_key(&start) {
                continue;
            }
            let mut stack = vec![(start, false)];
            while let Some((current, leaving)) = stack.pop() {
                if leaving {
                    marks.insert(current, Mark::Done);
                    continue;
                }
                match marks.get(&current) {
                    Some(Mark::Done) => continue,
                    Some(Mark::Visiting) => return true,
                    None => {}
                }
                marks.insert(current, Mark::Visiting);
                stack.push((current, true));
                if let Some(next) = self.forward.get(&current) {
                    for &dep in next {
                        stack.push((dep, false));
                    }
                }
            }
        }
        false
    }

    /// Whether installing edges from `note` to every id in `deps` would
    /// close a cycle in the note-level forward graph — i.e. whether any
    /// id in `deps` can already reach `note`.
    #[must_use]
    pub fn would_cycle(&self, note: NoteId, deps: &FxHashSet<NoteId>) -> bool {
        let mut visited = FxHashSet::default();
        let mut stack: Vec<NoteId> = deps.iter().copied().collect();
        while let Some(current) = stack.pop() {
            if current == note {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = self.forward.get(&current) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    /// All note ids currently tracked in the note-level forward/inverse
    /// views (used by the evaluator's topological pass).
    #[must_use]
    pub fn known_ids(&self) -> FxHashSet<NoteId> {
        self.forward.keys().chain(self.inverse.keys()).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NoteId {
        NoteId::from(n)
    }

    #[test]
    fn set_property_edges_updates_forward_and_inverse() {
        let mut g = DependencyGraph::new();
        let deps: FxHashSet<PropertyRef> = [(id(2), Property::Frequency)].into_iter().collect();
        g.set_property_edges(id(1), Property::Frequency, deps);

        assert_eq!(g.direct_dependencies(id(1)), [id(2)].into_iter().collect());
        assert_eq!(g.dependents(id(2)), [id(1)].into_iter().collect());
        assert_eq!(
            g.property_dependents(id(2), Property::Frequency),
            [(id(1), Property::Frequency)].into_iter().collect()
        );
    }

    #[test]
    fn replacing_edges_clears_stale_entries() {
        let mut g = DependencyGraph::new();
        g.set_property_edges(
            id(1),
            Property::Frequency,
            [(id(2), Property::Frequency)].into_iter().collect(),
        );
        g.set_property_edges(
            id(1),
            Property::Frequency,
            [(id(3), Property::Frequency)].into_iter().collect(),
        );
        assert!(g.dependents(id(2)).is_empty());
        assert_eq!(g.dependents(id(3)), [id(1)].into_iter().collect());
    }

    #[test]
    fn detects_would_be_cycle() {
        let mut g = DependencyGraph::new();
        g.set_property_edges(id(1), Property::Frequency, [(id(2), Property::Frequency)].into_iter().collect());
        g.set_property_edges(id(2), Property::Frequency, [(id(3), Property::Frequency)].into_iter().collect());
        // 3 -> 1 would close the cycle 1 -> 2 -> 3 -> 1.
        assert!(g.would_cycle(id(3), &[id(1)].into_iter().collect()));
        assert!(!g.would_cycle(id(3), &[id(4)].into_iter().collect()));
    }

    #[test]
    fn remove_note_clears_all_its_edges() {
        let mut g = DependencyGraph::new();
        g.set_property_edges(id(1), Property::Frequency, [(id(2), Property::Frequency)].into_iter().collect());
        g.remove_note(id(1));
        assert!(g.direct_dependencies(id(1)).is_empty());
        assert!(g.dependents(id(2)).is_empty());
    }
}
