//! Cache framework
//!
//! Schema facts are cached per field in a [`SchemaFields`] record. A record
//! lives either in the session-scoped [`SchemaCache`], shared by every
//! transaction opened against the same schema version, or in the
//! transaction-scoped [`TxCache`] once the transaction modifies the concept
//! (copy-on-write). Everything else the transaction caches (identity map,
//! current shards, new attributes) lives only in the [`TxCache`] and is
//! dropped with it. The persistent scope is the graph itself, see
//! `ConceptManager::persistent_prop`.

use super::attribute::DataType;
use super::events::{ConceptEvent, EventSink};
use super::{Concept, ConceptId, Label, LabelId};
use crate::graph::VertexId;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A lazily computed value
#[derive(Debug, Clone)]
pub struct Cache<T> {
    value: Option<T>,
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T: Clone> Cache<T> {
    /// Return the cached value, computing it first when absent
    pub fn get(&mut self, compute: impl FnOnce() -> T) -> T {
        self.value.get_or_insert_with(compute).clone()
    }

    pub fn peek(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn set(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Mutate the value only if it has already been computed
    pub fn if_present(&mut self, update: impl FnOnce(&mut T)) {
        if let Some(value) = self.value.as_mut() {
            update(value);
        }
    }

    pub fn clear(&mut self) {
        self.value = None;
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }
}

/// Cached facts of one schema concept. Only direct facts are cached;
/// transitive ones are walked from these.
#[derive(Debug, Clone, Default)]
pub struct SchemaFields {
    pub label: Cache<Label>,
    pub label_id: Cache<LabelId>,
    pub sup: Cache<Option<ConceptId>>,
    pub subs: Cache<BTreeSet<ConceptId>>,
    /// role -> required
    pub plays: Cache<BTreeMap<ConceptId, bool>>,
    pub played_by: Cache<BTreeSet<ConceptId>>,
    pub relates: Cache<BTreeSet<ConceptId>>,
    pub related_by: Cache<BTreeSet<ConceptId>>,
    pub is_abstract: Cache<bool>,
    pub is_implicit: Cache<bool>,
    pub data_type: Cache<Option<DataType>>,
    pub regex: Cache<Option<String>>,
}

/// Accessor of one cached field
pub type Field<T> = fn(&mut SchemaFields) -> &mut Cache<T>;

/// Concepts and labels whose cached facts a schema commit made stale
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invalidation {
    pub concepts: BTreeSet<ConceptId>,
    pub labels: BTreeSet<Label>,
}

/// Session-scoped schema cache for one schema version
#[derive(Debug, Default)]
pub struct SchemaCache {
    version: u64,
    concepts: DashMap<ConceptId, SchemaFields>,
    labels: DashMap<Label, ConceptId>,
}

impl SchemaCache {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            concepts: DashMap::new(),
            labels: DashMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cached_concepts(&self) -> usize {
        self.concepts.len()
    }

    pub(crate) fn read<T: Clone>(&self, id: ConceptId, field: Field<T>) -> Option<T> {
        let mut fields = self.concepts.get_mut(&id)?;
        field(&mut fields).peek().cloned()
    }

    pub(crate) fn write<T: Clone>(&self, id: ConceptId, field: Field<T>, value: T) {
        let mut fields = self.concepts.entry(id).or_default();
        field(&mut fields).set(value);
    }

    pub(crate) fn fields(&self, id: ConceptId) -> Option<SchemaFields> {
        self.concepts.get(&id).map(|f| f.clone())
    }

    pub(crate) fn label(&self, label: &Label) -> Option<ConceptId> {
        self.labels.get(label).map(|id| *id)
    }

    pub(crate) fn cache_label(&self, label: Label, id: ConceptId) {
        self.labels.insert(label, id);
    }

    /// The cache for a later schema version, keeping every entry the
    /// intervening commits did not invalidate
    pub(crate) fn successor(&self, version: u64, invalidations: &[Invalidation]) -> SchemaCache {
        let next = SchemaCache::new(version);
        let stale = |id: &ConceptId| invalidations.iter().any(|inv| inv.concepts.contains(id));
        let stale_label = |label: &Label| invalidations.iter().any(|inv| inv.labels.contains(label));
        for entry in self.concepts.iter() {
            if !stale(entry.key()) {
                next.concepts.insert(*entry.key(), entry.value().clone());
            }
        }
        for entry in self.labels.iter() {
            if !stale_label(entry.key()) && !stale(entry.value()) {
                next.labels.insert(entry.key().clone(), *entry.value());
            }
        }
        next
    }
}

/// Transaction-scoped cache; also the default event sink
#[derive(Default)]
pub struct TxCache {
    /// Identity map: the one live concept per id
    pub(crate) concepts: HashMap<ConceptId, Concept>,
    /// Reified relation vertex -> the edge-derived id it carries
    pub(crate) reified_aliases: HashMap<VertexId, ConceptId>,
    /// Copy-on-write schema facts of concepts this transaction modified
    pub(crate) schema_fields: HashMap<ConceptId, SchemaFields>,
    pub(crate) modified_schema: BTreeSet<ConceptId>,
    /// Label lookups this transaction overrides; `None` marks a removed label
    pub(crate) labels: HashMap<Label, Option<ConceptId>>,
    pub(crate) new_labels: BTreeSet<Label>,
    pub(crate) invalidated_labels: BTreeSet<Label>,
    pub(crate) current_shards: HashMap<ConceptId, VertexId>,
    pub(crate) thing_types: HashMap<ConceptId, ConceptId>,
    /// Attribute index -> attribute created or found by this transaction
    pub(crate) attributes: HashMap<String, ConceptId>,
    pub(crate) new_attributes: BTreeMap<String, BTreeSet<ConceptId>>,
    /// type -> net new direct instances
    pub(crate) instance_counts: BTreeMap<ConceptId, i64>,
    pub(crate) tracked_things: BTreeSet<ConceptId>,
    pub(crate) tracked_relations: BTreeSet<ConceptId>,
    pub(crate) tracked_schema: BTreeSet<ConceptId>,
}

impl TxCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_schema_modified(&self, id: ConceptId) -> bool {
        self.modified_schema.contains(&id)
    }

    /// Drop every trace of a concept that no longer exists
    pub(crate) fn forget(&mut self, id: ConceptId) {
        if let Some(concept) = self.concepts.remove(&id) {
            concept.mark_deleted();
        }
        self.thing_types.remove(&id);
        self.tracked_things.remove(&id);
        self.tracked_relations.remove(&id);
        self.tracked_schema.remove(&id);
        self.reified_aliases.retain(|_, alias| *alias != id);
    }

    /// Schema changes as stale-cache information for the session cache
    pub(crate) fn invalidation(&self) -> Invalidation {
        Invalidation {
            concepts: self.modified_schema.clone(),
            labels: self.invalidated_labels.union(&self.new_labels).cloned().collect(),
        }
    }

    pub(crate) fn has_schema_changes(&self) -> bool {
        !self.modified_schema.is_empty()
    }
}

impl EventSink for TxCache {
    fn on_event(&mut self, event: &ConceptEvent) {
        match event {
            ConceptEvent::SchemaConceptCreated { concept, label } => {
                self.labels.insert(label.clone(), Some(*concept));
                self.new_labels.insert(label.clone());
                self.modified_schema.insert(*concept);
                self.tracked_schema.insert(*concept);
            }
            ConceptEvent::SchemaConceptModified { concept } => {
                self.modified_schema.insert(*concept);
                self.tracked_schema.insert(*concept);
            }
            ConceptEvent::SchemaConceptDeleted { concept, label } => {
                self.labels.insert(label.clone(), None);
                self.invalidated_labels.insert(label.clone());
                self.new_labels.remove(label);
                self.modified_schema.insert(*concept);
                self.schema_fields.remove(concept);
                self.forget(*concept);
            }
            ConceptEvent::LabelChanged { concept, old, new } => {
                self.labels.insert(old.clone(), None);
                self.labels.insert(new.clone(), Some(*concept));
                self.invalidated_labels.insert(old.clone());
                self.new_labels.insert(new.clone());
                self.modified_schema.insert(*concept);
            }
            ConceptEvent::InstanceCreated { type_id, instance } => {
                *self.instance_counts.entry(*type_id).or_insert(0) += 1;
                self.thing_types.insert(*instance, *type_id);
                self.tracked_things.insert(*instance);
            }
            ConceptEvent::InstanceDeleted { type_id, instance } => {
                *self.instance_counts.entry(*type_id).or_insert(0) -= 1;
                self.forget(*instance);
            }
            ConceptEvent::AttributeCreated { index, attribute } => {
                self.attributes.insert(index.clone(), *attribute);
                self.new_attributes.entry(index.clone()).or_default().insert(*attribute);
            }
            ConceptEvent::AttributeDeleted { index, attribute } => {
                if self.attributes.get(index) == Some(attribute) {
                    self.attributes.remove(index);
                }
                if let Some(ids) = self.new_attributes.get_mut(index) {
                    ids.remove(attribute);
                    if ids.is_empty() {
                        self.new_attributes.remove(index);
                    }
                }
            }
            ConceptEvent::AttributeLinked { relation, owner, attribute } => {
                self.tracked_relations.insert(*relation);
                self.tracked_things.insert(*owner);
                self.tracked_things.insert(*attribute);
            }
            ConceptEvent::CastingAdded { relation, player, .. }
            | ConceptEvent::CastingRemoved { relation, player, .. } => {
                self.tracked_relations.insert(*relation);
                self.tracked_things.insert(*player);
            }
            ConceptEvent::RelationReified { relation, vertex } => {
                self.reified_aliases.insert(*vertex, *relation);
                self.tracked_relations.insert(*relation);
            }
            ConceptEvent::ShardCreated { type_id, shard } => {
                self.current_shards.insert(*type_id, *shard);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VertexId;

    fn id(raw: u64) -> ConceptId {
        ConceptId::Vertex(VertexId::new(raw))
    }

    #[test]
    fn cache_computes_once() {
        let mut cache: Cache<u32> = Cache::default();
        let mut calls = 0;
        assert_eq!(cache.get(|| {
            calls += 1;
            7
        }), 7);
        assert_eq!(cache.get(|| 8), 7);
        assert_eq!(calls, 1);
    }

    #[test]
    fn if_present_does_not_force_compute() {
        let mut cache: Cache<BTreeSet<u32>> = Cache::default();
        cache.if_present(|set| {
            set.insert(1);
        });
        assert!(!cache.is_present());

        cache.set(BTreeSet::new());
        cache.if_present(|set| {
            set.insert(1);
        });
        assert_eq!(cache.peek().map(|s| s.len()), Some(1));
    }

    #[test]
    fn successor_drops_invalidated_entries() {
        let cache = SchemaCache::new(1);
        cache.write(id(1), |f| &mut f.is_abstract, true);
        cache.write(id(2), |f| &mut f.is_abstract, false);
        cache.cache_label(Label::from("person"), id(1));
        cache.cache_label(Label::from("car"), id(2));

        let invalidation = Invalidation {
            concepts: [id(1)].into_iter().collect(),
            labels: BTreeSet::new(),
        };
        let next = cache.successor(2, &[invalidation]);

        assert_eq!(next.version(), 2);
        assert_eq!(next.read(id(1), |f| &mut f.is_abstract), None);
        assert_eq!(next.read(id(2), |f| &mut f.is_abstract), Some(false));
        assert_eq!(next.label(&Label::from("person")), None);
        assert_eq!(next.label(&Label::from("car")), Some(id(2)));
    }

    #[test]
    fn deleted_attribute_leaves_no_stale_index_entry() {
        let mut cache = TxCache::new();
        let index = "ATTRIBUTE-name-alice".to_string();
        cache.on_event(&ConceptEvent::AttributeCreated {
            index: index.clone(),
            attribute: id(5),
        });
        cache.on_event(&ConceptEvent::AttributeDeleted {
            index: index.clone(),
            attribute: id(5),
        });

        assert!(!cache.attributes.contains_key(&index));
        assert!(!cache.new_attributes.contains_key(&index));
    }

    #[test]
    fn instance_events_drive_sharding_counts() {
        let mut cache = TxCache::new();
        cache.on_event(&ConceptEvent::InstanceCreated {
            type_id: id(1),
            instance: id(10),
        });
        cache.on_event(&ConceptEvent::InstanceCreated {
            type_id: id(1),
            instance: id(11),
        });
        cache.on_event(&ConceptEvent::InstanceDeleted {
            type_id: id(1),
            instance: id(10),
        });
        assert_eq!(cache.instance_counts.get(&id(1)), Some(&1));
        assert!(!cache.tracked_things.contains(&id(10)));
    }
}
