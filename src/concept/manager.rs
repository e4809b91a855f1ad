//! Concept manager: the per-transaction identity map and concept factory

use super::cache::{Field, SchemaCache, SchemaFields, TxCache};
use super::events::{ConceptEvent, EventSink};
use super::relation::{RelationEdge, RelationReified, RelationStructure};
use super::schema::{vertex_property, BaseType, EdgeLabel, MetaSchema};
use super::{Backing, Concept, ConceptId, ConceptKind, Label, LabelId};
use crate::error::{ConceptError, ConceptResult, TransactionError};
use crate::graph::{Direction, EdgeId, GraphTx, PropertyValue, VertexId};
use crate::session::{Keyspace, TransactionId, TransactionType};
use std::sync::Arc;
use tracing::{debug, trace};

/// Owns everything one transaction knows: its graph view, its caches and
/// the identity map. All concept operations are methods on this type.
pub struct ConceptManager {
    pub(crate) keyspace: Arc<Keyspace>,
    pub(crate) tx_id: TransactionId,
    pub(crate) tx_type: TransactionType,
    pub(crate) open: bool,
    pub(crate) graph: GraphTx,
    pub(crate) cache: TxCache,
    /// Session-scoped cache of the snapshot's schema version, when usable
    pub(crate) session_cache: Option<Arc<SchemaCache>>,
    pub(crate) snapshot_version: u64,
    sink: Option<Box<dyn EventSink>>,
}

impl ConceptManager {
    pub(crate) fn new(
        keyspace: Arc<Keyspace>,
        tx_id: TransactionId,
        tx_type: TransactionType,
        graph: GraphTx,
        session_cache: Option<Arc<SchemaCache>>,
        snapshot_version: u64,
    ) -> Self {
        Self {
            keyspace,
            tx_id,
            tx_type,
            open: true,
            graph,
            cache: TxCache::new(),
            session_cache,
            snapshot_version,
            sink: None,
        }
    }

    /// Observe every concept event this transaction emits, in addition to
    /// the transaction cache
    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sink = Some(sink);
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.tx_id
    }

    pub fn transaction_type(&self) -> TransactionType {
        self.tx_type
    }

    pub fn keyspace_name(&self) -> &str {
        self.keyspace.name()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.open && self.tx_type == TransactionType::Write
    }

    pub(crate) fn check_open(&self) -> ConceptResult<()> {
        if !self.open {
            return Err(TransactionError::Closed.into());
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> ConceptResult<()> {
        self.check_open()?;
        if self.tx_type != TransactionType::Write {
            return Err(TransactionError::ReadOnly.into());
        }
        Ok(())
    }

    /// The concept must come from this transaction and still exist
    pub(crate) fn check_owned(&self, concept: &Concept) -> ConceptResult<()> {
        self.check_open()?;
        self.check_element_owner(concept.transaction(), concept.id())?;
        if concept.is_deleted() {
            return Err(TransactionError::ConceptDeleted(concept.id().to_string()).into());
        }
        Ok(())
    }

    pub(crate) fn check_kind(&self, concept: &Concept, accept: fn(ConceptKind) -> bool, expected: &'static str) -> ConceptResult<()> {
        self.check_owned(concept)?;
        if !accept(concept.kind()) {
            return Err(TransactionError::WrongKind {
                concept: concept.id().to_string(),
                actual: concept.kind().name(),
                expected,
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn emit(&mut self, event: ConceptEvent) {
        trace!(?event, "concept.event");
        self.cache.on_event(&event);
        if let Some(sink) = self.sink.as_mut() {
            sink.on_event(&event);
        }
    }

    // === Lookup ===

    /// The concept with this id, or `None` if it does not exist in this transaction
    pub fn get_concept(&mut self, id: ConceptId) -> ConceptResult<Option<Concept>> {
        self.check_open()?;
        if let Some(concept) = self.cache.concepts.get(&id) {
            return Ok(Some(concept.clone()));
        }
        match id {
            ConceptId::Vertex(v) => {
                if !self.graph.vertex_exists(v) {
                    return Ok(None);
                }
                self.build_vertex(v).map(Some)
            }
            ConceptId::Edge(e) => {
                if let Some(edge) = self.graph.edge(e) {
                    if edge.label != EdgeLabel::Attribute.as_str() {
                        return Ok(None);
                    }
                    return self.build_edge(e).map(Some);
                }
                // Reified since: the vertex carries the edge's id
                let reified = self
                    .graph
                    .vertex_by_property(vertex_property::EDGE_RELATION_ID, &edge_id_property(e));
                match reified {
                    Some(v) => self.build_vertex(v).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    pub fn get_schema_concept(&mut self, label: &str) -> ConceptResult<Option<Concept>> {
        self.check_open()?;
        let label = Label::from(label);
        if let Some(overridden) = self.cache.labels.get(&label).copied() {
            return match overridden {
                Some(id) => self.get_concept(id),
                None => Ok(None),
            };
        }
        if let Some(id) = self.session_cache.as_ref().and_then(|c| c.label(&label)) {
            if let Some(concept) = self.get_concept(id)? {
                return Ok(Some(concept));
            }
        }
        let found = self
            .graph
            .vertex_by_property(vertex_property::SCHEMA_LABEL, &PropertyValue::String(label.to_string()));
        let Some(v) = found else {
            return Ok(None);
        };
        let concept = self.build_vertex(v)?;
        if let Some(cache) = self.session_cache.as_ref() {
            if !self.cache.is_schema_modified(concept.id()) {
                cache.cache_label(label, concept.id());
            }
        }
        Ok(Some(concept))
    }

    fn get_schema_concept_of(&mut self, label: &str, kind: ConceptKind) -> ConceptResult<Option<Concept>> {
        Ok(self.get_schema_concept(label)?.filter(|c| c.kind() == kind))
    }

    pub fn get_entity_type(&mut self, label: &str) -> ConceptResult<Option<Concept>> {
        self.get_schema_concept_of(label, ConceptKind::EntityType)
    }

    pub fn get_relation_type(&mut self, label: &str) -> ConceptResult<Option<Concept>> {
        self.get_schema_concept_of(label, ConceptKind::RelationType)
    }

    pub fn get_attribute_type(&mut self, label: &str) -> ConceptResult<Option<Concept>> {
        self.get_schema_concept_of(label, ConceptKind::AttributeType)
    }

    pub fn get_role(&mut self, label: &str) -> ConceptResult<Option<Concept>> {
        self.get_schema_concept_of(label, ConceptKind::Role)
    }

    pub fn get_rule(&mut self, label: &str) -> ConceptResult<Option<Concept>> {
        self.get_schema_concept_of(label, ConceptKind::Rule)
    }

    /// Resolve a label id to its schema concept
    pub fn get_schema_concept_by_label_id(&mut self, label_id: LabelId) -> ConceptResult<Option<Concept>> {
        self.check_open()?;
        let found = self
            .graph
            .vertex_by_property(vertex_property::LABEL_ID, &PropertyValue::Long(label_id.as_u32() as i64));
        match found {
            Some(v) => self.build_vertex(v).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn meta(&mut self, meta: MetaSchema) -> ConceptResult<Concept> {
        self.get_schema_concept(meta.label())?
            .ok_or_else(|| ConceptError::UnknownConcept(format!("meta concept '{}'", meta.label())))
    }

    pub(crate) fn is_meta(&mut self, concept: &Concept) -> ConceptResult<bool> {
        if !concept.kind().is_schema() {
            return Ok(false);
        }
        let label = self.label(concept)?;
        Ok(MetaSchema::is_meta_label(label.as_str()))
    }

    pub(crate) fn next_label_id(&self) -> LabelId {
        self.keyspace.next_label_id()
    }

    // === Factory ===

    /// The concept backed by a vertex, built on first access
    pub(crate) fn build_vertex(&mut self, v: VertexId) -> ConceptResult<Concept> {
        if let Some(alias) = self.cache.reified_aliases.get(&v) {
            if let Some(concept) = self.cache.concepts.get(alias) {
                return Ok(concept.clone());
            }
        }
        if let Some(concept) = self.cache.concepts.get(&ConceptId::Vertex(v)) {
            return Ok(concept.clone());
        }
        let element = self
            .vertex_element(v)
            .ok_or_else(|| ConceptError::UnknownConcept(ConceptId::Vertex(v).to_string()))?;
        let kind = self.resolve_kind(v)?;

        let (id, backing) = if kind == ConceptKind::Relation {
            let id = match self.vertex_prop(v, vertex_property::EDGE_RELATION_ID) {
                Some(PropertyValue::Long(raw)) => ConceptId::Edge(EdgeId::new(raw as u64)),
                _ => ConceptId::Vertex(v),
            };
            if let Some(concept) = self.cache.concepts.get(&id) {
                return Ok(concept.clone());
            }
            if let ConceptId::Edge(_) = id {
                self.cache.reified_aliases.insert(v, id);
            }
            (id, Backing::Relation(RelationStructure::Reified(RelationReified { element })))
        } else {
            (ConceptId::Vertex(v), Backing::Vertex(element))
        };

        let concept = Concept::new(id, kind, backing);
        self.cache.concepts.insert(id, concept.clone());
        trace!(concept = %id, kind = %kind, "concept.built");
        Ok(concept)
    }

    /// The edge-form relation backed by an attribute edge
    pub(crate) fn build_edge(&mut self, e: EdgeId) -> ConceptResult<Concept> {
        let id = ConceptId::Edge(e);
        if let Some(concept) = self.cache.concepts.get(&id) {
            return Ok(concept.clone());
        }
        let edge = self
            .graph
            .edge(e)
            .ok_or_else(|| ConceptError::UnknownConcept(id.to_string()))?;
        if edge.label != EdgeLabel::Attribute.as_str() {
            return Err(ConceptError::UnknownConcept(format!("{} is a '{}' edge", id, edge.label)));
        }
        let element = self.wrap_edge(&edge);
        let concept = Concept::new(
            id,
            ConceptKind::Relation,
            Backing::Relation(RelationStructure::Edge(RelationEdge { element })),
        );
        self.cache.concepts.insert(id, concept.clone());
        trace!(concept = %id, "concept.built");
        Ok(concept)
    }

    fn resolve_kind(&self, v: VertexId) -> ConceptResult<ConceptKind> {
        let marker = self
            .marker(v)
            .ok_or_else(|| ConceptError::UnknownConcept(ConceptId::Vertex(v).to_string()))?;
        match BaseType::from_marker(&marker).and_then(|base| base.concept_kind()) {
            Some(kind) => Ok(kind),
            None => self.kind_from_shard(v, &marker),
        }
    }

    /// Secondary resolution for a shard or unreadable marker: the kind of
    /// instance the owning type of the shard edge has
    fn kind_from_shard(&self, v: VertexId, marker: &str) -> ConceptResult<ConceptKind> {
        let id = ConceptId::Vertex(v);
        let owner = self
            .neighbours(v, Direction::Out, EdgeLabel::Shard)
            .into_iter()
            .next()
            .ok_or_else(|| ConceptError::temporary_write(id, format!("index overlap: cannot resolve marker '{}'", marker)))?;
        let owner_marker = self
            .marker(owner)
            .ok_or_else(|| ConceptError::temporary_write(id, "index overlap: shard owner vanished"))?;
        match BaseType::from_marker(&owner_marker) {
            Some(base) => {
                let kind = base.instance_kind().ok_or_else(|| {
                    ConceptError::UnknownConcept(format!("{} is sharded under a {}", id, owner_marker))
                })?;
                debug!(concept = %id, %marker, kind = %kind, "concept.kind.resolved_via_shard");
                Ok(kind)
            }
            None => Err(ConceptError::temporary_write(
                id,
                format!("index overlap: shard owner has marker '{}'", owner_marker),
            )),
        }
    }

    // === Scoped schema facts ===

    /// Whether facts about `id` may be shared through the session cache
    fn shares_session_cache(&self, id: ConceptId) -> bool {
        self.session_cache.is_some() && !self.cache.is_schema_modified(id)
    }

    /// Read one cached fact of a schema concept, computing it from the graph
    /// on a miss and storing it in the narrowest scope that is still correct.
    pub(crate) fn schema_fact<T: Clone>(
        &mut self,
        id: ConceptId,
        field: Field<T>,
        compute: impl FnOnce(&Self) -> ConceptResult<T>,
    ) -> ConceptResult<T> {
        if let Some(fields) = self.cache.schema_fields.get_mut(&id) {
            if let Some(value) = field(fields).peek() {
                return Ok(value.clone());
            }
        }
        let shared = self.shares_session_cache(id);
        if shared {
            if let Some(value) = self.session_cache.as_ref().and_then(|c| c.read(id, field)) {
                return Ok(value);
            }
        }
        let value = compute(self)?;
        match (shared, self.session_cache.as_ref()) {
            (true, Some(cache)) => cache.write(id, field, value.clone()),
            _ => field(self.cache.schema_fields.entry(id).or_default()).set(value.clone()),
        }
        Ok(value)
    }

    /// Move a schema concept's facts into the transaction scope before mutating it
    pub(crate) fn mark_schema_modified(&mut self, id: ConceptId) {
        if !self.cache.is_schema_modified(id) {
            let copied = self
                .session_cache
                .as_ref()
                .and_then(|c| c.fields(id))
                .unwrap_or_default();
            let fields = self.cache.schema_fields.entry(id).or_insert_with(SchemaFields::default);
            merge_missing(fields, copied);
        }
        self.emit(ConceptEvent::SchemaConceptModified { concept: id });
    }

    /// Update an already-computed fact of a concept this transaction modified
    pub(crate) fn update_fact<T: Clone>(&mut self, id: ConceptId, field: Field<T>, update: impl FnOnce(&mut T)) {
        self.mark_schema_modified(id);
        if let Some(fields) = self.cache.schema_fields.get_mut(&id) {
            field(fields).if_present(update);
        }
    }

    /// Overwrite a fact of a concept this transaction modified
    pub(crate) fn set_fact<T: Clone>(&mut self, id: ConceptId, field: Field<T>, value: T) {
        self.mark_schema_modified(id);
        field(self.cache.schema_fields.entry(id).or_default()).set(value);
    }
}

/// Fill the fields `target` has not computed yet from `source`
fn merge_missing(target: &mut SchemaFields, source: SchemaFields) {
    fn fill<T: Clone>(target: &mut super::cache::Cache<T>, source: super::cache::Cache<T>) {
        if !target.is_present() {
            if let Some(value) = source.peek() {
                target.set(value.clone());
            }
        }
    }
    fill(&mut target.label, source.label);
    fill(&mut target.label_id, source.label_id);
    fill(&mut target.sup, source.sup);
    fill(&mut target.subs, source.subs);
    fill(&mut target.plays, source.plays);
    fill(&mut target.played_by, source.played_by);
    fill(&mut target.relates, source.relates);
    fill(&mut target.related_by, source.related_by);
    fill(&mut target.is_abstract, source.is_abstract);
    fill(&mut target.is_implicit, source.is_implicit);
    fill(&mut target.data_type, source.data_type);
    fill(&mut target.regex, source.regex);
}

pub(crate) fn edge_id_property(e: EdgeId) -> PropertyValue {
    PropertyValue::Long(e.as_u64() as i64)
}

pub(crate) fn vertex_id_property(v: VertexId) -> PropertyValue {
    PropertyValue::Long(v.as_u64() as i64)
}

pub(crate) fn label_id_property(id: LabelId) -> PropertyValue {
    PropertyValue::Long(id.as_u32() as i64)
}

/// Write the meta schema into an empty keyspace
pub(crate) fn bootstrap_meta_schema(graph: &mut GraphTx) -> ConceptResult<()> {
    let mut vertices = std::collections::HashMap::new();
    for meta in MetaSchema::ALL {
        let v = graph.create_vertex(meta.base_type().marker());
        graph.set_vertex_property(v, vertex_property::SCHEMA_LABEL, Some(meta.label().into()))?;
        graph.set_vertex_property(v, vertex_property::LABEL_ID, Some(label_id_property(meta.label_id())))?;
        if meta.base_type() != BaseType::Role && meta.base_type() != BaseType::Rule {
            graph.set_vertex_property(v, vertex_property::IS_ABSTRACT, Some(true.into()))?;
            let shard = graph.create_vertex(BaseType::Shard.marker());
            graph.create_edge(shard, v, EdgeLabel::Shard.as_str())?;
            graph.set_vertex_property(v, vertex_property::CURRENT_SHARD, Some(vertex_id_property(shard)))?;
        }
        vertices.insert(meta, v);
    }
    for meta in MetaSchema::ALL {
        if let Some(sup) = meta.sup() {
            graph.create_edge(vertices[&meta], vertices[&sup], EdgeLabel::Sub.as_str())?;
        }
    }
    debug!("keyspace.meta_schema.bootstrapped");
    Ok(())
}
