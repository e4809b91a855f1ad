//! The concept layer: typed, identity-mapped wrappers over graph elements
//!
//! Every vertex or edge a transaction touches is handed out as a single
//! [`Concept`] handle. Handles are cheap to clone and compare by identity;
//! the operations that read or mutate them live on
//! [`ConceptManager`](manager::ConceptManager), split across the
//! `types`, `thing`, `relation` and `attribute` modules.

mod attribute;
mod cache;
mod element;
mod events;
mod manager;
mod relation;
mod schema;
mod thing;
mod types;

pub use attribute::{AttributeValue, DataType};
pub use cache::{Cache, Invalidation, SchemaCache, SchemaFields, TxCache};
pub use element::{EdgeElement, VertexElement};
pub use events::{ConceptEvent, EventSink, RecordingSink};
pub use manager::ConceptManager;
pub use relation::{Casting, RelationEdge, RelationReified, RelationStructure};
pub use schema::{
    attribute_index, edge_property, vertex_property, BaseType, EdgeLabel, ImplicitType, MetaSchema,
};

pub(crate) use manager::bootstrap_meta_schema;

use crate::graph::{EdgeId, VertexId};
use crate::session::TransactionId;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

/// Opaque concept identifier, derived from the backing element.
///
/// A relation promoted from an edge to a vertex keeps its edge-derived id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConceptId {
    Vertex(VertexId),
    Edge(EdgeId),
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vertex(id) => write!(f, "V{}", id),
            Self::Edge(id) => write!(f, "E{}", id),
        }
    }
}

impl FromStr for ConceptId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |raw: &str| raw.parse::<u64>().map_err(|e| format!("invalid concept id '{}': {}", s, e));
        if let Some(raw) = s.strip_prefix('V') {
            Ok(Self::Vertex(VertexId::new(parse(raw)?)))
        } else if let Some(raw) = s.strip_prefix('E') {
            Ok(Self::Edge(EdgeId::new(parse(raw)?)))
        } else {
            Err(format!("invalid concept id '{}'", s))
        }
    }
}

/// Unique human name of a schema concept
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Compact numeric alias of a label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(u32);

impl LabelId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of concept kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConceptKind {
    /// The root `thing` type
    MetaType,
    EntityType,
    RelationType,
    AttributeType,
    Role,
    Rule,
    Entity,
    Relation,
    Attribute,
}

impl ConceptKind {
    pub fn is_schema(&self) -> bool {
        !self.is_thing()
    }

    /// Kinds that can have instances and play roles
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            Self::MetaType | Self::EntityType | Self::RelationType | Self::AttributeType
        )
    }

    pub fn is_thing(&self) -> bool {
        matches!(self, Self::Entity | Self::Relation | Self::Attribute)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MetaType => "type",
            Self::EntityType => "entity type",
            Self::RelationType => "relation type",
            Self::AttributeType => "attribute type",
            Self::Role => "role",
            Self::Rule => "rule",
            Self::Entity => "entity",
            Self::Relation => "relation",
            Self::Attribute => "attribute",
        }
    }
}

impl fmt::Display for ConceptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a concept is stored as
#[derive(Debug, Clone)]
pub(crate) enum Backing {
    Vertex(VertexElement),
    Relation(RelationStructure),
}

#[derive(Debug)]
struct ConceptInner {
    id: ConceptId,
    kind: ConceptKind,
    backing: RefCell<Backing>,
    deleted: Cell<bool>,
}

/// Handle to the single live concept object of one element within one transaction.
///
/// Two handles obtained for the same id inside one transaction point at the
/// same object, so a relation reified through one handle is seen as reified
/// through every other.
#[derive(Clone)]
pub struct Concept(Rc<ConceptInner>);

impl Concept {
    pub(crate) fn new(id: ConceptId, kind: ConceptKind, backing: Backing) -> Self {
        Self(Rc::new(ConceptInner {
            id,
            kind,
            backing: RefCell::new(backing),
            deleted: Cell::new(false),
        }))
    }

    pub fn id(&self) -> ConceptId {
        self.0.id
    }

    pub fn kind(&self) -> ConceptKind {
        self.0.kind
    }

    /// True when both handles are the very same object
    pub fn same_object(&self, other: &Concept) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_deleted(&self) -> bool {
        self.0.deleted.get()
    }

    pub(crate) fn mark_deleted(&self) {
        self.0.deleted.set(true);
    }

    pub(crate) fn transaction(&self) -> TransactionId {
        match &*self.0.backing.borrow() {
            Backing::Vertex(v) => v.tx,
            Backing::Relation(RelationStructure::Edge(edge)) => edge.element.tx,
            Backing::Relation(RelationStructure::Reified(reified)) => reified.element.tx,
        }
    }

    /// Backing vertex, if this concept is vertex-backed (reified relations included)
    pub(crate) fn vertex(&self) -> Option<VertexId> {
        match &*self.0.backing.borrow() {
            Backing::Vertex(v) => Some(v.id),
            Backing::Relation(RelationStructure::Reified(reified)) => Some(reified.element.id),
            Backing::Relation(RelationStructure::Edge(_)) => None,
        }
    }

    /// The relation's current representation; `None` for non-relations
    pub fn structure(&self) -> Option<RelationStructure> {
        match &*self.0.backing.borrow() {
            Backing::Relation(structure) => Some(structure.clone()),
            Backing::Vertex(_) => None,
        }
    }

    pub fn is_reified(&self) -> bool {
        matches!(self.structure(), Some(RelationStructure::Reified(_)))
    }

    pub(crate) fn set_structure(&self, structure: RelationStructure) {
        *self.0.backing.borrow_mut() = Backing::Relation(structure);
    }
}

impl PartialEq for Concept {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Concept {}

impl std::hash::Hash for Concept {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl PartialOrd for Concept {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Concept {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl fmt::Debug for Concept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.0.kind, self.0.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concept_id_round_trips_through_display() {
        let v = ConceptId::Vertex(VertexId::new(42));
        let e = ConceptId::Edge(EdgeId::new(7));
        assert_eq!(v.to_string(), "V42");
        assert_eq!("V42".parse::<ConceptId>().unwrap(), v);
        assert_eq!("E7".parse::<ConceptId>().unwrap(), e);
        assert!("X1".parse::<ConceptId>().is_err());
        assert!("Vx".parse::<ConceptId>().is_err());
    }

    #[test]
    fn kind_classification() {
        assert!(ConceptKind::EntityType.is_type());
        assert!(ConceptKind::Role.is_schema());
        assert!(!ConceptKind::Role.is_type());
        assert!(ConceptKind::Attribute.is_thing());
        assert!(!ConceptKind::Rule.is_thing());
    }
}
