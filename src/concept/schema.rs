//! Persisted property schema: base-type markers, edge labels, property keys,
//! the meta schema and implicit has/key labels

use super::attribute::AttributeValue;
use super::{ConceptKind, Label, LabelId};

/// Base-type marker stored as the vertex label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Type,
    EntityType,
    RelationType,
    AttributeType,
    Role,
    Rule,
    Shard,
    Entity,
    Relation,
    Attribute,
}

impl BaseType {
    pub fn marker(&self) -> &'static str {
        match self {
            Self::Type => "TYPE",
            Self::EntityType => "ENTITY_TYPE",
            Self::RelationType => "RELATION_TYPE",
            Self::AttributeType => "ATTRIBUTE_TYPE",
            Self::Role => "ROLE",
            Self::Rule => "RULE",
            Self::Shard => "SHARD",
            Self::Entity => "ENTITY",
            Self::Relation => "RELATION",
            Self::Attribute => "ATTRIBUTE",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        Some(match marker {
            "TYPE" => Self::Type,
            "ENTITY_TYPE" => Self::EntityType,
            "RELATION_TYPE" => Self::RelationType,
            "ATTRIBUTE_TYPE" => Self::AttributeType,
            "ROLE" => Self::Role,
            "RULE" => Self::Rule,
            "SHARD" => Self::Shard,
            "ENTITY" => Self::Entity,
            "RELATION" => Self::Relation,
            "ATTRIBUTE" => Self::Attribute,
            _ => return None,
        })
    }

    /// Concept kind of an element carrying this marker. Shards are not concepts.
    pub fn concept_kind(&self) -> Option<ConceptKind> {
        Some(match self {
            Self::Type => ConceptKind::MetaType,
            Self::EntityType => ConceptKind::EntityType,
            Self::RelationType => ConceptKind::RelationType,
            Self::AttributeType => ConceptKind::AttributeType,
            Self::Role => ConceptKind::Role,
            Self::Rule => ConceptKind::Rule,
            Self::Entity => ConceptKind::Entity,
            Self::Relation => ConceptKind::Relation,
            Self::Attribute => ConceptKind::Attribute,
            Self::Shard => return None,
        })
    }

    /// Kind of the instances of a type carrying this marker
    pub fn instance_kind(&self) -> Option<ConceptKind> {
        match self {
            Self::EntityType => Some(ConceptKind::Entity),
            Self::RelationType => Some(ConceptKind::Relation),
            Self::AttributeType => Some(ConceptKind::Attribute),
            _ => None,
        }
    }

    /// Marker of instances of a type of the given kind
    pub fn for_instances_of(kind: ConceptKind) -> Option<Self> {
        match kind {
            ConceptKind::EntityType => Some(Self::Entity),
            ConceptKind::RelationType => Some(Self::Relation),
            ConceptKind::AttributeType => Some(Self::Attribute),
            _ => None,
        }
    }
}

/// Labels of the edges the concept layer writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeLabel {
    /// instance -> shard of its type
    Isa,
    /// schema concept -> its super
    Sub,
    /// type -> role
    Plays,
    /// relation type -> role
    Relates,
    /// reified relation -> role player (a casting)
    RolePlayer,
    /// shard -> owning type
    Shard,
    /// edge-form has/key relation, owner -> attribute
    Attribute,
}

impl EdgeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isa => "isa",
            Self::Sub => "sub",
            Self::Plays => "plays",
            Self::Relates => "relates",
            Self::RolePlayer => "role-player",
            Self::Shard => "shard",
            Self::Attribute => "attribute",
        }
    }
}

/// Vertex property keys
pub mod vertex_property {
    pub const SCHEMA_LABEL: &str = "SCHEMA_LABEL";
    pub const LABEL_ID: &str = "LABEL_ID";
    pub const INDEX: &str = "INDEX";
    pub const IS_ABSTRACT: &str = "IS_ABSTRACT";
    pub const IS_IMPLICIT: &str = "IS_IMPLICIT";
    pub const IS_INFERRED: &str = "IS_INFERRED";
    pub const CURRENT_SHARD: &str = "CURRENT_SHARD";
    pub const DATA_TYPE: &str = "DATA_TYPE";
    pub const REGEX: &str = "REGEX";
    pub const RULE_WHEN: &str = "RULE_WHEN";
    pub const RULE_THEN: &str = "RULE_THEN";
    pub const THING_TYPE_LABEL_ID: &str = "THING_TYPE_LABEL_ID";
    /// Id of the edge a reified relation was promoted from
    pub const EDGE_RELATION_ID: &str = "EDGE_RELATION_ID";

    pub const VALUE_STRING: &str = "VALUE_STRING";
    pub const VALUE_LONG: &str = "VALUE_LONG";
    pub const VALUE_DOUBLE: &str = "VALUE_DOUBLE";
    pub const VALUE_BOOLEAN: &str = "VALUE_BOOLEAN";
    pub const VALUE_DATE: &str = "VALUE_DATE";
}

/// Edge property keys
pub mod edge_property {
    pub const RELATION_TYPE_LABEL_ID: &str = "RELATION_TYPE_LABEL_ID";
    pub const RELATION_ROLE_OWNER_LABEL_ID: &str = "RELATION_ROLE_OWNER_LABEL_ID";
    pub const RELATION_ROLE_VALUE_LABEL_ID: &str = "RELATION_ROLE_VALUE_LABEL_ID";
    pub const ROLE_LABEL_ID: &str = "ROLE_LABEL_ID";
    pub const REQUIRED: &str = "REQUIRED";
    pub const IS_INFERRED: &str = "IS_INFERRED";
}

/// The fixed root concepts present in every keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaSchema {
    Thing,
    Entity,
    Relation,
    Attribute,
    Role,
    Rule,
}

impl MetaSchema {
    pub const ALL: [MetaSchema; 6] = [
        Self::Thing,
        Self::Entity,
        Self::Relation,
        Self::Attribute,
        Self::Role,
        Self::Rule,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Thing => "thing",
            Self::Entity => "entity",
            Self::Relation => "relation",
            Self::Attribute => "attribute",
            Self::Role => "role",
            Self::Rule => "rule",
        }
    }

    pub fn label_id(&self) -> LabelId {
        LabelId::new(match self {
            Self::Thing => 1,
            Self::Entity => 2,
            Self::Relation => 3,
            Self::Attribute => 4,
            Self::Role => 5,
            Self::Rule => 6,
        })
    }

    pub fn base_type(&self) -> BaseType {
        match self {
            Self::Thing => BaseType::Type,
            Self::Entity => BaseType::EntityType,
            Self::Relation => BaseType::RelationType,
            Self::Attribute => BaseType::AttributeType,
            Self::Role => BaseType::Role,
            Self::Rule => BaseType::Rule,
        }
    }

    pub fn sup(&self) -> Option<MetaSchema> {
        match self {
            Self::Entity | Self::Relation | Self::Attribute => Some(Self::Thing),
            _ => None,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|meta| meta.label() == label)
    }

    pub fn is_meta_label(label: &str) -> bool {
        Self::from_label(label).is_some()
    }

    /// The meta concept new schema concepts of `kind` hang under
    pub fn root_of(kind: ConceptKind) -> Option<Self> {
        match kind {
            ConceptKind::EntityType => Some(Self::Entity),
            ConceptKind::RelationType => Some(Self::Relation),
            ConceptKind::AttributeType => Some(Self::Attribute),
            ConceptKind::Role => Some(Self::Role),
            ConceptKind::Rule => Some(Self::Rule),
            _ => None,
        }
    }

    /// Highest label id reserved for meta concepts
    pub fn max_label_id() -> u32 {
        6
    }
}

/// Prefix reserved for labels the system synthesizes
pub const IMPLICIT_PREFIX: &str = "@";

/// Implicit relation types and roles backing `has` and `key`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImplicitType {
    Has,
    HasOwner,
    HasValue,
    Key,
    KeyOwner,
    KeyValue,
}

impl ImplicitType {
    fn affixes(&self) -> (&'static str, &'static str) {
        match self {
            Self::Has => ("@has-", ""),
            Self::HasOwner => ("@has-", "-owner"),
            Self::HasValue => ("@has-", "-value"),
            Self::Key => ("@key-", ""),
            Self::KeyOwner => ("@key-", "-owner"),
            Self::KeyValue => ("@key-", "-value"),
        }
    }

    /// The implicit label for an attribute type label
    pub fn label(&self, attribute_type: &str) -> Label {
        let (prefix, suffix) = self.affixes();
        Label::new(format!("{}{}{}", prefix, attribute_type, suffix))
    }

    /// The attribute type label an implicit role label was derived from
    pub fn attribute_label<'a>(&self, implicit: &'a str) -> Option<&'a str> {
        let (prefix, suffix) = self.affixes();
        let rest = implicit.strip_prefix(prefix)?;
        if suffix.is_empty() {
            return (!rest.ends_with("-owner") && !rest.ends_with("-value")).then_some(rest);
        }
        rest.strip_suffix(suffix)
    }

    /// The (relation, owner role, value role) triple of a family
    pub fn family(key: bool) -> (Self, Self, Self) {
        if key {
            (Self::Key, Self::KeyOwner, Self::KeyValue)
        } else {
            (Self::Has, Self::HasOwner, Self::HasValue)
        }
    }

    /// True for value roles of either family
    pub fn is_value_role(label: &str) -> bool {
        Self::HasValue.attribute_label(label).is_some() || Self::KeyValue.attribute_label(label).is_some()
    }

    pub fn is_owner_role(label: &str) -> bool {
        Self::HasOwner.attribute_label(label).is_some() || Self::KeyOwner.attribute_label(label).is_some()
    }
}

pub fn is_reserved_label(label: &str) -> bool {
    label.starts_with(IMPLICIT_PREFIX)
}

/// Uniqueness index of an attribute: same type and value, same index
pub fn attribute_index(type_label: &str, value: &AttributeValue) -> String {
    format!("ATTRIBUTE-{}-{}", type_label, value)
}
