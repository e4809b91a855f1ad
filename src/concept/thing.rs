//! Instances: creation, their type, attribute ownership and deletion

use super::events::ConceptEvent;
use super::manager::{label_id_property, ConceptManager};
use super::relation::RelationStructure;
use super::schema::{edge_property, vertex_property, BaseType, EdgeLabel, ImplicitType};
use super::{Concept, ConceptId, ConceptKind, LabelId};
use crate::error::{ConceptError, ConceptResult, TransactionError};
use crate::graph::{Direction, EdgeId, EdgeRecord, PropertyValue, VertexId};
use std::collections::BTreeSet;
use tracing::debug;

fn is_thing(kind: ConceptKind) -> bool {
    kind.is_thing()
}

fn is_entity_type(kind: ConceptKind) -> bool {
    kind == ConceptKind::EntityType
}

fn is_attribute(kind: ConceptKind) -> bool {
    kind == ConceptKind::Attribute
}

impl ConceptManager {
    pub fn add_entity(&mut self, entity_type: &Concept) -> ConceptResult<Concept> {
        self.check_kind(entity_type, is_entity_type, "entity type")?;
        self.create_instance(entity_type, false)
    }

    pub fn add_entity_inferred(&mut self, entity_type: &Concept) -> ConceptResult<Concept> {
        self.check_kind(entity_type, is_entity_type, "entity type")?;
        self.create_instance(entity_type, true)
    }

    /// New instance vertex attached to the type's current shard
    pub(crate) fn create_instance(&mut self, concept_type: &Concept, inferred: bool) -> ConceptResult<Concept> {
        self.check_writable()?;
        let base = BaseType::for_instances_of(concept_type.kind()).ok_or_else(|| TransactionError::WrongKind {
            concept: concept_type.id().to_string(),
            actual: concept_type.kind().name(),
            expected: "instantiable type",
        })?;
        if self.is_abstract(concept_type)? {
            return Err(TransactionError::AbstractInstantiation(self.label(concept_type)?.to_string()).into());
        }
        let v = self.add_vertex_element(base).id;
        let shard = self.current_shard(concept_type)?;
        self.add_edge_element(v, shard, EdgeLabel::Isa)?;
        let label_id = self.label_id(concept_type)?;
        self.set_vertex_prop(v, vertex_property::THING_TYPE_LABEL_ID, label_id_property(label_id))?;
        if inferred {
            self.set_vertex_prop(v, vertex_property::IS_INFERRED, true)?;
        }
        let instance = self.build_vertex(v)?;
        self.emit(ConceptEvent::InstanceCreated {
            type_id: concept_type.id(),
            instance: instance.id(),
        });
        Ok(instance)
    }

    /// The direct type of a thing
    pub fn thing_type(&mut self, thing: &Concept) -> ConceptResult<Concept> {
        self.check_kind(thing, is_thing, "thing")?;
        if let Some(type_id) = self.cache.thing_types.get(&thing.id()).copied() {
            if let Some(concept_type) = self.get_concept(type_id)? {
                return Ok(concept_type);
            }
        }
        let label_id = match (thing.vertex(), thing.structure()) {
            (Some(v), _) => self.persistent_prop(v, vertex_property::THING_TYPE_LABEL_ID, |m| {
                let type_vertex = m
                    .neighbours(v, Direction::Out, EdgeLabel::Isa)
                    .into_iter()
                    .next()
                    .and_then(|shard| m.neighbours(shard, Direction::Out, EdgeLabel::Shard).into_iter().next());
                type_vertex
                    .and_then(|t| m.vertex_prop(t, vertex_property::LABEL_ID))
                    .ok_or_else(|| ConceptError::temporary_write(thing.id(), "instance is not attached to a type"))
            })?,
            (None, Some(RelationStructure::Edge(edge))) => self
                .edge_prop(edge.edge_id(), edge_property::RELATION_TYPE_LABEL_ID)
                .ok_or_else(|| ConceptError::UnknownConcept(format!("type of {}", thing.id())))?,
            (None, _) => return Err(ConceptError::UnknownConcept(thing.id().to_string())),
        };
        let label_id = label_id
            .as_long()
            .map(|raw| LabelId::new(raw as u32))
            .ok_or_else(|| ConceptError::UnknownConcept(format!("type of {}", thing.id())))?;
        let concept_type = self
            .get_schema_concept_by_label_id(label_id)?
            .ok_or_else(|| ConceptError::UnknownConcept(format!("label id {}", label_id)))?;
        self.cache.thing_types.insert(thing.id(), concept_type.id());
        Ok(concept_type)
    }

    pub fn is_inferred(&mut self, thing: &Concept) -> ConceptResult<bool> {
        self.check_kind(thing, is_thing, "thing")?;
        let flag = match (thing.vertex(), thing.structure()) {
            (Some(v), _) => self.vertex_prop(v, vertex_property::IS_INFERRED),
            (None, Some(RelationStructure::Edge(edge))) => self.edge_prop(edge.edge_id(), edge_property::IS_INFERRED),
            (None, _) => None,
        };
        Ok(flag.and_then(|p| p.as_bool()).unwrap_or(false))
    }

    // === Attribute ownership ===

    /// Link `owner` to `attribute` through the implicit has (or key) relation,
    /// returning the relation. Linking twice returns the existing relation.
    pub fn has_attribute(&mut self, owner: &Concept, attribute: &Concept) -> ConceptResult<Concept> {
        self.link_attribute(owner, attribute, false)
    }

    pub fn has_attribute_inferred(&mut self, owner: &Concept, attribute: &Concept) -> ConceptResult<Concept> {
        self.link_attribute(owner, attribute, true)
    }

    /// Like [`has_attribute`](Self::has_attribute), but the relation is
    /// stored as a vertex from the start
    pub fn has_attribute_reified(&mut self, owner: &Concept, attribute: &Concept) -> ConceptResult<Concept> {
        let relation = self.link_attribute(owner, attribute, false)?;
        self.reify(&relation)?;
        Ok(relation)
    }

    fn link_attribute(&mut self, owner: &Concept, attribute: &Concept, inferred: bool) -> ConceptResult<Concept> {
        self.check_writable()?;
        self.check_kind(owner, is_thing, "thing")?;
        self.check_kind(attribute, is_attribute, "attribute")?;

        let owner_type = self.thing_type(owner)?;
        let attribute_type = self.thing_type(attribute)?;
        let attribute_label = self.label(&attribute_type)?;
        let key = self.keys_of(&owner_type)?.contains(&attribute_type);
        let (relation_kind, owner_kind, value_kind) = ImplicitType::family(key);

        let owner_label = self.label(&owner_type)?;
        let not_allowed = TransactionError::HasNotAllowed {
            owner: owner_label.to_string(),
            attribute: attribute_label.to_string(),
        };
        let Some(owner_role) = self.get_role(owner_kind.label(attribute_label.as_str()).as_str())? else {
            return Err(not_allowed.into());
        };
        if !self.playing(&owner_type)?.contains(&owner_role) {
            return Err(not_allowed.into());
        }
        let value_role = self
            .get_role(value_kind.label(attribute_label.as_str()).as_str())?
            .ok_or_else(|| ConceptError::UnknownConcept(value_kind.label(attribute_label.as_str()).to_string()))?;
        let relation_type = self
            .get_relation_type(relation_kind.label(attribute_label.as_str()).as_str())?
            .ok_or_else(|| ConceptError::UnknownConcept(relation_kind.label(attribute_label.as_str()).to_string()))?;

        let relation_label_id = label_id_property(self.label_id(&relation_type)?);
        let owner_role_id = label_id_property(self.label_id(&owner_role)?);
        let value_role_id = label_id_property(self.label_id(&value_role)?);
        if let Some(existing) = self.existing_attribute_relation(owner, attribute, &relation_label_id, &owner_role_id, &value_role_id)? {
            return Ok(existing);
        }

        let owner_vertex = self.ensure_vertex(owner)?;
        let attribute_vertex = self.vertex_of(attribute)?;
        let edge = self.add_edge_element(owner_vertex, attribute_vertex, EdgeLabel::Attribute)?;
        self.set_edge_prop(edge.id, edge_property::RELATION_TYPE_LABEL_ID, relation_label_id)?;
        self.set_edge_prop(edge.id, edge_property::RELATION_ROLE_OWNER_LABEL_ID, owner_role_id)?;
        self.set_edge_prop(edge.id, edge_property::RELATION_ROLE_VALUE_LABEL_ID, value_role_id)?;
        if inferred {
            self.set_edge_prop(edge.id, edge_property::IS_INFERRED, true)?;
        }
        let relation = self.build_edge(edge.id)?;
        self.emit(ConceptEvent::AttributeLinked {
            relation: relation.id(),
            owner: owner.id(),
            attribute: attribute.id(),
        });
        debug!(owner = %owner.id(), attribute = %attribute.id(), key, "thing.attribute.linked");
        Ok(relation)
    }

    fn existing_attribute_relation(
        &mut self,
        owner: &Concept,
        attribute: &Concept,
        relation_label_id: &PropertyValue,
        owner_role_id: &PropertyValue,
        value_role_id: &PropertyValue,
    ) -> ConceptResult<Option<Concept>> {
        let Some(ov) = owner.vertex() else {
            return Ok(None);
        };
        let av = self.vertex_of(attribute)?;
        let edge = self
            .edges(ov, Direction::Out, EdgeLabel::Attribute)
            .into_iter()
            .find(|e| e.target == av && e.property(edge_property::RELATION_TYPE_LABEL_ID) == Some(relation_label_id));
        if let Some(edge) = edge {
            return self.build_edge(edge.id).map(Some);
        }
        for casting in self.edges(av, Direction::In, EdgeLabel::RolePlayer) {
            if casting.property(edge_property::ROLE_LABEL_ID) != Some(value_role_id) {
                continue;
            }
            let owned = self
                .edges(casting.source, Direction::Out, EdgeLabel::RolePlayer)
                .iter()
                .any(|e| e.target == ov && e.property(edge_property::ROLE_LABEL_ID) == Some(owner_role_id));
            if owned {
                return self.build_vertex(casting.source).map(Some);
            }
        }
        Ok(None)
    }

    /// Remove every has/key relation between `owner` and `attribute`
    pub fn unhas_attribute(&mut self, owner: &Concept, attribute: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(owner, is_thing, "thing")?;
        self.check_kind(attribute, is_attribute, "attribute")?;
        let Some(ov) = owner.vertex() else {
            return Ok(());
        };
        let av = self.vertex_of(attribute)?;

        let mut relations = Vec::new();
        for edge in self.edges(ov, Direction::Out, EdgeLabel::Attribute) {
            if edge.target == av {
                relations.push(self.build_edge(edge.id)?);
            }
        }
        for casting in self.edges(av, Direction::In, EdgeLabel::RolePlayer) {
            if !self.casting_role_matches(&casting, ImplicitType::is_value_role)? {
                continue;
            }
            for other in self.edges(casting.source, Direction::Out, EdgeLabel::RolePlayer) {
                if other.target == ov && self.casting_role_matches(&other, ImplicitType::is_owner_role)? {
                    relations.push(self.build_vertex(casting.source)?);
                }
            }
        }
        for relation in relations {
            if !relation.is_deleted() {
                self.delete_thing(&relation)?;
            }
        }
        Ok(())
    }

    fn casting_role_matches(&mut self, casting: &EdgeRecord, accept: fn(&str) -> bool) -> ConceptResult<bool> {
        match self.role_of_edge(casting, edge_property::ROLE_LABEL_ID)? {
            Some(role) => Ok(accept(self.label(&role)?.as_str())),
            None => Ok(false),
        }
    }

    /// Attributes the thing owns, optionally restricted to some attribute
    /// types and their subs
    pub fn attributes_of(&mut self, thing: &Concept, types: &[Concept]) -> ConceptResult<Vec<Concept>> {
        self.check_kind(thing, is_thing, "thing")?;
        let Some(v) = thing.vertex() else {
            return Ok(Vec::new());
        };
        let allowed = if types.is_empty() {
            None
        } else {
            let mut allowed = BTreeSet::new();
            for attribute_type in types {
                allowed.extend(self.subs(attribute_type)?);
            }
            Some(allowed)
        };

        let mut vertices = BTreeSet::new();
        for edge in self.edges(v, Direction::Out, EdgeLabel::Attribute) {
            vertices.insert(edge.target);
        }
        for casting in self.edges(v, Direction::In, EdgeLabel::RolePlayer) {
            if !self.casting_role_matches(&casting, ImplicitType::is_owner_role)? {
                continue;
            }
            for other in self.edges(casting.source, Direction::Out, EdgeLabel::RolePlayer) {
                if self.casting_role_matches(&other, ImplicitType::is_value_role)? {
                    vertices.insert(other.target);
                }
            }
        }

        let mut attributes = Vec::new();
        for av in vertices {
            let attribute = self.build_vertex(av)?;
            if attribute.kind() != ConceptKind::Attribute {
                continue;
            }
            if let Some(allowed) = &allowed {
                if !allowed.contains(&self.thing_type(&attribute)?) {
                    continue;
                }
            }
            attributes.push(attribute);
        }
        Ok(attributes)
    }

    /// (relation, role) pairs for every relation the thing plays in
    fn relation_roles(&mut self, thing: &Concept, filter: Option<&BTreeSet<i64>>) -> ConceptResult<Vec<(Concept, Concept)>> {
        let Some(v) = thing.vertex() else {
            return Ok(Vec::new());
        };
        let accepts = |edge: &EdgeRecord, key: &str| match filter {
            None => true,
            Some(ids) => edge
                .property(key)
                .and_then(PropertyValue::as_long)
                .is_some_and(|id| ids.contains(&id)),
        };
        let mut found = Vec::new();
        for edge in self.edges(v, Direction::In, EdgeLabel::RolePlayer) {
            if accepts(&edge, edge_property::ROLE_LABEL_ID) {
                if let Some(role) = self.role_of_edge(&edge, edge_property::ROLE_LABEL_ID)? {
                    found.push((self.build_vertex(edge.source)?, role));
                }
            }
        }
        let edge_forms = [
            (Direction::Out, edge_property::RELATION_ROLE_OWNER_LABEL_ID),
            (Direction::In, edge_property::RELATION_ROLE_VALUE_LABEL_ID),
        ];
        for (direction, key) in edge_forms {
            for edge in self.edges(v, direction, EdgeLabel::Attribute) {
                if accepts(&edge, key) {
                    if let Some(role) = self.role_of_edge(&edge, key)? {
                        found.push((self.build_edge(edge.id)?, role));
                    }
                }
            }
        }
        Ok(found)
    }

    /// Relations the thing plays a role in, optionally restricted to some
    /// roles and their subs
    pub fn relations_of(&mut self, thing: &Concept, roles: &[Concept]) -> ConceptResult<Vec<Concept>> {
        self.check_kind(thing, is_thing, "thing")?;
        let filter = if roles.is_empty() {
            None
        } else {
            let mut ids = BTreeSet::new();
            for role in roles {
                for sub in self.subs(role)? {
                    ids.insert(self.label_id(&sub)?.as_u32() as i64);
                }
            }
            Some(ids)
        };
        let mut relations = Vec::new();
        for (relation, _) in self.relation_roles(thing, filter.as_ref())? {
            if !relations.contains(&relation) {
                relations.push(relation);
            }
        }
        Ok(relations)
    }

    /// Number of relations in which the thing plays exactly this role
    pub(crate) fn count_relations_playing(&mut self, thing: &Concept, role: &Concept) -> ConceptResult<usize> {
        let ids = BTreeSet::from([self.label_id(role)?.as_u32() as i64]);
        let relations: BTreeSet<ConceptId> = self
            .relation_roles(thing, Some(&ids))?
            .into_iter()
            .map(|(relation, _)| relation.id())
            .collect();
        Ok(relations.len())
    }

    /// Roles the thing currently plays
    pub fn roles_played(&mut self, thing: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(thing, is_thing, "thing")?;
        let roles: BTreeSet<Concept> = self
            .relation_roles(thing, None)?
            .into_iter()
            .map(|(_, role)| role)
            .collect();
        Ok(roles.into_iter().collect())
    }

    // === Deletion ===

    /// Delete a thing, its castings and attribute links. Relations left
    /// empty, and implicit relations it took part in, go with it.
    pub fn delete_thing(&mut self, thing: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(thing, is_thing, "thing")?;
        match thing.structure() {
            Some(RelationStructure::Edge(edge)) => self.delete_edge_relation(thing, edge.edge_id()),
            _ => self.delete_vertex_thing(thing),
        }
    }

    fn delete_edge_relation(&mut self, relation: &Concept, e: EdgeId) -> ConceptResult<()> {
        if let Some(edge) = self.graph.edge(e) {
            let owner = self.concept_id_of_vertex(edge.source);
            let value = self.concept_id_of_vertex(edge.target);
            self.cache.tracked_things.insert(owner);
            self.cache.tracked_things.insert(value);
            self.graph.delete_edge(e)?;
        }
        self.cache.forget(relation.id());
        debug!(relation = %relation.id(), "thing.deleted");
        Ok(())
    }

    fn delete_vertex_thing(&mut self, thing: &Concept) -> ConceptResult<()> {
        let v = self.vertex_of(thing)?;
        let type_id = self.thing_type(thing)?.id();
        let index = if thing.kind() == ConceptKind::Attribute {
            Some(self.index_of(thing)?)
        } else {
            None
        };

        let mut affected: BTreeSet<VertexId> = BTreeSet::new();
        for casting in self.edges(v, Direction::In, EdgeLabel::RolePlayer) {
            affected.insert(casting.source);
            let relation = self.concept_id_of_vertex(casting.source);
            if let Some(role) = self.role_of_edge(&casting, edge_property::ROLE_LABEL_ID)? {
                self.emit(ConceptEvent::CastingRemoved {
                    relation,
                    role: role.id(),
                    player: thing.id(),
                });
            }
            self.graph.delete_edge(casting.id)?;
        }
        for edge in self.edges(v, Direction::Both, EdgeLabel::Attribute) {
            if let Some(other) = edge.other_end(v) {
                let other = self.concept_id_of_vertex(other);
                self.cache.tracked_things.insert(other);
            }
            self.cache.forget(ConceptId::Edge(edge.id));
        }
        for casting in self.edges(v, Direction::Out, EdgeLabel::RolePlayer) {
            let player = self.concept_id_of_vertex(casting.target);
            self.cache.tracked_things.insert(player);
        }

        self.graph.delete_vertex(v)?;
        self.emit(ConceptEvent::InstanceDeleted {
            type_id,
            instance: thing.id(),
        });
        if let Some(index) = index {
            self.emit(ConceptEvent::AttributeDeleted {
                index,
                attribute: thing.id(),
            });
        }
        debug!(thing = %thing.id(), "thing.deleted");

        for relation in affected {
            self.cleanup_relation(relation)?;
        }
        Ok(())
    }
}
