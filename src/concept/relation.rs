//! Relations: edge-form and reified structures, castings and reification
//!
//! A has/key relation starts life as a single attribute edge carrying the
//! relation type and both role ids. Anything that needs a vertex (a third
//! role player, the relation owning an attribute, playing a role itself)
//! first promotes it to a reified relation vertex. The concept keeps its
//! edge-derived id and every handle to it sees the new structure.

use super::element::{EdgeElement, VertexElement};
use super::events::ConceptEvent;
use super::manager::{edge_id_property, label_id_property, ConceptManager};
use super::schema::{edge_property, vertex_property, BaseType, EdgeLabel};
use super::{Concept, ConceptId, ConceptKind, LabelId};
use crate::error::{ConceptError, ConceptResult};
use crate::graph::{Direction, EdgeId, EdgeRecord, PropertyValue, VertexId};
use std::collections::BTreeMap;
use tracing::debug;

/// A relation stored as one attribute edge, owner to value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationEdge {
    pub(crate) element: EdgeElement,
}

impl RelationEdge {
    pub fn edge_id(&self) -> EdgeId {
        self.element.id
    }

    pub fn owner(&self) -> VertexId {
        self.element.source
    }

    pub fn value(&self) -> VertexId {
        self.element.target
    }
}

/// A relation stored as a vertex with one role-player edge per casting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationReified {
    pub(crate) element: VertexElement,
}

impl RelationReified {
    pub fn vertex_id(&self) -> VertexId {
        self.element.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationStructure {
    Edge(RelationEdge),
    Reified(RelationReified),
}

/// One role player of one relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Casting {
    pub relation: Concept,
    pub role: Concept,
    pub player: Concept,
}

fn is_relation(kind: ConceptKind) -> bool {
    kind == ConceptKind::Relation
}

fn is_relation_type(kind: ConceptKind) -> bool {
    kind == ConceptKind::RelationType
}

fn is_role(kind: ConceptKind) -> bool {
    kind == ConceptKind::Role
}

fn is_thing(kind: ConceptKind) -> bool {
    kind.is_thing()
}

impl ConceptManager {
    pub fn add_relation(&mut self, relation_type: &Concept) -> ConceptResult<Concept> {
        self.check_kind(relation_type, is_relation_type, "relation type")?;
        self.create_instance(relation_type, false)
    }

    pub fn add_relation_inferred(&mut self, relation_type: &Concept) -> ConceptResult<Concept> {
        self.check_kind(relation_type, is_relation_type, "relation type")?;
        self.create_instance(relation_type, true)
    }

    /// The schema concept named by a label-id property of an edge
    pub(crate) fn role_of_edge(&mut self, edge: &EdgeRecord, key: &str) -> ConceptResult<Option<Concept>> {
        match edge.property(key).and_then(PropertyValue::as_long) {
            Some(raw) => self.get_schema_concept_by_label_id(LabelId::new(raw as u32)),
            None => Ok(None),
        }
    }

    /// Concept id of a vertex as handed out, honouring reified edge ids
    pub(crate) fn concept_id_of_vertex(&self, v: VertexId) -> ConceptId {
        if let Some(alias) = self.cache.reified_aliases.get(&v) {
            return *alias;
        }
        match self.vertex_prop(v, vertex_property::EDGE_RELATION_ID) {
            Some(PropertyValue::Long(raw)) => ConceptId::Edge(EdgeId::new(raw as u64)),
            _ => ConceptId::Vertex(v),
        }
    }

    /// The vertex backing a thing, reifying an edge-form relation first
    pub(crate) fn ensure_vertex(&mut self, thing: &Concept) -> ConceptResult<VertexId> {
        if let Some(v) = thing.vertex() {
            return Ok(v);
        }
        self.reify(thing)?;
        self.vertex_of(thing)
    }

    /// Promote an edge-form relation to a vertex; a no-op once reified
    pub fn reify(&mut self, relation: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(relation, is_relation, "relation")?;
        let Some(RelationStructure::Edge(edge)) = relation.structure() else {
            return Ok(());
        };
        let e = edge.edge_id();
        let record = self
            .graph
            .edge(e)
            .ok_or_else(|| ConceptError::UnknownConcept(relation.id().to_string()))?;
        let relation_type = self
            .role_of_edge(&record, edge_property::RELATION_TYPE_LABEL_ID)?
            .ok_or_else(|| ConceptError::UnknownConcept(format!("type of {}", relation.id())))?;
        let owner_role = record.property(edge_property::RELATION_ROLE_OWNER_LABEL_ID).cloned();
        let value_role = record.property(edge_property::RELATION_ROLE_VALUE_LABEL_ID).cloned();
        let inferred = record
            .property(edge_property::IS_INFERRED)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false);

        let element = self.add_vertex_element(BaseType::Relation);
        let v = element.id;
        let shard = self.current_shard(&relation_type)?;
        self.add_edge_element(v, shard, EdgeLabel::Isa)?;
        self.set_vertex_prop(v, vertex_property::EDGE_RELATION_ID, edge_id_property(e))?;
        let type_label_id = self.label_id(&relation_type)?;
        self.set_vertex_prop(v, vertex_property::THING_TYPE_LABEL_ID, label_id_property(type_label_id))?;
        if inferred {
            self.set_vertex_prop(v, vertex_property::IS_INFERRED, true)?;
        }

        for (player, role) in [(record.source, owner_role), (record.target, value_role)] {
            let casting = self.add_edge_element(v, player, EdgeLabel::RolePlayer)?;
            if let Some(role) = role {
                self.set_edge_prop(casting.id, edge_property::ROLE_LABEL_ID, role)?;
            }
            self.set_edge_prop(casting.id, edge_property::RELATION_TYPE_LABEL_ID, label_id_property(type_label_id))?;
        }

        self.graph.delete_edge(e)?;
        relation.set_structure(RelationStructure::Reified(RelationReified { element }));
        self.emit(ConceptEvent::RelationReified {
            relation: relation.id(),
            vertex: v,
        });
        // The edge never counted as an instance; the vertex does
        self.emit(ConceptEvent::InstanceCreated {
            type_id: relation_type.id(),
            instance: relation.id(),
        });
        debug!(relation = %relation.id(), vertex = %v, "relation.reified");
        Ok(())
    }

    pub fn add_role_player(&mut self, relation: &Concept, role: &Concept, player: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(relation, is_relation, "relation")?;
        self.check_kind(role, is_role, "role")?;
        self.check_kind(player, is_thing, "thing")?;
        self.reify(relation)?;
        let rv = self.vertex_of(relation)?;
        let pv = self.ensure_vertex(player)?;
        let role_label_id = label_id_property(self.label_id(role)?);

        let exists = self
            .edges(rv, Direction::Out, EdgeLabel::RolePlayer)
            .iter()
            .any(|e| e.target == pv && e.property(edge_property::ROLE_LABEL_ID) == Some(&role_label_id));
        if exists {
            return Ok(());
        }
        let relation_type = self.thing_type(relation)?;
        let type_label_id = self.label_id(&relation_type)?;
        let casting = self.add_edge_element(rv, pv, EdgeLabel::RolePlayer)?;
        self.set_edge_prop(casting.id, edge_property::ROLE_LABEL_ID, role_label_id)?;
        self.set_edge_prop(casting.id, edge_property::RELATION_TYPE_LABEL_ID, label_id_property(type_label_id))?;
        self.emit(ConceptEvent::CastingAdded {
            relation: relation.id(),
            role: role.id(),
            player: player.id(),
        });
        Ok(())
    }

    /// Remove one casting; a relation left without role players is deleted
    pub fn remove_role_player(&mut self, relation: &Concept, role: &Concept, player: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(relation, is_relation, "relation")?;
        self.check_kind(role, is_role, "role")?;
        self.check_kind(player, is_thing, "thing")?;
        self.reify(relation)?;
        let rv = self.vertex_of(relation)?;
        let Some(pv) = player.vertex() else {
            return Ok(());
        };
        let role_label_id = label_id_property(self.label_id(role)?);
        let castings: Vec<EdgeId> = self
            .edges(rv, Direction::Out, EdgeLabel::RolePlayer)
            .into_iter()
            .filter(|e| e.target == pv && e.property(edge_property::ROLE_LABEL_ID) == Some(&role_label_id))
            .map(|e| e.id)
            .collect();
        if castings.is_empty() {
            return Ok(());
        }
        for casting in castings {
            self.graph.delete_edge(casting)?;
        }
        self.emit(ConceptEvent::CastingRemoved {
            relation: relation.id(),
            role: role.id(),
            player: player.id(),
        });
        self.cleanup_relation(rv)
    }

    /// Every casting of the relation, in either structure
    pub fn castings(&mut self, relation: &Concept) -> ConceptResult<Vec<Casting>> {
        self.check_kind(relation, is_relation, "relation")?;
        let mut castings = Vec::new();
        match relation.structure() {
            Some(RelationStructure::Edge(edge)) => {
                let record = self
                    .graph
                    .edge(edge.edge_id())
                    .ok_or_else(|| ConceptError::UnknownConcept(relation.id().to_string()))?;
                let ends = [
                    (record.source, edge_property::RELATION_ROLE_OWNER_LABEL_ID),
                    (record.target, edge_property::RELATION_ROLE_VALUE_LABEL_ID),
                ];
                for (player, key) in ends {
                    if let Some(role) = self.role_of_edge(&record, key)? {
                        let player = self.build_vertex(player)?;
                        castings.push(Casting {
                            relation: relation.clone(),
                            role,
                            player,
                        });
                    }
                }
            }
            Some(RelationStructure::Reified(reified)) => {
                for edge in self.edges(reified.vertex_id(), Direction::Out, EdgeLabel::RolePlayer) {
                    if let Some(role) = self.role_of_edge(&edge, edge_property::ROLE_LABEL_ID)? {
                        let player = self.build_vertex(edge.target)?;
                        castings.push(Casting {
                            relation: relation.clone(),
                            role,
                            player,
                        });
                    }
                }
            }
            None => {}
        }
        Ok(castings)
    }

    /// Role players of the relation, optionally restricted to some roles
    pub fn role_players(&mut self, relation: &Concept, roles: &[Concept]) -> ConceptResult<Vec<Concept>> {
        let mut players = Vec::new();
        for casting in self.castings(relation)? {
            if (roles.is_empty() || roles.contains(&casting.role)) && !players.contains(&casting.player) {
                players.push(casting.player);
            }
        }
        Ok(players)
    }

    /// Role players grouped by the role they play
    pub fn role_player_map(&mut self, relation: &Concept) -> ConceptResult<BTreeMap<Concept, Vec<Concept>>> {
        let mut map: BTreeMap<Concept, Vec<Concept>> = BTreeMap::new();
        for casting in self.castings(relation)? {
            map.entry(casting.role).or_default().push(casting.player);
        }
        Ok(map)
    }

    /// Delete a relation vertex that no longer connects anything, and an
    /// implicit relation that lost its owner or value
    pub(crate) fn cleanup_relation(&mut self, rv: VertexId) -> ConceptResult<()> {
        if !self.graph.vertex_exists(rv) {
            return Ok(());
        }
        let relation = self.build_vertex(rv)?;
        if relation.kind() != ConceptKind::Relation {
            return Ok(());
        }
        let relation_type = self.thing_type(&relation)?;
        let implicit = self.is_implicit(&relation_type)?;
        let castings = self.edges(rv, Direction::Out, EdgeLabel::RolePlayer).len();
        let referenced = !self.edges(rv, Direction::In, EdgeLabel::RolePlayer).is_empty()
            || !self.edges(rv, Direction::Both, EdgeLabel::Attribute).is_empty();
        if (implicit && castings < 2) || (castings == 0 && !referenced) {
            debug!(relation = %relation.id(), implicit, "relation.cleaned_up");
            self.delete_thing(&relation)?;
        }
        Ok(())
    }
}
