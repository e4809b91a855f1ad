//! Type model: schema concepts, their hierarchy, plays/relates, has/key and sharding

use super::attribute::DataType;
use super::events::ConceptEvent;
use super::manager::{label_id_property, vertex_id_property, ConceptManager};
use super::schema::{edge_property, is_reserved_label, vertex_property, BaseType, EdgeLabel, ImplicitType, MetaSchema};
use super::{Concept, ConceptId, ConceptKind, Label, LabelId};
use crate::error::{ConceptError, ConceptResult, TransactionError};
use crate::graph::{Direction, PropertyValue, VertexId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, info};

fn is_schema(kind: ConceptKind) -> bool {
    kind.is_schema()
}

fn is_type(kind: ConceptKind) -> bool {
    kind.is_type()
}

fn is_role(kind: ConceptKind) -> bool {
    kind == ConceptKind::Role
}

fn is_relation_type(kind: ConceptKind) -> bool {
    kind == ConceptKind::RelationType
}

fn is_attribute_type(kind: ConceptKind) -> bool {
    kind == ConceptKind::AttributeType
}

fn is_rule(kind: ConceptKind) -> bool {
    kind == ConceptKind::Rule
}

impl ConceptManager {
    // === Put ===

    pub fn put_entity_type(&mut self, label: &str) -> ConceptResult<Concept> {
        self.put_schema_concept(label, BaseType::EntityType, false)
    }

    pub fn put_relation_type(&mut self, label: &str) -> ConceptResult<Concept> {
        self.put_schema_concept(label, BaseType::RelationType, false)
    }

    pub fn put_role(&mut self, label: &str) -> ConceptResult<Concept> {
        self.put_schema_concept(label, BaseType::Role, false)
    }

    pub fn put_attribute_type(&mut self, label: &str, data_type: DataType) -> ConceptResult<Concept> {
        self.check_writable()?;
        if let Some(existing) = self.get_schema_concept(label)? {
            if existing.kind() == ConceptKind::AttributeType {
                let current = self.data_type(&existing)?;
                if current != Some(data_type) {
                    return Err(TransactionError::DataTypeMismatch {
                        label: label.to_string(),
                        existing: current.map_or("none", |d| d.name()).to_string(),
                        requested: data_type.name().to_string(),
                    }
                    .into());
                }
                return Ok(existing);
            }
        }
        let attribute_type = self.put_schema_concept(label, BaseType::AttributeType, false)?;
        let v = self.vertex_of(&attribute_type)?;
        self.set_vertex_prop(v, vertex_property::DATA_TYPE, data_type.name())?;
        self.set_fact(attribute_type.id(), |f| &mut f.data_type, Some(data_type));
        Ok(attribute_type)
    }

    /// A rule carrying its `when`/`then` pattern text
    pub fn put_rule(&mut self, label: &str, when: &str, then: &str) -> ConceptResult<Concept> {
        let existing = self.get_schema_concept(label)?;
        let rule = self.put_schema_concept(label, BaseType::Rule, false)?;
        if existing.is_none() {
            let v = self.vertex_of(&rule)?;
            self.set_vertex_prop(v, vertex_property::RULE_WHEN, when)?;
            self.set_vertex_prop(v, vertex_property::RULE_THEN, then)?;
        }
        Ok(rule)
    }

    pub(crate) fn put_implicit_relation_type(&mut self, label: &Label) -> ConceptResult<Concept> {
        self.put_schema_concept(label.as_str(), BaseType::RelationType, true)
    }

    pub(crate) fn put_implicit_role(&mut self, label: &Label) -> ConceptResult<Concept> {
        self.put_schema_concept(label.as_str(), BaseType::Role, true)
    }

    fn put_schema_concept(&mut self, label: &str, base: BaseType, implicit: bool) -> ConceptResult<Concept> {
        self.check_writable()?;
        if !implicit && is_reserved_label(label) {
            return Err(TransactionError::ReservedLabel(label.to_string()).into());
        }
        let kind = base
            .concept_kind()
            .ok_or_else(|| ConceptError::UnknownConcept(format!("base type {}", base.marker())))?;
        if let Some(existing) = self.get_schema_concept(label)? {
            if existing.kind() != kind {
                return Err(TransactionError::LabelTaken {
                    label: label.to_string(),
                    existing: existing.kind().name().to_string(),
                }
                .into());
            }
            return Ok(existing);
        }

        let v = self.add_vertex_element(base).id;
        let label_id = self.next_label_id();
        self.set_vertex_prop(v, vertex_property::SCHEMA_LABEL, label)?;
        self.set_vertex_prop(v, vertex_property::LABEL_ID, label_id_property(label_id))?;
        if implicit {
            self.set_vertex_prop(v, vertex_property::IS_IMPLICIT, true)?;
        }
        let concept = self.build_vertex(v)?;
        self.emit(ConceptEvent::SchemaConceptCreated {
            concept: concept.id(),
            label: Label::from(label),
        });
        if kind.is_type() {
            self.set_vertex_prop(v, vertex_property::IS_ABSTRACT, false)?;
            self.create_shard(&concept)?;
        }
        if let Some(root) = MetaSchema::root_of(kind) {
            let root = self.meta(root)?;
            self.link_sup(&concept, &root)?;
        }
        debug!(label, kind = %kind, implicit, "schema.concept.created");
        Ok(concept)
    }

    pub(crate) fn vertex_of(&self, concept: &Concept) -> ConceptResult<VertexId> {
        concept
            .vertex()
            .ok_or_else(|| TransactionError::ReificationRequired(concept.id().to_string()).into())
    }

    pub(crate) fn concepts(&mut self, ids: impl IntoIterator<Item = ConceptId>) -> ConceptResult<Vec<Concept>> {
        let mut concepts = Vec::new();
        for id in ids {
            if let Some(concept) = self.get_concept(id)? {
                concepts.push(concept);
            }
        }
        Ok(concepts)
    }

    pub(crate) fn check_not_meta(&mut self, concept: &Concept) -> ConceptResult<()> {
        if self.is_meta(concept)? {
            return Err(TransactionError::MetaTypeImmutable(self.label(concept)?.to_string()).into());
        }
        Ok(())
    }

    // === Labels ===

    pub fn label(&mut self, concept: &Concept) -> ConceptResult<Label> {
        self.check_kind(concept, is_schema, "schema concept")?;
        let v = self.vertex_of(concept)?;
        let id = concept.id();
        self.schema_fact(id, |f| &mut f.label, |m| {
            m.vertex_prop(v, vertex_property::SCHEMA_LABEL)
                .and_then(|p| p.as_str().map(Label::from))
                .ok_or_else(|| ConceptError::UnknownConcept(format!("{} has no label", id)))
        })
    }

    pub fn label_id(&mut self, concept: &Concept) -> ConceptResult<LabelId> {
        self.check_kind(concept, is_schema, "schema concept")?;
        let v = self.vertex_of(concept)?;
        let id = concept.id();
        self.schema_fact(id, |f| &mut f.label_id, |m| {
            m.vertex_prop(v, vertex_property::LABEL_ID)
                .and_then(|p| p.as_long())
                .map(|raw| LabelId::new(raw as u32))
                .ok_or_else(|| ConceptError::UnknownConcept(format!("{} has no label id", id)))
        })
    }

    pub fn set_label(&mut self, concept: &Concept, label: &str) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(concept, is_schema, "schema concept")?;
        self.check_not_meta(concept)?;
        if is_reserved_label(label) && !self.is_implicit(concept)? {
            return Err(TransactionError::ReservedLabel(label.to_string()).into());
        }
        if let Some(existing) = self.get_schema_concept(label)? {
            if existing == *concept {
                return Ok(());
            }
            return Err(TransactionError::LabelTaken {
                label: label.to_string(),
                existing: existing.kind().name().to_string(),
            }
            .into());
        }
        let old = self.label(concept)?;
        let v = self.vertex_of(concept)?;
        self.set_vertex_prop(v, vertex_property::SCHEMA_LABEL, label)?;
        self.set_fact(concept.id(), |f| &mut f.label, Label::from(label));
        self.emit(ConceptEvent::LabelChanged {
            concept: concept.id(),
            old,
            new: Label::from(label),
        });
        Ok(())
    }

    pub fn is_implicit(&mut self, concept: &Concept) -> ConceptResult<bool> {
        self.check_kind(concept, is_schema, "schema concept")?;
        let v = self.vertex_of(concept)?;
        self.schema_fact(concept.id(), |f| &mut f.is_implicit, |m| {
            Ok(m.vertex_prop(v, vertex_property::IS_IMPLICIT)
                .and_then(|p| p.as_bool())
                .unwrap_or(false))
        })
    }

    // === Hierarchy ===

    fn direct_sup_id(&mut self, concept: &Concept) -> ConceptResult<Option<ConceptId>> {
        let v = self.vertex_of(concept)?;
        self.schema_fact(concept.id(), |f| &mut f.sup, |m| {
            Ok(m.neighbours(v, Direction::Out, EdgeLabel::Sub)
                .into_iter()
                .next()
                .map(ConceptId::Vertex))
        })
    }

    fn direct_sub_ids(&mut self, concept: &Concept) -> ConceptResult<BTreeSet<ConceptId>> {
        let v = self.vertex_of(concept)?;
        self.schema_fact(concept.id(), |f| &mut f.subs, |m| {
            Ok(m.neighbours(v, Direction::In, EdgeLabel::Sub)
                .into_iter()
                .map(ConceptId::Vertex)
                .collect())
        })
    }

    /// Direct super concept; `None` only for the roots
    pub fn sup(&mut self, concept: &Concept) -> ConceptResult<Option<Concept>> {
        self.check_kind(concept, is_schema, "schema concept")?;
        match self.direct_sup_id(concept)? {
            Some(id) => self.get_concept(id),
            None => Ok(None),
        }
    }

    /// The concept followed by all its supers, nearest first
    pub fn sups(&mut self, concept: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(concept, is_schema, "schema concept")?;
        let mut chain = vec![concept.clone()];
        let mut current = concept.clone();
        while let Some(sup) = self.sup(&current)? {
            if chain.contains(&sup) {
                break;
            }
            chain.push(sup.clone());
            current = sup;
        }
        Ok(chain)
    }

    /// The concept followed by all its transitive subs, breadth first
    pub fn subs(&mut self, concept: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(concept, is_schema, "schema concept")?;
        let mut seen = BTreeSet::from([concept.id()]);
        let mut result = vec![concept.clone()];
        let mut queue = VecDeque::from([concept.clone()]);
        while let Some(next) = queue.pop_front() {
            for id in self.direct_sub_ids(&next)? {
                if seen.insert(id) {
                    if let Some(sub) = self.get_concept(id)? {
                        result.push(sub.clone());
                        queue.push_back(sub);
                    }
                }
            }
        }
        Ok(result)
    }

    pub fn set_sup(&mut self, concept: &Concept, sup: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(concept, is_schema, "schema concept")?;
        self.check_owned(sup)?;
        self.check_not_meta(concept)?;
        if sup.kind() != concept.kind() {
            return Err(TransactionError::WrongKind {
                concept: sup.id().to_string(),
                actual: sup.kind().name(),
                expected: concept.kind().name(),
            }
            .into());
        }
        let old = self.sup(concept)?;
        if old.as_ref() == Some(sup) {
            return Ok(());
        }
        if self.sups(sup)?.contains(concept) {
            return Err(TransactionError::SupLoop {
                concept: self.label(concept)?.to_string(),
                sup: self.label(sup)?.to_string(),
            }
            .into());
        }
        if concept.kind() == ConceptKind::AttributeType && !self.is_meta(sup)? {
            let mine = self.data_type(concept)?;
            let theirs = self.data_type(sup)?;
            if mine != theirs {
                return Err(TransactionError::DataTypeMismatch {
                    label: self.label(sup)?.to_string(),
                    existing: theirs.map_or("none", |d| d.name()).to_string(),
                    requested: mine.map_or("none", |d| d.name()).to_string(),
                }
                .into());
            }
        }
        if concept.kind().is_type() {
            if let Some(old) = &old {
                self.check_changing_super_keeps_roles(concept, old, sup)?;
            }
        }
        self.link_sup(concept, sup)?;
        if concept.kind().is_type() {
            self.track_instances_for_validation(concept)?;
        }
        Ok(())
    }

    /// Changing the super must not take away a role the type's instances
    /// may currently be playing through the old super
    fn check_changing_super_keeps_roles(&mut self, concept: &Concept, old: &Concept, new: &Concept) -> ConceptResult<()> {
        if self.is_meta(old)? {
            return Ok(());
        }
        let mut lost: BTreeSet<Concept> = self.playing(old)?.into_iter().collect();
        for sub in self.subs(concept)? {
            for role in self.direct_plays(&sub)?.keys() {
                lost.remove(role);
            }
        }
        for role in self.playing(new)? {
            lost.remove(&role);
        }
        if let Some(role) = lost.into_iter().next() {
            if self.has_direct_instances(concept)? {
                return Err(TransactionError::ChangingSuperDisconnectsRole {
                    concept: self.label(concept)?.to_string(),
                    sup: self.label(new)?.to_string(),
                    role: self.label(&role)?.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Rewire the sub edge and both sides' caches, without contract checks
    pub(crate) fn link_sup(&mut self, concept: &Concept, sup: &Concept) -> ConceptResult<()> {
        let v = self.vertex_of(concept)?;
        let sv = self.vertex_of(sup)?;
        let old = self.direct_sup_id(concept)?;
        if old == Some(sup.id()) {
            return Ok(());
        }
        for edge in self.edges(v, Direction::Out, EdgeLabel::Sub) {
            self.graph.delete_edge(edge.id)?;
        }
        self.add_edge_element(v, sv, EdgeLabel::Sub)?;

        let id = concept.id();
        self.set_fact(id, |f| &mut f.sup, Some(sup.id()));
        if let Some(old) = old {
            self.update_fact(old, |f| &mut f.subs, |subs| {
                subs.remove(&id);
            });
        }
        self.update_fact(sup.id(), |f| &mut f.subs, |subs| {
            subs.insert(id);
        });
        Ok(())
    }

    // === Flags ===

    pub fn is_abstract(&mut self, concept: &Concept) -> ConceptResult<bool> {
        self.check_kind(concept, is_type, "type")?;
        let v = self.vertex_of(concept)?;
        self.schema_fact(concept.id(), |f| &mut f.is_abstract, |m| {
            Ok(m.vertex_prop(v, vertex_property::IS_ABSTRACT)
                .and_then(|p| p.as_bool())
                .unwrap_or(false))
        })
    }

    pub fn set_abstract(&mut self, concept: &Concept, is_abstract: bool) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(concept, is_type, "type")?;
        self.check_not_meta(concept)?;
        if is_abstract && self.has_direct_instances(concept)? {
            return Err(TransactionError::AbstractInstantiation(self.label(concept)?.to_string()).into());
        }
        let v = self.vertex_of(concept)?;
        self.set_vertex_prop(v, vertex_property::IS_ABSTRACT, is_abstract)?;
        self.set_fact(concept.id(), |f| &mut f.is_abstract, is_abstract);
        Ok(())
    }

    // === Plays ===

    /// Roles the type plays directly, with their `required` flag
    pub fn direct_plays(&mut self, concept: &Concept) -> ConceptResult<BTreeMap<Concept, bool>> {
        self.check_kind(concept, is_type, "type")?;
        let v = self.vertex_of(concept)?;
        let plays = self.schema_fact(concept.id(), |f| &mut f.plays, |m| {
            Ok(m.edges(v, Direction::Out, EdgeLabel::Plays)
                .into_iter()
                .map(|e| {
                    let required = e
                        .property(edge_property::REQUIRED)
                        .and_then(|p| p.as_bool())
                        .unwrap_or(false);
                    (ConceptId::Vertex(e.target), required)
                })
                .collect())
        })?;
        let mut result = BTreeMap::new();
        for (role, required) in plays {
            if let Some(role) = self.get_concept(role)? {
                result.insert(role, required);
            }
        }
        Ok(result)
    }

    /// Every role the type can play, its supers' included
    pub fn playing(&mut self, concept: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(concept, is_type, "type")?;
        let mut roles = BTreeSet::new();
        for sup in self.sups(concept)? {
            roles.extend(self.direct_plays(&sup)?.into_keys());
        }
        Ok(roles.into_iter().collect())
    }

    fn direct_player_ids(&mut self, role: &Concept) -> ConceptResult<BTreeSet<ConceptId>> {
        let v = self.vertex_of(role)?;
        self.schema_fact(role.id(), |f| &mut f.played_by, |m| {
            Ok(m.neighbours(v, Direction::In, EdgeLabel::Plays)
                .into_iter()
                .map(ConceptId::Vertex)
                .collect())
        })
    }

    /// Types that can play the role, subs of the direct players included
    pub fn players(&mut self, role: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(role, is_role, "role")?;
        let mut players = BTreeSet::new();
        let direct = self.direct_player_ids(role)?;
        for player in self.concepts(direct)? {
            players.extend(self.subs(&player)?);
        }
        Ok(players.into_iter().collect())
    }

    pub fn play(&mut self, concept: &Concept, role: &Concept, required: bool) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(concept, is_type, "type")?;
        self.check_kind(role, is_role, "role")?;
        self.check_not_meta(concept)?;
        self.check_not_meta(role)?;
        self.play_unchecked(concept, role, required)
    }

    pub(crate) fn play_unchecked(&mut self, concept: &Concept, role: &Concept, required: bool) -> ConceptResult<()> {
        let tv = self.vertex_of(concept)?;
        let rv = self.vertex_of(role)?;
        match self.edge_between(tv, rv, EdgeLabel::Plays) {
            Some(edge) => self.set_edge_prop(edge, edge_property::REQUIRED, required)?,
            None => {
                let edge = self.add_edge_element(tv, rv, EdgeLabel::Plays)?;
                if required {
                    self.set_edge_prop(edge.id, edge_property::REQUIRED, true)?;
                }
            }
        }
        let (type_id, role_id) = (concept.id(), role.id());
        self.update_fact(type_id, |f| &mut f.plays, |plays| {
            plays.insert(role_id, required);
        });
        self.update_fact(role_id, |f| &mut f.played_by, |players| {
            players.insert(type_id);
        });
        Ok(())
    }

    pub fn unplay(&mut self, concept: &Concept, role: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(concept, is_type, "type")?;
        self.check_kind(role, is_role, "role")?;
        self.check_not_meta(concept)?;
        self.unplay_unchecked(concept, role)
    }

    fn unplay_unchecked(&mut self, concept: &Concept, role: &Concept) -> ConceptResult<()> {
        let tv = self.vertex_of(concept)?;
        let rv = self.vertex_of(role)?;
        while let Some(edge) = self.edge_between(tv, rv, EdgeLabel::Plays) {
            self.graph.delete_edge(edge)?;
        }
        let (type_id, role_id) = (concept.id(), role.id());
        self.update_fact(type_id, |f| &mut f.plays, |plays| {
            plays.remove(&role_id);
        });
        self.update_fact(role_id, |f| &mut f.played_by, |players| {
            players.remove(&type_id);
        });
        self.track_instances_for_validation(concept)
    }

    fn track_instances_for_validation(&mut self, concept: &Concept) -> ConceptResult<()> {
        for instance in self.instances(concept)? {
            self.cache.tracked_things.insert(instance.id());
        }
        Ok(())
    }

    // === Relates ===

    fn direct_relates_ids(&mut self, relation_type: &Concept) -> ConceptResult<BTreeSet<ConceptId>> {
        let v = self.vertex_of(relation_type)?;
        self.schema_fact(relation_type.id(), |f| &mut f.relates, |m| {
            Ok(m.neighbours(v, Direction::Out, EdgeLabel::Relates)
                .into_iter()
                .map(ConceptId::Vertex)
                .collect())
        })
    }

    fn direct_related_by_ids(&mut self, role: &Concept) -> ConceptResult<BTreeSet<ConceptId>> {
        let v = self.vertex_of(role)?;
        self.schema_fact(role.id(), |f| &mut f.related_by, |m| {
            Ok(m.neighbours(v, Direction::In, EdgeLabel::Relates)
                .into_iter()
                .map(ConceptId::Vertex)
                .collect())
        })
    }

    /// Roles the relation type relates directly
    pub fn roles_of(&mut self, relation_type: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(relation_type, is_relation_type, "relation type")?;
        let ids = self.direct_relates_ids(relation_type)?;
        self.concepts(ids)
    }

    /// Relation types relating the role
    pub fn relation_types_of(&mut self, role: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(role, is_role, "role")?;
        let ids = self.direct_related_by_ids(role)?;
        self.concepts(ids)
    }

    pub fn relates(&mut self, relation_type: &Concept, role: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(relation_type, is_relation_type, "relation type")?;
        self.check_kind(role, is_role, "role")?;
        self.check_not_meta(relation_type)?;
        self.check_not_meta(role)?;
        self.relates_unchecked(relation_type, role)
    }

    pub(crate) fn relates_unchecked(&mut self, relation_type: &Concept, role: &Concept) -> ConceptResult<()> {
        let rtv = self.vertex_of(relation_type)?;
        let rv = self.vertex_of(role)?;
        self.put_edge(rtv, rv, EdgeLabel::Relates)?;
        let (rel_id, role_id) = (relation_type.id(), role.id());
        self.update_fact(rel_id, |f| &mut f.relates, |roles| {
            roles.insert(role_id);
        });
        self.update_fact(role_id, |f| &mut f.related_by, |rels| {
            rels.insert(rel_id);
        });
        Ok(())
    }

    pub fn unrelate(&mut self, relation_type: &Concept, role: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(relation_type, is_relation_type, "relation type")?;
        self.check_kind(role, is_role, "role")?;
        self.check_not_meta(relation_type)?;
        self.unrelate_unchecked(relation_type, role)
    }

    fn unrelate_unchecked(&mut self, relation_type: &Concept, role: &Concept) -> ConceptResult<()> {
        let rtv = self.vertex_of(relation_type)?;
        let rv = self.vertex_of(role)?;
        while let Some(edge) = self.edge_between(rtv, rv, EdgeLabel::Relates) {
            self.graph.delete_edge(edge)?;
        }
        let (rel_id, role_id) = (relation_type.id(), role.id());
        self.update_fact(rel_id, |f| &mut f.relates, |roles| {
            roles.remove(&role_id);
        });
        self.update_fact(role_id, |f| &mut f.related_by, |rels| {
            rels.remove(&rel_id);
        });
        self.track_instances_for_validation(relation_type)
    }

    // === Has / key ===

    /// Allow instances of `owner` to own attributes of `attribute_type`
    pub fn has(&mut self, owner: &Concept, attribute_type: &Concept) -> ConceptResult<()> {
        self.attach_attribute_type(owner, attribute_type, false)
    }

    /// Require every instance of `owner` to own exactly one attribute of `attribute_type`
    pub fn key(&mut self, owner: &Concept, attribute_type: &Concept) -> ConceptResult<()> {
        self.attach_attribute_type(owner, attribute_type, true)
    }

    pub fn unhas(&mut self, owner: &Concept, attribute_type: &Concept) -> ConceptResult<()> {
        self.detach_attribute_type(owner, attribute_type, false)
    }

    pub fn unkey(&mut self, owner: &Concept, attribute_type: &Concept) -> ConceptResult<()> {
        self.detach_attribute_type(owner, attribute_type, true)
    }

    fn attach_attribute_type(&mut self, owner: &Concept, attribute_type: &Concept, key: bool) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(owner, is_type, "type")?;
        self.check_kind(attribute_type, is_attribute_type, "attribute type")?;
        self.check_not_meta(owner)?;
        self.check_not_meta(attribute_type)?;

        let (attempted, existing, other) = if key {
            ("key", "has", self.has_types(owner)?)
        } else {
            ("has", "key", self.keys_of(owner)?)
        };
        if other.contains(attribute_type) {
            return Err(TransactionError::HasKeyOverlap {
                owner: self.label(owner)?.to_string(),
                attribute: self.label(attribute_type)?.to_string(),
                attempted,
                existing,
            }
            .into());
        }

        let attribute_label = self.label(attribute_type)?;
        let (relation_kind, owner_kind, value_kind) = ImplicitType::family(key);
        let owner_role = self.put_implicit_role(&owner_kind.label(attribute_label.as_str()))?;
        let value_role = self.put_implicit_role(&value_kind.label(attribute_label.as_str()))?;
        let relation_type = self.put_implicit_relation_type(&relation_kind.label(attribute_label.as_str()))?;
        self.relates_unchecked(&relation_type, &owner_role)?;
        self.relates_unchecked(&relation_type, &value_role)?;

        self.play_unchecked(owner, &owner_role, key)?;
        self.play_unchecked(attribute_type, &value_role, false)?;

        self.mirror_attribute_hierarchy(attribute_type, key, &owner_role, &value_role, &relation_type)?;
        let owner_label = self.label(owner)?;
        debug!(owner = %owner_label, attribute = %attribute_label, key, "schema.attribute.attached");
        Ok(())
    }

    /// Subtyping of attribute types is mirrored by subtyping of their implicit
    /// relation types and roles, up to the `attribute` meta type
    fn mirror_attribute_hierarchy(
        &mut self,
        attribute_type: &Concept,
        key: bool,
        owner_role: &Concept,
        value_role: &Concept,
        relation_type: &Concept,
    ) -> ConceptResult<()> {
        let Some(sup) = self.sup(attribute_type)? else {
            return Ok(());
        };
        let sup_label = self.label(&sup)?;
        let (relation_kind, owner_kind, value_kind) = ImplicitType::family(key);
        let owner_sup = self.put_implicit_role(&owner_kind.label(sup_label.as_str()))?;
        let value_sup = self.put_implicit_role(&value_kind.label(sup_label.as_str()))?;
        let relation_sup = self.put_implicit_relation_type(&relation_kind.label(sup_label.as_str()))?;
        self.relates_unchecked(&relation_sup, &owner_sup)?;
        self.relates_unchecked(&relation_sup, &value_sup)?;

        self.link_sup(owner_role, &owner_sup)?;
        self.link_sup(value_role, &value_sup)?;
        self.link_sup(relation_type, &relation_sup)?;

        if sup_label.as_str() != MetaSchema::Attribute.label() {
            self.play_unchecked(&sup, &value_sup, false)?;
            self.mirror_attribute_hierarchy(&sup, key, &owner_sup, &value_sup, &relation_sup)?;
        }
        Ok(())
    }

    fn detach_attribute_type(&mut self, owner: &Concept, attribute_type: &Concept, key: bool) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(owner, is_type, "type")?;
        self.check_kind(attribute_type, is_attribute_type, "attribute type")?;
        self.check_not_meta(owner)?;

        let attribute_label = self.label(attribute_type)?;
        let (_, owner_kind, _) = ImplicitType::family(key);
        let Some(owner_role) = self.get_role(owner_kind.label(attribute_label.as_str()).as_str())? else {
            return Ok(());
        };
        if !self.direct_plays(owner)?.contains_key(&owner_role) {
            return Ok(());
        }

        for instance in self.instances(owner)? {
            for attribute in self.attributes_of(&instance, &[])? {
                if self.thing_type(&attribute)? == *attribute_type {
                    return Err(TransactionError::IllegalUnhas {
                        owner: self.label(owner)?.to_string(),
                        attribute: attribute_label.to_string(),
                    }
                    .into());
                }
            }
        }

        self.unplay_unchecked(owner, &owner_role)?;
        if self.direct_player_ids(&owner_role)?.is_empty() {
            self.remove_unused_implicit_types(attribute_type, key)?;
        }
        let owner_label = self.label(owner)?;
        debug!(owner = %owner_label, attribute = %attribute_label, key, "schema.attribute.detached");
        Ok(())
    }

    fn remove_unused_implicit_types(&mut self, attribute_type: &Concept, key: bool) -> ConceptResult<()> {
        let attribute_label = self.label(attribute_type)?;
        let (relation_kind, owner_kind, value_kind) = ImplicitType::family(key);
        let relation_type = self.get_relation_type(relation_kind.label(attribute_label.as_str()).as_str())?;
        let owner_role = self.get_role(owner_kind.label(attribute_label.as_str()).as_str())?;
        let value_role = self.get_role(value_kind.label(attribute_label.as_str()).as_str())?;
        let (Some(relation_type), Some(owner_role), Some(value_role)) = (relation_type, owner_role, value_role) else {
            return Ok(());
        };
        for concept in [&relation_type, &owner_role, &value_role] {
            if !self.direct_sub_ids(concept)?.is_empty() {
                return Ok(());
            }
        }
        if !self.instances(&relation_type)?.is_empty() {
            return Ok(());
        }
        self.unplay_unchecked(attribute_type, &value_role)?;
        self.delete_schema_concept_unchecked(&relation_type)?;
        self.delete_schema_concept_unchecked(&owner_role)?;
        self.delete_schema_concept_unchecked(&value_role)?;
        Ok(())
    }

    fn implicit_attribute_types(&mut self, owner: &Concept, owner_kind: ImplicitType) -> ConceptResult<Vec<Concept>> {
        let mut result = Vec::new();
        for role in self.playing(owner)? {
            let label = self.label(&role)?;
            if let Some(attribute_label) = owner_kind.attribute_label(label.as_str()) {
                if let Some(attribute_type) = self.get_attribute_type(attribute_label)? {
                    result.push(attribute_type);
                }
            }
        }
        Ok(result)
    }

    fn has_types(&mut self, owner: &Concept) -> ConceptResult<Vec<Concept>> {
        self.implicit_attribute_types(owner, ImplicitType::HasOwner)
    }

    /// Attribute types the type's instances may own, keys included
    pub fn attribute_types_of(&mut self, owner: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(owner, is_type, "type")?;
        let mut types = self.has_types(owner)?;
        types.extend(self.keys_of(owner)?);
        Ok(types)
    }

    /// Attribute types that are keys of the type
    pub fn keys_of(&mut self, owner: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_kind(owner, is_type, "type")?;
        self.implicit_attribute_types(owner, ImplicitType::KeyOwner)
    }

    // === Rules ===

    pub fn rule_when(&mut self, rule: &Concept) -> ConceptResult<Option<String>> {
        self.check_kind(rule, is_rule, "rule")?;
        let v = self.vertex_of(rule)?;
        Ok(self
            .vertex_prop(v, vertex_property::RULE_WHEN)
            .and_then(|p| p.as_str().map(str::to_string)))
    }

    pub fn rule_then(&mut self, rule: &Concept) -> ConceptResult<Option<String>> {
        self.check_kind(rule, is_rule, "rule")?;
        let v = self.vertex_of(rule)?;
        Ok(self
            .vertex_prop(v, vertex_property::RULE_THEN)
            .and_then(|p| p.as_str().map(str::to_string)))
    }

    // === Shards and instances ===

    pub(crate) fn create_shard(&mut self, concept: &Concept) -> ConceptResult<VertexId> {
        let tv = self.vertex_of(concept)?;
        let shard = self.add_vertex_element(BaseType::Shard).id;
        self.add_edge_element(shard, tv, EdgeLabel::Shard)?;
        self.set_vertex_prop(tv, vertex_property::CURRENT_SHARD, vertex_id_property(shard))?;
        self.emit(ConceptEvent::ShardCreated {
            type_id: concept.id(),
            shard,
        });
        Ok(shard)
    }

    /// Start a new shard for the type; new instances go there from now on
    pub fn shard(&mut self, concept: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(concept, is_type, "type")?;
        let shard = self.create_shard(concept)?;
        let label = self.label(concept)?;
        info!(type_label = %label, %shard, "shard.created");
        Ok(())
    }

    pub(crate) fn current_shard(&mut self, concept: &Concept) -> ConceptResult<VertexId> {
        if let Some(shard) = self.cache.current_shards.get(&concept.id()) {
            return Ok(*shard);
        }
        let tv = self.vertex_of(concept)?;
        let pointed = self
            .vertex_prop(tv, vertex_property::CURRENT_SHARD)
            .and_then(|p| p.as_long())
            .map(|raw| VertexId::new(raw as u64))
            .filter(|shard| self.graph.vertex_exists(*shard));
        let shard = match pointed {
            Some(shard) => shard,
            None => self
                .shards(tv)
                .into_iter()
                .max()
                .ok_or_else(|| ConceptError::temporary_write(concept.id(), "type has no shard"))?,
        };
        self.cache.current_shards.insert(concept.id(), shard);
        Ok(shard)
    }

    fn shards(&self, type_vertex: VertexId) -> Vec<VertexId> {
        self.neighbours(type_vertex, Direction::In, EdgeLabel::Shard)
    }

    pub fn shard_count(&mut self, concept: &Concept) -> ConceptResult<usize> {
        self.check_open()?;
        self.check_kind(concept, is_type, "type")?;
        let tv = self.vertex_of(concept)?;
        Ok(self.shards(tv).len())
    }

    /// Direct instances of the type, counted shard by shard
    pub fn instance_count(&mut self, concept: &Concept) -> ConceptResult<u64> {
        self.check_open()?;
        self.check_kind(concept, is_type, "type")?;
        let tv = self.vertex_of(concept)?;
        Ok(self
            .shards(tv)
            .into_iter()
            .map(|shard| self.edges(shard, Direction::In, EdgeLabel::Isa).len() as u64)
            .sum())
    }

    pub(crate) fn has_direct_instances(&mut self, concept: &Concept) -> ConceptResult<bool> {
        let tv = self.vertex_of(concept)?;
        Ok(self
            .shards(tv)
            .into_iter()
            .any(|shard| !self.edges(shard, Direction::In, EdgeLabel::Isa).is_empty()))
    }

    fn direct_instances(&mut self, concept: &Concept) -> ConceptResult<Vec<Concept>> {
        let tv = self.vertex_of(concept)?;
        let mut vertices = Vec::new();
        for shard in self.shards(tv) {
            vertices.extend(self.neighbours(shard, Direction::In, EdgeLabel::Isa));
        }
        let mut instances = Vec::new();
        for v in vertices {
            instances.push(self.build_vertex(v)?);
        }
        if concept.kind() == ConceptKind::RelationType && self.is_implicit(concept)? {
            instances.extend(self.edge_form_instances(concept)?);
        }
        Ok(instances)
    }

    /// Edge-form relations of an implicit relation type: the attribute edges
    /// into instances of the attribute types playing its value role
    fn edge_form_instances(&mut self, relation_type: &Concept) -> ConceptResult<Vec<Concept>> {
        let label_id = PropertyValue::Long(self.label_id(relation_type)?.as_u32() as i64);
        let mut attribute_types = Vec::new();
        for role in self.roles_of(relation_type)? {
            let label = self.label(&role)?;
            if ImplicitType::is_value_role(label.as_str()) {
                let direct = self.direct_player_ids(&role)?;
                attribute_types.extend(self.concepts(direct)?);
            }
        }
        let mut edges = BTreeSet::new();
        for attribute_type in attribute_types {
            let tv = self.vertex_of(&attribute_type)?;
            for shard in self.shards(tv) {
                for attribute in self.neighbours(shard, Direction::In, EdgeLabel::Isa) {
                    for edge in self.edges(attribute, Direction::In, EdgeLabel::Attribute) {
                        if edge.property(edge_property::RELATION_TYPE_LABEL_ID) == Some(&label_id) {
                            edges.insert(edge.id);
                        }
                    }
                }
            }
        }
        let mut relations = Vec::new();
        for edge in edges {
            relations.push(self.build_edge(edge)?);
        }
        Ok(relations)
    }

    /// All instances of the type and of its subs
    pub fn instances(&mut self, concept: &Concept) -> ConceptResult<Vec<Concept>> {
        self.check_open()?;
        self.check_kind(concept, is_type, "type")?;
        let mut instances = Vec::new();
        for sub in self.subs(concept)? {
            instances.extend(self.direct_instances(&sub)?);
        }
        Ok(instances)
    }

    // === Deletion ===

    pub fn delete_schema_concept(&mut self, concept: &Concept) -> ConceptResult<()> {
        self.check_writable()?;
        self.check_kind(concept, is_schema, "schema concept")?;
        self.check_not_meta(concept)?;
        let label = self.label(concept)?;
        let refuse = |reason: &str| -> ConceptError {
            TransactionError::DeletionNotAllowed {
                label: label.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };
        if !self.direct_sub_ids(concept)?.is_empty() {
            return Err(refuse("it has sub concepts"));
        }
        if concept.kind().is_type() && !self.direct_instances(concept)?.is_empty() {
            return Err(refuse("it has instances"));
        }
        if concept.kind() == ConceptKind::Role {
            for relation_type in self.relation_types_of(concept)? {
                if !self.instances(&relation_type)?.is_empty() {
                    return Err(refuse("relations using it still exist"));
                }
            }
        }
        self.delete_schema_concept_unchecked(concept)
    }

    fn delete_schema_concept_unchecked(&mut self, concept: &Concept) -> ConceptResult<()> {
        let id = concept.id();
        let v = self.vertex_of(concept)?;
        let label = self.label(concept)?;

        if let Some(sup) = self.direct_sup_id(concept)? {
            self.update_fact(sup, |f| &mut f.subs, |subs| {
                subs.remove(&id);
            });
        }
        if concept.kind().is_type() {
            for role in self.direct_plays(concept)?.into_keys() {
                self.update_fact(role.id(), |f| &mut f.played_by, |players| {
                    players.remove(&id);
                });
            }
            for shard in self.shards(v) {
                self.graph.delete_vertex(shard)?;
            }
        }
        if concept.kind() == ConceptKind::Role {
            for player in self.direct_player_ids(concept)? {
                self.update_fact(player, |f| &mut f.plays, |plays| {
                    plays.remove(&id);
                });
            }
            for relation_type in self.direct_related_by_ids(concept)? {
                self.update_fact(relation_type, |f| &mut f.relates, |roles| {
                    roles.remove(&id);
                });
            }
        }
        if concept.kind() == ConceptKind::RelationType {
            for role in self.direct_relates_ids(concept)? {
                self.update_fact(role, |f| &mut f.related_by, |rels| {
                    rels.remove(&id);
                });
            }
        }

        self.graph.delete_vertex(v)?;
        self.emit(ConceptEvent::SchemaConceptDeleted {
            concept: id,
            label: label.clone(),
        });
        info!(%label, "schema.concept.deleted");
        Ok(())
    }
}
