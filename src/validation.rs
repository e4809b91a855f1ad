//! Structural checks run over a write transaction before it commits
//!
//! Every violation is collected; the caller aborts the commit if any are
//! found. Only concepts the transaction touched are inspected.

use crate::concept::{Concept, ConceptId, ConceptKind, ConceptManager};
use crate::error::ConceptResult;
use std::collections::BTreeSet;
use tracing::debug;

/// Violations found in the concepts this transaction touched, sorted
pub fn validate(manager: &mut ConceptManager) -> ConceptResult<Vec<String>> {
    let mut errors = BTreeSet::new();

    let schema: Vec<ConceptId> = manager.cache.tracked_schema.iter().copied().collect();
    for concept in live(manager, schema)? {
        validate_schema_concept(manager, &concept, &mut errors)?;
    }

    let relations: Vec<ConceptId> = manager.cache.tracked_relations.iter().copied().collect();
    for relation in live(manager, relations)? {
        if relation.kind() == ConceptKind::Relation {
            validate_castings(manager, &relation, &mut errors)?;
        }
    }

    let things: Vec<ConceptId> = manager.cache.tracked_things.iter().copied().collect();
    for thing in live(manager, things)? {
        if thing.kind().is_thing() {
            validate_required_roles(manager, &thing, &mut errors)?;
        }
    }

    if !errors.is_empty() {
        debug!(tx = %manager.transaction_id(), count = errors.len(), "validation.failed");
    }
    Ok(errors.into_iter().collect())
}

fn live(manager: &mut ConceptManager, ids: Vec<ConceptId>) -> ConceptResult<Vec<Concept>> {
    let mut concepts = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(concept) = manager.get_concept(id)? {
            concepts.push(concept);
        }
    }
    Ok(concepts)
}

fn validate_schema_concept(manager: &mut ConceptManager, concept: &Concept, errors: &mut BTreeSet<String>) -> ConceptResult<()> {
    if manager.is_meta(concept)? {
        return Ok(());
    }
    let label = manager.label(concept)?;
    match concept.kind() {
        ConceptKind::Role => {
            if manager.relation_types_of(concept)?.is_empty() {
                errors.insert(format!("role '{}' is not related by any relation type", label));
            }
        }
        ConceptKind::RelationType => {
            if !manager.is_abstract(concept)? {
                let mut relates_any = false;
                for sup in manager.sups(concept)? {
                    if sup.kind() != ConceptKind::RelationType {
                        continue;
                    }
                    if !manager.roles_of(&sup)?.is_empty() {
                        relates_any = true;
                        break;
                    }
                }
                if !relates_any {
                    errors.insert(format!("relation type '{}' does not relate any role", label));
                }
            }
        }
        _ => {}
    }
    if concept.kind().is_type() && manager.is_abstract(concept)? && manager.has_direct_instances(concept)? {
        errors.insert(format!("abstract type '{}' has instances", label));
    }
    Ok(())
}

/// Each casting's player must be able to play the role, and the relation's
/// type must relate it
fn validate_castings(manager: &mut ConceptManager, relation: &Concept, errors: &mut BTreeSet<String>) -> ConceptResult<()> {
    let relation_type = manager.thing_type(relation)?;
    let relation_label = manager.label(&relation_type)?;
    let mut related = BTreeSet::new();
    // The chain ends at `thing`, which relates nothing
    for sup in manager.sups(&relation_type)? {
        if sup.kind() == ConceptKind::RelationType {
            related.extend(manager.roles_of(&sup)?);
        }
    }

    for casting in manager.castings(relation)? {
        let role_label = manager.label(&casting.role)?;
        let player_type = manager.thing_type(&casting.player)?;
        if !manager.playing(&player_type)?.contains(&casting.role) {
            let player_label = manager.label(&player_type)?;
            errors.insert(format!(
                "'{}' is not allowed to play role '{}' in a '{}' relation",
                player_label, role_label, relation_label
            ));
        }
        if !related.contains(&casting.role) {
            errors.insert(format!(
                "role '{}' is not related by relation type '{}'",
                role_label, relation_label
            ));
        }
    }
    Ok(())
}

/// A required role (a key) must be played by the thing in exactly one relation
fn validate_required_roles(manager: &mut ConceptManager, thing: &Concept, errors: &mut BTreeSet<String>) -> ConceptResult<()> {
    let thing_type = manager.thing_type(thing)?;
    let mut required = BTreeSet::new();
    for sup in manager.sups(&thing_type)? {
        for (role, is_required) in manager.direct_plays(&sup)? {
            if is_required {
                required.insert(role);
            }
        }
    }
    for role in required {
        let count = manager.count_relations_playing(thing, &role)?;
        if count != 1 {
            let type_label = manager.label(&thing_type)?;
            let role_label = manager.label(&role)?;
            errors.insert(format!(
                "'{}' of type '{}' plays required role '{}' {} times, expected exactly once",
                thing.id(),
                type_label,
                role_label,
                count
            ));
        }
    }
    Ok(())
}
