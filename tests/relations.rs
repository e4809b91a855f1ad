//! Relations in edge and reified form, identity and deletion

mod common;

use common::{attribute_type, define, define_owner_has, entity_type, in_memory, relation_type, role};
use concept_graph::{ConceptError, ConceptId, ConceptKind, DataType, RelationStructure, TransactionError};
use std::collections::BTreeSet;

fn define_marriage(session: &concept_graph::Session) {
    define(session, |tx| {
        let person = tx.put_entity_type("person")?;
        let marriage = tx.put_relation_type("marriage")?;
        let husband = tx.put_role("husband")?;
        let wife = tx.put_role("wife")?;
        tx.relates(&marriage, &husband)?;
        tx.relates(&marriage, &wife)?;
        tx.play(&person, &husband, false)?;
        tx.play(&person, &wife, false)
    });
}

#[test]
fn concepts_are_identity_mapped() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let alice = tx.add_entity(&person).unwrap();
    let again = tx.get_concept(alice.id()).unwrap().unwrap();
    assert!(again.same_object(&alice));
    let by_label = entity_type(&mut tx, "person");
    assert!(by_label.same_object(&person));

    let instances = tx.instances(&person).unwrap();
    assert!(instances[0].same_object(&alice));
}

#[test]
fn has_relation_starts_as_an_edge() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let alice = tx.add_entity(&person).unwrap();
    let value = tx.put_attribute(&name, "alice").unwrap();
    let relation = tx.has_attribute(&alice, &value).unwrap();

    assert_eq!(relation.kind(), ConceptKind::Relation);
    assert!(matches!(relation.id(), ConceptId::Edge(_)));
    assert!(matches!(relation.structure(), Some(RelationStructure::Edge(_))));
    assert!(!relation.is_reified());

    // Linking twice returns the same relation
    let again = tx.has_attribute(&alice, &value).unwrap();
    assert!(again.same_object(&relation));
}

#[test]
fn reify_is_idempotent_and_keeps_the_id() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let alice = tx.add_entity(&person).unwrap();
    let value = tx.put_attribute(&name, "alice").unwrap();
    let relation = tx.has_attribute(&alice, &value).unwrap();
    let id = relation.id();

    tx.reify(&relation).unwrap();
    let first = match relation.structure() {
        Some(RelationStructure::Reified(reified)) => reified.vertex_id(),
        other => panic!("expected reified relation, got {:?}", other),
    };
    tx.reify(&relation).unwrap();
    let second = match relation.structure() {
        Some(RelationStructure::Reified(reified)) => reified.vertex_id(),
        other => panic!("expected reified relation, got {:?}", other),
    };
    assert_eq!(first, second);
    assert_eq!(relation.id(), id);
    assert!(tx.get_concept(id).unwrap().unwrap().same_object(&relation));

    let has = relation_type(&mut tx, "@has-name");
    assert_eq!(tx.instances(&has).unwrap(), vec![relation.clone()]);
}

#[test]
fn edge_and_reified_forms_expose_the_same_type_and_players() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let alice = tx.add_entity(&person).unwrap();
    let bob = tx.add_entity(&person).unwrap();
    let alice_name = tx.put_attribute(&name, "alice").unwrap();
    let bob_name = tx.put_attribute(&name, "bob").unwrap();

    let edge = tx.has_attribute(&alice, &alice_name).unwrap();
    let reified = tx.has_attribute_reified(&bob, &bob_name).unwrap();

    let edge_type = tx.thing_type(&edge).unwrap();
    let reified_type = tx.thing_type(&reified).unwrap();
    assert_eq!(edge_type, reified_type);

    let edge_roles: BTreeSet<_> = tx.role_player_map(&edge).unwrap().into_keys().collect();
    let reified_roles: BTreeSet<_> = tx.role_player_map(&reified).unwrap().into_keys().collect();
    assert_eq!(edge_roles, reified_roles);
    assert_eq!(tx.role_players(&edge, &[]).unwrap(), vec![alice.clone(), alice_name.clone()]);
    assert_eq!(tx.role_players(&reified, &[]).unwrap(), vec![bob.clone(), bob_name.clone()]);

    tx.commit().unwrap();

    // Both forms survive the commit with their ids
    let mut tx = session.read();
    let alice = tx.get_concept(alice.id()).unwrap().unwrap();
    let bob = tx.get_concept(bob.id()).unwrap().unwrap();
    assert_eq!(tx.attributes_of(&alice, &[]).unwrap().len(), 1);
    assert_eq!(tx.attributes_of(&bob, &[]).unwrap().len(), 1);
    let edge = tx.get_concept(edge.id()).unwrap().unwrap();
    let reified = tx.get_concept(reified.id()).unwrap().unwrap();
    assert!(!edge.is_reified());
    assert!(reified.is_reified());
}

#[test]
fn third_role_player_reifies_the_relation() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let owner_role = role(&mut tx, "@has-name-owner");
    let alice = tx.add_entity(&person).unwrap();
    let carol = tx.add_entity(&person).unwrap();
    let value = tx.put_attribute(&name, "shared").unwrap();
    let relation = tx.has_attribute(&alice, &value).unwrap();

    tx.add_role_player(&relation, &owner_role, &carol).unwrap();
    assert!(relation.is_reified());
    let owners = tx.role_players(&relation, &[owner_role.clone()]).unwrap();
    assert_eq!(owners, vec![alice, carol]);
}

#[test]
fn castings_list_every_role_player() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_marriage(&session);

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let marriage = relation_type(&mut tx, "marriage");
    let husband = role(&mut tx, "husband");
    let wife = role(&mut tx, "wife");
    let bob = tx.add_entity(&person).unwrap();
    let alice = tx.add_entity(&person).unwrap();
    let m = tx.add_relation(&marriage).unwrap();
    tx.add_role_player(&m, &husband, &bob).unwrap();
    tx.add_role_player(&m, &wife, &alice).unwrap();
    // Adding the same casting twice is a no-op
    tx.add_role_player(&m, &wife, &alice).unwrap();

    let castings = tx.castings(&m).unwrap();
    assert_eq!(castings.len(), 2);
    assert_eq!(tx.role_players(&m, &[wife.clone()]).unwrap(), vec![alice.clone()]);
    assert_eq!(tx.relations_of(&alice, &[wife.clone()]).unwrap(), vec![m.clone()]);
    assert_eq!(tx.roles_played(&bob).unwrap(), vec![husband.clone()]);
    tx.commit().unwrap();

    let mut tx = session.read();
    let m = tx.get_concept(m.id()).unwrap().unwrap();
    let map = tx.role_player_map(&m).unwrap();
    assert_eq!(map.len(), 2);
}

#[test]
fn deleting_the_last_role_player_deletes_the_relation() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_marriage(&session);

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let marriage = relation_type(&mut tx, "marriage");
    let husband = role(&mut tx, "husband");
    let wife = role(&mut tx, "wife");
    let bob = tx.add_entity(&person).unwrap();
    let alice = tx.add_entity(&person).unwrap();
    let m = tx.add_relation(&marriage).unwrap();
    tx.add_role_player(&m, &husband, &bob).unwrap();
    tx.add_role_player(&m, &wife, &alice).unwrap();

    tx.delete_thing(&bob).unwrap();
    assert!(!m.is_deleted());
    assert_eq!(tx.role_players(&m, &[]).unwrap(), vec![alice.clone()]);

    tx.remove_role_player(&m, &wife, &alice).unwrap();
    assert!(m.is_deleted());
    assert_eq!(tx.instances(&marriage).unwrap(), vec![]);
    assert_eq!(tx.get_concept(m.id()).unwrap(), None);
}

#[test]
fn deleting_an_owner_deletes_its_implicit_relations() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let alice = tx.add_entity(&person).unwrap();
    let bob = tx.add_entity(&person).unwrap();
    let alice_name = tx.put_attribute(&name, "alice").unwrap();
    let bob_name = tx.put_attribute(&name, "bob").unwrap();
    let edge = tx.has_attribute(&alice, &alice_name).unwrap();
    let reified = tx.has_attribute_reified(&bob, &bob_name).unwrap();

    tx.delete_thing(&alice).unwrap();
    tx.delete_thing(&bob).unwrap();
    assert!(edge.is_deleted());
    assert!(reified.is_deleted());

    // Attributes outlive their owners
    assert!(!alice_name.is_deleted());
    assert_eq!(tx.owners(&bob_name).unwrap(), vec![]);
    let has = relation_type(&mut tx, "@has-name");
    assert_eq!(tx.instances(&has).unwrap(), vec![]);
}

#[test]
fn unhas_removes_both_forms() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let alice = tx.add_entity(&person).unwrap();
    let value = tx.put_attribute(&name, "alice").unwrap();
    tx.has_attribute_reified(&alice, &value).unwrap();
    assert_eq!(tx.attributes_of(&alice, &[name.clone()]).unwrap(), vec![value.clone()]);

    tx.unhas_attribute(&alice, &value).unwrap();
    assert_eq!(tx.attributes_of(&alice, &[]).unwrap(), vec![]);
}

#[test]
fn attribute_not_allowed_for_owner_type() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define(&session, |tx| {
        tx.put_entity_type("car")?;
        tx.put_attribute_type("colour", DataType::String)?;
        Ok(())
    });

    let mut tx = session.write();
    let car = entity_type(&mut tx, "car");
    let colour = attribute_type(&mut tx, "colour");
    let c = tx.add_entity(&car).unwrap();
    let red = tx.put_attribute(&colour, "red").unwrap();
    let err = tx.has_attribute(&c, &red).unwrap_err();
    assert!(matches!(err, ConceptError::Transaction(TransactionError::HasNotAllowed { .. })));
}

#[test]
fn concepts_from_a_closed_transaction_are_rejected() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut first = session.write();
    let person = entity_type(&mut first, "person");
    first.rollback();

    let mut second = session.write();
    let err = second.add_entity(&person).unwrap_err();
    assert!(matches!(err, ConceptError::Transaction(TransactionError::ForeignConcept(_))));
}

#[test]
fn inferred_flag_is_recorded() {
    let factory = in_memory();
    let session = factory.session("relations").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let asserted = tx.add_entity(&person).unwrap();
    let inferred = tx.add_entity_inferred(&person).unwrap();
    let value = tx.put_attribute(&name, "x").unwrap();
    let link = tx.has_attribute_inferred(&asserted, &value).unwrap();

    assert!(!tx.is_inferred(&asserted).unwrap());
    assert!(tx.is_inferred(&inferred).unwrap());
    assert!(tx.is_inferred(&link).unwrap());
    tx.reify(&link).unwrap();
    assert!(tx.is_inferred(&link).unwrap());
}
