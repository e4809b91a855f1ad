//! Attribute deduplication
//!
//! Duplicates are produced the way they arise in practice: several write
//! transactions are opened before any of them commits, so none sees the
//! attribute the others create.

mod common;

use common::{attribute_type, attributes_with_value, define, define_owner_has, entity_type, in_memory, relation_type, role};
use concept_graph::{attribute_index, AttributeValue, ConceptId, DataType, Deduplicator, KeyspaceIndexPair};
use std::collections::BTreeSet;

fn pair(keyspace: &str, label: &str, value: &str) -> KeyspaceIndexPair {
    KeyspaceIndexPair::new(keyspace, attribute_index(label, &AttributeValue::from(value)))
}

#[test]
fn same_value_inserted_three_times_converges_to_one() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define(&session, |tx| tx.put_attribute_type("test-attribute", DataType::String).map(|_| ()));

    let mut txs: Vec<_> = (0..3).map(|_| session.write()).collect();
    for tx in &mut txs {
        let attribute = attribute_type(tx, "test-attribute");
        tx.put_attribute(&attribute, "test-attribute-value").unwrap();
    }
    for tx in txs {
        tx.commit().unwrap();
    }

    let mut tx = session.read();
    assert_eq!(attributes_with_value(&mut tx, "test-attribute", "test-attribute-value").len(), 3);
    drop(tx);

    let report = Deduplicator::deduplicate(&factory, &pair("dedup", "test-attribute", "test-attribute-value")).unwrap();
    assert_eq!(report.merged, 2);

    let mut tx = session.read();
    assert_eq!(attributes_with_value(&mut tx, "test-attribute", "test-attribute-value").len(), 1);
}

#[test]
fn owners_keep_their_attribute_after_merge() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define_owner_has(&session, "owner", "owned-attribute");

    let mut txs: Vec<_> = (0..3).map(|_| session.write()).collect();
    for tx in &mut txs {
        let owner_type = entity_type(tx, "owner");
        let attribute_type = attribute_type(tx, "owned-attribute");
        let owner = tx.add_entity(&owner_type).unwrap();
        let value = tx.put_attribute(&attribute_type, "owned-attribute-value").unwrap();
        tx.has_attribute(&owner, &value).unwrap();
    }
    for tx in txs {
        tx.commit().unwrap();
    }

    let report = Deduplicator::deduplicate(&factory, &pair("dedup", "owned-attribute", "owned-attribute-value")).unwrap();
    assert_eq!(report.merged, 2);
    assert_eq!(report.redirected_edges, 2);

    let mut tx = session.read();
    let attributes = attributes_with_value(&mut tx, "owned-attribute", "owned-attribute-value");
    assert_eq!(attributes.len(), 1);
    let survivor = attributes[0].clone();

    let owner_type = entity_type(&mut tx, "owner");
    let owners = tx.instances(&owner_type).unwrap();
    assert_eq!(owners.len(), 3);
    for owner in &owners {
        assert_eq!(tx.attributes_of(owner, &[]).unwrap(), vec![survivor.clone()]);
    }
    assert_eq!(tx.owners(&survivor).unwrap().len(), 3);
}

#[test]
fn reified_has_relations_are_redirected() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define_owner_has(&session, "owner", "owned-attribute");

    let mut txs: Vec<_> = (0..3).map(|_| session.write()).collect();
    for tx in &mut txs {
        let owner_type = entity_type(tx, "owner");
        let attribute_type = attribute_type(tx, "owned-attribute");
        let owner = tx.add_entity(&owner_type).unwrap();
        let value = tx.put_attribute(&attribute_type, "owned-attribute-value").unwrap();
        let via = tx.has_attribute_reified(&owner, &value).unwrap();
        assert!(via.is_reified());
    }
    for tx in txs {
        tx.commit().unwrap();
    }

    Deduplicator::deduplicate(&factory, &pair("dedup", "owned-attribute", "owned-attribute-value")).unwrap();

    let mut tx = session.read();
    let attributes = attributes_with_value(&mut tx, "owned-attribute", "owned-attribute-value");
    assert_eq!(attributes.len(), 1);
    let survivor = attributes[0].clone();

    let owner_type = entity_type(&mut tx, "owner");
    let owners = tx.instances(&owner_type).unwrap();
    assert_eq!(owners.len(), 3);
    for owner in &owners {
        assert_eq!(tx.attributes_of(owner, &[]).unwrap(), vec![survivor.clone()]);
    }

    let has = relation_type(&mut tx, "@has-owned-attribute");
    let relations = tx.instances(&has).unwrap();
    assert_eq!(relations.len(), 3);
    let value_role = role(&mut tx, "@has-owned-attribute-value");
    for relation in &relations {
        assert!(relation.is_reified());
        assert_eq!(tx.role_players(relation, &[value_role.clone()]).unwrap(), vec![survivor.clone()]);
    }
}

#[test]
fn attribute_role_players_are_redirected() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define(&session, |tx| {
        let owner = tx.put_relation_type("owner")?;
        let entity_role = tx.put_role("entity-role-player")?;
        let attribute_role = tx.put_role("attribute-role-player")?;
        tx.relates(&owner, &entity_role)?;
        tx.relates(&owner, &attribute_role)?;
        let entity = tx.put_entity_type("owned-entity")?;
        tx.play(&entity, &entity_role, false)?;
        let attribute = tx.put_attribute_type("owned-attribute", DataType::String)?;
        tx.play(&attribute, &attribute_role, false)
    });

    let mut txs: Vec<_> = (0..3).map(|_| session.write()).collect();
    for tx in &mut txs {
        let owner = relation_type(tx, "owner");
        let entity_role = role(tx, "entity-role-player");
        let attribute_role = role(tx, "attribute-role-player");
        let entity_type = entity_type(tx, "owned-entity");
        let attribute_type = attribute_type(tx, "owned-attribute");

        let entity = tx.add_entity(&entity_type).unwrap();
        let value = tx.put_attribute(&attribute_type, "owned-attribute-value").unwrap();
        let relation = tx.add_relation(&owner).unwrap();
        tx.add_role_player(&relation, &entity_role, &entity).unwrap();
        tx.add_role_player(&relation, &attribute_role, &value).unwrap();
    }
    for tx in txs {
        tx.commit().unwrap();
    }

    Deduplicator::deduplicate(&factory, &pair("dedup", "owned-attribute", "owned-attribute-value")).unwrap();

    let mut tx = session.read();
    let attributes = attributes_with_value(&mut tx, "owned-attribute", "owned-attribute-value");
    assert_eq!(attributes.len(), 1);
    let survivor = attributes[0].clone();

    let owner = relation_type(&mut tx, "owner");
    let attribute_role = role(&mut tx, "attribute-role-player");
    let entity_role = role(&mut tx, "entity-role-player");
    let relations = tx.instances(&owner).unwrap();
    assert_eq!(relations.len(), 3);
    let mut entities = BTreeSet::new();
    for relation in &relations {
        assert_eq!(tx.role_players(relation, &[attribute_role.clone()]).unwrap(), vec![survivor.clone()]);
        let players = tx.role_players(relation, &[entity_role.clone()]).unwrap();
        assert_eq!(players.len(), 1);
        entities.insert(players[0].id());
    }
    assert_eq!(entities.len(), 3);
}

#[test]
fn deleted_and_reinserted_attribute_leaves_no_stale_index() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define(&session, |tx| tx.put_attribute_type("test-attribute", DataType::String).map(|_| ()));

    let mut tx = session.write();
    let attribute_type = attribute_type(&mut tx, "test-attribute");
    let first = tx.put_attribute(&attribute_type, "test-attribute-value").unwrap();
    let first_id = first.id();
    tx.delete_thing(&first).unwrap();
    assert!(first.is_deleted());
    assert_eq!(tx.get_attribute(&attribute_type, "test-attribute-value").unwrap(), None);

    let second = tx.put_attribute(&attribute_type, "test-attribute-value").unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(tx.get_attribute(&attribute_type, "test-attribute-value").unwrap(), Some(second.clone()));
    let second_id = second.id();
    let log = tx.commit().unwrap();
    let index = attribute_index("test-attribute", &AttributeValue::from("test-attribute-value"));
    assert_eq!(log.new_attributes.get(&index), Some(&BTreeSet::from([second_id])));

    let mut tx = session.read();
    let attributes = attributes_with_value(&mut tx, "test-attribute", "test-attribute-value");
    assert_eq!(attributes.iter().map(|a| a.id()).collect::<Vec<_>>(), vec![second_id]);
    assert_eq!(tx.get_concept(first_id).unwrap(), None);
}

#[test]
fn rerunning_a_merge_is_a_no_op() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define_owner_has(&session, "owner", "name");

    let mut txs: Vec<_> = (0..2).map(|_| session.write()).collect();
    for tx in &mut txs {
        let owner_type = entity_type(tx, "owner");
        let name = attribute_type(tx, "name");
        let owner = tx.add_entity(&owner_type).unwrap();
        let value = tx.put_attribute(&name, "bob").unwrap();
        tx.has_attribute(&owner, &value).unwrap();
    }
    for tx in txs {
        tx.commit().unwrap();
    }

    let pair = pair("dedup", "name", "bob");
    let first = Deduplicator::deduplicate(&factory, &pair).unwrap();
    assert_eq!(first.merged, 1);
    let second = Deduplicator::deduplicate(&factory, &pair).unwrap();
    assert_eq!(second.merged, 0);
    assert_eq!(second.survivor, first.survivor);
}

#[test]
fn owner_already_linked_to_survivor_collapses_duplicate_edge() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define_owner_has(&session, "owner", "name");

    let mut first = session.write();
    let mut second = session.write();

    let owner_type = entity_type(&mut first, "owner");
    let name = attribute_type(&mut first, "name");
    let owner = first.add_entity(&owner_type).unwrap();
    let value = first.put_attribute(&name, "carol").unwrap();
    first.has_attribute(&owner, &value).unwrap();
    let owner_id = owner.id();
    first.commit().unwrap();

    // The second transaction creates its own "carol" before seeing the first
    let name = attribute_type(&mut second, "name");
    second.put_attribute(&name, "carol").unwrap();
    second.commit().unwrap();

    // Link the same owner to the duplicate too
    let mut third = session.write();
    let name = attribute_type(&mut third, "name");
    let owner = third.get_concept(owner_id).unwrap().unwrap();
    let values = attributes_with_value(&mut third, "name", "carol");
    assert_eq!(values.len(), 2);
    third.has_attribute(&owner, &values[1]).unwrap();
    assert_eq!(third.attributes_of(&owner, &[name]).unwrap().len(), 2);
    third.commit().unwrap();

    let report = Deduplicator::deduplicate(&factory, &pair("dedup", "name", "carol")).unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(report.collapsed_edges, 1);

    let mut tx = session.read();
    let owner = tx.get_concept(owner_id).unwrap().unwrap();
    assert_eq!(tx.attributes_of(&owner, &[]).unwrap().len(), 1);
}

#[test]
fn link_to_merged_duplicate_committed_later_lands_on_survivor() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define_owner_has(&session, "owner", "name");

    let mut a = session.write();
    let mut b = session.write();
    for tx in [&mut a, &mut b] {
        let name = attribute_type(tx, "name");
        tx.put_attribute(&name, "dave").unwrap();
    }
    a.commit().unwrap();
    b.commit().unwrap();

    // Opened while both candidates are still live
    let mut late = session.write();
    let candidates = attributes_with_value(&mut late, "name", "dave");
    assert_eq!(candidates.len(), 2);
    let survivor_id = candidates[0].id();

    let report = Deduplicator::deduplicate(&factory, &pair("dedup", "name", "dave")).unwrap();
    assert_eq!(report.survivor, Some(survivor_id));

    let owner_type = entity_type(&mut late, "owner");
    let owner = late.add_entity(&owner_type).unwrap();
    late.has_attribute(&owner, &candidates[1]).unwrap();
    let owner_id = owner.id();
    late.commit().unwrap();

    let mut tx = session.read();
    let owner = tx.get_concept(owner_id).unwrap().unwrap();
    let attributes = tx.attributes_of(&owner, &[]).unwrap();
    assert_eq!(attributes.iter().map(|a| a.id()).collect::<Vec<_>>(), vec![survivor_id]);
    assert!(matches!(survivor_id, ConceptId::Vertex(_)));
}

#[test]
fn link_committed_during_a_merge_moves_to_survivor() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define_owner_has(&session, "owner", "name");

    let mut a = session.write();
    let mut b = session.write();
    for tx in [&mut a, &mut b] {
        let name = attribute_type(tx, "name");
        tx.put_attribute(&name, "erin").unwrap();
    }
    a.commit().unwrap();
    b.commit().unwrap();

    let mut linker = session.write();
    let candidates = attributes_with_value(&mut linker, "name", "erin");
    assert_eq!(candidates.len(), 2);
    let survivor_id = candidates[0].id();

    // The merge takes its snapshot before the link commits
    let mut merging = session.write();
    let report = Deduplicator::merge(&mut merging, &pair("dedup", "name", "erin")).unwrap();
    assert_eq!(report.merged, 1);

    let owner_type = entity_type(&mut linker, "owner");
    let owner = linker.add_entity(&owner_type).unwrap();
    linker.has_attribute(&owner, &candidates[1]).unwrap();
    let owner_id = owner.id();
    linker.commit().unwrap();

    merging.commit().unwrap();

    let mut tx = session.read();
    assert_eq!(attributes_with_value(&mut tx, "name", "erin").len(), 1);
    let owner = tx.get_concept(owner_id).unwrap().unwrap();
    let attributes = tx.attributes_of(&owner, &[]).unwrap();
    assert_eq!(attributes.iter().map(|a| a.id()).collect::<Vec<_>>(), vec![survivor_id]);
    let survivor = tx.get_concept(survivor_id).unwrap().unwrap();
    assert_eq!(tx.owners(&survivor).unwrap(), vec![owner]);
}

#[test]
fn link_to_survivor_committed_during_a_merge_is_not_doubled() {
    let factory = in_memory();
    let session = factory.session("dedup").unwrap();
    define_owner_has(&session, "owner", "name");

    let mut a = session.write();
    let mut b = session.write();
    for tx in [&mut a, &mut b] {
        let name = attribute_type(tx, "name");
        tx.put_attribute(&name, "finn").unwrap();
    }
    a.commit().unwrap();
    b.commit().unwrap();

    let mut linker = session.write();
    let candidates = attributes_with_value(&mut linker, "name", "finn");
    let owner_type = entity_type(&mut linker, "owner");
    let owner = linker.add_entity(&owner_type).unwrap();
    linker.has_attribute(&owner, &candidates[0]).unwrap();
    linker.has_attribute(&owner, &candidates[1]).unwrap();
    let owner_id = owner.id();

    let mut merging = session.write();
    Deduplicator::merge(&mut merging, &pair("dedup", "name", "finn")).unwrap();
    linker.commit().unwrap();
    merging.commit().unwrap();

    let mut tx = session.read();
    let owner = tx.get_concept(owner_id).unwrap().unwrap();
    assert_eq!(tx.attributes_of(&owner, &[]).unwrap().len(), 1);
    // One has-edge left, not one per former duplicate
    assert_eq!(tx.relations_of(&owner, &[]).unwrap().len(), 1);
}
