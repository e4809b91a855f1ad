//! Keyspaces persisted in SQLite survive reopening the factory

mod common;

use common::{attribute_type, define, define_owner_has, entity_type};
use concept_graph::{AttributeValue, Config, DataType, SessionFactory};
use std::path::Path;

fn open(path: &Path) -> SessionFactory {
    let mut config = Config::default();
    config.storage.path = Some(path.to_path_buf());
    SessionFactory::new(config).unwrap()
}

#[test]
fn schema_and_data_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concepts.db");

    let (person_id, alice_id) = {
        let factory = open(&path);
        let session = factory.session("people").unwrap();
        define_owner_has(&session, "person", "name");

        let mut tx = session.write();
        let person = entity_type(&mut tx, "person");
        let name = attribute_type(&mut tx, "name");
        let alice = tx.add_entity(&person).unwrap();
        let alice_name = tx.put_attribute(&name, "alice").unwrap();
        tx.has_attribute(&alice, &alice_name).unwrap();
        tx.commit().unwrap();
        (person.id(), alice.id())
    };

    let factory = open(&path);
    let session = factory.session("people").unwrap();
    let mut tx = session.read();
    let person = entity_type(&mut tx, "person");
    assert_eq!(person.id(), person_id);

    let instances = tx.instances(&person).unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id(), alice_id);

    let attributes = tx.attributes_of(&instances[0], &[]).unwrap();
    assert_eq!(attributes.len(), 1);
    assert_eq!(tx.value(&attributes[0]).unwrap(), AttributeValue::String("alice".into()));
    let name = attribute_type(&mut tx, "name");
    assert_eq!(tx.attribute_types_of(&person).unwrap(), vec![name]);
}

#[test]
fn ids_and_label_ids_continue_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concepts.db");

    let (first, first_label_id) = {
        let factory = open(&path);
        let session = factory.session("ids").unwrap();
        define(&session, |tx| tx.put_entity_type("person").map(|_| ()));
        let mut tx = session.read();
        let person = entity_type(&mut tx, "person");
        let label_id = tx.label_id(&person).unwrap();
        (person.id(), label_id)
    };

    let factory = open(&path);
    let session = factory.session("ids").unwrap();
    define(&session, |tx| tx.put_entity_type("company").map(|_| ()));
    let mut tx = session.read();
    let company = entity_type(&mut tx, "company");
    assert!(company.id() > first);
    assert!(tx.label_id(&company).unwrap() > first_label_id);
}

#[test]
fn attribute_uniqueness_holds_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concepts.db");

    let first = {
        let factory = open(&path);
        let session = factory.session("attrs").unwrap();
        define(&session, |tx| tx.put_attribute_type("age", DataType::Long).map(|_| ()));
        let mut tx = session.write();
        let age = attribute_type(&mut tx, "age");
        let forty = tx.put_attribute(&age, 40i64).unwrap();
        tx.commit().unwrap();
        forty.id()
    };

    let factory = open(&path);
    let session = factory.session("attrs").unwrap();
    let mut tx = session.write();
    let age = attribute_type(&mut tx, "age");
    assert_eq!(tx.put_attribute(&age, 40i64).unwrap().id(), first);
}

#[test]
fn keyspaces_are_listed_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("concepts.db");

    {
        let factory = open(&path);
        define(&factory.session("alpha").unwrap(), |tx| tx.put_entity_type("a").map(|_| ()));
        define(&factory.session("beta").unwrap(), |tx| tx.put_entity_type("b").map(|_| ()));
    }

    let factory = open(&path);
    assert_eq!(factory.list_keyspaces().unwrap(), vec!["alpha".to_string(), "beta".to_string()]);
    assert!(factory.delete_keyspace("alpha").unwrap());
    assert!(!factory.delete_keyspace("alpha").unwrap());
    assert_eq!(factory.list_keyspaces().unwrap(), vec!["beta".to_string()]);

    // Reopening a deleted keyspace starts from the meta schema again
    let session = factory.session("alpha").unwrap();
    let mut tx = session.read();
    assert!(tx.get_entity_type("a").unwrap().is_none());
    assert!(tx.get_schema_concept("entity").unwrap().is_some());
}
