//! Shared helpers for the integration tests
//!
//! Keyspaces are in memory unless a test opens a SQLite file explicitly.

#![allow(dead_code)]

use concept_graph::{
    AttributeValue, Concept, ConceptResult, Config, DataType, Session, SessionFactory, Transaction,
};

pub fn in_memory() -> SessionFactory {
    SessionFactory::in_memory(Config::default())
}

/// Factory whose types start a new shard every `threshold` instances
pub fn with_sharding_threshold(threshold: u64) -> SessionFactory {
    SessionFactory::in_memory(Config {
        sharding_threshold: threshold,
        ..Config::default()
    })
}

/// Run `define` in a write transaction and commit it
pub fn define(session: &Session, define: impl FnOnce(&mut Transaction) -> ConceptResult<()>) {
    let mut tx = session.write();
    define(&mut tx).unwrap();
    tx.commit().unwrap();
}

/// `owner` entity type that has a string attribute type `attribute`
pub fn define_owner_has(session: &Session, owner: &str, attribute: &str) {
    define(session, |tx| {
        let owner = tx.put_entity_type(owner)?;
        let attribute = tx.put_attribute_type(attribute, DataType::String)?;
        tx.has(&owner, &attribute)
    });
}

pub fn entity_type(tx: &mut Transaction, label: &str) -> Concept {
    tx.get_entity_type(label).unwrap().unwrap()
}

pub fn attribute_type(tx: &mut Transaction, label: &str) -> Concept {
    tx.get_attribute_type(label).unwrap().unwrap()
}

pub fn relation_type(tx: &mut Transaction, label: &str) -> Concept {
    tx.get_relation_type(label).unwrap().unwrap()
}

pub fn role(tx: &mut Transaction, label: &str) -> Concept {
    tx.get_role(label).unwrap().unwrap()
}

/// Every attribute of the type holding `value`, in id order
pub fn attributes_with_value(tx: &mut Transaction, label: &str, value: impl Into<AttributeValue>) -> Vec<Concept> {
    let value = value.into();
    let attribute_type = attribute_type(tx, label);
    let mut found = Vec::new();
    for attribute in tx.instances(&attribute_type).unwrap() {
        if tx.value(&attribute).unwrap() == value {
            found.push(attribute);
        }
    }
    found.sort();
    found
}
