//! Schema definition: put semantics, hierarchy, plays/relates, has/key

mod common;

use common::{attribute_type, define, define_owner_has, entity_type, in_memory, relation_type, role};
use concept_graph::{AttributeValue, ConceptError, ConceptKind, DataType, TransactionError};

fn transaction_error(err: ConceptError) -> TransactionError {
    match err {
        ConceptError::Transaction(e) => e,
        other => panic!("expected a transaction error, got {:?}", other),
    }
}

#[test]
fn meta_schema_is_bootstrapped() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.read();
    for label in ["thing", "entity", "relation", "attribute", "role", "rule"] {
        assert!(tx.get_schema_concept(label).unwrap().is_some(), "missing meta concept {}", label);
    }
    let entity = tx.get_schema_concept("entity").unwrap().unwrap();
    let thing = tx.get_schema_concept("thing").unwrap().unwrap();
    assert_eq!(tx.sup(&entity).unwrap(), Some(thing));
    assert!(tx.is_abstract(&entity).unwrap());
}

#[test]
fn meta_types_are_immutable() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let entity = tx.get_schema_concept("entity").unwrap().unwrap();
    let role = tx.put_role("r").unwrap();

    let err = transaction_error(tx.play(&entity, &role, false).unwrap_err());
    assert!(matches!(err, TransactionError::MetaTypeImmutable(_)));
    let err = transaction_error(tx.add_entity(&entity).unwrap_err());
    assert!(matches!(err, TransactionError::AbstractInstantiation(_) | TransactionError::MetaTypeImmutable(_)));
}

#[test]
fn put_finds_existing_concepts() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let first = tx.put_entity_type("person").unwrap();
    let second = tx.put_entity_type("person").unwrap();
    assert!(first.same_object(&second));

    let err = transaction_error(tx.put_relation_type("person").unwrap_err());
    assert!(matches!(err, TransactionError::LabelTaken { .. }));
}

#[test]
fn reserved_labels_are_rejected() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let err = transaction_error(tx.put_entity_type("@has-name").unwrap_err());
    assert!(matches!(err, TransactionError::ReservedLabel(_)));
}

#[test]
fn attribute_type_data_type_is_fixed() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let age = tx.put_attribute_type("age", DataType::Long).unwrap();
    assert_eq!(tx.data_type(&age).unwrap(), Some(DataType::Long));
    let err = transaction_error(tx.put_attribute_type("age", DataType::String).unwrap_err());
    assert!(matches!(err, TransactionError::DataTypeMismatch { .. }));

    let err = transaction_error(tx.put_attribute(&age, "forty").unwrap_err());
    assert!(matches!(err, TransactionError::InvalidValue { .. }));
    let forty = tx.put_attribute(&age, 40i64).unwrap();
    assert_eq!(tx.value(&forty).unwrap(), AttributeValue::Long(40));
}

#[test]
fn hierarchy_queries_walk_sups_and_subs() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let animal = tx.put_entity_type("animal").unwrap();
    let dog = tx.put_entity_type("dog").unwrap();
    let puppy = tx.put_entity_type("puppy").unwrap();
    tx.set_sup(&dog, &animal).unwrap();
    tx.set_sup(&puppy, &dog).unwrap();

    let entity = tx.get_schema_concept("entity").unwrap().unwrap();
    let thing = tx.get_schema_concept("thing").unwrap().unwrap();
    assert_eq!(tx.sups(&puppy).unwrap(), vec![puppy.clone(), dog.clone(), animal.clone(), entity, thing]);
    assert_eq!(tx.subs(&animal).unwrap(), vec![animal.clone(), dog.clone(), puppy.clone()]);

    let p = tx.add_entity(&puppy).unwrap();
    assert_eq!(tx.instances(&animal).unwrap(), vec![p]);
}

#[test]
fn sup_loops_are_rejected() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let a = tx.put_entity_type("a").unwrap();
    let b = tx.put_entity_type("b").unwrap();
    tx.set_sup(&b, &a).unwrap();
    let err = transaction_error(tx.set_sup(&a, &b).unwrap_err());
    assert!(matches!(err, TransactionError::SupLoop { .. }));
    let err = transaction_error(tx.set_sup(&a, &a).unwrap_err());
    assert!(matches!(err, TransactionError::SupLoop { .. }));
}

#[test]
fn sup_must_be_the_same_kind() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let person = tx.put_entity_type("person").unwrap();
    let name = tx.put_attribute_type("name", DataType::String).unwrap();
    assert!(tx.set_sup(&person, &name).is_err());
}

#[test]
fn changing_sup_cannot_disconnect_a_role_in_use() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    define(&session, |tx| {
        let person = tx.put_entity_type("person")?;
        let student = tx.put_entity_type("student")?;
        tx.put_entity_type("other")?;
        tx.set_sup(&student, &person)?;
        let enrolment = tx.put_relation_type("enrolment")?;
        let member = tx.put_role("member")?;
        tx.relates(&enrolment, &member)?;
        tx.play(&person, &member, false)?;
        let s = tx.add_entity(&student)?;
        let e = tx.add_relation(&enrolment)?;
        tx.add_role_player(&e, &member, &s)
    });

    let mut tx = session.write();
    let student = entity_type(&mut tx, "student");
    let other = entity_type(&mut tx, "other");
    let err = transaction_error(tx.set_sup(&student, &other).unwrap_err());
    assert!(matches!(err, TransactionError::ChangingSuperDisconnectsRole { .. }));
}

#[test]
fn play_updates_both_sides() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let person = tx.put_entity_type("person").unwrap();
    let friendship = tx.put_relation_type("friendship").unwrap();
    let friend = tx.put_role("friend").unwrap();
    tx.relates(&friendship, &friend).unwrap();

    // Warm both caches before mutating
    assert!(tx.playing(&person).unwrap().is_empty());
    assert!(tx.players(&friend).unwrap().is_empty());
    tx.play(&person, &friend, false).unwrap();
    assert_eq!(tx.playing(&person).unwrap(), vec![friend.clone()]);
    assert_eq!(tx.players(&friend).unwrap(), vec![person.clone()]);
    assert_eq!(tx.roles_of(&friendship).unwrap(), vec![friend.clone()]);
    assert_eq!(tx.relation_types_of(&friend).unwrap(), vec![friendship.clone()]);

    tx.unplay(&person, &friend).unwrap();
    assert!(tx.playing(&person).unwrap().is_empty());
    assert!(tx.players(&friend).unwrap().is_empty());
    tx.unrelate(&friendship, &friend).unwrap();
    assert!(tx.roles_of(&friendship).unwrap().is_empty());
}

#[test]
fn has_synthesizes_implicit_types() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.read();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let has = relation_type(&mut tx, "@has-name");
    let owner = role(&mut tx, "@has-name-owner");
    let value = role(&mut tx, "@has-name-value");

    assert!(tx.is_implicit(&has).unwrap());
    assert_eq!(tx.roles_of(&has).unwrap(), vec![owner.clone(), value.clone()]);
    assert!(tx.playing(&person).unwrap().contains(&owner));
    assert!(tx.playing(&name).unwrap().contains(&value));
    assert_eq!(tx.attribute_types_of(&person).unwrap(), vec![name.clone()]);
    assert!(tx.keys_of(&person).unwrap().is_empty());

    // The implicit types mirror the attribute hierarchy up to the meta type
    let has_attribute = relation_type(&mut tx, "@has-attribute");
    assert_eq!(tx.sup(&has).unwrap(), Some(has_attribute));
}

#[test]
fn sub_attribute_mirrors_its_sup() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let person = tx.put_entity_type("person").unwrap();
    let name = tx.put_attribute_type("name", DataType::String).unwrap();
    let nickname = tx.put_attribute_type("nickname", DataType::String).unwrap();
    tx.set_sup(&nickname, &name).unwrap();
    tx.has(&person, &nickname).unwrap();

    let has_nickname = relation_type(&mut tx, "@has-nickname");
    let has_name = relation_type(&mut tx, "@has-name");
    assert_eq!(tx.sup(&has_nickname).unwrap(), Some(has_name));
    let owner = role(&mut tx, "@has-nickname-owner");
    let owner_sup = role(&mut tx, "@has-name-owner");
    assert_eq!(tx.sup(&owner).unwrap(), Some(owner_sup));
}

#[test]
fn has_and_key_cannot_overlap() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let person = tx.put_entity_type("person").unwrap();
    let email = tx.put_attribute_type("email", DataType::String).unwrap();
    tx.key(&person, &email).unwrap();
    assert_eq!(tx.keys_of(&person).unwrap(), vec![email.clone()]);

    let err = transaction_error(tx.has(&person, &email).unwrap_err());
    assert!(matches!(err, TransactionError::HasKeyOverlap { .. }));
}

#[test]
fn key_is_required_at_commit() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    define(&session, |tx| {
        let person = tx.put_entity_type("person")?;
        let email = tx.put_attribute_type("email", DataType::String)?;
        tx.key(&person, &email)
    });

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    tx.add_entity(&person).unwrap();
    let err = tx.commit().unwrap_err();
    match err {
        ConceptError::InvalidKb { errors } => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("@key-email-owner"));
        }
        other => panic!("expected InvalidKb, got {:?}", other),
    }

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let email = attribute_type(&mut tx, "email");
    let p = tx.add_entity(&person).unwrap();
    let address = tx.put_attribute(&email, "p@example.com").unwrap();
    tx.has_attribute(&p, &address).unwrap();
    tx.commit().unwrap();
}

#[test]
fn unhas_rejected_while_instances_own_the_attribute() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    define_owner_has(&session, "person", "name");

    let mut tx = session.write();
    let person = entity_type(&mut tx, "person");
    let name = attribute_type(&mut tx, "name");
    let p = tx.add_entity(&person).unwrap();
    let value = tx.put_attribute(&name, "pat").unwrap();
    tx.has_attribute(&p, &value).unwrap();

    let err = transaction_error(tx.unhas(&person, &name).unwrap_err());
    assert!(matches!(err, TransactionError::IllegalUnhas { .. }));

    tx.delete_thing(&p).unwrap();
    tx.unhas(&person, &name).unwrap();
    assert!(tx.attribute_types_of(&person).unwrap().is_empty());
    // Nobody owns names any more, so the implicit types go too
    assert_eq!(tx.get_relation_type("@has-name").unwrap(), None);
}

#[test]
fn regex_constrains_string_attributes() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let code = tx.put_attribute_type("code", DataType::String).unwrap();
    tx.put_attribute(&code, "ABC").unwrap();

    let err = transaction_error(tx.set_regex(&code, Some("[a-z]+")).unwrap_err());
    assert!(matches!(err, TransactionError::RegexViolation { .. }));

    tx.set_regex(&code, Some("[A-Z]+")).unwrap();
    assert_eq!(tx.regex(&code).unwrap().as_deref(), Some("[A-Z]+"));
    let err = transaction_error(tx.put_attribute(&code, "abc").unwrap_err());
    assert!(matches!(err, TransactionError::RegexViolation { .. }));
    tx.put_attribute(&code, "XYZ").unwrap();

    tx.set_regex(&code, None).unwrap();
    tx.put_attribute(&code, "abc").unwrap();
}

#[test]
fn abstract_types_cannot_be_instantiated() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let shape = tx.put_entity_type("shape").unwrap();
    tx.set_abstract(&shape, true).unwrap();
    let err = transaction_error(tx.add_entity(&shape).unwrap_err());
    assert!(matches!(err, TransactionError::AbstractInstantiation(_)));
}

#[test]
fn schema_deletion_requires_no_subs_or_instances() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let animal = tx.put_entity_type("animal").unwrap();
    let dog = tx.put_entity_type("dog").unwrap();
    tx.set_sup(&dog, &animal).unwrap();

    let err = transaction_error(tx.delete_schema_concept(&animal).unwrap_err());
    assert!(matches!(err, TransactionError::DeletionNotAllowed { .. }));

    let rex = tx.add_entity(&dog).unwrap();
    let err = transaction_error(tx.delete_schema_concept(&dog).unwrap_err());
    assert!(matches!(err, TransactionError::DeletionNotAllowed { .. }));

    tx.delete_thing(&rex).unwrap();
    tx.delete_schema_concept(&dog).unwrap();
    assert!(dog.is_deleted());
    assert_eq!(tx.get_entity_type("dog").unwrap(), None);
    tx.delete_schema_concept(&animal).unwrap();
}

#[test]
fn labels_can_change() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    define(&session, |tx| tx.put_entity_type("persn").map(|_| ()));

    let mut tx = session.write();
    let person = entity_type(&mut tx, "persn");
    let label_id = tx.label_id(&person).unwrap();
    tx.set_label(&person, "person").unwrap();
    assert_eq!(tx.get_entity_type("persn").unwrap(), None);
    assert!(tx.get_entity_type("person").unwrap().unwrap().same_object(&person));
    tx.commit().unwrap();

    let mut tx = session.read();
    let person = entity_type(&mut tx, "person");
    assert_eq!(tx.label_id(&person).unwrap(), label_id);
    assert_eq!(tx.get_schema_concept_by_label_id(label_id).unwrap(), Some(person));
}

#[test]
fn rules_carry_their_patterns() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.write();
    let rule = tx
        .put_rule("transitive-location", "{(located: $x, locating: $y) isa location;}", "{$x isa place;}")
        .unwrap();
    assert_eq!(rule.kind(), ConceptKind::Rule);
    assert_eq!(
        tx.rule_when(&rule).unwrap().as_deref(),
        Some("{(located: $x, locating: $y) isa location;}")
    );
    assert_eq!(tx.rule_then(&rule).unwrap().as_deref(), Some("{$x isa place;}"));
}

#[test]
fn read_transactions_reject_writes() {
    let factory = in_memory();
    let session = factory.session("schema").unwrap();
    let mut tx = session.read();
    let err = transaction_error(tx.put_entity_type("person").unwrap_err());
    assert_eq!(err, TransactionError::ReadOnly);
}
