//! Dirty checking and optimistic locking against committed rows.

use hibernia_codec::{Identifier, Value};
use hibernia_core::{ActionKind, CoreError, PropertyValue};
use hibernia_testkit::prelude::*;

fn seeded() -> InMemoryBackend {
    let backend = InMemoryBackend::new();
    seed_owner(&backend, 1, "Ged", &["Sparrowhawk"]);
    seed_pet(&backend, 10, "otak", Some(1));
    backend
}

#[test]
fn unchanged_entities_flush_nothing() {
    let factory = factory(catalog_metamodel(), seeded());
    let mut session = factory.open_session().unwrap();
    let owner = session.find("Owner", 1).unwrap().unwrap();
    let pet = session.find("Pet", 10).unwrap().unwrap();
    let nicknames = session.get(owner, "nicknames").unwrap().as_collection().unwrap();
    assert_eq!(session.elements(nicknames).unwrap().len(), 1);

    let summary = session.flush().unwrap();
    assert!(summary.is_empty(), "{summary:?}");
    assert_eq!(factory.statistics().entity_updates(), 0);
    assert!(session.contains(pet));
}

#[test]
fn one_scalar_change_updates_one_property() {
    let backend = seeded();
    let factory = factory(catalog_metamodel(), backend.clone());
    let mut session = factory.open_session().unwrap();
    let owner = session.find("Owner", 1).unwrap().unwrap();
    session.set(owner, "name", "Ogion").unwrap();

    let summary = session.commit().unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary.count(ActionKind::EntityUpdate), 1);
    assert_eq!(summary.executed[0].properties, ["name"]);

    let row = backend.row("Owner", &Identifier::from(1)).unwrap();
    assert_eq!(row.version, Some(Value::Integer(1)));
    assert_eq!(
        row.column("name"),
        Some(&hibernia_storage::ColumnValue::Basic(Value::from("Ogion")))
    );
    // the snapshot was refreshed, so a second flush is clean
    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn setting_the_same_value_is_not_a_change() {
    let factory = factory(catalog_metamodel(), seeded());
    let mut session = factory.open_session().unwrap();
    let owner = session.find("Owner", 1).unwrap().unwrap();
    session.set(owner, "name", "Ged").unwrap();
    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn read_only_entities_are_never_updated() {
    let factory = factory(catalog_metamodel(), seeded());
    let mut session = factory.open_session().unwrap();
    let owner = session.find("Owner", 1).unwrap().unwrap();
    session.set_read_only(owner, true).unwrap();
    session.set(owner, "name", "Ogion").unwrap();
    assert!(session.flush().unwrap().is_empty());

    // the change made while read-only becomes the new baseline
    session.set_read_only(owner, false).unwrap();
    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn clearing_a_reference_is_an_update() {
    let factory = factory(catalog_metamodel(), seeded());
    let mut session = factory.open_session().unwrap();
    let pet = session.find("Pet", 10).unwrap().unwrap();
    session.set(pet, "owner", PropertyValue::Reference(None)).unwrap();
    let summary = session.flush().unwrap();
    assert_eq!(summary.executed[0].properties, ["owner"]);
}

#[test]
fn stale_versions_fail_the_flush() {
    let backend = seeded();
    let factory = factory(catalog_metamodel(), backend.clone());
    let mut session = factory.open_session().unwrap();
    let owner = session.find("Owner", 1).unwrap().unwrap();

    concurrent_rename(&backend, 1, "Ogion", 0);
    session.set(owner, "name", "Sparrowhawk").unwrap();
    let err = session.commit().unwrap_err();
    assert!(matches!(err, CoreError::StaleObjectState { .. }), "{err}");
    assert_eq!(factory.statistics().optimistic_failures(), 1);

    // the session must be rolled back before further use
    assert!(matches!(
        session.find("Owner", 1),
        Err(CoreError::SessionUnusable)
    ));
    session.rollback().unwrap();

    let owner = session.find("Owner", 1).unwrap().unwrap();
    let reloaded = session.instance(owner).unwrap();
    assert_eq!(reloaded.version(), Some(&Value::Integer(1)));
    assert_eq!(
        session.get(owner, "name").unwrap(),
        &PropertyValue::Basic(Value::from("Ogion"))
    );
}
