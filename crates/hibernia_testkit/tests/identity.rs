//! Within one session an entity key maps to at most one managed instance,
//! whatever sequence of operations led there.

use hibernia_codec::Identifier;
use hibernia_core::{InstanceId, Reference, Session};
use hibernia_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};

const ROWS: i64 = 5;

fn seeded() -> InMemoryBackend {
    let backend = InMemoryBackend::new();
    for id in 1..=ROWS {
        seed_owner(&backend, id, &format!("owner {id}"), &[]);
    }
    backend
}

fn managed_with_id(session: &Session, seen: &BTreeSet<InstanceId>, id: i64) -> Option<InstanceId> {
    let id = Identifier::from(id);
    seen.iter()
        .copied()
        .find(|&i| session.contains(i) && session.identifier(i) == Some(&id))
}

fn apply(session: &mut Session, seen: &mut BTreeSet<InstanceId>, op: SessionOp) {
    match op {
        SessionOp::Find(id) => {
            if let Some(instance) = session.find("Owner", id).unwrap() {
                seen.insert(instance);
            }
        }
        SessionOp::Reference(id) => {
            if let Reference::Instance(instance) = session.get_reference("Owner", id).unwrap() {
                seen.insert(instance);
            }
        }
        SessionOp::Persist(id) => {
            let instance = session.new_instance("Owner").unwrap();
            session.set_identifier(instance, id).unwrap();
            // fails when the key is already managed
            if session.persist(instance).is_ok() {
                seen.insert(instance);
            }
        }
        SessionOp::Evict(id) => {
            if let Some(instance) = managed_with_id(session, seen, id) {
                session.evict(instance).unwrap();
            }
        }
        SessionOp::Clear => session.clear(),
    }
}

fn assert_unique_keys(session: &Session, seen: &BTreeSet<InstanceId>) {
    let mut keys = HashSet::new();
    for &instance in seen {
        if let Some(entry) = session.entry(instance) {
            assert!(
                keys.insert(entry.key().clone()),
                "{} is managed twice",
                entry.key()
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn one_instance_per_key(ops in prop::collection::vec(session_op_strategy(ROWS), 1..40)) {
        let factory = factory(catalog_metamodel(), seeded());
        let mut session = factory.open_session().unwrap();
        let mut seen = BTreeSet::new();

        for op in ops {
            apply(&mut session, &mut seen, op);
            assert_unique_keys(&session, &seen);
        }

        for id in 1..=ROWS {
            let managed = managed_with_id(&session, &seen, id);
            let first = session.find("Owner", id).unwrap();
            let second = session.find("Owner", id).unwrap();
            prop_assert!(first.is_some());
            prop_assert_eq!(first, second);
            if managed.is_some() {
                prop_assert_eq!(first, managed);
            }
        }
    }
}

#[test]
fn find_after_reference_returns_one_instance() {
    let factory = factory(catalog_metamodel(), seeded());
    let mut session = factory.open_session().unwrap();
    let reference = session.get_reference("Owner", 3).unwrap();
    let found = session.find("Owner", 3).unwrap().unwrap();
    assert_eq!(session.unproxy(reference).unwrap(), found);
    assert_eq!(session.find("Owner", 3).unwrap(), Some(found));
}

#[test]
fn persisting_a_managed_key_is_refused() {
    let factory = factory(catalog_metamodel(), seeded());
    let mut session = factory.open_session().unwrap();
    let loaded = session.find("Owner", 2).unwrap().unwrap();
    let duplicate = session.new_instance("Owner").unwrap();
    session.set_identifier(duplicate, 2).unwrap();

    let err = session.persist(duplicate).unwrap_err();
    assert!(
        matches!(err, hibernia_core::CoreError::NonUniqueObject { .. }),
        "{err}"
    );
    assert!(!session.contains(duplicate));
    assert_eq!(session.find("Owner", 2).unwrap(), Some(loaded));
}
