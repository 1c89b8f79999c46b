//! A load that races with an invalidation must not populate the cache.

use hibernia_cache::{AccessType, EntityAccessStrategy};
use hibernia_codec::Value;
use hibernia_core::PropertyValue;
use hibernia_testkit::prelude::*;

fn seeded() -> HookedBackend {
    let backend = HookedBackend::default();
    seed_owner(backend.inner(), 1, "Ged", &[]);
    backend
}

#[test]
fn put_after_an_intervening_invalidation_is_rejected() {
    let backend = seeded();
    let factory = factory(catalog_metamodel(), backend.clone());
    let (access, key) = cache_handle(&factory, "Owner", 1).unwrap();
    backend.set_hook(move |_, _| access.evict(&key));

    let mut session = factory.open_session().unwrap();
    session.find("Owner", 1).unwrap().unwrap();
    let stats = factory.statistics().snapshot();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_puts, 0);
    backend.clear_hook();

    // nothing was cached, so the next session goes to the database again
    let mut session = factory.open_session().unwrap();
    session.find("Owner", 1).unwrap().unwrap();
    assert_eq!(backend.inner().stats().loads(), 2);
    assert_eq!(factory.statistics().snapshot().cache_puts, 1);
}

#[test]
fn put_without_invalidation_is_accepted() {
    let backend = seeded();
    let factory = factory(catalog_metamodel(), backend.clone());
    let mut session = factory.open_session().unwrap();
    session.find("Owner", 1).unwrap().unwrap();
    assert_eq!(factory.statistics().snapshot().cache_puts, 1);

    let mut session = factory.open_session().unwrap();
    let owner = session.find("Owner", 1).unwrap().unwrap();
    assert_eq!(factory.statistics().cache_hits(), 1);
    assert_eq!(backend.inner().stats().loads(), 1);
    assert_eq!(
        session.get(owner, "name").unwrap(),
        &PropertyValue::Basic(Value::from("Ged"))
    );
}

#[test]
fn region_invalidation_also_rejects_the_put() {
    let backend = seeded();
    let factory = factory(catalog_metamodel(), backend.clone());
    let evicting = factory.clone();
    backend.set_hook(move |table, _| evicting.evict_entity_region(table));

    let mut session = factory.open_session().unwrap();
    session.find("Owner", 1).unwrap().unwrap();
    assert_eq!(factory.statistics().snapshot().cache_puts, 0);
    backend.clear_hook();
}

#[test]
fn every_strategy_rejects_the_racing_put() {
    for access_type in [
        AccessType::ReadWrite,
        AccessType::NonstrictReadWrite,
        AccessType::Transactional,
    ] {
        let backend = seeded();
        let factory = factory(catalog_metamodel_with(access_type), backend.clone());
        let (access, key) = cache_handle(&factory, "Owner", 1).unwrap();
        backend.set_hook(move |_, _| access.evict(&key));

        let mut session = factory.open_session().unwrap();
        session.find("Owner", 1).unwrap().unwrap();
        assert_eq!(
            factory.statistics().snapshot().cache_puts,
            0,
            "{access_type:?}"
        );
        backend.clear_hook();
    }
}
