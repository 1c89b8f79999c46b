//! The six-entity scenario: cascaded persist of a graph whose inserts need
//! reordering and deferred foreign keys.

use hibernia_core::{ActionKind, Config, Reference};
use hibernia_testkit::prelude::*;

#[test]
fn cascade_persist_orders_inserts_by_foreign_keys() {
    let backend = InMemoryBackend::new();
    let factory = factory(scenario_metamodel(), backend.clone());
    let mut session = factory.open_session().unwrap();
    let graph = ScenarioGraph::build(&mut session, 1).unwrap();

    session.persist(graph.b).unwrap();
    for instance in graph.instances() {
        assert!(session.contains(instance), "{instance} not managed");
    }
    let summary = session.commit().unwrap();

    assert_eq!(summary.insert_order(), ["C", "E", "D", "B", "G", "F"]);
    // C.b, D.f and B.g point at rows inserted after their owner
    assert_eq!(summary.count(ActionKind::EntityUpdate), 3);
    for name in SCENARIO_ENTITIES {
        assert_eq!(backend.row_count(name), 1, "{name}");
    }
}

#[test]
fn grouped_inserts_still_respect_foreign_keys() {
    let backend = InMemoryBackend::new();
    let factory = factory_with(
        scenario_metamodel(),
        backend.clone(),
        Config::default().order_inserts(true),
    );
    let mut session = factory.open_session().unwrap();
    let first = ScenarioGraph::build(&mut session, 1).unwrap();
    let second = ScenarioGraph::build(&mut session, 2).unwrap();
    session.persist(first.b).unwrap();
    session.persist(second.b).unwrap();
    let summary = session.commit().unwrap();

    let order = summary.insert_order();
    assert_eq!(order.len(), 12);
    let position = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(position("C") < position("B"));
    assert!(position("D") < position("B"));
    assert!(position("E") < position("D"));
    assert!(position("G") < position("F"));
    // same-entity inserts are adjacent
    for name in SCENARIO_ENTITIES {
        let at = position(name);
        assert_eq!(order[at + 1], name);
    }
    assert_eq!(backend.row_count("B"), 2);
}

#[test]
fn same_session_find_returns_the_original_graph() {
    let factory = factory(scenario_metamodel(), InMemoryBackend::new());
    let mut session = factory.open_session().unwrap();
    let graph = ScenarioGraph::build(&mut session, 1).unwrap();
    session.persist(graph.b).unwrap();
    session.commit().unwrap();

    assert_eq!(session.find("B", 1).unwrap(), Some(graph.b));
    assert_eq!(session.find("G", 1).unwrap(), Some(graph.g));
    assert_eq!(
        session.reference(graph.c, "b").unwrap(),
        Some(Reference::Instance(graph.b))
    );
}

#[test]
fn reloaded_graph_has_identical_back_references() {
    let factory = factory(scenario_metamodel(), InMemoryBackend::new());
    let mut session = factory.open_session().unwrap();
    let graph = ScenarioGraph::build(&mut session, 7).unwrap();
    session.persist(graph.b).unwrap();
    session.commit().unwrap();
    session.close().unwrap();

    let mut session = factory.open_session().unwrap();
    let b = session.find("B", 7).unwrap().unwrap();
    let c = session.reference(b, "c").unwrap().unwrap();
    let c = session.unproxy(c).unwrap();
    assert_eq!(session.reference(c, "b").unwrap(), Some(Reference::Instance(b)));

    let d = session.reference(b, "d").unwrap().unwrap();
    let d = session.unproxy(d).unwrap();
    let f = session.reference(d, "f").unwrap().unwrap();
    let f = session.unproxy(f).unwrap();
    assert_eq!(session.reference(f, "g").unwrap(), session.reference(b, "g").unwrap());
    assert_eq!(session.find("C", 7).unwrap(), Some(c));
    assert_eq!(factory.statistics().entity_loads(), 6);
}

#[test]
fn reloaded_graph_flushes_clean() {
    let factory = factory(scenario_metamodel(), InMemoryBackend::new());
    let mut session = factory.open_session().unwrap();
    let graph = ScenarioGraph::build(&mut session, 1).unwrap();
    session.persist(graph.b).unwrap();
    session.commit().unwrap();
    assert!(session.flush().unwrap().is_empty());

    let mut other = factory.open_session().unwrap();
    other.find("B", 1).unwrap().unwrap();
    assert!(other.flush().unwrap().is_empty());
}
