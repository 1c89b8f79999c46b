//! Demo command implementation.
//!
//! Persists the six-entity graph `B -> {C, D, G}`, `D -> {E, F}`,
//! `F -> G`, `C -> B` by cascading from `B`. The inserts must be reordered
//! so that every non-nullable foreign key points at an existing row, and
//! the nullable ones that point forward are written by trailing updates.

use super::plan::flush_document;
use hibernia_core::Config;

const SCENARIO: &str = r#"{
    "entities": [
        { "name": "B", "properties": [
            { "kind": "basic", "name": "name" },
            { "kind": "many_to_one", "name": "c", "target": "C", "cascade": "persist_merge" },
            { "kind": "many_to_one", "name": "d", "target": "D", "cascade": "persist_merge" },
            { "kind": "many_to_one", "name": "g", "target": "G", "nullable": true,
              "cascade": "persist_merge" }
        ] },
        { "name": "C", "properties": [
            { "kind": "basic", "name": "name" },
            { "kind": "many_to_one", "name": "b", "target": "B", "nullable": true }
        ] },
        { "name": "D", "properties": [
            { "kind": "basic", "name": "name" },
            { "kind": "many_to_one", "name": "e", "target": "E", "cascade": "persist_merge" },
            { "kind": "many_to_one", "name": "f", "target": "F", "nullable": true,
              "cascade": "persist_merge" }
        ] },
        { "name": "E", "properties": [ { "kind": "basic", "name": "name" } ] },
        { "name": "F", "properties": [
            { "kind": "basic", "name": "name" },
            { "kind": "many_to_one", "name": "g", "target": "G", "cascade": "persist_merge" }
        ] },
        { "name": "G", "properties": [ { "kind": "basic", "name": "name" } ] }
    ],
    "instances": [
        { "handle": "b", "entity": "B", "id": 1,
          "values": { "name": "b", "c": { "ref": "c" }, "d": { "ref": "d" }, "g": { "ref": "g" } } },
        { "handle": "c", "entity": "C", "id": 1, "values": { "name": "c", "b": { "ref": "b" } } },
        { "handle": "d", "entity": "D", "id": 1,
          "values": { "name": "d", "e": { "ref": "e" }, "f": { "ref": "f" } } },
        { "handle": "e", "entity": "E", "id": 1, "values": { "name": "e" } },
        { "handle": "f", "entity": "F", "id": 1, "values": { "name": "f", "g": { "ref": "g" } } },
        { "handle": "g", "entity": "G", "id": 1, "values": { "name": "g" } }
    ],
    "persist": ["b"]
}"#;

/// Runs the demo command.
pub fn run(order_inserts: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = flush_document(SCENARIO, Config::default().order_inserts(order_inserts))?;
    report.print(format)
}
