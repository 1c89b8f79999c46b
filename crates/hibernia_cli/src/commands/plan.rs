//! Plan command implementation.

use super::report::FlushReport;
use crate::graph::GraphDocument;
use hibernia_core::{Config, SessionFactory};
use hibernia_storage::InMemoryBackend;
use std::path::Path;
use tracing::info;

/// Runs the plan command.
pub fn run(
    path: &Path,
    order_inserts: bool,
    batch_size: usize,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read graph document {}: {e}", path.display()))?;
    let config = Config::default()
        .order_inserts(order_inserts)
        .batch_size(batch_size);
    let report = flush_document(&json, config)?;
    report.print(format)
}

/// Persists the graph of a document into a fresh in-memory database and
/// commits it.
pub fn flush_document(json: &str, config: Config) -> Result<FlushReport, Box<dyn std::error::Error>> {
    let document = GraphDocument::parse(json)?;
    let metamodel = document.metamodel()?;
    let backend = InMemoryBackend::new();
    let factory = SessionFactory::builder(metamodel, backend.clone())
        .name("plan")
        .config(config)
        .build()?;

    let mut session = factory.open_session()?;
    let handles = document.persist_into(&mut session)?;
    info!(instances = handles.len(), "graph created");
    let summary = session.commit()?;
    session.close()?;

    let tables = document.entities.iter().map(|e| e.name.as_str());
    Ok(FlushReport::new(&summary, &backend, tables))
}
