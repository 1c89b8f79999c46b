//! Flush report shared by the commands.

use hibernia_core::FlushSummary;
use hibernia_storage::InMemoryBackend;
use serde::Serialize;
use std::collections::BTreeMap;

/// What one flush did.
#[derive(Debug, Serialize)]
pub struct FlushReport {
    /// Executed actions, in order.
    pub actions: Vec<ActionLine>,
    /// Statements sent to the database.
    pub statements: u64,
    /// Round trips used to send them.
    pub round_trips: u64,
    /// Committed rows per table.
    pub rows: BTreeMap<String, usize>,
}

/// One executed action.
#[derive(Debug, Serialize)]
pub struct ActionLine {
    /// Action kind.
    pub kind: String,
    /// Entity name or collection role.
    pub target: String,
    /// Entity or owner identifier.
    pub id: String,
    /// Written properties.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<String>,
}

impl FlushReport {
    /// Builds a report from a flush summary and the database it ran on.
    pub fn new<'a>(
        summary: &FlushSummary,
        backend: &InMemoryBackend,
        tables: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let actions = summary
            .executed
            .iter()
            .map(|a| ActionLine {
                kind: a.kind.to_string(),
                target: a.target.clone(),
                id: a.id.to_string(),
                properties: a.properties.clone(),
            })
            .collect();
        let rows = tables
            .into_iter()
            .map(|t| (t.to_string(), backend.row_count(t)))
            .collect();
        Self {
            actions,
            statements: backend.stats().statements(),
            round_trips: backend.stats().round_trips(),
            rows,
        }
    }

    /// Prints the report.
    pub fn print(&self, format: &str) -> Result<(), Box<dyn std::error::Error>> {
        match format {
            "json" => {
                println!("{}", serde_json::to_string_pretty(self)?);
            }
            _ => self.print_text(),
        }
        Ok(())
    }

    fn print_text(&self) {
        println!("Executed actions");
        println!("================");
        for (step, action) in self.actions.iter().enumerate() {
            if action.properties.is_empty() {
                println!("{:>3}. {:<20} {}#{}", step + 1, action.kind, action.target, action.id);
            } else {
                println!(
                    "{:>3}. {:<20} {}#{} ({})",
                    step + 1,
                    action.kind,
                    action.target,
                    action.id,
                    action.properties.join(", ")
                );
            }
        }
        println!();
        println!("Statements:  {}", self.statements);
        println!("Round trips: {}", self.round_trips);
        println!();
        println!("Rows");
        println!("====");
        for (table, count) in &self.rows {
            println!("  {table}: {count}");
        }
    }
}
