//! Hibernia CLI
//!
//! Command-line tools for inspecting how Hibernia flushes an object graph.
//!
//! # Commands
//!
//! - `plan` - Persist a graph described in a JSON file and print the
//!   statements the flush executed, in order
//! - `demo` - Run the built-in six-entity scenario

mod commands;
mod graph;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Hibernia command-line tools.
#[derive(Parser)]
#[command(name = "hibernia")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flush a graph described in a JSON file
    Plan {
        /// Path to the graph document
        file: PathBuf,

        /// Group inserts by entity where foreign keys allow it
        #[arg(long)]
        order_inserts: bool,

        /// Maximum statements per batch (0 disables batching)
        #[arg(short, long, default_value = "25")]
        batch_size: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the built-in six-entity scenario
    Demo {
        /// Group inserts by entity where foreign keys allow it
        #[arg(long)]
        order_inserts: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Plan {
            file,
            order_inserts,
            batch_size,
            format,
        } => {
            commands::plan::run(&file, order_inserts, batch_size, &format)?;
        }
        Commands::Demo {
            order_inserts,
            format,
        } => {
            commands::demo::run(order_inserts, &format)?;
        }
        Commands::Version => {
            println!("Hibernia CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
