//! StudySync CLI
//!
//! Offline tools for inspecting a persisted change queue.
//!
//! # Commands
//!
//! - `inspect` - Summarize the queue file
//! - `pending` - List pending changes
//! - `dead-letters` - List changes that exhausted their retries
//! - `conflicts` - List conflicts awaiting a decision
//! - `verify` - Check the file envelope and queue invariants

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// StudySync change queue tools.
#[derive(Parser)]
#[command(name = "studysync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the queue file
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List pending changes in queue order
    Pending {
        /// Only show changes for this entity type
        #[arg(short, long)]
        entity_type: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List dead-lettered changes with their last error
    DeadLetters {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List conflicts awaiting manual resolution
    Conflicts {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify the file envelope and queue invariants
    Verify,

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
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Queue path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Pending {
            entity_type,
            format,
        } => {
            let path = cli.path.ok_or("Queue path required for pending")?;
            commands::pending::run(&path, entity_type.as_deref(), &format)?;
        }
        Commands::DeadLetters { format } => {
            let path = cli.path.ok_or("Queue path required for dead-letters")?;
            commands::dead_letters::run(&path, &format)?;
        }
        Commands::Conflicts { format } => {
            let path = cli.path.ok_or("Queue path required for conflicts")?;
            commands::conflicts::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Queue path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("StudySync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Queue format v{}",
                studysync_protocol::SNAPSHOT_VERSION
            );
        }
    }

    Ok(())
}
