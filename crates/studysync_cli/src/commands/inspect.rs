//! Inspect command implementation.

use super::{load, print_json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use studysync_protocol::{ChangeKind, QueueSnapshot};

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Queue file path.
    pub path: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Envelope format version, if the file is not empty.
    pub format_version: Option<u16>,
    /// Number of pending changes.
    pub pending: usize,
    /// Pending changes per entity type.
    pub pending_by_type: BTreeMap<String, TypeStats>,
    /// Pending changes that have been sent at least once.
    pub attempted: usize,
    /// Number of dead letters.
    pub dead_letters: usize,
    /// Number of pending conflicts.
    pub conflicts: usize,
    /// Next sequence number to assign.
    pub next_seq: u64,
}

/// Pending change counts for one entity type.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct TypeStats {
    /// Creates.
    pub creates: usize,
    /// Updates.
    pub updates: usize,
    /// Deletes.
    pub deletes: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = load(path)?;
    let mut result = summarize(&loaded.snapshot);
    result.path = path.display().to_string();
    result.file_size = loaded.file_size;
    result.format_version = loaded.header.map(|h| h.version);

    match format {
        "json" => print_json(&result)?,
        _ => print_text_output(&result),
    }

    Ok(())
}

fn summarize(snapshot: &QueueSnapshot) -> InspectResult {
    let mut pending_by_type: BTreeMap<String, TypeStats> = BTreeMap::new();
    for queued in &snapshot.pending {
        let stats = pending_by_type
            .entry(queued.change.key.entity_type.clone())
            .or_default();
        match queued.change.kind {
            ChangeKind::Create => stats.creates += 1,
            ChangeKind::Update => stats.updates += 1,
            ChangeKind::Delete => stats.deletes += 1,
        }
    }

    InspectResult {
        path: String::new(),
        file_size: 0,
        format_version: None,
        pending: snapshot.pending.len(),
        pending_by_type,
        attempted: snapshot.pending.iter().filter(|q| q.attempted).count(),
        dead_letters: snapshot.dead_letters.len(),
        conflicts: snapshot.conflicts.len(),
        next_seq: snapshot.next_seq,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("StudySync Queue Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {} bytes", result.file_size);
    match result.format_version {
        Some(version) => println!("Format: v{}", version),
        None => println!("Format: (empty file)"),
    }
    println!();
    println!("Queue:");
    println!("  Pending:      {}", result.pending);
    println!("  Attempted:    {}", result.attempted);
    println!("  Dead letters: {}", result.dead_letters);
    println!("  Conflicts:    {}", result.conflicts);
    println!("  Next seq:     {}", result.next_seq);

    if !result.pending_by_type.is_empty() {
        println!();
        println!("Pending by entity type:");
        for (entity_type, stats) in &result.pending_by_type {
            println!(
                "  {}: {} create, {} update, {} delete",
                entity_type, stats.creates, stats.updates, stats.deletes
            );
        }
    }
}
