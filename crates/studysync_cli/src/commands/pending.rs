//! Pending command implementation.

use super::{load, print_json};
use serde::Serialize;
use std::path::Path;
use studysync_protocol::{ChangeKind, QueuedChange};

/// One row of the pending listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRow {
    seq: u64,
    id: String,
    kind: ChangeKind,
    entity: String,
    base_version: Option<u64>,
    fields: Vec<String>,
    retry_count: u32,
    attempted: bool,
    last_error: Option<String>,
}

impl From<&QueuedChange> for PendingRow {
    fn from(queued: &QueuedChange) -> Self {
        let change = &queued.change;
        Self {
            seq: queued.seq,
            id: change.id.to_string(),
            kind: change.kind,
            entity: change.key.to_string(),
            base_version: change.base_version.map(|v| v.0),
            fields: change.payload.fields().map(str::to_owned).collect(),
            retry_count: change.retry_count,
            attempted: queued.attempted,
            last_error: queued.last_error.clone(),
        }
    }
}

/// Runs the pending command.
pub fn run(
    path: &Path,
    entity_type: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = load(path)?;
    let rows = select(&loaded.snapshot.pending, entity_type);

    match format {
        "json" => print_json(&rows)?,
        _ => {
            if rows.is_empty() {
                println!("No pending changes");
            }
            for row in &rows {
                println!(
                    "#{:<5} {:<6} {:<30} base={} retries={}{}",
                    row.seq,
                    row.kind,
                    row.entity,
                    row.base_version
                        .map_or_else(|| "-".to_string(), |v| v.to_string()),
                    row.retry_count,
                    if row.attempted { " (sent)" } else { "" }
                );
                if !row.fields.is_empty() {
                    println!("       fields: {}", row.fields.join(", "));
                }
                if let Some(error) = &row.last_error {
                    println!("       last error: {}", error);
                }
            }
        }
    }

    Ok(())
}

fn select(pending: &[QueuedChange], entity_type: Option<&str>) -> Vec<PendingRow> {
    pending
        .iter()
        .filter(|q| entity_type.map_or(true, |t| q.change.key.entity_type == t))
        .map(PendingRow::from)
        .collect()
}
