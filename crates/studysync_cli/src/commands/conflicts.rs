//! Conflicts command implementation.

use super::{load, print_json};
use std::path::Path;

/// Runs the conflicts command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = load(path)?;
    let conflicts = &loaded.snapshot.conflicts;

    match format {
        "json" => print_json(conflicts)?,
        _ => {
            if conflicts.is_empty() {
                println!("No conflicts");
            }
            for conflict in conflicts {
                println!(
                    "{} local {} on {} vs remote {}{}",
                    conflict.key,
                    conflict.local_kind,
                    conflict
                        .local_base_version
                        .map_or_else(|| "-".to_string(), |v| v.to_string()),
                    conflict.remote_version,
                    if conflict.remote_deleted {
                        " (deleted)"
                    } else {
                        ""
                    }
                );
                let overlap: Vec<&str> =
                    conflict.overlapping_fields.iter().map(String::as_str).collect();
                if !overlap.is_empty() {
                    println!("    overlapping: {}", overlap.join(", "));
                }
                println!("    change: {} by {}", conflict.change_id, conflict.owner_id);
            }
        }
    }

    Ok(())
}
