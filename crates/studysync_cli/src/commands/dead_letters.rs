//! Dead letters command implementation.

use super::{load, print_json};
use std::path::Path;

/// Runs the dead letters command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let loaded = load(path)?;
    let dead_letters = &loaded.snapshot.dead_letters;

    match format {
        "json" => print_json(dead_letters)?,
        _ => {
            if dead_letters.is_empty() {
                println!("No dead letters");
            }
            for letter in dead_letters {
                println!(
                    "{} {} {} after {} retries (failed at {}ms)",
                    letter.change.id,
                    letter.change.kind,
                    letter.change.key,
                    letter.change.retry_count,
                    letter.failed_at.as_millis()
                );
                println!("    error: {}", letter.error);
            }
        }
    }

    Ok(())
}
