//! Verify command implementation.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use studysync_protocol::{
    ChangeKind, QueueSnapshot, SnapshotHeader, SNAPSHOT_HEADER_SIZE,
};
use studysync_storage::{FileBackend, StorageBackend};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of pending changes checked.
    pub pending_checked: usize,
    /// Envelope format version, if the file is not empty.
    pub format_version: Option<u16>,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying queue at {:?}", path);
    println!();

    if !path.exists() {
        return Err(format!("No queue file found at {:?}", path).into());
    }

    let backend = FileBackend::open_existing(path)?;
    let bytes = backend.read_all()?;
    let result = verify_bytes(&bytes);

    match result.format_version {
        Some(version) => println!("Format:  v{}", version),
        None if result.is_ok() => println!("Format:  (empty file)"),
        None => println!("Format:  unreadable"),
    }
    println!("Pending: {} changes checked", result.pending_checked);
    for error in &result.errors {
        println!("  - {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Queue verification passed");
        Ok(())
    } else {
        println!("✗ Queue verification failed");
        Err("Verification failed".into())
    }
}

/// Checks the envelope of a queue file and the invariants of its contents.
pub fn verify_bytes(bytes: &[u8]) -> VerifyResult {
    let mut result = VerifyResult::default();
    if bytes.is_empty() {
        return result;
    }

    let header = match SnapshotHeader::parse(bytes) {
        Ok(header) => header,
        Err(e) => {
            result.errors.push(format!("Bad header: {}", e));
            return result;
        }
    };
    result.format_version = Some(header.version);

    let expected = SNAPSHOT_HEADER_SIZE + header.body_len as usize;
    if bytes.len() > expected {
        result.errors.push(format!(
            "{} trailing bytes after body",
            bytes.len() - expected
        ));
    }

    match QueueSnapshot::decode(bytes) {
        Ok(snapshot) => check_snapshot(&snapshot, &mut result),
        Err(e) => result.errors.push(format!("Bad body: {}", e)),
    }
    result
}

fn check_snapshot(snapshot: &QueueSnapshot, result: &mut VerifyResult) {
    let mut seqs = HashSet::new();
    let mut ids = HashSet::new();
    let mut unsent_writes: HashMap<_, usize> = HashMap::new();

    for queued in &snapshot.pending {
        result.pending_checked += 1;
        let change = &queued.change;

        if !seqs.insert(queued.seq) {
            result.errors.push(format!("Duplicate seq {}", queued.seq));
        }
        if queued.seq >= snapshot.next_seq {
            result.errors.push(format!(
                "Seq {} is not below next seq {}",
                queued.seq, snapshot.next_seq
            ));
        }
        if !ids.insert(change.id) {
            result.errors.push(format!("Duplicate change id {}", change.id));
        }

        let base_ok = match change.kind {
            ChangeKind::Create => change.base_version.is_none(),
            ChangeKind::Update | ChangeKind::Delete => change.base_version.is_some(),
        };
        if !base_ok {
            result.errors.push(format!(
                "{} {} has an invalid base version",
                change.kind, change.key
            ));
        }
        if change.kind == ChangeKind::Delete && !change.payload.is_empty() {
            result
                .errors
                .push(format!("delete {} carries a payload", change.key));
        }

        if change.kind.writes_fields() && !queued.attempted {
            let count = unsent_writes.entry(&change.key).or_default();
            *count += 1;
            if *count == 2 {
                result.errors.push(format!(
                    "{} has more than one unsent write",
                    change.key
                ));
            }
        }
    }
}
