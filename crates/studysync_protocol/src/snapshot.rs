//! Durable queue snapshot and its on-disk envelope.
//!
//! The queue is persisted as a whole on every mutation. The file layout is:
//!
//! ```text
//! +--------+---------+----------+----------+-----------------+
//! | magic  | version | body len | crc32    | CBOR body       |
//! | 4 B    | u16 LE  | u32 LE   | u32 LE   | body len bytes  |
//! +--------+---------+----------+----------+-----------------+
//! ```
//!
//! Readers accept any version up to [`SNAPSHOT_VERSION`] and refuse newer
//! ones, so an older build never misreads a queue written by a newer build.

use crate::change::Change;
use crate::conflict::ConflictRecord;
use crate::error::{ProtocolError, ProtocolResult};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of every snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SSQF";

/// Newest snapshot format version this build writes and reads.
pub const SNAPSHOT_VERSION: u16 = 1;

/// Size of the fixed envelope header in bytes.
pub const SNAPSHOT_HEADER_SIZE: usize = 14;

/// A pending change together with its queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChange {
    /// Enqueue sequence number; orders changes within one entity.
    pub seq: u64,
    /// The change itself.
    pub change: Change,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// True once the change has been sent at least once.
    ///
    /// The remote may already hold a sent change, so later edits are
    /// queued behind it instead of being merged into it.
    #[serde(default)]
    pub attempted: bool,
}

/// A change that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The abandoned change.
    pub change: Change,
    /// Error from the final attempt.
    pub error: String,
    /// When the change was moved out of the active queue.
    pub failed_at: Timestamp,
}

/// Everything the local change store persists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Pending changes in ready order.
    pub pending: Vec<QueuedChange>,
    /// Changes that will not be retried automatically.
    pub dead_letters: Vec<DeadLetter>,
    /// Conflicts awaiting a user decision.
    pub conflicts: Vec<ConflictRecord>,
    /// Next sequence number to assign.
    pub next_seq: u64,
}

/// Parsed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Format version.
    pub version: u16,
    /// Body length in bytes.
    pub body_len: u32,
    /// CRC-32 of the body.
    pub checksum: u32,
}

impl SnapshotHeader {
    /// Parses and validates the fixed header.
    pub fn parse(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < SNAPSHOT_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: SNAPSHOT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version == 0 || version > SNAPSHOT_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let body_len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let checksum = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        Ok(Self {
            version,
            body_len,
            checksum,
        })
    }
}

impl QueueSnapshot {
    /// Returns true if nothing is queued, dead-lettered, or in conflict.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.dead_letters.is_empty() && self.conflicts.is_empty()
    }

    /// Encodes the snapshot into its enveloped byte form.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body)
            .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;

        let body_len = u32::try_from(body.len())
            .map_err(|_| ProtocolError::encoding_failed("snapshot body exceeds 4 GiB"))?;

        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + body.len());
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&body_len.to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes an enveloped snapshot, verifying its header and checksum.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let header = SnapshotHeader::parse(bytes)?;

        let expected = SNAPSHOT_HEADER_SIZE + header.body_len as usize;
        if bytes.len() < expected {
            return Err(ProtocolError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let body = &bytes[SNAPSHOT_HEADER_SIZE..expected];
        let actual = crc32fast::hash(body);
        if actual != header.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }

        ciborium::from_reader(body).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::types::{EntityKey, Version};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn sample() -> QueueSnapshot {
        let update = Change::update(
            EntityKey::new("note", "n1"),
            Payload::from_fields([("title", json!("Cell biology")), ("pinned", json!(true))]),
            Version(3),
            "u1",
        );
        let create = Change::create(
            EntityKey::new("task", "t1"),
            Payload::from_fields([("due", json!(1_700_000_000_000u64))]),
            "u1",
        );
        let conflicted = Change::update(
            EntityKey::new("resource", "r1"),
            Payload::from_fields([("url", json!("https://example.org"))]),
            Version(1),
            "u2",
        );

        QueueSnapshot {
            pending: vec![
                QueuedChange {
                    seq: 0,
                    change: update,
                    last_error: Some("timeout".into()),
                    attempted: true,
                },
                QueuedChange {
                    seq: 1,
                    change: create.clone(),
                    last_error: None,
                    attempted: false,
                },
            ],
            dead_letters: vec![DeadLetter {
                change: create,
                error: "503".into(),
                failed_at: Timestamp(42),
            }],
            conflicts: vec![ConflictRecord::pending(
                &conflicted,
                Version(2),
                Payload::from_fields([("url", json!("https://other.org"))]),
                false,
                ["url".to_string()].into_iter().collect::<BTreeSet<_>>(),
            )],
            next_seq: 2,
        }
    }

    #[test]
    fn encode_decode_preserves_snapshot() {
        let snapshot = sample();
        let bytes = snapshot.encode().unwrap();

        assert_eq!(&bytes[0..4], b"SSQF");
        let header = SnapshotHeader::parse(&bytes).unwrap();
        assert_eq!(header.version, SNAPSHOT_VERSION);
        assert_eq!(header.body_len as usize, bytes.len() - SNAPSHOT_HEADER_SIZE);

        assert_eq!(QueueSnapshot::decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = QueueSnapshot::default();
        assert!(snapshot.is_empty());
        let bytes = snapshot.encode().unwrap();
        assert!(QueueSnapshot::decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert_eq!(QueueSnapshot::decode(&bytes), Err(ProtocolError::InvalidMagic));
    }

    #[test]
    fn rejects_newer_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[4..6].copy_from_slice(&(SNAPSHOT_VERSION + 1).to_le_bytes());
        assert!(matches!(
            QueueSnapshot::decode(&bytes),
            Err(ProtocolError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let bytes = sample().encode().unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            QueueSnapshot::decode(cut),
            Err(ProtocolError::Truncated { .. })
        ));

        assert!(matches!(
            QueueSnapshot::decode(&bytes[..5]),
            Err(ProtocolError::Truncated { expected: 14, actual: 5 })
        ));
    }

    #[test]
    fn rejects_flipped_body_byte() {
        let mut bytes = sample().encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            QueueSnapshot::decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn any_corrupted_byte_is_detected(index in 0usize..4096, mask in 1u8..=255) {
            let mut bytes = sample().encode().unwrap();
            let index = index % bytes.len();
            bytes[index] ^= mask;
            proptest::prop_assert!(QueueSnapshot::decode(&bytes).is_err());
        }
    }
}
