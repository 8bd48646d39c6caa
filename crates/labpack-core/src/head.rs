//! The HEAD pointer document.
//!
//! `HEAD.json` is the single source of truth for which snapshot is current.
//! It is only ever replaced whole through [`write_head`]; readers that find
//! it missing or garbled hand the bundle to recovery.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::durable::{atomic_write_json, read_json, unix_now};
use crate::error::Result;
use crate::layout::{HEAD_FILE, SNAPSHOT_EXT, SnapshotSeq};

/// `{ "current": "NNNNNN", "ts": <unix-seconds> }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHead")]
pub struct HeadDoc {
    pub current: SnapshotSeq,
    pub ts: i64,
}

impl HeadDoc {
    /// Point at `seq`, stamped with the current time.
    #[must_use]
    pub fn now(seq: SnapshotSeq) -> Self {
        Self {
            current: seq,
            ts: unix_now(),
        }
    }
}

/// Wire shape accepted on read. Older writers stored `current` as a file
/// name or a bare integer, and the time as float `timestamp`.
#[derive(Deserialize)]
struct RawHead {
    current: RawSeq,
    #[serde(default)]
    ts: Option<f64>,
    #[serde(default)]
    timestamp: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSeq {
    Number(u64),
    Text(String),
}

impl TryFrom<RawHead> for HeadDoc {
    type Error = String;

    fn try_from(raw: RawHead) -> std::result::Result<Self, Self::Error> {
        let current = match raw.current {
            RawSeq::Number(n) => u32::try_from(n)
                .ok()
                .and_then(SnapshotSeq::new)
                .ok_or_else(|| format!("sequence {n} out of range"))?,
            RawSeq::Text(text) => {
                let text = text.trim();
                let stem = text
                    .strip_suffix(SNAPSHOT_EXT)
                    .and_then(|s| s.strip_suffix('.'))
                    .unwrap_or(text);
                stem.parse()?
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let ts = raw.ts.or(raw.timestamp).map_or(0, |t| t.floor() as i64);
        Ok(Self { current, ts })
    }
}

/// Read and parse a HEAD document.
///
/// # Errors
///
/// I/O errors when missing or unreadable, [`crate::StorageError::Json`] when
/// garbled.
pub fn read_head(path: &Path) -> Result<HeadDoc> {
    read_json(path)
}

/// Atomically replace `<root>/HEAD.json` and sync the root directory.
///
/// # Errors
///
/// I/O failures; the previous HEAD is intact on error.
pub fn write_head(root: &Path, doc: &HeadDoc) -> Result<()> {
    atomic_write_json(&root.join(HEAD_FILE), doc)?;
    tracing::debug!(root = %root.display(), current = %doc.current, "wrote HEAD");
    Ok(())
}

/// Sync-conflict copies of HEAD in `root`, sorted by name.
///
/// Sync clients name these e.g. `HEAD (conflicted copy 2024-05-01).json`,
/// `HEAD 2.json` or `HEAD.sync-conflict-20240501-101010-ABC.json`.
#[must_use]
pub fn conflict_variants(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut variants: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            entry.file_name().to_str().is_some_and(|name| {
                name != HEAD_FILE
                    && name.starts_with("HEAD")
                    && name.to_ascii_lowercase().ends_with(".json")
            })
        })
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .collect();
    variants.sort();
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use tempfile::TempDir;

    fn parse(json: &str) -> std::result::Result<HeadDoc, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn canonical_form_round_trips() {
        let doc = HeadDoc {
            current: SnapshotSeq::new(7).unwrap(),
            ts: 1_700_000_000,
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert_eq!(json, r#"{"current":"000007","ts":1700000000}"#);
        assert_eq!(parse(&json).unwrap(), doc);
    }

    #[test]
    fn historical_forms_are_accepted() {
        let seven = SnapshotSeq::new(7).unwrap();

        let by_name = parse(r#"{"current": "000007.sqlite", "timestamp": 1700000000.75}"#).unwrap();
        assert_eq!(by_name.current, seven);
        assert_eq!(by_name.ts, 1_700_000_000);

        let by_number = parse(r#"{"current": 7}"#).unwrap();
        assert_eq!(by_number.current, seven);
        assert_eq!(by_number.ts, 0);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        for json in [
            r#"{"current": 0}"#,
            r#"{"current": "abc"}"#,
            r#"{"current": "000007.db"}"#,
            r#"{"ts": 5}"#,
            "{",
        ] {
            assert!(parse(json).is_err(), "{json}");
        }
    }

    #[test]
    fn write_then_read_and_garbled_read() {
        let dir = TempDir::new().unwrap();
        let doc = HeadDoc::now(SnapshotSeq::new(3).unwrap());
        write_head(dir.path(), &doc).unwrap();
        assert_eq!(read_head(&dir.path().join(HEAD_FILE)).unwrap(), doc);

        fs::write(dir.path().join(HEAD_FILE), b"\0\0\0").unwrap();
        assert!(matches!(
            read_head(&dir.path().join(HEAD_FILE)),
            Err(StorageError::Json { .. })
        ));
    }

    #[test]
    fn conflict_variants_exclude_canonical_and_temps() {
        let dir = TempDir::new().unwrap();
        for name in [
            "HEAD.json",
            "HEAD (conflicted copy 2024-05-01).json",
            "HEAD 2.json",
            ".tmp-abc.partial",
            "meta.json",
        ] {
            fs::write(dir.path().join(name), "{}").unwrap();
        }
        let names: Vec<String> = conflict_variants(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["HEAD (conflicted copy 2024-05-01).json", "HEAD 2.json"]);
    }
}
