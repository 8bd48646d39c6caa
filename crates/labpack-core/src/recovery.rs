//! Resolution of the current snapshot on open.
//!
//! After [`recover`] returns, the bundle has a current snapshot that passes
//! quick-check, and in [`RecoveryMode::Repair`] HEAD names it.
//!
//! # Strategies
//!
//! Tried in a fixed order; each returns a tagged [`StrategyOutcome`] and the
//! winning strategy is always logged:
//!
//! 1. [`RecoveryStrategy::HeadDocuments`]: the highest sequence named by
//!    `HEAD.json` or any sync-conflict copy; ties go to the latest `ts`, then
//!    the greatest file name. Lower-named copies never win on their own.
//! 2. [`RecoveryStrategy::DescendingScan`]: snapshot files at or below the
//!    highest sequence any HEAD document named, newest first.
//! 3. [`RecoveryStrategy::FullScan`]: every snapshot file, newest first.
//!
//! Rewriting HEAD is the only silent repair in the engine and is logged at
//! `warn` with before/after sequences.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::db;
use crate::error::{Result, StorageError};
use crate::head::{self, HeadDoc};
use crate::layout::{Bundle, SnapshotRef, SnapshotSeq, remove_if_exists};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Whether recovery may write to the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    /// Rewrite HEAD and remove conflict copies when needed. Lock holders only.
    Repair,
    /// Resolve without touching the bundle.
    Inspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    HeadDocuments,
    DescendingScan,
    FullScan,
}

impl RecoveryStrategy {
    pub const ORDER: [Self; 3] = [Self::HeadDocuments, Self::DescendingScan, Self::FullScan];
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HeadDocuments => "head-documents",
            Self::DescendingScan => "descending-scan",
            Self::FullScan => "full-scan",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub seq: SnapshotSeq,
    pub via: RecoveryStrategy,
    /// The HEAD document that named `seq`, for [`RecoveryStrategy::HeadDocuments`].
    pub document: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Recovered(Resolution),
    Failed(String),
}

/// What recovery found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resolution: Resolution,
    /// What `HEAD.json` named before recovery; `None` if missing or garbled.
    pub previous: Option<SnapshotSeq>,
    /// Sync-conflict HEAD copies present at the start.
    pub conflicts: Vec<PathBuf>,
    /// Strategies that failed before the winning one, with reasons.
    pub failures: Vec<(RecoveryStrategy, String)>,
    /// Distinct snapshot files quick-checked.
    pub examined: usize,
    pub rewrote_head: bool,
}

impl RecoveryReport {
    #[must_use]
    pub const fn current(&self) -> SnapshotSeq {
        self.resolution.seq
    }

    /// HEAD already named a valid snapshot and no conflict copies existed.
    #[must_use]
    pub fn head_was_valid(&self) -> bool {
        self.previous == Some(self.resolution.seq)
            && self.conflicts.is_empty()
            && self.resolution.via == RecoveryStrategy::HeadDocuments
    }
}

// ---------------------------------------------------------------------------
// Survey
// ---------------------------------------------------------------------------

struct Candidate {
    path: PathBuf,
    doc: HeadDoc,
}

/// Everything recovery looks at, gathered once, with memoized quick-checks.
struct Survey<'a> {
    bundle: &'a Bundle,
    head: Option<HeadDoc>,
    candidates: Vec<Candidate>,
    conflicts: Vec<PathBuf>,
    snapshots: Vec<SnapshotRef>,
    checked: BTreeMap<SnapshotSeq, bool>,
}

impl<'a> Survey<'a> {
    fn gather(bundle: &'a Bundle) -> Result<Self> {
        let head_path = bundle.head_path();
        let head = match head::read_head(&head_path) {
            Ok(doc) => Some(doc),
            Err(error) => {
                if head_path.exists() {
                    tracing::warn!(path = %head_path.display(), %error, "HEAD is unreadable");
                }
                None
            }
        };

        let conflicts = head::conflict_variants(bundle.root());
        let mut candidates: Vec<Candidate> = head
            .map(|doc| Candidate {
                path: head_path.clone(),
                doc,
            })
            .into_iter()
            .collect();
        for path in &conflicts {
            match head::read_head(path) {
                Ok(doc) => candidates.push(Candidate {
                    path: path.clone(),
                    doc,
                }),
                Err(error) => {
                    tracing::debug!(path = %path.display(), %error, "skipping unreadable HEAD copy");
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.doc
                .current
                .cmp(&a.doc.current)
                .then(b.doc.ts.cmp(&a.doc.ts))
                .then_with(|| b.path.file_name().cmp(&a.path.file_name()))
        });

        Ok(Self {
            bundle,
            head,
            candidates,
            conflicts,
            snapshots: bundle.list_snapshots()?,
            checked: BTreeMap::new(),
        })
    }

    fn is_valid(&mut self, seq: SnapshotSeq) -> bool {
        if let Some(valid) = self.checked.get(&seq) {
            return *valid;
        }
        let path = self.bundle.snapshot_path(seq);
        let valid = match db::quick_check(&path) {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!(path = %path.display(), seq = %seq, %reason, "snapshot failed quick-check");
                false
            }
        };
        self.checked.insert(seq, valid);
        valid
    }

    /// Highest sequence named by any readable HEAD document.
    fn named_bound(&self) -> Option<SnapshotSeq> {
        self.candidates.first().map(|c| c.doc.current)
    }

    fn scan(&mut self, strategy: RecoveryStrategy, bound: Option<SnapshotSeq>) -> StrategyOutcome {
        let seqs: Vec<SnapshotSeq> = self
            .snapshots
            .iter()
            .rev()
            .map(|s| s.seq)
            .filter(|seq| bound.is_none_or(|b| *seq <= b))
            .collect();
        if seqs.is_empty() {
            return StrategyOutcome::Failed("no snapshot files in range".to_string());
        }
        for seq in seqs {
            if self.is_valid(seq) {
                return StrategyOutcome::Recovered(Resolution {
                    seq,
                    via: strategy,
                    document: None,
                });
            }
        }
        StrategyOutcome::Failed("every snapshot in range failed quick-check".to_string())
    }

    fn attempt(&mut self, strategy: RecoveryStrategy) -> StrategyOutcome {
        match strategy {
            RecoveryStrategy::HeadDocuments => {
                let Some(bound) = self.named_bound() else {
                    return StrategyOutcome::Failed("no readable HEAD document".to_string());
                };
                // Only the highest named sequence may win here. A lower copy
                // could skip valid snapshots between it and the bound.
                let Some(path) = self
                    .candidates
                    .iter()
                    .find(|c| c.doc.current == bound)
                    .map(|c| c.path.clone())
                else {
                    return StrategyOutcome::Failed("no readable HEAD document".to_string());
                };
                if self.is_valid(bound) {
                    StrategyOutcome::Recovered(Resolution {
                        seq: bound,
                        via: strategy,
                        document: Some(path),
                    })
                } else {
                    StrategyOutcome::Failed(format!("highest named snapshot {bound} is invalid"))
                }
            }
            RecoveryStrategy::DescendingScan => match self.named_bound() {
                Some(bound) => self.scan(strategy, Some(bound)),
                None => StrategyOutcome::Failed("no HEAD sequence to bound the scan".to_string()),
            },
            RecoveryStrategy::FullScan => self.scan(strategy, None),
        }
    }
}

// ---------------------------------------------------------------------------
// recover
// ---------------------------------------------------------------------------

/// Resolve the bundle's current snapshot, repairing HEAD in
/// [`RecoveryMode::Repair`].
///
/// # Errors
///
/// [`StorageError::UnrecoverableBundle`] when no snapshot passes
/// quick-check; I/O failures while listing or repairing.
pub fn recover(bundle: &Bundle, mode: RecoveryMode) -> Result<RecoveryReport> {
    let mut survey = Survey::gather(bundle)?;
    let mut failures = Vec::new();

    let mut resolution = None;
    for strategy in RecoveryStrategy::ORDER {
        match survey.attempt(strategy) {
            StrategyOutcome::Recovered(found) => {
                resolution = Some(found);
                break;
            }
            StrategyOutcome::Failed(reason) => {
                tracing::debug!(strategy = %strategy, %reason, "recovery strategy failed");
                failures.push((strategy, reason));
            }
        }
    }

    let examined = survey.checked.len();
    let Some(resolution) = resolution else {
        tracing::error!(
            root = %bundle.root().display(),
            examined,
            "no valid snapshot in bundle"
        );
        return Err(StorageError::UnrecoverableBundle {
            path: bundle.root().to_path_buf(),
            examined,
        });
    };

    let previous = survey.head.map(|h| h.current);
    let mut report = RecoveryReport {
        resolution,
        previous,
        conflicts: survey.conflicts,
        failures,
        examined,
        rewrote_head: false,
    };

    tracing::info!(
        root = %bundle.root().display(),
        seq = %report.current(),
        strategy = %report.resolution.via,
        "resolved current snapshot"
    );

    if report.head_was_valid() {
        return Ok(report);
    }

    match mode {
        RecoveryMode::Repair => {
            head::write_head(bundle.root(), &HeadDoc::now(report.current()))?;
            for conflict in &report.conflicts {
                remove_if_exists(conflict)?;
            }
            report.rewrote_head = true;
            tracing::warn!(
                root = %bundle.root().display(),
                before = %previous.map_or_else(|| "none".to_string(), |s| s.to_string()),
                after = %report.current(),
                strategy = %report.resolution.via,
                conflicts_removed = report.conflicts.len(),
                "recovered HEAD"
            );
        }
        RecoveryMode::Inspect => {
            tracing::info!(
                root = %bundle.root().display(),
                before = %previous.map_or_else(|| "none".to_string(), |s| s.to_string()),
                after = %report.current(),
                "HEAD needs repair; leaving it for the writer"
            );
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Bundle with snapshots `1..=count`, HEAD on `count`.
    fn bundle_with(count: u32) -> (TempDir, Bundle) {
        let dir = TempDir::new().unwrap();
        let bundle = Bundle::create(&dir.path().join("b.labpack")).unwrap();
        let first = bundle.snapshot_path(SnapshotSeq::FIRST);
        for n in 2..=count {
            fs::copy(&first, bundle.snapshot_path(seq(n))).unwrap();
        }
        head::write_head(bundle.root(), &HeadDoc::now(seq(count))).unwrap();
        (dir, bundle)
    }

    fn seq(n: u32) -> SnapshotSeq {
        SnapshotSeq::new(n).unwrap()
    }

    fn corrupt(bundle: &Bundle, n: u32) {
        fs::write(bundle.snapshot_path(seq(n)), vec![0_u8; 8192]).unwrap();
    }

    fn write_doc(bundle: &Bundle, name: &str, n: u32, ts: i64) {
        let doc = HeadDoc { current: seq(n), ts };
        fs::write(bundle.root().join(name), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    fn head_on_disk(bundle: &Bundle) -> SnapshotSeq {
        head::read_head(&bundle.head_path()).unwrap().current
    }

    #[test]
    fn valid_head_is_used_without_writes() {
        let (_dir, bundle) = bundle_with(3);
        let before = fs::read(bundle.head_path()).unwrap();

        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.current(), seq(3));
        assert!(report.head_was_valid());
        assert!(!report.rewrote_head);
        assert_eq!(report.examined, 1);
        assert_eq!(fs::read(bundle.head_path()).unwrap(), before);
    }

    #[test]
    fn corrupt_head_target_falls_back_to_previous() {
        let (_dir, bundle) = bundle_with(5);
        corrupt(&bundle, 5);

        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.current(), seq(4));
        assert_eq!(report.resolution.via, RecoveryStrategy::DescendingScan);
        assert_eq!(report.previous, Some(seq(5)));
        assert!(report.rewrote_head);
        assert_eq!(head_on_disk(&bundle), seq(4));
    }

    #[test]
    fn scan_never_jumps_past_the_named_sequence() {
        let (_dir, bundle) = bundle_with(5);
        head::write_head(bundle.root(), &HeadDoc::now(seq(3))).unwrap();
        corrupt(&bundle, 3);

        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.current(), seq(2));
    }

    #[test]
    fn missing_or_garbled_head_uses_full_scan() {
        let (_dir, bundle) = bundle_with(3);
        fs::remove_file(bundle.head_path()).unwrap();

        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.current(), seq(3));
        assert_eq!(report.resolution.via, RecoveryStrategy::FullScan);
        assert_eq!(report.previous, None);
        assert_eq!(head_on_disk(&bundle), seq(3));

        fs::write(bundle.head_path(), b"{\"current\":").unwrap();
        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.resolution.via, RecoveryStrategy::FullScan);
        assert!(report.rewrote_head);
    }

    #[test]
    fn conflict_copy_with_higher_valid_sequence_wins() {
        let (_dir, bundle) = bundle_with(4);
        head::write_head(bundle.root(), &HeadDoc::now(seq(3))).unwrap();
        write_doc(&bundle, "HEAD (conflicted copy).json", 4, 10);

        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.current(), seq(4));
        assert_eq!(report.resolution.via, RecoveryStrategy::HeadDocuments);
        assert!(report.rewrote_head);
        assert!(head::conflict_variants(bundle.root()).is_empty());
        assert_eq!(head_on_disk(&bundle), seq(4));
    }

    #[test]
    fn conflict_copy_naming_invalid_snapshot_loses() {
        let (_dir, bundle) = bundle_with(4);
        head::write_head(bundle.root(), &HeadDoc::now(seq(3))).unwrap();
        write_doc(&bundle, "HEAD 2.json", 4, 10);
        corrupt(&bundle, 4);

        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.current(), seq(3));
        assert_eq!(report.resolution.via, RecoveryStrategy::DescendingScan);
        assert_eq!(head_on_disk(&bundle), seq(3));
        assert!(head::conflict_variants(bundle.root()).is_empty());
    }

    #[test]
    fn lower_conflict_copy_never_skips_newer_valid_snapshot() {
        let (_dir, bundle) = bundle_with(5);
        corrupt(&bundle, 5);
        write_doc(&bundle, "HEAD 2.json", 3, 10);

        let report = recover(&bundle, RecoveryMode::Repair).unwrap();
        assert_eq!(report.current(), seq(4));
        assert_eq!(report.resolution.via, RecoveryStrategy::DescendingScan);
        assert_eq!(report.previous, Some(seq(5)));
        assert_eq!(head_on_disk(&bundle), seq(4));
        assert!(head::conflict_variants(bundle.root()).is_empty());
    }

    #[test]
    fn equal_sequence_conflict_prefers_latest_timestamp() {
        let (_dir, bundle) = bundle_with(2);
        write_doc(&bundle, "HEAD.json", 2, 100);
        write_doc(&bundle, "HEAD 2.json", 2, 200);
        write_doc(&bundle, "HEAD 3.json", 2, 150);

        let report = recover(&bundle, RecoveryMode::Inspect).unwrap();
        let chosen = report.resolution.document.as_deref().unwrap();
        assert_eq!(chosen.file_name().unwrap(), "HEAD 2.json");
        assert!(!report.head_was_valid());
    }

    #[test]
    fn inspect_mode_never_writes() {
        let (_dir, bundle) = bundle_with(3);
        corrupt(&bundle, 3);
        write_doc(&bundle, "HEAD 2.json", 1, 1);
        let before = fs::read(bundle.head_path()).unwrap();

        let report = recover(&bundle, RecoveryMode::Inspect).unwrap();
        assert_eq!(report.current(), seq(2));
        assert!(!report.rewrote_head);
        assert_eq!(fs::read(bundle.head_path()).unwrap(), before);
        assert_eq!(head::conflict_variants(bundle.root()).len(), 1);
    }

    #[test]
    fn nothing_valid_is_unrecoverable() {
        let (_dir, bundle) = bundle_with(3);
        for n in 1..=3 {
            corrupt(&bundle, n);
        }
        let err = recover(&bundle, RecoveryMode::Repair).unwrap_err();
        assert!(matches!(
            err,
            StorageError::UnrecoverableBundle { examined: 3, .. }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn empty_snapshot_dir_is_unrecoverable() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("snapshots")).unwrap();
        let bundle = Bundle::open(dir.path()).unwrap();
        assert!(matches!(
            recover(&bundle, RecoveryMode::Repair),
            Err(StorageError::UnrecoverableBundle { examined: 0, .. })
        ));
    }
}
