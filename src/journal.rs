// =============================================================================
// Journals — append-only stream state journals and execution journal
// =============================================================================
//
// Stream journals let a restart within the same trading-date reattach to
// committed streams and refuse to re-run them. The execution journal is the
// idempotency source of truth for intent submission: an intent-id is
// submitted at most once per run history.
//
// Both are JSONL, single-writer, append-only. A line that fails to parse is
// journal corruption: the corruption handler fires and the engine stands the
// affected stream down rather than trade on half-trusted state.
// =============================================================================

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{CommitReason, EventKind, StreamState};

/// Sentinel stream-id passed to the corruption handler when a corrupt line
/// cannot be attributed to a single stream. The engine treats it as "stand
/// down everything".
pub const CORRUPTION_ALL_STREAMS: &str = "*";

// ---------------------------------------------------------------------------
// Stream journal
// ---------------------------------------------------------------------------

/// One state-transition record for a (trading-date, stream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamJournalRecord {
    pub trading_date: NaiveDate,
    pub stream_id: String,
    pub state: StreamState,
    pub committed: bool,
    #[serde(default)]
    pub commit_reason: Option<CommitReason>,
    pub last_update_utc: DateTime<Utc>,
    #[serde(default)]
    pub timetable_hash: Option<String>,
}

/// Per-(trading-date, stream) JSONL store under `<root>/journals/`.
#[derive(Debug, Clone)]
pub struct JournalStore {
    root: PathBuf,
}

impl JournalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stream_path(&self, date: NaiveDate, stream_id: &str) -> PathBuf {
        self.root
            .join("journals")
            .join(date.format("%Y-%m-%d").to_string())
            .join(format!("{stream_id}.jsonl"))
    }

    /// Append one record. The parent directory is created on first write.
    pub fn append(&self, rec: &StreamJournalRecord) -> Result<()> {
        let path = self.stream_path(rec.trading_date, &rec.stream_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create journal dir {}", parent.display()))?;
        }
        let line = serde_json::to_string(rec).context("failed to serialise journal record")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append journal {}", path.display()))?;
        file.flush()?;
        Ok(())
    }

    /// Read the last record for a (date, stream), if the journal exists.
    ///
    /// A trailing line that fails to parse is corruption and returns an
    /// error; the caller decides the stand-down.
    pub fn load_last(
        &self,
        date: NaiveDate,
        stream_id: &str,
    ) -> Result<Option<StreamJournalRecord>> {
        let path = self.stream_path(date, stream_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read journal {}", path.display()))
            }
        };

        let mut last = None;
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let rec: StreamJournalRecord = serde_json::from_str(line).with_context(|| {
                format!("corrupt journal line {} in {}", idx + 1, path.display())
            })?;
            last = Some(rec);
        }
        Ok(last)
    }
}

// ---------------------------------------------------------------------------
// Execution journal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionEvent {
    Submission,
    Rejection,
}

/// One execution-lifecycle record for an intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub intent_id: String,
    pub trading_date: NaiveDate,
    pub stream_id: String,
    pub event: ExecutionEvent,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    pub at_utc: DateTime<Utc>,
}

/// Outcome of a submission attempt against the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Recorded,
    Duplicate,
}

pub type CorruptionHandler = Box<dyn Fn(&str) + Send + Sync>;
pub type CostHandler = Box<dyn Fn(f64) + Send + Sync>;

/// Per-trading-date execution journal with in-memory idempotency index.
pub struct ExecutionJournal {
    path: PathBuf,
    submitted: RwLock<HashSet<String>>,
    on_corruption: RwLock<Option<CorruptionHandler>>,
    on_cost: RwLock<Option<CostHandler>>,
}

impl ExecutionJournal {
    /// Open (or create) the journal for `date` under `<root>/executions/`,
    /// replaying existing records into the idempotency index. Corrupt lines
    /// are remembered and replayed through the corruption handler as soon as
    /// one is installed.
    pub fn open(root: impl AsRef<Path>, date: NaiveDate) -> Result<(Self, Vec<String>)> {
        let dir = root.as_ref().join("executions");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create execution journal dir {}", dir.display()))?;
        let path = dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")));

        let mut submitted = HashSet::new();
        let mut corrupt_streams = Vec::new();

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for (idx, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ExecutionRecord>(line) {
                        Ok(rec) => {
                            if rec.event == ExecutionEvent::Submission {
                                submitted.insert(rec.intent_id);
                            }
                        }
                        Err(e) => {
                            warn!(
                                event = %EventKind::JournalCorruption,
                                path = %path.display(),
                                line = idx + 1,
                                error = %e,
                                "corrupt execution journal line"
                            );
                            corrupt_streams.push(extract_stream_id(line));
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read execution journal {}", path.display()))
            }
        }

        debug!(
            path = %path.display(),
            submitted = submitted.len(),
            corrupt = corrupt_streams.len(),
            "execution journal opened"
        );

        Ok((
            Self {
                path,
                submitted: RwLock::new(submitted),
                on_corruption: RwLock::new(None),
                on_cost: RwLock::new(None),
            },
            corrupt_streams,
        ))
    }

    /// Install the handler that stands down the stream a corrupt record
    /// belongs to.
    pub fn set_corruption_handler(&self, handler: CorruptionHandler) {
        *self.on_corruption.write() = Some(handler);
    }

    /// Install the handler that surfaces execution costs to the run summary.
    pub fn set_cost_handler(&self, handler: CostHandler) {
        *self.on_cost.write() = Some(handler);
    }

    pub fn is_intent_submitted(&self, intent_id: &str) -> bool {
        self.submitted.read().contains(intent_id)
    }

    /// Record a submission. Duplicates are rejected without touching disk.
    pub fn record_submission(
        &self,
        intent_id: &str,
        trading_date: NaiveDate,
        stream_id: &str,
        broker_order_id: Option<String>,
        cost: Option<f64>,
        at_utc: DateTime<Utc>,
    ) -> Result<SubmissionOutcome> {
        {
            let mut set = self.submitted.write();
            if set.contains(intent_id) {
                return Ok(SubmissionOutcome::Duplicate);
            }
            set.insert(intent_id.to_string());
        }

        let rec = ExecutionRecord {
            intent_id: intent_id.to_string(),
            trading_date,
            stream_id: stream_id.to_string(),
            event: ExecutionEvent::Submission,
            broker_order_id,
            error: None,
            cost,
            at_utc,
        };
        self.append(&rec, stream_id)?;

        if let Some(cost) = cost {
            if let Some(handler) = self.on_cost.read().as_ref() {
                handler(cost);
            }
        }
        Ok(SubmissionOutcome::Recorded)
    }

    /// Record a rejection for an intent.
    pub fn record_rejection(
        &self,
        intent_id: &str,
        trading_date: NaiveDate,
        stream_id: &str,
        error: String,
        at_utc: DateTime<Utc>,
    ) -> Result<()> {
        let rec = ExecutionRecord {
            intent_id: intent_id.to_string(),
            trading_date,
            stream_id: stream_id.to_string(),
            event: ExecutionEvent::Rejection,
            broker_order_id: None,
            error: Some(error),
            cost: None,
            at_utc,
        };
        self.append(&rec, stream_id)
    }

    fn append(&self, rec: &ExecutionRecord, stream_id: &str) -> Result<()> {
        let line = serde_json::to_string(rec).context("failed to serialise execution record")?;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}").and_then(|_| f.flush()));

        if let Err(e) = result {
            warn!(
                event = %EventKind::JournalCorruption,
                path = %self.path.display(),
                stream = stream_id,
                error = %e,
                "execution journal append failed"
            );
            if let Some(handler) = self.on_corruption.read().as_ref() {
                handler(stream_id);
            }
            return Err(e)
                .with_context(|| format!("failed to append execution journal {}", self.path.display()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionJournal")
            .field("path", &self.path)
            .field("submitted", &self.submitted.read().len())
            .finish()
    }
}

/// Best-effort stream-id extraction from a corrupt JSONL fragment. Falls back
/// to the all-streams sentinel when the fragment gives nothing to go on.
fn extract_stream_id(line: &str) -> String {
    if let Some(idx) = line.find("\"stream_id\":\"") {
        let rest = &line[idx + 13..];
        if let Some(end) = rest.find('"') {
            let id = &rest[..end];
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    CORRUPTION_ALL_STREAMS.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 15).unwrap()
    }

    fn now() -> DateTime<Utc> {
        "2025-07-15T14:30:00Z".parse().unwrap()
    }

    fn sample_record(state: StreamState, committed: bool) -> StreamJournalRecord {
        StreamJournalRecord {
            trading_date: date(),
            stream_id: "ES1".to_string(),
            state,
            committed,
            commit_reason: committed.then_some(CommitReason::NoTradeMarketClose),
            last_update_utc: now(),
            timetable_hash: Some("abc123".to_string()),
        }
    }

    #[test]
    fn stream_journal_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());

        assert!(store.load_last(date(), "ES1").unwrap().is_none());

        store.append(&sample_record(StreamState::Armed, false)).unwrap();
        store.append(&sample_record(StreamState::Done, true)).unwrap();

        let last = store.load_last(date(), "ES1").unwrap().unwrap();
        assert_eq!(last.state, StreamState::Done);
        assert!(last.committed);
        assert_eq!(last.commit_reason, Some(CommitReason::NoTradeMarketClose));
    }

    #[test]
    fn stream_journal_corrupt_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::new(dir.path());
        store.append(&sample_record(StreamState::Armed, false)).unwrap();

        // Simulate a partial write.
        let path = dir
            .path()
            .join("journals")
            .join("2025-07-15")
            .join("ES1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"trading_date\":\"2025-07-15\",\"stream_id\":\"ES");
        std::fs::write(&path, content).unwrap();

        assert!(store.load_last(date(), "ES1").is_err());
    }

    #[test]
    fn execution_journal_idempotency() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, corrupt) = ExecutionJournal::open(dir.path(), date()).unwrap();
        assert!(corrupt.is_empty());

        assert!(!journal.is_intent_submitted("abc"));
        let first = journal
            .record_submission("abc", date(), "ES1", Some("B-1".into()), Some(4.12), now())
            .unwrap();
        assert_eq!(first, SubmissionOutcome::Recorded);
        assert!(journal.is_intent_submitted("abc"));

        let second = journal
            .record_submission("abc", date(), "ES1", Some("B-2".into()), None, now())
            .unwrap();
        assert_eq!(second, SubmissionOutcome::Duplicate);
    }

    #[test]
    fn execution_journal_replays_submissions_across_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (journal, _) = ExecutionJournal::open(dir.path(), date()).unwrap();
            journal
                .record_submission("abc", date(), "ES1", None, None, now())
                .unwrap();
            journal
                .record_rejection("def", date(), "ES2", "broker said no".into(), now())
                .unwrap();
        }
        let (journal, corrupt) = ExecutionJournal::open(dir.path(), date()).unwrap();
        assert!(corrupt.is_empty());
        assert!(journal.is_intent_submitted("abc"));
        // Rejections do not count as submissions.
        assert!(!journal.is_intent_submitted("def"));
    }

    #[test]
    fn execution_journal_reports_corrupt_lines_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join("2025-07-15.jsonl"),
            "{\"intent_id\":\"x\",\"stream_id\":\"ES1\",garbage\n",
        )
        .unwrap();

        let (_, corrupt) = ExecutionJournal::open(dir.path(), date()).unwrap();
        assert_eq!(corrupt, vec!["ES1".to_string()]);
    }

    #[test]
    fn unattributable_corruption_maps_to_all_streams() {
        assert_eq!(extract_stream_id("total garbage"), CORRUPTION_ALL_STREAMS);
        assert_eq!(extract_stream_id("{\"stream_id\":\"ES2\",..."), "ES2");
    }

    #[test]
    fn cost_handler_fires_on_submission() {
        let dir = tempfile::tempdir().unwrap();
        let (journal, _) = ExecutionJournal::open(dir.path(), date()).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        journal.set_cost_handler(Box::new(move |cost| {
            assert!(cost > 0.0);
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        journal
            .record_submission("abc", date(), "ES1", None, Some(4.12), now())
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
