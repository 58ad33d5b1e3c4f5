// =============================================================================
// Execution Summary — per-run outcome record, written at shutdown
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;

use crate::market_data::RejectionStats;
use crate::types::{CommitReason, EventKind, ExecutionMode, StreamState};

/// Final outcome of one stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamOutcome {
    pub stream_id: String,
    pub state: StreamState,
    pub commit_reason: Option<CommitReason>,
    pub bar_rejections: RejectionStats,
}

/// Engine-level bar rejection counters (before stream dispatch).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineBarRejects {
    pub future_bar: u64,
    pub trading_date_unlocked: u64,
    pub out_of_session: u64,
    pub unknown_instrument: u64,
}

impl EngineBarRejects {
    pub fn total(&self) -> u64 {
        self.future_bar + self.trading_date_unlocked + self.out_of_session + self.unknown_instrument
    }
}

/// The per-run execution summary.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub mode: ExecutionMode,
    pub trading_date: Option<NaiveDate>,
    pub started_utc: Option<DateTime<Utc>>,
    pub stopped_utc: DateTime<Utc>,
    pub entries_submitted: usize,
    pub no_trades: usize,
    pub stand_downs: usize,
    pub execution_costs: f64,
    pub engine_bar_rejects: EngineBarRejects,
    pub streams: Vec<StreamOutcome>,
}

impl ExecutionSummary {
    /// Derive the aggregate counters from the stream outcomes.
    pub fn tally(&mut self) {
        self.entries_submitted = self
            .streams
            .iter()
            .filter(|s| s.commit_reason == Some(CommitReason::EntrySubmitted))
            .count();
        self.no_trades = self
            .streams
            .iter()
            .filter(|s| {
                matches!(
                    s.commit_reason,
                    Some(CommitReason::NoTradeMarketClose)
                        | Some(CommitReason::NoTradeRangeDataMissing)
                        | Some(CommitReason::RangeInvalidated)
                )
            })
            .count();
        self.stand_downs = self
            .streams
            .iter()
            .filter(|s| s.commit_reason == Some(CommitReason::StreamStandDown))
            .count();
    }

    /// Write `summaries/<run_id>.json` atomically (tmp + rename).
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create summary dir {}", dir.display()))?;
        let path = dir.join(format!("{}.json", self.run_id));
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise execution summary")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp summary {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp summary to {}", path.display()))?;

        info!(
            event = %EventKind::SummaryWritten,
            path = %path.display(),
            streams = self.streams.len(),
            entries = self.entries_submitted,
            "execution summary written"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, reason: Option<CommitReason>) -> StreamOutcome {
        StreamOutcome {
            stream_id: id.to_string(),
            state: StreamState::Done,
            commit_reason: reason,
            bar_rejections: RejectionStats::default(),
        }
    }

    fn sample() -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            run_id: "run-test".into(),
            mode: ExecutionMode::Sim,
            trading_date: NaiveDate::from_ymd_opt(2025, 1, 15),
            started_utc: Some("2025-01-15T13:00:00Z".parse().unwrap()),
            stopped_utc: "2025-01-15T22:05:00Z".parse().unwrap(),
            entries_submitted: 0,
            no_trades: 0,
            stand_downs: 0,
            execution_costs: 8.24,
            engine_bar_rejects: EngineBarRejects::default(),
            streams: vec![
                outcome("ES1", Some(CommitReason::EntrySubmitted)),
                outcome("ES2", Some(CommitReason::NoTradeMarketClose)),
                outcome("ES3", Some(CommitReason::RangeInvalidated)),
                outcome("ES4", Some(CommitReason::StreamStandDown)),
            ],
        };
        summary.tally();
        summary
    }

    #[test]
    fn tally_buckets_outcomes() {
        let summary = sample();
        assert_eq!(summary.entries_submitted, 1);
        assert_eq!(summary.no_trades, 2);
        assert_eq!(summary.stand_downs, 1);
    }

    #[test]
    fn write_produces_parseable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample().write(dir.path()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["run_id"], "run-test");
        assert_eq!(parsed["streams"].as_array().unwrap().len(), 4);
        assert_eq!(parsed["entries_submitted"], 1);
        // No stray tmp file.
        assert!(!dir.path().join("run-test.json.tmp").exists());
    }
}
