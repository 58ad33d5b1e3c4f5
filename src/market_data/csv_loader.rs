// =============================================================================
// CSV loader — dry-run pre-hydration bars
// =============================================================================
//
// Dry-run mode hydrates opening-range bars from the conventional path
// `data/raw/{instrument_lower}/1m/{YYYY}/{MM}/{INSTR}_1m_{YYYY-MM-DD}.csv`
// with header `timestamp_utc,open,high,low,close[,volume]`.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::info;

use super::bar_buffer::Bar;
use crate::types::BarSource;

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp_utc: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
}

/// The conventional pre-hydration file path for an instrument and date.
pub fn prehydration_path(data_root: &Path, instrument: &str, date: NaiveDate) -> PathBuf {
    data_root
        .join("raw")
        .join(instrument.to_lowercase())
        .join("1m")
        .join(date.format("%Y").to_string())
        .join(date.format("%m").to_string())
        .join(format!(
            "{}_1m_{}.csv",
            instrument.to_uppercase(),
            date.format("%Y-%m-%d")
        ))
}

/// Timestamps arrive as RFC 3339 or as naive `YYYY-MM-DD HH:MM:SS` (UTC).
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("unparseable timestamp_utc {raw:?}"))?;
    Ok(naive.and_utc())
}

/// Read every row of a pre-hydration CSV as a `Csv`-sourced bar.
///
/// Runs outside the engine mutex; the parsed bars are handed to the stream
/// afterwards. Any malformed row fails the whole load (a half-hydrated range
/// is worse than none).
pub fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open pre-hydration csv {}", path.display()))?;

    let mut bars = Vec::new();
    for (idx, row) in reader.deserialize::<CsvRow>().enumerate() {
        let row = row.with_context(|| {
            format!("malformed row {} in {}", idx + 2, path.display())
        })?;
        let open_utc = parse_timestamp(&row.timestamp_utc)
            .with_context(|| format!("row {} in {}", idx + 2, path.display()))?;
        bars.push(Bar {
            open_utc,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            source: BarSource::Csv,
        });
    }

    info!(path = %path.display(), bars = bars.len(), "pre-hydration csv loaded");
    Ok(bars)
}
