// =============================================================================
// Timetable Contract — per-day stream directives
// =============================================================================
//
// The timetable file carries the authoritative trading_date. It is polled on
// an interval; a SHA-256 content hash guards reactivity so an unchanged file
// is a no-op. Validation failure is a per-run fatal: the engine stands down
// rather than trade against a document it cannot trust.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::time_service;

/// The only timezone the engine accepts in a timetable.
pub const REQUIRED_TIMEZONE: &str = "America/Chicago";

/// One stream directive: a (session, slot-time) decision point on an
/// instrument. `instrument` is the canonical symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub stream: String,
    pub instrument: String,
    pub session: String,
    pub slot_time: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimetableMetadata {
    #[serde(default)]
    pub replay: bool,
}

/// Parsed per-day timetable document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timetable {
    pub trading_date: String,
    pub timezone: String,
    #[serde(default)]
    pub streams: Vec<Directive>,
    #[serde(default)]
    pub metadata: Option<TimetableMetadata>,
}

impl Timetable {
    /// Validate the document and return its trading date.
    pub fn validate(&self) -> Result<NaiveDate> {
        if self.trading_date.trim().is_empty() {
            bail!("timetable has empty trading_date");
        }
        let date = NaiveDate::parse_from_str(&self.trading_date, "%Y-%m-%d")
            .with_context(|| format!("timetable trading_date {:?}", self.trading_date))?;
        if self.timezone != REQUIRED_TIMEZONE {
            bail!(
                "timetable timezone {:?} is not {REQUIRED_TIMEZONE}",
                self.timezone
            );
        }
        for d in &self.streams {
            time_service::parse_hhmm(&d.slot_time)
                .with_context(|| format!("directive {} slot_time", d.stream))?;
        }
        Ok(date)
    }

    /// The subset of directives the engine may act on.
    pub fn enabled_directives(&self) -> impl Iterator<Item = &Directive> {
        self.streams.iter().filter(|d| d.enabled)
    }

    pub fn is_replay(&self) -> bool {
        self.metadata.as_ref().map(|m| m.replay).unwrap_or(false)
    }
}

/// A timetable together with its provenance: content hash and validated date.
#[derive(Debug, Clone)]
pub struct LoadedTimetable {
    pub timetable: Timetable,
    pub content_hash: String,
    pub trading_date: NaiveDate,
}

/// Hash raw file bytes; equality means "nothing to apply".
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Read, hash, parse and validate a timetable file. This is the I/O half of
/// the poll; it runs outside the engine mutex.
pub fn load(path: impl AsRef<Path>) -> Result<LoadedTimetable> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read timetable from {}", path.display()))?;
    let hash = content_hash(&bytes);

    let timetable: Timetable = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse timetable from {}", path.display()))?;
    let trading_date = timetable.validate()?;

    debug!(
        path = %path.display(),
        trading_date = %trading_date,
        hash = %&hash[..12],
        directives = timetable.streams.len(),
        "timetable loaded"
    );

    Ok(LoadedTimetable {
        timetable,
        content_hash: hash,
        trading_date,
    })
}
