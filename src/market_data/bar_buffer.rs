// =============================================================================
// Bar buffer — per-stream 1-minute bars, deduplicated by open timestamp
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::BarSource;

/// Nominal bar period. A bar younger than this is still forming and is
/// rejected as partial.
pub const BAR_PERIOD_SECS: i64 = 60;

/// A single 1-minute OHLC bar. The timestamp is the bar open in UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open_utc: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    pub source: BarSource,
}

impl Bar {
    /// OHLC sanity: `H >= L` and `C` within `[L, H]`.
    pub fn is_valid_ohlc(&self) -> bool {
        self.high >= self.low && self.close >= self.low && self.close <= self.high
    }
}

/// Outcome of a buffer insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarInsert {
    Inserted,
    /// An existing bar at the same open was replaced by a higher-precedence
    /// source; the displaced source is carried for diagnostics.
    Replaced(BarSource),
    RejectedDuplicate,
    RejectedPartial,
    RejectedInvalidOhlc,
}

impl BarInsert {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced(_))
    }
}

/// Categorised per-stream bar rejection counters. Surfaced in the heartbeat
/// and the run summary.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RejectionStats {
    pub partial: u64,
    pub duplicate: u64,
    pub invalid_ohlc: u64,
    pub out_of_window: u64,
}

impl RejectionStats {
    pub fn total(&self) -> u64 {
        self.partial + self.duplicate + self.invalid_ohlc + self.out_of_window
    }
}

/// Bars keyed by open-UTC. At most one bar per key; ties resolve by source
/// precedence (LIVE > BARSREQUEST > CSV), strictly-higher replaces.
#[derive(Debug, Default)]
pub struct BarBuffer {
    bars: BTreeMap<DateTime<Utc>, Bar>,
}

impl BarBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a bar, enforcing OHLC sanity, the partial-bar rule and the
    /// duplicate-precedence rule. `now` decides partiality.
    pub fn insert(&mut self, bar: Bar, now: DateTime<Utc>) -> BarInsert {
        if !bar.is_valid_ohlc() {
            return BarInsert::RejectedInvalidOhlc;
        }
        if now - bar.open_utc < Duration::seconds(BAR_PERIOD_SECS) {
            return BarInsert::RejectedPartial;
        }

        match self.bars.get(&bar.open_utc) {
            None => {
                self.bars.insert(bar.open_utc, bar);
                BarInsert::Inserted
            }
            Some(existing) => {
                if bar.source.precedence() > existing.source.precedence() {
                    let displaced = existing.source;
                    self.bars.insert(bar.open_utc, bar);
                    BarInsert::Replaced(displaced)
                } else {
                    BarInsert::RejectedDuplicate
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }

    /// All bars in open-time order.
    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.values()
    }

    /// Bars with `start <= open_utc < end`, in open-time order.
    pub fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Iterator<Item = &Bar> {
        self.bars.range(start..end).map(|(_, b)| b)
    }

    pub fn get(&self, open_utc: DateTime<Utc>) -> Option<&Bar> {
        self.bars.get(&open_utc)
    }
}
