// =============================================================================
// Range computation and gap tolerance
// =============================================================================
//
// The authoritative range values are produced once, retrospectively, from the
// closed window. Gap accounting is evaluated over the sorted in-window bars
// so late backfill and precedence replacement cannot depend on arrival order.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::market_data::Bar;
use crate::parity_spec::TickRounding;
use crate::types::Direction;

/// Single open-to-open gap limit, minutes.
pub const SINGLE_GAP_LIMIT_MIN: f64 = 3.0;

/// Budget for cumulative missing minutes across the window.
pub const CUMULATIVE_GAP_BUDGET_MIN: f64 = 6.0;

/// Tighter gap limit inside the final minutes before slot-time.
pub const LATE_WINDOW_GAP_LIMIT_MIN: f64 = 2.0;

/// Length of the tighter late window, minutes before slot-time.
pub const LATE_WINDOW_MINUTES: i64 = 10;

/// Why a range was invalidated by gap accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum GapViolation {
    SingleGap { minutes: f64 },
    CumulativeBudget { missing_minutes: f64 },
    LateWindowGap { minutes: f64 },
}

impl std::fmt::Display for GapViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleGap { minutes } => {
                write!(f, "single open-to-open gap of {minutes:.1} min")
            }
            Self::CumulativeBudget { missing_minutes } => {
                write!(f, "cumulative missing minutes {missing_minutes:.1}")
            }
            Self::LateWindowGap { minutes } => {
                write!(f, "gap of {minutes:.1} min inside the late window")
            }
        }
    }
}

/// Evaluate the gap rules over sorted in-window bars.
///
/// Gaps are Chicago open-to-open elapsed minutes between consecutive accepted
/// bars; since the window bounds are fixed instants, UTC deltas are
/// equivalent. Returns the first violation found, scanning chronologically.
pub fn evaluate_gaps(
    bars: &[&Bar],
    slot_time_utc: DateTime<Utc>,
) -> Option<GapViolation> {
    let late_window_start =
        slot_time_utc - chrono::Duration::minutes(LATE_WINDOW_MINUTES);
    let mut missing_minutes = 0.0_f64;

    for pair in bars.windows(2) {
        let prev = pair[0];
        let cur = pair[1];
        let g = (cur.open_utc - prev.open_utc).num_seconds() as f64 / 60.0;

        if g > SINGLE_GAP_LIMIT_MIN {
            return Some(GapViolation::SingleGap { minutes: g });
        }
        if cur.open_utc >= late_window_start && g > LATE_WINDOW_GAP_LIMIT_MIN {
            return Some(GapViolation::LateWindowGap { minutes: g });
        }
        missing_minutes += (g - 1.0).max(0.0);
        if missing_minutes > CUMULATIVE_GAP_BUDGET_MIN {
            return Some(GapViolation::CumulativeBudget { missing_minutes });
        }
    }
    None
}

/// Why retrospective range computation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RangeFailure {
    NoBarsInWindow,
    InvalidRangeHighLow,
    NoFreezeClose,
}

impl std::fmt::Display for RangeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBarsInWindow => write!(f, "NO_BARS_IN_WINDOW"),
            Self::InvalidRangeHighLow => write!(f, "INVALID_RANGE_HIGH_LOW"),
            Self::NoFreezeClose => write!(f, "NO_FREEZE_CLOSE"),
        }
    }
}

/// The locked opening range and its derived breakout levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LockedRange {
    pub high: f64,
    pub low: f64,
    pub freeze_close: f64,
    pub brk_long: f64,
    pub brk_short: f64,
}

/// Compute the authoritative range from the closed window, once.
pub fn compute_range(
    bars: &[&Bar],
    tick_size: f64,
    rounding: TickRounding,
) -> Result<LockedRange, RangeFailure> {
    if bars.is_empty() {
        return Err(RangeFailure::NoBarsInWindow);
    }

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    for bar in bars {
        high = high.max(bar.high);
        low = low.min(bar.low);
    }
    if high < low || !high.is_finite() || !low.is_finite() {
        return Err(RangeFailure::InvalidRangeHighLow);
    }

    let freeze_close = bars.last().map(|b| b.close).ok_or(RangeFailure::NoFreezeClose)?;

    Ok(LockedRange {
        high,
        low,
        freeze_close,
        brk_long: rounding.round(high + tick_size, tick_size),
        brk_short: rounding.round(low - tick_size, tick_size),
    })
}

impl LockedRange {
    /// Immediate-at-lock evaluation, run once on the transition into
    /// RANGE_LOCKED. Both sides firing picks the breakout nearer to the
    /// freeze close; ties break to Long.
    pub fn immediate_entry(&self) -> Option<Direction> {
        let long = self.freeze_close >= self.brk_long;
        let short = self.freeze_close <= self.brk_short;
        match (long, short) {
            (true, false) => Some(Direction::Long),
            (false, true) => Some(Direction::Short),
            (true, true) => {
                let to_long = (self.freeze_close - self.brk_long).abs();
                let to_short = (self.freeze_close - self.brk_short).abs();
                if to_long <= to_short {
                    Some(Direction::Long)
                } else {
                    Some(Direction::Short)
                }
            }
            (false, false) => None,
        }
    }

    /// Post-lock breakout evaluation for one bar. Both sides on the same bar
    /// choose Long deterministically.
    pub fn breakout_on_bar(&self, bar: &Bar) -> Option<Direction> {
        let long = bar.high >= self.brk_long;
        let short = bar.low <= self.brk_short;
        match (long, short) {
            (true, _) => Some(Direction::Long),
            (false, true) => Some(Direction::Short),
            (false, false) => None,
        }
    }

    /// Entry price for a direction: always the rounded breakout level.
    pub fn entry_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.brk_long,
            Direction::Short => self.brk_short,
        }
    }
}

/// Window membership: `range_start <= open < slot_time`. The bounds are
/// constructed from Chicago civil time, so the UTC comparison carries the
/// Chicago window exactly.
pub fn in_range_window(
    open_utc: DateTime<Utc>,
    range_start_utc: DateTime<Utc>,
    slot_time_utc: DateTime<Utc>,
) -> bool {
    open_utc >= range_start_utc && open_utc < slot_time_utc
}
