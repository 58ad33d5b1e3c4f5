// =============================================================================
// Intent — deterministic record of a would-be trade
// =============================================================================
//
// The intent id is the idempotency key: a SHA-256 over the canonical field
// string, stable across restarts and retries. Protective prices are part of
// the hash, so any change to the bracket is a different intent.
// =============================================================================

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::parity_spec::TickRounding;
use crate::types::{Direction, TriggerReason};

/// Break-even trigger distance as a fraction of the base target.
pub const BE_TRIGGER_FRACTION: f64 = 0.65;

/// Stop distance is capped at this multiple of the base target.
pub const SL_RANGE_CAP_MULTIPLIER: f64 = 3.0;

/// The protective bracket composed at entry detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrders {
    pub stop: f64,
    pub target: f64,
    pub be_trigger: f64,
    pub be_stop: f64,
}

/// Compose the bracket for an entry. All distances are direction-signed.
pub fn compose_protective(
    direction: Direction,
    entry: f64,
    range_high: f64,
    range_low: f64,
    base_target: f64,
    tick_size: f64,
) -> ProtectiveOrders {
    let sl_points = (range_high - range_low).min(SL_RANGE_CAP_MULTIPLIER * base_target);
    let be_points = BE_TRIGGER_FRACTION * base_target;
    match direction {
        Direction::Long => ProtectiveOrders {
            stop: entry - sl_points,
            target: entry + base_target,
            be_trigger: entry + be_points,
            be_stop: entry - tick_size,
        },
        Direction::Short => ProtectiveOrders {
            stop: entry + sl_points,
            target: entry - base_target,
            be_trigger: entry - be_points,
            be_stop: entry + tick_size,
        },
    }
}

/// A fully composed trade intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub trading_date: NaiveDate,
    pub stream_id: String,
    /// Execution instrument, the one the broker trades.
    pub instrument: String,
    pub session: String,
    pub slot_time: String,
    pub direction: Direction,
    pub quantity: u32,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub be_trigger: f64,
    pub be_stop: f64,
    pub entry_time_utc: DateTime<Utc>,
    pub trigger: TriggerReason,
}

/// Fixed-precision price rendering for the hash input. Never hash raw f64
/// formatting.
fn canonical_price(p: f64) -> String {
    format!("{p:.6}")
}

impl Intent {
    /// Build an intent from an entry decision, composing the protective
    /// bracket and the deterministic id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trading_date: NaiveDate,
        stream_id: &str,
        instrument: &str,
        session: &str,
        slot_time: &str,
        direction: Direction,
        quantity: u32,
        entry_raw: f64,
        range_high: f64,
        range_low: f64,
        base_target: f64,
        tick_size: f64,
        rounding: TickRounding,
        entry_time_utc: DateTime<Utc>,
        trigger: TriggerReason,
    ) -> Self {
        let entry = rounding.round(entry_raw, tick_size);
        let protective =
            compose_protective(direction, entry, range_high, range_low, base_target, tick_size);

        let intent_id = Self::hash_id(
            trading_date,
            stream_id,
            instrument,
            session,
            slot_time,
            direction,
            entry,
            protective.stop,
            protective.target,
            protective.be_trigger,
            entry_time_utc,
            trigger,
        );

        Self {
            intent_id,
            trading_date,
            stream_id: stream_id.to_string(),
            instrument: instrument.to_string(),
            session: session.to_string(),
            slot_time: slot_time.to_string(),
            direction,
            quantity,
            entry,
            stop: protective.stop,
            target: protective.target,
            be_trigger: protective.be_trigger,
            be_stop: protective.be_stop,
            entry_time_utc,
            trigger,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn hash_id(
        trading_date: NaiveDate,
        stream_id: &str,
        instrument: &str,
        session: &str,
        slot_time: &str,
        direction: Direction,
        entry: f64,
        stop: f64,
        target: f64,
        be_trigger: f64,
        entry_time_utc: DateTime<Utc>,
        trigger: TriggerReason,
    ) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            trading_date.format("%Y-%m-%d"),
            stream_id,
            instrument,
            session,
            slot_time,
            direction,
            canonical_price(entry),
            canonical_price(stop),
            canonical_price(target),
            canonical_price(be_trigger),
            entry_time_utc.to_rfc3339_opts(SecondsFormat::Secs, true),
            trigger,
        );
        let digest = Sha256::digest(canonical.as_bytes());
        // 16 bytes of digest is ample for per-day uniqueness.
        hex::encode(&digest[..16])
    }
}
