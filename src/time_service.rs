// =============================================================================
// Time Service — Chicago civil time is authoritative, UTC is derived
// =============================================================================
//
// Every slot-time, range-start and market-close in the parity spec is a
// Chicago wall-clock string. This module owns the one correct way to turn
// (trading-date, "HH:MM") into an absolute instant, including both DST edge
// cases:
//   - fall-back fold: the civil time exists twice; resolve to the earlier
//     offset and emit DST_TRANSITION_DETECTED.
//   - spring-forward gap: the civil time does not exist; walk forward to the
//     first valid minute and emit the same diagnostic.
// =============================================================================

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::America::Chicago;
use chrono_tz::Tz;
use tracing::warn;

use crate::types::EventKind;

/// Parse an `"HH:MM"` wall-clock string. Rejects anything else synchronously.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| anyhow!("invalid HH:MM time string {s:?}: {e}"))
}

/// Construct the absolute instant for `date` at `hhmm` Chicago wall-clock.
///
/// The returned value is the zoned Chicago time; callers derive UTC from it
/// via [`chicago_to_utc`]. Invalid `hhmm` input fails synchronously.
pub fn construct_chicago(date: NaiveDate, hhmm: &str) -> Result<DateTime<Tz>> {
    let time = parse_hhmm(hhmm)?;
    let naive = date.and_time(time);

    match Chicago.from_local_datetime(&naive) {
        chrono::LocalResult::Single(zoned) => Ok(zoned),
        chrono::LocalResult::Ambiguous(earlier, _later) => {
            warn!(
                event = %EventKind::DstTransitionDetected,
                civil = %naive,
                "ambiguous Chicago civil time, resolving to earlier offset"
            );
            Ok(earlier)
        }
        chrono::LocalResult::None => {
            // Spring-forward gap. Walk forward minute by minute until the
            // civil time exists again (the gap is at most one hour).
            let mut probe = naive;
            for _ in 0..120 {
                probe += Duration::minutes(1);
                if let chrono::LocalResult::Single(zoned) =
                    Chicago.from_local_datetime(&probe)
                {
                    warn!(
                        event = %EventKind::DstTransitionDetected,
                        civil = %naive,
                        resolved = %zoned,
                        "nonexistent Chicago civil time, resolved forward"
                    );
                    return Ok(zoned);
                }
            }
            Err(anyhow!("could not resolve Chicago civil time {naive}"))
        }
    }
}

/// Derive UTC from a zoned Chicago value.
pub fn chicago_to_utc(zoned: &DateTime<Tz>) -> DateTime<Utc> {
    zoned.with_timezone(&Utc)
}

/// Convert an absolute instant into Chicago zoned time.
pub fn utc_to_chicago(instant: DateTime<Utc>) -> DateTime<Tz> {
    instant.with_timezone(&Chicago)
}

/// The Chicago calendar date an instant falls on.
pub fn chicago_date_of(instant: DateTime<Utc>) -> NaiveDate {
    utc_to_chicago(instant).date_naive()
}

/// Convenience: construct and immediately derive the UTC instant.
pub fn construct_chicago_utc(date: NaiveDate, hhmm: &str) -> Result<DateTime<Utc>> {
    Ok(chicago_to_utc(&construct_chicago(date, hhmm)?))
}
