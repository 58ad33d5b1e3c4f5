// =============================================================================
// Parity Spec — static description of sessions, instruments and rounding
// =============================================================================
//
// Loaded once at startup and immutable afterwards. Any structural defect
// fails the load and the engine refuses to start.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::time_service;

/// A named trading session: where its opening range starts and which
/// slot-end times a timetable may request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    pub range_start_time: String,
    pub slot_end_times: Vec<String>,
}

/// Per-instrument contract parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub tick_size: f64,
    pub base_target: f64,
    #[serde(default)]
    pub is_micro: bool,
    #[serde(default)]
    pub base_instrument: Option<String>,
}

/// Tick-rounding method declared by the spec file. Only half-up is in use;
/// the enum keeps the wire format explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickRounding {
    HalfUp,
}

impl Default for TickRounding {
    fn default() -> Self {
        Self::HalfUp
    }
}

impl TickRounding {
    /// Round `price` to the nearest multiple of `tick`.
    pub fn round(self, price: f64, tick: f64) -> f64 {
        match self {
            // f64::round ties away from zero, which is half-up for the
            // positive prices this engine deals in.
            Self::HalfUp => (price / tick).round() * tick,
        }
    }
}

/// Immutable snapshot of the parity spec file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParitySpec {
    pub sessions: HashMap<String, SessionSpec>,
    pub instruments: HashMap<String, InstrumentSpec>,
    pub market_close_time: String,
    #[serde(default)]
    pub tick_rounding: TickRounding,
}

impl ParitySpec {
    /// Load and validate the spec from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read parity spec from {}", path.display()))?;
        let spec: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse parity spec from {}", path.display()))?;
        spec.validate()?;

        info!(
            path = %path.display(),
            sessions = spec.sessions.len(),
            instruments = spec.instruments.len(),
            market_close = %spec.market_close_time,
            "parity spec loaded"
        );
        Ok(spec)
    }

    /// Structural validation. Every defect is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            bail!("parity spec has no sessions");
        }
        if self.instruments.is_empty() {
            bail!("parity spec has no instruments");
        }
        time_service::parse_hhmm(&self.market_close_time)
            .context("parity spec market_close_time")?;

        for (name, session) in &self.sessions {
            if session.slot_end_times.is_empty() {
                bail!("session {name} has no slot_end_times");
            }
            time_service::parse_hhmm(&session.range_start_time)
                .with_context(|| format!("session {name} range_start_time"))?;
            for slot in &session.slot_end_times {
                time_service::parse_hhmm(slot)
                    .with_context(|| format!("session {name} slot_end_time {slot}"))?;
            }
        }

        for (symbol, inst) in &self.instruments {
            if inst.tick_size <= 0.0 {
                bail!("instrument {symbol} has non-positive tick_size {}", inst.tick_size);
            }
            if inst.base_target <= 0.0 {
                bail!("instrument {symbol} has non-positive base_target {}", inst.base_target);
            }
            if inst.is_micro {
                let base = inst
                    .base_instrument
                    .as_deref()
                    .with_context(|| format!("micro instrument {symbol} missing base_instrument"))?;
                if !self.instruments.contains_key(base) {
                    bail!("micro instrument {symbol} maps to unknown base {base}");
                }
            }
        }
        Ok(())
    }

    pub fn session(&self, name: &str) -> Option<&SessionSpec> {
        self.sessions.get(name)
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentSpec> {
        self.instruments.get(symbol)
    }

    /// Resolve the canonical symbol for `symbol`: micros map to their base,
    /// everything else is already canonical.
    pub fn canonical_of<'a>(&'a self, symbol: &'a str) -> &'a str {
        match self.instruments.get(symbol) {
            Some(inst) if inst.is_micro => inst.base_instrument.as_deref().unwrap_or(symbol),
            _ => symbol,
        }
    }

    /// Whether `slot_time` is one of the session's permitted slot-end times.
    pub fn slot_permitted(&self, session: &str, slot_time: &str) -> bool {
        self.session(session)
            .map(|s| s.slot_end_times.iter().any(|t| t == slot_time))
            .unwrap_or(false)
    }
}
