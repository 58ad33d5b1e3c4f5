// =============================================================================
// Execution Adapter — broker abstraction plus the dry-run and sim adapters
// =============================================================================
//
// The engine sees a small synchronous capability set; the concrete broker
// lives behind it. Orders the robot owns are identified by a strict tag
// prefix so recovery can cancel its own orders and nothing else.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stream::intent::Intent;
use crate::types::Direction;

/// Strict tag prefix on every order the robot submits. Recovery cancels
/// working orders carrying this prefix and nothing else.
pub const ROBOT_TAG_PREFIX: &str = "MRDN-";

pub fn robot_tag(intent_id: &str, suffix: &str) -> String {
    format!("{ROBOT_TAG_PREFIX}{intent_id}-{suffix}")
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Outcome of an entry submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub success: bool,
    pub broker_order_id: Option<String>,
    pub error: Option<String>,
}

impl SubmitResult {
    pub fn ok(broker_order_id: String) -> Self {
        Self {
            success: true,
            broker_order_id: Some(broker_order_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            broker_order_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenResult {
    Flattened,
    AlreadyFlat,
    Failed,
}

/// A broker-side position. `quantity` is signed; zero means flat.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerPosition {
    pub instrument: String,
    pub quantity: i64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkingOrderKind {
    Stop,
    Target,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkingOrder {
    pub order_id: String,
    pub tag: String,
    pub instrument: String,
    pub kind: WorkingOrderKind,
    pub price: f64,
    pub quantity: i64,
}

impl WorkingOrder {
    pub fn is_robot_owned(&self) -> bool {
        self.tag.starts_with(ROBOT_TAG_PREFIX)
    }
}

/// Point-in-time account state used by the recovery runner.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountSnapshot {
    pub positions: Vec<BrokerPosition>,
    pub working_orders: Vec<WorkingOrder>,
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

/// Optional engine-specific capability, acquired by dynamic check. Adapters
/// that can re-establish protective brackets during recovery implement it.
pub trait RecoverySupport {
    /// Re-submit the stop/target bracket for a previously filled intent.
    /// Returns false when the adapter no longer knows the intent.
    fn resubmit_protective_orders(&self, intent_id: &str, now: DateTime<Utc>) -> bool;
}

/// The broker capability set. All methods are synchronous from the engine's
/// perspective; cancellation is idempotent best-effort.
pub trait ExecutionAdapter: Send + Sync {
    fn submit_entry_order(&self, intent: &Intent, now: DateTime<Utc>) -> SubmitResult;

    fn get_account_snapshot(&self, now: DateTime<Utc>) -> AccountSnapshot;

    /// Cancel robot-owned working orders present in `snapshot`. Returns the
    /// number cancelled.
    fn cancel_robot_owned_working_orders(
        &self,
        snapshot: &AccountSnapshot,
        now: DateTime<Utc>,
    ) -> usize;

    fn flatten_intent(&self, intent_id: &str, instrument: &str, now: DateTime<Utc>)
        -> FlattenResult;

    /// Cancel all orders belonging to an intent. Returns true when nothing
    /// belonging to the intent remains working.
    fn cancel_intent_orders(&self, intent_id: &str, now: DateTime<Utc>) -> bool;

    /// Dynamic acquisition of the optional recovery capability.
    fn as_recovery_support(&self) -> Option<&dyn RecoverySupport> {
        None
    }
}

// ---------------------------------------------------------------------------
// Dry-run adapter
// ---------------------------------------------------------------------------

/// Logs every call, places nothing, reports an empty account. Full logging
/// parity with SIM so dry-run output is comparable.
#[derive(Debug, Default)]
pub struct DryRunAdapter;

impl ExecutionAdapter for DryRunAdapter {
    fn submit_entry_order(&self, intent: &Intent, now: DateTime<Utc>) -> SubmitResult {
        let order_id = format!("DRY-{}", Uuid::new_v4());
        info!(
            intent_id = %intent.intent_id,
            instrument = %intent.instrument,
            direction = %intent.direction,
            entry = intent.entry,
            stop = intent.stop,
            target = intent.target,
            quantity = intent.quantity,
            at = %now,
            "dry-run entry (not placed)"
        );
        SubmitResult::ok(order_id)
    }

    fn get_account_snapshot(&self, _now: DateTime<Utc>) -> AccountSnapshot {
        AccountSnapshot::default()
    }

    fn cancel_robot_owned_working_orders(
        &self,
        snapshot: &AccountSnapshot,
        _now: DateTime<Utc>,
    ) -> usize {
        snapshot.working_orders.iter().filter(|o| o.is_robot_owned()).count()
    }

    fn flatten_intent(
        &self,
        intent_id: &str,
        instrument: &str,
        _now: DateTime<Utc>,
    ) -> FlattenResult {
        debug!(intent_id, instrument, "dry-run flatten (no-op)");
        FlattenResult::AlreadyFlat
    }

    fn cancel_intent_orders(&self, intent_id: &str, _now: DateTime<Utc>) -> bool {
        debug!(intent_id, "dry-run cancel intent orders (no-op)");
        true
    }
}

// ---------------------------------------------------------------------------
// Sim adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SimBook {
    /// intent-id → filled position.
    positions: HashMap<String, BrokerPosition>,
    /// intent-id → stored intent, kept so recovery can rebuild brackets.
    intents: HashMap<String, Intent>,
    working_orders: Vec<WorkingOrder>,
    fail_next_submit: bool,
}

/// Simulated broker. Entries fill instantly; the protective bracket is
/// written as two tagged OCO working orders on the fill.
#[derive(Debug, Default)]
pub struct SimAdapter {
    book: Mutex<SimBook>,
}

impl SimAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: fail the next entry submission.
    pub fn fail_next_submit(&self) {
        self.book.lock().fail_next_submit = true;
    }

    /// Test hook: place a position the robot does not know about.
    pub fn inject_foreign_position(&self, instrument: &str, quantity: i64, avg_price: f64) {
        self.book.lock().positions.insert(
            format!("foreign-{instrument}"),
            BrokerPosition {
                instrument: instrument.to_string(),
                quantity,
                avg_price,
            },
        );
    }

    /// Test hook: drop working orders for an intent without cancelling.
    pub fn drop_working_orders(&self, intent_id: &str) {
        self.book
            .lock()
            .working_orders
            .retain(|o| !o.tag.contains(intent_id));
    }

    fn place_bracket(book: &mut SimBook, intent: &Intent) {
        let qty = intent.quantity as i64;
        let (stop_qty, target_qty) = match intent.direction {
            Direction::Long => (-qty, -qty),
            Direction::Short => (qty, qty),
        };
        book.working_orders.push(WorkingOrder {
            order_id: format!("SIM-{}", Uuid::new_v4()),
            tag: robot_tag(&intent.intent_id, "STP"),
            instrument: intent.instrument.clone(),
            kind: WorkingOrderKind::Stop,
            price: intent.stop,
            quantity: stop_qty,
        });
        book.working_orders.push(WorkingOrder {
            order_id: format!("SIM-{}", Uuid::new_v4()),
            tag: robot_tag(&intent.intent_id, "TGT"),
            instrument: intent.instrument.clone(),
            kind: WorkingOrderKind::Target,
            price: intent.target,
            quantity: target_qty,
        });
    }
}

impl ExecutionAdapter for SimAdapter {
    fn submit_entry_order(&self, intent: &Intent, now: DateTime<Utc>) -> SubmitResult {
        let mut book = self.book.lock();
        if book.fail_next_submit {
            book.fail_next_submit = false;
            warn!(intent_id = %intent.intent_id, "sim broker rejecting entry (test hook)");
            return SubmitResult::failed("sim broker rejection");
        }

        let qty = intent.quantity as i64;
        let signed = match intent.direction {
            Direction::Long => qty,
            Direction::Short => -qty,
        };
        book.positions.insert(
            intent.intent_id.clone(),
            BrokerPosition {
                instrument: intent.instrument.clone(),
                quantity: signed,
                avg_price: intent.entry,
            },
        );
        Self::place_bracket(&mut book, intent);
        book.intents.insert(intent.intent_id.clone(), intent.clone());

        let order_id = format!("SIM-{}", Uuid::new_v4());
        info!(
            intent_id = %intent.intent_id,
            instrument = %intent.instrument,
            direction = %intent.direction,
            entry = intent.entry,
            quantity = intent.quantity,
            broker_order_id = %order_id,
            at = %now,
            "sim entry filled, bracket placed"
        );
        SubmitResult::ok(order_id)
    }

    fn get_account_snapshot(&self, _now: DateTime<Utc>) -> AccountSnapshot {
        let book = self.book.lock();
        AccountSnapshot {
            positions: book.positions.values().cloned().collect(),
            working_orders: book.working_orders.clone(),
        }
    }

    fn cancel_robot_owned_working_orders(
        &self,
        snapshot: &AccountSnapshot,
        _now: DateTime<Utc>,
    ) -> usize {
        let to_cancel: Vec<String> = snapshot
            .working_orders
            .iter()
            .filter(|o| o.is_robot_owned())
            .map(|o| o.order_id.clone())
            .collect();
        let mut book = self.book.lock();
        let before = book.working_orders.len();
        book.working_orders.retain(|o| !to_cancel.contains(&o.order_id));
        before - book.working_orders.len()
    }

    fn flatten_intent(
        &self,
        intent_id: &str,
        instrument: &str,
        _now: DateTime<Utc>,
    ) -> FlattenResult {
        let mut book = self.book.lock();
        match book.positions.remove(intent_id) {
            Some(_) => {
                debug!(intent_id, instrument, "sim position flattened");
                FlattenResult::Flattened
            }
            None => FlattenResult::AlreadyFlat,
        }
    }

    fn cancel_intent_orders(&self, intent_id: &str, _now: DateTime<Utc>) -> bool {
        let mut book = self.book.lock();
        book.working_orders.retain(|o| !o.tag.contains(intent_id));
        true
    }

    fn as_recovery_support(&self) -> Option<&dyn RecoverySupport> {
        Some(self)
    }
}

impl RecoverySupport for SimAdapter {
    fn resubmit_protective_orders(&self, intent_id: &str, _now: DateTime<Utc>) -> bool {
        let mut book = self.book.lock();
        let Some(intent) = book.intents.get(intent_id).cloned() else {
            return false;
        };
        // Idempotent: drop any surviving bracket legs first.
        book.working_orders.retain(|o| !o.tag.contains(intent_id));
        Self::place_bracket(&mut book, &intent);
        info!(intent_id, "sim protective bracket re-established");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parity_spec::TickRounding;
    use crate::types::TriggerReason;
    use chrono::NaiveDate;

    fn now() -> DateTime<Utc> {
        "2025-07-15T14:30:00Z".parse().unwrap()
    }

    fn sample_intent(direction: Direction) -> Intent {
        Intent::new(
            NaiveDate::from_ymd_opt(2025, 7, 15).unwrap(),
            "ES1",
            "MES",
            "S1",
            "09:30",
            direction,
            2,
            4000.25,
            4000.0,
            3995.0,
            20.0,
            0.25,
            TickRounding::HalfUp,
            now(),
            TriggerReason::ImmediateAtLock,
        )
    }

    #[test]
    fn sim_fill_creates_position_and_bracket() {
        let sim = SimAdapter::new();
        let intent = sample_intent(Direction::Long);
        let result = sim.submit_entry_order(&intent, now());
        assert!(result.success);

        let snapshot = sim.get_account_snapshot(now());
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.positions[0].quantity, 2);
        assert_eq!(snapshot.working_orders.len(), 2);
        assert!(snapshot.working_orders.iter().all(|o| o.is_robot_owned()));
        // Long bracket works the opposite side.
        assert!(snapshot.working_orders.iter().all(|o| o.quantity == -2));
    }

    #[test]
    fn cancel_robot_owned_ignores_foreign_orders() {
        let sim = SimAdapter::new();
        sim.submit_entry_order(&sample_intent(Direction::Short), now());

        let mut snapshot = sim.get_account_snapshot(now());
        snapshot.working_orders.push(WorkingOrder {
            order_id: "MANUAL-1".into(),
            tag: "operator-order".into(),
            instrument: "MES".into(),
            kind: WorkingOrderKind::Stop,
            price: 4100.0,
            quantity: 1,
        });

        let cancelled = sim.cancel_robot_owned_working_orders(&snapshot, now());
        assert_eq!(cancelled, 2);
        assert!(sim.get_account_snapshot(now()).working_orders.is_empty());
    }

    #[test]
    fn flatten_is_idempotent() {
        let sim = SimAdapter::new();
        let intent = sample_intent(Direction::Long);
        sim.submit_entry_order(&intent, now());

        assert_eq!(
            sim.flatten_intent(&intent.intent_id, "MES", now()),
            FlattenResult::Flattened
        );
        assert_eq!(
            sim.flatten_intent(&intent.intent_id, "MES", now()),
            FlattenResult::AlreadyFlat
        );
    }

    #[test]
    fn recovery_support_rebuilds_bracket() {
        let sim = SimAdapter::new();
        let intent = sample_intent(Direction::Long);
        sim.submit_entry_order(&intent, now());
        sim.drop_working_orders(&intent.intent_id);
        assert!(sim.get_account_snapshot(now()).working_orders.is_empty());

        let support = sim.as_recovery_support().unwrap();
        assert!(support.resubmit_protective_orders(&intent.intent_id, now()));
        assert_eq!(sim.get_account_snapshot(now()).working_orders.len(), 2);

        assert!(!support.resubmit_protective_orders("unknown", now()));
    }

    #[test]
    fn dry_run_places_nothing() {
        let dry = DryRunAdapter;
        let result = dry.submit_entry_order(&sample_intent(Direction::Long), now());
        assert!(result.success);
        assert!(dry.get_account_snapshot(now()).positions.is_empty());
        assert!(dry.as_recovery_support().is_none());
    }

    #[test]
    fn failed_submit_reports_error() {
        let sim = SimAdapter::new();
        sim.fail_next_submit();
        let result = sim.submit_entry_order(&sample_intent(Direction::Long), now());
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(sim.get_account_snapshot(now()).positions.is_empty());
    }
}
