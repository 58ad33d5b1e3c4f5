// =============================================================================
// Stream State Machine — one (session, slot-time) decision unit per day
// =============================================================================
//
// States: PRE_HYDRATION -> ARMED -> RANGE_BUILDING -> RANGE_LOCKED -> DONE.
// DONE is terminal; a committed stream never re-arms within the run, and
// every observation against it is a no-op. All fail-closed paths end in a
// commit so the journal carries the reason.
// =============================================================================

pub mod intent;
pub mod range;

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::execution::ExecutionAdapter;
use crate::journal::{ExecutionJournal, JournalStore, StreamJournalRecord, SubmissionOutcome};
use crate::market_data::{Bar, BarBuffer, RejectionStats};
use crate::notify::{Notifier, Priority};
use crate::parity_spec::TickRounding;
use crate::risk::{self, EngineGateSnapshot};
use crate::time_service;
use crate::types::{CommitReason, EventKind, ExecutionMode, StreamState, TriggerReason};

use self::intent::Intent;
use self::range::{compute_range, evaluate_gaps, in_range_window, LockedRange};

/// How long after slot-time the machine keeps retrying a failed range
/// computation before committing NO_TRADE_RANGE_DATA_MISSING.
pub const RANGE_RETRY_BUDGET_SECS: i64 = 120;

/// Per-instrument historical-bar timeout; after this the range lock proceeds
/// without the backfill.
pub const BARSREQUEST_TIMEOUT_SECS: i64 = 300;

/// Immutable per-stream configuration fixed at creation.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Canonicalised stream id, e.g. `ES1`.
    pub stream_id: String,
    pub canonical: String,
    pub execution_instrument: String,
    pub session: String,
    pub trading_date: NaiveDate,
    /// Chicago wall-clock strings from spec and timetable.
    pub slot_time: String,
    pub range_start_time: String,
    pub market_close_time: String,
    pub tick_size: f64,
    pub base_target: f64,
    pub quantity: u32,
    pub tick_rounding: TickRounding,
    pub mode: ExecutionMode,
}

/// Everything a stream needs from the engine for one call. Built inside the
/// engine's critical section; the gate slice is a value copy, so no ownership
/// cycle exists between engine and stream.
pub struct StreamContext<'a> {
    pub now: DateTime<Utc>,
    pub gate: EngineGateSnapshot,
    pub adapter: &'a dyn ExecutionAdapter,
    pub exec_journal: &'a ExecutionJournal,
    pub notifier: &'a dyn Notifier,
}

pub struct StreamStateMachine {
    cfg: StreamConfig,
    state: StreamState,
    committed: bool,
    commit_reason: Option<CommitReason>,
    armed_once: bool,

    range_start_utc: DateTime<Utc>,
    slot_time_utc: DateTime<Utc>,
    market_close_utc: DateTime<Utc>,

    buffer: BarBuffer,
    rejections: RejectionStats,
    range: Option<LockedRange>,
    intent: Option<Intent>,

    range_invalidated: bool,
    invalidation_alerted: bool,

    prehydrated: bool,
    prehydration_requested_at: Option<DateTime<Utc>>,
    bars_request_timeout_logged: bool,

    journal: Arc<JournalStore>,
    timetable_hash: Option<String>,
}

impl StreamStateMachine {
    pub fn new(
        cfg: StreamConfig,
        journal: Arc<JournalStore>,
        timetable_hash: Option<String>,
    ) -> Result<Self> {
        let range_start_utc =
            time_service::construct_chicago_utc(cfg.trading_date, &cfg.range_start_time)?;
        let slot_time_utc =
            time_service::construct_chicago_utc(cfg.trading_date, &cfg.slot_time)?;
        let market_close_utc =
            time_service::construct_chicago_utc(cfg.trading_date, &cfg.market_close_time)?;

        if range_start_utc >= slot_time_utc {
            bail!(
                "stream {}: range start {} not before slot time {}",
                cfg.stream_id,
                cfg.range_start_time,
                cfg.slot_time
            );
        }
        if slot_time_utc > market_close_utc {
            bail!(
                "stream {}: slot time {} after market close {}",
                cfg.stream_id,
                cfg.slot_time,
                cfg.market_close_time
            );
        }

        Ok(Self {
            cfg,
            state: StreamState::PreHydration,
            committed: false,
            commit_reason: None,
            armed_once: false,
            range_start_utc,
            slot_time_utc,
            market_close_utc,
            buffer: BarBuffer::new(),
            rejections: RejectionStats::default(),
            range: None,
            intent: None,
            range_invalidated: false,
            invalidation_alerted: false,
            prehydrated: false,
            prehydration_requested_at: None,
            bars_request_timeout_logged: false,
            journal,
            timetable_hash,
        })
    }

    /// Reconstruct a stream that the journal says already committed. The
    /// stream lands in DONE and refuses to re-run.
    pub fn reattach_committed(
        cfg: StreamConfig,
        journal: Arc<JournalStore>,
        last: &StreamJournalRecord,
    ) -> Result<Self> {
        let mut machine = Self::new(cfg, journal, last.timetable_hash.clone())?;
        machine.state = StreamState::Done;
        machine.committed = true;
        machine.commit_reason = last.commit_reason;
        machine.armed_once = true;
        info!(
            event = %EventKind::StreamReattachedCommitted,
            stream = %machine.cfg.stream_id,
            commit_reason = ?machine.commit_reason,
            "reattached to committed stream, will not re-run"
        );
        Ok(machine)
    }

    // -------------------------------------------------------------------------
    // Host-facing operations
    // -------------------------------------------------------------------------

    /// Arm the stream: reset daily counters, clear the buffer, enter
    /// PRE_HYDRATION. Double-arming within the same trading-date is a no-op.
    pub fn arm(&mut self, now: DateTime<Utc>) {
        if self.committed {
            return;
        }
        if self.armed_once {
            debug!(stream = %self.cfg.stream_id, "double-arm ignored");
            return;
        }
        self.armed_once = true;
        self.state = StreamState::PreHydration;
        self.buffer.clear();
        self.rejections = RejectionStats::default();
        self.range = None;
        self.intent = None;
        self.range_invalidated = false;
        self.invalidation_alerted = false;
        self.prehydrated = false;
        self.prehydration_requested_at = Some(now);
        self.append_journal(now);
        info!(
            event = %EventKind::StreamArmed,
            stream = %self.cfg.stream_id,
            session = %self.cfg.session,
            slot_time = %self.cfg.slot_time,
            "stream armed"
        );
    }

    /// Apply a slot-time update from a fresh timetable. Allowed only while
    /// uncommitted.
    pub fn apply_directive_update(
        &mut self,
        new_slot_time: &str,
        trading_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        if trading_date != self.cfg.trading_date {
            bail!(
                "stream {}: directive update for {} but stream is {}",
                self.cfg.stream_id,
                trading_date,
                self.cfg.trading_date
            );
        }
        let new_slot_utc = time_service::construct_chicago_utc(trading_date, new_slot_time)?;
        if self.range_start_utc >= new_slot_utc {
            bail!(
                "stream {}: updated slot time {new_slot_time} not after range start {}",
                self.cfg.stream_id,
                self.cfg.range_start_time
            );
        }
        if self.cfg.slot_time == new_slot_time {
            return Ok(());
        }
        info!(
            event = %EventKind::SlotTimeUpdated,
            stream = %self.cfg.stream_id,
            old = %self.cfg.slot_time,
            new = %new_slot_time,
            "slot time updated from timetable"
        );
        self.cfg.slot_time = new_slot_time.to_string();
        self.slot_time_utc = new_slot_utc;
        self.append_journal(now);
        Ok(())
    }

    /// Bulk-load historical bars (SIM host delivery or dry-run CSV read).
    /// Returns the number of bars accepted into the buffer.
    pub fn load_pre_hydration_bars(&mut self, bars: &[Bar], now: DateTime<Utc>) -> usize {
        if self.committed {
            return 0;
        }
        let mut accepted = 0;
        for bar in bars {
            // Historical bars are complete by contract; the partial-bar rule
            // keys off a now that is already past the bar period.
            let effective_now =
                now.max(bar.open_utc + Duration::seconds(crate::market_data::bar_buffer::BAR_PERIOD_SECS));
            if self.buffer.insert(bar.clone(), effective_now).accepted() {
                accepted += 1;
            } else {
                self.rejections.duplicate += 1;
            }
        }
        self.prehydrated = true;
        debug!(
            stream = %self.cfg.stream_id,
            loaded = bars.len(),
            accepted,
            "pre-hydration bars loaded"
        );
        accepted
    }

    /// Observe one bar. Committed streams are observationally inert.
    pub fn on_bar(&mut self, bar: Bar, ctx: &StreamContext<'_>, is_historical: bool) {
        if self.committed || self.state == StreamState::Done {
            return;
        }

        let effective_now = if is_historical {
            ctx.now
                .max(bar.open_utc + Duration::seconds(crate::market_data::bar_buffer::BAR_PERIOD_SECS))
        } else {
            ctx.now
        };

        let open_utc = bar.open_utc;
        let insert = self.buffer.insert(bar, effective_now);
        use crate::market_data::BarInsert;
        match insert {
            BarInsert::RejectedPartial => {
                self.rejections.partial += 1;
                return;
            }
            BarInsert::RejectedDuplicate => {
                self.rejections.duplicate += 1;
                return;
            }
            BarInsert::RejectedInvalidOhlc => {
                self.rejections.invalid_ohlc += 1;
                debug!(
                    event = %EventKind::BarRejected,
                    stream = %self.cfg.stream_id,
                    open_utc = %open_utc,
                    "invalid OHLC bar discarded"
                );
                return;
            }
            BarInsert::Inserted | BarInsert::Replaced(_) => {}
        }

        // Outside both the range window and the breakout window: diagnostics
        // only.
        if open_utc < self.range_start_utc || open_utc >= self.market_close_utc {
            self.rejections.out_of_window += 1;
        }

        // Gap accounting over the whole in-window set, so arrival order and
        // precedence replacement cannot change the verdict.
        if !self.range_invalidated
            && self.state != StreamState::RangeLocked
            && in_range_window(open_utc, self.range_start_utc, self.slot_time_utc)
        {
            let in_window: Vec<&Bar> = self
                .buffer
                .between(self.range_start_utc, self.slot_time_utc)
                .collect();
            if let Some(violation) = evaluate_gaps(&in_window, self.slot_time_utc) {
                self.invalidate_range(ctx, violation);
                return;
            }
        }

        // Post-lock breakout detection.
        if self.state == StreamState::RangeLocked
            && self.intent.is_none()
            && open_utc >= self.slot_time_utc
            && open_utc < self.market_close_utc
        {
            if let Some(range) = self.range {
                let bar_ref = self.buffer.get(open_utc).cloned();
                if let Some(bar) = bar_ref {
                    if let Some(direction) = range.breakout_on_bar(&bar) {
                        self.detect_entry(ctx, direction, TriggerReason::Breakout, open_utc);
                    }
                }
            }
        }
    }

    /// Advance the state machine. Safe to call at any cadence.
    pub fn tick(&mut self, ctx: &StreamContext<'_>) {
        if self.committed {
            return;
        }
        loop {
            let before = self.state;
            match self.state {
                StreamState::Done => break,
                StreamState::PreHydration => self.tick_pre_hydration(ctx),
                StreamState::Armed => {
                    if ctx.now >= self.range_start_utc {
                        self.transition(StreamState::RangeBuilding, ctx.now);
                    }
                }
                StreamState::RangeBuilding => {
                    if self.range_invalidated {
                        // Invalidation commits at detection; this is the
                        // backstop if detection raced the commit.
                        self.commit(ctx.now, CommitReason::RangeInvalidated);
                    } else if ctx.now >= self.slot_time_utc {
                        self.try_lock_range(ctx);
                    }
                }
                StreamState::RangeLocked => {
                    if ctx.now >= self.market_close_utc {
                        info!(
                            stream = %self.cfg.stream_id,
                            "no entry by market close"
                        );
                        self.commit(ctx.now, CommitReason::NoTradeMarketClose);
                    }
                }
            }
            if self.state == before || self.committed {
                break;
            }
        }
    }

    /// Fail-closed terminal action driven by the engine (journal corruption,
    /// protective-order failure, timetable stand-down).
    pub fn stand_down(&mut self, now: DateTime<Utc>, reason: &str) {
        if self.committed {
            return;
        }
        warn!(
            event = %EventKind::StandDown,
            stream = %self.cfg.stream_id,
            reason,
            "stream standing down"
        );
        self.commit(now, CommitReason::StreamStandDown);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn tick_pre_hydration(&mut self, ctx: &StreamContext<'_>) {
        let hydrated = self.prehydrated || !self.buffer.is_empty();
        let timed_out = self
            .prehydration_requested_at
            .map(|t| ctx.now - t >= Duration::seconds(BARSREQUEST_TIMEOUT_SECS))
            .unwrap_or(false);

        if hydrated || ctx.now >= self.range_start_utc || timed_out {
            if timed_out && !hydrated && !self.bars_request_timeout_logged {
                self.bars_request_timeout_logged = true;
                warn!(
                    event = %EventKind::BarsRequestTimeout,
                    stream = %self.cfg.stream_id,
                    instrument = %self.cfg.canonical,
                    "historical bars never arrived, proceeding without backfill"
                );
            }
            self.transition(StreamState::Armed, ctx.now);
        }
    }

    fn try_lock_range(&mut self, ctx: &StreamContext<'_>) {
        let in_window: Vec<&Bar> = self
            .buffer
            .between(self.range_start_utc, self.slot_time_utc)
            .collect();
        let in_window_count = in_window.len();
        match compute_range(&in_window, self.cfg.tick_size, self.cfg.tick_rounding) {
            Ok(range) => {
                self.range = Some(range);
                self.transition(StreamState::RangeLocked, ctx.now);
                info!(
                    event = %EventKind::RangeLocked,
                    stream = %self.cfg.stream_id,
                    high = range.high,
                    low = range.low,
                    freeze_close = range.freeze_close,
                    brk_long = range.brk_long,
                    brk_short = range.brk_short,
                    bars = in_window_count,
                    "range locked"
                );
                if let Some(direction) = range.immediate_entry() {
                    self.detect_entry(
                        ctx,
                        direction,
                        TriggerReason::ImmediateAtLock,
                        self.slot_time_utc,
                    );
                }
                // Catch up on breakout bars that arrived between slot-time
                // and this lock tick.
                if self.intent.is_none() && !self.committed {
                    let pending: Vec<Bar> = self
                        .buffer
                        .between(self.slot_time_utc, self.market_close_utc)
                        .cloned()
                        .collect();
                    for bar in pending {
                        if self.intent.is_some() || self.committed {
                            break;
                        }
                        if let Some(direction) = range.breakout_on_bar(&bar) {
                            self.detect_entry(
                                ctx,
                                direction,
                                TriggerReason::Breakout,
                                bar.open_utc,
                            );
                        }
                    }
                }
            }
            Err(failure) => {
                if ctx.now >= self.slot_time_utc + Duration::seconds(RANGE_RETRY_BUDGET_SECS) {
                    warn!(
                        event = %EventKind::RangeDataMissing,
                        stream = %self.cfg.stream_id,
                        failure = %failure,
                        "range data missing after retry budget"
                    );
                    self.commit(ctx.now, CommitReason::NoTradeRangeDataMissing);
                } else {
                    debug!(
                        stream = %self.cfg.stream_id,
                        failure = %failure,
                        "range not computable yet, retrying"
                    );
                }
            }
        }
    }

    fn invalidate_range(&mut self, ctx: &StreamContext<'_>, violation: range::GapViolation) {
        self.range_invalidated = true;
        warn!(
            event = %EventKind::RangeInvalidated,
            stream = %self.cfg.stream_id,
            violation = %violation,
            "range permanently invalidated for the day"
        );
        if !self.invalidation_alerted {
            self.invalidation_alerted = true;
            ctx.notifier.notify(
                Priority::High,
                "RANGE_INVALIDATED",
                &format!("{}: {violation}", self.cfg.stream_id),
            );
        }
        self.commit(ctx.now, CommitReason::RangeInvalidated);
    }

    fn detect_entry(
        &mut self,
        ctx: &StreamContext<'_>,
        direction: crate::types::Direction,
        trigger: TriggerReason,
        entry_time_utc: DateTime<Utc>,
    ) {
        let Some(range) = self.range else {
            return;
        };
        let entry_raw = range.entry_price(direction);
        let intent = Intent::new(
            self.cfg.trading_date,
            &self.cfg.stream_id,
            &self.cfg.execution_instrument,
            &self.cfg.session,
            &self.cfg.slot_time,
            direction,
            self.cfg.quantity,
            entry_raw,
            range.high,
            range.low,
            self.cfg.base_target,
            self.cfg.tick_size,
            self.cfg.tick_rounding,
            entry_time_utc,
            trigger,
        );
        info!(
            event = %EventKind::EntryDetected,
            stream = %self.cfg.stream_id,
            direction = %direction,
            trigger = %trigger,
            entry = intent.entry,
            stop = intent.stop,
            target = intent.target,
            be_trigger = intent.be_trigger,
            intent_id = %intent.intent_id,
            "entry detected"
        );
        self.submit(ctx, intent);
    }

    fn submit(&mut self, ctx: &StreamContext<'_>, intent: Intent) {
        let intent_id = intent.intent_id.clone();

        if ctx.exec_journal.is_intent_submitted(&intent_id) {
            info!(
                event = %EventKind::ExecutionSkippedDuplicate,
                stream = %self.cfg.stream_id,
                intent_id = %intent_id,
                "intent already submitted, skipping broker call"
            );
            self.intent = Some(intent);
            self.commit(ctx.now, CommitReason::EntrySubmitted);
            return;
        }

        let gate_input =
            ctx.gate
                .for_stream(self.armed_once, true, self.slot_time_utc, ctx.now);
        let decision = risk::evaluate(&gate_input);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or("DENIED");
            warn!(
                event = %EventKind::ExecutionBlocked,
                stream = %self.cfg.stream_id,
                intent_id = %intent_id,
                reason,
                "risk gate denied submission, standing down"
            );
            let _ = ctx.exec_journal.record_rejection(
                &intent_id,
                self.cfg.trading_date,
                &self.cfg.stream_id,
                reason.to_string(),
                ctx.now,
            );
            ctx.notifier.notify(
                Priority::High,
                "EXECUTION_BLOCKED",
                &format!("{}: {reason}", self.cfg.stream_id),
            );
            self.intent = Some(intent);
            self.commit(ctx.now, CommitReason::StreamStandDown);
            return;
        }

        let result = ctx.adapter.submit_entry_order(&intent, ctx.now);
        if result.success {
            match ctx.exec_journal.record_submission(
                &intent_id,
                self.cfg.trading_date,
                &self.cfg.stream_id,
                result.broker_order_id.clone(),
                None,
                ctx.now,
            ) {
                Ok(SubmissionOutcome::Recorded) => {
                    info!(
                        event = %EventKind::ExecutionSubmitted,
                        stream = %self.cfg.stream_id,
                        intent_id = %intent_id,
                        broker_order_id = ?result.broker_order_id,
                        "entry submitted"
                    );
                }
                Ok(SubmissionOutcome::Duplicate) => {
                    info!(
                        event = %EventKind::ExecutionSkippedDuplicate,
                        stream = %self.cfg.stream_id,
                        intent_id = %intent_id,
                        "journal reported duplicate after broker accept"
                    );
                }
                Err(e) => {
                    // The corruption handler has already fired inside the
                    // journal; log and fall through to the commit.
                    warn!(
                        stream = %self.cfg.stream_id,
                        error = %e,
                        "failed to record submission"
                    );
                }
            }
            self.intent = Some(intent);
            self.commit(ctx.now, CommitReason::EntrySubmitted);
        } else {
            let error = result.error.unwrap_or_else(|| "unknown broker error".to_string());
            warn!(
                event = %EventKind::ExecutionRejected,
                stream = %self.cfg.stream_id,
                intent_id = %intent_id,
                error = %error,
                "entry rejected by adapter, standing down"
            );
            let _ = ctx.exec_journal.record_rejection(
                &intent_id,
                self.cfg.trading_date,
                &self.cfg.stream_id,
                error.clone(),
                ctx.now,
            );
            ctx.notifier.notify(
                Priority::High,
                "EXECUTION_REJECTED",
                &format!("{}: {error}", self.cfg.stream_id),
            );
            self.intent = Some(intent);
            self.commit(ctx.now, CommitReason::StreamStandDown);
        }
    }

    fn transition(&mut self, state: StreamState, now: DateTime<Utc>) {
        self.state = state;
        self.append_journal(now);
    }

    fn commit(&mut self, now: DateTime<Utc>, reason: CommitReason) {
        if self.committed {
            return;
        }
        self.committed = true;
        self.commit_reason = Some(reason);
        self.state = StreamState::Done;
        self.append_journal(now);
        info!(
            stream = %self.cfg.stream_id,
            commit_reason = %reason,
            "stream committed"
        );
    }

    fn append_journal(&self, now: DateTime<Utc>) {
        let rec = StreamJournalRecord {
            trading_date: self.cfg.trading_date,
            stream_id: self.cfg.stream_id.clone(),
            state: self.state,
            committed: self.committed,
            commit_reason: self.commit_reason,
            last_update_utc: now,
            timetable_hash: self.timetable_hash.clone(),
        };
        if let Err(e) = self.journal.append(&rec) {
            warn!(
                event = %EventKind::JournalCorruption,
                stream = %self.cfg.stream_id,
                error = %e,
                "stream journal append failed"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn stream_id(&self) -> &str {
        &self.cfg.stream_id
    }

    pub fn canonical(&self) -> &str {
        &self.cfg.canonical
    }

    pub fn execution_instrument(&self) -> &str {
        &self.cfg.execution_instrument
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn commit_reason(&self) -> Option<CommitReason> {
        self.commit_reason
    }

    pub fn intent(&self) -> Option<&Intent> {
        self.intent.as_ref()
    }

    pub fn range(&self) -> Option<&LockedRange> {
        self.range.as_ref()
    }

    pub fn rejections(&self) -> &RejectionStats {
        &self.rejections
    }

    pub fn is_range_invalidated(&self) -> bool {
        self.range_invalidated
    }

    /// A stream is hydrated once it has left PRE_HYDRATION.
    pub fn is_hydrated(&self) -> bool {
        self.state != StreamState::PreHydration
    }

    /// The historical window a BarsRequest should cover for this stream.
    pub fn bars_request_time_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.range_start_utc, self.slot_time_utc)
    }

    pub fn slot_time_utc(&self) -> DateTime<Utc> {
        self.slot_time_utc
    }
}

impl std::fmt::Debug for StreamStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStateMachine")
            .field("stream_id", &self.cfg.stream_id)
            .field("state", &self.state)
            .field("committed", &self.committed)
            .field("commit_reason", &self.commit_reason)
            .field("bars", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::SimAdapter;
    use crate::notify::test_support::RecordingNotifier;
    use crate::types::{BarSource, Direction, RecoveryState};

    // Trading date 2025-01-15 (CST, UTC-6): S1 range 08:30-09:30 Chicago is
    // 14:30-15:30 UTC; market close 16:00 Chicago is 22:00 UTC.
    const RANGE_START: &str = "2025-01-15T14:30:00Z";
    const SLOT: &str = "2025-01-15T15:30:00Z";

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    fn config() -> StreamConfig {
        StreamConfig {
            stream_id: "ES1".into(),
            canonical: "ES".into(),
            execution_instrument: "MES".into(),
            session: "S1".into(),
            trading_date: date(),
            slot_time: "09:30".into(),
            range_start_time: "08:30".into(),
            market_close_time: "16:00".into(),
            tick_size: 0.25,
            base_target: 20.0,
            quantity: 2,
            tick_rounding: TickRounding::HalfUp,
            mode: ExecutionMode::Sim,
        }
    }

    struct Rig {
        _dir: tempfile::TempDir,
        store: Arc<JournalStore>,
        adapter: SimAdapter,
        exec_journal: ExecutionJournal,
        notifier: RecordingNotifier,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(JournalStore::new(dir.path()));
            let (exec_journal, _) = ExecutionJournal::open(dir.path(), date()).unwrap();
            Self {
                _dir: dir,
                store,
                adapter: SimAdapter::new(),
                exec_journal,
                notifier: RecordingNotifier::default(),
            }
        }

        fn ctx(&self, now: DateTime<Utc>) -> StreamContext<'_> {
            StreamContext {
                now,
                gate: EngineGateSnapshot {
                    mode: ExecutionMode::Sim,
                    kill_switch: false,
                    recovery_state: RecoveryState::ConnectedOk,
                    timetable_validated: true,
                },
                adapter: &self.adapter,
                exec_journal: &self.exec_journal,
                notifier: &self.notifier,
            }
        }

        fn machine(&self) -> StreamStateMachine {
            let mut m = StreamStateMachine::new(config(), self.store.clone(), Some("tt".into()))
                .unwrap();
            m.arm(ts("2025-01-15T14:00:00Z"));
            m
        }
    }

    fn bar(open: DateTime<Utc>, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            open_utc: open,
            open: (high + low) / 2.0,
            high,
            low,
            close,
            volume: Some(10.0),
            source: BarSource::Live,
        }
    }

    /// Feed a gap-free 60-bar range window: high/low fixed, last close given.
    /// Ticks once at range start so the machine reaches RANGE_BUILDING
    /// without ever ticking at or past the slot.
    fn feed_range(rig: &Rig, machine: &mut StreamStateMachine, high: f64, low: f64, last_close: f64) {
        let start = ts(RANGE_START);
        for i in 0..60 {
            let open = start + Duration::minutes(i);
            let close = if i == 59 { last_close } else { (high + low) / 2.0 };
            let now = open + Duration::seconds(60);
            machine.on_bar(bar(open, high, low, close), &rig.ctx(now), false);
        }
        machine.tick(&rig.ctx(start));
    }

    #[test]
    fn clean_immediate_long_scenario() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        feed_range(&rig, &mut machine, 4000.0, 3995.0, 4000.25);
        assert_eq!(machine.state(), StreamState::RangeBuilding);

        machine.tick(&rig.ctx(ts(SLOT)));

        let intent = machine.intent().expect("entry expected");
        assert_eq!(intent.direction, Direction::Long);
        assert_eq!(intent.trigger, TriggerReason::ImmediateAtLock);
        assert_eq!(intent.entry, 4000.25);
        assert_eq!(intent.target, 4020.25);
        assert_eq!(intent.stop, 3995.25);
        assert_eq!(intent.be_trigger, 4013.25);
        assert_eq!(intent.entry_time_utc, ts(SLOT));

        assert!(machine.is_committed());
        assert_eq!(machine.commit_reason(), Some(CommitReason::EntrySubmitted));
        assert!(rig.exec_journal.is_intent_submitted(&intent.intent_id));

        let range = machine.range().unwrap();
        assert_eq!(range.brk_long, 4000.25);
        assert_eq!(range.brk_short, 3994.75);
    }

    #[test]
    fn post_lock_breakout_scenario() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        // Freeze close 3998: neither immediate side fires.
        feed_range(&rig, &mut machine, 4000.0, 3995.0, 3998.0);
        machine.tick(&rig.ctx(ts(SLOT)));
        assert_eq!(machine.state(), StreamState::RangeLocked);
        assert!(machine.intent().is_none());

        // 09:34 bar pierces the long level.
        let open = ts("2025-01-15T15:34:00Z");
        machine.on_bar(
            bar(open, 4000.50, 3998.0, 4000.0),
            &rig.ctx(open + Duration::seconds(60)),
            false,
        );

        let intent = machine.intent().expect("breakout entry expected");
        assert_eq!(intent.direction, Direction::Long);
        assert_eq!(intent.trigger, TriggerReason::Breakout);
        assert_eq!(intent.entry, 4000.25);
        assert_eq!(intent.entry_time_utc, open);
        assert!(machine.is_committed());
    }

    #[test]
    fn market_close_no_trade_scenario() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        feed_range(&rig, &mut machine, 4000.0, 3995.0, 3998.0);
        machine.tick(&rig.ctx(ts(SLOT)));
        assert_eq!(machine.state(), StreamState::RangeLocked);

        // Quiet bars that never cross either level.
        for i in 1..10 {
            let open = ts(SLOT) + Duration::minutes(i);
            machine.on_bar(
                bar(open, 3999.0, 3996.0, 3998.0),
                &rig.ctx(open + Duration::seconds(60)),
                false,
            );
        }
        assert!(!machine.is_committed());

        // 16:00 Chicago.
        machine.tick(&rig.ctx(ts("2025-01-15T22:00:00Z")));
        assert!(machine.is_committed());
        assert_eq!(machine.commit_reason(), Some(CommitReason::NoTradeMarketClose));
    }

    #[test]
    fn gap_invalidation_scenario() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        let start = ts(RANGE_START);
        for i in 0..10 {
            let open = start + Duration::minutes(i);
            machine.on_bar(
                bar(open, 4000.0, 3995.0, 3998.0),
                &rig.ctx(open + Duration::seconds(60)),
                false,
            );
        }
        // 4-minute open-to-open gap: 14:39 -> 14:43.
        let open = start + Duration::minutes(13);
        machine.on_bar(
            bar(open, 4000.0, 3995.0, 3998.0),
            &rig.ctx(open + Duration::seconds(60)),
            false,
        );

        assert!(machine.is_range_invalidated());
        assert!(machine.is_committed());
        assert_eq!(machine.commit_reason(), Some(CommitReason::RangeInvalidated));
        assert_eq!(rig.notifier.count_titled("RANGE_INVALIDATED"), 1);

        // Later bars change nothing and no second alert fires.
        let open = start + Duration::minutes(14);
        machine.on_bar(
            bar(open, 4000.0, 3995.0, 3998.0),
            &rig.ctx(open + Duration::seconds(60)),
            false,
        );
        assert_eq!(rig.notifier.count_titled("RANGE_INVALIDATED"), 1);
    }

    #[test]
    fn duplicate_intent_skips_broker() {
        let rig = Rig::new();

        let mut first = rig.machine();
        feed_range(&rig, &mut first, 4000.0, 3995.0, 4000.25);
        first.tick(&rig.ctx(ts(SLOT)));
        let intent_id = first.intent().unwrap().intent_id.clone();
        assert_eq!(rig.adapter.get_account_snapshot(ts(SLOT)).positions.len(), 1);

        // A rebuilt machine over the same journal detects the same entry and
        // skips the broker.
        let mut second = rig.machine();
        feed_range(&rig, &mut second, 4000.0, 3995.0, 4000.25);
        second.tick(&rig.ctx(ts(SLOT)));

        assert_eq!(second.intent().unwrap().intent_id, intent_id);
        assert!(second.is_committed());
        assert_eq!(second.commit_reason(), Some(CommitReason::EntrySubmitted));
        // Still exactly one broker position.
        assert_eq!(rig.adapter.get_account_snapshot(ts(SLOT)).positions.len(), 1);
    }

    #[test]
    fn committed_stream_is_observationally_inert() {
        let rig = Rig::new();
        let mut machine = rig.machine();
        feed_range(&rig, &mut machine, 4000.0, 3995.0, 4000.25);
        machine.tick(&rig.ctx(ts(SLOT)));
        assert!(machine.is_committed());

        let state = machine.state();
        let reason = machine.commit_reason();
        let open = ts("2025-01-15T15:40:00Z");
        machine.on_bar(
            bar(open, 5000.0, 3000.0, 4000.0),
            &rig.ctx(open + Duration::seconds(60)),
            false,
        );
        machine.tick(&rig.ctx(ts("2025-01-15T23:00:00Z")));
        machine.arm(ts("2025-01-15T23:00:00Z"));

        assert_eq!(machine.state(), state);
        assert_eq!(machine.commit_reason(), reason);
    }

    #[test]
    fn double_arm_is_noop() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        let open = ts(RANGE_START);
        machine.on_bar(
            bar(open, 4000.0, 3995.0, 3998.0),
            &rig.ctx(open + Duration::seconds(60)),
            false,
        );
        machine.arm(ts("2025-01-15T14:35:00Z"));
        // The buffer survived the second arm.
        machine.tick(&rig.ctx(ts("2025-01-15T14:35:00Z")));
        assert_eq!(machine.state(), StreamState::RangeBuilding);
    }

    #[test]
    fn adapter_failure_stands_stream_down() {
        let rig = Rig::new();
        let mut machine = rig.machine();
        rig.adapter.fail_next_submit();

        feed_range(&rig, &mut machine, 4000.0, 3995.0, 4000.25);
        machine.tick(&rig.ctx(ts(SLOT)));

        assert!(machine.is_committed());
        assert_eq!(machine.commit_reason(), Some(CommitReason::StreamStandDown));
        assert_eq!(rig.notifier.count_titled("EXECUTION_REJECTED"), 1);
        assert!(!rig
            .exec_journal
            .is_intent_submitted(&machine.intent().unwrap().intent_id));
    }

    #[test]
    fn gate_denial_stands_stream_down() {
        let rig = Rig::new();
        let mut machine = rig.machine();
        feed_range(&rig, &mut machine, 4000.0, 3995.0, 4000.25);

        let mut ctx = rig.ctx(ts(SLOT));
        ctx.gate.recovery_state = RecoveryState::DisconnectFailClosed;
        machine.tick(&ctx);

        assert!(machine.is_committed());
        assert_eq!(machine.commit_reason(), Some(CommitReason::StreamStandDown));
        // No broker call happened.
        assert!(rig.adapter.get_account_snapshot(ts(SLOT)).positions.is_empty());
    }

    #[test]
    fn no_bars_commits_range_data_missing_after_budget() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        // Pre-hydration completes at range start with no bars.
        machine.tick(&rig.ctx(ts(RANGE_START)));
        assert_eq!(machine.state(), StreamState::RangeBuilding);

        // At slot: failure, still inside the retry budget.
        machine.tick(&rig.ctx(ts(SLOT)));
        assert!(!machine.is_committed());
        assert_eq!(machine.state(), StreamState::RangeBuilding);

        // Past the budget: committed.
        machine.tick(&rig.ctx(ts(SLOT) + Duration::seconds(RANGE_RETRY_BUDGET_SECS)));
        assert!(machine.is_committed());
        assert_eq!(
            machine.commit_reason(),
            Some(CommitReason::NoTradeRangeDataMissing)
        );
    }

    #[test]
    fn boundary_bars_window_membership() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        // Bar exactly at range start: accepted into the range.
        let at_start = ts(RANGE_START);
        machine.on_bar(
            bar(at_start, 4010.0, 3990.0, 4000.0),
            &rig.ctx(at_start + Duration::seconds(60)),
            false,
        );
        // Bar exactly at slot time: excluded from the range.
        let at_slot = ts(SLOT);
        machine.on_bar(
            bar(at_slot, 5000.0, 3000.0, 4000.0),
            &rig.ctx(at_slot + Duration::seconds(60)),
            false,
        );

        machine.tick(&rig.ctx(at_slot + Duration::seconds(61)));
        let range = machine.range().expect("range should lock");
        assert_eq!(range.high, 4010.0);
        assert_eq!(range.low, 3990.0);
    }

    #[test]
    fn slot_time_update_applies_only_uncommitted() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        machine
            .apply_directive_update("10:00", date(), ts("2025-01-15T14:00:00Z"))
            .unwrap();
        assert_eq!(machine.slot_time_utc(), ts("2025-01-15T16:00:00Z"));

        feed_range(&rig, &mut machine, 4000.0, 3995.0, 4000.25);
        machine.tick(&rig.ctx(ts("2025-01-15T16:00:00Z")));
        assert!(machine.is_committed());

        // Post-commit updates are ignored.
        machine
            .apply_directive_update("10:30", date(), ts("2025-01-15T16:05:00Z"))
            .unwrap();
        assert_eq!(machine.slot_time_utc(), ts("2025-01-15T16:00:00Z"));
    }

    #[test]
    fn reattach_refuses_to_rerun() {
        let rig = Rig::new();
        {
            let mut machine = rig.machine();
            feed_range(&rig, &mut machine, 4000.0, 3995.0, 4000.25);
            machine.tick(&rig.ctx(ts(SLOT)));
            assert!(machine.is_committed());
        }

        let last = rig.store.load_last(date(), "ES1").unwrap().unwrap();
        assert!(last.committed);

        let machine =
            StreamStateMachine::reattach_committed(config(), rig.store.clone(), &last).unwrap();
        assert_eq!(machine.state(), StreamState::Done);
        assert!(machine.is_committed());
        assert_eq!(machine.commit_reason(), Some(CommitReason::EntrySubmitted));
    }

    #[test]
    fn source_precedence_within_stream_buffer() {
        let rig = Rig::new();
        let mut machine = rig.machine();

        let open = ts(RANGE_START);
        let now = open + Duration::seconds(90);
        let mut csv_bar = bar(open, 4000.0, 3995.0, 3998.0);
        csv_bar.source = BarSource::Csv;
        machine.on_bar(csv_bar, &rig.ctx(now), true);

        // Live replaces CSV at the same open.
        machine.on_bar(bar(open, 4002.0, 3994.0, 3999.0), &rig.ctx(now), false);
        // A second CSV copy is rejected.
        let mut csv_again = bar(open, 4005.0, 3990.0, 3997.0);
        csv_again.source = BarSource::Csv;
        machine.on_bar(csv_again, &rig.ctx(now), true);

        machine.tick(&rig.ctx(ts(SLOT)));
        let range = machine.range().unwrap();
        assert_eq!(range.high, 4002.0);
        assert_eq!(range.low, 3994.0);
        assert_eq!(machine.rejections().duplicate, 1);
    }
}
