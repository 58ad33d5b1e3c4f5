// =============================================================================
// Robot Engine — stream orchestration, timetable reactivity, bar routing
// =============================================================================
//
// One engine mutex orders every mutation; file I/O (timetable poll, CSV
// pre-hydration, summary write) happens outside it and the parsed artefacts
// are applied inside. The engine is anchored to a single execution
// instrument and its canonical market for the life of the run.
// =============================================================================

pub mod recovery;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::execution::ExecutionAdapter;
use crate::journal::{ExecutionJournal, JournalStore, CORRUPTION_ALL_STREAMS};
use crate::market_data::{csv_loader, Bar};
use crate::market_lock::CanonicalMarketLock;
use crate::notify::{Notifier, Priority};
use crate::parity_spec::ParitySpec;
use crate::policy::ExecutionPolicy;
use crate::risk::EngineGateSnapshot;
use crate::stream::{StreamConfig, StreamContext, StreamStateMachine};
use crate::summary::{EngineBarRejects, ExecutionSummary, StreamOutcome};
use crate::time_service;
use crate::timetable::{self, LoadedTimetable};
use crate::types::{
    BarSource, CommitReason, EventKind, ExecutionMode, RecoveryState, StreamState,
};

use self::recovery::{ConnectionStatus, RecoveryTracker};

/// Bars dated further than this into the future are rejected.
pub const FUTURE_BAR_TOLERANCE_SECS: i64 = 120;

/// End of the per-trading-date session window, Chicago wall clock.
pub const SESSION_END_TIME: &str = "16:00";

/// Rewrite a stream id carrying the execution instrument to the canonical
/// form, e.g. `MES1 -> ES1`.
fn canonicalise_stream_id(raw: &str, execution_instrument: &str, canonical: &str) -> String {
    if execution_instrument != canonical && raw.contains(execution_instrument) {
        raw.replace(execution_instrument, canonical)
    } else {
        raw.to_string()
    }
}

#[derive(Default)]
struct EngineInner {
    run_id: String,
    started: bool,
    started_at_utc: Option<DateTime<Utc>>,

    spec: Option<Arc<ParitySpec>>,
    policy: Option<ExecutionPolicy>,
    policy_hash: Option<String>,
    canonical: Option<String>,
    market_lock: Option<CanonicalMarketLock>,

    trading_date: Option<NaiveDate>,
    timetable_hash: Option<String>,
    timetable_validated: bool,
    streams: HashMap<String, StreamStateMachine>,

    journal_store: Option<Arc<JournalStore>>,
    exec_journal: Option<Arc<ExecutionJournal>>,

    recovery: RecoveryTracker,
    kill_switch: bool,

    session_starts: HashMap<String, String>,
    account: Option<(String, String)>,
    engine_rejects: EngineBarRejects,
    last_poll_at: Option<DateTime<Utc>>,
}

pub struct RobotEngine {
    settings: EngineSettings,
    adapter: Arc<dyn ExecutionAdapter>,
    notifier: Arc<dyn Notifier>,
    inner: Mutex<EngineInner>,
    /// Secondary guard: a concurrent recovery trigger is a no-op.
    recovery_busy: Mutex<()>,
    /// Corrupt-stream queue fed by the execution-journal callback; drained in
    /// tick under the engine mutex.
    corrupt_streams: Arc<Mutex<Vec<String>>>,
    /// Protective-order failures signalled by the adapter/host.
    protective_failures: Mutex<Vec<String>>,
    /// Execution costs surfaced by the journal cost callback.
    execution_costs: Arc<Mutex<f64>>,
}

impl RobotEngine {
    pub fn new(
        settings: EngineSettings,
        adapter: Arc<dyn ExecutionAdapter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            adapter,
            notifier,
            inner: Mutex::new(EngineInner::default()),
            recovery_busy: Mutex::new(()),
            corrupt_streams: Arc::new(Mutex::new(Vec::new())),
            protective_failures: Mutex::new(Vec::new()),
            execution_costs: Arc::new(Mutex::new(0.0)),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the engine. Fatal on: LIVE mode, missing/invalid spec or
    /// policy, a policy-disabled anchor, or canonical-market lock contention.
    pub fn start(&self, now: DateTime<Utc>) -> Result<()> {
        if self.settings.mode == ExecutionMode::Live {
            self.notifier.notify(
                Priority::Critical,
                "LIVE_MODE_BLOCKED",
                "LIVE execution was requested; this build only trades DRYRUN or SIM",
            );
            bail!("LIVE mode is blocked");
        }

        // File loads happen before the engine mutex is taken.
        let spec = ParitySpec::load(self.settings.spec_path()).map_err(|e| {
            self.notifier
                .notify(Priority::Critical, "SPEC_LOAD_FAILED", &e.to_string());
            e
        })?;
        let (policy, policy_hash) = ExecutionPolicy::load(self.settings.policy_path())
            .map_err(|e| {
                self.notifier
                    .notify(Priority::Critical, "POLICY_LOAD_FAILED", &e.to_string());
                e
            })?;

        let execution_instrument = self.settings.execution_instrument.clone();
        spec.instrument(&execution_instrument)
            .with_context(|| format!("execution instrument {execution_instrument} not in spec"))?;
        let canonical = spec.canonical_of(&execution_instrument).to_string();

        // The policy may restrict the anchor but never override it: the pair
        // must be explicitly enabled or startup fails.
        if !policy.is_enabled(&canonical, &execution_instrument) {
            self.notifier.notify(
                Priority::Critical,
                "POLICY_ANCHOR_DISABLED",
                &format!("{canonical}/{execution_instrument} is not enabled in the execution policy"),
            );
            bail!("execution instrument {execution_instrument} not enabled for {canonical}");
        }

        let run_id = format!("run-{}", Uuid::new_v4());
        let lock = match CanonicalMarketLock::try_acquire(
            &self.settings.project_root,
            &canonical,
            &run_id,
        )? {
            Some(lock) => lock,
            None => {
                self.notifier.notify(
                    Priority::Critical,
                    "MARKET_LOCK_CONTENTION",
                    &format!("another instance already trades {canonical}"),
                );
                bail!("canonical-market lock for {canonical} is held by another instance");
            }
        };

        let initial_timetable = timetable::load(self.settings.timetable_path());

        let mut inner = self.inner.lock();
        if inner.started {
            bail!("engine already started");
        }
        inner.run_id = run_id;
        inner.started = true;
        inner.started_at_utc = Some(now);
        inner.spec = Some(Arc::new(spec));
        inner.policy = Some(policy);
        inner.policy_hash = Some(policy_hash);
        inner.canonical = Some(canonical.clone());
        inner.market_lock = Some(lock);
        inner.journal_store = Some(Arc::new(JournalStore::new(&self.settings.project_root)));

        info!(
            event = %EventKind::EngineStart,
            run_id = %inner.run_id,
            mode = %self.settings.mode,
            execution_instrument = %self.settings.execution_instrument,
            canonical = %canonical,
            policy_hash = %inner.policy_hash.as_deref().unwrap_or(""),
            "robot engine started"
        );

        match initial_timetable {
            Ok(loaded) => self.apply_timetable(&mut inner, loaded, now),
            Err(e) => {
                warn!(
                    event = %EventKind::TimetableRejected,
                    error = %e,
                    "initial timetable unavailable, standing by for the poller"
                );
            }
        }
        Ok(())
    }

    /// Stop the engine: release the canonical lock, then write the execution
    /// summary outside the engine mutex (non-dryrun modes only).
    pub fn stop(&self, now: DateTime<Utc>) -> Result<()> {
        let summary = {
            let mut inner = self.inner.lock();
            if !inner.started {
                bail!("engine not started");
            }
            inner.started = false;
            if let Some(mut lock) = inner.market_lock.take() {
                lock.release();
            }

            let streams = inner
                .streams
                .values()
                .map(|s| StreamOutcome {
                    stream_id: s.stream_id().to_string(),
                    state: s.state(),
                    commit_reason: s.commit_reason(),
                    bar_rejections: *s.rejections(),
                })
                .collect();
            let mut summary = ExecutionSummary {
                run_id: inner.run_id.clone(),
                mode: self.settings.mode,
                trading_date: inner.trading_date,
                started_utc: inner.started_at_utc,
                stopped_utc: now,
                entries_submitted: 0,
                no_trades: 0,
                stand_downs: 0,
                execution_costs: *self.execution_costs.lock(),
                engine_bar_rejects: inner.engine_rejects,
                streams,
            };
            summary.tally();
            summary
        };

        info!(event = %EventKind::EngineStop, run_id = %summary.run_id, "robot engine stopped");

        if self.settings.mode != ExecutionMode::Dryrun {
            summary.write(&self.settings.summary_dir())?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Periodic tick
    // -------------------------------------------------------------------------

    /// Advance the engine. Never surfaces an error to the host.
    pub fn tick(&self, now: DateTime<Utc>) {
        if let Err(e) = self.tick_inner(now) {
            error!(
                event = %EventKind::EngineTickInvalidState,
                error = %e,
                "tick failed, state preserved"
            );
        }
    }

    fn tick_inner(&self, now: DateTime<Utc>) -> Result<()> {
        // Phase 1: decide what I/O is due, under a brief lock.
        let (poll_due, hydrate_targets) = {
            let mut inner = self.inner.lock();
            if !inner.started {
                return Ok(());
            }
            let poll_due = match inner.last_poll_at {
                None => true,
                Some(t) => {
                    now - t >= Duration::seconds(self.settings.timetable_poll_secs as i64)
                }
            };
            if poll_due {
                inner.last_poll_at = Some(now);
            }

            let mut targets: Vec<(String, NaiveDate)> = Vec::new();
            if self.settings.mode == ExecutionMode::Dryrun {
                if let Some(date) = inner.trading_date {
                    let mut seen = HashSet::new();
                    for s in inner.streams.values() {
                        if !s.is_hydrated()
                            && !s.is_committed()
                            && seen.insert(s.canonical().to_string())
                        {
                            targets.push((s.canonical().to_string(), date));
                        }
                    }
                }
            }
            (poll_due, targets)
        };

        // Phase 2: file I/O outside the engine mutex.
        let polled = if poll_due {
            Some(timetable::load(self.settings.timetable_path()))
        } else {
            None
        };
        let mut hydration: Vec<(String, Vec<Bar>)> = Vec::new();
        for (canonical, date) in hydrate_targets {
            let path =
                csv_loader::prehydration_path(&self.settings.data_dir(), &canonical, date);
            match csv_loader::load_bars(&path) {
                Ok(bars) => hydration.push((canonical, bars)),
                Err(e) => {
                    debug!(
                        instrument = %canonical,
                        error = %e,
                        "pre-hydration csv not yet readable"
                    );
                }
            }
        }

        // Phase 3: apply everything under the mutex.
        let mut inner = self.inner.lock();
        if !inner.started {
            return Ok(());
        }

        match polled {
            Some(Ok(loaded)) => self.apply_timetable(&mut inner, loaded, now),
            Some(Err(e)) => {
                warn!(event = %EventKind::TimetableRejected, error = %e, "timetable poll failed");
                if inner.timetable_validated {
                    self.stand_down_run(&mut inner, "timetable failed validation", now);
                }
            }
            None => {}
        }

        for (canonical, bars) in hydration {
            for stream in inner.streams.values_mut() {
                if stream.canonical() == canonical && !stream.is_hydrated() {
                    stream.load_pre_hydration_bars(&bars, now);
                }
            }
        }

        self.drain_corruption_queue(&mut inner, now);
        self.drain_protective_failures(&mut inner, now);

        if inner.recovery.state() == RecoveryState::ReconnectedRecoveryPending
            && inner.recovery.sync_gate_satisfied(now)
        {
            info!(
                event = %EventKind::SyncGatePassed,
                at = %now,
                "broker-sync gate satisfied"
            );
            self.run_recovery(&mut inner, now);
        }
        inner.recovery.settle_idle();

        let gate = self.gate_snapshot(&inner);
        if let Some(exec_journal) = inner.exec_journal.clone() {
            for stream in inner.streams.values_mut() {
                let ctx = StreamContext {
                    now,
                    gate,
                    adapter: self.adapter.as_ref(),
                    exec_journal: &exec_journal,
                    notifier: self.notifier.as_ref(),
                };
                stream.tick(&ctx);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bar routing
    // -------------------------------------------------------------------------

    /// Route one live bar. Never surfaces an error to the host.
    #[allow(clippy::too_many_arguments)]
    pub fn on_bar(
        &self,
        bar_utc: DateTime<Utc>,
        instrument: &str,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: Option<f64>,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.on_bar_inner(bar_utc, instrument, open, high, low, close, volume, now)
        {
            error!(
                event = %EventKind::EngineTickInvalidState,
                error = %e,
                "on_bar failed, bar dropped"
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_bar_inner(
        &self,
        bar_utc: DateTime<Utc>,
        instrument: &str,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.started {
            return Ok(());
        }
        inner.recovery.note_bar(now);

        if bar_utc > now + Duration::seconds(FUTURE_BAR_TOLERANCE_SECS) {
            inner.engine_rejects.future_bar += 1;
            debug!(
                event = %EventKind::BarRejected,
                reason = "FUTURE_BAR",
                bar_utc = %bar_utc,
                now = %now,
                "future bar dropped"
            );
            return Ok(());
        }

        let Some(trading_date) = inner.trading_date else {
            inner.engine_rejects.trading_date_unlocked += 1;
            debug!(
                event = %EventKind::BarRejected,
                reason = "TRADING_DATE_UNLOCKED",
                "bar before trading-date lock dropped"
            );
            return Ok(());
        };

        let Some(spec) = inner.spec.clone() else {
            return Ok(());
        };
        if spec.instrument(instrument).is_none() {
            inner.engine_rejects.unknown_instrument += 1;
            debug!(
                event = %EventKind::BarRejected,
                reason = "UNKNOWN_INSTRUMENT",
                instrument,
                "bar for unknown instrument dropped"
            );
            return Ok(());
        }
        let canonical = spec.canonical_of(instrument).to_string();

        // Session window: [previous-day session-start, trading-date 16:00)
        // Chicago, session start instrument-specific.
        let session_start = inner
            .session_starts
            .get(&canonical)
            .cloned()
            .unwrap_or_else(|| self.settings.default_session_start.clone());
        let prev_day = trading_date
            .pred_opt()
            .context("trading date has no predecessor")?;
        let window_start = time_service::construct_chicago_utc(prev_day, &session_start)?;
        let window_end = time_service::construct_chicago_utc(trading_date, SESSION_END_TIME)?;
        if bar_utc < window_start || bar_utc >= window_end {
            inner.engine_rejects.out_of_session += 1;
            debug!(
                event = %EventKind::BarRejected,
                reason = "OUT_OF_SESSION",
                bar_utc = %bar_utc,
                "bar outside session window dropped"
            );
            return Ok(());
        }

        let bar = Bar {
            open_utc: bar_utc,
            open,
            high,
            low,
            close,
            volume,
            source: BarSource::Live,
        };
        let gate = self.gate_snapshot(&inner);
        let Some(exec_journal) = inner.exec_journal.clone() else {
            return Ok(());
        };
        // Single critical section: every matching stream sees this bar
        // before any other engine mutation.
        for stream in inner.streams.values_mut() {
            if stream.canonical() == canonical {
                let ctx = StreamContext {
                    now,
                    gate,
                    adapter: self.adapter.as_ref(),
                    exec_journal: &exec_journal,
                    notifier: self.notifier.as_ref(),
                };
                stream.on_bar(bar.clone(), &ctx, false);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Timetable
    // -------------------------------------------------------------------------

    fn apply_timetable(&self, inner: &mut EngineInner, loaded: LoadedTimetable, now: DateTime<Utc>) {
        if inner.timetable_hash.as_deref() == Some(loaded.content_hash.as_str()) {
            return;
        }

        match inner.trading_date {
            None => {
                inner.trading_date = Some(loaded.trading_date);
                info!(
                    event = %EventKind::TradingDateLocked,
                    trading_date = %loaded.trading_date,
                    "trading date locked from timetable"
                );
                match ExecutionJournal::open(&self.settings.project_root, loaded.trading_date) {
                    Ok((journal, corrupt)) => {
                        let journal = Arc::new(journal);
                        let queue = self.corrupt_streams.clone();
                        journal.set_corruption_handler(Box::new(move |stream_id| {
                            queue.lock().push(stream_id.to_string());
                        }));
                        let costs = self.execution_costs.clone();
                        journal.set_cost_handler(Box::new(move |cost| {
                            *costs.lock() += cost;
                        }));
                        self.corrupt_streams.lock().extend(corrupt);
                        inner.exec_journal = Some(journal);
                    }
                    Err(e) => {
                        error!(error = %e, "execution journal unavailable");
                        self.stand_down_run(inner, "execution journal unavailable", now);
                        return;
                    }
                }
            }
            Some(locked) if locked != loaded.trading_date => {
                error!(
                    locked = %locked,
                    incoming = %loaded.trading_date,
                    "timetable trading date changed mid-run"
                );
                self.stand_down_run(inner, "trading date changed mid-run", now);
                return;
            }
            Some(_) => {}
        }

        inner.timetable_validated = true;
        inner.timetable_hash = Some(loaded.content_hash.clone());

        let Some(spec) = inner.spec.clone() else {
            return;
        };
        let Some(engine_canonical) = inner.canonical.clone() else {
            return;
        };
        let Some(store) = inner.journal_store.clone() else {
            return;
        };

        let mut created = 0usize;
        for directive in loaded.timetable.enabled_directives() {
            let dir_canonical = spec.canonical_of(&directive.instrument).to_string();
            if dir_canonical != engine_canonical {
                info!(
                    event = %EventKind::CanonicalMismatch,
                    stream = %directive.stream,
                    instrument = %directive.instrument,
                    engine_canonical = %engine_canonical,
                    "directive skipped, canonical does not match this instance"
                );
                continue;
            }

            let stream_id = canonicalise_stream_id(
                &directive.stream,
                &self.settings.execution_instrument,
                &dir_canonical,
            );
            if !stream_id.starts_with(dir_canonical.as_str()) {
                warn!(
                    stream = %directive.stream,
                    canonicalised = %stream_id,
                    "stream id does not begin with its canonical instrument, skipped"
                );
                continue;
            }

            if let Some(existing) = inner.streams.get_mut(&stream_id) {
                if existing.is_committed() {
                    continue;
                }
                if let Err(e) = existing.apply_directive_update(
                    &directive.slot_time,
                    loaded.trading_date,
                    now,
                ) {
                    warn!(stream = %stream_id, error = %e, "directive update rejected");
                }
                continue;
            }

            let Some(session) = spec.session(&directive.session) else {
                warn!(
                    stream = %stream_id,
                    session = %directive.session,
                    "unknown session, directive skipped"
                );
                continue;
            };
            if !spec.slot_permitted(&directive.session, &directive.slot_time) {
                warn!(
                    stream = %stream_id,
                    session = %directive.session,
                    slot_time = %directive.slot_time,
                    "slot time not permitted for session, directive skipped"
                );
                continue;
            }
            let Some(inst) = spec.instrument(&dir_canonical) else {
                warn!(stream = %stream_id, "canonical instrument missing from spec, skipped");
                continue;
            };
            let Some(quantity) = inner
                .policy
                .as_ref()
                .and_then(|p| p.order_quantity(&dir_canonical, &self.settings.execution_instrument))
            else {
                warn!(
                    stream = %stream_id,
                    "policy yields no quantity for this stream, skipped"
                );
                continue;
            };

            let cfg = StreamConfig {
                stream_id: stream_id.clone(),
                canonical: dir_canonical.clone(),
                execution_instrument: self.settings.execution_instrument.clone(),
                session: directive.session.clone(),
                trading_date: loaded.trading_date,
                slot_time: directive.slot_time.clone(),
                range_start_time: session.range_start_time.clone(),
                market_close_time: spec.market_close_time.clone(),
                tick_size: inst.tick_size,
                base_target: inst.base_target,
                quantity,
                tick_rounding: spec.tick_rounding,
                mode: self.settings.mode,
            };

            let machine = match store.load_last(loaded.trading_date, &stream_id) {
                Ok(Some(last)) if last.committed => {
                    StreamStateMachine::reattach_committed(cfg, store.clone(), &last)
                }
                Ok(_) => StreamStateMachine::new(
                    cfg,
                    store.clone(),
                    Some(loaded.content_hash.clone()),
                )
                .map(|mut m| {
                    m.arm(now);
                    m
                }),
                Err(e) => {
                    warn!(
                        event = %EventKind::JournalCorruption,
                        stream = %stream_id,
                        error = %e,
                        "stream journal corrupt, standing stream down"
                    );
                    StreamStateMachine::new(
                        cfg,
                        store.clone(),
                        Some(loaded.content_hash.clone()),
                    )
                    .map(|mut m| {
                        m.arm(now);
                        m.stand_down(now, "stream journal corrupt");
                        m
                    })
                }
            };

            match machine {
                Ok(machine) => {
                    debug_assert!(machine.stream_id().starts_with(dir_canonical.as_str()));
                    info!(
                        event = %EventKind::StreamCreated,
                        stream = %stream_id,
                        session = %directive.session,
                        slot_time = %directive.slot_time,
                        quantity,
                        "stream created"
                    );
                    inner.streams.insert(stream_id, machine);
                    created += 1;
                }
                Err(e) => {
                    warn!(stream = %stream_id, error = %e, "stream construction failed");
                }
            }
        }

        info!(
            event = %EventKind::TimetableApplied,
            hash = %&loaded.content_hash[..12],
            created,
            total_streams = inner.streams.len(),
            "timetable applied"
        );
    }

    /// Fatal-per-run stand-down: commit every stream closed, clear the
    /// table, unlock the trading date.
    fn stand_down_run(&self, inner: &mut EngineInner, reason: &str, now: DateTime<Utc>) {
        warn!(event = %EventKind::StandDown, reason, "engine standing down");
        for stream in inner.streams.values_mut() {
            stream.stand_down(now, reason);
        }
        inner.streams.clear();
        inner.trading_date = None;
        inner.exec_journal = None;
        inner.timetable_validated = false;
        inner.timetable_hash = None;
        self.notifier
            .notify(Priority::Critical, "ENGINE_STAND_DOWN", reason);
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    fn drain_corruption_queue(&self, inner: &mut EngineInner, now: DateTime<Utc>) {
        let corrupt: Vec<String> = std::mem::take(&mut *self.corrupt_streams.lock());
        for stream_id in corrupt {
            if stream_id == CORRUPTION_ALL_STREAMS {
                warn!(
                    event = %EventKind::JournalCorruption,
                    "unattributable journal corruption, standing all streams down"
                );
                self.notifier.notify(
                    Priority::Critical,
                    "JOURNAL_CORRUPTION",
                    "unattributable execution journal corruption",
                );
                for stream in inner.streams.values_mut() {
                    stream.stand_down(now, "execution journal corruption");
                }
            } else if let Some(stream) = inner.streams.get_mut(&stream_id) {
                self.notifier.notify(
                    Priority::Critical,
                    "JOURNAL_CORRUPTION",
                    &format!("execution journal corruption on {stream_id}"),
                );
                stream.stand_down(now, "execution journal corruption");
            }
        }
    }

    fn drain_protective_failures(&self, inner: &mut EngineInner, now: DateTime<Utc>) {
        let failures: Vec<String> = std::mem::take(&mut *self.protective_failures.lock());
        for intent_id in failures {
            let target = inner.streams.values_mut().find(|s| {
                s.intent().map(|i| i.intent_id == intent_id).unwrap_or(false)
            });
            if let Some(stream) = target {
                warn!(
                    event = %EventKind::ProtectiveOrderFailure,
                    stream = %stream.stream_id(),
                    intent_id = %intent_id,
                    "protective order failure signalled"
                );
                self.notifier.notify(
                    Priority::High,
                    "PROTECTIVE_ORDER_FAILURE",
                    &format!("{}: intent {intent_id}", stream.stream_id()),
                );
                stream.stand_down(now, "protective order failure");
            } else {
                warn!(intent_id = %intent_id, "protective failure for unknown intent");
            }
        }
    }

    /// The six-step recovery runner. Single-threaded; a concurrent trigger
    /// is a no-op via the secondary mutex.
    fn run_recovery(&self, inner: &mut EngineInner, now: DateTime<Utc>) {
        let Some(_busy) = self.recovery_busy.try_lock() else {
            debug!("recovery already in progress, trigger ignored");
            return;
        };
        inner.recovery.begin_recovery(now);

        // 1. Snapshot the broker account.
        let snapshot = self.adapter.get_account_snapshot(now);
        debug!(
            positions = snapshot.positions.len(),
            working_orders = snapshot.working_orders.len(),
            "recovery snapshot taken"
        );

        // 2. Reconcile positions against streams. Any unmatched non-flat
        // position aborts recovery; operator intervention required.
        let mut reconciled: Vec<String> = Vec::new();
        for pos in snapshot.positions.iter().filter(|p| p.quantity != 0) {
            let matched = inner.streams.values().find_map(|s| {
                s.intent()
                    .filter(|i| {
                        i.instrument == pos.instrument
                            && s.commit_reason() == Some(CommitReason::EntrySubmitted)
                    })
                    .map(|i| i.intent_id.clone())
            });
            match matched {
                Some(intent_id) => reconciled.push(intent_id),
                None => {
                    error!(
                        instrument = %pos.instrument,
                        quantity = pos.quantity,
                        "unmatched non-flat position, aborting recovery"
                    );
                    self.notifier.notify(
                        Priority::Critical,
                        "RECOVERY_UNMATCHED_POSITION",
                        &format!("{} qty {}", pos.instrument, pos.quantity),
                    );
                    inner.recovery.abort_recovery("unmatched position", now);
                    return;
                }
            }
        }

        // 3. Cancel robot-owned working orders only.
        let cancelled = self
            .adapter
            .cancel_robot_owned_working_orders(&snapshot, now);
        debug!(cancelled, "robot-owned working orders cancelled");

        // 4. Re-establish protective orders for reconciled positions.
        if !reconciled.is_empty() {
            let Some(support) = self.adapter.as_recovery_support() else {
                error!("adapter cannot rebuild protective orders");
                self.notifier.notify(
                    Priority::Critical,
                    "RECOVERY_PROTECTIVE_REBUILD_FAILED",
                    "adapter has no recovery support",
                );
                inner.recovery.abort_recovery("no recovery support", now);
                return;
            };
            for intent_id in &reconciled {
                if !support.resubmit_protective_orders(intent_id, now) {
                    error!(intent_id = %intent_id, "protective rebuild failed");
                    self.notifier.notify(
                        Priority::Critical,
                        "RECOVERY_PROTECTIVE_REBUILD_FAILED",
                        intent_id,
                    );
                    inner.recovery.abort_recovery("protective rebuild failed", now);
                    return;
                }
            }
        }

        // 5. Rebuild streams: uncommitted locked streams carry no working
        // orders before entry; stale intent orders are cancelled.
        for stream in inner.streams.values_mut() {
            if !stream.is_committed() && stream.state() == StreamState::RangeLocked {
                if let Some(intent) = stream.intent() {
                    let intent_id = intent.intent_id.clone();
                    self.adapter.cancel_intent_orders(&intent_id, now);
                    debug!(
                        stream = %stream.stream_id(),
                        intent_id = %intent_id,
                        "stale intent orders cancelled during rebuild"
                    );
                }
            }
        }

        // 6. Done.
        inner.recovery.complete_recovery(now);
    }

    // -------------------------------------------------------------------------
    // Host-facing events and queries
    // -------------------------------------------------------------------------

    pub fn on_connection_status_update(
        &self,
        status: ConnectionStatus,
        name: &str,
        now: DateTime<Utc>,
    ) {
        self.inner.lock().recovery.on_status(status, name, now);
    }

    pub fn on_broker_order_update_observed(&self, now: DateTime<Utc>) {
        self.inner.lock().recovery.note_order_update(now);
    }

    pub fn on_broker_execution_update_observed(&self, now: DateTime<Utc>) {
        self.inner.lock().recovery.note_execution_update(now);
    }

    /// Signal from the adapter/host that a protective order for an intent
    /// failed; the owning stream stands down on the next tick.
    pub fn on_protective_order_failure(&self, intent_id: &str) {
        self.protective_failures.lock().push(intent_id.to_string());
    }

    /// Bulk historical-bar delivery (SIM pre-hydration).
    pub fn load_pre_hydration_bars(&self, instrument: &str, bars: &[Bar], now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if !inner.started {
            return;
        }
        let Some(spec) = inner.spec.clone() else {
            return;
        };
        let canonical = spec.canonical_of(instrument).to_string();
        for stream in inner.streams.values_mut() {
            if stream.canonical() == canonical {
                stream.load_pre_hydration_bars(bars, now);
            }
        }
    }

    pub fn set_session_start_time(&self, instrument: &str, hhmm: &str) -> Result<()> {
        time_service::parse_hhmm(hhmm)?;
        let mut inner = self.inner.lock();
        let key = inner
            .spec
            .as_ref()
            .map(|s| s.canonical_of(instrument).to_string())
            .unwrap_or_else(|| instrument.to_string());
        info!(instrument = %key, session_start = hhmm, "session start time set");
        inner.session_starts.insert(key, hhmm.to_string());
        Ok(())
    }

    pub fn set_account_info(&self, account: &str, environment: &str) {
        info!(account, environment, "account info set");
        self.inner.lock().account = Some((account.to_string(), environment.to_string()));
    }

    pub fn set_kill_switch(&self, enabled: bool) {
        warn!(enabled, "kill switch toggled");
        self.inner.lock().kill_switch = enabled;
    }

    /// Whether every stream on this instrument's canonical has completed
    /// pre-hydration.
    pub fn are_streams_ready_for_instrument(&self, instrument: &str) -> bool {
        let inner = self.inner.lock();
        let Some(spec) = &inner.spec else {
            return false;
        };
        let canonical = spec.canonical_of(instrument);
        let mut any = false;
        for s in inner.streams.values() {
            if s.canonical() == canonical {
                any = true;
                if !s.is_hydrated() && !s.is_committed() {
                    return false;
                }
            }
        }
        any
    }

    /// The historical window a BarsRequest should cover for this
    /// instrument: earliest range start to latest slot over uncommitted
    /// streams.
    pub fn get_bars_request_time_range(
        &self,
        instrument: &str,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let inner = self.inner.lock();
        let Some(spec) = &inner.spec else {
            return None;
        };
        let canonical = spec.canonical_of(instrument);
        let mut range: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        for s in inner.streams.values() {
            if s.canonical() == canonical && !s.is_committed() {
                let (start, end) = s.bars_request_time_range();
                range = Some(match range {
                    None => (start, end),
                    Some((lo, hi)) => (lo.min(start), hi.max(end)),
                });
            }
        }
        range
    }

    pub fn get_order_quantity(&self, canonical: &str, execution: &str) -> Option<u32> {
        self.inner
            .lock()
            .policy
            .as_ref()
            .and_then(|p| p.order_quantity(canonical, execution))
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.inner.lock().recovery.state()
    }

    pub fn trading_date(&self) -> Option<NaiveDate> {
        self.inner.lock().trading_date
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().started
    }

    /// Stream states keyed by id, for the heartbeat and tests.
    pub fn stream_states(&self) -> HashMap<String, (StreamState, Option<CommitReason>)> {
        self.inner
            .lock()
            .streams
            .iter()
            .map(|(id, s)| (id.clone(), (s.state(), s.commit_reason())))
            .collect()
    }

    /// Periodic health heartbeat: uptime, stream states, rejection totals.
    pub fn heartbeat(&self, now: DateTime<Utc>) {
        let inner = self.inner.lock();
        if !inner.started {
            return;
        }
        let committed = inner.streams.values().filter(|s| s.is_committed()).count();
        let stream_rejects: u64 = inner.streams.values().map(|s| s.rejections().total()).sum();
        info!(
            event = %EventKind::Heartbeat,
            run_id = %inner.run_id,
            at = %now,
            recovery = %inner.recovery.state(),
            trading_date = ?inner.trading_date,
            account = ?inner.account,
            streams = inner.streams.len(),
            committed,
            engine_bar_rejects = inner.engine_rejects.total(),
            stream_bar_rejects = stream_rejects,
            "engine heartbeat"
        );
    }

    fn gate_snapshot(&self, inner: &EngineInner) -> EngineGateSnapshot {
        EngineGateSnapshot {
            mode: self.settings.mode,
            kill_switch: inner.kill_switch,
            recovery_state: inner.recovery.state(),
            timetable_validated: inner.timetable_validated,
        }
    }
}

impl std::fmt::Debug for RobotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RobotEngine")
            .field("run_id", &inner.run_id)
            .field("mode", &self.settings.mode)
            .field("started", &inner.started)
            .field("trading_date", &inner.trading_date)
            .field("streams", &inner.streams.len())
            .finish()
    }
}
