// =============================================================================
// Shared types used across the Meridian breakout engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// How the engine executes intents. Live trading is blocked at startup; the
/// variant exists so a misconfigured host gets an explicit refusal instead of
/// a silent downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Dryrun,
    Sim,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Dryrun
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dryrun => write!(f, "DRYRUN"),
            Self::Sim => write!(f, "SIM"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Trade direction for a breakout entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Where a bar came from. Precedence resolves duplicate bar-open timestamps:
/// LIVE > BARSREQUEST > CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarSource {
    Live,
    // One word on the wire, so the derive must not split it.
    #[serde(rename = "BARSREQUEST")]
    BarsRequest,
    Csv,
}

impl BarSource {
    /// Numeric precedence; higher wins on a duplicate bar-open key.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Live => 3,
            Self::BarsRequest => 2,
            Self::Csv => 1,
        }
    }
}

impl std::fmt::Display for BarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::BarsRequest => write!(f, "BARSREQUEST"),
            Self::Csv => write!(f, "CSV"),
        }
    }
}

/// Connection / recovery state of the engine. Execution is allowed only in
/// `ConnectedOk` and `RecoveryComplete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    ConnectedOk,
    DisconnectFailClosed,
    ReconnectedRecoveryPending,
    RecoveryRunning,
    RecoveryComplete,
}

impl RecoveryState {
    pub fn execution_allowed(self) -> bool {
        matches!(self, Self::ConnectedOk | Self::RecoveryComplete)
    }
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectedOk => write!(f, "CONNECTED_OK"),
            Self::DisconnectFailClosed => write!(f, "DISCONNECT_FAIL_CLOSED"),
            Self::ReconnectedRecoveryPending => write!(f, "RECONNECTED_RECOVERY_PENDING"),
            Self::RecoveryRunning => write!(f, "RECOVERY_RUNNING"),
            Self::RecoveryComplete => write!(f, "RECOVERY_COMPLETE"),
        }
    }
}

/// Lifecycle state of a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    PreHydration,
    Armed,
    RangeBuilding,
    RangeLocked,
    Done,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreHydration => write!(f, "PRE_HYDRATION"),
            Self::Armed => write!(f, "ARMED"),
            Self::RangeBuilding => write!(f, "RANGE_BUILDING"),
            Self::RangeLocked => write!(f, "RANGE_LOCKED"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// Why a stream committed. A committed stream is terminal for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitReason {
    EntrySubmitted,
    NoTradeMarketClose,
    NoTradeRangeDataMissing,
    RangeInvalidated,
    StreamStandDown,
}

impl std::fmt::Display for CommitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntrySubmitted => write!(f, "ENTRY_SUBMITTED"),
            Self::NoTradeMarketClose => write!(f, "NO_TRADE_MARKET_CLOSE"),
            Self::NoTradeRangeDataMissing => write!(f, "NO_TRADE_RANGE_DATA_MISSING"),
            Self::RangeInvalidated => write!(f, "RANGE_INVALIDATED"),
            Self::StreamStandDown => write!(f, "STREAM_STAND_DOWN"),
        }
    }
}

/// What fired an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerReason {
    ImmediateAtLock,
    Breakout,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImmediateAtLock => write!(f, "IMMEDIATE_AT_LOCK"),
            Self::Breakout => write!(f, "BREAKOUT"),
        }
    }
}

/// Closed set of categorical event types for the rolling event log. Every
/// structured log line that represents an engine event carries one of these
/// as its `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    EngineStart,
    EngineStop,
    TradingDateLocked,
    TimetableApplied,
    TimetableRejected,
    CanonicalMismatch,
    StreamCreated,
    StreamArmed,
    StreamReattachedCommitted,
    SlotTimeUpdated,
    RangeLocked,
    RangeInvalidated,
    RangeDataMissing,
    EntryDetected,
    ExecutionSubmitted,
    ExecutionSkippedDuplicate,
    ExecutionRejected,
    ExecutionBlocked,
    ProtectiveOrderFailure,
    BarRejected,
    DstTransitionDetected,
    BarsRequestTimeout,
    EngineTickInvalidState,
    DisconnectDetected,
    Reconnected,
    SyncGatePassed,
    RecoveryStarted,
    RecoveryComplete,
    RecoveryAborted,
    MarketLockAcquired,
    MarketLockReleased,
    JournalCorruption,
    StandDown,
    SummaryWritten,
    Heartbeat,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EngineStart => "ENGINE_START",
            Self::EngineStop => "ENGINE_STOP",
            Self::TradingDateLocked => "TRADING_DATE_LOCKED",
            Self::TimetableApplied => "TIMETABLE_APPLIED",
            Self::TimetableRejected => "TIMETABLE_REJECTED",
            Self::CanonicalMismatch => "CANONICAL_MISMATCH",
            Self::StreamCreated => "STREAM_CREATED",
            Self::StreamArmed => "STREAM_ARMED",
            Self::StreamReattachedCommitted => "STREAM_REATTACHED_COMMITTED",
            Self::SlotTimeUpdated => "SLOT_TIME_UPDATED",
            Self::RangeLocked => "RANGE_LOCKED",
            Self::RangeInvalidated => "RANGE_INVALIDATED",
            Self::RangeDataMissing => "RANGE_DATA_MISSING",
            Self::EntryDetected => "ENTRY_DETECTED",
            Self::ExecutionSubmitted => "EXECUTION_SUBMITTED",
            Self::ExecutionSkippedDuplicate => "EXECUTION_SKIPPED_DUPLICATE",
            Self::ExecutionRejected => "EXECUTION_REJECTED",
            Self::ExecutionBlocked => "EXECUTION_BLOCKED",
            Self::ProtectiveOrderFailure => "PROTECTIVE_ORDER_FAILURE",
            Self::BarRejected => "BAR_REJECTED",
            Self::DstTransitionDetected => "DST_TRANSITION_DETECTED",
            Self::BarsRequestTimeout => "BARSREQUEST_TIMEOUT",
            Self::EngineTickInvalidState => "ENGINE_TICK_INVALID_STATE",
            Self::DisconnectDetected => "DISCONNECT_DETECTED",
            Self::Reconnected => "RECONNECTED",
            Self::SyncGatePassed => "SYNC_GATE_PASSED",
            Self::RecoveryStarted => "RECOVERY_STARTED",
            Self::RecoveryComplete => "RECOVERY_COMPLETE",
            Self::RecoveryAborted => "RECOVERY_ABORTED",
            Self::MarketLockAcquired => "MARKET_LOCK_ACQUIRED",
            Self::MarketLockReleased => "MARKET_LOCK_RELEASED",
            Self::JournalCorruption => "JOURNAL_CORRUPTION",
            Self::StandDown => "STAND_DOWN",
            Self::SummaryWritten => "SUMMARY_WRITTEN",
            Self::Heartbeat => "HEARTBEAT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_precedence_ordering() {
        assert!(BarSource::Live.precedence() > BarSource::BarsRequest.precedence());
        assert!(BarSource::BarsRequest.precedence() > BarSource::Csv.precedence());
    }

    #[test]
    fn recovery_execution_allowed() {
        assert!(RecoveryState::ConnectedOk.execution_allowed());
        assert!(RecoveryState::RecoveryComplete.execution_allowed());
        assert!(!RecoveryState::DisconnectFailClosed.execution_allowed());
        assert!(!RecoveryState::ReconnectedRecoveryPending.execution_allowed());
        assert!(!RecoveryState::RecoveryRunning.execution_allowed());
    }

    #[test]
    fn serde_screaming_snake_roundtrip() {
        let json = serde_json::to_string(&CommitReason::NoTradeMarketClose).unwrap();
        assert_eq!(json, "\"NO_TRADE_MARKET_CLOSE\"");
        let back: CommitReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CommitReason::NoTradeMarketClose);

        let json = serde_json::to_string(&StreamState::PreHydration).unwrap();
        assert_eq!(json, "\"PRE_HYDRATION\"");

        let json = serde_json::to_string(&BarSource::BarsRequest).unwrap();
        assert_eq!(json, "\"BARSREQUEST\"");
        let back: BarSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BarSource::BarsRequest);
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ExecutionMode::Dryrun.to_string(), "DRYRUN");
        assert_eq!(TriggerReason::ImmediateAtLock.to_string(), "IMMEDIATE_AT_LOCK");
        assert_eq!(
            RecoveryState::ReconnectedRecoveryPending.to_string(),
            "RECONNECTED_RECOVERY_PENDING"
        );
    }
}
