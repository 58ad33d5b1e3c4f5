// =============================================================================
// Disconnect / recovery state machine and broker-sync gate
// =============================================================================
//
// CONNECTED_OK -> DISCONNECT_FAIL_CLOSED -> RECONNECTED_RECOVERY_PENDING
//   -> RECOVERY_RUNNING -> RECOVERY_COMPLETE -> CONNECTED_OK
//
// While fail-closed, the risk gate denies all non-emergency submissions. The
// sync gate requires post-reconnect evidence the broker feed is live: a bar
// passes immediately, an order/execution update needs a quiet window behind
// it.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::types::{EventKind, RecoveryState};

/// Quiet window required after the most recent order/execution update before
/// the sync gate accepts that signal as liveness.
pub const SYNC_QUIET_WINDOW_SECS: i64 = 5;

/// Connection status as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub struct RecoveryTracker {
    state: RecoveryState,
    disconnected_at: Option<DateTime<Utc>>,
    reconnected_at: Option<DateTime<Utc>>,
    recovery_started_at: Option<DateTime<Utc>>,
    recovery_completed_at: Option<DateTime<Utc>>,
    last_bar_utc: Option<DateTime<Utc>>,
    last_order_update_utc: Option<DateTime<Utc>>,
    last_execution_update_utc: Option<DateTime<Utc>>,
}

impl Default for RecoveryTracker {
    fn default() -> Self {
        Self {
            state: RecoveryState::ConnectedOk,
            disconnected_at: None,
            reconnected_at: None,
            recovery_started_at: None,
            recovery_completed_at: None,
            last_bar_utc: None,
            last_order_update_utc: None,
            last_execution_update_utc: None,
        }
    }
}

impl RecoveryTracker {
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn is_execution_allowed(&self) -> bool {
        self.state.execution_allowed()
    }

    pub fn reconnected_at(&self) -> Option<DateTime<Utc>> {
        self.reconnected_at
    }

    /// Host reports a connection status change.
    pub fn on_status(&mut self, status: ConnectionStatus, name: &str, now: DateTime<Utc>) {
        match status {
            ConnectionStatus::Disconnected => self.on_disconnect(name, now),
            ConnectionStatus::Connected => self.on_reconnect(name, now),
        }
    }

    fn on_disconnect(&mut self, name: &str, now: DateTime<Utc>) {
        if self.state == RecoveryState::DisconnectFailClosed {
            return;
        }
        warn!(
            event = %EventKind::DisconnectDetected,
            connection = name,
            prior_state = %self.state,
            at = %now,
            "connection lost, failing closed"
        );
        self.state = RecoveryState::DisconnectFailClosed;
        self.disconnected_at = Some(now);
    }

    fn on_reconnect(&mut self, name: &str, now: DateTime<Utc>) {
        if self.state != RecoveryState::DisconnectFailClosed {
            return;
        }
        info!(
            event = %EventKind::Reconnected,
            connection = name,
            disconnected_at = ?self.disconnected_at,
            at = %now,
            "reconnected, recovery pending broker sync"
        );
        self.state = RecoveryState::ReconnectedRecoveryPending;
        self.reconnected_at = Some(now);
    }

    pub fn note_bar(&mut self, now: DateTime<Utc>) {
        self.last_bar_utc = Some(now);
    }

    pub fn note_order_update(&mut self, now: DateTime<Utc>) {
        self.last_order_update_utc = Some(now);
    }

    pub fn note_execution_update(&mut self, now: DateTime<Utc>) {
        self.last_execution_update_utc = Some(now);
    }

    /// The broker-sync gate. Only meaningful while recovery is pending.
    ///
    /// Requires, after the reconnect timestamp, at least one of: a bar
    /// update (passes immediately), or an order/execution update followed by
    /// a quiet window since the most recent such update.
    pub fn sync_gate_satisfied(&self, now: DateTime<Utc>) -> bool {
        if self.state != RecoveryState::ReconnectedRecoveryPending {
            return false;
        }
        let Some(reconnected) = self.reconnected_at else {
            return false;
        };

        if self.last_bar_utc.map(|t| t >= reconnected).unwrap_or(false) {
            return true;
        }

        let latest_broker_update = [self.last_order_update_utc, self.last_execution_update_utc]
            .into_iter()
            .flatten()
            .max();
        match latest_broker_update {
            Some(t) if t >= reconnected => {
                now - t >= Duration::seconds(SYNC_QUIET_WINDOW_SECS)
            }
            _ => false,
        }
    }

    pub fn begin_recovery(&mut self, now: DateTime<Utc>) {
        if self.state != RecoveryState::ReconnectedRecoveryPending {
            return;
        }
        info!(
            event = %EventKind::RecoveryStarted,
            at = %now,
            "recovery runner starting"
        );
        self.state = RecoveryState::RecoveryRunning;
        self.recovery_started_at = Some(now);
    }

    pub fn complete_recovery(&mut self, now: DateTime<Utc>) {
        if self.state != RecoveryState::RecoveryRunning {
            return;
        }
        info!(
            event = %EventKind::RecoveryComplete,
            at = %now,
            "recovery complete"
        );
        self.state = RecoveryState::RecoveryComplete;
        self.recovery_completed_at = Some(now);
    }

    /// Abort recovery and stay fail-closed pending operator intervention.
    pub fn abort_recovery(&mut self, reason: &str, now: DateTime<Utc>) {
        if self.state != RecoveryState::RecoveryRunning {
            return;
        }
        warn!(
            event = %EventKind::RecoveryAborted,
            reason,
            at = %now,
            "recovery aborted, staying fail-closed"
        );
        self.state = RecoveryState::ReconnectedRecoveryPending;
        self.recovery_started_at = None;
    }

    /// Idle transition: RECOVERY_COMPLETE settles back to CONNECTED_OK on
    /// the next tick.
    pub fn settle_idle(&mut self) {
        if self.state == RecoveryState::RecoveryComplete {
            self.state = RecoveryState::ConnectedOk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn disconnect_reconnect_walk() {
        let mut t = RecoveryTracker::default();
        assert_eq!(t.state(), RecoveryState::ConnectedOk);
        assert!(t.is_execution_allowed());

        t.on_status(ConnectionStatus::Disconnected, "feed", ts("2025-01-15T15:00:00Z"));
        assert_eq!(t.state(), RecoveryState::DisconnectFailClosed);
        assert!(!t.is_execution_allowed());

        // Duplicate disconnects are absorbed.
        t.on_status(ConnectionStatus::Disconnected, "feed", ts("2025-01-15T15:01:00Z"));
        assert_eq!(t.state(), RecoveryState::DisconnectFailClosed);

        t.on_status(ConnectionStatus::Connected, "feed", ts("2025-01-15T15:03:00Z"));
        assert_eq!(t.state(), RecoveryState::ReconnectedRecoveryPending);
        assert!(!t.is_execution_allowed());
    }

    #[test]
    fn reconnect_without_disconnect_is_noop() {
        let mut t = RecoveryTracker::default();
        t.on_status(ConnectionStatus::Connected, "feed", ts("2025-01-15T15:00:00Z"));
        assert_eq!(t.state(), RecoveryState::ConnectedOk);
    }

    #[test]
    fn bar_liveness_passes_gate_without_quiet_window() {
        let mut t = RecoveryTracker::default();
        t.on_status(ConnectionStatus::Disconnected, "feed", ts("2025-01-15T15:00:00Z"));
        t.on_status(ConnectionStatus::Connected, "feed", ts("2025-01-15T15:03:00Z"));

        // Pre-reconnect bar does not count.
        assert!(!t.sync_gate_satisfied(ts("2025-01-15T15:03:01Z")));

        t.note_bar(ts("2025-01-15T15:03:10Z"));
        // Immediately satisfied, no quiet window.
        assert!(t.sync_gate_satisfied(ts("2025-01-15T15:03:10Z")));
    }

    #[test]
    fn order_update_liveness_needs_quiet_window() {
        let mut t = RecoveryTracker::default();
        t.on_status(ConnectionStatus::Disconnected, "feed", ts("2025-01-15T15:00:00Z"));
        t.on_status(ConnectionStatus::Connected, "feed", ts("2025-01-15T15:03:00Z"));

        t.note_order_update(ts("2025-01-15T15:03:10Z"));
        assert!(!t.sync_gate_satisfied(ts("2025-01-15T15:03:12Z")));
        assert!(t.sync_gate_satisfied(ts("2025-01-15T15:03:15Z")));

        // A newer execution update restarts the quiet window.
        t.note_execution_update(ts("2025-01-15T15:03:14Z"));
        assert!(!t.sync_gate_satisfied(ts("2025-01-15T15:03:16Z")));
        assert!(t.sync_gate_satisfied(ts("2025-01-15T15:03:19Z")));
    }

    #[test]
    fn stale_pre_reconnect_updates_do_not_pass() {
        let mut t = RecoveryTracker::default();
        t.note_order_update(ts("2025-01-15T14:59:00Z"));
        t.note_bar(ts("2025-01-15T14:59:30Z"));
        t.on_status(ConnectionStatus::Disconnected, "feed", ts("2025-01-15T15:00:00Z"));
        t.on_status(ConnectionStatus::Connected, "feed", ts("2025-01-15T15:03:00Z"));

        assert!(!t.sync_gate_satisfied(ts("2025-01-15T15:10:00Z")));
    }

    #[test]
    fn recovery_lifecycle_and_idle_settle() {
        let mut t = RecoveryTracker::default();
        t.on_status(ConnectionStatus::Disconnected, "feed", ts("2025-01-15T15:00:00Z"));
        t.on_status(ConnectionStatus::Connected, "feed", ts("2025-01-15T15:03:00Z"));

        t.begin_recovery(ts("2025-01-15T15:03:20Z"));
        assert_eq!(t.state(), RecoveryState::RecoveryRunning);
        assert!(!t.is_execution_allowed());

        t.complete_recovery(ts("2025-01-15T15:03:21Z"));
        assert_eq!(t.state(), RecoveryState::RecoveryComplete);
        assert!(t.is_execution_allowed());

        t.settle_idle();
        assert_eq!(t.state(), RecoveryState::ConnectedOk);
    }

    #[test]
    fn abort_stays_fail_closed() {
        let mut t = RecoveryTracker::default();
        t.on_status(ConnectionStatus::Disconnected, "feed", ts("2025-01-15T15:00:00Z"));
        t.on_status(ConnectionStatus::Connected, "feed", ts("2025-01-15T15:03:00Z"));
        t.begin_recovery(ts("2025-01-15T15:03:20Z"));

        t.abort_recovery("unmatched position", ts("2025-01-15T15:03:21Z"));
        assert_eq!(t.state(), RecoveryState::ReconnectedRecoveryPending);
        assert!(!t.is_execution_allowed());

        // The gate can pass again and recovery can restart.
        t.note_bar(ts("2025-01-15T15:04:00Z"));
        assert!(t.sync_gate_satisfied(ts("2025-01-15T15:04:00Z")));
    }

    #[test]
    fn begin_from_wrong_state_is_noop() {
        let mut t = RecoveryTracker::default();
        t.begin_recovery(ts("2025-01-15T15:00:00Z"));
        assert_eq!(t.state(), RecoveryState::ConnectedOk);
        t.complete_recovery(ts("2025-01-15T15:00:00Z"));
        assert_eq!(t.state(), RecoveryState::ConnectedOk);
    }
}
