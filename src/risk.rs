// =============================================================================
// Risk Gate — the single pre-submission yes/no
// =============================================================================
//
// A pure function over a snapshot of engine and stream state. Every check is
// fail-closed; the first failing check names the denial reason. This is the
// only place that answers "is execution allowed" for the stream machine.
// Emergency flatten paths bypass the gate by construction (they never call
// it).
// =============================================================================

use chrono::{DateTime, Utc};

use crate::types::{ExecutionMode, RecoveryState};

/// Snapshot of everything the gate needs. Built by the engine per critical
/// section; streams add their own fields at evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct GateInput {
    pub mode: ExecutionMode,
    pub kill_switch: bool,
    pub recovery_state: RecoveryState,
    pub timetable_validated: bool,
    pub stream_armed: bool,
    pub session_known: bool,
    pub slot_time_utc: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Engine-level slice of the gate input. The engine copies one of these per
/// critical section; streams complete it with their own fields at
/// evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct EngineGateSnapshot {
    pub mode: ExecutionMode,
    pub kill_switch: bool,
    pub recovery_state: RecoveryState,
    pub timetable_validated: bool,
}

impl EngineGateSnapshot {
    pub fn for_stream(
        &self,
        stream_armed: bool,
        session_known: bool,
        slot_time_utc: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GateInput {
        GateInput {
            mode: self.mode,
            kill_switch: self.kill_switch,
            recovery_state: self.recovery_state,
            timetable_validated: self.timetable_validated,
            stream_armed,
            session_known,
            slot_time_utc,
            now,
        }
    }
}

/// The gate's answer. `reason` is set iff denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<&'static str>,
}

impl GateDecision {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    fn deny(reason: &'static str) -> Self {
        Self { allowed: false, reason: Some(reason) }
    }
}

/// Evaluate the gate. Checks run in severity order; the first denial wins.
pub fn evaluate(input: &GateInput) -> GateDecision {
    if input.mode == ExecutionMode::Live {
        return GateDecision::deny("LIVE_MODE_BLOCKED");
    }
    if input.kill_switch {
        return GateDecision::deny("KILL_SWITCH_ENABLED");
    }
    if !input.recovery_state.execution_allowed() {
        return GateDecision::deny("RECOVERY_NOT_COMPLETE");
    }
    if !input.timetable_validated {
        return GateDecision::deny("TIMETABLE_NOT_VALIDATED");
    }
    if !input.stream_armed {
        return GateDecision::deny("STREAM_NOT_ARMED");
    }
    if !input.session_known {
        return GateDecision::deny("SESSION_UNKNOWN");
    }
    if input.now < input.slot_time_utc {
        return GateDecision::deny("SLOT_TIME_NOT_REACHED");
    }
    GateDecision::allow()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_input() -> GateInput {
        GateInput {
            mode: ExecutionMode::Sim,
            kill_switch: false,
            recovery_state: RecoveryState::ConnectedOk,
            timetable_validated: true,
            stream_armed: true,
            session_known: true,
            slot_time_utc: "2025-07-15T14:30:00Z".parse().unwrap(),
            now: "2025-07-15T14:30:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn clean_input_is_allowed() {
        let decision = evaluate(&open_input());
        assert!(decision.allowed);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn live_mode_denied_first() {
        let mut input = open_input();
        input.mode = ExecutionMode::Live;
        input.kill_switch = true;
        assert_eq!(evaluate(&input).reason, Some("LIVE_MODE_BLOCKED"));
    }

    #[test]
    fn kill_switch_denies() {
        let mut input = open_input();
        input.kill_switch = true;
        assert_eq!(evaluate(&input).reason, Some("KILL_SWITCH_ENABLED"));
    }

    #[test]
    fn every_non_ok_recovery_state_denies() {
        for state in [
            RecoveryState::DisconnectFailClosed,
            RecoveryState::ReconnectedRecoveryPending,
            RecoveryState::RecoveryRunning,
        ] {
            let mut input = open_input();
            input.recovery_state = state;
            let decision = evaluate(&input);
            assert!(!decision.allowed, "{state} should deny");
            assert_eq!(decision.reason, Some("RECOVERY_NOT_COMPLETE"));
        }
        let mut input = open_input();
        input.recovery_state = RecoveryState::RecoveryComplete;
        assert!(evaluate(&input).allowed);
    }

    #[test]
    fn unarmed_stream_denied() {
        let mut input = open_input();
        input.stream_armed = false;
        assert_eq!(evaluate(&input).reason, Some("STREAM_NOT_ARMED"));
    }

    #[test]
    fn unknown_session_denied() {
        let mut input = open_input();
        input.session_known = false;
        assert_eq!(evaluate(&input).reason, Some("SESSION_UNKNOWN"));
    }

    #[test]
    fn slot_time_boundary() {
        let mut input = open_input();
        input.now = "2025-07-15T14:29:59Z".parse().unwrap();
        assert_eq!(evaluate(&input).reason, Some("SLOT_TIME_NOT_REACHED"));

        input.now = input.slot_time_utc;
        assert!(evaluate(&input).allowed);
    }

    #[test]
    fn unvalidated_timetable_denied() {
        let mut input = open_input();
        input.timetable_validated = false;
        assert_eq!(evaluate(&input).reason, Some("TIMETABLE_NOT_VALIDATED"));
    }
}
