//! Call-control metrics
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! embedding process installs a recorder.

use crate::domain::session::SessionState;
use crate::domain::shared::value_objects::Direction;
use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Describe metrics. Call once after installing a recorder.
pub fn describe_metrics() {
    describe_gauge!(
        "sip_sessions_active",
        "Number of invite sessions held by the registry"
    );
    describe_counter!(
        "sip_session_transitions_total",
        "Total number of session state transitions, by target state"
    );
    describe_counter!(
        "sip_calls_total",
        "Total number of SIP calls, by direction"
    );
    describe_counter!(
        "sip_registrations_total",
        "Total number of SIP registrations"
    );
}

/// Record a session entering `state`
pub fn record_transition(state: SessionState) {
    counter!("sip_session_transitions_total", "state" => state.name()).increment(1);
}

pub fn record_call(direction: Direction) {
    counter!("sip_calls_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_registration(success: bool) {
    counter!("sip_registrations_total", "success" => success.to_string()).increment(1);
}

pub fn update_active_sessions(count: usize) {
    gauge!("sip_sessions_active").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_transition(SessionState::Confirmed);
        record_call(Direction::Outgoing);
        record_registration(true);
        update_active_sessions(3);
    }
}
