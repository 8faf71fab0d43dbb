//! Connectivity state rules. Pure functions; callers own persistence.
//!
//! Message arrival proves liveness and is the only way a sensor recovers.
//! The periodic sweep is the only way a silent sensor is noticed, since
//! devices can stop publishing without announcing it.

use crate::models::{ConnectivityState, ThresholdAlert};
use time::{Duration, OffsetDateTime};

/// What the sweep needs to know about one sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepCandidate {
    pub sensor_id: i64,
    pub state: ConnectivityState,
    pub last_seen_at: Option<OffsetDateTime>,
    pub ttl: Duration,
}

/// State after a message arrives: the pushed state if the device sent one,
/// otherwise connected.
pub fn on_message(pushed: Option<ConnectivityState>) -> ConnectivityState {
    pushed.unwrap_or(ConnectivityState::Connected)
}

/// Connected iff the sensor was seen within its TTL. Never-seen sensors are
/// disconnected.
pub fn evaluate(
    last_seen_at: Option<OffsetDateTime>,
    ttl: Duration,
    now: OffsetDateTime,
) -> ConnectivityState {
    match last_seen_at {
        Some(seen) if now - seen <= ttl => ConnectivityState::Connected,
        _ => ConnectivityState::Disconnected,
    }
}

/// The state to write for `candidate`, or `None` when the stored one holds.
pub fn reconcile(candidate: &SweepCandidate, now: OffsetDateTime) -> Option<ConnectivityState> {
    let computed = evaluate(candidate.last_seen_at, candidate.ttl, now);
    (computed != candidate.state).then_some(computed)
}

/// Oldest `last_seen_at` still considered connected at `now`.
pub fn cutoff(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    now - ttl
}

/// Threshold breach for a numeric reading. Non-numeric values never alert.
pub fn threshold_alert(value: &str, min: Option<f64>, max: Option<f64>) -> Option<ThresholdAlert> {
    let numeric: f64 = value.trim().parse().ok()?;
    if !numeric.is_finite() {
        return None;
    }
    match (min, max) {
        (Some(min), _) if numeric < min => Some(ThresholdAlert::AlertMin),
        (_, Some(max)) if numeric > max => Some(ThresholdAlert::AlertMax),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-05-01 12:00 UTC);

    #[test]
    fn arrival_always_means_connected_unless_pushed() {
        assert_eq!(on_message(None), ConnectivityState::Connected);
        assert_eq!(
            on_message(Some(ConnectivityState::Disconnected)),
            ConnectivityState::Disconnected
        );
    }

    #[test]
    fn ttl_boundary_is_inclusive() {
        let ttl = Duration::minutes(5);
        assert_eq!(
            evaluate(Some(NOW - Duration::minutes(5)), ttl, NOW),
            ConnectivityState::Connected
        );
        assert_eq!(
            evaluate(Some(NOW - Duration::minutes(5) - Duration::milliseconds(1)), ttl, NOW),
            ConnectivityState::Disconnected
        );
        assert_eq!(evaluate(None, ttl, NOW), ConnectivityState::Disconnected);
    }

    #[test]
    fn reconcile_only_reports_changes() {
        let mut candidate = SweepCandidate {
            sensor_id: 1,
            state: ConnectivityState::Connected,
            last_seen_at: Some(NOW - Duration::minutes(30)),
            ttl: Duration::minutes(5),
        };
        assert_eq!(reconcile(&candidate, NOW), Some(ConnectivityState::Disconnected));

        candidate.state = ConnectivityState::Disconnected;
        assert_eq!(reconcile(&candidate, NOW), None);

        candidate.last_seen_at = Some(NOW - Duration::minutes(1));
        assert_eq!(reconcile(&candidate, NOW), Some(ConnectivityState::Connected));
    }

    #[test]
    fn cutoff_matches_evaluate() {
        let ttl = Duration::minutes(10);
        let edge = cutoff(NOW, ttl);
        assert_eq!(evaluate(Some(edge), ttl, NOW), ConnectivityState::Connected);
    }

    #[test]
    fn thresholds_flag_numeric_breaches_only() {
        assert_eq!(
            threshold_alert("4.5", Some(5.0), Some(30.0)),
            Some(ThresholdAlert::AlertMin)
        );
        assert_eq!(
            threshold_alert("31", Some(5.0), Some(30.0)),
            Some(ThresholdAlert::AlertMax)
        );
        assert_eq!(threshold_alert("20", Some(5.0), Some(30.0)), None);
        assert_eq!(threshold_alert("20", None, None), None);
        assert_eq!(threshold_alert("wet", Some(5.0), None), None);
        assert_eq!(threshold_alert("NaN", Some(5.0), None), None);
    }
}
