//! Probe bookkeeping and health transitions.
//!
//! The transition is a pure function of the current health and the probe
//! outcome so that it can run inside the pool's write lock.

use crate::backend::Health;

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// Compute the next health state.
///
/// `consecutive_failures` is the count after the current outcome has been
/// applied. Operator-set states are returned unchanged.
pub fn next_health(
    current: Health,
    outcome: ProbeOutcome,
    consecutive_failures: u32,
    threshold: u32,
) -> Health {
    if current.is_operator_set() {
        return current;
    }

    match outcome {
        ProbeOutcome::Success if current == Health::Unhealthy => Health::Healthy,
        ProbeOutcome::Failure if current == Health::Healthy && consecutive_failures >= threshold => {
            Health::Unhealthy
        }
        _ => current,
    }
}

/// Per-backend probe state owned by its probe task.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    consecutive_failures: u32,
    threshold: u32,
}

impl HealthProbe {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Fold an outcome into the failure streak and return the next health.
    pub fn record(&mut self, current: Health, outcome: ProbeOutcome) -> Health {
        self.consecutive_failures = match outcome {
            ProbeOutcome::Success => 0,
            ProbeOutcome::Failure => self.consecutive_failures.saturating_add(1),
        };
        next_health(current, outcome, self.consecutive_failures, self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_below_threshold_keep_healthy() {
        let mut probe = HealthProbe::new(3);
        assert_eq!(probe.record(Health::Healthy, ProbeOutcome::Failure), Health::Healthy);
        assert_eq!(probe.record(Health::Healthy, ProbeOutcome::Failure), Health::Healthy);
        assert_eq!(probe.consecutive_failures(), 2);
    }

    #[test]
    fn test_threshold_marks_unhealthy() {
        let mut probe = HealthProbe::new(3);
        let mut health = Health::Healthy;
        for _ in 0..3 {
            health = probe.record(health, ProbeOutcome::Failure);
        }
        assert_eq!(health, Health::Unhealthy);

        // Further failures keep it there
        assert_eq!(probe.record(health, ProbeOutcome::Failure), Health::Unhealthy);
    }

    #[test]
    fn test_success_recovers_and_resets() {
        let mut probe = HealthProbe::new(2);
        probe.record(Health::Healthy, ProbeOutcome::Failure);
        assert_eq!(probe.record(Health::Unhealthy, ProbeOutcome::Success), Health::Healthy);
        assert_eq!(probe.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut probe = HealthProbe::new(3);
        probe.record(Health::Healthy, ProbeOutcome::Failure);
        probe.record(Health::Healthy, ProbeOutcome::Failure);
        probe.record(Health::Healthy, ProbeOutcome::Success);
        assert_eq!(probe.record(Health::Healthy, ProbeOutcome::Failure), Health::Healthy);
    }

    #[test]
    fn test_operator_states_untouched() {
        for state in [Health::Draining, Health::Maintenance] {
            assert_eq!(next_health(state, ProbeOutcome::Success, 0, 3), state);
            assert_eq!(next_health(state, ProbeOutcome::Failure, 10, 3), state);
        }
    }
}
