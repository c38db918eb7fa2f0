//! Host-pressure hysteresis driving the broadcast rate

use std::time::Duration;

use crate::monitor::LoopMetrics;

/// Interval between controller samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

const OVERLOAD_P95_MS: f64 = 8.0;
const OVERLOAD_UTILIZATION: f64 = 0.90;
const RECOVER_P95_MS: f64 = 6.0;
const RECOVER_UTILIZATION: f64 = 0.70;

/// Consecutive overload samples before degrading
const DEGRADE_AFTER: u32 = 3;
/// Consecutive recover samples before restoring
const RESTORE_AFTER: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureState {
    Normal,
    Degraded,
}

/// Rate change requested by a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateChange {
    /// Halve the broadcast rate and reset the broadcast deadline
    Degrade,
    /// Restore the normal broadcast rate
    Restore,
}

/// Per-room hysteresis state machine over process-wide loop metrics.
/// Only the broadcast rate is ever changed; the physics rate is fixed.
#[derive(Debug)]
pub struct PressureController {
    state: PressureState,
    overload_streak: u32,
    recover_streak: u32,
}

impl PressureController {
    pub fn new() -> Self {
        Self {
            state: PressureState::Normal,
            overload_streak: 0,
            recover_streak: 0,
        }
    }

    pub fn state(&self) -> PressureState {
        self.state
    }

    /// Feed one metrics sample; returns the rate change to apply, if any
    pub fn sample(&mut self, metrics: LoopMetrics) -> Option<RateChange> {
        let overloaded =
            metrics.p95_ms > OVERLOAD_P95_MS || metrics.utilization > OVERLOAD_UTILIZATION;
        let recovered =
            metrics.p95_ms < RECOVER_P95_MS && metrics.utilization < RECOVER_UTILIZATION;

        match self.state {
            PressureState::Normal => {
                if overloaded {
                    self.recover_streak = 0;
                    self.overload_streak += 1;
                    if self.overload_streak >= DEGRADE_AFTER {
                        self.state = PressureState::Degraded;
                        self.overload_streak = 0;
                        return Some(RateChange::Degrade);
                    }
                } else {
                    self.overload_streak = 0;
                }
            }
            PressureState::Degraded => {
                if recovered {
                    self.overload_streak = 0;
                    self.recover_streak += 1;
                    if self.recover_streak >= RESTORE_AFTER {
                        self.state = PressureState::Normal;
                        self.recover_streak = 0;
                        return Some(RateChange::Restore);
                    }
                } else {
                    self.recover_streak = 0;
                }
            }
        }
        None
    }
}

impl Default for PressureController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(p95_ms: f64, utilization: f64) -> LoopMetrics {
        LoopMetrics {
            p50_ms: p95_ms / 2.0,
            p95_ms,
            p99_ms: p95_ms * 1.5,
            utilization,
        }
    }

    #[test]
    fn three_consecutive_overloads_degrade() {
        let mut controller = PressureController::new();
        assert_eq!(controller.sample(metrics(9.0, 0.5)), None);
        assert_eq!(controller.sample(metrics(9.0, 0.5)), None);
        assert_eq!(
            controller.sample(metrics(9.0, 0.5)),
            Some(RateChange::Degrade)
        );
        assert_eq!(controller.state(), PressureState::Degraded);
    }

    #[test]
    fn utilization_alone_triggers_overload() {
        let mut controller = PressureController::new();
        for _ in 0..2 {
            controller.sample(metrics(1.0, 0.95));
        }
        assert_eq!(
            controller.sample(metrics(1.0, 0.95)),
            Some(RateChange::Degrade)
        );
    }

    #[test]
    fn a_clean_sample_resets_the_overload_streak() {
        let mut controller = PressureController::new();
        controller.sample(metrics(9.0, 0.5));
        controller.sample(metrics(9.0, 0.5));
        controller.sample(metrics(1.0, 0.1));
        assert_eq!(controller.sample(metrics(9.0, 0.5)), None);
        assert_eq!(controller.state(), PressureState::Normal);
    }

    #[test]
    fn five_consecutive_recoveries_restore() {
        let mut controller = PressureController::new();
        for _ in 0..3 {
            controller.sample(metrics(9.0, 0.5));
        }
        assert_eq!(controller.state(), PressureState::Degraded);

        for _ in 0..4 {
            assert_eq!(controller.sample(metrics(1.0, 0.1)), None);
        }
        assert_eq!(
            controller.sample(metrics(1.0, 0.1)),
            Some(RateChange::Restore)
        );
        assert_eq!(controller.state(), PressureState::Normal);
    }

    #[test]
    fn partial_recovery_does_not_restore() {
        let mut controller = PressureController::new();
        for _ in 0..3 {
            controller.sample(metrics(9.0, 0.5));
        }
        // p95 below 6 but utilization still high: not a recover sample
        for _ in 0..10 {
            assert_eq!(controller.sample(metrics(5.0, 0.8)), None);
        }
        assert_eq!(controller.state(), PressureState::Degraded);
    }

    #[test]
    fn zeroed_metrics_never_degrade() {
        let mut controller = PressureController::new();
        for _ in 0..10 {
            assert_eq!(controller.sample(LoopMetrics::default()), None);
        }
        assert_eq!(controller.state(), PressureState::Normal);
    }
}
