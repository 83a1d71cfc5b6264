// warden/src/detect/health.rs
//
// Per-loop cadence state machine.
//
//   healthy ──(N consecutive failures)──► degraded, interval = 2 × base
//   degraded ──(failure)──► interval × 2, capped at ceiling
//   degraded ──(success)──► healthy, interval = base

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Healthy,
    Failed,
    EnteredDegraded,
    BackedOff,
    Recovered,
}

#[derive(Debug, Clone)]
pub struct LoopHealth {
    base:      Duration,
    ceiling:   Duration,
    threshold: u32,
    failures:  u32,
    degraded:  bool,
    current:   Duration,
}

impl LoopHealth {
    pub fn new(base: Duration, ceiling: Duration, threshold: u32) -> Self {
        Self {
            base,
            ceiling:   ceiling.max(base),
            threshold: threshold.max(1),
            failures:  0,
            degraded:  false,
            current:   base,
        }
    }

    pub fn record_success(&mut self) -> HealthTransition {
        let was_degraded = self.degraded;
        self.failures = 0;
        self.degraded = false;
        self.current = self.base;
        if was_degraded { HealthTransition::Recovered } else { HealthTransition::Healthy }
    }

    pub fn record_failure(&mut self) -> HealthTransition {
        self.failures = self.failures.saturating_add(1);
        if self.degraded {
            self.current = (self.current * 2).min(self.ceiling);
            HealthTransition::BackedOff
        } else if self.failures >= self.threshold {
            self.degraded = true;
            self.current = (self.base * 2).min(self.ceiling);
            HealthTransition::EnteredDegraded
        } else {
            HealthTransition::Failed
        }
    }

    pub fn interval(&self) -> Duration { self.current }

    pub fn is_degraded(&self) -> bool { self.degraded }

    pub fn consecutive_failures(&self) -> u32 { self.failures }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_after_threshold_and_backs_off_to_ceiling() {
        let mut h = LoopHealth::new(Duration::from_secs(60), Duration::from_secs(600), 5);
        for _ in 0..4 {
            assert_eq!(h.record_failure(), HealthTransition::Failed);
            assert_eq!(h.interval(), Duration::from_secs(60));
        }
        assert_eq!(h.record_failure(), HealthTransition::EnteredDegraded);
        assert_eq!(h.interval(), Duration::from_secs(120));

        let seen: Vec<u64> = (0..4)
            .map(|_| {
                assert_eq!(h.record_failure(), HealthTransition::BackedOff);
                h.interval().as_secs()
            })
            .collect();
        assert_eq!(seen, vec![240, 480, 600, 600]);

        assert_eq!(h.record_success(), HealthTransition::Recovered);
        assert_eq!(h.interval(), Duration::from_secs(60));
        assert_eq!(h.record_success(), HealthTransition::Healthy);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut h = LoopHealth::new(Duration::from_secs(1), Duration::from_secs(10), 2);
        h.record_failure();
        h.record_success();
        assert_eq!(h.record_failure(), HealthTransition::Failed);
        assert_eq!(h.record_failure(), HealthTransition::EnteredDegraded);
    }
}
