//! Real-time pacing: holds the session loop to one sample per period.
//!
//! In real-time mode each iteration after the first is timed; if it finished
//! inside the period the loop sleeps for the remainder, otherwise an overrun
//! is reported and the loop carries on immediately. Overruns are never fatal.
//! With pacing disabled (batch evaluation) the pacer is a no-op.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Default pacing period: one sample per wall-clock second.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// What pacing did at the end of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceDecision {
    /// Iteration finished early; sleep for the remainder of the period.
    Sleep(Duration),
    /// Iteration took longer than the period by the given amount.
    Overrun(Duration),
}

/// Loop pacer.
#[derive(Debug, Clone)]
pub struct Pacer {
    enabled: bool,
    period: Duration,
    overruns: u32,
}

impl Pacer {
    pub fn new(enabled: bool) -> Self {
        Self::with_period(enabled, DEFAULT_PERIOD)
    }

    pub fn with_period(enabled: bool, period: Duration) -> Self {
        Self {
            enabled,
            period,
            overruns: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Start timing iteration `iteration`. The first iteration is never paced.
    pub fn start(&self, iteration: u64) -> Option<Instant> {
        (self.enabled && iteration > 0).then(Instant::now)
    }

    /// Decide how to pace an iteration that took `elapsed`.
    pub fn plan(&self, elapsed: Duration) -> PaceDecision {
        match self.period.checked_sub(elapsed) {
            Some(remaining) => PaceDecision::Sleep(remaining),
            None => PaceDecision::Overrun(elapsed - self.period),
        }
    }

    /// Finish an iteration started with [`Self::start`], sleeping if it ran short.
    pub async fn pace(&mut self, started: Option<Instant>) -> Option<PaceDecision> {
        let started = started?;
        let elapsed = started.elapsed();
        let decision = self.plan(elapsed);

        match decision {
            PaceDecision::Sleep(remaining) => {
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    sleep_ms = remaining.as_millis() as u64,
                    "Pacing sample"
                );
                tokio::time::sleep(remaining).await;
            }
            PaceDecision::Overrun(over) => {
                self.overruns += 1;
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    over_ms = over.as_millis() as u64,
                    "Predict/analyse cycle took longer than the pacing period; not keeping up with real-time"
                );
            }
        }
        Some(decision)
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_sleeps_for_remainder() {
        let pacer = Pacer::new(true);
        assert_eq!(
            pacer.plan(Duration::from_millis(400)),
            PaceDecision::Sleep(Duration::from_millis(600))
        );
    }

    #[test]
    fn test_plan_reports_overrun() {
        let pacer = Pacer::new(true);
        assert_eq!(
            pacer.plan(Duration::from_millis(1300)),
            PaceDecision::Overrun(Duration::from_millis(300))
        );
    }

    #[test]
    fn test_exact_period_sleeps_zero() {
        let pacer = Pacer::new(true);
        assert_eq!(
            pacer.plan(Duration::from_secs(1)),
            PaceDecision::Sleep(Duration::ZERO)
        );
    }

    #[test]
    fn test_start_skips_first_iteration_and_disabled() {
        assert!(Pacer::new(true).start(0).is_none());
        assert!(Pacer::new(false).start(5).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_sleeps_remaining_time() {
        let mut pacer = Pacer::new(true);
        let started = pacer.start(1);
        tokio::time::advance(Duration::from_millis(400)).await;

        let before = Instant::now();
        let decision = pacer.pace(started).await;

        assert_eq!(
            decision,
            Some(PaceDecision::Sleep(Duration::from_millis(600)))
        );
        assert!(before.elapsed() >= Duration::from_millis(600));
        assert_eq!(pacer.overruns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pace_overrun_does_not_sleep() {
        let mut pacer = Pacer::new(true);
        let started = pacer.start(3);
        tokio::time::advance(Duration::from_millis(1300)).await;

        let before = Instant::now();
        let decision = pacer.pace(started).await;

        assert_eq!(
            decision,
            Some(PaceDecision::Overrun(Duration::from_millis(300)))
        );
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(pacer.overruns(), 1);
    }

    #[tokio::test]
    async fn test_disabled_pacer_is_noop() {
        let mut pacer = Pacer::default();
        assert!(!pacer.is_enabled());
        assert_eq!(pacer.pace(pacer.start(4)).await, None);
    }
}
