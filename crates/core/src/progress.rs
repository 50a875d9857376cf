// crates/core/src/progress.rs
//! Percent-complete estimation for a single job.
//!
//! Two sources compete for the displayed percentage:
//! - Real: values reported by the job engine in `progress` messages
//! - Simulated: a time-driven heuristic that keeps the bar moving while the
//!   engine is silent
//!
//! Real progress wins permanently the moment it appears. Neither source may
//! reach 100 on its own; only an explicit completion does.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Highest value either source may report before completion.
pub const PROGRESS_CEILING: u8 = 99;

/// Simulated step sizes.
pub const DEFAULT_INCREMENTS: [u8; 3] = [3, 5, 10];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressSource {
    Real,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub percent: u8,
    pub source: ProgressSource,
}

/// How a real progress value lower than the last one is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionPolicy {
    /// Lower values are stale and ignored unless the job was explicitly
    /// restarted first.
    #[default]
    RequireReset,
    /// A lower value is itself taken as evidence the job restarted.
    TreatAsRestart,
}

#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    percent: u8,
    source: ProgressSource,
    paused: bool,
    /// Set once the job reached a terminal state; freezes the value.
    halted: bool,
    policy: RegressionPolicy,
    increments: Vec<u8>,
}

impl ProgressEstimator {
    pub fn new(policy: RegressionPolicy, increments: Vec<u8>) -> Self {
        Self {
            percent: 0,
            source: ProgressSource::Simulated,
            paused: false,
            halted: false,
            policy,
            increments,
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    pub fn source(&self) -> ProgressSource {
        self.source
    }

    pub fn state(&self) -> ProgressState {
        ProgressState {
            percent: self.percent,
            source: self.source,
        }
    }

    /// Whether a periodic tick could still move the value.
    pub fn wants_ticks(&self) -> bool {
        self.source == ProgressSource::Simulated
            && !self.paused
            && !self.halted
            && self.percent < PROGRESS_CEILING
    }

    /// Apply a value reported by the job engine. Returns true if the
    /// displayed percentage changed.
    pub fn on_real_progress(&mut self, reported: u8) -> bool {
        if self.halted {
            tracing::debug!(reported, "ignoring progress after job finished");
            return false;
        }
        self.source = ProgressSource::Real;

        let reported = reported.min(PROGRESS_CEILING);
        if reported < self.percent {
            match self.policy {
                RegressionPolicy::RequireReset => {
                    tracing::debug!(
                        reported,
                        current = self.percent,
                        "ignoring stale progress value"
                    );
                    return false;
                }
                RegressionPolicy::TreatAsRestart => {
                    tracing::info!(
                        reported,
                        current = self.percent,
                        "progress went backwards, treating as restart"
                    );
                }
            }
        }
        let changed = reported != self.percent;
        self.percent = reported;
        changed
    }

    /// Advance the simulated value by one random step.
    pub fn on_tick_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        if !self.wants_ticks() {
            return false;
        }
        let Some(&step) = self.increments.choose(rng) else {
            return false;
        };
        let next = self.percent.saturating_add(step).min(PROGRESS_CEILING);
        let changed = next != self.percent;
        self.percent = next;
        changed
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Explicit restart of the job: the value may start over from zero.
    /// A real source stays real.
    pub fn restart(&mut self) {
        self.percent = 0;
        self.paused = false;
        self.halted = false;
    }

    /// Explicit completion is the only way to reach 100.
    pub fn complete(&mut self) {
        self.percent = 100;
        self.halted = true;
    }

    /// Freeze the current value after a non-successful terminal state.
    pub fn halt(&mut self) {
        self.halted = true;
    }
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new(RegressionPolicy::default(), DEFAULT_INCREMENTS.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_tick_advances_by_known_increment() {
        let mut est = ProgressEstimator::default();
        let mut rng = rng();
        assert!(est.on_tick_with(&mut rng));
        assert!(DEFAULT_INCREMENTS.contains(&est.percent()));
        assert_eq!(est.source(), ProgressSource::Simulated);
    }

    #[test]
    fn test_simulated_never_reaches_100() {
        let mut est = ProgressEstimator::default();
        let mut rng = rng();
        for _ in 0..200 {
            est.on_tick_with(&mut rng);
        }
        assert_eq!(est.percent(), PROGRESS_CEILING);
        assert!(!est.wants_ticks());
        assert!(!est.on_tick_with(&mut rng));
    }

    #[test]
    fn test_real_progress_silences_ticks_forever() {
        let mut est = ProgressEstimator::default();
        let mut rng = rng();
        est.on_tick_with(&mut rng);
        est.on_real_progress(40);
        for _ in 0..50 {
            assert!(!est.on_tick_with(&mut rng));
            assert_eq!(est.percent(), 40);
        }
        est.restart();
        assert_eq!(est.source(), ProgressSource::Real);
        assert!(!est.on_tick_with(&mut rng));
    }

    #[test]
    fn test_real_progress_clamped_below_100() {
        let mut est = ProgressEstimator::default();
        est.on_real_progress(100);
        assert_eq!(est.percent(), 99);
        est.complete();
        assert_eq!(est.percent(), 100);
    }

    #[test]
    fn test_real_progress_may_jump_below_simulated_only_with_restart() {
        let mut est = ProgressEstimator::default();
        let mut rng = rng();
        for _ in 0..10 {
            est.on_tick_with(&mut rng);
        }
        let simulated = est.percent();
        assert!(simulated > 10);

        // Stale value under the default policy keeps the higher number.
        assert!(!est.on_real_progress(5));
        assert_eq!(est.percent(), simulated);
        assert_eq!(est.source(), ProgressSource::Real);
    }

    #[test]
    fn test_regression_require_reset() {
        let mut est = ProgressEstimator::new(RegressionPolicy::RequireReset, vec![3, 5, 10]);
        est.on_real_progress(60);
        assert!(!est.on_real_progress(30));
        assert_eq!(est.percent(), 60);
        // Ties favour the latest report.
        assert!(!est.on_real_progress(60));
        assert_eq!(est.percent(), 60);

        est.restart();
        assert!(est.on_real_progress(30));
        assert_eq!(est.percent(), 30);
    }

    #[test]
    fn test_regression_treat_as_restart() {
        let mut est = ProgressEstimator::new(RegressionPolicy::TreatAsRestart, vec![3, 5, 10]);
        est.on_real_progress(60);
        assert!(est.on_real_progress(30));
        assert_eq!(est.percent(), 30);
    }

    #[test]
    fn test_paused_tick_is_noop() {
        let mut est = ProgressEstimator::default();
        let mut rng = rng();
        est.set_paused(true);
        assert!(!est.on_tick_with(&mut rng));
        assert_eq!(est.percent(), 0);
        est.set_paused(false);
        assert!(est.on_tick_with(&mut rng));
    }

    #[test]
    fn test_halted_ignores_everything() {
        let mut est = ProgressEstimator::default();
        est.on_real_progress(20);
        est.halt();
        assert!(!est.on_real_progress(80));
        assert_eq!(est.percent(), 20);
    }

    #[test]
    fn test_empty_increments_never_tick() {
        let mut est = ProgressEstimator::new(RegressionPolicy::default(), Vec::new());
        assert!(!est.on_tick_with(&mut rng()));
    }
}
