// Wall-clock budget for time-boxed challenges.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// A soft deadline measured from [`TimeBudget::start`].
///
/// Uses tokio's clock so tests can drive it with `tokio::time::pause` and
/// `advance`.
#[derive(Debug, Clone)]
pub struct TimeBudget {
    budget: Duration,
    started: Option<Instant>,
}

impl TimeBudget {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: None,
        }
    }

    /// Negative and NaN budgets become zero; overflowing ones saturate.
    pub fn from_secs_f64(secs: f64) -> Self {
        let budget = if secs.is_nan() || secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
        };
        Self::new(budget)
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Start (or restart) the countdown.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        info!(budget_secs = self.budget.as_secs_f64(), "countdown started");
    }

    /// Time since `start`; zero before the countdown starts.
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Time left, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// True while some budget is left. Logs the current state.
    pub fn check(&self) -> bool {
        let elapsed = self.elapsed();
        if self.within(elapsed) {
            info!(
                elapsed_secs = elapsed.as_secs_f64(),
                remaining_secs = self.remaining().as_secs_f64(),
                "within time budget"
            );
            true
        } else {
            warn!(elapsed_secs = elapsed.as_secs_f64(), "time limit exceeded");
            false
        }
    }

    /// Whether `elapsed` leaves a strictly positive remainder.
    pub fn within(&self, elapsed: Duration) -> bool {
        elapsed < self.budget
    }

    /// Whether the total run, including submission, fit in the budget.
    pub fn finished_in_time(&self) -> bool {
        self.elapsed() <= self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_and_a_half_seconds_is_over_budget() {
        let budget = TimeBudget::new(Duration::from_secs(6));
        assert!(!budget.within(Duration::from_millis(6500)));
        assert!(!budget.within(Duration::from_secs(6)));
        assert!(budget.within(Duration::from_millis(5999)));
    }

    #[test]
    fn out_of_range_budgets_do_not_panic() {
        assert_eq!(TimeBudget::from_secs_f64(f64::INFINITY).budget(), Duration::MAX);
        assert_eq!(TimeBudget::from_secs_f64(1e30).budget(), Duration::MAX);
        assert_eq!(TimeBudget::from_secs_f64(f64::NAN).budget(), Duration::ZERO);
        assert_eq!(TimeBudget::from_secs_f64(-2.0).budget(), Duration::ZERO);
    }

    #[test]
    fn not_started_means_nothing_elapsed() {
        let budget = TimeBudget::from_secs_f64(6.0);
        assert_eq!(budget.elapsed(), Duration::ZERO);
        assert_eq!(budget.remaining(), Duration::from_secs(6));
        assert!(budget.check());
    }

    #[tokio::test(start_paused = true)]
    async fn check_tracks_tokio_clock() {
        let mut budget = TimeBudget::new(Duration::from_secs(6));
        budget.start();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(budget.check());
        assert_eq!(budget.remaining(), Duration::from_secs(4));

        tokio::time::advance(Duration::from_millis(4500)).await;
        assert!(!budget.check());
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(!budget.finished_in_time());
    }
}
