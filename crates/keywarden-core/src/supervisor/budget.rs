//! Crash-loop restart budget.

use std::time::Duration;

use tokio::time::Instant;

/// What to do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Under budget: restart after the configured delay.
    Restart,
    /// Over budget: stop restarting until the counter is reset.
    Exceeded,
}

/// Counts crashes over a rolling window anchored at the first crash.
///
/// The window restarts from the current crash once more than the window
/// duration has elapsed since the first crash in it. A slow crash loop
/// therefore never accumulates into a spurious budget exhaustion.
#[derive(Debug)]
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    first_crash: Option<Instant>,
    count: u32,
}

impl RestartBudget {
    /// Creates a budget allowing `max_restarts` crashes per `window`.
    #[must_use]
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            first_crash: None,
            count: 0,
        }
    }

    /// Records a crash at `now` and decides whether to restart.
    pub fn record_crash(&mut self, now: Instant) -> BudgetDecision {
        match self.first_crash {
            Some(first) if now.duration_since(first) > self.window => {
                self.first_crash = Some(now);
                self.count = 1;
            }
            Some(_) => self.count += 1,
            None => {
                self.first_crash = Some(now);
                self.count = 1;
            }
        }
        if self.count > self.max_restarts {
            BudgetDecision::Exceeded
        } else {
            BudgetDecision::Restart
        }
    }

    /// Crashes recorded in the current window.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Clears the counter and the window anchor.
    pub fn reset(&mut self) {
        self.first_crash = None;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn exceeds_after_max_plus_one_crashes_in_window() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(300));
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Restart);
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Restart);
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Exceeded);
        assert_eq!(budget.count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_anchored_at_the_first_crash() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(300));
        budget.record_crash(Instant::now());

        // Two more crashes just inside the window: over budget.
        tokio::time::advance(Duration::from_secs(150)).await;
        budget.record_crash(Instant::now());
        tokio::time::advance(Duration::from_secs(149)).await;
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_once_the_first_crash_ages_out() {
        let mut budget = RestartBudget::new(1, Duration::from_secs(300));
        budget.record_crash(Instant::now());

        // Past the window: the crash anchors a fresh window.
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Restart);
        assert_eq!(budget.count(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_an_exhausted_budget() {
        let mut budget = RestartBudget::new(0, Duration::from_secs(300));
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Exceeded);

        budget.reset();
        assert_eq!(budget.count(), 0);
        assert_eq!(budget.record_crash(Instant::now()), BudgetDecision::Exceeded);
    }
}
