//! Onset tracking for slow fault conditions.
//!
//! ```text
//!        present                 present for >= threshold
//!  Absent ───────► Present(since) ─────────────────────► Sustained
//!    ▲                  │                                    │
//!    │   absent         │                       absent       │
//!    └──────────────────┴────────────────────────────────────┘
//! ```
//!
//! [`SustainedCondition::update`] reports the edge taken so the poller can
//! log onset, escalation and clearing exactly once each.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionEdge {
    /// Not present, and was not present before.
    Absent,
    /// Just appeared.
    Onset,
    /// Still present, either below the threshold or already escalated.
    Present,
    /// Present for the full threshold. Reported once per episode.
    Sustained,
    /// Was present, now gone.
    Cleared,
}

#[derive(Debug)]
enum State {
    Absent,
    Present(Instant),
    Sustained,
}

#[derive(Debug)]
pub struct SustainedCondition {
    threshold: Duration,
    state: State,
}

impl SustainedCondition {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            state: State::Absent,
        }
    }

    pub fn update(&mut self, present: bool) -> ConditionEdge {
        match (&self.state, present) {
            (State::Absent, false) => ConditionEdge::Absent,
            (State::Absent, true) => {
                self.state = State::Present(Instant::now());
                ConditionEdge::Onset
            }
            (State::Present(since), true) => {
                if since.elapsed() >= self.threshold {
                    self.state = State::Sustained;
                    ConditionEdge::Sustained
                } else {
                    ConditionEdge::Present
                }
            }
            (State::Sustained, true) => ConditionEdge::Present,
            (State::Present(_) | State::Sustained, false) => {
                self.state = State::Absent;
                ConditionEdge::Cleared
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn should_report_onset_then_sustained_once() {
        let mut condition = SustainedCondition::new(Duration::from_secs(30));

        assert_eq!(condition.update(true), ConditionEdge::Onset);
        time::advance(Duration::from_secs(10)).await;
        assert_eq!(condition.update(true), ConditionEdge::Present);
        time::advance(Duration::from_secs(20)).await;
        assert_eq!(condition.update(true), ConditionEdge::Sustained);
        time::advance(Duration::from_secs(5)).await;
        assert_eq!(condition.update(true), ConditionEdge::Present);
    }

    #[tokio::test(start_paused = true)]
    async fn should_restart_timing_after_clearing() {
        let mut condition = SustainedCondition::new(Duration::from_secs(30));

        condition.update(true);
        time::advance(Duration::from_secs(25)).await;
        assert_eq!(condition.update(false), ConditionEdge::Cleared);
        assert_eq!(condition.update(false), ConditionEdge::Absent);

        assert_eq!(condition.update(true), ConditionEdge::Onset);
        time::advance(Duration::from_secs(25)).await;
        assert_eq!(condition.update(true), ConditionEdge::Present);
    }

    #[tokio::test(start_paused = true)]
    async fn should_clear_from_sustained() {
        let mut condition = SustainedCondition::new(Duration::ZERO);

        condition.update(true);
        assert_eq!(condition.update(true), ConditionEdge::Sustained);
        assert_eq!(condition.update(false), ConditionEdge::Cleared);
    }
}
