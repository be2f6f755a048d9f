//! Per-agent time budget.
//!
//! Each turn gets a deadline of `per_step + remaining_overage`. A turn that finishes after
//! `per_step` pays the excess out of the overage; the overage is never refilled, so an agent
//! that is consistently slow eventually cannot afford a turn even if each one stays under the
//! deadline.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{AgentError, TimeoutKind};

/// Returned by deadline-bound waits when the deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError {}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timeout Error")
    }
}

impl std::error::Error for TimeoutError {}

/// Rolling time allowance of one agent.
#[derive(Debug, Clone)]
pub struct TimeBudget {
    per_step: Duration,
    remaining_overage: Duration,
    active: bool,
    exhausted: bool,
    current_timeout_reason: String,
}

impl TimeBudget {
    /// A budget of `per_step` per turn plus `overage` for the whole match.
    pub fn new(per_step: Duration, overage: Duration) -> TimeBudget {
        TimeBudget {
            per_step,
            remaining_overage: overage,
            active: true,
            exhausted: false,
            current_timeout_reason: String::from("Unknown"),
        }
    }

    /// A budget that never times out.
    pub fn unlimited() -> TimeBudget {
        TimeBudget {
            active: false,
            ..TimeBudget::new(Duration::MAX, Duration::ZERO)
        }
    }

    /// Allowance of a single turn.
    pub fn per_step(&self) -> Duration {
        self.per_step
    }

    /// Overage left for the rest of the match.
    pub fn remaining_overage(&self) -> Duration {
        self.remaining_overage
    }

    /// True once the overage went "below zero". Sticky.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// What the agent was doing the last time it ran out of time.
    pub fn current_timeout_reason(&self) -> &str {
        &self.current_timeout_reason
    }

    /// Describe what the agent is doing, for the timeout log.
    pub fn set_timeout_reason(&mut self, reason: &str) {
        self.current_timeout_reason = reason.to_string();
    }

    /// Full deadline for the next turn, `None` when the budget is inactive.
    pub fn allowance(&self) -> Option<Duration> {
        self.active
            .then(|| self.per_step.saturating_add(self.remaining_overage))
    }

    /// Run `op` under the budget.
    ///
    /// `op` receives the deadline it must respect and reports an expired wait with
    /// [`AgentError::Timeout`]; it is then abandoned right away. On success, the time spent
    /// beyond `per_step` is debited, which may still fail the turn.
    pub fn run<T>(
        &mut self,
        op: impl FnOnce(Option<Instant>) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        if self.exhausted {
            return Err(AgentError::Timeout(TimeoutKind::OverageExhausted {
                overrun: Duration::ZERO,
                remaining: Duration::ZERO,
            }));
        }
        let start = Instant::now();
        let deadline = self
            .allowance()
            .and_then(|allowance| start.checked_add(allowance));

        let output = op(deadline).inspect_err(|err| {
            if err.is_timeout() {
                warn!(reason = %self.current_timeout_reason, "deadline reached");
                self.exhausted = true;
                self.remaining_overage = Duration::ZERO;
            }
        })?;

        self.settle(start.elapsed())?;
        self.current_timeout_reason = String::from("Unknown");
        Ok(output)
    }

    /// Debit a completed turn that took `elapsed`.
    pub fn settle(&mut self, elapsed: Duration) -> Result<(), AgentError> {
        if !self.active || elapsed <= self.per_step {
            return Ok(());
        }
        let overrun = elapsed - self.per_step;
        match self.remaining_overage.checked_sub(overrun) {
            Some(remaining) => {
                debug!(
                    overrun_ms = overrun.as_millis() as u64,
                    remaining_ms = remaining.as_millis() as u64,
                    "turn used overage"
                );
                self.remaining_overage = remaining;
                Ok(())
            }
            None => {
                let remaining = self.remaining_overage;
                self.remaining_overage = Duration::ZERO;
                self.exhausted = true;
                warn!(reason = %self.current_timeout_reason, "overage exhausted");
                Err(AgentError::Timeout(TimeoutKind::OverageExhausted {
                    overrun,
                    remaining,
                }))
            }
        }
    }
}

/// Deadline left as a timeout, `None` meaning no deadline. Zero once passed.
pub(crate) fn time_left(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}
