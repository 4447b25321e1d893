//! Restart policy state machine.
//!
//! Evaluated every time a worker exits:
//! - `never`: no restart; the host fails once no workers remain
//! - `on_failure`: restart non-clean exits only
//! - `always`: restart any exit, clean included
//!
//! The restart budget is per host and cumulative: once `max_restarts`
//! restarts have been spent, the next restartable exit exhausts it.

use std::time::Duration;

use crate::events::WorkerExit;
use crate::types::{RestartMode, RestartPolicy};

/// What to do about one worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    NoRestart,
    Restart { attempt: u32, delay: Duration },
    Exhausted { restarts: u32 },
}

/// Restart bookkeeping for one host.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restarts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restarts: 0,
        }
    }

    /// Restarts granted so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn decide(&mut self, exit: &WorkerExit) -> RestartDecision {
        let wants_restart = match self.policy.mode {
            RestartMode::Never => false,
            RestartMode::OnFailure => !exit.is_clean(),
            RestartMode::Always => true,
        };
        if !wants_restart {
            return RestartDecision::NoRestart;
        }
        if self.restarts >= self.policy.max_restarts {
            return RestartDecision::Exhausted {
                restarts: self.restarts,
            };
        }
        self.restarts += 1;
        RestartDecision::Restart {
            attempt: self.restarts,
            delay: self.policy.delay_for(self.restarts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Backoff;

    fn policy(mode: RestartMode, max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            mode,
            max_restarts,
            delay: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn crash() -> WorkerExit {
        WorkerExit::Crashed("boom".into())
    }

    #[test]
    fn test_on_failure_two_restarts_then_exhausted() {
        let mut tracker = RestartTracker::new(policy(RestartMode::OnFailure, 2));
        assert_eq!(
            tracker.decide(&crash()),
            RestartDecision::Restart {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
        assert!(matches!(tracker.decide(&crash()), RestartDecision::Restart { attempt: 2, .. }));
        assert_eq!(tracker.decide(&crash()), RestartDecision::Exhausted { restarts: 2 });
        assert_eq!(tracker.restarts(), 2);
    }

    #[test]
    fn test_on_failure_ignores_clean_exit() {
        let mut tracker = RestartTracker::new(policy(RestartMode::OnFailure, 2));
        assert_eq!(tracker.decide(&WorkerExit::Clean), RestartDecision::NoRestart);
        assert_eq!(tracker.restarts(), 0);
    }

    #[test]
    fn test_always_restarts_clean_exit() {
        let mut tracker = RestartTracker::new(policy(RestartMode::Always, 1));
        assert!(matches!(tracker.decide(&WorkerExit::Clean), RestartDecision::Restart { .. }));
        assert_eq!(
            tracker.decide(&WorkerExit::Failed("eof".into())),
            RestartDecision::Exhausted { restarts: 1 }
        );
    }

    #[test]
    fn test_never() {
        let mut tracker = RestartTracker::new(policy(RestartMode::Never, 10));
        assert_eq!(tracker.decide(&crash()), RestartDecision::NoRestart);
    }

    #[test]
    fn test_exponential_delay() {
        let mut tracker = RestartTracker::new(RestartPolicy {
            backoff: Backoff::Exponential,
            max_delay: Duration::from_millis(300),
            ..policy(RestartMode::OnFailure, 5)
        });
        let delays: Vec<_> = (0..4)
            .map(|_| match tracker.decide(&crash()) {
                RestartDecision::Restart { delay, .. } => delay.as_millis(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(delays, [100, 200, 300, 300]);
    }
}
