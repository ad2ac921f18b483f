//! Per-entry lifecycle state machine and crash-loop restart policy.
//!
//! ```text
//! Spawning ──▶ Running ──┬─ exit 0 ─────────────────▶ Terminal
//!    ▲                   ├─ crash ─▶ BackoffWait ──┐
//!    └───────────────────┼──────────────────────────┘
//!                        ├─ crash over limit ─────▶ Fatal
//!                        └─ stop ─▶ Terminating ──▶ Terminal
//! ```
//!
//! Exit handling is a pure function of (desired state, restart count,
//! uptime, exit outcome) so it can be tested without spawning anything.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default uptime below which a crash counts toward the restart budget.
pub const DEFAULT_UPTIME_THRESHOLD: Duration = Duration::from_secs(10);

/// Default number of quick crashes tolerated before restarts are disabled.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default delay between a crash and the respawn.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

// ============================================================================
// Desired State
// ============================================================================

/// The caller's latest intent for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

// ============================================================================
// Lifecycle State
// ============================================================================

/// Where an entry currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Child is being launched
    Spawning,
    /// Child is alive
    Running,
    /// Child crashed; waiting out the backoff before respawning
    BackoffWait,
    /// Crash loop limit exceeded; restarts are disabled until stopped
    Fatal,
    /// Stop requested; tree kill and shutdown command in progress
    Terminating,
    /// Finished; the entry is about to be (or has been) removed
    Terminal,
}

impl LifecycleState {
    /// Short lowercase label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::BackoffWait => "backoff",
            Self::Fatal => "fatal",
            Self::Terminating => "terminating",
            Self::Terminal => "terminal",
        }
    }

    /// Returns true while the entry owns (or is about to own) a child.
    ///
    /// A start request for an id in one of these states is a no-op.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Spawning | Self::Running | Self::BackoffWait)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Exit Outcome
// ============================================================================

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Exited normally with a status code
    Code(i32),
    /// Killed by a signal (POSIX)
    Signal(i32),
    /// Waiting on the child failed; status unknown
    Unknown(String),
}

impl ExitOutcome {
    /// Converts an OS exit status.
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }

        Self::Unknown(status.to_string())
    }

    /// Returns true only for exit code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(signal) => write!(f, "signal {signal}"),
            Self::Unknown(reason) => write!(f, "unknown status ({reason})"),
        }
    }
}

// ============================================================================
// Restart Policy
// ============================================================================

/// Crash-loop policy applied to supervised services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Crashes before this much uptime count toward the budget; later
    /// crashes reset the count.
    pub uptime_threshold: Duration,

    /// Highest restart count that still gets a respawn.
    pub max_restarts: u32,

    /// Fixed delay before each respawn.
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            uptime_threshold: DEFAULT_UPTIME_THRESHOLD,
            max_restarts: DEFAULT_MAX_RESTARTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RestartPolicy {
    /// Decides what happens after a child exits.
    ///
    /// - desired Stopped: the exit was requested, nothing to do
    /// - exit code 0: clean completion, never restarted, count untouched
    /// - crash under the uptime threshold: count + 1
    /// - crash past the threshold: count reset to 0
    /// - count above `max_restarts`: restarts disabled
    pub fn evaluate_exit(
        &self,
        desired: DesiredState,
        restart_count: u32,
        uptime: Duration,
        outcome: &ExitOutcome,
    ) -> ExitDecision {
        if desired == DesiredState::Stopped {
            return ExitDecision::Stopped;
        }

        if outcome.is_success() {
            return ExitDecision::Completed;
        }

        let restart_count = if uptime < self.uptime_threshold {
            restart_count.saturating_add(1)
        } else {
            0
        };

        if restart_count > self.max_restarts {
            ExitDecision::CrashLimitExceeded { restart_count }
        } else {
            ExitDecision::Restart {
                restart_count,
                delay: self.backoff,
            }
        }
    }
}

/// Result of evaluating a child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Exit was caused by a stop request
    Stopped,
    /// Clean exit while desired Running
    Completed,
    /// Crash; respawn after `delay` with the new restart count
    Restart { restart_count: u32, delay: Duration },
    /// Crash with the budget exhausted
    CrashLimitExceeded { restart_count: u32 },
}

impl ExitDecision {
    /// State the entry moves to after this decision.
    pub fn next_state(&self) -> LifecycleState {
        match self {
            Self::Stopped => LifecycleState::Terminating,
            Self::Completed => LifecycleState::Terminal,
            Self::Restart { .. } => LifecycleState::BackoffWait,
            Self::CrashLimitExceeded { .. } => LifecycleState::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUICK: Duration = Duration::from_secs(1);
    const LONG: Duration = Duration::from_secs(15);

    fn policy() -> RestartPolicy {
        RestartPolicy::default()
    }

    #[test]
    fn test_clean_exit_is_terminal() {
        let decision = policy().evaluate_exit(DesiredState::Running, 3, QUICK, &ExitOutcome::Code(0));
        assert_eq!(decision, ExitDecision::Completed);
        assert_eq!(decision.next_state(), LifecycleState::Terminal);
    }

    #[test]
    fn test_exit_after_stop_is_not_a_crash() {
        let decision = policy().evaluate_exit(DesiredState::Stopped, 0, QUICK, &ExitOutcome::Signal(9));
        assert_eq!(decision, ExitDecision::Stopped);
    }

    #[test]
    fn test_quick_crash_increments_count() {
        let decision = policy().evaluate_exit(DesiredState::Running, 2, QUICK, &ExitOutcome::Code(1));
        assert_eq!(
            decision,
            ExitDecision::Restart {
                restart_count: 3,
                delay: DEFAULT_BACKOFF
            }
        );
        assert_eq!(decision.next_state(), LifecycleState::BackoffWait);
    }

    #[test]
    fn test_late_crash_resets_count() {
        let decision = policy().evaluate_exit(DesiredState::Running, 4, LONG, &ExitOutcome::Code(1));
        assert_eq!(
            decision,
            ExitDecision::Restart {
                restart_count: 0,
                delay: DEFAULT_BACKOFF
            }
        );
    }

    #[test]
    fn test_sixth_quick_crash_is_fatal() {
        let policy = policy();
        let mut count = 0;

        for _ in 0..5 {
            match policy.evaluate_exit(DesiredState::Running, count, QUICK, &ExitOutcome::Code(1)) {
                ExitDecision::Restart { restart_count, .. } => count = restart_count,
                other => panic!("expected restart, got {other:?}"),
            }
        }
        assert_eq!(count, 5);

        let decision = policy.evaluate_exit(DesiredState::Running, count, QUICK, &ExitOutcome::Code(1));
        assert_eq!(decision, ExitDecision::CrashLimitExceeded { restart_count: 6 });
        assert_eq!(decision.next_state(), LifecycleState::Fatal);
    }

    #[test]
    fn test_signal_death_counts_as_crash() {
        let decision = policy().evaluate_exit(DesiredState::Running, 0, QUICK, &ExitOutcome::Signal(11));
        assert!(matches!(decision, ExitDecision::Restart { restart_count: 1, .. }));
    }

    #[test]
    fn test_active_states() {
        assert!(LifecycleState::Spawning.is_active());
        assert!(LifecycleState::Running.is_active());
        assert!(LifecycleState::BackoffWait.is_active());
        assert!(!LifecycleState::Fatal.is_active());
        assert!(!LifecycleState::Terminating.is_active());
        assert!(!LifecycleState::Terminal.is_active());
    }

    #[test]
    fn test_exit_outcome_display() {
        assert_eq!(ExitOutcome::Code(2).to_string(), "exit code 2");
        assert_eq!(ExitOutcome::Signal(9).to_string(), "signal 9");
    }
}
