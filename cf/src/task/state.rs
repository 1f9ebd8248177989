//! Task instance states
//!
//! Transitions are driven by prerequisite satisfaction, job dispatch, status
//! messages/polls, timeouts, and retries. A terminal state is never replaced
//! by a non-terminal one for the same submit number.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Prerequisites not yet satisfied (or retry pending)
    #[default]
    Waiting,
    /// Eligible; job being prepared for dispatch
    Preparing,
    /// Job handed to its runner
    Submitted,
    /// Job started executing
    Running,
    /// Job finished successfully
    Succeeded,
    /// Job failed (terminal for this submit number)
    Failed,
    /// Submission failed (terminal for this submit number)
    SubmitFailed,
    /// Expired before running
    Expired,
}

impl TaskState {
    /// Terminal for the submit number: no further transition is recorded
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::SubmitFailed | Self::Expired)
    }

    /// Submitted or running: a job is out with a runner
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    /// Parse a state name as stored in the DB / shown to clients
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "waiting" => Self::Waiting,
            "preparing" => Self::Preparing,
            "submitted" => Self::Submitted,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "submit-failed" => Self::SubmitFailed,
            "expired" => Self::Expired,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Preparing => write!(f, "preparing"),
            Self::Submitted => write!(f, "submitted"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::SubmitFailed => write!(f, "submit-failed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrip() {
        for state in [
            TaskState::Waiting,
            TaskState::Preparing,
            TaskState::Submitted,
            TaskState::Running,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::SubmitFailed,
            TaskState::Expired,
        ] {
            assert_eq!(TaskState::parse(&state.to_string()), Some(state));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::SubmitFailed.is_terminal());
        assert!(TaskState::Expired.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn test_active_states() {
        assert!(TaskState::Submitted.is_active());
        assert!(TaskState::Running.is_active());
        assert!(!TaskState::Preparing.is_active());
        assert!(!TaskState::Succeeded.is_active());
    }
}
