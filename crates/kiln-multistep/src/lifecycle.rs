use crate::RunnerError;
use std::fmt;

/// Lifecycle of a single [`Runner`](crate::Runner) invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Running,
    /// Every step continued, or a step stopped the pipeline without an error.
    Completed,
    /// A step recorded an error.
    Halted,
    /// Cancellation was observed between steps.
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Halted | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Halted => write!(f, "halted"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), RunnerError> {
    let valid = matches!(
        (from, to),
        (RunState::Idle, RunState::Running)
            | (
                RunState::Running,
                RunState::Completed | RunState::Halted | RunState::Cancelled
            )
    );

    if valid {
        Ok(())
    } else {
        Err(RunnerError::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(RunState::Idle, RunState::Running).is_ok());
        assert!(validate_transition(RunState::Running, RunState::Completed).is_ok());
        assert!(validate_transition(RunState::Running, RunState::Halted).is_ok());
        assert!(validate_transition(RunState::Running, RunState::Cancelled).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(RunState::Idle, RunState::Completed).is_err());
        assert!(validate_transition(RunState::Running, RunState::Running).is_err());
        assert!(validate_transition(RunState::Running, RunState::Idle).is_err());
        // no auto-restart
        assert!(validate_transition(RunState::Completed, RunState::Running).is_err());
        assert!(validate_transition(RunState::Halted, RunState::Running).is_err());
        assert!(validate_transition(RunState::Cancelled, RunState::Running).is_err());
        assert!(validate_transition(RunState::Halted, RunState::Completed).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Halted.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }
}
