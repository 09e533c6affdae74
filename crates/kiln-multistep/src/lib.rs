//! Step-execution engine for kiln image pipelines.
//!
//! A pipeline is an ordered list of [`Step`]s driven by a [`Runner`] against a
//! single [`StateBag`]. Steps communicate only through the bag. When a step
//! records an error, or the run is cancelled through a [`CancelHandle`], the
//! runner stops and invokes `cleanup` on every step that already ran, most
//! recent first. A debug runner can pause between steps for inspection.

pub mod cancel;
pub mod lifecycle;
pub mod runner;
pub mod state;
pub mod step;

pub use cancel::CancelHandle;
pub use lifecycle::{validate_transition, RunState};
pub use runner::{CleanupPolicy, DebugLocation, PauseFn, PausePoint, RunOutcome, Runner};
pub use state::{StateBag, StateKey, CANCELLED, ERROR, HALTED};
pub use step::{Step, StepAction};

use thiserror::Error;

/// Type-erased error carried by failing steps and cleanup actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid runner transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// Error recorded in the state bag by a failing step.
#[derive(Debug, Error)]
#[error("{step}: {source}")]
pub struct StepError {
    step: String,
    source: BoxError,
}

impl StepError {
    pub fn new(step: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            step: step.into(),
            source: source.into(),
        }
    }

    /// Name of the step that failed.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_display_includes_step_name() {
        let e = StepError::new("create_volume", "quota exceeded");
        assert_eq!(e.to_string(), "create_volume: quota exceeded");
        assert_eq!(e.step(), "create_volume");
        assert_eq!(e.cause().to_string(), "quota exceeded");
    }

    #[test]
    fn step_error_keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let e = StepError::new("mount_device", io);
        let source = std::error::Error::source(&e).unwrap();
        assert_eq!(source.to_string(), "no such device");
    }

    #[test]
    fn runner_error_display() {
        let e = RunnerError::InvalidTransition {
            from: RunState::Completed,
            to: RunState::Running,
        };
        assert_eq!(
            e.to_string(),
            "invalid runner transition: completed -> running"
        );
    }
}
