use crate::cancel::CancelHandle;
use crate::lifecycle::{validate_transition, RunState};
use crate::step::{Step, StepAction};
use crate::{RunnerError, StateBag, StepError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info, warn};

/// Where a debug runner is pausing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLocation {
    BeforeRun,
    AfterRun,
    BeforeCleanup,
}

/// Context handed to the pause callback of a debug runner.
#[derive(Debug, Clone, Copy)]
pub struct PausePoint<'a> {
    pub location: DebugLocation,
    pub step: &'a str,
    /// Zero-based position of the step in the pipeline.
    pub index: usize,
}

/// Callback invoked at every pause point. The runner does not proceed until
/// it returns.
pub type PauseFn = Box<dyn FnMut(PausePoint<'_>, &mut StateBag) + Send>;

/// Which terminal outcomes trigger the reverse cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Clean up after a step error or cancellation.
    #[default]
    OnFailure,
    /// Also clean up when a step stops the pipeline early without an error.
    OnHalt,
    /// Clean up after every run, including full completion.
    Always,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    /// Number of steps whose `run` was invoked.
    pub executed: usize,
    /// Number of steps whose `cleanup` was invoked.
    pub cleaned: usize,
    /// A step returned `Halt` without recording an error.
    pub stopped_early: bool,
}

/// Sequential executor for an ordered list of steps.
///
/// A runner is used for exactly one run. Cancellation is observed between
/// steps; cleanup runs in reverse execution order over the steps that ran.
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
    executed: usize,
    state: RunState,
    cancel: CancelHandle,
    pause: Option<PauseFn>,
    policy: CleanupPolicy,
}

impl Runner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            steps,
            executed: 0,
            state: RunState::Idle,
            cancel: CancelHandle::new(),
            pause: None,
            policy: CleanupPolicy::default(),
        }
    }

    /// Interactive runner: `pause` is called before and after each step's
    /// `run` and before each `cleanup`.
    pub fn debug<F>(steps: Vec<Box<dyn Step>>, pause: F) -> Self
    where
        F: FnMut(PausePoint<'_>, &mut StateBag) + Send + 'static,
    {
        let mut runner = Self::new(steps);
        runner.pause = Some(Box::new(pause));
        runner
    }

    #[must_use]
    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_debug(&self) -> bool {
        self.pause.is_some()
    }

    /// Drive every step against `bag`. Fails only if the runner was already
    /// used; step failures are reported through the bag's error slot.
    pub fn run(&mut self, bag: &mut StateBag) -> Result<RunOutcome, RunnerError> {
        self.transition(RunState::Running)?;
        info!("running pipeline of {} steps", self.steps.len());

        let (terminal, stopped_early) = self.execute(bag);
        match terminal {
            RunState::Halted => bag.mark_halted(),
            RunState::Cancelled => bag.mark_cancelled(),
            _ => {}
        }
        self.transition(terminal)?;

        let sweep = match terminal {
            RunState::Halted | RunState::Cancelled => true,
            RunState::Completed => match self.policy {
                CleanupPolicy::OnFailure => false,
                CleanupPolicy::OnHalt => stopped_early,
                CleanupPolicy::Always => true,
            },
            RunState::Idle | RunState::Running => false,
        };
        let cleaned = if sweep { self.cleanup_executed(bag) } else { 0 };

        info!(
            "pipeline {terminal} after {} of {} steps",
            self.executed,
            self.steps.len()
        );
        Ok(RunOutcome {
            state: terminal,
            executed: self.executed,
            cleaned,
            stopped_early,
        })
    }

    fn transition(&mut self, to: RunState) -> Result<(), RunnerError> {
        validate_transition(self.state, to)?;
        debug!("runner transition: {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }

    fn execute(&mut self, bag: &mut StateBag) -> (RunState, bool) {
        for index in 0..self.steps.len() {
            if self.cancel.is_cancelled() {
                info!("cancellation observed before step {}", index + 1);
                return (RunState::Cancelled, false);
            }

            let name = self.steps[index].name().to_owned();
            pause_at(&mut self.pause, DebugLocation::BeforeRun, &name, index, bag);

            debug!("step {}/{}: {name}", index + 1, self.steps.len());
            let step = &mut self.steps[index];
            let action = match catch_unwind(AssertUnwindSafe(|| step.run(bag))) {
                Ok(action) => action,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!("step {name} panicked: {message}");
                    bag.set_error(StepError::new(name.clone(), format!("panicked: {message}")));
                    StepAction::Halt
                }
            };
            self.executed = index + 1;

            pause_at(&mut self.pause, DebugLocation::AfterRun, &name, index, bag);

            if let Some(err) = bag.error() {
                warn!("step {name} failed: {err}");
                return (RunState::Halted, false);
            }
            if action == StepAction::Halt {
                info!("step {name} stopped the pipeline early");
                return (RunState::Completed, true);
            }
            if self.cancel.is_cancelled() {
                info!("cancellation observed after step {name}");
                return (RunState::Cancelled, false);
            }
        }
        (RunState::Completed, false)
    }

    fn cleanup_executed(&mut self, bag: &mut StateBag) -> usize {
        let mut cleaned = 0;
        for index in (0..self.executed).rev() {
            let name = self.steps[index].name().to_owned();
            pause_at(
                &mut self.pause,
                DebugLocation::BeforeCleanup,
                &name,
                index,
                bag,
            );

            debug!("cleaning up step {name}");
            let step = &mut self.steps[index];
            match catch_unwind(AssertUnwindSafe(|| step.cleanup(bag))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("cleanup of step {name} failed: {e}"),
                Err(panic) => warn!(
                    "cleanup of step {name} panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
            cleaned += 1;
        }
        cleaned
    }
}

fn pause_at(
    pause: &mut Option<PauseFn>,
    location: DebugLocation,
    step: &str,
    index: usize,
    bag: &mut StateBag,
) {
    if let Some(pause) = pause.as_mut() {
        pause(
            PausePoint {
                location,
                step,
                index,
            },
            bag,
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxError;

    struct Named(&'static str, StepAction);

    impl Step for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn run(&mut self, _state: &mut StateBag) -> StepAction {
            self.1
        }
    }

    struct FailingCleanup;

    impl Step for FailingCleanup {
        fn name(&self) -> &str {
            "failing_cleanup"
        }

        fn run(&mut self, _state: &mut StateBag) -> StepAction {
            StepAction::Continue
        }

        fn cleanup(&mut self, _state: &mut StateBag) -> Result<(), BoxError> {
            Err("detach timed out".into())
        }
    }

    struct Failing;

    impl Step for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&mut self, state: &mut StateBag) -> StepAction {
            state.set_error(StepError::new("failing", "boom"));
            StepAction::Halt
        }
    }

    #[test]
    fn empty_pipeline_completes() {
        let mut runner = Runner::new(Vec::new());
        let mut bag = StateBag::new();
        let outcome = runner.run(&mut bag).unwrap();
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.executed, 0);
        assert!(runner.is_empty());
    }

    #[test]
    fn second_run_is_rejected() {
        let mut runner = Runner::new(vec![Box::new(Named("a", StepAction::Continue))]);
        let mut bag = StateBag::new();
        runner.run(&mut bag).unwrap();
        let err = runner.run(&mut bag).unwrap_err();
        assert!(matches!(
            err,
            RunnerError::InvalidTransition {
                from: RunState::Completed,
                to: RunState::Running
            }
        ));
    }

    #[test]
    fn early_halt_without_error_completes() {
        let mut runner = Runner::new(vec![
            Box::new(Named("a", StepAction::Halt)),
            Box::new(Named("b", StepAction::Continue)),
        ]);
        let mut bag = StateBag::new();
        let outcome = runner.run(&mut bag).unwrap();
        assert_eq!(outcome.state, RunState::Completed);
        assert!(outcome.stopped_early);
        assert_eq!(outcome.executed, 1);
        assert_eq!(outcome.cleaned, 0);
        assert!(!bag.halted());
    }

    #[test]
    fn cleanup_error_does_not_replace_step_error() {
        let mut runner = Runner::new(vec![Box::new(FailingCleanup), Box::new(Failing)]);
        let mut bag = StateBag::new();
        let outcome = runner.run(&mut bag).unwrap();
        assert_eq!(outcome.state, RunState::Halted);
        assert_eq!(outcome.cleaned, 2);
        assert_eq!(bag.error().unwrap().to_string(), "failing: boom");
        assert!(bag.halted());
    }

    struct Exploding;

    impl Step for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn run(&mut self, _state: &mut StateBag) -> StepAction {
            panic!("kaboom");
        }
    }

    #[test]
    fn panicking_step_halts_and_cleans_up() {
        let mut runner = Runner::new(vec![
            Box::new(Named("a", StepAction::Continue)),
            Box::new(Exploding),
            Box::new(Named("never", StepAction::Continue)),
        ]);
        let mut bag = StateBag::new();
        let outcome = runner.run(&mut bag).unwrap();
        assert_eq!(outcome.state, RunState::Halted);
        assert_eq!(outcome.executed, 2);
        assert_eq!(outcome.cleaned, 2);
        assert_eq!(
            bag.error().unwrap().to_string(),
            "exploding: panicked: kaboom"
        );
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }

    #[test]
    fn debug_runner_flag() {
        assert!(!Runner::new(Vec::new()).is_debug());
        assert!(Runner::debug(Vec::new(), |_, _| {}).is_debug());
    }
}
