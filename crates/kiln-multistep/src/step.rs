use crate::{BoxError, StateBag};

/// What the runner should do after a step returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    /// Stop the pipeline. With an error in the bag this is a failure and
    /// triggers cleanup; without one it is an early successful stop.
    Halt,
}

/// One unit of pipeline work with a compensating cleanup action.
///
/// Steps keep their own immutable parameters and exchange everything else
/// through the [`StateBag`]. `cleanup` is only called for steps whose `run`
/// was invoked, and must tolerate a `run` that failed halfway.
pub trait Step: Send {
    fn name(&self) -> &str;

    fn run(&mut self, state: &mut StateBag) -> StepAction;

    /// Undo durable side effects of `run`. Errors are logged by the runner
    /// and never stop the cleanup of earlier steps.
    fn cleanup(&mut self, _state: &mut StateBag) -> Result<(), BoxError> {
        Ok(())
    }
}
