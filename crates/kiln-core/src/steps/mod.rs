//! Concrete pipeline steps, in the order the builder assembles them.

mod chroot;
mod device;
mod image;
mod inspect;

pub use chroot::{
    StepChrootProvision, StepCopyFiles, StepEarlyCleanup, StepMountDevice, StepMountExtra,
};
pub use device::{
    StepAttachVolume, StepCreateVolume, StepEarlyUnflock, StepFlock, StepPrepareDevice,
};
pub use image::{
    StepCreateTags, StepDeregisterImage, StepImageRegionCopy, StepModifyImageAttributes,
    StepRegisterImage, StepSnapshot,
};
pub use inspect::{StepCheckRootDevice, StepInstanceInfo, StepPreValidate, StepSourceImageInfo};

use crate::keys;
use crate::shell::ShellOutput;
use crate::ui::Ui;
use crate::CoreError;
use kiln_multistep::{StateBag, StepAction, StepError};
use kiln_platform::Platform;
use std::sync::Arc;

pub(crate) fn platform(state: &StateBag) -> Arc<dyn Platform> {
    Arc::clone(state.get_key(&keys::PLATFORM))
}

pub(crate) fn ui(state: &StateBag) -> Arc<dyn Ui> {
    Arc::clone(state.get_key(&keys::UI))
}

/// Run `command` on the host through the configured command wrapper.
pub(crate) fn run_wrapped(state: &StateBag, command: &str) -> Result<ShellOutput, CoreError> {
    let shell = state.get_key(&keys::SHELL);
    state
        .get_key(&keys::WRAPPED_COMMAND)
        .run(shell.as_ref(), command)
}

/// The configured region, or the host instance's region when none is set.
pub(crate) fn build_region(platform: &dyn Platform, configured: &str) -> Result<String, CoreError> {
    if configured.is_empty() {
        Ok(platform.instance_info()?.region)
    } else {
        Ok(configured.to_owned())
    }
}

/// Record `result` for `step`: errors are reported to the UI, stored in the
/// bag, and halt the pipeline.
pub(crate) fn finish(state: &mut StateBag, step: &str, result: Result<(), CoreError>) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(e) => {
            ui(state).error(&e.to_string());
            state.set_error(StepError::new(step, e));
            StepAction::Halt
        }
    }
}

/// Whether durable results of this run should be rolled back.
pub(crate) fn rolling_back(state: &StateBag) -> bool {
    state.halted() || state.cancelled()
}
