use super::{build_region, finish, platform, ui};
use crate::keys;
use crate::CoreError;
use kiln_multistep::{StateBag, Step, StepAction};
use kiln_platform::{RootDeviceType, Virtualization};
use tracing::info;

/// Fails early when the target image name is already taken.
pub struct StepPreValidate {
    pub image_name: String,
    pub force_deregister: bool,
    pub region: String,
}

impl StepPreValidate {
    fn check(&self, state: &StateBag) -> Result<(), CoreError> {
        let ui = ui(state);
        if self.force_deregister {
            ui.say("Force deregister flag found, skipping prevalidating image name");
            return Ok(());
        }
        ui.say(&format!("Prevalidating image name: {}", self.image_name));
        let platform = platform(state);
        let region = build_region(platform.as_ref(), &self.region)?;
        let existing = platform.find_images_by_name(&region, &self.image_name)?;
        if let Some(image) = existing.first() {
            return Err(CoreError::Invalid(format!(
                "image name '{}' is used by an existing image: {} ({region})",
                self.image_name, image.id
            )));
        }
        Ok(())
    }
}

impl Step for StepPreValidate {
    fn name(&self) -> &str {
        "StepPreValidate"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let result = self.check(state);
        finish(state, self.name(), result)
    }
}

/// Looks up the host instance and settles the build region.
pub struct StepInstanceInfo {
    pub region: String,
}

impl Step for StepInstanceInfo {
    fn name(&self) -> &str {
        "StepInstanceInfo"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        ui(state).say("Gathering information about this instance...");
        let result = platform(state).instance_info().map_err(CoreError::from);
        match result {
            Ok(instance) => {
                info!(
                    "instance {} in {} ({})",
                    instance.id, instance.region, instance.availability_zone
                );
                let region = if self.region.is_empty() {
                    instance.region.clone()
                } else {
                    self.region.clone()
                };
                state.put_key(&keys::INSTANCE, instance);
                state.put_key(&keys::REGION, region);
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e)),
        }
    }
}

pub struct StepSourceImageInfo {
    pub source_image: String,
    pub enhanced_networking: bool,
}

impl Step for StepSourceImageInfo {
    fn name(&self) -> &str {
        "StepSourceImageInfo"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        ui(state).say("Inspecting the source image...");
        let region = state.get_key(&keys::REGION).clone();
        let result = platform(state)
            .describe_image(&region, &self.source_image)
            .map_err(CoreError::from)
            .and_then(|image| {
                if self.enhanced_networking && image.virtualization != Virtualization::Hvm {
                    return Err(CoreError::Invalid(format!(
                        "enhanced networking requires an HVM source image, {} is paravirtual",
                        image.id
                    )));
                }
                Ok(image)
            });
        match result {
            Ok(image) => {
                state.put_key(&keys::SOURCE_IMAGE, image);
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e)),
        }
    }
}

/// The source root device must be a volume with a snapshot to copy from.
pub struct StepCheckRootDevice;

impl Step for StepCheckRootDevice {
    fn name(&self) -> &str {
        "StepCheckRootDevice"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        ui(state).say("Checking the root device on source image...");
        let image = state.get_key(&keys::SOURCE_IMAGE);
        let result = if image.root_device_type != RootDeviceType::Volume {
            Err(CoreError::Invalid(format!(
                "source image {} must be volume-backed",
                image.id
            )))
        } else {
            match image.root_device() {
                None => Err(CoreError::Invalid(format!(
                    "root device {} not found in the block device mappings of {}",
                    image.root_device_name, image.id
                ))),
                Some(root) if root.snapshot_id.is_none() => Err(CoreError::Invalid(format!(
                    "root device {} of {} has no snapshot",
                    image.root_device_name, image.id
                ))),
                Some(_) => Ok(()),
            }
        };
        finish(state, self.name(), result)
    }
}
