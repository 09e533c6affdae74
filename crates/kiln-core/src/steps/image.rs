use super::{finish, platform, rolling_back, ui};
use crate::keys;
use crate::CoreError;
use kiln_multistep::{BoxError, StateBag, Step, StepAction};
use kiln_platform::{ImageAttributes, PlatformError, RegisterRequest};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub struct StepSnapshot {
    pub description: String,
}

impl Step for StepSnapshot {
    fn name(&self) -> &str {
        "StepSnapshot"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let volume_id = state.get_key(&keys::VOLUME_ID).clone();
        ui(state).say(&format!("Creating snapshot of {volume_id}..."));
        match platform(state).create_snapshot(&volume_id, &self.description) {
            Ok(snapshot) => {
                ui(state).message(&format!("Snapshot ID: {}", snapshot.id));
                state.put_key(&keys::SNAPSHOT_ID, snapshot.id);
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e.into())),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        if !rolling_back(state) {
            return Ok(());
        }
        let Some(snapshot_id) = state.take_key(&keys::SNAPSHOT_ID) else {
            return Ok(());
        };
        ui(state).say("Removing snapshot since we cancelled or halted...");
        let region = state.get_key(&keys::REGION).clone();
        platform(state).delete_snapshot(&region, &snapshot_id)?;
        Ok(())
    }
}

/// Removes existing images with the target name, and their snapshots, when
/// `force_deregister` is set.
pub struct StepDeregisterImage {
    pub force_deregister: bool,
    pub image_name: String,
    pub regions: Vec<String>,
}

impl StepDeregisterImage {
    fn deregister(&self, state: &StateBag) -> Result<(), CoreError> {
        let platform = platform(state);
        let ui = ui(state);
        let build_region = state.get_key(&keys::REGION);
        let mut regions = vec![build_region.clone()];
        regions.extend(self.regions.iter().filter(|r| *r != build_region).cloned());

        for region in &regions {
            for image in platform.find_images_by_name(region, &self.image_name)? {
                platform.deregister_image(region, &image.id)?;
                ui.say(&format!("Deregistered image {} in {region}", image.id));
                for snapshot_id in image.snapshot_ids() {
                    match platform.delete_snapshot(region, snapshot_id) {
                        Ok(()) => ui.message(&format!("Deleted snapshot {snapshot_id}")),
                        // Copies may share the source region's snapshot.
                        Err(PlatformError::NotFound { .. }) => {
                            warn!("snapshot {snapshot_id} not found in {region}, skipping");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(())
    }
}

impl Step for StepDeregisterImage {
    fn name(&self) -> &str {
        "StepDeregisterImage"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        if !self.force_deregister {
            return StepAction::Continue;
        }
        let result = self.deregister(state);
        finish(state, self.name(), result)
    }
}

pub struct StepRegisterImage {
    pub image_name: String,
    pub root_volume_size: u64,
    pub enhanced_networking: bool,
}

impl StepRegisterImage {
    fn request(&self, state: &StateBag) -> RegisterRequest {
        let source = state.get_key(&keys::SOURCE_IMAGE);
        let snapshot_id = state.get_key(&keys::SNAPSHOT_ID);
        let block_devices = source
            .block_devices
            .iter()
            .map(|device| {
                let mut device = device.clone();
                if device.device_name == source.root_device_name {
                    device.snapshot_id = Some(snapshot_id.clone());
                    device.volume_size = device.volume_size.max(self.root_volume_size);
                }
                device
            })
            .collect();
        RegisterRequest {
            name: self.image_name.clone(),
            region: state.get_key(&keys::REGION).clone(),
            description: String::new(),
            architecture: source.architecture.clone(),
            virtualization: source.virtualization,
            root_device_name: source.root_device_name.clone(),
            block_devices,
            enhanced_networking: self.enhanced_networking,
        }
    }
}

impl Step for StepRegisterImage {
    fn name(&self) -> &str {
        "StepRegisterImage"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        ui(state).say("Registering the image...");
        let request = self.request(state);
        match platform(state).register_image(&request) {
            Ok(image_id) => {
                info!("registered {image_id} in {}", request.region);
                ui(state).message(&format!("Image: {image_id}"));
                state.put_key(
                    &keys::IMAGES,
                    BTreeMap::from([(request.region, image_id)]),
                );
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e.into())),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        if !rolling_back(state) {
            return Ok(());
        }
        let Some(images) = state.take_key(&keys::IMAGES) else {
            return Ok(());
        };
        ui(state).say("Deregistering the image because of cancellation or error...");
        let platform = platform(state);
        let mut first_err = None;
        for (region, image_id) in &images {
            if let Err(e) = platform.deregister_image(region, image_id) {
                warn!("failed to deregister {image_id} in {region}: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Copies the registered image to every other configured region.
pub struct StepImageRegionCopy {
    pub regions: Vec<String>,
    pub image_name: String,
}

impl StepImageRegionCopy {
    fn copy_all(&self, state: &mut StateBag) -> Result<(), CoreError> {
        let platform = platform(state);
        let ui = ui(state);
        let build_region = state.get_key(&keys::REGION).clone();
        let source_id = state
            .get_key(&keys::IMAGES)
            .get(&build_region)
            .cloned()
            .ok_or_else(|| CoreError::Invalid(format!("no image registered in {build_region}")))?;
        for region in self.regions.iter().filter(|r| **r != build_region) {
            ui.message(&format!("Copying to: {region}"));
            let id = platform.copy_image(&build_region, &source_id, region, &self.image_name)?;
            if let Some(images) = state.get_key_mut(&keys::IMAGES) {
                images.insert(region.clone(), id);
            }
        }
        Ok(())
    }
}

impl Step for StepImageRegionCopy {
    fn name(&self) -> &str {
        "StepImageRegionCopy"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        if self.regions.is_empty() {
            return StepAction::Continue;
        }
        ui(state).say(&format!("Copying image to {} region(s)...", self.regions.len()));
        let result = self.copy_all(state);
        finish(state, self.name(), result)
    }
}

pub struct StepModifyImageAttributes {
    pub description: String,
    pub users: Vec<String>,
    pub groups: Vec<String>,
}

impl StepModifyImageAttributes {
    fn attributes(&self) -> ImageAttributes {
        ImageAttributes {
            description: Some(self.description.clone()).filter(|d| !d.is_empty()),
            users: self.users.clone(),
            groups: self.groups.clone(),
        }
    }
}

impl Step for StepModifyImageAttributes {
    fn name(&self) -> &str {
        "StepModifyImageAttributes"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let attributes = self.attributes();
        if attributes.is_empty() {
            return StepAction::Continue;
        }
        ui(state).say("Modifying image attributes...");
        let platform = platform(state);
        let images = state.get_key(&keys::IMAGES).clone();
        let result = images.iter().try_for_each(|(region, image_id)| {
            ui(state).message(&format!("Modifying: {image_id}"));
            platform
                .modify_image_attributes(region, image_id, &attributes)
                .map_err(CoreError::from)
        });
        finish(state, self.name(), result)
    }
}

/// Tags every image, and the snapshot in the build region.
pub struct StepCreateTags {
    pub tags: BTreeMap<String, String>,
}

impl Step for StepCreateTags {
    fn name(&self) -> &str {
        "StepCreateTags"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        if self.tags.is_empty() {
            return StepAction::Continue;
        }
        let platform = platform(state);
        let images = state.get_key(&keys::IMAGES).clone();
        let build_region = state.get_key(&keys::REGION).clone();
        let snapshot_id = state.get_key_ok(&keys::SNAPSHOT_ID).cloned();
        let result = images.iter().try_for_each(|(region, image_id)| {
            ui(state).say(&format!("Adding tags to image {image_id} in {region}"));
            let mut resources = vec![image_id.clone()];
            if *region == build_region {
                resources.extend(snapshot_id.clone());
            }
            platform
                .create_tags(region, &resources, &self.tags)
                .map_err(CoreError::from)
        });
        finish(state, self.name(), result)
    }
}
