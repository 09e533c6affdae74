use super::{finish, platform, ui};
use crate::keys;
use crate::lock::HostLock;
use crate::teardown::{self, AttachedVolume};
use crate::CoreError;
use kiln_multistep::{BoxError, StateBag, Step, StepAction};
use kiln_platform::VolumeRequest;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Holds the host lock from device selection until the volume is attached.
pub struct StepFlock {
    pub lock_path: PathBuf,
}

impl Step for StepFlock {
    fn name(&self) -> &str {
        "StepFlock"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        debug!("acquiring host lock {}", self.lock_path.display());
        match HostLock::acquire(&self.lock_path) {
            Ok(lock) => {
                state.put_key(&keys::HOST_LOCK, lock);
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e)),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        teardown::release_lock(state);
        Ok(())
    }
}

pub struct StepPrepareDevice {
    pub device_path: Option<String>,
}

impl StepPrepareDevice {
    fn choose(&self, device_root: &Path) -> Result<PathBuf, CoreError> {
        let device = match &self.device_path {
            Some(path) => PathBuf::from(path),
            None => find_free_device(device_root).ok_or_else(|| {
                CoreError::Invalid(format!(
                    "no free device found under {}",
                    device_root.display()
                ))
            })?,
        };
        if device.symlink_metadata().is_ok() {
            return Err(CoreError::Invalid(format!(
                "device {} is already in use",
                device.display()
            )));
        }
        Ok(device)
    }
}

impl Step for StepPrepareDevice {
    fn name(&self) -> &str {
        "StepPrepareDevice"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let platform = platform(state);
        match self.choose(platform.device_root()) {
            Ok(device) => {
                info!("device selected: {}", device.display());
                state.put_key(&keys::DEVICE, device);
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e)),
        }
    }
}

/// First letter in `f..=p` for which neither `sdX` nor `xvdX` exists.
fn find_free_device(root: &Path) -> Option<PathBuf> {
    ('f'..='p').find_map(|letter| {
        let taken = ["sd", "xvd"]
            .iter()
            .any(|prefix| root.join(format!("{prefix}{letter}")).symlink_metadata().is_ok());
        (!taken).then(|| root.join(format!("xvd{letter}")))
    })
}

/// Creates the build volume from the source root snapshot.
pub struct StepCreateVolume {
    pub root_volume_size: u64,
}

impl StepCreateVolume {
    fn request(&self, state: &StateBag) -> Result<VolumeRequest, CoreError> {
        let image = state.get_key(&keys::SOURCE_IMAGE);
        let root = image
            .root_device()
            .ok_or_else(|| CoreError::Invalid(format!("{} has no root device", image.id)))?;
        let snapshot_id = root
            .snapshot_id
            .clone()
            .ok_or_else(|| CoreError::Invalid(format!("{} has no root snapshot", image.id)))?;
        Ok(VolumeRequest {
            snapshot_id,
            availability_zone: state.get_key(&keys::INSTANCE).availability_zone.clone(),
            size: self.root_volume_size.max(root.volume_size),
        })
    }
}

impl Step for StepCreateVolume {
    fn name(&self) -> &str {
        "StepCreateVolume"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        ui(state).say("Creating the root volume...");
        let result = self.request(state).and_then(|request| {
            debug!("volume request: {request:?}");
            Ok(platform(state).create_volume(&request)?)
        });
        match result {
            Ok(volume_id) => {
                ui(state).message(&format!("Volume ID: {volume_id}"));
                state.put_key(&keys::VOLUME_ID, volume_id);
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e)),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        let Some(volume_id) = state.take_key(&keys::VOLUME_ID) else {
            return Ok(());
        };
        ui(state).say("Deleting the created volume...");
        platform(state).delete_volume(&volume_id)?;
        Ok(())
    }
}

pub struct StepAttachVolume;

impl Step for StepAttachVolume {
    fn name(&self) -> &str {
        "StepAttachVolume"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let volume_id = state.get_key(&keys::VOLUME_ID).clone();
        let device = state.get_key(&keys::DEVICE).clone();
        let instance_id = state.get_key(&keys::INSTANCE).id.clone();
        ui(state).say(&format!("Attaching the root volume to {}", device.display()));
        match platform(state).attach_volume(&volume_id, &instance_id, &device) {
            Ok(()) => {
                state.put_key(&keys::ATTACHED_VOLUME, AttachedVolume { volume_id, device });
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e.into())),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        Ok(teardown::detach_volume(state)?)
    }
}

/// Releases the host lock once the device is claimed.
pub struct StepEarlyUnflock;

impl Step for StepEarlyUnflock {
    fn name(&self) -> &str {
        "StepEarlyUnflock"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        teardown::release_lock(state);
        StepAction::Continue
    }
}
