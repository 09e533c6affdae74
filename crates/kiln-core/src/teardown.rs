//! Undo actions for live side effects of a build.
//!
//! Each side effect is recorded in the state bag as a token. The matching
//! function here takes the token out of the bag and undoes the effect, so a
//! second call finds nothing to do. When the undo fails the token goes back
//! into the bag, holding only what is still live, and the next cleanup
//! retries it. Step cleanups and `StepEarlyCleanup` share these functions.

use crate::keys;
use crate::shell::shell_quote;
use crate::steps::{platform, run_wrapped};
use crate::CoreError;
use kiln_multistep::StateBag;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedVolume {
    pub volume_id: String,
    pub device: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedDevice {
    pub mount_path: PathBuf,
}

/// Mount points inside the chroot, in mount order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraMounts {
    pub paths: Vec<PathBuf>,
}

/// Files placed inside the chroot by `StepCopyFiles`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopiedFiles {
    pub paths: Vec<PathBuf>,
}

pub fn release_lock(state: &mut StateBag) {
    if let Some(lock) = state.take_key(&keys::HOST_LOCK) {
        debug!("unlocking {}", lock.path().display());
        drop(lock);
    }
}

pub fn detach_volume(state: &mut StateBag) -> Result<(), CoreError> {
    let Some(attached) = state.take_key(&keys::ATTACHED_VOLUME) else {
        return Ok(());
    };
    debug!(
        "detaching volume {} from {}",
        attached.volume_id,
        attached.device.display()
    );
    if let Err(e) = platform(state).detach_volume(&attached.volume_id) {
        state.put_key(&keys::ATTACHED_VOLUME, attached);
        return Err(e.into());
    }
    Ok(())
}

pub fn unmount_device(state: &mut StateBag) -> Result<(), CoreError> {
    let Some(mounted) = state.take_key(&keys::MOUNTED_DEVICE) else {
        return Ok(());
    };
    let command = format!("umount {}", shell_quote(&mounted.mount_path.to_string_lossy()));
    if let Err(e) = run_wrapped(state, &command) {
        state.put_key(&keys::MOUNTED_DEVICE, mounted);
        return Err(e);
    }
    Ok(())
}

/// Unmount extra mounts in reverse order. Every mount is attempted; the first
/// failure is returned and the mounts that are still up stay recorded.
pub fn unmount_extra(state: &mut StateBag) -> Result<(), CoreError> {
    let Some(mounts) = state.take_key(&keys::EXTRA_MOUNTS) else {
        return Ok(());
    };
    let mut first_err = None;
    let mut still_mounted = Vec::new();
    for path in mounts.paths.into_iter().rev() {
        let command = format!("umount {}", shell_quote(&path.to_string_lossy()));
        if let Err(e) = run_wrapped(state, &command) {
            warn!("failed to unmount {}: {e}", path.display());
            first_err.get_or_insert(e);
            still_mounted.push(path);
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => {
            still_mounted.reverse();
            state.put_key(
                &keys::EXTRA_MOUNTS,
                ExtraMounts {
                    paths: still_mounted,
                },
            );
            Err(e)
        }
    }
}

pub fn remove_copied_files(state: &mut StateBag) -> Result<(), CoreError> {
    let Some(files) = state.take_key(&keys::COPIED_FILES) else {
        return Ok(());
    };
    let mut first_err = None;
    let mut remaining = Vec::new();
    for path in files.paths {
        let command = format!("rm -f {}", shell_quote(&path.to_string_lossy()));
        if let Err(e) = run_wrapped(state, &command) {
            warn!("failed to remove {}: {e}", path.display());
            first_err.get_or_insert(e);
            remaining.push(path);
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => {
            state.put_key(&keys::COPIED_FILES, CopiedFiles { paths: remaining });
            Err(e)
        }
    }
}
