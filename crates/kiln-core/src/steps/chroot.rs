use super::{finish, run_wrapped, ui};
use crate::hook::{ChrootCommunicator, HOOK_PROVISION};
use crate::keys;
use crate::shell::shell_quote;
use crate::teardown::{self, CopiedFiles, ExtraMounts, MountedDevice};
use crate::CoreError;
use kiln_config::{ChrootMount, TemplateContext};
use kiln_multistep::{BoxError, StateBag, Step, StepAction};
use kiln_platform::Virtualization;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

fn quoted(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// `path` re-rooted under `root`.
fn inside(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

pub struct StepMountDevice {
    /// Template rendered with `.Device`.
    pub mount_path: String,
    pub mount_options: Vec<String>,
    pub mount_partition: u32,
    pub context: TemplateContext,
}

impl StepMountDevice {
    fn mount(&self, state: &StateBag) -> Result<PathBuf, CoreError> {
        let device = state.get_key(&keys::DEVICE);
        let device_name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mount_path = PathBuf::from(
            self.context
                .clone()
                .with_var("Device", device_name)
                .render(&self.mount_path)?,
        );
        debug!("mount path: {}", mount_path.display());
        std::fs::create_dir_all(&mount_path)?;

        let image = state.get_key(&keys::SOURCE_IMAGE);
        let mut source = device.to_string_lossy().into_owned();
        if image.virtualization == Virtualization::Hvm && self.mount_partition > 0 {
            source.push_str(&self.mount_partition.to_string());
        }

        let mut command = String::from("mount");
        if !self.mount_options.is_empty() {
            command.push_str(" -o ");
            command.push_str(&shell_quote(&self.mount_options.join(",")));
        }
        command.push_str(&format!(" {} {}", shell_quote(&source), quoted(&mount_path)));
        ui(state).say(&format!("Mounting the root device at {}", mount_path.display()));
        run_wrapped(state, &command)?;
        Ok(mount_path)
    }
}

impl Step for StepMountDevice {
    fn name(&self) -> &str {
        "StepMountDevice"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        match self.mount(state) {
            Ok(mount_path) => {
                state.put_key(
                    &keys::MOUNTED_DEVICE,
                    MountedDevice {
                        mount_path: mount_path.clone(),
                    },
                );
                state.put_key(&keys::MOUNT_PATH, mount_path);
                StepAction::Continue
            }
            Err(e) => finish(state, self.name(), Err(e)),
        }
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        Ok(teardown::unmount_device(state)?)
    }
}

/// Mounts `[fstype, source, destination]` entries inside the chroot.
pub struct StepMountExtra {
    pub mounts: Vec<ChrootMount>,
}

impl StepMountExtra {
    fn mount_all(&self, state: &StateBag, mounted: &mut Vec<PathBuf>) -> Result<(), CoreError> {
        let root = state.get_key(&keys::MOUNT_PATH).clone();
        let ui = ui(state);
        for mount in &self.mounts {
            let target = inside(&root, &mount.destination);
            std::fs::create_dir_all(&target)?;
            let flags = if mount.fstype == "bind" {
                "--bind".to_owned()
            } else {
                format!("-t {}", shell_quote(&mount.fstype))
            };
            ui.message(&format!("Mounting: {}", target.display()));
            run_wrapped(
                state,
                &format!("mount {flags} {} {}", shell_quote(&mount.source), quoted(&target)),
            )?;
            mounted.push(target);
        }
        Ok(())
    }
}

impl Step for StepMountExtra {
    fn name(&self) -> &str {
        "StepMountExtra"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        ui(state).say("Mounting additional paths within the chroot...");
        let mut mounted = Vec::new();
        let result = self.mount_all(state, &mut mounted);
        // Partial progress still needs unmounting.
        state.put_key(&keys::EXTRA_MOUNTS, ExtraMounts { paths: mounted });
        finish(state, self.name(), result)
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        Ok(teardown::unmount_extra(state)?)
    }
}

/// Copies host files (e.g. `/etc/resolv.conf`) into the chroot.
pub struct StepCopyFiles {
    pub files: Vec<String>,
}

impl StepCopyFiles {
    fn copy_all(&self, state: &StateBag, copied: &mut Vec<PathBuf>) -> Result<(), CoreError> {
        let root = state.get_key(&keys::MOUNT_PATH).clone();
        let ui = ui(state);
        for file in &self.files {
            let dest = inside(&root, file);
            ui.message(&format!("Copying: {file}"));
            run_wrapped(
                state,
                &format!("cp --remove-destination {} {}", shell_quote(file), quoted(&dest)),
            )?;
            copied.push(dest);
        }
        Ok(())
    }
}

impl Step for StepCopyFiles {
    fn name(&self) -> &str {
        "StepCopyFiles"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        if self.files.is_empty() {
            return StepAction::Continue;
        }
        ui(state).say("Copying files from host to chroot...");
        let mut copied = Vec::new();
        let result = self.copy_all(state, &mut copied);
        state.put_key(&keys::COPIED_FILES, CopiedFiles { paths: copied });
        finish(state, self.name(), result)
    }

    fn cleanup(&mut self, state: &mut StateBag) -> Result<(), BoxError> {
        Ok(teardown::remove_copied_files(state)?)
    }
}

/// Fires the `provision` hook against the mounted chroot.
pub struct StepChrootProvision;

impl Step for StepChrootProvision {
    fn name(&self) -> &str {
        "StepChrootProvision"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        let ui = ui(state);
        let hook = Arc::clone(state.get_key(&keys::HOOK));
        let comm = ChrootCommunicator::new(
            state.get_key(&keys::MOUNT_PATH).clone(),
            Arc::clone(state.get_key(&keys::SHELL)),
            state.get_key(&keys::WRAPPED_COMMAND).clone(),
        );
        ui.say("Running the provision hook");
        let result = hook.run(HOOK_PROVISION, ui.as_ref(), &comm);
        finish(state, self.name(), result)
    }
}

/// Tears down copies, mounts, and the attachment before the snapshot so the
/// volume is quiescent.
pub struct StepEarlyCleanup;

impl Step for StepEarlyCleanup {
    fn name(&self) -> &str {
        "StepEarlyCleanup"
    }

    fn run(&mut self, state: &mut StateBag) -> StepAction {
        ui(state).say("Performing early cleanup...");
        let result = early_cleanup(state);
        finish(state, self.name(), result)
    }
}

fn early_cleanup(state: &mut StateBag) -> Result<(), CoreError> {
    teardown::remove_copied_files(state)?;
    teardown::unmount_extra(state)?;
    teardown::unmount_device(state)?;
    teardown::detach_volume(state)
}
