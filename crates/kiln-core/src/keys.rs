//! Typed state bag keys shared by the builder and its steps.

use crate::hook::Hook;
use crate::lock::HostLock;
use crate::shell::{CommandWrapper, ShellRunner};
use crate::teardown::{AttachedVolume, CopiedFiles, ExtraMounts, MountedDevice};
use crate::ui::Ui;
use kiln_config::Config;
use kiln_multistep::StateKey;
use kiln_platform::{ImageInfo, InstanceInfo, Platform};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

// Seeded by the builder.
pub const CONFIG: StateKey<Arc<Config>> = StateKey::new("config");
pub const UI: StateKey<Arc<dyn Ui>> = StateKey::new("ui");
pub const HOOK: StateKey<Arc<dyn Hook>> = StateKey::new("hook");
pub const PLATFORM: StateKey<Arc<dyn Platform>> = StateKey::new("platform");
pub const SHELL: StateKey<Arc<dyn ShellRunner>> = StateKey::new("shell");
pub const WRAPPED_COMMAND: StateKey<CommandWrapper> = StateKey::new("wrapped_command");

pub const INSTANCE: StateKey<InstanceInfo> = StateKey::new("instance");
/// Region images are registered in.
pub const REGION: StateKey<String> = StateKey::new("region");
pub const SOURCE_IMAGE: StateKey<ImageInfo> = StateKey::new("source_image");
pub const DEVICE: StateKey<PathBuf> = StateKey::new("device");
pub const VOLUME_ID: StateKey<String> = StateKey::new("volume_id");
pub const MOUNT_PATH: StateKey<PathBuf> = StateKey::new("mount_path");
pub const SNAPSHOT_ID: StateKey<String> = StateKey::new("snapshot_id");
/// Region to image id of everything registered so far.
pub const IMAGES: StateKey<BTreeMap<String, String>> = StateKey::new("images");

// Teardown tokens.
pub const HOST_LOCK: StateKey<HostLock> = StateKey::new("host_lock");
pub const ATTACHED_VOLUME: StateKey<AttachedVolume> = StateKey::new("attached_volume");
pub const MOUNTED_DEVICE: StateKey<MountedDevice> = StateKey::new("mounted_device");
pub const EXTRA_MOUNTS: StateKey<ExtraMounts> = StateKey::new("extra_mounts");
pub const COPIED_FILES: StateKey<CopiedFiles> = StateKey::new("copied_files");
