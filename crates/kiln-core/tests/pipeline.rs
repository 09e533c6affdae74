//! Builder-level tests: the full step pipeline against the in-memory and
//! directory-backed platforms, with host commands recorded instead of run.

use kiln_config::{parse_layer_str, BuilderDefaults};
use kiln_core::{
    Builder, CommandHook, Communicator, CoreError, Hook, HostLock, ShellOutput, ShellRunner, Ui,
    HOOK_PROVISION,
};
use kiln_platform::{LocalPlatform, MockPlatform, Platform, PlatformError, VolumeRequest};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingShell {
    commands: Mutex<Vec<String>>,
    fail_containing: Mutex<Option<String>>,
    fail_once: Mutex<Option<String>>,
}

impl RecordingShell {
    fn fail_containing(&self, needle: &str) {
        *self.fail_containing.lock().unwrap() = Some(needle.to_owned());
    }

    /// Fail the next command equal to `command`, then behave normally.
    fn fail_once(&self, command: &str) {
        *self.fail_once.lock().unwrap() = Some(command.to_owned());
    }

    fn count_exact(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn count_prefix(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

impl ShellRunner for RecordingShell {
    fn run(&self, command: &str) -> io::Result<ShellOutput> {
        self.commands.lock().unwrap().push(command.to_owned());
        let failing_once = {
            let mut once = self.fail_once.lock().unwrap();
            let hit = once.as_deref() == Some(command);
            if hit {
                *once = None;
            }
            hit
        };
        let failing = failing_once
            || self
                .fail_containing
                .lock()
                .unwrap()
                .as_deref()
                .is_some_and(|needle| command.contains(needle));
        Ok(ShellOutput {
            status: i32::from(failing),
            stdout: String::new(),
            stderr: if failing { "boom".to_owned() } else { String::new() },
        })
    }
}

#[derive(Default)]
struct RecordingUi {
    said: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    asked: Mutex<Vec<String>>,
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.said.lock().unwrap().push(message.to_owned());
    }
    fn message(&self, _message: &str) {}
    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_owned());
    }
    fn ask(&self, prompt: &str) -> io::Result<String> {
        self.asked.lock().unwrap().push(prompt.to_owned());
        Ok(String::new())
    }
}

struct Harness {
    dir: TempDir,
    platform: Arc<MockPlatform>,
    shell: Arc<RecordingShell>,
    ui: Arc<RecordingUi>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            platform: Arc::new(MockPlatform::new()),
            shell: Arc::new(RecordingShell::default()),
            ui: Arc::new(RecordingUi::default()),
        }
    }

    fn root_mount(&self) -> PathBuf {
        self.dir.path().join("mnt").join("xvdf")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.path().join("kiln.lock")
    }

    /// Base layer pointing mounts and the lock into the temp dir.
    fn base(&self) -> toml::Table {
        let mut table = parse_layer_str(
            r#"
image_name = "web-server"
source_image = "img-source"
provision_commands = ["apt-get update"]
"#,
        )
        .unwrap();
        table.insert(
            "mount_path".to_owned(),
            toml::Value::String(format!("{}/mnt/{{{{.Device}}}}", self.dir.path().display())),
        );
        table.insert(
            "lock_path".to_owned(),
            toml::Value::String(self.lock_path().display().to_string()),
        );
        table
    }

    fn builder(&self, overrides: &str) -> Builder {
        let mut builder = Builder::new()
            .with_platform(self.platform.clone())
            .with_shell(self.shell.clone());
        builder
            .prepare(&[self.base(), parse_layer_str(overrides).unwrap()])
            .unwrap();
        builder
    }

    fn run(&self, builder: &Builder) -> Result<Option<kiln_core::Artifact>, CoreError> {
        let hook = Arc::new(CommandHook::new(
            builder.config().unwrap().provision_commands.clone(),
        ));
        builder.run(self.ui.clone(), hook)
    }

    /// Everything the run created has been rolled back.
    fn assert_rolled_back(&self) {
        assert!(self.platform.volume_ids().is_empty(), "volumes left behind");
        assert!(self.platform.attached_volume_ids().is_empty());
        assert_eq!(self.platform.snapshot_ids(), vec!["snap-source"]);
        let images: Vec<String> = self.platform.images().into_iter().map(|i| i.id).collect();
        assert_eq!(images, vec!["img-source"]);
        assert!(HostLock::try_acquire(&self.lock_path()).unwrap().is_some());
    }
}

fn failed_step(result: Result<Option<kiln_core::Artifact>, CoreError>) -> String {
    match result {
        Err(CoreError::Step(err)) => err.step().to_owned(),
        Err(other) => panic!("expected a step error, got {other}"),
        Ok(_) => panic!("expected the build to fail"),
    }
}

#[test]
fn successful_build_produces_artifact_in_every_region() {
    let h = Harness::new();
    let builder = h.builder(
        r#"
image_regions = ["us-east-1", "eu-west-1"]
image_description = "web tier"
image_users = ["123456789012"]
image_tags = { team = "ops" }
"#,
    );

    let artifact = h.run(&builder).unwrap().expect("artifact");
    assert_eq!(artifact.builder_id(), "kiln.chroot");
    assert_eq!(
        artifact.images.keys().collect::<Vec<_>>(),
        vec!["eu-west-1", "us-east-1"]
    );

    for image in h
        .platform
        .images()
        .into_iter()
        .filter(|i| i.name == "web-server")
    {
        assert_eq!(artifact.images[&image.region], image.id);
        assert_eq!(image.description, "web tier");
        assert_eq!(image.users, vec!["123456789012"]);
        assert_eq!(image.tags.get("team").map(String::as_str), Some("ops"));
    }

    // Build volume is gone, the new snapshot stays and carries the tags.
    assert!(h.platform.volume_ids().is_empty());
    let snapshots = h.platform.snapshot_ids();
    assert_eq!(snapshots.len(), 2);
    let new_snapshot = snapshots.iter().find(|s| *s != "snap-source").unwrap();
    assert_eq!(
        h.platform.snapshot_tags(new_snapshot).unwrap().get("team"),
        Some(&"ops".to_owned())
    );

    let calls = h.platform.calls();
    let order = [
        "create_volume",
        "attach_volume",
        "detach_volume",
        "create_snapshot",
        "register_image",
        "copy_image",
        "modify_image_attributes",
        "create_tags",
        "delete_volume",
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|op| calls.iter().position(|c| c == op).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{calls:?}");

    // Five default chroot mounts plus the root device, each unmounted once.
    assert_eq!(h.shell.count_prefix("mount "), 6);
    assert_eq!(h.shell.count_prefix("umount "), 6);
    assert_eq!(h.shell.count_prefix("cp --remove-destination "), 1);
    assert_eq!(h.shell.count_prefix("rm -f "), 1);
    assert!(h
        .shell
        .commands()
        .iter()
        .any(|c| c.starts_with("chroot ") && c.ends_with("'apt-get update'")));
    assert!(h.ui.errors.lock().unwrap().is_empty());
    assert!(HostLock::try_acquire(&h.lock_path()).unwrap().is_some());
}

#[test]
fn extra_mounts_unmount_in_reverse_order() {
    let h = Harness::new();
    let builder = h.builder("");
    h.run(&builder).unwrap();

    let unmounts: Vec<String> = h
        .shell
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("umount "))
        .collect();
    assert!(unmounts[0].ends_with("/proc/sys/fs/binfmt_misc"));
    assert!(unmounts[4].ends_with("/proc"));
    // Root device last.
    assert!(unmounts[5].ends_with("/mnt/xvdf"));
}

#[test]
fn platform_failures_roll_back_everything() {
    for op in [
        "create_volume",
        "attach_volume",
        "create_snapshot",
        "register_image",
        "copy_image",
        "modify_image_attributes",
        "create_tags",
    ] {
        let h = Harness::new();
        let builder = h.builder(
            r#"
image_regions = ["eu-west-1"]
image_description = "web tier"
image_tags = { team = "ops" }
"#,
        );
        h.platform.fail_on(op);
        let step = failed_step(h.run(&builder));
        assert!(step.starts_with("Step"), "{op}: {step}");
        h.platform.clear_failures();
        h.assert_rolled_back();
        assert_eq!(h.ui.errors.lock().unwrap().len(), 1, "{op}");
    }
}

fn count_calls(platform: &MockPlatform, op: &str) -> usize {
    platform.calls().iter().filter(|c| *c == op).count()
}

#[test]
fn early_cleanup_detach_failure_is_retried_by_rollback() {
    let h = Harness::new();
    let builder = h.builder("");
    h.platform.fail_once("detach_volume");

    assert_eq!(failed_step(h.run(&builder)), "StepEarlyCleanup");
    assert_eq!(count_calls(&h.platform, "detach_volume"), 2);
    assert!(!h.platform.calls().contains(&"create_snapshot".to_owned()));
    h.assert_rolled_back();
}

#[test]
fn early_cleanup_root_unmount_failure_is_retried_by_rollback() {
    let h = Harness::new();
    let builder = h.builder("");
    let root_umount = format!("umount {}", h.root_mount().display());
    h.shell.fail_once(&root_umount);

    assert_eq!(failed_step(h.run(&builder)), "StepEarlyCleanup");
    assert_eq!(h.shell.count_exact(&root_umount), 2);
    // Extra mounts came down during early cleanup and are not repeated.
    assert_eq!(h.shell.count_prefix("umount "), 7);
    assert_eq!(count_calls(&h.platform, "detach_volume"), 1);
    h.assert_rolled_back();
}

#[test]
fn provisioning_failure_tears_down_mounts() {
    let h = Harness::new();
    let builder = h.builder("");
    h.shell.fail_containing("apt-get");

    assert_eq!(failed_step(h.run(&builder)), "StepChrootProvision");
    assert_eq!(h.shell.count_prefix("umount "), 6);
    assert_eq!(h.shell.count_prefix("rm -f "), 1);
    assert!(!h.platform.calls().contains(&"create_snapshot".to_owned()));
    h.assert_rolled_back();
}

#[test]
fn failed_mount_skips_later_steps() {
    let h = Harness::new();
    let builder = h.builder("");
    h.shell.fail_containing("mount -t proc");

    assert_eq!(failed_step(h.run(&builder)), "StepMountExtra");
    assert_eq!(h.shell.count_prefix("cp "), 0);
    // Only the root device was mounted.
    assert_eq!(h.shell.count_prefix("umount "), 1);
    h.assert_rolled_back();
}

#[test]
fn taken_image_name_fails_before_any_volume() {
    let h = Harness::new();
    h.run(&h.builder("")).unwrap().unwrap();

    let before = h.platform.calls().len();
    let step = failed_step(h.run(&h.builder("")));
    assert_eq!(step, "StepPreValidate");
    let calls = h.platform.calls();
    assert!(!calls[before..].contains(&"create_volume".to_owned()));
}

#[test]
fn force_deregister_replaces_existing_image() {
    let h = Harness::new();
    let first = h.run(&h.builder("")).unwrap().unwrap();
    let old_image = first.images["us-east-1"].clone();
    let old_snapshot = h
        .platform
        .snapshot_ids()
        .into_iter()
        .find(|s| s != "snap-source")
        .unwrap();

    let second = h.run(&h.builder("force_deregister = true")).unwrap().unwrap();
    assert_ne!(second.images["us-east-1"], old_image);
    let ids: Vec<String> = h.platform.images().into_iter().map(|i| i.id).collect();
    assert!(!ids.contains(&old_image));
    assert!(!h.platform.snapshot_ids().contains(&old_snapshot));
}

/// Cancels the builder from inside the provisioning hook.
struct CancelDuringProvision {
    builder: Mutex<Option<Arc<Builder>>>,
}

impl Hook for CancelDuringProvision {
    fn run(&self, name: &str, _ui: &dyn Ui, _comm: &dyn Communicator) -> Result<(), CoreError> {
        if name == HOOK_PROVISION {
            if let Some(builder) = self.builder.lock().unwrap().take() {
                builder.cancel();
            }
        }
        Ok(())
    }
}

#[test]
fn cancel_mid_run_rolls_back_and_yields_nothing() {
    let h = Harness::new();
    let builder = Arc::new(h.builder(""));
    let hook = Arc::new(CancelDuringProvision {
        builder: Mutex::new(Some(Arc::clone(&builder))),
    });

    let result = builder.run(h.ui.clone(), hook).unwrap();
    assert!(result.is_none());
    assert!(!h.platform.calls().contains(&"create_snapshot".to_owned()));
    h.assert_rolled_back();
}

#[test]
fn run_before_prepare_is_rejected() {
    let h = Harness::new();
    let builder = Builder::new().with_platform(h.platform.clone());
    let err = builder
        .run(h.ui.clone(), Arc::new(CommandHook::default()))
        .unwrap_err();
    assert!(matches!(err, CoreError::NotPrepared));
    assert!(h.platform.calls().is_empty());
}

#[test]
fn unsupported_platform_fails_at_run() {
    let h = Harness::new();
    let mut builder = Builder::with_defaults(BuilderDefaults::default());
    builder
        .prepare(&[h.base(), parse_layer_str("platform = \"vsphere\"").unwrap()])
        .unwrap();
    let err = builder
        .run(h.ui.clone(), Arc::new(CommandHook::default()))
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Platform(PlatformError::Unsupported(ref name)) if name == "vsphere"
    ));
}

#[test]
fn debug_run_pauses_around_every_step() {
    let h = Harness::new();
    let builder = h.builder("debug = true");
    h.run(&builder).unwrap().unwrap();

    let asked = h.ui.asked.lock().unwrap();
    // Before and after each of 20 steps, then before each cleanup.
    assert_eq!(asked.len(), 60);
    assert!(asked[0].contains("before run of step 'StepPreValidate'"));
    assert!(asked[1].contains("after run of step 'StepPreValidate'"));
    assert!(asked[40].contains("before cleanup of step 'StepCreateTags'"));
}

#[test]
fn credentials_are_not_part_of_step_output() {
    let h = Harness::new();
    let builder = h.builder("access_key = \"AKIDEXAMPLE\"\nsecret_key = \"s3cr3t\"");
    h.run(&builder).unwrap().unwrap();
    let said = h.ui.said.lock().unwrap().join("\n");
    assert!(!said.contains("s3cr3t"));
    assert!(!builder.config().unwrap().scrubbed().contains("s3cr3t"));
}

/// Writes a marker file straight into the attached volume.
struct WriteMarker {
    device: PathBuf,
}

impl Hook for WriteMarker {
    fn run(&self, name: &str, ui: &dyn Ui, _comm: &dyn Communicator) -> Result<(), CoreError> {
        if name == HOOK_PROVISION {
            ui.message("writing marker");
            std::fs::write(self.device.join("etc/motd"), "built by kiln\n")?;
        }
        Ok(())
    }
}

fn local_source(dir: &Path) -> (Arc<LocalPlatform>, String) {
    let rootfs = dir.join("rootfs");
    std::fs::create_dir_all(rootfs.join("etc")).unwrap();
    std::fs::write(rootfs.join("etc/os-release"), "ID=kiln\n").unwrap();
    let platform = LocalPlatform::open(dir.join("platform")).unwrap();
    let region = platform.instance_info().unwrap().region;
    let source = platform.import_image(&region, "base", &rootfs).unwrap();
    (Arc::new(platform), source)
}

#[test]
fn local_platform_snapshot_captures_provisioned_files() {
    let h = Harness::new();
    let (platform, source) = local_source(h.dir.path());

    let mut layer = h.base();
    layer.insert("source_image".to_owned(), toml::Value::String(source));
    let mut builder = Builder::new()
        .with_platform(platform.clone())
        .with_shell(h.shell.clone());
    builder
        .prepare(&[
            layer,
            parse_layer_str("mount_options = [\"bind\"]\nmount_partition = 0").unwrap(),
        ])
        .unwrap();

    let hook = Arc::new(WriteMarker {
        device: platform.device_root().join("xvdf"),
    });
    let artifact = builder.run(h.ui.clone(), hook).unwrap().unwrap();
    let region = platform.instance_info().unwrap().region;
    let image = platform
        .describe_image(&region, &artifact.images[&region])
        .unwrap();

    // Restore the registered snapshot and look for the marker.
    let snapshot_id = image.root_device().unwrap().snapshot_id.clone().unwrap();
    let volume = platform
        .create_volume(&VolumeRequest {
            snapshot_id,
            availability_zone: platform.instance_info().unwrap().availability_zone,
            size: 1,
        })
        .unwrap();
    let motd = std::fs::read_to_string(platform.volume_dir(&volume).join("etc/motd")).unwrap();
    assert_eq!(motd, "built by kiln\n");
    assert!(h
        .shell
        .commands()
        .iter()
        .any(|c| c.starts_with("mount -o bind ") && c.contains("/dev/xvdf")));
}
