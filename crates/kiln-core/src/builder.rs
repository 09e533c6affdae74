use crate::artifact::{artifact_from_state, Artifact};
use crate::hook::Hook;
use crate::keys;
use crate::shell::{CommandWrapper, ShellRunner, SystemShell};
use crate::steps::{
    StepAttachVolume, StepCheckRootDevice, StepChrootProvision, StepCopyFiles, StepCreateTags,
    StepCreateVolume, StepDeregisterImage, StepEarlyCleanup, StepEarlyUnflock, StepFlock,
    StepImageRegionCopy, StepInstanceInfo, StepModifyImageAttributes, StepMountDevice,
    StepMountExtra, StepPreValidate, StepPrepareDevice, StepRegisterImage, StepSnapshot,
    StepSourceImageInfo,
};
use crate::ui::Ui;
use crate::CoreError;
use kiln_config::{BuilderDefaults, Config, ConfigErrors, TemplateContext};
use kiln_multistep::{
    CancelHandle, CleanupPolicy, DebugLocation, PausePoint, Runner, StateBag, Step,
};
use kiln_platform::{select_platform, Platform, SUPPORTED_PLATFORMS};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Assembles and runs the chroot image pipeline.
///
/// `Builder` is `Sync`: a signal handler holding it through an `Arc` can
/// call [`Builder::cancel`] while [`Builder::run`] is in progress on another
/// thread.
pub struct Builder {
    defaults: BuilderDefaults,
    context: TemplateContext,
    config: Option<Arc<Config>>,
    platform: Option<Arc<dyn Platform>>,
    shell: Arc<dyn ShellRunner>,
    in_flight: Mutex<Option<CancelHandle>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Builder with the stock defaults, accepting the in-tree platforms.
    pub fn new() -> Self {
        Self::with_defaults(BuilderDefaults {
            platforms: SUPPORTED_PLATFORMS.iter().map(|p| (*p).to_owned()).collect(),
            ..BuilderDefaults::default()
        })
    }

    pub fn with_defaults(defaults: BuilderDefaults) -> Self {
        Self {
            defaults,
            context: TemplateContext::new(),
            config: None,
            platform: None,
            shell: Arc::new(SystemShell),
            in_flight: Mutex::new(None),
        }
    }

    /// Use `platform` instead of the one named by the configuration.
    #[must_use]
    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: Arc<dyn ShellRunner>) -> Self {
        self.shell = shell;
        self
    }

    /// Template variables and clock used for interpolation.
    #[must_use]
    pub fn with_context(mut self, context: TemplateContext) -> Self {
        self.context = context;
        self
    }

    /// Merge, interpolate, default, and validate the configuration layers.
    /// Returns warnings on success.
    pub fn prepare(&mut self, raws: &[toml::Table]) -> Result<Vec<String>, ConfigErrors> {
        let prepared = kiln_config::prepare(raws, &self.context, &self.defaults)?;
        debug!("prepared config: {}", prepared.config.scrubbed());
        for warning in &prepared.warnings {
            warn!("{warning}");
        }
        self.config = Some(Arc::new(prepared.config));
        Ok(prepared.warnings)
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.as_deref()
    }

    /// Run the pipeline. `Ok(None)` means the run was cancelled or produced
    /// no images.
    pub fn run(&self, ui: Arc<dyn Ui>, hook: Arc<dyn Hook>) -> Result<Option<Artifact>, CoreError> {
        let config = self.config.clone().ok_or(CoreError::NotPrepared)?;
        let platform: Arc<dyn Platform> = match &self.platform {
            Some(platform) => Arc::clone(platform),
            None => Arc::from(select_platform(&config.platform, &config.platform_root)?),
        };
        info!(
            "building {} from {} on platform {}",
            config.image_name,
            config.source_image,
            platform.name()
        );

        let mut bag = StateBag::new();
        bag.put_key(&keys::CONFIG, Arc::clone(&config));
        bag.put_key(&keys::UI, Arc::clone(&ui));
        bag.put_key(&keys::HOOK, hook);
        bag.put_key(&keys::PLATFORM, platform);
        bag.put_key(&keys::SHELL, Arc::clone(&self.shell));
        bag.put_key(
            &keys::WRAPPED_COMMAND,
            CommandWrapper::new(config.command_wrapper.clone(), self.context.clone()),
        );

        let steps = assemble(&config, &self.context);
        let mut runner = if config.debug {
            Runner::debug(steps, ui_pause_fn(ui))
        } else {
            Runner::new(steps)
        }
        .with_cleanup_policy(CleanupPolicy::Always);

        *self.in_flight() = Some(runner.cancel_handle());
        let outcome = runner.run(&mut bag);
        *self.in_flight() = None;
        let outcome = outcome?;
        info!(
            "pipeline {} after {} step(s), {} cleaned up",
            outcome.state, outcome.executed, outcome.cleaned
        );

        artifact_from_state(&mut bag, &config.builder_id)
    }

    /// Cancel the run in progress, if any. Takes effect between steps.
    pub fn cancel(&self) {
        match self.in_flight().as_ref() {
            Some(handle) => {
                info!("cancelling build");
                handle.cancel();
            }
            None => debug!("cancel requested with no build in flight"),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<CancelHandle>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The pipeline, in execution order, with parameters bound from `config`.
fn assemble(config: &Config, context: &TemplateContext) -> Vec<Box<dyn Step>> {
    vec![
        Box::new(StepPreValidate {
            image_name: config.image_name.clone(),
            force_deregister: config.force_deregister,
            region: config.region.clone(),
        }),
        Box::new(StepInstanceInfo {
            region: config.region.clone(),
        }),
        Box::new(StepSourceImageInfo {
            source_image: config.source_image.clone(),
            enhanced_networking: config.enhanced_networking,
        }),
        Box::new(StepCheckRootDevice),
        Box::new(StepFlock {
            lock_path: config.lock_path.clone(),
        }),
        Box::new(StepPrepareDevice {
            device_path: config.device_path.clone(),
        }),
        Box::new(StepCreateVolume {
            root_volume_size: config.root_volume_size,
        }),
        Box::new(StepAttachVolume),
        Box::new(StepEarlyUnflock),
        Box::new(StepMountDevice {
            mount_path: config.mount_path.clone(),
            mount_options: config.mount_options.clone(),
            mount_partition: config.mount_partition,
            context: context.clone(),
        }),
        Box::new(StepMountExtra {
            mounts: config.chroot_mounts.clone(),
        }),
        Box::new(StepCopyFiles {
            files: config.copy_files.clone(),
        }),
        Box::new(StepChrootProvision),
        Box::new(StepEarlyCleanup),
        Box::new(StepSnapshot {
            description: format!("kiln: {}", config.image_name),
        }),
        Box::new(StepDeregisterImage {
            force_deregister: config.force_deregister,
            image_name: config.image_name.clone(),
            regions: config.image_regions.clone(),
        }),
        Box::new(StepRegisterImage {
            image_name: config.image_name.clone(),
            root_volume_size: config.root_volume_size,
            enhanced_networking: config.enhanced_networking,
        }),
        Box::new(StepImageRegionCopy {
            regions: config.image_regions.clone(),
            image_name: config.image_name.clone(),
        }),
        Box::new(StepModifyImageAttributes {
            description: config.image_description.clone(),
            users: config.image_users.clone(),
            groups: config.image_groups.clone(),
        }),
        Box::new(StepCreateTags {
            tags: config.image_tags.clone(),
        }),
    ]
}

/// Debug pause that blocks on the UI until the user presses enter.
pub fn ui_pause_fn(ui: Arc<dyn Ui>) -> impl FnMut(PausePoint<'_>, &mut StateBag) + Send + 'static {
    move |point: PausePoint<'_>, _state: &mut StateBag| {
        let location = match point.location {
            DebugLocation::BeforeRun => "before run of",
            DebugLocation::AfterRun => "after run of",
            DebugLocation::BeforeCleanup => "before cleanup of",
        };
        let prompt = format!(
            "Pausing {location} step '{}' ({}). Press enter to continue.",
            point.step,
            point.index + 1
        );
        if let Err(e) = ui.ask(&prompt) {
            warn!("debug pause could not read input: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_config::parse_layer_str;
    use kiln_platform::MockPlatform;

    #[test]
    fn pipeline_order() {
        let mut builder = Builder::new();
        builder
            .prepare(&[parse_layer_str("image_name = \"web\"\nsource_image = \"img-source\"").unwrap()])
            .unwrap();
        let config = builder.config().unwrap();
        let names: Vec<String> = assemble(config, &TemplateContext::new())
            .iter()
            .map(|s| s.name().to_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "StepPreValidate",
                "StepInstanceInfo",
                "StepSourceImageInfo",
                "StepCheckRootDevice",
                "StepFlock",
                "StepPrepareDevice",
                "StepCreateVolume",
                "StepAttachVolume",
                "StepEarlyUnflock",
                "StepMountDevice",
                "StepMountExtra",
                "StepCopyFiles",
                "StepChrootProvision",
                "StepEarlyCleanup",
                "StepSnapshot",
                "StepDeregisterImage",
                "StepRegisterImage",
                "StepImageRegionCopy",
                "StepModifyImageAttributes",
                "StepCreateTags",
            ]
        );
    }

    #[test]
    fn new_rejects_unknown_platform() {
        let mut builder = Builder::new();
        let err = builder
            .prepare(&[parse_layer_str(
                "image_name = \"web\"\nsource_image = \"img-1\"\nplatform = \"vsphere\"",
            )
            .unwrap()])
            .unwrap_err();
        assert!(err.to_string().contains("unknown platform 'vsphere'"));
        assert!(builder.config().is_none());
    }

    #[test]
    fn cancel_without_run_is_noop() {
        let builder = Builder::new().with_platform(Arc::new(MockPlatform::new()));
        builder.cancel();
        assert!(builder.in_flight().is_none());
    }

    #[test]
    fn builder_is_sync() {
        fn assert_sync<T: Send + Sync>() {}
        assert_sync::<Builder>();
    }
}
