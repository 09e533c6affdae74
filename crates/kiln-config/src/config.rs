use crate::layers::merge_layers;
use crate::scrub::scrub;
use crate::template::{is_image_name_char, TemplateContext};
use crate::{ConfigError, ConfigErrors};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::debug;

/// Configuration exactly as written by the user, before defaults and
/// interpolation.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub image_name: String,
    pub image_description: String,
    pub image_users: Vec<String>,
    pub image_groups: Vec<String>,
    pub image_tags: BTreeMap<String, String>,
    pub image_regions: Vec<String>,
    pub force_deregister: bool,
    pub enhanced_networking: bool,
    pub source_image: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub platform: Option<String>,
    pub platform_root: Option<PathBuf>,
    pub root_volume_size: u64,
    pub device_path: String,
    pub mount_path: String,
    pub mount_options: Vec<String>,
    pub mount_partition: Option<u32>,
    pub chroot_mounts: Option<Vec<Vec<String>>>,
    pub copy_files: Option<Vec<String>>,
    pub command_wrapper: String,
    pub lock_path: Option<PathBuf>,
    pub provision_commands: Vec<String>,
    pub debug: bool,
}

/// One `mount -t <fstype> <source> <chroot>/<destination>` performed inside
/// the chroot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChrootMount {
    pub fstype: String,
    pub source: String,
    pub destination: String,
}

impl ChrootMount {
    pub fn new(fstype: &str, source: &str, destination: &str) -> Self {
        Self {
            fstype: fstype.to_owned(),
            source: source.to_owned(),
            destination: destination.to_owned(),
        }
    }
}

/// Values applied when the configuration leaves a field unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderDefaults {
    pub builder_id: String,
    pub platform: String,
    /// Accepted `platform` values; empty accepts any name.
    pub platforms: Vec<String>,
    pub platform_root: PathBuf,
    pub mount_path: String,
    pub mount_partition: u32,
    pub command_wrapper: String,
    pub lock_path: PathBuf,
    pub copy_files: Vec<String>,
    pub chroot_mounts: Vec<ChrootMount>,
}

impl Default for BuilderDefaults {
    fn default() -> Self {
        Self {
            builder_id: "kiln.chroot".to_owned(),
            platform: "local".to_owned(),
            platforms: Vec::new(),
            platform_root: PathBuf::from("/var/lib/kiln/platform"),
            mount_path: "/var/lib/kiln/chroot-volumes/{{.Device}}".to_owned(),
            mount_partition: 1,
            command_wrapper: "{{.Command}}".to_owned(),
            lock_path: PathBuf::from("/var/lock/kiln-chroot.lock"),
            copy_files: vec!["/etc/resolv.conf".to_owned()],
            chroot_mounts: vec![
                ChrootMount::new("proc", "proc", "/proc"),
                ChrootMount::new("sysfs", "sysfs", "/sys"),
                ChrootMount::new("bind", "/dev", "/dev"),
                ChrootMount::new("devpts", "devpts", "/dev/pts"),
                ChrootMount::new("binfmt_misc", "binfmt_misc", "/proc/sys/fs/binfmt_misc"),
            ],
        }
    }
}

/// Fully resolved and validated build configuration.
///
/// `mount_path` and `command_wrapper` are still templates: they are rendered
/// per call with `.Device` and `.Command` respectively.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Config {
    pub builder_id: String,
    pub image_name: String,
    pub image_description: String,
    pub image_users: Vec<String>,
    pub image_groups: Vec<String>,
    pub image_tags: BTreeMap<String, String>,
    pub image_regions: Vec<String>,
    pub force_deregister: bool,
    pub enhanced_networking: bool,
    pub source_image: String,
    /// Build region override; empty means the host instance's region.
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub platform: String,
    pub platform_root: PathBuf,
    pub root_volume_size: u64,
    pub device_path: Option<String>,
    pub mount_path: String,
    pub mount_options: Vec<String>,
    pub mount_partition: u32,
    pub chroot_mounts: Vec<ChrootMount>,
    pub copy_files: Vec<String>,
    pub command_wrapper: String,
    pub lock_path: PathBuf,
    pub provision_commands: Vec<String>,
    pub debug: bool,
}

impl Config {
    /// Debug representation with credentials replaced, safe for logs.
    pub fn scrubbed(&self) -> String {
        scrub(
            &format!("{self:?}"),
            &[self.access_key.as_str(), self.secret_key.as_str()],
        )
    }
}

/// Outcome of a successful [`prepare`].
#[derive(Debug, Clone)]
pub struct Prepared {
    pub config: Config,
    pub warnings: Vec<String>,
}

/// Merge `layers`, interpolate, apply `defaults`, and validate.
///
/// Every problem found is reported in the returned `ConfigErrors`.
pub fn prepare(
    layers: &[toml::Table],
    ctx: &TemplateContext,
    defaults: &BuilderDefaults,
) -> Result<Prepared, ConfigErrors> {
    let merged = merge_layers(layers);
    let raw: RawConfig = toml::Value::Table(merged)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigErrors::from(ConfigError::ParseToml(e)))?;

    let mut errs = ConfigErrors::new();
    let mut warnings = Vec::new();

    let image_name = render_field(ctx, "image_name", &raw.image_name, &mut errs);
    let image_description =
        render_field(ctx, "image_description", &raw.image_description, &mut errs);
    let source_image = render_field(ctx, "source_image", &raw.source_image, &mut errs);
    let image_tags: BTreeMap<String, String> = raw
        .image_tags
        .iter()
        .map(|(k, v)| (k.clone(), render_field(ctx, "image_tags", v, &mut errs)))
        .collect();
    let provision_commands: Vec<String> = raw
        .provision_commands
        .iter()
        .map(|c| render_field(ctx, "provision_commands", c, &mut errs))
        .collect();

    if image_name.is_empty() {
        if raw.image_name.is_empty() {
            errs.push(ConfigError::MissingField("image_name"));
        }
    } else {
        validate_image_name(&image_name, &mut errs);
    }
    if raw.source_image.trim().is_empty() {
        errs.push(ConfigError::MissingField("source_image"));
    }
    if raw.access_key.is_empty() != raw.secret_key.is_empty() {
        errs.push(ConfigError::IncompleteCredentials);
    }
    if image_tags.keys().any(|k| k.trim().is_empty()) {
        errs.push(ConfigError::EmptyTagKey);
    }

    let region = raw.region.trim().to_owned();
    let image_regions = normalize_regions(&raw.image_regions, &region, &mut errs, &mut warnings);

    let chroot_mounts = match &raw.chroot_mounts {
        None => defaults.chroot_mounts.clone(),
        Some(entries) => {
            let mut mounts = Vec::with_capacity(entries.len());
            for (index, entry) in entries.iter().enumerate() {
                if let [fstype, source, destination] = entry.as_slice() {
                    mounts.push(ChrootMount::new(fstype, source, destination));
                } else {
                    errs.push(ConfigError::InvalidChrootMount {
                        index,
                        len: entry.len(),
                    });
                }
            }
            mounts
        }
    };

    let copy_files = raw
        .copy_files
        .clone()
        .unwrap_or_else(|| defaults.copy_files.clone());
    for file in &copy_files {
        if !file.starts_with('/') {
            errs.push(ConfigError::InvalidCopyFile(file.clone()));
        }
    }

    let mount_path = if raw.mount_path.is_empty() {
        defaults.mount_path.clone()
    } else {
        raw.mount_path.clone()
    };
    const DEVICE_PROBE: &str = "kiln-device-probe";
    match ctx.clone().with_var("Device", DEVICE_PROBE).render(&mount_path) {
        Ok(rendered) if !rendered.contains(DEVICE_PROBE) => {
            errs.push(ConfigError::MountPathDropsDevice(mount_path.clone()));
        }
        Ok(_) => {}
        Err(source) => errs.push(ConfigError::Template {
            field: "mount_path",
            source,
        }),
    }

    let command_wrapper = if raw.command_wrapper.is_empty() {
        defaults.command_wrapper.clone()
    } else {
        raw.command_wrapper.clone()
    };
    const PROBE: &str = "kiln-wrapper-probe";
    match ctx.clone().with_var("Command", PROBE).render(&command_wrapper) {
        Ok(rendered) if !rendered.contains(PROBE) => {
            errs.push(ConfigError::CommandWrapperDropsCommand(
                command_wrapper.clone(),
            ));
        }
        Ok(_) => {}
        Err(source) => errs.push(ConfigError::Template {
            field: "command_wrapper",
            source,
        }),
    }

    let platform = raw
        .platform
        .as_deref()
        .map_or_else(|| defaults.platform.clone(), |p| p.trim().to_lowercase());
    if !defaults.platforms.is_empty() && !defaults.platforms.contains(&platform) {
        errs.push(ConfigError::UnknownPlatform(platform.clone()));
    }

    let device_path = Some(raw.device_path.trim().to_owned()).filter(|d| !d.is_empty());
    if raw.root_volume_size == 0 {
        debug!("root_volume_size unset; volume will match the source snapshot size");
    }

    errs.into_result()?;

    let config = Config {
        builder_id: defaults.builder_id.clone(),
        image_name,
        image_description,
        image_users: raw.image_users,
        image_groups: raw.image_groups,
        image_tags,
        image_regions,
        force_deregister: raw.force_deregister,
        enhanced_networking: raw.enhanced_networking,
        source_image: source_image.trim().to_owned(),
        region,
        access_key: raw.access_key,
        secret_key: raw.secret_key,
        platform,
        platform_root: raw
            .platform_root
            .unwrap_or_else(|| defaults.platform_root.clone()),
        root_volume_size: raw.root_volume_size,
        device_path,
        mount_path,
        mount_options: raw.mount_options,
        mount_partition: raw.mount_partition.unwrap_or(defaults.mount_partition),
        chroot_mounts,
        copy_files,
        command_wrapper,
        lock_path: raw.lock_path.unwrap_or_else(|| defaults.lock_path.clone()),
        provision_commands,
        debug: raw.debug,
    };
    Ok(Prepared { config, warnings })
}

fn render_field(
    ctx: &TemplateContext,
    field: &'static str,
    value: &str,
    errs: &mut ConfigErrors,
) -> String {
    match ctx.render(value) {
        Ok(rendered) => rendered,
        Err(source) => {
            errs.push(ConfigError::Template { field, source });
            String::new()
        }
    }
}

fn validate_image_name(name: &str, errs: &mut ConfigErrors) {
    let len = name.chars().count();
    if !(3..=128).contains(&len) {
        errs.push(ConfigError::InvalidImageName {
            name: name.to_owned(),
            reason: format!("must be between 3 and 128 characters long, got {len}"),
        });
    }
    if let Some(bad) = name.chars().find(|c| !is_image_name_char(*c)) {
        errs.push(ConfigError::InvalidImageName {
            name: name.to_owned(),
            reason: format!("contains invalid character '{bad}' (see clean_image_name)"),
        });
    }
}

fn normalize_regions(
    regions: &[String],
    build_region: &str,
    errs: &mut ConfigErrors,
    warnings: &mut Vec<String>,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(regions.len());
    for region in regions {
        let region = region.trim();
        if region.is_empty() {
            errs.push(ConfigError::EmptyRegion);
            continue;
        }
        if !seen.insert(region.to_owned()) {
            warnings.push(format!(
                "image_regions lists '{region}' more than once; duplicates are ignored"
            ));
            continue;
        }
        if region == build_region {
            warnings.push(format!(
                "image_regions includes the build region '{region}'; it will not be copied"
            ));
        }
        out.push(region.to_owned());
    }
    out
}
