//! Configuration layer for kiln image builds.
//!
//! Raw TOML layers are merged in order (`layers`), deserialized into
//! `RawConfig`, interpolated through the small template language in
//! `template`, resolved against `BuilderDefaults`, and validated. Validation
//! never stops at the first problem: every error is collected into a single
//! `ConfigErrors` so the caller sees all of them at once.

pub mod config;
pub mod layers;
pub mod scrub;
pub mod template;

pub use config::{prepare, BuilderDefaults, ChrootMount, Config, Prepared, RawConfig};
pub use layers::{merge_layers, parse_layer_file, parse_layer_str};
pub use scrub::scrub;
pub use template::{clean_image_name, TemplateContext, TemplateError};

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("{0} must be specified")]
    MissingField(&'static str),
    #[error("image_name '{name}' is invalid: {reason}")]
    InvalidImageName { name: String, reason: String },
    #[error("access_key and secret_key must be set together")]
    IncompleteCredentials,
    #[error("chroot_mounts[{index}] must have exactly 3 elements (fstype, source, destination), got {len}")]
    InvalidChrootMount { index: usize, len: usize },
    #[error("copy_files entry '{0}' must be an absolute path")]
    InvalidCopyFile(String),
    #[error("mount_path '{0}' must include {{{{.Device}}}}")]
    MountPathDropsDevice(String),
    #[error("command_wrapper '{0}' must include {{{{.Command}}}}")]
    CommandWrapperDropsCommand(String),
    #[error("image_tags key must not be empty")]
    EmptyTagKey,
    #[error("image_regions entry must not be empty")]
    EmptyRegion,
    #[error("unknown platform '{0}'")]
    UnknownPlatform(String),
    #[error("error rendering {field}: {source}")]
    Template {
        field: &'static str,
        source: TemplateError,
    },
}

/// Every validation failure found while preparing a configuration.
#[derive(Debug, Default)]
pub struct ConfigErrors {
    errors: Vec<ConfigError>,
}

impl ConfigErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ConfigError) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[ConfigError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), ConfigErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<ConfigError> for ConfigErrors {
    fn from(error: ConfigError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n* {e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}
