//! Platform layer for kiln builds.
//!
//! Every call a build makes against the image platform goes through the
//! `Platform` trait: instance discovery, volume lifecycle, snapshots, image
//! registration, cross-region copies, and tagging. Two implementations ship
//! in-tree: `MockPlatform` (in memory, with a call log and failure injection)
//! and `LocalPlatform` (directories for volumes, tar archives for snapshots,
//! JSON records for images).

pub mod local;
pub mod mock;
pub mod platform;
pub mod types;

pub use local::LocalPlatform;
pub use mock::MockPlatform;
pub use platform::{is_supported, select_platform, Platform, SUPPORTED_PLATFORMS};
pub use types::{
    BlockDevice, ImageAttributes, ImageInfo, InstanceInfo, RegisterRequest, RootDeviceType,
    Snapshot, Virtualization, VolumeRequest,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("platform record error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{0}")]
    InvalidState(String),
    #[error("platform '{0}' is not supported")]
    Unsupported(String),
    #[error("injected failure in {0}")]
    Injected(String),
    #[error("platform state lock poisoned")]
    Poisoned,
}

impl PlatformError {
    pub(crate) fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_owned(),
        }
    }
}
