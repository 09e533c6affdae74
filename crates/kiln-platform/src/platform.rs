use crate::types::{
    ImageAttributes, ImageInfo, InstanceInfo, RegisterRequest, Snapshot, VolumeRequest,
};
use crate::PlatformError;
use std::collections::BTreeMap;
use std::path::Path;

pub const SUPPORTED_PLATFORMS: &[&str] = &["local", "mock"];

/// Operations a chroot build performs against the image platform.
///
/// Volumes and snapshots live in the region of the host instance; image
/// operations name their region explicitly.
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    /// Directory in which attached volumes appear as device nodes.
    fn device_root(&self) -> &Path;

    fn instance_info(&self) -> Result<InstanceInfo, PlatformError>;

    fn describe_image(&self, region: &str, image_id: &str) -> Result<ImageInfo, PlatformError>;

    fn find_images_by_name(&self, region: &str, name: &str)
        -> Result<Vec<ImageInfo>, PlatformError>;

    /// Create a volume from a snapshot and return its id.
    fn create_volume(&self, request: &VolumeRequest) -> Result<String, PlatformError>;

    fn delete_volume(&self, volume_id: &str) -> Result<(), PlatformError>;

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &Path,
    ) -> Result<(), PlatformError>;

    fn detach_volume(&self, volume_id: &str) -> Result<(), PlatformError>;

    fn create_snapshot(&self, volume_id: &str, description: &str)
        -> Result<Snapshot, PlatformError>;

    fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<(), PlatformError>;

    /// Register an image and return its id.
    fn register_image(&self, request: &RegisterRequest) -> Result<String, PlatformError>;

    fn deregister_image(&self, region: &str, image_id: &str) -> Result<(), PlatformError>;

    /// Copy an image into `dest_region` and return the new image id.
    fn copy_image(
        &self,
        source_region: &str,
        image_id: &str,
        dest_region: &str,
        name: &str,
    ) -> Result<String, PlatformError>;

    fn modify_image_attributes(
        &self,
        region: &str,
        image_id: &str,
        attributes: &ImageAttributes,
    ) -> Result<(), PlatformError>;

    /// Tag images and snapshots. Unknown ids are an error.
    fn create_tags(
        &self,
        region: &str,
        resource_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError>;
}

pub fn is_supported(name: &str) -> bool {
    SUPPORTED_PLATFORMS.contains(&name)
}

pub fn select_platform(name: &str, root: &Path) -> Result<Box<dyn Platform>, PlatformError> {
    match name {
        "local" => Ok(Box::new(crate::local::LocalPlatform::open(root)?)),
        "mock" => Ok(Box::new(crate::mock::MockPlatform::new())),
        other => Err(PlatformError::Unsupported(other.to_owned())),
    }
}
