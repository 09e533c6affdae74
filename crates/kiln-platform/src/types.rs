use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The host the build runs on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    pub region: String,
    pub availability_zone: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Virtualization {
    Hvm,
    Paravirtual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RootDeviceType {
    Volume,
    InstanceStore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDevice {
    pub device_name: String,
    pub snapshot_id: Option<String>,
    /// Size in GiB.
    pub volume_size: u64,
    pub delete_on_termination: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub description: String,
    pub architecture: String,
    pub virtualization: Virtualization,
    pub root_device_type: RootDeviceType,
    pub root_device_name: String,
    pub block_devices: Vec<BlockDevice>,
    #[serde(default)]
    pub enhanced_networking: bool,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ImageInfo {
    /// The block device mapped at `root_device_name`, if any.
    pub fn root_device(&self) -> Option<&BlockDevice> {
        self.block_devices
            .iter()
            .find(|b| b.device_name == self.root_device_name)
    }

    /// Snapshots referenced by this image's block devices.
    pub fn snapshot_ids(&self) -> impl Iterator<Item = &str> {
        self.block_devices
            .iter()
            .filter_map(|b| b.snapshot_id.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub snapshot_id: String,
    pub availability_zone: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub region: String,
    pub volume_id: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub name: String,
    pub region: String,
    pub description: String,
    pub architecture: String,
    pub virtualization: Virtualization,
    pub root_device_name: String,
    pub block_devices: Vec<BlockDevice>,
    pub enhanced_networking: bool,
}

impl RegisterRequest {
    pub(crate) fn into_image(self, id: String) -> ImageInfo {
        ImageInfo {
            id,
            name: self.name,
            region: self.region,
            description: self.description,
            architecture: self.architecture,
            virtualization: self.virtualization,
            root_device_type: RootDeviceType::Volume,
            root_device_name: self.root_device_name,
            block_devices: self.block_devices,
            enhanced_networking: self.enhanced_networking,
            users: Vec::new(),
            groups: Vec::new(),
            tags: BTreeMap::new(),
        }
    }
}

/// Launch permissions and description applied after registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageAttributes {
    pub description: Option<String>,
    pub users: Vec<String>,
    pub groups: Vec<String>,
}

impl ImageAttributes {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.users.is_empty() && self.groups.is_empty()
    }

    pub(crate) fn apply(&self, image: &mut ImageInfo) {
        if let Some(description) = &self.description {
            description.clone_into(&mut image.description);
        }
        for user in &self.users {
            if !image.users.contains(user) {
                image.users.push(user.clone());
            }
        }
        for group in &self.groups {
            if !image.groups.contains(group) {
                image.groups.push(group.clone());
            }
        }
    }
}

/// Short random-looking id with a kind prefix, e.g. `vol-3f9a0c1b2d4e`.
pub(crate) fn new_id(prefix: &str, seq: u64) -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let hash = blake3::hash(format!("{prefix}:{nanos}:{seq}").as_bytes());
    format!("{prefix}-{}", &hash.to_hex()[..12])
}
