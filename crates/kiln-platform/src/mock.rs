use crate::platform::Platform;
use crate::types::{
    new_id, BlockDevice, ImageAttributes, ImageInfo, InstanceInfo, RegisterRequest,
    RootDeviceType, Snapshot, Virtualization, VolumeRequest,
};
use crate::PlatformError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const MOCK_SOURCE_IMAGE: &str = "img-source";
pub const MOCK_SOURCE_SNAPSHOT: &str = "snap-source";

#[derive(Debug, Clone)]
struct MockVolume {
    size: u64,
    attached: Option<(String, PathBuf)>,
}

#[derive(Debug, Clone)]
struct MockSnapshot {
    snapshot: Snapshot,
    tags: BTreeMap<String, String>,
}

#[derive(Debug)]
struct MockState {
    instance: InstanceInfo,
    images: BTreeMap<String, ImageInfo>,
    volumes: BTreeMap<String, MockVolume>,
    snapshots: BTreeMap<String, MockSnapshot>,
    calls: Vec<String>,
    fail_on: BTreeSet<String>,
    fail_once: BTreeSet<String>,
    seq: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        new_id(prefix, self.seq)
    }

    fn image(&self, region: &str, image_id: &str) -> Result<&ImageInfo, PlatformError> {
        self.images
            .get(image_id)
            .filter(|i| i.region == region)
            .ok_or_else(|| PlatformError::not_found("image", image_id))
    }

    fn volume_mut(&mut self, volume_id: &str) -> Result<&mut MockVolume, PlatformError> {
        self.volumes
            .get_mut(volume_id)
            .ok_or_else(|| PlatformError::not_found("volume", volume_id))
    }
}

/// In-memory platform for tests and dry runs.
///
/// Seeded with one host instance in `us-east-1` and a volume-backed HVM
/// source image `img-source`. Every call is appended to a log, and any
/// operation can be made to fail with [`MockPlatform::fail_on`].
pub struct MockPlatform {
    state: Mutex<MockState>,
    device_root: PathBuf,
}

impl Default for MockPlatform {
    fn default() -> Self {
        let region = "us-east-1".to_owned();
        let source = ImageInfo {
            id: MOCK_SOURCE_IMAGE.to_owned(),
            name: "mock-source".to_owned(),
            region: region.clone(),
            description: "mock source image".to_owned(),
            architecture: "x86_64".to_owned(),
            virtualization: Virtualization::Hvm,
            root_device_type: RootDeviceType::Volume,
            root_device_name: "/dev/sda1".to_owned(),
            block_devices: vec![BlockDevice {
                device_name: "/dev/sda1".to_owned(),
                snapshot_id: Some(MOCK_SOURCE_SNAPSHOT.to_owned()),
                volume_size: 8,
                delete_on_termination: true,
            }],
            enhanced_networking: false,
            users: Vec::new(),
            groups: Vec::new(),
            tags: BTreeMap::new(),
        };
        let snapshot = Snapshot {
            id: MOCK_SOURCE_SNAPSHOT.to_owned(),
            region: region.clone(),
            volume_id: "vol-source".to_owned(),
            size: 8,
        };
        Self {
            state: Mutex::new(MockState {
                instance: InstanceInfo {
                    id: "i-mock0001".to_owned(),
                    region,
                    availability_zone: "us-east-1a".to_owned(),
                },
                images: BTreeMap::from([(source.id.clone(), source)]),
                volumes: BTreeMap::new(),
                snapshots: BTreeMap::from([(
                    snapshot.id.clone(),
                    MockSnapshot {
                        snapshot,
                        tags: BTreeMap::new(),
                    },
                )]),
                calls: Vec::new(),
                fail_on: BTreeSet::new(),
                fail_once: BTreeSet::new(),
                seq: 0,
            }),
            device_root: PathBuf::from("/dev/kiln-mock"),
        }
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_device_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.device_root = root.into();
        self
    }

    #[must_use]
    pub fn with_instance(self, instance: InstanceInfo) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.instance = instance;
        }
        self
    }

    /// Add or replace an image record.
    #[must_use]
    pub fn with_image(self, image: ImageInfo) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.images.insert(image.id.clone(), image);
        }
        self
    }

    /// Make every later call to `op` fail with [`PlatformError::Injected`].
    pub fn fail_on(&self, op: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_on.insert(op.to_owned());
        }
    }

    /// Make only the next call to `op` fail.
    pub fn fail_once(&self, op: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_once.insert(op.to_owned());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_on.clear();
            state.fail_once.clear();
        }
    }

    /// Operation names in call order, including failed calls.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn images(&self) -> Vec<ImageInfo> {
        self.state
            .lock()
            .map(|s| s.images.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn volume_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attached_volume_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| {
                s.volumes
                    .iter()
                    .filter(|(_, v)| v.attached.is_some())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshot_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.snapshots.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot_tags(&self, snapshot_id: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.snapshots.get(snapshot_id).map(|snap| snap.tags.clone()))
    }

    fn enter(&self, op: &str) -> Result<MutexGuard<'_, MockState>, PlatformError> {
        let mut state = self.state.lock().map_err(|_| PlatformError::Poisoned)?;
        state.calls.push(op.to_owned());
        if state.fail_on.contains(op) || state.fail_once.remove(op) {
            return Err(PlatformError::Injected(op.to_owned()));
        }
        Ok(state)
    }
}

impl Platform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn device_root(&self) -> &Path {
        &self.device_root
    }

    fn instance_info(&self) -> Result<InstanceInfo, PlatformError> {
        Ok(self.enter("instance_info")?.instance.clone())
    }

    fn describe_image(&self, region: &str, image_id: &str) -> Result<ImageInfo, PlatformError> {
        self.enter("describe_image")?
            .image(region, image_id)
            .cloned()
    }

    fn find_images_by_name(
        &self,
        region: &str,
        name: &str,
    ) -> Result<Vec<ImageInfo>, PlatformError> {
        let state = self.enter("find_images_by_name")?;
        Ok(state
            .images
            .values()
            .filter(|i| i.region == region && i.name == name)
            .cloned()
            .collect())
    }

    fn create_volume(&self, request: &VolumeRequest) -> Result<String, PlatformError> {
        let mut state = self.enter("create_volume")?;
        if !state.snapshots.contains_key(&request.snapshot_id) {
            return Err(PlatformError::not_found("snapshot", &request.snapshot_id));
        }
        let id = state.next_id("vol");
        state.volumes.insert(
            id.clone(),
            MockVolume {
                size: request.size,
                attached: None,
            },
        );
        Ok(id)
    }

    fn delete_volume(&self, volume_id: &str) -> Result<(), PlatformError> {
        let mut state = self.enter("delete_volume")?;
        if state.volume_mut(volume_id)?.attached.is_some() {
            return Err(PlatformError::InvalidState(format!(
                "volume {volume_id} is still attached"
            )));
        }
        state.volumes.remove(volume_id);
        Ok(())
    }

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &Path,
    ) -> Result<(), PlatformError> {
        let mut state = self.enter("attach_volume")?;
        let volume = state.volume_mut(volume_id)?;
        if volume.attached.is_some() {
            return Err(PlatformError::InvalidState(format!(
                "volume {volume_id} is already attached"
            )));
        }
        volume.attached = Some((instance_id.to_owned(), device.to_path_buf()));
        Ok(())
    }

    fn detach_volume(&self, volume_id: &str) -> Result<(), PlatformError> {
        let mut state = self.enter("detach_volume")?;
        let volume = state.volume_mut(volume_id)?;
        if volume.attached.take().is_none() {
            return Err(PlatformError::InvalidState(format!(
                "volume {volume_id} is not attached"
            )));
        }
        Ok(())
    }

    fn create_snapshot(
        &self,
        volume_id: &str,
        _description: &str,
    ) -> Result<Snapshot, PlatformError> {
        let mut state = self.enter("create_snapshot")?;
        let size = state.volume_mut(volume_id)?.size;
        let snapshot = Snapshot {
            id: state.next_id("snap"),
            region: state.instance.region.clone(),
            volume_id: volume_id.to_owned(),
            size,
        };
        state.snapshots.insert(
            snapshot.id.clone(),
            MockSnapshot {
                snapshot: snapshot.clone(),
                tags: BTreeMap::new(),
            },
        );
        Ok(snapshot)
    }

    fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<(), PlatformError> {
        let mut state = self.enter("delete_snapshot")?;
        match state.snapshots.get(snapshot_id) {
            Some(s) if s.snapshot.region == region => {
                state.snapshots.remove(snapshot_id);
                Ok(())
            }
            _ => Err(PlatformError::not_found("snapshot", snapshot_id)),
        }
    }

    fn register_image(&self, request: &RegisterRequest) -> Result<String, PlatformError> {
        let mut state = self.enter("register_image")?;
        if state
            .images
            .values()
            .any(|i| i.region == request.region && i.name == request.name)
        {
            return Err(PlatformError::InvalidState(format!(
                "image name '{}' is already in use in {}",
                request.name, request.region
            )));
        }
        let id = state.next_id("img");
        state
            .images
            .insert(id.clone(), request.clone().into_image(id.clone()));
        Ok(id)
    }

    fn deregister_image(&self, region: &str, image_id: &str) -> Result<(), PlatformError> {
        let mut state = self.enter("deregister_image")?;
        state.image(region, image_id)?;
        state.images.remove(image_id);
        Ok(())
    }

    fn copy_image(
        &self,
        source_region: &str,
        image_id: &str,
        dest_region: &str,
        name: &str,
    ) -> Result<String, PlatformError> {
        let mut state = self.enter("copy_image")?;
        let mut copy = state.image(source_region, image_id)?.clone();
        let id = state.next_id("img");
        copy.id.clone_from(&id);
        copy.region = dest_region.to_owned();
        copy.name = name.to_owned();
        copy.tags.clear();
        state.images.insert(id.clone(), copy);
        Ok(id)
    }

    fn modify_image_attributes(
        &self,
        region: &str,
        image_id: &str,
        attributes: &ImageAttributes,
    ) -> Result<(), PlatformError> {
        let mut state = self.enter("modify_image_attributes")?;
        state.image(region, image_id)?;
        if let Some(image) = state.images.get_mut(image_id) {
            attributes.apply(image);
        }
        Ok(())
    }

    fn create_tags(
        &self,
        region: &str,
        resource_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        let mut guard = self.enter("create_tags")?;
        let state = &mut *guard;
        for id in resource_ids {
            if let Some(image) = state.images.get_mut(id).filter(|i| i.region == region) {
                image.tags.extend(tags.clone());
            } else if let Some(snap) = state
                .snapshots
                .get_mut(id)
                .filter(|s| s.snapshot.region == region)
            {
                snap.tags.extend(tags.clone());
            } else {
                return Err(PlatformError::not_found("resource", id));
            }
        }
        Ok(())
    }
}
