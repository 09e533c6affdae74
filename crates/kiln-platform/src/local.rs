//! Filesystem-backed platform.
//!
//! Layout under the platform root:
//!
//! ```text
//! dev/                 attached volumes appear here as symlinks
//! volumes/<id>/        volume contents
//! volumes/<id>.json    volume record
//! snapshots/<id>.tar   deterministic archive of a volume
//! snapshots/<id>.json  snapshot record and tags
//! images/<id>.json     image record
//! instance.json        optional host identity override
//! ```
//!
//! Volumes are plain directories, so a build against this platform mounts
//! them with `mount_options = ["bind"]` and `mount_partition = 0`.

use crate::platform::Platform;
use crate::types::{
    new_id, BlockDevice, ImageAttributes, ImageInfo, InstanceInfo, RegisterRequest, Snapshot,
    Virtualization, VolumeRequest,
};
use crate::PlatformError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeRecord {
    id: String,
    size: u64,
    snapshot_id: String,
    availability_zone: String,
    attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Attachment {
    instance_id: String,
    device: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotRecord {
    snapshot: Snapshot,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

pub struct LocalPlatform {
    root: PathBuf,
    device_root: PathBuf,
    seq: AtomicU64,
}

impl LocalPlatform {
    /// Open (and initialize if needed) a platform rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PlatformError> {
        let root = root.into();
        let platform = Self {
            device_root: root.join("dev"),
            root,
            seq: AtomicU64::new(0),
        };
        for dir in [
            platform.device_root.clone(),
            platform.volumes_dir(),
            platform.snapshots_dir(),
            platform.images_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(platform)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn volume_dir(&self, volume_id: &str) -> PathBuf {
        self.volumes_dir().join(volume_id)
    }

    pub fn snapshot_archive(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir().join(format!("{snapshot_id}.tar"))
    }

    /// Snapshot `source_dir` and register it as a single-volume HVM image.
    pub fn import_image(
        &self,
        region: &str,
        name: &str,
        source_dir: &Path,
    ) -> Result<String, PlatformError> {
        let snapshot = Snapshot {
            id: self.next_id("snap"),
            region: region.to_owned(),
            volume_id: String::new(),
            size: 1,
        };
        let archive = pack_dir(source_dir)?;
        write_atomic(&self.snapshot_archive(&snapshot.id), &archive)?;
        self.write_snapshot(&SnapshotRecord {
            snapshot: snapshot.clone(),
            tags: BTreeMap::new(),
        })?;
        self.register_image(&RegisterRequest {
            name: name.to_owned(),
            region: region.to_owned(),
            description: format!("imported from {}", source_dir.display()),
            architecture: std::env::consts::ARCH.to_owned(),
            virtualization: Virtualization::Hvm,
            root_device_name: "/dev/sda1".to_owned(),
            block_devices: vec![BlockDevice {
                device_name: "/dev/sda1".to_owned(),
                snapshot_id: Some(snapshot.id),
                volume_size: snapshot.size,
                delete_on_termination: true,
            }],
            enhanced_networking: false,
        })
    }

    fn volumes_dir(&self) -> PathBuf {
        self.root.join("volumes")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn next_id(&self, prefix: &str) -> String {
        new_id(prefix, self.seq.fetch_add(1, Ordering::SeqCst))
    }

    fn read_volume(&self, volume_id: &str) -> Result<VolumeRecord, PlatformError> {
        read_json(&self.volumes_dir().join(format!("{volume_id}.json")))?
            .ok_or_else(|| PlatformError::not_found("volume", volume_id))
    }

    fn write_volume(&self, record: &VolumeRecord) -> Result<(), PlatformError> {
        write_json(
            &self.volumes_dir().join(format!("{}.json", record.id)),
            record,
        )
    }

    fn read_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>, PlatformError> {
        read_json(&self.snapshots_dir().join(format!("{snapshot_id}.json")))
    }

    fn write_snapshot(&self, record: &SnapshotRecord) -> Result<(), PlatformError> {
        write_json(
            &self
                .snapshots_dir()
                .join(format!("{}.json", record.snapshot.id)),
            record,
        )
    }

    fn image_path(&self, image_id: &str) -> PathBuf {
        self.images_dir().join(format!("{image_id}.json"))
    }

    fn read_image(&self, region: &str, image_id: &str) -> Result<ImageInfo, PlatformError> {
        read_json::<ImageInfo>(&self.image_path(image_id))?
            .filter(|i| i.region == region)
            .ok_or_else(|| PlatformError::not_found("image", image_id))
    }

    fn write_image(&self, image: &ImageInfo) -> Result<(), PlatformError> {
        write_json(&self.image_path(&image.id), image)
    }

    fn list_images(&self) -> Result<Vec<ImageInfo>, PlatformError> {
        let mut images = Vec::new();
        for entry in fs::read_dir(self.images_dir())? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(image) = read_json::<ImageInfo>(&path)? {
                    images.push(image);
                }
            }
        }
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }
}

impl Platform for LocalPlatform {
    fn name(&self) -> &'static str {
        "local"
    }

    fn device_root(&self) -> &Path {
        &self.device_root
    }

    fn instance_info(&self) -> Result<InstanceInfo, PlatformError> {
        Ok(
            read_json(&self.root.join("instance.json"))?.unwrap_or_else(|| InstanceInfo {
                id: "local-host".to_owned(),
                region: "local".to_owned(),
                availability_zone: "local-a".to_owned(),
            }),
        )
    }

    fn describe_image(&self, region: &str, image_id: &str) -> Result<ImageInfo, PlatformError> {
        self.read_image(region, image_id)
    }

    fn find_images_by_name(
        &self,
        region: &str,
        name: &str,
    ) -> Result<Vec<ImageInfo>, PlatformError> {
        Ok(self
            .list_images()?
            .into_iter()
            .filter(|i| i.region == region && i.name == name)
            .collect())
    }

    fn create_volume(&self, request: &VolumeRequest) -> Result<String, PlatformError> {
        if self.read_snapshot(&request.snapshot_id)?.is_none() {
            return Err(PlatformError::not_found("snapshot", &request.snapshot_id));
        }
        let id = self.next_id("vol");
        let data = fs::read(self.snapshot_archive(&request.snapshot_id))?;
        unpack_dir(&data, &self.volume_dir(&id))?;
        self.write_volume(&VolumeRecord {
            id: id.clone(),
            size: request.size,
            snapshot_id: request.snapshot_id.clone(),
            availability_zone: request.availability_zone.clone(),
            attachment: None,
        })?;
        debug!("created volume {id} from {}", request.snapshot_id);
        Ok(id)
    }

    fn delete_volume(&self, volume_id: &str) -> Result<(), PlatformError> {
        let record = self.read_volume(volume_id)?;
        if record.attachment.is_some() {
            return Err(PlatformError::InvalidState(format!(
                "volume {volume_id} is still attached"
            )));
        }
        let dir = self.volume_dir(volume_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::remove_file(self.volumes_dir().join(format!("{volume_id}.json")))?;
        Ok(())
    }

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &Path,
    ) -> Result<(), PlatformError> {
        let mut record = self.read_volume(volume_id)?;
        if record.attachment.is_some() {
            return Err(PlatformError::InvalidState(format!(
                "volume {volume_id} is already attached"
            )));
        }
        if device.symlink_metadata().is_ok() {
            return Err(PlatformError::InvalidState(format!(
                "device {} is in use",
                device.display()
            )));
        }
        std::os::unix::fs::symlink(self.volume_dir(volume_id), device)?;
        record.attachment = Some(Attachment {
            instance_id: instance_id.to_owned(),
            device: device.to_path_buf(),
        });
        self.write_volume(&record)
    }

    fn detach_volume(&self, volume_id: &str) -> Result<(), PlatformError> {
        let mut record = self.read_volume(volume_id)?;
        let Some(attachment) = record.attachment.take() else {
            return Err(PlatformError::InvalidState(format!(
                "volume {volume_id} is not attached"
            )));
        };
        if attachment.device.symlink_metadata().is_ok() {
            fs::remove_file(&attachment.device)?;
        } else {
            warn!(
                "device {} for volume {volume_id} already gone",
                attachment.device.display()
            );
        }
        self.write_volume(&record)
    }

    fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<Snapshot, PlatformError> {
        let volume = self.read_volume(volume_id)?;
        let snapshot = Snapshot {
            id: self.next_id("snap"),
            region: self.instance_info()?.region,
            volume_id: volume_id.to_owned(),
            size: volume.size,
        };
        let archive = pack_dir(&self.volume_dir(volume_id))?;
        write_atomic(&self.snapshot_archive(&snapshot.id), &archive)?;
        self.write_snapshot(&SnapshotRecord {
            snapshot: snapshot.clone(),
            tags: BTreeMap::new(),
        })?;
        debug!(
            "snapshot {} of {volume_id} ({} bytes): {description}",
            snapshot.id,
            archive.len()
        );
        Ok(snapshot)
    }

    fn delete_snapshot(&self, region: &str, snapshot_id: &str) -> Result<(), PlatformError> {
        match self.read_snapshot(snapshot_id)? {
            Some(record) if record.snapshot.region == region => {
                let archive = self.snapshot_archive(snapshot_id);
                if archive.exists() {
                    fs::remove_file(archive)?;
                }
                fs::remove_file(self.snapshots_dir().join(format!("{snapshot_id}.json")))?;
                Ok(())
            }
            _ => Err(PlatformError::not_found("snapshot", snapshot_id)),
        }
    }

    fn register_image(&self, request: &RegisterRequest) -> Result<String, PlatformError> {
        if !self
            .find_images_by_name(&request.region, &request.name)?
            .is_empty()
        {
            return Err(PlatformError::InvalidState(format!(
                "image name '{}' is already in use in {}",
                request.name, request.region
            )));
        }
        let id = self.next_id("img");
        self.write_image(&request.clone().into_image(id.clone()))?;
        Ok(id)
    }

    fn deregister_image(&self, region: &str, image_id: &str) -> Result<(), PlatformError> {
        self.read_image(region, image_id)?;
        fs::remove_file(self.image_path(image_id))?;
        Ok(())
    }

    fn copy_image(
        &self,
        source_region: &str,
        image_id: &str,
        dest_region: &str,
        name: &str,
    ) -> Result<String, PlatformError> {
        let mut image = self.read_image(source_region, image_id)?;
        image.id = self.next_id("img");
        image.region = dest_region.to_owned();
        image.name = name.to_owned();
        image.tags.clear();
        self.write_image(&image)?;
        Ok(image.id)
    }

    fn modify_image_attributes(
        &self,
        region: &str,
        image_id: &str,
        attributes: &ImageAttributes,
    ) -> Result<(), PlatformError> {
        let mut image = self.read_image(region, image_id)?;
        attributes.apply(&mut image);
        self.write_image(&image)
    }

    fn create_tags(
        &self,
        region: &str,
        resource_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        for id in resource_ids {
            if let Ok(mut image) = self.read_image(region, id) {
                image.tags.extend(tags.clone());
                self.write_image(&image)?;
            } else if let Some(mut record) = self
                .read_snapshot(id)?
                .filter(|r| r.snapshot.region == region)
            {
                record.tags.extend(tags.clone());
                self.write_snapshot(&record)?;
            } else {
                return Err(PlatformError::not_found("resource", id));
            }
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PlatformError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PlatformError> {
    write_atomic(path, &serde_json::to_vec_pretty(value)?)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), PlatformError> {
    let dir = path
        .parent()
        .ok_or_else(|| PlatformError::InvalidState(format!("{} has no parent", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PlatformError::Io(e.error))?;
    Ok(())
}

/// Archive a directory with sorted entries, zeroed mtimes, and root ownership
/// so identical trees produce identical snapshots.
fn pack_dir(source: &Path) -> Result<Vec<u8>, PlatformError> {
    let mut entries = Vec::new();
    collect_entries(source, source, &mut entries)?;
    entries.sort();

    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);
    for (rel, full) in &entries {
        let meta = full.symlink_metadata()?;
        let ft = meta.file_type();
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(meta.permissions().mode());
        if ft.is_file() {
            let data = fs::read(full)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_cksum();
            ar.append_data(&mut header, rel, data.as_slice())?;
        } else if ft.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            ar.append_data(&mut header, format!("{rel}/"), std::io::empty())?;
        } else if ft.is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_cksum();
            ar.append_link(&mut header, rel, fs::read_link(full)?)?;
        } else {
            warn!("skipping unsupported file type: {rel}");
        }
    }
    Ok(ar.into_inner()?)
}

fn collect_entries(
    root: &Path,
    current: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), PlatformError> {
    if !current.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(current)? {
        let full = entry?.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| PlatformError::InvalidState(format!("path strip: {e}")))?
            .to_string_lossy()
            .into_owned();
        let is_dir = full.symlink_metadata()?.is_dir();
        out.push((rel, full.clone()));
        if is_dir {
            collect_entries(root, &full, out)?;
        }
    }
    Ok(())
}

fn unpack_dir(data: &[u8], target: &Path) -> Result<(), PlatformError> {
    fs::create_dir_all(target)?;
    let mut ar = tar::Archive::new(data);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.unpack(target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (tempfile::TempDir, LocalPlatform, String) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("etc")).unwrap();
        fs::write(source.join("etc/hostname"), "base\n").unwrap();
        let platform = LocalPlatform::open(dir.path().join("platform")).unwrap();
        let image = platform.import_image("local", "base", &source).unwrap();
        (dir, platform, image)
    }

    #[test]
    fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let platform = LocalPlatform::open(dir.path()).unwrap();
        assert!(platform.device_root().is_dir());
        assert!(dir.path().join("volumes").is_dir());
        assert!(dir.path().join("snapshots").is_dir());
        assert!(dir.path().join("images").is_dir());
        assert_eq!(platform.instance_info().unwrap().region, "local");
    }

    #[test]
    fn instance_override_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let platform = LocalPlatform::open(dir.path()).unwrap();
        fs::write(
            dir.path().join("instance.json"),
            r#"{"id":"i-1","region":"lab","availability_zone":"lab-b"}"#,
        )
        .unwrap();
        assert_eq!(platform.instance_info().unwrap().availability_zone, "lab-b");
    }

    #[test]
    fn imported_image_is_volume_backed() {
        let (_dir, platform, image_id) = seeded();
        let image = platform.describe_image("local", &image_id).unwrap();
        let snap = image.root_device().unwrap().snapshot_id.clone().unwrap();
        assert!(platform.snapshot_archive(&snap).is_file());
        assert!(platform.describe_image("elsewhere", &image_id).is_err());
    }

    #[test]
    fn volume_contents_come_from_snapshot() {
        let (_dir, platform, image_id) = seeded();
        let image = platform.describe_image("local", &image_id).unwrap();
        let snap = image.root_device().unwrap().snapshot_id.clone().unwrap();
        let vol = platform
            .create_volume(&VolumeRequest {
                snapshot_id: snap,
                availability_zone: "local-a".to_owned(),
                size: 2,
            })
            .unwrap();
        assert_eq!(
            fs::read_to_string(platform.volume_dir(&vol).join("etc/hostname")).unwrap(),
            "base\n"
        );
    }

    #[test]
    fn attach_creates_device_link() {
        let (_dir, platform, image_id) = seeded();
        let image = platform.describe_image("local", &image_id).unwrap();
        let vol = platform
            .create_volume(&VolumeRequest {
                snapshot_id: image.snapshot_ids().next().unwrap().to_owned(),
                availability_zone: "local-a".to_owned(),
                size: 1,
            })
            .unwrap();
        let device = platform.device_root().join("xvdf");
        platform.attach_volume(&vol, "local-host", &device).unwrap();
        assert!(device.join("etc/hostname").is_file());
        assert!(platform.delete_volume(&vol).is_err());
        platform.detach_volume(&vol).unwrap();
        assert!(device.symlink_metadata().is_err());
        platform.delete_volume(&vol).unwrap();
        assert!(!platform.volume_dir(&vol).exists());
    }

    #[test]
    fn pack_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/b/c"), "data").unwrap();
        std::os::unix::fs::symlink("b/c", dir.path().join("a/link")).unwrap();
        assert_eq!(pack_dir(dir.path()).unwrap(), pack_dir(dir.path()).unwrap());
    }

    #[test]
    fn missing_records_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let platform = LocalPlatform::open(dir.path()).unwrap();
        assert!(matches!(
            platform.detach_volume("vol-missing"),
            Err(PlatformError::NotFound { kind: "volume", .. })
        ));
        assert!(matches!(
            platform.delete_snapshot("local", "snap-missing"),
            Err(PlatformError::NotFound { kind: "snapshot", .. })
        ));
    }
}
