use crate::keys;
use crate::CoreError;
use kiln_multistep::StateBag;
use kiln_platform::Platform;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

/// Images produced by a successful build, keyed by region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub images: BTreeMap<String, String>,
    pub builder_id: String,
}

impl Artifact {
    pub fn builder_id(&self) -> &str {
        &self.builder_id
    }

    /// `region:image` pairs joined with commas, sorted by region.
    pub fn id(&self) -> String {
        self.images
            .iter()
            .map(|(region, image)| format!("{region}:{image}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Images live on the platform; there are no local files.
    pub fn files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Deregister every image. All images are attempted; failures are
    /// collected into one error.
    pub fn destroy(&self, platform: &dyn Platform) -> Result<(), CoreError> {
        let mut failures = Vec::new();
        for (region, image) in &self.images {
            info!("deregistering {image} in {region}");
            if let Err(e) = platform.deregister_image(region, image) {
                warn!("failed to deregister {image} in {region}: {e}");
                failures.push(format!("{region}:{image}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Destroy(failures))
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Images were created:\n")?;
        for (region, image) in &self.images {
            write!(f, "\n{region}: {image}")?;
        }
        Ok(())
    }
}

/// Turn the terminal state bag of a run into the build result.
///
/// A recorded step error wins over everything else. A cancelled run, or one
/// that never registered an image, produces no artifact.
pub fn artifact_from_state(
    state: &mut StateBag,
    builder_id: &str,
) -> Result<Option<Artifact>, CoreError> {
    if let Some(err) = state.take_error() {
        return Err(CoreError::Step(err));
    }
    if state.cancelled() {
        return Ok(None);
    }
    Ok(state.take_key(&keys::IMAGES).map(|images| Artifact {
        images,
        builder_id: builder_id.to_owned(),
    }))
}
