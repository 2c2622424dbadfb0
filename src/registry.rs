//! Registry/cache collaborator interface.
//!
//! Pulling, local caching and descriptor resolution live outside this crate;
//! the pipeline consumes images through these traits only. A production
//! implementation fronts an OCI registry client with a content-addressed
//! cache; the test suite substitutes an in-memory one.

use anyhow::Result;
use std::collections::BTreeMap;
use std::io::Read;

use crate::reference::ImageRef;

/// Platform an image is pulled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    pub fn linux(architecture: &str) -> Self {
        Platform {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::linux("amd64")
    }
}

/// Baked-in defaults from an image's registry metadata: the bottom layer of
/// the three-layer config override.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageDefaults {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub labels: BTreeMap<String, String>,
}

/// A pulled image, ready to be read.
pub trait ImageSource {
    /// Registry metadata for the image.
    fn config(&self) -> Result<ImageDefaults>;

    /// The image's flattened root filesystem as a tar stream.
    fn rootfs_tar(&self) -> Result<Box<dyn Read>>;

    /// The image as an OCI image-layout tar stream (`oci-layout`, `index.json`,
    /// `blobs/...`), used by OCI-format volumes.
    fn oci_layout_tar(&self) -> Result<Box<dyn Read>>;

    /// SBOM documents attached to the image, if any.
    fn sboms(&self) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

/// The registry/cache client.
pub trait Registry {
    /// Resolve and pull `reference` for `platform`, preferring the local
    /// cache. Failures surface as [`crate::error::BuildError::Pull`].
    fn pull(&self, reference: &ImageRef, platform: &Platform) -> Result<Box<dyn ImageSource>>;
}
