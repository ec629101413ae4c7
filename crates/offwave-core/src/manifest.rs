//! Asset manifest supplied by the build step.

use crate::{OffwaveError, OffwaveResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Ordered list of URLs to pre-fetch at install time, plus the version
/// input the generation identifier is derived from. Produced by an
/// external build/config step; read-only to the interceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetManifest {
    /// Build/version input (e.g. a release tag or content hash).
    pub version: String,

    /// URLs to pre-fetch and store, in order.
    pub assets: Vec<Url>,
}

impl AssetManifest {
    /// Create a manifest from a version string and asset URLs.
    pub fn new(version: impl Into<String>, assets: Vec<Url>) -> Self {
        Self {
            version: version.into(),
            assets,
        }
    }

    /// Parse a manifest from JSON.
    pub fn from_json(json: &str) -> OffwaveResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| OffwaveError::config(format!("Invalid manifest: {}", e)))
    }

    /// Load a manifest from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> OffwaveResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Whether the manifest lists no assets.
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Number of assets.
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// Iterate the asset URLs in manifest order.
    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.assets.iter()
    }
}
