//! Generation identifiers derived from build input.

use offwave_core::AssetManifest;
use offwave_store::GenerationId;
use sha2::{Digest, Sha256};

/// Derive a generation identifier from the manifest's version input and
/// asset list. Deterministic: the same build of the same content always
/// names the same generation, independent of wall clock.
pub fn derive_generation(manifest: &AssetManifest) -> GenerationId {
    let mut hasher = Sha256::new();
    hasher.update(manifest.version.as_bytes());
    for url in manifest.iter() {
        hasher.update([0u8]);
        hasher.update(url.as_str().as_bytes());
    }
    let digest = hasher.finalize();

    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    GenerationId::new(format!("gen-{}", hex))
}

/// Assigns the current cache generation and judges staleness of others.
#[derive(Debug, Clone)]
pub struct VersionManager {
    current: GenerationId,
}

impl VersionManager {
    /// Compute the current generation from the manifest.
    pub fn from_manifest(manifest: &AssetManifest) -> Self {
        Self {
            current: derive_generation(manifest),
        }
    }

    /// The generation this build serves from once activated.
    pub fn current_generation(&self) -> &GenerationId {
        &self.current
    }

    /// True for every identifier except the current one.
    pub fn is_stale(&self, generation: &GenerationId) -> bool {
        *generation != self.current
    }
}
