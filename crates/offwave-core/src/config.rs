//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Top-level configuration for the caching worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Directory holding the cache database
    pub data_dir: PathBuf,

    /// Maximum total cached bytes, if bounded
    pub max_cache_bytes: Option<u64>,

    /// Network settings
    pub network: NetworkConfig,

    /// Cache serving and write-back policy
    pub policy: CachePolicy,
}

/// Network settings for asset fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bound on any single fetch before falling back to cache
    pub fetch_timeout: Duration,

    /// Maximum attempts for install-time asset fetches
    pub install_retry_attempts: u32,

    /// User agent string
    pub user_agent: String,
}

/// Policy gating what the interceptor is allowed to cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Origin considered "same-origin" for write-back decisions
    pub origin: Option<Url>,

    /// Cache successful same-origin responses seen outside the manifest
    pub cache_same_origin: bool,

    /// Origins whose opaque cross-origin responses may be cached
    pub opaque_allowlist: Vec<Url>,

    /// On quota exhaustion, evict the oldest prior generation and retry once
    pub evict_on_quota: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offwave"),
            max_cache_bytes: Some(64 * 1024 * 1024),
            network: NetworkConfig::default(),
            policy: CachePolicy::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            install_retry_attempts: 3,
            user_agent: format!("Offwave/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            origin: None,
            cache_same_origin: true,
            opaque_allowlist: Vec::new(),
            evict_on_quota: true,
        }
    }
}

impl CachePolicy {
    /// Whether an opaque response from `origin` may be cached.
    pub fn allows_opaque(&self, origin: &Url) -> bool {
        self.opaque_allowlist
            .iter()
            .any(|allowed| allowed.origin() == origin.origin())
    }
}
