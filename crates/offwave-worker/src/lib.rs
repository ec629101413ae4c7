//! # Offwave Worker
//!
//! Offline asset-caching interception layer: generation versioning,
//! install/activate lifecycle, and per-request fetch interception.
//!
//! ## Architecture
//!
//! ```text
//! OffwaveWorker
//!     ├── LifecycleController (New → Installing → Waiting → Activating → Active)
//!     │       ├── VersionManager (deterministic generation ids)
//!     │       └── CacheStore (staged generation, atomic promote)
//!     │
//!     └── FetchInterceptor
//!             ├── cache-first for installed assets
//!             └── network-first with cache fallback for the rest
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use offwave_core::{AssetManifest, OffwaveResult, RetryConfig, WorkerConfig};
use offwave_net::{AssetFetcher, AssetRequest};
use offwave_store::CacheStore;

pub mod events;
pub mod interceptor;
pub mod lifecycle;
pub mod version;

pub use events::{BypassReason, CacheDecision, WorkerEvent};
pub use interceptor::{FetchInterceptor, Intercepted, InterceptedResponse, ServedFrom};
pub use lifecycle::{CurrentGeneration, LifecycleController, WorkerState};
pub use version::{derive_generation, VersionManager};

/// The assembled caching worker: lifecycle controller plus interceptor
/// over one shared store, client, and event channel.
pub struct OffwaveWorker {
    lifecycle: LifecycleController,
    interceptor: FetchInterceptor,
    manifest: AssetManifest,
}

impl OffwaveWorker {
    /// Create a worker persisting under `config.data_dir`.
    pub fn new(
        config: &WorkerConfig,
        manifest: AssetManifest,
    ) -> OffwaveResult<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = CacheStore::open(config.data_dir.join("cache.db"), config.max_cache_bytes)?;
        Self::with_store(store, config, manifest)
    }

    /// Create a worker over an already opened store.
    pub fn with_store(
        store: CacheStore,
        config: &WorkerConfig,
        manifest: AssetManifest,
    ) -> OffwaveResult<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Mutex::new(store));
        let fetcher = Arc::new(AssetFetcher::new(&config.network)?);
        let versions = VersionManager::from_manifest(&manifest);
        let current = CurrentGeneration::new();

        let lifecycle = LifecycleController::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            versions,
            current.clone(),
            config.policy.clone(),
            RetryConfig::attempts(config.network.install_retry_attempts),
            event_tx.clone(),
        );
        let interceptor =
            FetchInterceptor::new(store, fetcher, current, config.policy.clone(), event_tx);

        Ok((
            Self {
                lifecycle,
                interceptor,
                manifest,
            },
            event_rx,
        ))
    }

    /// Bring the worker to `Active`: resume from the persisted marker if
    /// this build's generation is already current, otherwise run a full
    /// install/activate cycle.
    pub async fn start(&self) -> OffwaveResult<WorkerState> {
        if self.lifecycle.resume().await? == WorkerState::Active {
            return Ok(WorkerState::Active);
        }
        self.lifecycle.install(&self.manifest).await?;
        self.lifecycle.activate().await?;
        Ok(WorkerState::Active)
    }

    /// Handle one intercepted request.
    pub async fn handle(&self, request: AssetRequest) -> OffwaveResult<Intercepted> {
        self.interceptor.handle(request).await
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn interceptor(&self) -> &FetchInterceptor {
        &self.interceptor
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }
}
