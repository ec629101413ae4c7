//! Install/activate lifecycle for the caching worker.
//!
//! States move `New → Installing → Waiting → Activating → Active`. A new
//! generation is staged during install and only becomes visible to the
//! interceptor when activation promotes it; a failed install rolls the
//! staged generation back and leaves the previous one serving.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use offwave_core::{
    retry_with_backoff, AssetManifest, CachePolicy, OffwaveError, OffwaveResult, RetryConfig,
};
use offwave_net::{AssetFetcher, AssetRequest};
use offwave_store::{CacheStore, EntryKey, GenerationId, StoredEntry};

use crate::events::WorkerEvent;
use crate::version::VersionManager;

/// Lifecycle state of the caching worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No generation installed for this build yet.
    New,
    /// Pre-populating the staged generation.
    Installing,
    /// Staged generation complete, not yet serving.
    Waiting,
    /// Promoting the staged generation and purging the rest.
    Activating,
    /// Serving from the current generation.
    Active,
}

impl WorkerState {
    pub fn is_active(&self) -> bool {
        *self == WorkerState::Active
    }
}

/// Process-wide "current generation" handle, shared between the lifecycle
/// controller and the interceptor. Initialized from the persisted marker
/// (`resume`) and mutated only during activation.
#[derive(Debug, Clone, Default)]
pub struct CurrentGeneration(Arc<RwLock<Option<GenerationId>>>);

impl CurrentGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// The generation the interceptor serves from, if any.
    pub async fn get(&self) -> Option<GenerationId> {
        self.0.read().await.clone()
    }

    pub(crate) async fn set(&self, generation: Option<GenerationId>) {
        *self.0.write().await = generation;
    }
}

/// Orchestrates install-time pre-population and activation-time cleanup.
pub struct LifecycleController {
    store: Arc<Mutex<CacheStore>>,
    fetcher: Arc<AssetFetcher>,
    versions: VersionManager,
    current: CurrentGeneration,
    policy: CachePolicy,
    retry: RetryConfig,
    state: Arc<RwLock<WorkerState>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl LifecycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Mutex<CacheStore>>,
        fetcher: Arc<AssetFetcher>,
        versions: VersionManager,
        current: CurrentGeneration,
        policy: CachePolicy,
        retry: RetryConfig,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            store,
            fetcher,
            versions,
            current,
            policy,
            retry,
            state: Arc::new(RwLock::new(WorkerState::New)),
            events,
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// The generation this build installs and serves.
    pub fn target_generation(&self) -> &GenerationId {
        self.versions.current_generation()
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
        debug!(?state, "Lifecycle state changed");
        let _ = self.events.send(WorkerEvent::StateChange { state });
    }

    /// Re-enter the lifecycle after a worker restart by reading the
    /// persisted marker. Returns `Active` if this build's generation is
    /// already current, otherwise `New` (an install cycle is required; any
    /// previously promoted generation keeps serving meanwhile).
    pub async fn resume(&self) -> OffwaveResult<WorkerState> {
        let marker = self.store.lock().await.current_generation()?;
        self.current.set(marker.clone()).await;

        if marker.as_ref() == Some(self.versions.current_generation()) {
            info!(generation = %self.versions.current_generation(), "Resuming active generation");
            self.set_state(WorkerState::Active).await;
            Ok(WorkerState::Active)
        } else {
            debug!(?marker, target = %self.versions.current_generation(), "Install cycle required");
            Ok(WorkerState::New)
        }
    }

    /// Pre-populate the staged generation from the manifest. If any
    /// required asset fails, the staged generation is rolled back, the
    /// previous generation stays active and untouched, and `InstallFailed`
    /// is returned — a partial generation is never promoted.
    pub async fn install(&self, manifest: &AssetManifest) -> OffwaveResult<()> {
        let state = self.state().await;
        if !matches!(state, WorkerState::New | WorkerState::Active) {
            return Err(OffwaveError::InvalidState(format!(
                "cannot install from {:?}",
                state
            )));
        }

        let generation = self.versions.current_generation().clone();
        let marker = self.store.lock().await.current_generation()?;

        if marker.as_ref() == Some(&generation) {
            // Identical content already promoted; nothing to stage.
            self.set_state(WorkerState::Waiting).await;
            return Ok(());
        }

        self.set_state(WorkerState::Installing).await;
        info!(generation = %generation, assets = manifest.len(), "Installing generation");
        self.store.lock().await.ensure_generation(&generation)?;

        for url in manifest.iter() {
            if let Err(e) = self.install_asset(&generation, url).await {
                self.rollback(&generation, marker.as_ref()).await;
                let reason = format!("{}: {}", url, e);
                let _ = self.events.send(WorkerEvent::InstallFailed {
                    generation: generation.to_string(),
                    reason: reason.clone(),
                });
                self.set_state(if marker.is_some() {
                    WorkerState::Active
                } else {
                    WorkerState::New
                })
                .await;
                return Err(OffwaveError::install(reason));
            }
        }

        self.set_state(WorkerState::Waiting).await;
        Ok(())
    }

    async fn install_asset(&self, generation: &GenerationId, url: &Url) -> OffwaveResult<()> {
        let request = AssetRequest::get(url.clone());
        let response = retry_with_backoff(&self.retry, || self.fetcher.fetch(&request)).await?;

        if !response.ok() {
            return Err(OffwaveError::network(format!(
                "responded with status {}",
                response.status
            )));
        }

        let key = EntryKey::new(request.method.as_str(), url);
        let entry = StoredEntry::new(
            response.status.as_u16(),
            response.replayable_headers(),
            response.body.to_vec(),
        );
        self.put_with_quota_retry(generation, &key, &entry).await
    }

    /// Store an entry; on quota exhaustion, optionally evict the oldest
    /// generation that is neither staged nor serving, then retry once.
    async fn put_with_quota_retry(
        &self,
        generation: &GenerationId,
        key: &EntryKey,
        entry: &StoredEntry,
    ) -> OffwaveResult<()> {
        let mut store = self.store.lock().await;
        match store.put(generation, key, entry) {
            Err(OffwaveError::StorageQuotaExceeded(reason)) if self.policy.evict_on_quota => {
                warn!(key = %key, %reason, "Quota exceeded, evicting a prior generation");
                let marker = store.current_generation()?;
                let victim = store
                    .list_generations()?
                    .into_iter()
                    .find(|g| g != generation && marker.as_ref() != Some(g));

                match victim {
                    Some(victim) => {
                        store.delete_generation(&victim)?;
                        let _ = self.events.send(WorkerEvent::GenerationEvicted {
                            generation: victim.to_string(),
                        });
                        store.put(generation, key, entry)
                    }
                    None => Err(OffwaveError::quota(reason)),
                }
            }
            other => other,
        }
    }

    async fn rollback(&self, generation: &GenerationId, marker: Option<&GenerationId>) {
        // Never touch the serving generation.
        if marker == Some(generation) {
            return;
        }
        if let Err(e) = self.store.lock().await.delete_generation(generation) {
            warn!(generation = %generation, error = %e, "Failed to roll back staged generation");
        }
    }

    /// Promote the staged generation and purge every other one, as a
    /// single atomic unit relative to concurrent lookups. Immediate claim:
    /// prior generations stay readable until the promotion commits.
    pub async fn activate(&self) -> OffwaveResult<()> {
        let state = self.state().await;
        if state != WorkerState::Waiting {
            return Err(OffwaveError::InvalidState(format!(
                "cannot activate from {:?}",
                state
            )));
        }

        self.set_state(WorkerState::Activating).await;
        let generation = self.versions.current_generation().clone();

        {
            let mut store = self.store.lock().await;
            let generations = store.list_generations()?;
            for stale in generations.iter().filter(|g| self.versions.is_stale(g)) {
                debug!(generation = %stale, "Purging stale generation");
            }
            store.promote(&generation)?;
        }

        self.current.set(Some(generation.clone())).await;
        let _ = self.events.send(WorkerEvent::GenerationPromoted {
            generation: generation.to_string(),
        });
        self.set_state(WorkerState::Active).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn controller(
        store: CacheStore,
        manifest: &AssetManifest,
    ) -> (LifecycleController, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fetcher = AssetFetcher::new(&Default::default()).unwrap();
        let controller = LifecycleController::new(
            Arc::new(Mutex::new(store)),
            Arc::new(fetcher),
            VersionManager::from_manifest(manifest),
            CurrentGeneration::new(),
            CachePolicy::default(),
            RetryConfig::none(),
            tx,
        );
        (controller, rx)
    }

    fn manifest(version: &str, server_uri: &str, paths: &[&str]) -> AssetManifest {
        AssetManifest::new(
            version,
            paths
                .iter()
                .map(|p| Url::parse(&format!("{}{}", server_uri, p)).unwrap())
                .collect(),
        )
    }

    async fn serve_ok(server: &MockServer, at: &str, body: &[u8]) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_install_populates_staged_generation() {
        let server = MockServer::start().await;
        serve_ok(&server, "/app.js", b"js").await;
        serve_ok(&server, "/app.css", b"css").await;

        let m = manifest("1.0", &server.uri(), &["/app.js", "/app.css"]);
        let (controller, _rx) = controller(CacheStore::open_in_memory(None).unwrap(), &m);

        controller.install(&m).await.unwrap();
        assert_eq!(controller.state().await, WorkerState::Waiting);

        let generation = controller.target_generation().clone();
        let store = controller.store.lock().await;
        assert_eq!(store.count(&generation).unwrap(), 2);
        // Not promoted yet
        assert_eq!(store.current_generation().unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back_and_keeps_prior_current() {
        let server = MockServer::start().await;
        serve_ok(&server, "/app.js", b"js").await;
        Mock::given(method("GET"))
            .and(path("/app.css"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        // A prior generation is already promoted.
        let mut store = CacheStore::open_in_memory(None).unwrap();
        let prior = GenerationId::new("gen-prior");
        store.ensure_generation(&prior).unwrap();
        store.promote(&prior).unwrap();

        let m = manifest("2.0", &server.uri(), &["/app.js", "/app.css"]);
        let (controller, _rx) = controller(store, &m);
        controller.resume().await.unwrap();

        let err = controller.install(&m).await.unwrap_err();
        assert!(matches!(err, OffwaveError::InstallFailed(_)));
        assert_eq!(controller.state().await, WorkerState::Active);

        let store = controller.store.lock().await;
        assert_eq!(store.current_generation().unwrap(), Some(prior.clone()));
        assert_eq!(store.list_generations().unwrap(), vec![prior]);
    }

    #[tokio::test]
    async fn test_activation_leaves_exactly_one_generation() {
        let server = MockServer::start().await;
        serve_ok(&server, "/app.js", b"js").await;

        let mut store = CacheStore::open_in_memory(None).unwrap();
        let prior = GenerationId::new("gen-prior");
        store.ensure_generation(&prior).unwrap();
        store.promote(&prior).unwrap();

        let m = manifest("2.0", &server.uri(), &["/app.js"]);
        let (controller, _rx) = controller(store, &m);
        controller.resume().await.unwrap();

        controller.install(&m).await.unwrap();
        controller.activate().await.unwrap();
        assert_eq!(controller.state().await, WorkerState::Active);

        let generation = controller.target_generation().clone();
        let store = controller.store.lock().await;
        assert_eq!(store.list_generations().unwrap(), vec![generation.clone()]);
        assert_eq!(store.current_generation().unwrap(), Some(generation));
    }

    #[tokio::test]
    async fn test_activate_requires_waiting() {
        let m = AssetManifest::new("1.0", vec![]);
        let (controller, _rx) = controller(CacheStore::open_in_memory(None).unwrap(), &m);

        let err = controller.activate().await.unwrap_err();
        assert!(matches!(err, OffwaveError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_resume_reads_persisted_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let m = AssetManifest::new("1.0", vec![]);

        {
            let (controller, _rx) = controller(CacheStore::open(&path, None).unwrap(), &m);
            controller.install(&m).await.unwrap();
            controller.activate().await.unwrap();
        }

        // Same build restarts: straight to Active, no reinstall.
        let (controller, _rx) = controller(CacheStore::open(&path, None).unwrap(), &m);
        assert_eq!(controller.resume().await.unwrap(), WorkerState::Active);

        // A different build must go through an install cycle.
        let m2 = AssetManifest::new("2.0", vec![]);
        let (controller, _rx) = self::controller(CacheStore::open(&path, None).unwrap(), &m2);
        assert_eq!(controller.resume().await.unwrap(), WorkerState::New);
    }

    #[tokio::test]
    async fn test_state_changes_are_emitted() {
        let m = AssetManifest::new("1.0", vec![]);
        let (controller, mut rx) = controller(CacheStore::open_in_memory(None).unwrap(), &m);

        controller.install(&m).await.unwrap();
        controller.activate().await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::StateChange { state } = event {
                states.push(state);
            }
        }
        assert!(states.contains(&WorkerState::Waiting));
        assert!(states.contains(&WorkerState::Activating));
        assert!(states.contains(&WorkerState::Active));
    }

    #[tokio::test]
    async fn test_quota_evicts_prior_generation_and_retries() {
        let server = MockServer::start().await;
        serve_ok(&server, "/big.js", b"0123456789").await;

        // Budget fits one body plus the old generation's small entry,
        // but not both big payloads.
        let mut store = CacheStore::open_in_memory(Some(12)).unwrap();
        let old = GenerationId::new("gen-old");
        store
            .put(
                &old,
                &EntryKey::new("GET", &Url::parse("https://example.com/old").unwrap()),
                &StoredEntry::new(200, vec![], b"0123456789".to_vec()),
            )
            .unwrap();

        let m = manifest("2.0", &server.uri(), &["/big.js"]);
        let (controller, mut rx) = controller(store, &m);

        controller.install(&m).await.unwrap();

        let evicted = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| matches!(e, WorkerEvent::GenerationEvicted { .. }));
        assert!(evicted);

        let store = controller.store.lock().await;
        assert_eq!(
            store.count(controller.versions.current_generation()).unwrap(),
            1
        );
    }
}
