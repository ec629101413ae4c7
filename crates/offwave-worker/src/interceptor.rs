//! Per-request serving policy: cache-first for installed assets,
//! network-first with cache fallback for everything else.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use offwave_core::{CachePolicy, OffwaveError, OffwaveResult};
use offwave_net::{is_interceptable, same_origin, AssetFetcher, AssetRequest, AssetResponse};
use offwave_store::{CacheStore, EntryKey, GenerationId, StoredEntry};

use crate::events::{BypassReason, CacheDecision, WorkerEvent};
use crate::lifecycle::CurrentGeneration;

/// Where a served response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedFrom {
    /// Live network response, returned unmodified.
    Network,
    /// Previously stored immutable entry from the named generation.
    Cache(GenerationId),
}

/// A response produced by interception. Either the original network
/// response or a stored entry; never a synthesized or mutated one.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub served_from: ServedFrom,
}

/// Outcome of handling one intercepted request.
#[derive(Debug)]
pub enum Intercepted {
    /// The worker produced a response.
    Response(InterceptedResponse),
    /// Not intercepted at all; hand the request to default handling.
    PassThrough,
}

/// The per-request state machine deciding cache vs. network vs. fallback.
pub struct FetchInterceptor {
    store: Arc<Mutex<CacheStore>>,
    fetcher: Arc<AssetFetcher>,
    current: CurrentGeneration,
    policy: CachePolicy,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl FetchInterceptor {
    pub fn new(
        store: Arc<Mutex<CacheStore>>,
        fetcher: Arc<AssetFetcher>,
        current: CurrentGeneration,
        policy: CachePolicy,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            store,
            fetcher,
            current,
            policy,
            events,
        }
    }

    /// Handle one intercepted request.
    pub async fn handle(&self, request: AssetRequest) -> OffwaveResult<Intercepted> {
        if !is_interceptable(&request.url) {
            self.decide(CacheDecision::Bypass {
                key: request.url.to_string(),
                reason: BypassReason::Scheme,
            });
            return Ok(Intercepted::PassThrough);
        }

        let key = EntryKey::new(request.method.as_str(), &request.url);

        // Non-cacheable methods go straight to network, never stored.
        if request.method != Method::GET {
            self.decide(CacheDecision::Bypass {
                key: key.to_string(),
                reason: BypassReason::Method,
            });
            let response = self.fetcher.fetch(&request).await?;
            return Ok(Intercepted::Response(from_network(response)));
        }

        let current = self.current.get().await;

        // Cache-first for anything in the current generation.
        if let Some(ref generation) = current {
            if let Some(entry) = self.store.lock().await.get(generation, &key)? {
                self.decide(CacheDecision::Hit {
                    key: key.to_string(),
                    generation: generation.to_string(),
                });
                return Ok(Intercepted::Response(from_entry(generation.clone(), entry)?));
            }
        }
        self.decide(CacheDecision::Miss {
            key: key.to_string(),
        });

        // Network-first with cache fallback.
        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                let cached = self
                    .maybe_cache(current.as_ref(), &key, &request, &response)
                    .await;
                self.decide(CacheDecision::NetworkServed {
                    key: key.to_string(),
                    cached,
                });
                Ok(Intercepted::Response(from_network(response)))
            }
            Err(network_error @ OffwaveError::NetworkUnavailable(_)) => {
                match self.store.lock().await.get_any(&key, current.as_ref())? {
                    Some((generation, entry)) => {
                        self.decide(CacheDecision::Fallback {
                            key: key.to_string(),
                            generation: generation.to_string(),
                        });
                        Ok(Intercepted::Response(from_entry(generation, entry)?))
                    }
                    None => Err(OffwaveError::no_cache(format!(
                        "{} ({})",
                        key, network_error
                    ))),
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Write-back gate: success status and either same-origin with the
    /// configured origin, or an explicitly allowlisted opaque origin.
    /// A failed write never fails the request; it is logged and reported.
    async fn maybe_cache(
        &self,
        current: Option<&GenerationId>,
        key: &EntryKey,
        request: &AssetRequest,
        response: &AssetResponse,
    ) -> bool {
        let Some(generation) = current else {
            return false;
        };
        if !response.ok() {
            return false;
        }

        let allowed = match &self.policy.origin {
            Some(origin) if same_origin(&request.url, origin) => self.policy.cache_same_origin,
            _ => self.policy.allows_opaque(&request.url),
        };
        if !allowed {
            return false;
        }

        let entry = StoredEntry::new(
            response.status.as_u16(),
            response.replayable_headers(),
            response.body.to_vec(),
        );
        match self.store.lock().await.put(generation, key, &entry) {
            Ok(()) => {
                debug!(key = %key, generation = %generation, "Cached network response");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to cache network response");
                let _ = self.events.send(WorkerEvent::CacheWriteFailed {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    fn decide(&self, decision: CacheDecision) {
        debug!(?decision, "Cache decision");
        let _ = self.events.send(WorkerEvent::Decision(decision));
    }
}

fn from_network(response: AssetResponse) -> InterceptedResponse {
    InterceptedResponse {
        status: response.status,
        headers: response.headers,
        body: response.body,
        served_from: ServedFrom::Network,
    }
}

fn from_entry(
    generation: GenerationId,
    entry: StoredEntry,
) -> OffwaveResult<InterceptedResponse> {
    let status = StatusCode::from_u16(entry.status)
        .map_err(|e| OffwaveError::storage(format!("Corrupt stored status: {}", e)))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(n, v);
        }
    }

    Ok(InterceptedResponse {
        status,
        headers,
        body: Bytes::from(entry.body),
        served_from: ServedFrom::Cache(generation),
    })
}
