//! # Offwave Net
//!
//! HTTP asset fetching for the Offwave caching worker: a thin loader over
//! a shared reqwest client with bounded per-request timeouts, plus the
//! origin helpers the caching policy needs.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, trace};
use url::Url;

use offwave_core::{NetworkConfig, OffwaveError, OffwaveResult};

/// Response headers worth replaying from cache. Everything else
/// (set-cookie, connection management) must not be replayed.
const REPLAYABLE_HEADERS: &[&str] = &[
    "content-type",
    "content-language",
    "cache-control",
    "etag",
    "last-modified",
];

/// An outgoing asset request.
#[derive(Debug, Clone)]
pub struct AssetRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
}

impl AssetRequest {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
        }
    }

    /// Create a request with an explicit method.
    pub fn with_method(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
        }
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct AssetResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl AssetResponse {
    /// Check if the response was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// The subset of headers safe to persist and replay from cache.
    pub fn replayable_headers(&self) -> Vec<(String, String)> {
        REPLAYABLE_HEADERS
            .iter()
            .filter_map(|name| {
                self.headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect()
    }
}

/// Whether the worker intercepts requests for this URL at all.
/// Non-HTTP(S) schemes pass straight to default handling.
pub fn is_interceptable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Origin comparison (scheme + host + port).
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// Asset fetcher over a shared HTTP client.
pub struct AssetFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl AssetFetcher {
    /// Create a fetcher from network configuration.
    pub fn new(config: &NetworkConfig) -> OffwaveResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| OffwaveError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout: config.fetch_timeout,
        })
    }

    /// The configured per-request bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch a URL, buffering the whole body. Connection failures and
    /// timeouts both surface as `NetworkUnavailable`; HTTP error statuses
    /// come back as responses, for the caller's policy to judge.
    pub async fn fetch(&self, request: &AssetRequest) -> OffwaveResult<AssetResponse> {
        debug!(url = %request.url, method = %request.method, "Fetching asset");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .timeout(self.timeout);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| net_err(&request.url, e))?;

        let url = response.url().clone();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| net_err(&request.url, e))?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(AssetResponse {
            url,
            status,
            headers,
            body,
        })
    }
}

fn net_err(url: &Url, e: reqwest::Error) -> OffwaveError {
    if e.is_timeout() {
        OffwaveError::network(format!("Fetch of {} timed out", url))
    } else {
        OffwaveError::network(format!("Fetch of {} failed: {}", url, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(timeout: Duration) -> AssetFetcher {
        let config = NetworkConfig {
            fetch_timeout: timeout,
            ..Default::default()
        };
        AssetFetcher::new(&config).unwrap()
    }

    #[test]
    fn test_is_interceptable() {
        assert!(is_interceptable(&Url::parse("https://example.com/a").unwrap()));
        assert!(is_interceptable(&Url::parse("http://example.com/a").unwrap()));
        assert!(!is_interceptable(&Url::parse("ftp://example.com/a").unwrap()));
        assert!(!is_interceptable(&Url::parse("data:text/plain,hi").unwrap()));
    }

    #[test]
    fn test_same_origin() {
        let a = Url::parse("https://example.com/a.js").unwrap();
        let b = Url::parse("https://example.com:443/other/path").unwrap();
        let c = Url::parse("https://cdn.example.com/a.js").unwrap();
        assert!(same_origin(&a, &b));
        assert!(!same_origin(&a, &c));
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"console.log('hi')".to_vec())
                    .insert_header("content-type", "text/javascript"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/app.js", server.uri())).unwrap();
        let response = fetcher(Duration::from_secs(5))
            .fetch(&AssetRequest::get(url))
            .await
            .unwrap();

        assert!(response.ok());
        assert_eq!(&response.body[..], b"console.log('hi')");
        assert_eq!(
            response.replayable_headers(),
            vec![("content-type".to_string(), "text/javascript".to_string())]
        );
    }

    #[tokio::test]
    async fn test_fetch_error_status_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let response = fetcher(Duration::from_secs(5))
            .fetch(&AssetRequest::get(url))
            .await
            .unwrap();

        assert!(!response.ok());
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_network_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let err = fetcher(Duration::from_millis(50))
            .fetch(&AssetRequest::get(url))
            .await
            .unwrap_err();

        assert!(matches!(err, OffwaveError::NetworkUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fetch_unreachable_is_network_unavailable() {
        // A pooled server (MockServer::start) keeps listening after drop; a
        // bare server actually releases the port, which this test relies on.
        let server = MockServer::builder().start().await;
        let url = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        drop(server);

        let err = fetcher(Duration::from_secs(1))
            .fetch(&AssetRequest::get(url))
            .await
            .unwrap_err();

        assert!(matches!(err, OffwaveError::NetworkUnavailable(_)));
    }
}
