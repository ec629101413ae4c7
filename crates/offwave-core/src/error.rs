//! Error types for Offwave

use std::time::Duration;
use thiserror::Error;

/// Result type alias for Offwave operations
pub type OffwaveResult<T> = Result<T, OffwaveError>;

/// Main error type for Offwave
#[derive(Error, Debug)]
pub enum OffwaveError {
    /// A required asset could not be fetched or stored during install.
    /// The previous generation stays active.
    #[error("Install failed: {0}")]
    InstallFailed(String),

    /// A put failed due to storage limits. Never silently swallowed.
    #[error("Storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    /// A network fetch failed or timed out.
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Network failed and the fallback lookup found nothing cached.
    #[error("No cache available: {0}")]
    NoCacheAvailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OffwaveError {
    /// Create an install error
    pub fn install(msg: impl Into<String>) -> Self {
        Self::InstallFailed(msg.into())
    }

    /// Create a quota error
    pub fn quota(msg: impl Into<String>) -> Self {
        Self::StorageQuotaExceeded(msg.into())
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkUnavailable(msg.into())
    }

    /// Create a no-cache error
    pub fn no_cache(msg: impl Into<String>) -> Self {
        Self::NoCacheAvailable(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether a retry or keep-previous-generation response is possible.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OffwaveError::InstallFailed(_)
                | OffwaveError::StorageQuotaExceeded(_)
                | OffwaveError::NetworkUnavailable(_)
                | OffwaveError::Timeout(_)
        )
    }

    /// Get the error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            OffwaveError::InstallFailed(_) => "install_failed",
            OffwaveError::StorageQuotaExceeded(_) => "quota_exceeded",
            OffwaveError::NetworkUnavailable(_) => "network_unavailable",
            OffwaveError::NoCacheAvailable(_) => "no_cache_available",
            OffwaveError::Storage(_) => "storage",
            OffwaveError::Config(_) => "config",
            OffwaveError::InvalidState(_) => "invalid_state",
            OffwaveError::Timeout(_) => "timeout",
            OffwaveError::Cancelled => "cancelled",
            OffwaveError::Url(_) => "url",
            OffwaveError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(OffwaveError::install("x").category(), "install_failed");
        assert_eq!(OffwaveError::network("x").category(), "network_unavailable");
        assert_eq!(
            OffwaveError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(OffwaveError::install("x").is_recoverable());
        assert!(OffwaveError::quota("x").is_recoverable());
        assert!(!OffwaveError::no_cache("x").is_recoverable());
        assert!(!OffwaveError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_display_names_kind() {
        let err = OffwaveError::no_cache("GET https://example.com/a.js");
        assert!(err.to_string().starts_with("No cache available"));
    }
}
