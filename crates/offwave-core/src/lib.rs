//! # Offwave Core
//!
//! Shared types, errors, configuration, and logging for the Offwave
//! offline asset-caching layer.

pub mod config;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod retry;

pub use config::{CachePolicy, NetworkConfig, WorkerConfig};
pub use error::{OffwaveError, OffwaveResult};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use manifest::AssetManifest;
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};
