//! Structured worker events for external observability collectors.

use crate::lifecycle::WorkerState;

/// Events emitted by the lifecycle controller and the interceptor.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange { state: WorkerState },

    /// Install was abandoned; the previous generation stays active.
    InstallFailed { generation: String, reason: String },

    /// A generation became current; all others were purged.
    GenerationPromoted { generation: String },

    /// A prior generation was evicted to reclaim quota.
    GenerationEvicted { generation: String },

    /// A write-back after a successful network fetch failed. The request
    /// itself still succeeded with the network response.
    CacheWriteFailed { key: String, reason: String },

    /// Per-request cache decision.
    Decision(CacheDecision),
}

/// One decision per intercepted request, distinguishable by kind.
#[derive(Debug, Clone)]
pub enum CacheDecision {
    /// Served from the current generation without a network round trip.
    Hit { key: String, generation: String },

    /// Not in the current generation; going to the network.
    Miss { key: String },

    /// Served from the network. `cached` says whether a copy was stored.
    NetworkServed { key: String, cached: bool },

    /// Network failed; served from a stored generation instead.
    Fallback { key: String, generation: String },

    /// Not subject to caching at all.
    Bypass { key: String, reason: BypassReason },
}

/// Why a request bypassed the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    /// Non-HTTP(S) scheme; never intercepted.
    Scheme,
    /// Non-cacheable method; straight to network, never stored.
    Method,
}
