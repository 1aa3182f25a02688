//! Error types for the live-proxy-pool crate.

use crate::proxy::ProxyStatus;
use thiserror::Error;

/// Error returned when no active proxy is available in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Startup configuration problems. These are the only fatal errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no proxy sources are enabled")]
    NoSources,

    #[error("no probe targets configured")]
    NoProbeTargets,

    #[error("invalid probe target {target}: {reason}")]
    InvalidProbeTarget { target: String, reason: String },

    #[error("invalid source {name}: {reason}")]
    InvalidSource { name: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to load snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Failure signal from a single source plugin.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected payload: {0}")]
    Parse(String),

    #[error("source timed out")]
    TimedOut,
}

/// A rejected status change on a single record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("proxy {0} is not in the store")]
    NotFound(String),

    #[error("proxy {address} changed status concurrently: expected {expected}, found {actual}")]
    StatusChanged {
        address: String,
        expected: ProxyStatus,
        actual: ProxyStatus,
    },

    #[error("illegal transition for {address}: {from} -> {to}")]
    IllegalTransition {
        address: String,
        from: ProxyStatus,
        to: ProxyStatus,
    },

    #[error("update would lower the outcome counters of {address}")]
    CountersDecreased { address: String },

    #[error("proxy {address} cannot be removed while {status}")]
    NotRemovable {
        address: String,
        status: ProxyStatus,
    },
}

/// Why a validated candidate was not admitted to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("pool is at capacity ({capacity}) and nothing is evictable")]
    CapacityExceeded { capacity: usize },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Errors of the optional durability layer.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot format error: {0}")]
    Json(#[from] serde_json::Error),
}
