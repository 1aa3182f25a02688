//! # live-proxy-pool
//!
//! A self-refreshing pool of validated third-party proxies.
//!
//! The pool pulls candidate endpoints from pluggable sources, probes each one
//! through a bounded worker pool, and admits the ones that work. A second
//! recurring cycle re-checks known proxies, quarantining those that fail and
//! restoring those that recover. Callers take active proxies with
//! [`ProxyPool::acquire`] and feed usage back with [`ProxyPool::report`].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetcher;
pub mod pool;
pub mod proxy;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod validator;
pub mod verifier;
mod utils;

#[cfg(test)]
mod test_support;

pub use config::{DispatchPolicy, ProxyPoolConfig, ProxyPoolConfigBuilder};
pub use dispatch::{ActiveProxy, Outcome, Requirements};
pub use error::{AdmissionError, ConfigError, NoProxyAvailable, SnapshotError, SourceError, TransitionError};
pub use fetcher::FetchReport;
pub use pool::ProxyPool;
pub use proxy::{AnonymityLevel, HealthPolicy, Protocol, ProxyRecord, ProxyStatus};
pub use source::{builtin_sources, SourcePlugin, SourceSpec, StaticSource};
pub use store::{PoolStats, PoolStore};
pub use utils::normalize_endpoint;
pub use validator::{ProbeFailure, ProbeSuccess, Prober, Verdict};
pub use verifier::VerifyReport;
