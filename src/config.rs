//! Configuration for the proxy pool.

use crate::error::ConfigError;
use crate::proxy::{AnonymityLevel, HealthPolicy};
use crate::source::SourceSpec;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Strategy for selecting a proxy from the active set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Select a random active proxy.
    #[default]
    Random,
    /// Select the active proxy with the lowest latency.
    BestLatency,
    /// Select active proxies in round-robin fashion.
    RoundRobin,
    /// Select the active proxy with the highest success rate.
    MostReliable,
}

impl DispatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::BestLatency => "best_latency",
            Self::RoundRobin => "round_robin",
            Self::MostReliable => "most_reliable",
        }
    }
}

impl FromStr for DispatchPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "best_latency" | "best-latency" | "fastest" => Ok(Self::BestLatency),
            "round_robin" | "roundrobin" | "round-robin" => Ok(Self::RoundRobin),
            "most_reliable" | "most-reliable" | "reliable" => Ok(Self::MostReliable),
            other => Err(ConfigError::InvalidValue {
                field: "dispatch_policy",
                reason: format!("unknown policy {}", other),
            }),
        }
    }
}

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Enabled proxy sources.
    pub sources: Vec<SourceSpec>,
    /// Echo URLs probed through each proxy.
    pub probe_targets: Vec<String>,
    /// Hard timeout for a single probe.
    pub probe_timeout: Duration,
    /// Probes allowed in flight across all cycles.
    pub max_concurrent_probes: usize,
    /// Timeout for a single source fetch.
    pub source_timeout: Duration,
    /// Source fetches started per second.
    pub source_requests_per_second: u32,
    /// Interval between fetch cycles.
    pub fetch_interval: Duration,
    /// New candidates validated per fetch cycle.
    pub max_candidates_per_cycle: usize,
    /// Interval between verify cycles.
    pub verify_interval: Duration,
    /// Records re-probed per verify cycle.
    pub verify_batch_size: usize,
    /// Failure ratio above which an active proxy is quarantined.
    pub failure_ratio_threshold: f64,
    /// Outcomes needed before the failure ratio applies.
    pub min_samples: u64,
    /// How long a proxy may stay quarantined before removal.
    pub quarantine_retention: Duration,
    /// Maximum number of active and quarantined proxies.
    pub capacity: usize,
    /// Policy used by `acquire` when none is given.
    pub dispatch_policy: DispatchPolicy,
    /// Lowest anonymity level accepted by validation.
    pub min_anonymity: AnonymityLevel,
    /// Scheme used to talk to proxies (`http`, `socks5`, ...).
    pub proxy_scheme: String,
    /// JSON snapshot location; the pool is memory-only without it.
    pub snapshot_path: Option<PathBuf>,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }

    /// Failure-ratio rule derived from this configuration.
    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_ratio_threshold: self.failure_ratio_threshold,
            min_samples: self.min_samples,
        }
    }

    /// Parsed probe targets. Call after [`ProxyPoolConfig::validate`].
    pub fn probe_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.probe_targets
            .iter()
            .map(|target| {
                let url = Url::parse(target).map_err(|e| ConfigError::InvalidProbeTarget {
                    target: target.clone(),
                    reason: e.to_string(),
                })?;
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(ConfigError::InvalidProbeTarget {
                        target: target.clone(),
                        reason: "expected an http(s) URL with a host".to_string(),
                    });
                }
                Ok(url)
            })
            .collect()
    }

    /// Check everything that must hold before the pool starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.probe_targets.is_empty() {
            return Err(ConfigError::NoProbeTargets);
        }
        self.probe_urls()?;
        self.validate_limits()?;

        for source in &self.sources {
            source.build()?;
        }
        Ok(())
    }

    /// Check the intervals, limits, ratio and scheme.
    ///
    /// Sources and probe targets are left out so pools built from explicit
    /// components can be checked too.
    pub fn validate_limits(&self) -> Result<(), ConfigError> {
        let positive = [
            ("probe_timeout", self.probe_timeout.is_zero()),
            ("source_timeout", self.source_timeout.is_zero()),
            ("fetch_interval", self.fetch_interval.is_zero()),
            ("verify_interval", self.verify_interval.is_zero()),
            ("quarantine_retention", self.quarantine_retention.is_zero()),
            ("max_concurrent_probes", self.max_concurrent_probes == 0),
            ("max_candidates_per_cycle", self.max_candidates_per_cycle == 0),
            ("verify_batch_size", self.verify_batch_size == 0),
            ("capacity", self.capacity == 0),
            ("source_requests_per_second", self.source_requests_per_second == 0),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::InvalidValue {
                field: *field,
                reason: "must be greater than zero".to_string(),
            });
        }

        if !(self.failure_ratio_threshold > 0.0 && self.failure_ratio_threshold <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "failure_ratio_threshold",
                reason: format!("{} is outside (0, 1]", self.failure_ratio_threshold),
            });
        }

        if !matches!(
            self.proxy_scheme.as_str(),
            "http" | "https" | "socks5" | "socks5h"
        ) {
            return Err(ConfigError::InvalidValue {
                field: "proxy_scheme",
                reason: format!("unsupported scheme {}", self.proxy_scheme),
            });
        }
        Ok(())
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    sources: Vec<SourceSpec>,
    probe_targets: Option<Vec<String>>,
    probe_timeout: Option<Duration>,
    max_concurrent_probes: Option<usize>,
    source_timeout: Option<Duration>,
    source_requests_per_second: Option<u32>,
    fetch_interval: Option<Duration>,
    max_candidates_per_cycle: Option<usize>,
    verify_interval: Option<Duration>,
    verify_batch_size: Option<usize>,
    failure_ratio_threshold: Option<f64>,
    min_samples: Option<u64>,
    quarantine_retention: Option<Duration>,
    capacity: Option<usize>,
    dispatch_policy: Option<DispatchPolicy>,
    min_anonymity: Option<AnonymityLevel>,
    proxy_scheme: Option<String>,
    snapshot_path: Option<PathBuf>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            probe_targets: None,
            probe_timeout: None,
            max_concurrent_probes: None,
            source_timeout: None,
            source_requests_per_second: None,
            fetch_interval: None,
            max_candidates_per_cycle: None,
            verify_interval: None,
            verify_batch_size: None,
            failure_ratio_threshold: None,
            min_samples: None,
            quarantine_retention: None,
            capacity: None,
            dispatch_policy: None,
            min_anonymity: None,
            proxy_scheme: None,
            snapshot_path: None,
        }
    }

    /// Set the enabled sources, replacing any added before.
    pub fn sources(mut self, sources: Vec<SourceSpec>) -> Self {
        self.sources = sources;
        self
    }

    /// Enable one more source.
    pub fn source(mut self, source: SourceSpec) -> Self {
        self.sources.push(source);
        self
    }

    /// Enable plain-text list sources from URLs or file paths.
    pub fn source_urls(mut self, urls: Vec<impl Into<String>>) -> Self {
        self.sources.extend(urls.into_iter().map(|url| {
            let url = url.into();
            SourceSpec::plain(url.clone(), url)
        }));
        self
    }

    /// Set the echo URLs probed through each proxy.
    pub fn probe_targets(mut self, targets: Vec<impl Into<String>>) -> Self {
        self.probe_targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Set the hard timeout for a single probe.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Set how many probes may run at once.
    pub fn max_concurrent_probes(mut self, count: usize) -> Self {
        self.max_concurrent_probes = Some(count);
        self
    }

    /// Set the timeout for a single source fetch.
    pub fn source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = Some(timeout);
        self
    }

    /// Set how many source fetches may start per second.
    pub fn source_requests_per_second(mut self, rps: u32) -> Self {
        self.source_requests_per_second = Some(rps);
        self
    }

    /// Set the interval between fetch cycles.
    pub fn fetch_interval(mut self, interval: Duration) -> Self {
        self.fetch_interval = Some(interval);
        self
    }

    /// Set how many new candidates one fetch cycle validates.
    pub fn max_candidates_per_cycle(mut self, count: usize) -> Self {
        self.max_candidates_per_cycle = Some(count);
        self
    }

    /// Set the interval between verify cycles.
    pub fn verify_interval(mut self, interval: Duration) -> Self {
        self.verify_interval = Some(interval);
        self
    }

    /// Set how many records one verify cycle re-probes.
    pub fn verify_batch_size(mut self, count: usize) -> Self {
        self.verify_batch_size = Some(count);
        self
    }

    /// Set the failure ratio that quarantines an active proxy.
    pub fn failure_ratio_threshold(mut self, ratio: f64) -> Self {
        self.failure_ratio_threshold = Some(ratio);
        self
    }

    /// Set the number of outcomes needed before the ratio applies.
    pub fn min_samples(mut self, count: u64) -> Self {
        self.min_samples = Some(count);
        self
    }

    /// Set how long a proxy may stay quarantined.
    pub fn quarantine_retention(mut self, retention: Duration) -> Self {
        self.quarantine_retention = Some(retention);
        self
    }

    /// Set the maximum number of admitted proxies.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the default dispatch policy.
    pub fn dispatch_policy(mut self, policy: DispatchPolicy) -> Self {
        self.dispatch_policy = Some(policy);
        self
    }

    /// Set the lowest anonymity level validation accepts.
    pub fn min_anonymity(mut self, level: AnonymityLevel) -> Self {
        self.min_anonymity = Some(level);
        self
    }

    /// Set the scheme used to talk to proxies.
    pub fn proxy_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.proxy_scheme = Some(scheme.into());
        self
    }

    /// Persist the pool to a JSON snapshot at this path.
    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        let health = HealthPolicy::default();
        ProxyPoolConfig {
            sources: self.sources,
            probe_targets: self.probe_targets.unwrap_or_else(|| {
                vec![
                    "http://httpbin.org/get".to_string(),
                    "https://httpbin.org/get".to_string(),
                ]
            }),
            probe_timeout: self.probe_timeout.unwrap_or(Duration::from_secs(10)),
            max_concurrent_probes: self.max_concurrent_probes.unwrap_or(10),
            source_timeout: self.source_timeout.unwrap_or(Duration::from_secs(15)),
            source_requests_per_second: self.source_requests_per_second.unwrap_or(2),
            fetch_interval: self.fetch_interval.unwrap_or(Duration::from_secs(240)),
            max_candidates_per_cycle: self.max_candidates_per_cycle.unwrap_or(500),
            verify_interval: self.verify_interval.unwrap_or(Duration::from_secs(120)),
            verify_batch_size: self.verify_batch_size.unwrap_or(100),
            failure_ratio_threshold: self.failure_ratio_threshold.unwrap_or(health.failure_ratio_threshold),
            min_samples: self.min_samples.unwrap_or(health.min_samples),
            quarantine_retention: self.quarantine_retention.unwrap_or(Duration::from_secs(30 * 60)),
            capacity: self.capacity.unwrap_or(1000),
            dispatch_policy: self.dispatch_policy.unwrap_or_default(),
            min_anonymity: self.min_anonymity.unwrap_or_default(),
            proxy_scheme: self.proxy_scheme.unwrap_or_else(|| "http".to_string()),
            snapshot_path: self.snapshot_path,
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
