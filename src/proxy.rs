//! Proxy record representation and lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Weight given to a fresh latency sample when smoothing.
const LATENCY_SMOOTHING: f64 = 0.3;

/// Lifecycle status of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    /// Just discovered, not validated yet.
    Candidate,
    /// Passed validation and eligible for dispatch.
    Active,
    /// Failed a re-check or proved unreliable; excluded from dispatch.
    Quarantined,
}

impl ProxyStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Removal is not a status; see [`ProxyStatus::is_removable`].
    pub fn can_transition_to(self, next: ProxyStatus) -> bool {
        matches!(
            (self, next),
            (ProxyStatus::Candidate, ProxyStatus::Active)
                | (ProxyStatus::Active, ProxyStatus::Quarantined)
                | (ProxyStatus::Quarantined, ProxyStatus::Active)
        )
    }

    /// Whether a record in this status may be deleted from the store.
    pub fn is_removable(self) -> bool {
        matches!(self, ProxyStatus::Candidate | ProxyStatus::Quarantined)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Candidate => "candidate",
            ProxyStatus::Active => "active",
            ProxyStatus::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol a proxy was confirmed to relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// Map a URL scheme onto a protocol.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }
}

/// How much client-identifying information a proxy forwards.
///
/// Ordered from least to most private, so `level >= AnonymityLevel::Anonymous`
/// reads naturally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    /// The destination sees the client's real address.
    #[default]
    Transparent,
    /// The real address is hidden but proxy use is visible.
    Anonymous,
    /// Neither the real address nor proxy use is visible.
    Elite,
}

/// One known proxy endpoint and its health state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// `host:port`, the store key.
    pub address: String,
    /// Protocols the proxy was confirmed to relay.
    pub protocols: BTreeSet<Protocol>,
    /// Anonymity level from the last successful probe.
    pub anonymity: AnonymityLevel,
    /// Smoothed round-trip time in milliseconds.
    pub latency_millis: Option<u64>,
    /// Successful probes and dispatch reports.
    pub success_count: u64,
    /// Failed probes and dispatch reports.
    pub fail_count: u64,
    /// When the proxy was last probed.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// When a probe last found the proxy usable.
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    /// Current lifecycle status.
    pub status: ProxyStatus,
    /// When the record entered its current status.
    pub status_since: DateTime<Utc>,
}

impl ProxyRecord {
    /// Create a freshly discovered, unvalidated record.
    pub fn candidate(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocols: BTreeSet::new(),
            anonymity: AnonymityLevel::default(),
            latency_millis: None,
            success_count: 0,
            fail_count: 0,
            last_checked_at: None,
            last_success_at: None,
            status: ProxyStatus::Candidate,
            status_since: Utc::now(),
        }
    }

    /// Total number of recorded outcomes.
    pub fn samples(&self) -> u64 {
        self.success_count + self.fail_count
    }

    /// Share of failed outcomes, `0.0` when nothing was recorded.
    pub fn failure_ratio(&self) -> f64 {
        let total = self.samples();
        if total == 0 {
            return 0.0;
        }
        self.fail_count as f64 / total as f64
    }

    /// Calculate the success rate of this proxy.
    pub fn success_rate(&self) -> f64 {
        let total = self.samples();
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }

    /// Whether the record supports the given protocol.
    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }

    /// Fold a new latency sample into the running average.
    pub fn observe_latency(&mut self, sample_millis: u64) {
        self.latency_millis = Some(match self.latency_millis {
            None => sample_millis,
            Some(prev) => {
                let smoothed = prev as f64 * (1.0 - LATENCY_SMOOTHING)
                    + sample_millis as f64 * LATENCY_SMOOTHING;
                smoothed.round() as u64
            }
        });
    }
}

/// Failure-ratio rule that moves unreliable proxies out of dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    /// Failure ratio above which a proxy is unreliable.
    pub failure_ratio_threshold: f64,
    /// Outcomes required before the ratio is trusted.
    pub min_samples: u64,
}

impl HealthPolicy {
    pub fn is_unreliable(&self, record: &ProxyRecord) -> bool {
        record.samples() >= self.min_samples
            && record.failure_ratio() > self.failure_ratio_threshold
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: 0.5,
            min_samples: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_edges() {
        use ProxyStatus::*;

        assert!(Candidate.can_transition_to(Active));
        assert!(Active.can_transition_to(Quarantined));
        assert!(Quarantined.can_transition_to(Active));

        assert!(!Candidate.can_transition_to(Quarantined));
        assert!(!Active.can_transition_to(Candidate));
        assert!(!Quarantined.can_transition_to(Candidate));
        assert!(!Active.can_transition_to(Active));

        assert!(Candidate.is_removable());
        assert!(Quarantined.is_removable());
        assert!(!Active.is_removable());
    }

    #[test]
    fn test_health_policy_needs_min_samples() {
        let policy = HealthPolicy::default();
        let mut record = ProxyRecord::candidate("1.2.3.4:8080");

        record.fail_count = 4;
        assert!(!policy.is_unreliable(&record));

        record.fail_count = 5;
        assert!(policy.is_unreliable(&record));

        record.success_count = 5;
        assert_eq!(record.failure_ratio(), 0.5);
        assert!(!policy.is_unreliable(&record));
    }

    #[test]
    fn test_latency_smoothing() {
        let mut record = ProxyRecord::candidate("1.2.3.4:8080");
        record.observe_latency(100);
        assert_eq!(record.latency_millis, Some(100));

        record.observe_latency(200);
        assert_eq!(record.latency_millis, Some(130));
    }

    #[test]
    fn test_anonymity_ordering_and_protocols() {
        assert!(AnonymityLevel::Elite > AnonymityLevel::Anonymous);
        assert!(AnonymityLevel::Anonymous > AnonymityLevel::Transparent);

        assert_eq!(Protocol::from_scheme("HTTPS"), Some(Protocol::Https));
        assert_eq!(Protocol::from_scheme("socks5"), None);
        assert_eq!(ProxyStatus::Quarantined.to_string(), "quarantined");
    }
}
