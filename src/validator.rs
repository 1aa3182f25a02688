//! Live usability probes.
//!
//! A [`Prober`] performs one probe through one proxy. The [`Validator`] wraps
//! a prober with the hard per-probe timeout, the anonymity floor and the
//! bounded worker pool shared by every cycle.

use crate::proxy::{AnonymityLevel, Protocol, ProxyRecord};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use reqwest::header::USER_AGENT;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use url::Url;

/// Headers that reveal the client address or the presence of a proxy.
const PROXY_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded",
    "forwarded-for",
    "forwarded",
    "via",
    "x-client-ip",
    "client-ip",
    "true-client-ip",
    "cf-connecting-ip",
];

const PROBE_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Measured attributes of a usable proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSuccess {
    pub protocols: BTreeSet<Protocol>,
    pub anonymity: AnonymityLevel,
    pub latency_millis: u64,
}

/// Why a probe judged a proxy unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Unreachable,
    Timeout,
    ProtocolMismatch,
    AnonymityLeak,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeFailure::Unreachable => "unreachable",
            ProbeFailure::Timeout => "timeout",
            ProbeFailure::ProtocolMismatch => "protocol mismatch",
            ProbeFailure::AnonymityLeak => "anonymity leak",
        })
    }
}

/// Outcome of one probe. Failures are ordinary values, never errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Usable(ProbeSuccess),
    Unusable(ProbeFailure),
}

impl Verdict {
    pub fn is_usable(&self) -> bool {
        matches!(self, Verdict::Usable(_))
    }

    /// Fold this probe outcome into a record's health metadata.
    pub fn apply_to(&self, record: &mut ProxyRecord) {
        match self {
            Verdict::Usable(success) => {
                record.protocols = success.protocols.clone();
                record.anonymity = success.anonymity;
                record.observe_latency(success.latency_millis);
                record.success_count += 1;
            }
            Verdict::Unusable(_) => record.fail_count += 1,
        }
        let now = Utc::now();
        if self.is_usable() {
            record.last_success_at = Some(now);
        }
        record.last_checked_at = Some(now);
    }
}

/// Performs a live probe through one proxy.
#[async_trait]
pub trait Prober: Send + Sync {
    /// One-time setup, run before the probe timeout starts.
    async fn prepare(&self) {}

    async fn probe(&self, address: &str) -> Verdict;
}

/// Body returned by an echo target such as `httpbin.org/get`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EchoResponse {
    pub origin: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Classify what an echo target saw of the client.
///
/// `real_ip` is the host's own egress address; without it transparent
/// proxies cannot be told apart from anonymous ones.
pub fn classify_anonymity(echo: &EchoResponse, real_ip: Option<&str>) -> AnonymityLevel {
    let origins: Vec<&str> = echo
        .origin
        .split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .collect();

    let leaking: Vec<&str> = echo
        .headers
        .iter()
        .filter(|(name, value)| {
            !value.is_empty() && PROXY_HEADERS.contains(&name.to_ascii_lowercase().as_str())
        })
        .map(|(_, value)| value.as_str())
        .collect();

    if let Some(real_ip) = real_ip {
        if origins.contains(&real_ip) || leaking.iter().any(|v| v.contains(real_ip)) {
            return AnonymityLevel::Transparent;
        }
    }

    if origins.len() > 1 || !leaking.is_empty() {
        AnonymityLevel::Anonymous
    } else {
        AnonymityLevel::Elite
    }
}

/// Probes proxies against echo targets over HTTP.
pub struct HttpProber {
    targets: Vec<Url>,
    /// Per-request timeout, kept under the validator's hard cap.
    timeout: Duration,
    scheme: String,
    real_ip: OnceCell<Option<String>>,
}

impl HttpProber {
    pub fn new(targets: Vec<Url>, timeout: Duration, scheme: impl Into<String>) -> Self {
        Self {
            targets,
            timeout: timeout.saturating_sub(timeout / 5),
            scheme: scheme.into(),
            real_ip: OnceCell::new(),
        }
    }

    /// The host's own egress address, looked up once without a proxy.
    async fn real_ip(&self) -> Option<&str> {
        self.real_ip
            .get_or_init(|| async {
                let target = self.targets.first()?.clone();
                let client = Client::builder().no_proxy().timeout(self.timeout).build().ok()?;
                match fetch_echo(&client, target).await {
                    Ok(echo) => {
                        let ip = echo.origin.split(',').next()?.trim().to_string();
                        info!("Real egress IP: {}", ip);
                        Some(ip)
                    }
                    Err(failure) => {
                        warn!("Could not determine real egress IP ({}), using basic anonymity check", failure);
                        None
                    }
                }
            })
            .await
            .as_deref()
    }
}

async fn fetch_echo(client: &Client, target: Url) -> Result<EchoResponse, ProbeFailure> {
    let response = client
        .get(target)
        .header(USER_AGENT, PROBE_USER_AGENT)
        .send()
        .await
        .map_err(|e| map_request_error(&e))?;
    if !response.status().is_success() {
        return Err(ProbeFailure::ProtocolMismatch);
    }
    response
        .json::<EchoResponse>()
        .await
        .map_err(|e| if e.is_timeout() { ProbeFailure::Timeout } else { ProbeFailure::ProtocolMismatch })
}

fn map_request_error(err: &reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::Timeout
    } else if err.is_decode() || err.is_status() {
        ProbeFailure::ProtocolMismatch
    } else {
        ProbeFailure::Unreachable
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn prepare(&self) {
        self.real_ip().await;
    }

    async fn probe(&self, address: &str) -> Verdict {
        let real_ip = self.real_ip().await;

        let proxy = match reqwest::Proxy::all(format!("{}://{}", self.scheme, address)) {
            Ok(p) => p,
            Err(_) => return Verdict::Unusable(ProbeFailure::Unreachable),
        };
        let client = match Client::builder().proxy(proxy).timeout(self.timeout).build() {
            Ok(c) => c,
            Err(_) => return Verdict::Unusable(ProbeFailure::Unreachable),
        };

        // Targets run side by side so one stalled target cannot starve the rest.
        let outcomes = futures::future::join_all(self.targets.iter().map(|target| {
            let client = &client;
            async move {
                let start = Instant::now();
                let outcome = fetch_echo(client, target.clone()).await;
                (target, start.elapsed(), outcome)
            }
        }))
        .await;

        let mut protocols = BTreeSet::new();
        let mut first_success: Option<(u64, EchoResponse)> = None;
        let mut first_failure = None;

        for (target, elapsed, outcome) in outcomes {
            match outcome {
                Ok(echo) => {
                    if let Some(protocol) = Protocol::from_scheme(target.scheme()) {
                        protocols.insert(protocol);
                    }
                    if first_success.is_none() {
                        first_success = Some((elapsed.as_millis() as u64, echo));
                    }
                }
                Err(failure) => {
                    debug!("Probe of {} via {} failed: {}", target, address, failure);
                    first_failure.get_or_insert(failure);
                }
            }
        }

        match first_success {
            Some((latency_millis, echo)) => Verdict::Usable(ProbeSuccess {
                protocols,
                anonymity: classify_anonymity(&echo, real_ip),
                latency_millis,
            }),
            None => Verdict::Unusable(first_failure.unwrap_or(ProbeFailure::Unreachable)),
        }
    }
}

/// Bounded, timeout-enforcing front of a [`Prober`].
#[derive(Clone)]
pub struct Validator {
    prober: Arc<dyn Prober>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    min_anonymity: AnonymityLevel,
}

impl Validator {
    pub fn new(
        prober: Arc<dyn Prober>,
        max_concurrent: usize,
        timeout: Duration,
        min_anonymity: AnonymityLevel,
    ) -> Self {
        Self {
            prober,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
            min_anonymity,
        }
    }

    /// Probe one endpoint, waiting for a worker slot first.
    pub async fn probe(&self, address: &str) -> Verdict {
        self.prober.prepare().await;

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Verdict::Unusable(ProbeFailure::Unreachable),
        };

        let verdict = match tokio::time::timeout(self.timeout, self.prober.probe(address)).await {
            Ok(verdict) => verdict,
            Err(_) => Verdict::Unusable(ProbeFailure::Timeout),
        };

        match verdict {
            Verdict::Usable(success) if success.anonymity < self.min_anonymity => {
                debug!("Proxy {} below required anonymity {:?}", address, self.min_anonymity);
                Verdict::Unusable(ProbeFailure::AnonymityLeak)
            }
            other => other,
        }
    }

    /// Probe many endpoints concurrently, each on its own task.
    ///
    /// Results come back in input order. A probe task that dies is reported
    /// as unreachable rather than failing the batch.
    pub async fn probe_all(&self, addresses: Vec<String>) -> Vec<(String, Verdict)> {
        let tasks: Vec<_> = addresses
            .into_iter()
            .map(|address| {
                let validator = self.clone();
                tokio::spawn(async move {
                    let verdict = validator.probe(&address).await;
                    (address, verdict)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }
        results
    }
}
