//! Scripted collaborators for unit tests.

use crate::config::ProxyPoolConfig;
use crate::proxy::{AnonymityLevel, Protocol};
use crate::source::SourceSpec;
use crate::validator::{ProbeFailure, ProbeSuccess, Prober, Verdict};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) fn usable(latency_millis: u64, anonymity: AnonymityLevel) -> Verdict {
    Verdict::Usable(ProbeSuccess {
        protocols: BTreeSet::from([Protocol::Http]),
        anonymity,
        latency_millis,
    })
}

pub(crate) fn test_config(capacity: usize) -> ProxyPoolConfig {
    ProxyPoolConfig::builder()
        .source(SourceSpec::Static {
            name: "static".to_string(),
            endpoints: Vec::new(),
        })
        .capacity(capacity)
        .probe_timeout(Duration::from_millis(500))
        .build()
}

/// Prober answering from a table; unknown addresses are unreachable.
#[derive(Default)]
pub(crate) struct ScriptedProber {
    verdicts: Mutex<HashMap<String, Verdict>>,
    slow: HashMap<String, Duration>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedProber {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(self, address: &str, verdict: Verdict) -> Self {
        self.set(address, verdict);
        self
    }

    pub(crate) fn slow(mut self, address: &str, hang: Duration) -> Self {
        self.slow.insert(address.to_string(), hang);
        self
    }

    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set(&self, address: &str, verdict: Verdict) {
        self.verdicts.lock().insert(address.to_string(), verdict);
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, address: &str) -> Verdict {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(hang) = self.slow.get(address) {
            tokio::time::sleep(*hang).await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.verdicts
            .lock()
            .get(address)
            .cloned()
            .unwrap_or(Verdict::Unusable(ProbeFailure::Unreachable))
    }
}
