//! Fetch cycle: discover, de-duplicate, validate and admit new proxies.

use crate::error::{AdmissionError, SourceError};
use crate::proxy::ProxyStatus;
use crate::scheduler::{Cycle, CycleGuard};
use crate::source::{self, SourcePlugin};
use crate::store::PoolStore;
use crate::validator::{Validator, Verdict};

use async_trait::async_trait;
use futures::future;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summary of one fetch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub sources_ok: usize,
    pub sources_failed: usize,
    /// Unique endpoints returned by all sources.
    pub discovered: usize,
    /// Endpoints not yet in the store, sent to validation.
    pub candidates: usize,
    pub admitted: usize,
    /// Candidates that failed validation.
    pub rejected: usize,
    /// Valid candidates dropped because the pool was full.
    pub dropped: usize,
}

/// Periodically pulls every source and admits new, working proxies.
pub struct FetchScheduler {
    store: Arc<PoolStore>,
    sources: Vec<Arc<dyn SourcePlugin>>,
    validator: Validator,
    source_timeout: Duration,
    max_candidates: usize,
    /// Staggers source requests so upstreams are not hit all at once.
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    guard: CycleGuard,
}

impl FetchScheduler {
    pub fn new(
        store: Arc<PoolStore>,
        sources: Vec<Arc<dyn SourcePlugin>>,
        validator: Validator,
        source_timeout: Duration,
        max_candidates: usize,
        source_requests_per_second: u32,
    ) -> Self {
        let rate = NonZeroU32::new(source_requests_per_second).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);

        Self {
            store,
            sources,
            validator,
            source_timeout,
            max_candidates,
            limiter: RateLimiter::direct(quota),
            guard: CycleGuard::new(),
        }
    }

    /// Fetch from one source, turning a hang into a timeout error.
    async fn fetch_source(&self, source: &Arc<dyn SourcePlugin>) -> Result<Vec<String>, SourceError> {
        self.limiter.until_ready().await;
        match tokio::time::timeout(self.source_timeout, source.fetch(self.source_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::TimedOut),
        }
    }

    /// Run one fetch cycle. Returns `None` if a cycle is already running.
    pub async fn run_cycle(&self) -> Option<FetchReport> {
        let Some(_token) = self.guard.try_enter() else {
            debug!("Fetch cycle already running, skipping");
            return None;
        };
        let started = Instant::now();
        let mut report = FetchReport::default();

        let results = future::join_all(self.sources.iter().map(|source| async move {
            (source.name().to_string(), self.fetch_source(source).await)
        }))
        .await;

        let mut raw = Vec::new();
        for (name, result) in results {
            match result {
                Ok(endpoints) => {
                    info!("Fetched {} proxies from {}", endpoints.len(), name);
                    report.sources_ok += 1;
                    raw.extend(endpoints);
                }
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", name, e);
                    report.sources_failed += 1;
                }
            }
        }

        let discovered = source::dedupe_endpoints(raw);
        report.discovered = discovered.len();

        let fresh: Vec<String> = discovered
            .into_iter()
            .filter(|address| !self.store.contains(address))
            .take(self.max_candidates)
            .filter(|address| self.store.insert_candidate(address))
            .collect();
        report.candidates = fresh.len();

        if fresh.is_empty() {
            info!(
                "Fetch cycle found no new proxies ({} discovered) in {:?}",
                report.discovered,
                started.elapsed()
            );
            return Some(report);
        }

        let mut pending: HashSet<String> = fresh.iter().cloned().collect();
        for (address, verdict) in self.validator.probe_all(fresh).await {
            pending.remove(&address);
            match &verdict {
                Verdict::Usable(_) => {
                    match self.store.admit(&address, |record| verdict.apply_to(record)) {
                        Ok(_) => report.admitted += 1,
                        Err(AdmissionError::CapacityExceeded { capacity }) => {
                            warn!("Pool full ({}), dropping valid proxy {}", capacity, address);
                            report.dropped += 1;
                        }
                        Err(e) => debug!("Could not admit {}: {}", address, e),
                    }
                }
                Verdict::Unusable(reason) => {
                    debug!("Candidate {} failed validation: {}", address, reason);
                    let _ = self.store.remove_if_status(&address, ProxyStatus::Candidate);
                    report.rejected += 1;
                }
            }
        }

        // Probe tasks that died leave no verdict; do not strand their candidates.
        for address in pending {
            let _ = self.store.remove_if_status(&address, ProxyStatus::Candidate);
            report.rejected += 1;
        }

        info!(
            "Fetch cycle completed in {:?}: {} sources ok, {} failed, {} new, {} admitted, {} rejected, {} dropped",
            started.elapsed(),
            report.sources_ok,
            report.sources_failed,
            report.candidates,
            report.admitted,
            report.rejected,
            report.dropped
        );
        Some(report)
    }
}

#[async_trait]
impl Cycle for FetchScheduler {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn tick(&self) {
        self.run_cycle().await;
    }
}
