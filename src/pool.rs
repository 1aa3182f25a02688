//! Core proxy pool implementation.

use crate::config::{DispatchPolicy, ProxyPoolConfig};
use crate::dispatch::{ActiveProxy, Dispatcher, Outcome, Requirements};
use crate::error::{ConfigError, NoProxyAvailable};
use crate::fetcher::{FetchReport, FetchScheduler};
use crate::proxy::ProxyRecord;
use crate::scheduler::{self, SchedulerHandle};
use crate::source::SourcePlugin;
use crate::store::{PoolStats, PoolStore};
use crate::validator::{HttpProber, Prober, Validator};
use crate::verifier::{VerifyReport, VerifyScheduler};

use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// A self-refreshing pool of validated proxies.
pub struct ProxyPool {
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
    store: Arc<PoolStore>,
    dispatcher: Dispatcher,
    fetcher: Arc<FetchScheduler>,
    verifier: Arc<VerifyScheduler>,
    /// Running schedulers, present between `start` and `shutdown`.
    schedulers: Mutex<Vec<SchedulerHandle>>,
}

impl ProxyPool {
    /// Create a pool that fetches from the configured sources and probes over HTTP.
    pub fn new(config: ProxyPoolConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let sources = config
            .sources
            .iter()
            .map(|spec| spec.build())
            .collect::<Result<Vec<_>, _>>()?;
        let prober = Arc::new(HttpProber::new(
            config.probe_urls()?,
            config.probe_timeout,
            config.proxy_scheme.clone(),
        ));
        Self::with_components(config, sources, prober)
    }

    /// Create a pool from explicit source plugins and prober.
    pub fn with_components(
        config: ProxyPoolConfig,
        sources: Vec<Arc<dyn SourcePlugin>>,
        prober: Arc<dyn Prober>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate_limits()?;
        if sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let store = Arc::new(PoolStore::new(config.capacity));
        if let Some(path) = &config.snapshot_path {
            store.load_snapshot(path)?;
        }

        // One worker pool shared by both cycles bounds total outbound probes.
        let validator = Validator::new(
            prober,
            config.max_concurrent_probes,
            config.probe_timeout,
            config.min_anonymity,
        );
        let policy = config.health_policy();

        let fetcher = Arc::new(FetchScheduler::new(
            Arc::clone(&store),
            sources,
            validator.clone(),
            config.source_timeout,
            config.max_candidates_per_cycle,
            config.source_requests_per_second,
        ));
        let verifier = Arc::new(VerifyScheduler::new(
            Arc::clone(&store),
            validator,
            policy,
            config.verify_batch_size,
            config.quarantine_retention,
        ));

        Ok(Arc::new(Self {
            dispatcher: Dispatcher::new(Arc::clone(&store), policy),
            config,
            store,
            fetcher,
            verifier,
            schedulers: Mutex::new(Vec::new()),
        }))
    }

    /// Start the fetch and verify schedulers. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut schedulers = self.schedulers.lock();
        if !schedulers.is_empty() {
            warn!("Proxy pool schedulers already running");
            return;
        }
        schedulers.push(scheduler::spawn_recurring(
            Arc::clone(&self.fetcher),
            self.config.fetch_interval,
        ));
        schedulers.push(scheduler::spawn_recurring(
            Arc::clone(&self.verifier),
            self.config.verify_interval,
        ));

        let stats = self.store.stats();
        info!(
            "Proxy pool started: {}/{} active proxies",
            stats.active, stats.total
        );
    }

    /// Stop the schedulers, wait for running cycles and write the snapshot.
    pub async fn shutdown(&self) {
        let schedulers: Vec<SchedulerHandle> = self.schedulers.lock().drain(..).collect();
        for handle in schedulers {
            handle.stop().await;
        }

        if let Some(path) = &self.config.snapshot_path {
            if let Err(e) = self.store.save_snapshot(path) {
                warn!("Failed to save proxy snapshot to {}: {}", path.display(), e);
            }
        }
        info!("Proxy pool shut down");
    }

    /// Run one fetch cycle now. `None` if one is already running.
    pub async fn refresh_now(&self) -> Option<FetchReport> {
        self.fetcher.run_cycle().await
    }

    /// Run one verify cycle now. `None` if one is already running.
    pub async fn verify_now(&self) -> Option<VerifyReport> {
        self.verifier.run_cycle().await
    }

    /// Get a proxy using the configured dispatch policy.
    pub fn get_proxy(&self) -> Result<ProxyRecord, NoProxyAvailable> {
        self.dispatcher.acquire(self.config.dispatch_policy)
    }

    /// Get a proxy using the given dispatch policy.
    pub fn acquire(&self, policy: DispatchPolicy) -> Result<ProxyRecord, NoProxyAvailable> {
        self.dispatcher.acquire(policy)
    }

    /// Get a proxy that meets extra requirements.
    pub fn acquire_with(
        &self,
        policy: DispatchPolicy,
        requirements: &Requirements,
    ) -> Result<ProxyRecord, NoProxyAvailable> {
        self.dispatcher.acquire_with(policy, requirements)
    }

    /// Report how a dispatched proxy performed. Unknown addresses are ignored.
    pub fn report(&self, address: &str, outcome: Outcome) -> bool {
        self.dispatcher.report(address, outcome)
    }

    /// Report a successful request through a proxy.
    pub fn report_proxy_success(&self, address: &str) -> bool {
        self.report(address, Outcome::Success)
    }

    /// Report a failed request through a proxy.
    pub fn report_proxy_failure(&self, address: &str) -> bool {
        self.report(address, Outcome::Failure)
    }

    /// Active proxies, fastest first.
    pub fn list_active(&self) -> Vec<ActiveProxy> {
        self.dispatcher.list_active()
    }

    /// Get statistics about the proxy pool.
    pub fn get_stats(&self) -> PoolStats {
        self.dispatcher.stats()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<PoolStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{AnonymityLevel, ProxyStatus};
    use crate::source::StaticSource;
    use crate::test_support::{test_config, usable, ScriptedProber};
    use std::time::Duration;

    fn pool_with(endpoints: &[&str], prober: ScriptedProber, config: ProxyPoolConfig) -> Arc<ProxyPool> {
        let source: Arc<dyn SourcePlugin> = Arc::new(StaticSource::new(
            "static",
            endpoints.iter().map(|e| e.to_string()).collect(),
        ));
        ProxyPool::with_components(config, vec![source], Arc::new(prober)).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ProxyPoolConfig::builder().build();
        assert!(matches!(ProxyPool::new(config), Err(ConfigError::NoSources)));
    }

    #[test]
    fn test_with_components_rejects_zero_limits() {
        let source: Arc<dyn SourcePlugin> = Arc::new(StaticSource::new("static", vec!["1.2.3.4:8080".to_string()]));
        let config = ProxyPoolConfig {
            fetch_interval: Duration::ZERO,
            ..test_config(10)
        };
        let result = ProxyPool::with_components(config, vec![Arc::clone(&source)], Arc::new(ScriptedProber::new()));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "fetch_interval", .. })
        ));

        let result = ProxyPool::with_components(test_config(0), vec![source], Arc::new(ScriptedProber::new()));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "capacity", .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_then_dispatch() {
        let prober = ScriptedProber::new().with("1.2.3.4:8080", usable(120, AnonymityLevel::Elite));
        let pool = pool_with(&["1.2.3.4:8080"], prober, test_config(10));

        assert_eq!(pool.get_proxy(), Err(NoProxyAvailable));
        let report = pool.refresh_now().await.unwrap();
        assert_eq!(report.admitted, 1);

        let proxy = pool.get_proxy().unwrap();
        assert_eq!(proxy.address, "1.2.3.4:8080");
        assert!(pool.report_proxy_success(&proxy.address));
        assert_eq!(pool.store().get("1.2.3.4:8080").unwrap().success_count, 2);
        assert_eq!(pool.list_active().len(), 1);
        assert_eq!(pool.get_stats().active, 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_persist_snapshot() {
        let path = std::env::temp_dir().join(format!("live-proxy-pool-pool-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let config = ProxyPoolConfig {
            snapshot_path: Some(path.clone()),
            fetch_interval: Duration::from_millis(20),
            verify_interval: Duration::from_secs(60),
            ..test_config(10)
        };
        let prober = ScriptedProber::new().with("1.2.3.4:8080", usable(80, AnonymityLevel::Anonymous));
        let pool = pool_with(&["1.2.3.4:8080"], prober, config.clone());

        pool.start();
        pool.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.shutdown().await;
        assert_eq!(pool.get_stats().active, 1);

        let restored = pool_with(&[], ScriptedProber::new(), config);
        let record = restored.store().get("1.2.3.4:8080").unwrap();
        assert_eq!(record.status, ProxyStatus::Active);
        assert_eq!(record.anonymity, AnonymityLevel::Anonymous);

        let _ = std::fs::remove_file(&path);
    }
}
