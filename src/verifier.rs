//! Verify cycle: re-probe known proxies and apply lifecycle transitions.

use crate::error::TransitionError;
use crate::proxy::{HealthPolicy, ProxyStatus};
use crate::scheduler::{Cycle, CycleGuard};
use crate::store::PoolStore;
use crate::validator::Validator;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summary of one verify cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Records re-probed this cycle.
    pub checked: usize,
    /// Active records that stayed active.
    pub refreshed: usize,
    /// Active records moved to quarantine.
    pub quarantined: usize,
    /// Quarantined records moved back to active.
    pub restored: usize,
    /// Quarantined records removed after the retention window.
    pub expired: usize,
    /// Updates lost to a concurrent status change; retried next cycle.
    pub conflicts: usize,
}

/// Periodically re-validates the least recently checked proxies.
pub struct VerifyScheduler {
    store: Arc<PoolStore>,
    validator: Validator,
    policy: HealthPolicy,
    batch_size: usize,
    retention: Duration,
    guard: CycleGuard,
}

impl VerifyScheduler {
    pub fn new(
        store: Arc<PoolStore>,
        validator: Validator,
        policy: HealthPolicy,
        batch_size: usize,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            validator,
            policy,
            batch_size,
            retention,
            guard: CycleGuard::new(),
        }
    }

    /// Remove quarantined records that went the retention window without a
    /// passing re-check.
    fn expire_quarantined(&self, report: &mut VerifyReport) {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let now = Utc::now();

        for record in self.store.with_status(ProxyStatus::Quarantined) {
            let since = record
                .last_success_at
                .map_or(record.status_since, |passed| passed.max(record.status_since));
            if now - since <= retention {
                continue;
            }
            match self.store.remove_if_status(&record.address, ProxyStatus::Quarantined) {
                Ok(_) => {
                    info!("Removed proxy {} after {:?} in quarantine", record.address, self.retention);
                    report.expired += 1;
                }
                Err(TransitionError::StatusChanged { .. }) => report.conflicts += 1,
                Err(_) => {}
            }
        }
    }

    /// Quarantine active records whose reported failure ratio is too high.
    fn quarantine_unreliable(&self, report: &mut VerifyReport) {
        let policy = self.policy;
        for record in self.store.with_status(ProxyStatus::Active) {
            if !policy.is_unreliable(&record) {
                continue;
            }
            let result = self.store.modify(&record.address, Some(ProxyStatus::Active), |r| {
                policy.is_unreliable(r).then_some(ProxyStatus::Quarantined)
            });
            match result {
                Ok(r) if r.status == ProxyStatus::Quarantined => report.quarantined += 1,
                Ok(_) => {}
                Err(TransitionError::StatusChanged { .. }) => report.conflicts += 1,
                Err(_) => {}
            }
        }
    }

    /// Run one verify cycle. Returns `None` if a cycle is already running.
    pub async fn run_cycle(&self) -> Option<VerifyReport> {
        let Some(_token) = self.guard.try_enter() else {
            debug!("Verify cycle already running, skipping");
            return None;
        };
        let started = Instant::now();
        let mut report = VerifyReport::default();

        self.expire_quarantined(&mut report);
        self.quarantine_unreliable(&mut report);

        let batch = self.store.stale_batch(self.batch_size);
        let observed: HashMap<String, ProxyStatus> = batch
            .iter()
            .map(|r| (r.address.clone(), r.status))
            .collect();
        let addresses = batch.into_iter().map(|r| r.address).collect();

        let policy = self.policy;
        for (address, verdict) in self.validator.probe_all(addresses).await {
            let Some(&before) = observed.get(&address) else {
                continue;
            };
            report.checked += 1;

            let result = self.store.modify(&address, Some(before), |record| {
                verdict.apply_to(record);
                let healthy = verdict.is_usable() && !policy.is_unreliable(record);
                Some(if healthy {
                    ProxyStatus::Active
                } else {
                    ProxyStatus::Quarantined
                })
            });

            match result {
                Ok(record) => match (before, record.status) {
                    (ProxyStatus::Active, ProxyStatus::Active) => report.refreshed += 1,
                    (ProxyStatus::Active, ProxyStatus::Quarantined) => report.quarantined += 1,
                    (ProxyStatus::Quarantined, ProxyStatus::Active) => report.restored += 1,
                    _ => {}
                },
                Err(TransitionError::StatusChanged { .. }) => {
                    debug!("Proxy {} changed status during re-check", address);
                    report.conflicts += 1;
                }
                Err(e) => debug!("Skipping re-check result for {}: {}", address, e),
            }
        }

        info!(
            "Verify cycle completed in {:?}: {} checked, {} refreshed, {} quarantined, {} restored, {} expired",
            started.elapsed(),
            report.checked,
            report.refreshed,
            report.quarantined,
            report.restored,
            report.expired
        );
        Some(report)
    }
}

#[async_trait]
impl Cycle for VerifyScheduler {
    fn name(&self) -> &'static str {
        "verify"
    }

    async fn tick(&self) {
        self.run_cycle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{AnonymityLevel, ProxyRecord};
    use crate::dispatch::{Dispatcher, Outcome};
    use crate::test_support::{usable, ScriptedProber};
    use crate::validator::{ProbeFailure, Prober, Verdict};
    use async_trait::async_trait;

    /// Reports a failed request for the proxy while its re-check is running.
    struct FailsMidCheck {
        dispatcher: Dispatcher,
    }

    #[async_trait]
    impl Prober for FailsMidCheck {
        async fn probe(&self, address: &str) -> Verdict {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.dispatcher.report(address, Outcome::Failure);
            usable(100, AnonymityLevel::Elite)
        }
    }

    fn record(address: &str, status: ProxyStatus, success: u64, fail: u64) -> ProxyRecord {
        let mut record = ProxyRecord::candidate(address);
        record.status = status;
        record.success_count = success;
        record.fail_count = fail;
        record.latency_millis = Some(200);
        record.last_checked_at = Some(Utc::now() - chrono::Duration::minutes(10));
        record
    }

    fn verifier(store: &Arc<PoolStore>, prober: Arc<ScriptedProber>, batch: usize) -> VerifyScheduler {
        let validator = Validator::new(prober, 4, Duration::from_secs(1), AnonymityLevel::Transparent);
        VerifyScheduler::new(
            Arc::clone(store),
            validator,
            HealthPolicy::default(),
            batch,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_unreliable_active_is_quarantined() {
        let store = Arc::new(PoolStore::new(10));
        store.insert_record(record("1.1.1.1:80", ProxyStatus::Active, 0, 5));
        // Even a passing re-check does not outweigh the failure history.
        let prober = Arc::new(ScriptedProber::new().with("1.1.1.1:80", usable(100, AnonymityLevel::Elite)));

        let report = verifier(&store, prober, 10).run_cycle().await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(store.get("1.1.1.1:80").unwrap().status, ProxyStatus::Quarantined);
    }

    #[tokio::test]
    async fn test_failed_recheck_quarantines_and_success_restores() {
        let store = Arc::new(PoolStore::new(10));
        store.insert_record(record("1.1.1.1:80", ProxyStatus::Active, 10, 0));
        let prober = Arc::new(ScriptedProber::new().with("1.1.1.1:80", Verdict::Unusable(ProbeFailure::Timeout)));
        let verify = verifier(&store, Arc::clone(&prober), 10);

        let report = verify.run_cycle().await.unwrap();
        assert_eq!(report.quarantined, 1);
        let quarantined = store.get("1.1.1.1:80").unwrap();
        assert_eq!(quarantined.status, ProxyStatus::Quarantined);
        assert_eq!(quarantined.fail_count, 1);

        prober.set("1.1.1.1:80", usable(90, AnonymityLevel::Anonymous));
        let report = verify.run_cycle().await.unwrap();
        assert_eq!(report.restored, 1);
        let restored = store.get("1.1.1.1:80").unwrap();
        assert_eq!(restored.status, ProxyStatus::Active);
        assert_eq!(restored.success_count, 11);
        assert_eq!(restored.anonymity, AnonymityLevel::Anonymous);
    }

    #[tokio::test]
    async fn test_quarantine_retention_removes_record() {
        let store = Arc::new(PoolStore::new(10));
        let mut stale = record("1.1.1.1:80", ProxyStatus::Quarantined, 1, 3);
        stale.status_since = Utc::now() - chrono::Duration::minutes(5);
        store.insert_record(stale);
        store.insert_record(record("2.2.2.2:80", ProxyStatus::Quarantined, 1, 3));

        let report = verifier(&store, Arc::new(ScriptedProber::new()), 10)
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert!(!store.contains("1.1.1.1:80"));
        assert_eq!(store.get("2.2.2.2:80").unwrap().status, ProxyStatus::Quarantined);
    }

    #[tokio::test]
    async fn test_passing_recheck_keeps_quarantined_record() {
        let store = Arc::new(PoolStore::new(10));
        let mut held = record("1.1.1.1:80", ProxyStatus::Quarantined, 1, 6);
        held.status_since = Utc::now() - chrono::Duration::minutes(5);
        store.insert_record(held);
        let prober = Arc::new(ScriptedProber::new().with("1.1.1.1:80", usable(100, AnonymityLevel::Elite)));
        let verify = verifier(&store, prober, 10);

        // No passing re-check inside the window.
        let report = verify.run_cycle().await.unwrap();
        assert_eq!(report.expired, 1);
        assert!(!store.contains("1.1.1.1:80"));

        let mut held = record("2.2.2.2:80", ProxyStatus::Quarantined, 1, 6);
        held.status_since = Utc::now() - chrono::Duration::minutes(5);
        held.last_success_at = Some(Utc::now() - chrono::Duration::seconds(10));
        store.insert_record(held);

        // Passes again, but the failure ratio keeps it quarantined.
        let report = verify.run_cycle().await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.checked, 1);
        let kept = store.get("2.2.2.2:80").unwrap();
        assert_eq!(kept.status, ProxyStatus::Quarantined);
        assert!(kept.last_success_at > Some(Utc::now() - chrono::Duration::seconds(5)));
    }

    #[tokio::test]
    async fn test_batch_takes_oldest_checked_first() {
        let store = Arc::new(PoolStore::new(10));
        let mut old = record("1.1.1.1:80", ProxyStatus::Active, 3, 0);
        old.last_checked_at = Some(Utc::now() - chrono::Duration::hours(2));
        let old_checked = old.last_checked_at;
        store.insert_record(old);
        store.insert_record(record("2.2.2.2:80", ProxyStatus::Active, 3, 0));

        let prober = Arc::new(
            ScriptedProber::new()
                .with("1.1.1.1:80", usable(100, AnonymityLevel::Elite))
                .with("2.2.2.2:80", usable(100, AnonymityLevel::Elite)),
        );
        let report = verifier(&store, Arc::clone(&prober), 1).run_cycle().await.unwrap();

        assert_eq!(report.checked, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(prober.calls(), 1);
        assert!(store.get("1.1.1.1:80").unwrap().last_checked_at > old_checked);
        assert_eq!(store.get("2.2.2.2:80").unwrap().success_count, 3);
    }

    #[tokio::test]
    async fn test_report_during_recheck_wins() {
        let store = Arc::new(PoolStore::new(10));
        // Four samples, one short of the ratio rule applying.
        store.insert_record(record("1.1.1.1:80", ProxyStatus::Active, 1, 3));
        let prober = Arc::new(FailsMidCheck {
            dispatcher: Dispatcher::new(Arc::clone(&store), HealthPolicy::default()),
        });
        let validator = Validator::new(prober, 4, Duration::from_secs(1), AnonymityLevel::Transparent);
        let verify = VerifyScheduler::new(
            Arc::clone(&store),
            validator,
            HealthPolicy::default(),
            10,
            Duration::from_secs(60),
        );

        let report = verify.run_cycle().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.refreshed, 0);

        // The passing re-check was dropped rather than undoing the quarantine.
        let record = store.get("1.1.1.1:80").unwrap();
        assert_eq!(record.status, ProxyStatus::Quarantined);
        assert_eq!(record.success_count, 1);
        assert_eq!(record.fail_count, 4);
    }

    #[tokio::test]
    async fn test_candidates_are_left_to_the_fetch_cycle() {
        let store = Arc::new(PoolStore::new(10));
        store.insert_candidate("1.1.1.1:80");

        let report = verifier(&store, Arc::new(ScriptedProber::new()), 10)
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.checked, 0);
        assert_eq!(store.get("1.1.1.1:80").unwrap().status, ProxyStatus::Candidate);
    }
}
