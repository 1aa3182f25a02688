//! Read path: pick an active proxy by policy and take usage feedback.

use crate::config::DispatchPolicy;
use crate::error::NoProxyAvailable;
use crate::proxy::{AnonymityLevel, HealthPolicy, Protocol, ProxyRecord, ProxyStatus};
use crate::store::{PoolStats, PoolStore};

use log::warn;
use rand::Rng;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Result of using a dispatched proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Extra constraints on which active proxies may be dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub protocol: Option<Protocol>,
    pub min_anonymity: Option<AnonymityLevel>,
}

impl Requirements {
    /// Only proxies that relay HTTPS.
    pub fn https() -> Self {
        Self {
            protocol: Some(Protocol::Https),
            ..Self::default()
        }
    }

    fn accepts(&self, record: &ProxyRecord) -> bool {
        self.protocol.map_or(true, |p| record.supports(p))
            && self.min_anonymity.map_or(true, |level| record.anonymity >= level)
    }
}

/// Public view of an active proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProxy {
    pub address: String,
    pub latency_millis: Option<u64>,
    pub anonymity: AnonymityLevel,
}

/// Selects proxies for callers and records how they performed.
pub struct Dispatcher {
    store: Arc<PoolStore>,
    policy: HealthPolicy,
    /// Used for round-robin proxy selection.
    cursor: AtomicUsize,
}

impl Dispatcher {
    pub fn new(store: Arc<PoolStore>, policy: HealthPolicy) -> Self {
        Self {
            store,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Get an active proxy according to `policy`.
    pub fn acquire(&self, policy: DispatchPolicy) -> Result<ProxyRecord, NoProxyAvailable> {
        self.acquire_with(policy, &Requirements::default())
    }

    /// Get an active proxy that also meets `requirements`.
    pub fn acquire_with(
        &self,
        policy: DispatchPolicy,
        requirements: &Requirements,
    ) -> Result<ProxyRecord, NoProxyAvailable> {
        let mut active: Vec<ProxyRecord> = self
            .store
            .with_status(ProxyStatus::Active)
            .into_iter()
            .filter(|r| requirements.accepts(r))
            .collect();

        if active.is_empty() {
            return Err(NoProxyAvailable);
        }

        let index = match policy {
            DispatchPolicy::Random => rand::rng().random_range(0..active.len()),
            DispatchPolicy::BestLatency => index_of_best(&active, |a, b| {
                a.latency_millis
                    .unwrap_or(u64::MAX)
                    .cmp(&b.latency_millis.unwrap_or(u64::MAX))
            }),
            DispatchPolicy::MostReliable => index_of_best(&active, |a, b| {
                b.success_rate()
                    .partial_cmp(&a.success_rate())
                    .unwrap_or(CmpOrdering::Equal)
            }),
            DispatchPolicy::RoundRobin => {
                // Store iteration order is arbitrary; rotate over a stable one.
                active.sort_by(|a, b| a.address.cmp(&b.address));
                self.cursor.fetch_add(1, Ordering::Relaxed) % active.len()
            }
        };

        Ok(active.swap_remove(index))
    }

    /// Record the outcome of using a proxy. Unknown addresses are ignored.
    ///
    /// Returns whether a record was updated.
    pub fn report(&self, address: &str, outcome: Outcome) -> bool {
        let policy = self.policy;
        let result = self.store.modify(address, None, |record| {
            match outcome {
                Outcome::Success => record.success_count += 1,
                Outcome::Failure => record.fail_count += 1,
            }
            (record.status == ProxyStatus::Active && policy.is_unreliable(record))
                .then_some(ProxyStatus::Quarantined)
        });

        match result {
            Ok(record) => {
                if record.status == ProxyStatus::Quarantined && outcome == Outcome::Failure {
                    warn!(
                        "Proxy {} quarantined: {} failures, {} successes",
                        record.address, record.fail_count, record.success_count
                    );
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Every active proxy, fastest first.
    pub fn list_active(&self) -> Vec<ActiveProxy> {
        let mut active: Vec<ActiveProxy> = self
            .store
            .with_status(ProxyStatus::Active)
            .into_iter()
            .map(|r| ActiveProxy {
                address: r.address,
                latency_millis: r.latency_millis,
                anonymity: r.anonymity,
            })
            .collect();
        active.sort_by(|a, b| {
            a.latency_millis
                .unwrap_or(u64::MAX)
                .cmp(&b.latency_millis.unwrap_or(u64::MAX))
                .then_with(|| a.address.cmp(&b.address))
        });
        active
    }

    pub fn stats(&self) -> PoolStats {
        self.store.stats()
    }
}

/// Index of the minimum under `cmp`, ties broken by address.
fn index_of_best<F>(records: &[ProxyRecord], cmp: F) -> usize
where
    F: Fn(&ProxyRecord, &ProxyRecord) -> CmpOrdering,
{
    records
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| cmp(*a, *b).then_with(|| a.address.cmp(&b.address)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};

    fn active(address: &str, latency: u64, success: u64, fail: u64) -> ProxyRecord {
        let mut record = ProxyRecord::candidate(address);
        record.status = ProxyStatus::Active;
        record.latency_millis = Some(latency);
        record.success_count = success;
        record.fail_count = fail;
        record.protocols = BTreeSet::from([Protocol::Http]);
        record
    }

    fn dispatcher(records: Vec<ProxyRecord>) -> (Arc<PoolStore>, Dispatcher) {
        let store = Arc::new(PoolStore::new(100));
        for record in records {
            store.insert_record(record);
        }
        let dispatcher = Dispatcher::new(Arc::clone(&store), HealthPolicy::default());
        (store, dispatcher)
    }

    #[test]
    fn test_empty_pool_is_not_available() {
        let (store, dispatcher) = dispatcher(Vec::new());
        store.insert_candidate("1.1.1.1:80");

        for policy in [
            DispatchPolicy::Random,
            DispatchPolicy::BestLatency,
            DispatchPolicy::RoundRobin,
            DispatchPolicy::MostReliable,
        ] {
            assert_eq!(dispatcher.acquire(policy), Err(NoProxyAvailable));
        }
    }

    #[test]
    fn test_only_active_records_are_dispatched() {
        let mut quarantined = active("2.2.2.2:80", 10, 1, 0);
        quarantined.status = ProxyStatus::Quarantined;
        let (store, dispatcher) = dispatcher(vec![active("1.1.1.1:80", 500, 1, 0), quarantined]);
        store.insert_candidate("3.3.3.3:80");

        for _ in 0..50 {
            let record = dispatcher.acquire(DispatchPolicy::Random).unwrap();
            assert_eq!(record.address, "1.1.1.1:80");
            assert_eq!(record.status, ProxyStatus::Active);
        }
        assert_eq!(
            dispatcher.acquire(DispatchPolicy::BestLatency).unwrap().address,
            "1.1.1.1:80"
        );
    }

    #[test]
    fn test_best_latency_and_most_reliable() {
        let (_, dispatcher) = dispatcher(vec![
            active("1.1.1.1:80", 300, 10, 0),
            active("2.2.2.2:80", 50, 5, 5),
            active("3.3.3.3:80", 120, 8, 2),
        ]);

        assert_eq!(
            dispatcher.acquire(DispatchPolicy::BestLatency).unwrap().address,
            "2.2.2.2:80"
        );
        assert_eq!(
            dispatcher.acquire(DispatchPolicy::MostReliable).unwrap().address,
            "1.1.1.1:80"
        );
    }

    #[test]
    fn test_round_robin_visits_every_active_proxy() {
        let (_, dispatcher) = dispatcher(vec![
            active("1.1.1.1:80", 100, 1, 0),
            active("2.2.2.2:80", 100, 1, 0),
            active("3.3.3.3:80", 100, 1, 0),
        ]);

        let picked: Vec<String> = (0..6)
            .map(|_| dispatcher.acquire(DispatchPolicy::RoundRobin).unwrap().address)
            .collect();
        assert_eq!(
            picked,
            vec!["1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80", "1.1.1.1:80", "2.2.2.2:80", "3.3.3.3:80"]
        );
    }

    #[test]
    fn test_requirements_filter() {
        let mut https = active("2.2.2.2:80", 400, 1, 0);
        https.protocols.insert(Protocol::Https);
        https.anonymity = AnonymityLevel::Elite;
        let (_, dispatcher) = dispatcher(vec![active("1.1.1.1:80", 10, 1, 0), https]);

        let picked = dispatcher
            .acquire_with(DispatchPolicy::BestLatency, &Requirements::https())
            .unwrap();
        assert_eq!(picked.address, "2.2.2.2:80");

        let elite = Requirements {
            min_anonymity: Some(AnonymityLevel::Elite),
            ..Requirements::default()
        };
        assert_eq!(
            dispatcher.acquire_with(DispatchPolicy::Random, &elite).unwrap().address,
            "2.2.2.2:80"
        );
    }

    #[test]
    fn test_report_unknown_address_is_noop() {
        let (store, dispatcher) = dispatcher(Vec::new());
        assert!(!dispatcher.report("9.9.9.9:1", Outcome::Success));
        assert!(store.is_empty());
    }

    #[test]
    fn test_report_failures_quarantine_after_min_samples() {
        let (store, dispatcher) = dispatcher(vec![active("1.1.1.1:80", 100, 1, 0)]);

        for _ in 0..4 {
            assert!(dispatcher.report("1.1.1.1:80", Outcome::Failure));
        }
        // 4 failures out of 5 samples crosses the default 0.5 ratio.
        let record = store.get("1.1.1.1:80").unwrap();
        assert_eq!(record.fail_count, 4);
        assert_eq!(record.status, ProxyStatus::Quarantined);
        assert_eq!(dispatcher.acquire(DispatchPolicy::Random), Err(NoProxyAvailable));

        // Success reports still count but do not lift quarantine.
        assert!(dispatcher.report("1.1.1.1:80", Outcome::Success));
        assert_eq!(store.get("1.1.1.1:80").unwrap().status, ProxyStatus::Quarantined);
    }

    #[test]
    fn test_list_active_sorted_by_latency() {
        let (_, dispatcher) = dispatcher(vec![
            active("1.1.1.1:80", 300, 1, 0),
            active("2.2.2.2:80", 50, 1, 0),
        ]);
        let listed: HashSet<String> = dispatcher.list_active().into_iter().map(|p| p.address).collect();
        assert_eq!(listed.len(), 2);
        assert_eq!(dispatcher.list_active()[0].address, "2.2.2.2:80");
        assert_eq!(dispatcher.stats().active, 2);
    }
}
