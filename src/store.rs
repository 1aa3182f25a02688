//! Concurrent keyed store that owns every [`ProxyRecord`].
//!
//! Each record is updated atomically under its shard lock; status changes are
//! compare-and-set on the record's current status. No operation holds a lock
//! across an `.await` or while calling back into the store.

use crate::error::{AdmissionError, SnapshotError, TransitionError};
use crate::proxy::{ProxyRecord, ProxyStatus};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::Path;

/// Counts per lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub candidates: usize,
    pub active: usize,
    pub quarantined: usize,
}

/// On-disk representation of the store.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    records: Vec<ProxyRecord>,
}

/// Keyed, concurrent container of proxy records.
pub struct PoolStore {
    records: DashMap<String, ProxyRecord>,
    /// Ceiling on admitted (active + quarantined) records.
    capacity: usize,
    /// Serialises admissions so the ceiling holds under concurrent cycles.
    admission: Mutex<()>,
}

impl PoolStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            capacity,
            admission: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.records.contains_key(address)
    }

    /// Copy of a single record.
    pub fn get(&self, address: &str) -> Option<ProxyRecord> {
        self.records.get(address).map(|r| r.value().clone())
    }

    /// Copy of every record. Shards are locked one at a time.
    pub fn snapshot(&self) -> Vec<ProxyRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Copy of every record in the given status.
    pub fn with_status(&self, status: ProxyStatus) -> Vec<ProxyRecord> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for record in self.records.iter() {
            stats.total += 1;
            match record.status {
                ProxyStatus::Candidate => stats.candidates += 1,
                ProxyStatus::Active => stats.active += 1,
                ProxyStatus::Quarantined => stats.quarantined += 1,
            }
        }
        stats
    }

    /// Admitted records, least recently checked first, at most `limit`.
    pub fn stale_batch(&self, limit: usize) -> Vec<ProxyRecord> {
        let mut admitted: Vec<ProxyRecord> = self
            .records
            .iter()
            .filter(|r| r.status != ProxyStatus::Candidate)
            .map(|r| r.value().clone())
            .collect();
        // `None` sorts first, so never-checked records lead.
        admitted.sort_by(|a, b| {
            a.last_checked_at
                .cmp(&b.last_checked_at)
                .then_with(|| a.address.cmp(&b.address))
        });
        admitted.truncate(limit);
        admitted
    }

    /// Register a newly discovered address. Returns `false` if it is already known.
    pub fn insert_candidate(&self, address: &str) -> bool {
        match self.records.entry(address.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ProxyRecord::candidate(address));
                true
            }
        }
    }

    /// Insert a fully formed record, keeping any existing entry.
    pub(crate) fn insert_record(&self, record: ProxyRecord) -> bool {
        match self.records.entry(record.address.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Atomically update one record.
    ///
    /// `update` runs on a copy of the record and returns the status it wants
    /// the record to move to, if any. The copy replaces the stored record only
    /// when the current status matches `expected` (when given) and the
    /// requested status change is a lifecycle edge.
    pub fn modify<F>(
        &self,
        address: &str,
        expected: Option<ProxyStatus>,
        update: F,
    ) -> Result<ProxyRecord, TransitionError>
    where
        F: FnOnce(&mut ProxyRecord) -> Option<ProxyStatus>,
    {
        let mut entry = self
            .records
            .get_mut(address)
            .ok_or_else(|| TransitionError::NotFound(address.to_string()))?;
        let current = entry.value_mut();

        if let Some(expected) = expected {
            if current.status != expected {
                return Err(TransitionError::StatusChanged {
                    address: address.to_string(),
                    expected,
                    actual: current.status,
                });
            }
        }

        let mut next = current.clone();
        let target = update(&mut next);
        if next.success_count < current.success_count || next.fail_count < current.fail_count {
            return Err(TransitionError::CountersDecreased {
                address: address.to_string(),
            });
        }

        // The key and the status are owned by the store, not by the closure.
        next.address = current.address.clone();
        next.status = current.status;

        if let Some(target) = target.filter(|t| *t != current.status) {
            if !current.status.can_transition_to(target) {
                return Err(TransitionError::IllegalTransition {
                    address: address.to_string(),
                    from: current.status,
                    to: target,
                });
            }
            info!("Proxy {} status changed: {} -> {}", address, current.status, target);
            next.status = target;
            next.status_since = Utc::now();
        }

        *current = next;
        Ok(current.clone())
    }

    /// Compare-and-set status change without further updates.
    pub fn transition(
        &self,
        address: &str,
        from: ProxyStatus,
        to: ProxyStatus,
    ) -> Result<ProxyRecord, TransitionError> {
        if !from.can_transition_to(to) {
            return Err(TransitionError::IllegalTransition {
                address: address.to_string(),
                from,
                to,
            });
        }
        self.modify(address, Some(from), |_| Some(to))
    }

    /// Delete a record if it is still in `expected` status.
    pub fn remove_if_status(
        &self,
        address: &str,
        expected: ProxyStatus,
    ) -> Result<ProxyRecord, TransitionError> {
        if !expected.is_removable() {
            return Err(TransitionError::NotRemovable {
                address: address.to_string(),
                status: expected,
            });
        }
        if let Some((_, record)) = self.records.remove_if(address, |_, r| r.status == expected) {
            debug!("Proxy {} removed while {}", address, expected);
            return Ok(record);
        }
        match self.records.get(address) {
            Some(r) => Err(TransitionError::StatusChanged {
                address: address.to_string(),
                expected,
                actual: r.status,
            }),
            None => Err(TransitionError::NotFound(address.to_string())),
        }
    }

    /// Promote a validated candidate to `active`, making room if needed.
    ///
    /// At capacity the lowest-ranked quarantined record is evicted first; if
    /// none exists the candidate is removed and the admission refused.
    pub fn admit<F>(&self, address: &str, update: F) -> Result<ProxyRecord, AdmissionError>
    where
        F: FnOnce(&mut ProxyRecord),
    {
        let _guard = self.admission.lock();

        let admitted = self
            .records
            .iter()
            .filter(|r| r.status != ProxyStatus::Candidate)
            .count();

        if admitted >= self.capacity && !self.evict_one() {
            // Best effort: a concurrent cycle may already have dropped it.
            let _ = self.remove_if_status(address, ProxyStatus::Candidate);
            return Err(AdmissionError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let record = self.modify(address, Some(ProxyStatus::Candidate), |record| {
            update(record);
            Some(ProxyStatus::Active)
        })?;
        Ok(record)
    }

    /// Remove the lowest-ranked quarantined record. Returns whether one went.
    fn evict_one(&self) -> bool {
        loop {
            let victim = self
                .records
                .iter()
                .filter(|r| r.status == ProxyStatus::Quarantined)
                .min_by(|a, b| eviction_rank(a).cmp(&eviction_rank(b)))
                .map(|r| r.address.clone());

            let Some(victim) = victim else {
                return false;
            };
            match self.remove_if_status(&victim, ProxyStatus::Quarantined) {
                Ok(_) => {
                    info!("Evicted quarantined proxy {} to make room", victim);
                    return true;
                }
                // Raced with a re-check or removal; pick again.
                Err(_) => continue,
            }
        }
    }

    /// Write all admitted records as JSON.
    pub fn save_snapshot(&self, path: &Path) -> Result<usize, SnapshotError> {
        let records: Vec<ProxyRecord> = self
            .snapshot()
            .into_iter()
            .filter(|r| r.status != ProxyStatus::Candidate)
            .collect();
        let count = records.len();

        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &SnapshotFile { records })?;
        info!("Saved {} proxies to {}", count, path.display());
        Ok(count)
    }

    /// Load records written by [`PoolStore::save_snapshot`]. A missing file loads nothing.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize, SnapshotError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let snapshot: SnapshotFile = serde_json::from_reader(BufReader::new(file))?;

        let mut loaded = 0;
        for record in snapshot.records {
            if record.status == ProxyStatus::Candidate || loaded >= self.capacity {
                continue;
            }
            if self.insert_record(record) {
                loaded += 1;
            }
        }
        info!("Loaded {} proxies from {}", loaded, path.display());
        Ok(loaded)
    }
}

/// Lower ranks are evicted first: worst success rate, then oldest check.
fn eviction_rank(record: &ProxyRecord) -> (u64, Option<DateTime<Utc>>) {
    ((record.success_rate() * 1_000_000.0) as u64, record.last_checked_at)
}
