//! # Coordination Store
//!
//! Ownership records shared by every replica. A record decides which
//! replica executes the job behind a key; fencing tokens grow on every
//! takeover so a slow former holder can detect it was superseded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};

/// Lifecycle of an ownership record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Lease taken, job not started
    Pending,
    /// Holder passed fencing and runs the job
    Running,
    /// Job finished
    Done,
}

/// Decision about one job key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub job_key: String,
    pub owner_replica: String,
    pub fencing_token: u64,
    /// Event id every replica adopts for this job
    pub event_id: String,
    pub state: LeaseState,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OwnershipRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a lease acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller holds a pending lease with this token
    Acquired { token: u64 },
    /// Someone else holds the key; the current record is returned
    Held(OwnershipRecord),
}

/// Shared store of ownership records
pub trait CoordinationStore: Send + Sync {
    /// Take the lease for `job_key`.
    ///
    /// A missing record or an expired pending one is taken over with a
    /// higher fencing token. Any other record is reported as held.
    fn acquire(
        &self,
        job_key: &str,
        replica: &str,
        event_id: &str,
        ttl: Duration,
    ) -> ReplicationResult<AcquireOutcome>;

    /// Move `Pending -> Running` if `token` is still current
    fn fence(&self, job_key: &str, token: u64, ttl: Duration) -> ReplicationResult<bool>;

    /// Extend a running lease held with `token`
    fn renew(&self, job_key: &str, token: u64, ttl: Duration) -> ReplicationResult<bool>;

    /// Mark the job done if `token` is still current
    fn complete(&self, job_key: &str, token: u64) -> ReplicationResult<bool>;

    fn get(&self, job_key: &str) -> ReplicationResult<Option<OwnershipRecord>>;

    /// Drop settled records last touched more than `retention` ago
    fn sweep(&self, retention: Duration) -> ReplicationResult<usize>;
}

fn ttl_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

/// Store living in process memory, shared by replicas through an `Arc`
#[derive(Debug, Default)]
pub struct InMemoryCoordinationStore {
    records: Mutex<HashMap<String, OwnershipRecord>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_current<F>(&self, job_key: &str, token: u64, update: F) -> ReplicationResult<bool>
    where
        F: FnOnce(&mut OwnershipRecord),
    {
        let mut records = self.records.lock().map_err(|_| ReplicationError::poisoned())?;
        match records.get_mut(job_key) {
            Some(record) if record.fencing_token == token => {
                update(record);
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn acquire(
        &self,
        job_key: &str,
        replica: &str,
        event_id: &str,
        ttl: Duration,
    ) -> ReplicationResult<AcquireOutcome> {
        let mut records = self.records.lock().map_err(|_| ReplicationError::poisoned())?;
        let now = Utc::now();

        let token = match records.get(job_key) {
            None => 1,
            Some(record) if record.state == LeaseState::Pending && record.is_expired(now) => {
                record.fencing_token + 1
            }
            Some(record) => return Ok(AcquireOutcome::Held(record.clone())),
        };

        records.insert(
            job_key.to_string(),
            OwnershipRecord {
                job_key: job_key.to_string(),
                owner_replica: replica.to_string(),
                fencing_token: token,
                event_id: event_id.to_string(),
                state: LeaseState::Pending,
                expires_at: ttl_from(now, ttl),
                updated_at: now,
            },
        );
        Ok(AcquireOutcome::Acquired { token })
    }

    fn fence(&self, job_key: &str, token: u64, ttl: Duration) -> ReplicationResult<bool> {
        let mut records = self.records.lock().map_err(|_| ReplicationError::poisoned())?;
        let now = Utc::now();
        match records.get_mut(job_key) {
            Some(record) if record.fencing_token == token && record.state == LeaseState::Pending => {
                record.state = LeaseState::Running;
                record.expires_at = ttl_from(now, ttl);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, job_key: &str, token: u64, ttl: Duration) -> ReplicationResult<bool> {
        let mut renewed = false;
        self.with_current(job_key, token, |record| {
            if record.state == LeaseState::Running {
                record.expires_at = ttl_from(Utc::now(), ttl);
                renewed = true;
            }
        })?;
        Ok(renewed)
    }

    fn complete(&self, job_key: &str, token: u64) -> ReplicationResult<bool> {
        self.with_current(job_key, token, |record| {
            record.state = LeaseState::Done;
        })
    }

    fn get(&self, job_key: &str) -> ReplicationResult<Option<OwnershipRecord>> {
        let records = self.records.lock().map_err(|_| ReplicationError::poisoned())?;
        Ok(records.get(job_key).cloned())
    }

    fn sweep(&self, retention: Duration) -> ReplicationResult<usize> {
        let mut records = self.records.lock().map_err(|_| ReplicationError::poisoned())?;
        let now = Utc::now();
        let horizon = now
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());

        let before = records.len();
        records.retain(|_, record| {
            let settled = record.state == LeaseState::Done || record.is_expired(now);
            !(settled && record.updated_at < horizon)
        });
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_first_acquire_wins() {
        let store = InMemoryCoordinationStore::new();
        assert_eq!(
            store.acquire("job", "a", "e-a", TTL).unwrap(),
            AcquireOutcome::Acquired { token: 1 }
        );
        match store.acquire("job", "b", "e-b", TTL).unwrap() {
            AcquireOutcome::Held(record) => {
                assert_eq!(record.owner_replica, "a");
                assert_eq!(record.event_id, "e-a");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expired_pending_is_taken_over() {
        let store = InMemoryCoordinationStore::new();
        store.acquire("job", "a", "e-a", Duration::ZERO).unwrap();

        assert_eq!(
            store.acquire("job", "b", "e-b", TTL).unwrap(),
            AcquireOutcome::Acquired { token: 2 }
        );
        // the superseded holder can no longer fence
        assert!(!store.fence("job", 1, TTL).unwrap());
        assert!(store.fence("job", 2, TTL).unwrap());
    }

    #[test]
    fn test_running_record_is_never_taken_over() {
        let store = InMemoryCoordinationStore::new();
        store.acquire("job", "a", "e-a", TTL).unwrap();
        assert!(store.fence("job", 1, Duration::ZERO).unwrap());

        assert!(matches!(
            store.acquire("job", "b", "e-b", TTL).unwrap(),
            AcquireOutcome::Held(OwnershipRecord {
                state: LeaseState::Running,
                ..
            })
        ));
    }

    #[test]
    fn test_complete_and_sweep() {
        let store = InMemoryCoordinationStore::new();
        store.acquire("job", "a", "e-a", TTL).unwrap();
        store.fence("job", 1, TTL).unwrap();
        assert!(store.renew("job", 1, TTL).unwrap());
        assert!(store.complete("job", 1).unwrap());
        assert_eq!(store.get("job").unwrap().unwrap().state, LeaseState::Done);

        assert_eq!(store.sweep(Duration::from_secs(60)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.sweep(Duration::ZERO).unwrap(), 1);
        assert!(store.is_empty());
    }
}
