// 试用记录存储抽象
//
// Every backend answers a point lookup with a tagged result:
// Found(grant) / NotFound on success, StoreError on a genuine fault.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::models::trial::{ConditionalGrant, TrialAttempt, TrialGrant, TrialLookup};

/// Capability contract for the record store that holds trial grants.
pub trait TrialStore: Send + Sync {
    /// Point lookup by identifier.
    fn lookup<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<TrialLookup, StoreError>>;

    /// Insert or replace the record keyed by `grant.identifier`.
    fn upsert<'a>(&'a self, grant: &'a TrialGrant) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Atomically write `grant` unless an active grant (expiry after `now`)
    /// already exists for the identifier.
    fn grant_if_eligible<'a>(
        &'a self,
        grant: &'a TrialGrant,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<ConditionalGrant, StoreError>>;

    /// Append one entry to the attempts log.
    fn append_attempt<'a>(
        &'a self,
        attempt: &'a TrialAttempt,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

pub type SharedTrialStore = Arc<dyn TrialStore>;

// ============================================================================
// MemoryTrialStore
// ============================================================================

/// In-process store. Backs the `memory` backend and the test suites.
///
/// Meant for tests and local development only: nothing survives a restart and
/// the attempts log is never pruned, so `audit_log` mode grows it without bound.
#[derive(Default)]
pub struct MemoryTrialStore {
    grants: DashMap<String, TrialGrant>,
    attempts: Mutex<Vec<TrialAttempt>>,
}

impl MemoryTrialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &str) -> Option<TrialGrant> {
        self.grants.get(identifier).map(|g| g.value().clone())
    }

    pub fn insert(&self, grant: TrialGrant) {
        self.grants.insert(grant.identifier.clone(), grant);
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn attempts(&self) -> Vec<TrialAttempt> {
        self.attempts.lock().clone()
    }
}

impl TrialStore for MemoryTrialStore {
    fn lookup<'a>(&'a self, identifier: &'a str) -> BoxFuture<'a, Result<TrialLookup, StoreError>> {
        let result = match self.get(identifier) {
            Some(grant) => TrialLookup::Found(grant),
            None => TrialLookup::NotFound,
        };
        futures::future::ready(Ok(result)).boxed()
    }

    fn upsert<'a>(&'a self, grant: &'a TrialGrant) -> BoxFuture<'a, Result<(), StoreError>> {
        self.insert(grant.clone());
        futures::future::ready(Ok(())).boxed()
    }

    fn grant_if_eligible<'a>(
        &'a self,
        grant: &'a TrialGrant,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<ConditionalGrant, StoreError>> {
        // The entry guard holds the shard lock for the whole check-and-write.
        let result = match self.grants.entry(grant.identifier.clone()) {
            Entry::Occupied(existing) if existing.get().is_active(now) => {
                ConditionalGrant::Active(existing.get().clone())
            }
            Entry::Occupied(mut expired) => {
                expired.insert(grant.clone());
                ConditionalGrant::Inserted(grant.clone())
            }
            Entry::Vacant(slot) => {
                slot.insert(grant.clone());
                ConditionalGrant::Inserted(grant.clone())
            }
        };
        futures::future::ready(Ok(result)).boxed()
    }

    fn append_attempt<'a>(
        &'a self,
        attempt: &'a TrialAttempt,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.attempts.lock().push(attempt.clone());
        futures::future::ready(Ok(())).boxed()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
