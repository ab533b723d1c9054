use crate::clock::{Clock, SystemClock};
use crate::context::{JobId, ResourceId};
use crate::error::StoreError;
use crate::store::{validate_key, AttemptOutcome, AttemptRecord, AttemptStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

type Key = (JobId, ResourceId);
type Entry = Arc<Mutex<AttemptRecord>>;

/// Simple in-memory attempt ledger.
///
/// The outer map lock is only held long enough to find or insert an entry;
/// each entry carries its own mutex, so increments on different keys never
/// wait on each other while increments on the same key are linearized.
#[derive(Clone, Debug)]
pub struct InMemoryAttemptStore {
    entries: Arc<RwLock<HashMap<Key, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryAttemptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Use a custom clock for `updated_at` stamps.
    pub fn with_clock<C>(clock: C) -> Self
    where
        C: Clock + 'static,
    {
        Self { entries: Arc::new(RwLock::new(HashMap::new())), clock: Arc::new(clock) }
    }

    /// Number of keys with at least one recorded attempt.
    pub fn len(&self) -> usize {
        self.entries.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing(&self, key: &Key) -> Result<Option<Entry>, StoreError> {
        let map = self.entries.read().map_err(|_| poisoned())?;
        Ok(map.get(key).cloned())
    }

    fn entry(&self, key: Key) -> Result<Entry, StoreError> {
        if let Some(entry) = self.existing(&key)? {
            return Ok(entry);
        }
        let mut map = self.entries.write().map_err(|_| poisoned())?;
        Ok(map.entry(key).or_default().clone())
    }
}

fn poisoned() -> StoreError {
    StoreError::unavailable("attempt ledger lock poisoned")
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn get(&self, job: &JobId, resource: &ResourceId) -> Result<AttemptRecord, StoreError> {
        validate_key(job, resource)?;
        match self.existing(&(job.clone(), resource.clone()))? {
            Some(entry) => {
                let record = entry.lock().map_err(|_| poisoned())?;
                Ok(record.clone())
            }
            None => Ok(AttemptRecord::zero()),
        }
    }

    async fn increment(
        &self,
        job: &JobId,
        resource: &ResourceId,
        outcome: AttemptOutcome,
    ) -> Result<AttemptRecord, StoreError> {
        validate_key(job, resource)?;
        let entry = self.entry((job.clone(), resource.clone()))?;
        let mut record = entry.lock().map_err(|_| poisoned())?;
        *record = record.advanced(&outcome, self.clock.now_millis());
        tracing::trace!(
            target: "strikeout::store",
            job = %job,
            resource = %resource,
            attempts = record.attempt_count,
            "attempt recorded"
        );
        Ok(record.clone())
    }

    async fn snapshot(&self, job: &JobId) -> Result<Vec<(ResourceId, AttemptRecord)>, StoreError> {
        let matching: Vec<(ResourceId, Entry)> = {
            let map = self.entries.read().map_err(|_| poisoned())?;
            map.iter()
                .filter(|((j, _), _)| j == job)
                .map(|((_, r), entry)| (r.clone(), entry.clone()))
                .collect()
        };
        let mut records = Vec::with_capacity(matching.len());
        for (resource, entry) in matching {
            let record = entry.lock().map_err(|_| poisoned())?.clone();
            records.push((resource, record));
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}
