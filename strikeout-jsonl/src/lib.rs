//! JSON-lines backends for `strikeout`.
//!
//! - [`JsonlAttemptStore`]: durable attempt ledger. Every increment appends the full
//!   updated record as one line; opening the file replays it.
//! - [`JsonlSink`]: gate event sink writing one event per line.
//!
//! Ledger line layout:
//!
//! ```text
//! {"job_id":"nightly","resource_id":"visit-1","attempt_count":2,"last_outcome":"failure","last_error":"timeout","updated_at":1700000000000}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use strikeout::clock::{Clock, SystemClock};
use strikeout::store::validate_key;
use strikeout::telemetry::{GateEvent, GateSink};
use strikeout::{AttemptOutcome, AttemptRecord, AttemptStore, JobId, ResourceId, StoreError};
use tokio::io::AsyncWriteExt;

type Key = (JobId, ResourceId);

#[derive(Debug, Serialize, Deserialize)]
struct LedgerLine {
    job_id: JobId,
    resource_id: ResourceId,
    #[serde(flatten)]
    record: AttemptRecord,
}

/// One ledger key: `writer` orders increments, `committed` is what readers see.
#[derive(Debug, Default)]
struct KeyState {
    writer: tokio::sync::Mutex<()>,
    committed: Mutex<AttemptRecord>,
}

/// The file handle plus the length of its last complete line.
#[derive(Debug)]
struct AppendLog {
    file: tokio::fs::File,
    len: u64,
    /// Set when a failed append could not be cut back off the file.
    torn: bool,
}

/// Attempt ledger persisted as an append-only JSON-lines file.
///
/// Increments on the same key are linearized by a per-key lock, so the file holds that
/// key's counts in increasing order. Increments on different keys only meet at the
/// append lock, which is held for the write and flush of a single line. Reads never
/// touch the file; they see a record only after its line has been flushed.
#[derive(Clone, Debug)]
pub struct JsonlAttemptStore {
    path: PathBuf,
    keys: Arc<RwLock<HashMap<Key, Arc<KeyState>>>>,
    log: Arc<tokio::sync::Mutex<AppendLog>>,
    clock: Arc<dyn Clock>,
}

impl JsonlAttemptStore {
    /// Open (or create) the ledger at `path`, replaying existing lines.
    ///
    /// A last line cut off by a crash mid-append is removed from the file before
    /// replay, so the next append starts on a fresh line.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, SystemClock).await
    }

    pub async fn open_with_clock<C>(path: impl AsRef<Path>, clock: C) -> Result<Self, StoreError>
    where
        C: Clock + 'static,
    {
        let path = path.as_ref().to_path_buf();
        let mut bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(io_unavailable(&path, err)),
        };
        let tail = Tail::of(&bytes);
        if let Tail::Torn { keep } = tail {
            tracing::warn!(
                target: "strikeout::store",
                path = %path.display(),
                dropped_bytes = bytes.len() - keep,
                "dropping incomplete last ledger line"
            );
            let file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|err| io_unavailable(&path, err))?;
            file.set_len(keep as u64).await.map_err(|err| io_unavailable(&path, err))?;
            bytes.truncate(keep);
        }

        let records = replay(&path, &String::from_utf8_lossy(&bytes));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| io_unavailable(&path, err))?;
        if tail == Tail::Unterminated {
            write_line(&mut file, b"\n").await.map_err(|err| io_unavailable(&path, err))?;
        }
        let len = file.metadata().await.map_err(|err| io_unavailable(&path, err))?.len();

        tracing::debug!(
            target: "strikeout::store",
            path = %path.display(),
            keys = records.len(),
            "jsonl ledger opened"
        );
        let keys = records
            .into_iter()
            .map(|(key, record)| (key, Arc::new(KeyState { committed: Mutex::new(record), ..KeyState::default() })))
            .collect();
        Ok(Self {
            path,
            keys: Arc::new(RwLock::new(keys)),
            log: Arc::new(tokio::sync::Mutex::new(AppendLog { file, len, torn: false })),
            clock: Arc::new(clock),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn existing(&self, key: &Key) -> Result<Option<Arc<KeyState>>, StoreError> {
        let keys = self.keys.read().map_err(|_| poisoned())?;
        Ok(keys.get(key).cloned())
    }

    fn state(&self, key: Key) -> Result<Arc<KeyState>, StoreError> {
        if let Some(state) = self.existing(&key)? {
            return Ok(state);
        }
        let mut keys = self.keys.write().map_err(|_| poisoned())?;
        Ok(keys.entry(key).or_default().clone())
    }

    /// Append one complete line. On failure the partial line is cut off again.
    async fn append(&self, line: &[u8]) -> Result<(), StoreError> {
        let mut log = self.log.lock().await;
        if log.torn {
            return Err(StoreError::unavailable(format!(
                "{}: ledger tail is damaged; reopen the store",
                self.path.display()
            )));
        }
        let start = log.len;
        let written = write_line(&mut log.file, line).await;
        match written {
            Ok(()) => {
                log.len = start + line.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(cut) = log.file.set_len(start).await {
                    log.torn = true;
                    tracing::error!(
                        target: "strikeout::store",
                        path = %self.path.display(),
                        error = %cut,
                        "could not remove partial ledger line"
                    );
                }
                Err(io_unavailable(&self.path, err))
            }
        }
    }
}

/// How the ledger file ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Empty, or ends with a newline.
    Clean,
    /// The last line is whole but lacks its newline.
    Unterminated,
    /// The last line is cut off; only the first `keep` bytes are complete lines.
    Torn { keep: usize },
}

impl Tail {
    fn of(bytes: &[u8]) -> Self {
        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let rest = &bytes[keep..];
        if rest.iter().all(u8::is_ascii_whitespace) {
            Tail::Clean
        } else if serde_json::from_slice::<LedgerLine>(rest).is_ok() {
            Tail::Unterminated
        } else {
            Tail::Torn { keep }
        }
    }
}

async fn write_line(file: &mut tokio::fs::File, line: &[u8]) -> io::Result<()> {
    file.write_all(line).await?;
    file.flush().await
}

/// Rebuild the ledger; the highest count per key wins, malformed lines are skipped.
fn replay(path: &Path, contents: &str) -> HashMap<Key, AttemptRecord> {
    let mut records: HashMap<Key, AttemptRecord> = HashMap::new();
    for (n, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerLine = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    target: "strikeout::store",
                    path = %path.display(),
                    line = n + 1,
                    error = %err,
                    "skipping malformed ledger line"
                );
                continue;
            }
        };
        let key = (entry.job_id, entry.resource_id);
        let newer = records.get(&key).map_or(true, |seen| seen.attempt_count < entry.record.attempt_count);
        if newer {
            records.insert(key, entry.record);
        }
    }
    records
}

fn io_unavailable(path: &Path, err: io::Error) -> StoreError {
    StoreError::unavailable(format!("{}: {}", path.display(), err))
}

fn poisoned() -> StoreError {
    StoreError::unavailable("attempt ledger lock poisoned")
}

fn committed(state: &KeyState) -> Result<AttemptRecord, StoreError> {
    Ok(state.committed.lock().map_err(|_| poisoned())?.clone())
}

#[async_trait]
impl AttemptStore for JsonlAttemptStore {
    async fn get(&self, job: &JobId, resource: &ResourceId) -> Result<AttemptRecord, StoreError> {
        validate_key(job, resource)?;
        match self.existing(&(job.clone(), resource.clone()))? {
            Some(state) => committed(&state),
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
        let state = self.state((job.clone(), resource.clone()))?;
        let _turn = state.writer.lock().await;
        let next = committed(&state)?.advanced(&outcome, self.clock.now_millis());

        let line = LedgerLine { job_id: job.clone(), resource_id: resource.clone(), record: next };
        let mut bytes = serde_json::to_vec(&line)
            .map_err(|err| StoreError::unavailable(format!("encode ledger line: {}", err)))?;
        bytes.push(b'\n');
        self.append(&bytes).await?;

        // Only a durable line advances the view readers see.
        *state.committed.lock().map_err(|_| poisoned())? = line.record.clone();
        Ok(line.record)
    }

    async fn snapshot(&self, job: &JobId) -> Result<Vec<(ResourceId, AttemptRecord)>, StoreError> {
        let matching: Vec<(ResourceId, Arc<KeyState>)> = {
            let keys = self.keys.read().map_err(|_| poisoned())?;
            keys.iter()
                .filter(|((j, _), _)| j == job)
                .map(|((_, r), state)| (r.clone(), state.clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(matching.len());
        for (resource, state) in matching {
            let record = committed(&state)?;
            // A key whose first append is still in flight (or failed) has nothing durable yet.
            if record.attempt_count > 0 {
                out.push((resource, record));
            }
        }
        out.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Ok(out)
    }

    async fn get_many(
        &self,
        job: &JobId,
        resources: &[ResourceId],
    ) -> Result<Vec<AttemptRecord>, StoreError> {
        for resource in resources {
            validate_key(job, resource)?;
        }
        let states: Vec<Option<Arc<KeyState>>> = {
            let keys = self.keys.read().map_err(|_| poisoned())?;
            resources.iter().map(|r| keys.get(&(job.clone(), r.clone())).cloned()).collect()
        };
        states
            .iter()
            .map(|state| match state {
                Some(state) => committed(state),
                None => Ok(AttemptRecord::zero()),
            })
            .collect()
    }
}

/// Gate event sink appending one JSON object per line.
#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: String,
}

impl JsonlSink {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }
}

impl tower_service::Service<GateEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GateEvent) -> Self::Future {
        let path = self.path.clone();
        let line = event_to_json(&event).to_string() + "\n";
        Box::pin(async move {
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

impl GateSink for JsonlSink {
    type SinkError = io::Error;
}

fn event_to_json(event: &GateEvent) -> serde_json::Value {
    match event {
        GateEvent::Allowed { job_id, resource_id } => {
            json!({ "kind": "allowed", "job_id": job_id, "resource_id": resource_id })
        }
        GateEvent::Skipped { job_id, resource_id, reason } => json!({
            "kind": "skipped",
            "job_id": job_id,
            "resource_id": resource_id,
            "reason": reason.to_string(),
        }),
        GateEvent::Recorded { job_id, resource_id, outcome, attempt_count } => json!({
            "kind": "recorded",
            "job_id": job_id,
            "resource_id": resource_id,
            "outcome": outcome,
            "attempt_count": attempt_count,
        }),
        GateEvent::StoreDegraded { job_id, resource_id, reason, mode } => json!({
            "kind": "store_degraded",
            "job_id": job_id,
            "resource_id": resource_id,
            "reason": reason,
            "mode": mode,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_classification() {
        let whole = br#"{"job_id":"j","resource_id":"r","attempt_count":1,"last_outcome":"success","last_error":null,"updated_at":1}"#;
        assert_eq!(Tail::of(b""), Tail::Clean);
        assert_eq!(Tail::of(b"x\n"), Tail::Clean);
        assert_eq!(Tail::of(whole), Tail::Unterminated);
        assert_eq!(Tail::of(b"a\n{\"job_id\":\"ni"), Tail::Torn { keep: 2 });
        assert_eq!(Tail::of(b"{\"job"), Tail::Torn { keep: 0 });
    }

    #[tokio::test]
    async fn failed_append_does_not_advance_the_view() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.jsonl");
        let store = JsonlAttemptStore::open(&path).await.unwrap();
        // A read-only handle makes every write fail.
        store.log.lock().await.file = tokio::fs::File::open(&path).await.unwrap();

        let (job, visit) = (JobId::from("nightly"), ResourceId::from("visit-1"));
        let err = store.increment(&job, &visit, AttemptOutcome::Success).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(store.get(&job, &visit).await.unwrap().attempt_count, 0);
        assert!(store.snapshot(&job).await.unwrap().is_empty());
        assert!(store.increment(&job, &visit, AttemptOutcome::Success).await.unwrap_err().is_unavailable());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
