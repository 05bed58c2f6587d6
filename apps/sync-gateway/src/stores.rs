//! Collaborator seams consumed by the gateway.
//!
//! Each trait is backed by a real service in production (document database,
//! authorization engine, CRDT merge worker, Redis, analytics warehouse) and
//! by the in-memory implementations below in tests and the dev binary. The
//! gateway itself never holds authoritative shared state behind these seams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::gateway::rooms::SpaceAction;

/// Result of a diff request: the update bytes the client is missing plus the
/// timestamp of the newest update folded into them.
#[derive(Debug, Clone)]
pub struct DocDiff {
    pub state: Vec<u8>,
    pub timestamp: i64,
}

/// Durable document update log, one instance per space kind.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Append updates to a document's log. Returns the logical timestamp
    /// assigned to the batch; timestamps are monotonically increasing per
    /// document.
    async fn push_doc_updates(
        &self,
        space_id: &str,
        doc_id: &str,
        updates: &[Vec<u8>],
        editor: &str,
    ) -> Result<i64, SyncError>;

    /// Compute the updates a client is missing given its state vector.
    /// `None` when the document does not exist.
    async fn get_doc_diff(
        &self,
        space_id: &str,
        doc_id: &str,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<DocDiff>, SyncError>;

    async fn delete_doc(&self, space_id: &str, doc_id: &str) -> Result<(), SyncError>;

    /// Latest update timestamp per document in a space, optionally limited
    /// to documents updated after `after`.
    async fn get_space_doc_timestamps(
        &self,
        space_id: &str,
        after: Option<i64>,
    ) -> Result<HashMap<String, i64>, SyncError>;
}

/// Authorization engine for workspace access.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn assert_accessible(
        &self,
        space_id: &str,
        user_id: &str,
        action: SpaceAction,
    ) -> Result<(), SyncError>;
}

/// Binary CRDT merge routine; combines several update deltas into one.
#[async_trait]
pub trait UpdateMerger: Send + Sync {
    async fn merge(&self, updates: Vec<Vec<u8>>) -> Result<Vec<u8>, SyncError>;
}

/// Document metadata lookups; only the block flag matters to the gateway.
#[async_trait]
pub trait DocMeta: Send + Sync {
    async fn is_blocked(&self, space_id: &str, doc_id: &str) -> Result<bool, SyncError>;
}

/// Shared key-value counter with expiry, used for connect rate limiting.
/// Backed by Redis INCR/EXPIRE in production.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment and return the post-increment count.
    async fn increment(&self, key: &str) -> Result<u64, SyncError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), SyncError>;
}

/// Observability sink for the distinct-active-user metric.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn upsert_active_users_minute(
        &self,
        minute: DateTime<Utc>,
        count: u64,
    ) -> Result<(), SyncError>;
}

/// One live connection as seen by the cluster-wide directory.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub conn_id: String,
    pub user_id: Option<String>,
}

/// Enumerates live connections across every gateway process, for presence
/// sampling. The single-process implementation reads the local registry.
#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    async fn list_connections(&self) -> Result<Vec<ConnectionSnapshot>, SyncError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations (tests and the dev binary)
// ---------------------------------------------------------------------------

struct DocLog {
    updates: Vec<Vec<u8>>,
    last_timestamp: i64,
}

/// In-memory append-only document store.
pub struct MemoryDocStore {
    docs: Mutex<HashMap<(String, String), DocLog>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
        }
    }

    /// The raw stored update log, for assertions in tests.
    pub fn update_log(&self, space_id: &str, doc_id: &str) -> Vec<Vec<u8>> {
        self.docs
            .lock()
            .get(&(space_id.to_string(), doc_id.to_string()))
            .map(|log| log.updates.clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryDocStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn push_doc_updates(
        &self,
        space_id: &str,
        doc_id: &str,
        updates: &[Vec<u8>],
        _editor: &str,
    ) -> Result<i64, SyncError> {
        let mut docs = self.docs.lock();
        let log = docs
            .entry((space_id.to_string(), doc_id.to_string()))
            .or_insert_with(|| DocLog {
                updates: Vec::new(),
                last_timestamp: 0,
            });
        log.updates.extend(updates.iter().cloned());
        log.last_timestamp += 1;
        Ok(log.last_timestamp)
    }

    async fn get_doc_diff(
        &self,
        space_id: &str,
        doc_id: &str,
        _state_vector: Option<&[u8]>,
    ) -> Result<Option<DocDiff>, SyncError> {
        let docs = self.docs.lock();
        let log = match docs.get(&(space_id.to_string(), doc_id.to_string())) {
            Some(log) => log,
            None => return Ok(None),
        };
        // The real store computes a state-vector diff; here the full
        // concatenated log stands in for it.
        let state = log.updates.concat();
        Ok(Some(DocDiff {
            state,
            timestamp: log.last_timestamp,
        }))
    }

    async fn delete_doc(&self, space_id: &str, doc_id: &str) -> Result<(), SyncError> {
        self.docs
            .lock()
            .remove(&(space_id.to_string(), doc_id.to_string()));
        Ok(())
    }

    async fn get_space_doc_timestamps(
        &self,
        space_id: &str,
        after: Option<i64>,
    ) -> Result<HashMap<String, i64>, SyncError> {
        let docs = self.docs.lock();
        let mut out = HashMap::new();
        for ((space, doc), log) in docs.iter() {
            if space != space_id {
                continue;
            }
            if let Some(after) = after {
                if log.last_timestamp <= after {
                    continue;
                }
            }
            out.insert(doc.clone(), log.last_timestamp);
        }
        Ok(out)
    }
}

/// Allow-by-default access control with an explicit deny list. Tracks the
/// number of checks performed so tests can assert join idempotency.
pub struct MemoryAccessControl {
    denied: Mutex<HashSet<(String, String)>>,
    calls: AtomicU64,
}

impl MemoryAccessControl {
    pub fn new() -> Self {
        Self {
            denied: Mutex::new(HashSet::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn deny(&self, space_id: &str, user_id: &str) {
        self.denied
            .lock()
            .insert((space_id.to_string(), user_id.to_string()));
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Default for MemoryAccessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessControl for MemoryAccessControl {
    async fn assert_accessible(
        &self,
        space_id: &str,
        user_id: &str,
        _action: SpaceAction,
    ) -> Result<(), SyncError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self
            .denied
            .lock()
            .contains(&(space_id.to_string(), user_id.to_string()))
        {
            Err(SyncError::AccessDenied {
                space_id: space_id.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Stand-in merge: frames every update with a big-endian length prefix.
/// `split` reverses it, which lets tests check compression transparency.
pub struct ConcatMerger;

impl ConcatMerger {
    pub fn split(merged: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = merged;
        while rest.len() >= 4 {
            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            rest = &rest[4..];
            if rest.len() < len {
                break;
            }
            out.push(rest[..len].to_vec());
            rest = &rest[len..];
        }
        out
    }
}

#[async_trait]
impl UpdateMerger for ConcatMerger {
    async fn merge(&self, updates: Vec<Vec<u8>>) -> Result<Vec<u8>, SyncError> {
        let mut merged = Vec::new();
        for update in updates {
            merged.extend_from_slice(&(update.len() as u32).to_be_bytes());
            merged.extend_from_slice(&update);
        }
        Ok(merged)
    }
}

/// Merger that always fails, for exercising the uncompressed fallback.
pub struct FailingMerger;

#[async_trait]
impl UpdateMerger for FailingMerger {
    async fn merge(&self, _updates: Vec<Vec<u8>>) -> Result<Vec<u8>, SyncError> {
        Err(SyncError::internal("merge worker unavailable"))
    }
}

/// In-memory document metadata with a block-flag set.
pub struct MemoryDocMeta {
    blocked: Mutex<HashSet<(String, String)>>,
}

impl MemoryDocMeta {
    pub fn new() -> Self {
        Self {
            blocked: Mutex::new(HashSet::new()),
        }
    }

    pub fn block(&self, space_id: &str, doc_id: &str) {
        self.blocked
            .lock()
            .insert((space_id.to_string(), doc_id.to_string()));
    }
}

impl Default for MemoryDocMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocMeta for MemoryDocMeta {
    async fn is_blocked(&self, space_id: &str, doc_id: &str) -> Result<bool, SyncError> {
        Ok(self
            .blocked
            .lock()
            .contains(&(space_id.to_string(), doc_id.to_string())))
    }
}

struct CounterEntry {
    count: u64,
    expires_at: Option<Instant>,
}

/// In-memory counter with expiry semantics matching Redis INCR/EXPIRE.
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, SyncError> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: None,
        });
        if let Some(expires_at) = entry.expires_at {
            if Instant::now() >= expires_at {
                entry.count = 0;
                entry.expires_at = None;
            }
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), SyncError> {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

/// In-memory analytics sink recording every minute sample.
pub struct MemoryAnalyticsSink {
    samples: Mutex<BTreeMap<DateTime<Utc>, u64>>,
}

impl MemoryAnalyticsSink {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn samples(&self) -> Vec<(DateTime<Utc>, u64)> {
        self.samples
            .lock()
            .iter()
            .map(|(minute, count)| (*minute, *count))
            .collect()
    }
}

impl Default for MemoryAnalyticsSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalyticsSink {
    async fn upsert_active_users_minute(
        &self,
        minute: DateTime<Utc>,
        count: u64,
    ) -> Result<(), SyncError> {
        self.samples.lock().insert(minute, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn doc_store_assigns_monotonic_timestamps() {
        let store = MemoryDocStore::new();
        let t1 = store
            .push_doc_updates("w1", "d1", &[vec![1]], "u1")
            .await
            .unwrap();
        let t2 = store
            .push_doc_updates("w1", "d1", &[vec![2]], "u1")
            .await
            .unwrap();
        assert!(t2 > t1);
        assert_eq!(store.update_log("w1", "d1"), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn doc_diff_missing_doc_is_none() {
        let store = MemoryDocStore::new();
        assert!(store.get_doc_diff("w1", "nope", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn doc_timestamps_filter_by_after() {
        let store = MemoryDocStore::new();
        store.push_doc_updates("w1", "d1", &[vec![1]], "u1").await.unwrap();
        store.push_doc_updates("w1", "d2", &[vec![1]], "u1").await.unwrap();
        store.push_doc_updates("w1", "d2", &[vec![2]], "u1").await.unwrap();

        let all = store.get_space_doc_timestamps("w1", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let recent = store.get_space_doc_timestamps("w1", Some(1)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent["d2"], 2);
    }

    #[tokio::test]
    async fn delete_doc_drops_the_log() {
        let store = MemoryDocStore::new();
        store.push_doc_updates("w1", "d1", &[vec![1]], "u1").await.unwrap();
        store.delete_doc("w1", "d1").await.unwrap();
        assert!(store.get_doc_diff("w1", "d1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concat_merger_round_trips() {
        let updates = vec![vec![1, 2, 3], vec![], vec![4]];
        let merged = ConcatMerger.merge(updates.clone()).await.unwrap();
        assert_eq!(ConcatMerger::split(&merged), updates);
    }

    #[tokio::test]
    async fn counter_resets_after_expiry() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("k").await.unwrap(), 1);
        assert_eq!(store.increment("k").await.unwrap(), 2);

        store.expire("k", Duration::from_millis(0)).await.unwrap();
        // Window already elapsed, so the next increment starts a new one.
        assert_eq!(store.increment("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn analytics_upsert_overwrites_same_minute() {
        let sink = MemoryAnalyticsSink::new();
        let minute = sync_common::truncate_to_minute(Utc::now());
        sink.upsert_active_users_minute(minute, 3).await.unwrap();
        sink.upsert_active_users_minute(minute, 5).await.unwrap();
        assert_eq!(sink.samples(), vec![(minute, 5)]);
    }
}
