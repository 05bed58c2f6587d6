//! Cluster-wide distinct-active-user presence tracking.
//!
//! Each connection gets a user tag at admission; the tracker periodically
//! enumerates every connection in the cluster through the directory
//! collaborator, dedupes by user id, and upserts the count for the current
//! wall-clock minute. When any connection lacks a tag the tracker falls back
//! to the raw connection count — it overcounts rather than undercounts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time;

use crate::error::SyncError;
use crate::gateway::registry::ConnectionRegistry;
use crate::stores::{AnalyticsSink, ConnectionDirectory};

pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn ConnectionDirectory>,
    analytics: Arc<dyn AnalyticsSink>,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn ConnectionDirectory>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        Self {
            registry,
            directory,
            analytics,
        }
    }

    /// Tag a connection with its authenticated user id.
    pub fn attach(&self, conn_id: &str, user_id: &str) {
        self.registry.attach_user(conn_id, user_id);
    }

    /// Count distinct active users across the whole cluster.
    pub async fn sample(&self) -> Result<u64, SyncError> {
        let connections = self.directory.list_connections().await?;
        let total = connections.len();

        let mut users: HashSet<String> = HashSet::new();
        let mut untagged = 0usize;
        for conn in connections {
            match conn.user_id {
                Some(user_id) => {
                    users.insert(user_id);
                }
                None => untagged += 1,
            }
        }

        if untagged > 0 {
            tracing::warn!(
                untagged,
                total,
                "connections without a user tag; falling back to raw connection count"
            );
            return Ok(total as u64);
        }
        Ok(users.len() as u64)
    }

    /// Sample and upsert the active-users-minute record. Aggregation
    /// failures degrade to the local connection count and are never fatal.
    pub async fn flush(&self) {
        let count = match self.sample().await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(%err, "presence aggregation failed; using local connection count");
                self.registry.len() as u64
            }
        };

        let minute = sync_common::truncate_to_minute(Utc::now());
        if let Err(err) = self.analytics.upsert_active_users_minute(minute, count).await {
            tracing::warn!(%err, "failed to upsert active-users-minute sample");
        }
    }

    /// Disconnect hot path: skip the cluster aggregation, log the local
    /// count only.
    pub fn note_disconnect(&self) {
        tracing::debug!(local_connections = self.registry.len(), "connection closed");
    }

    /// Periodic flush loop; exits when the shutdown signal flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut timer = time::interval(interval);
        timer.tick().await; // First tick fires immediately; skip it.
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.flush().await;
                }
                _ = shutdown.changed() => {
                    tracing::debug!("presence flush loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{ConnectionSnapshot, MemoryAnalyticsSink};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Directory returning a fixed connection list, standing in for the
    /// cluster-wide view.
    struct FixedDirectory(Vec<ConnectionSnapshot>);

    #[async_trait]
    impl ConnectionDirectory for FixedDirectory {
        async fn list_connections(&self) -> Result<Vec<ConnectionSnapshot>, SyncError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDirectory;

    #[async_trait]
    impl ConnectionDirectory for FailingDirectory {
        async fn list_connections(&self) -> Result<Vec<ConnectionSnapshot>, SyncError> {
            Err(SyncError::internal("registry unavailable"))
        }
    }

    fn snap(conn_id: &str, user_id: Option<&str>) -> ConnectionSnapshot {
        ConnectionSnapshot {
            conn_id: conn_id.to_string(),
            user_id: user_id.map(str::to_string),
        }
    }

    fn tracker_with(directory: Arc<dyn ConnectionDirectory>) -> (PresenceTracker, Arc<MemoryAnalyticsSink>) {
        let analytics = Arc::new(MemoryAnalyticsSink::new());
        let tracker = PresenceTracker::new(
            Arc::new(ConnectionRegistry::new()),
            directory,
            analytics.clone(),
        );
        (tracker, analytics)
    }

    #[tokio::test]
    async fn sample_dedupes_by_user_id() {
        let directory = Arc::new(FixedDirectory(vec![
            snap("c1", Some("u1")),
            snap("c2", Some("u1")),
            snap("c3", Some("u2")),
        ]));
        let (tracker, _) = tracker_with(directory);
        assert_eq!(tracker.sample().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn untagged_connection_falls_back_to_raw_count() {
        // Same user on two connections plus one untagged connection: the
        // fail-open path reports 3, not 2.
        let directory = Arc::new(FixedDirectory(vec![
            snap("c1", Some("u1")),
            snap("c2", Some("u1")),
            snap("c3", None),
        ]));
        let (tracker, _) = tracker_with(directory);
        assert_eq!(tracker.sample().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_cluster_samples_zero() {
        let (tracker, _) = tracker_with(Arc::new(FixedDirectory(Vec::new())));
        assert_eq!(tracker.sample().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_upserts_minute_sample() {
        let directory = Arc::new(FixedDirectory(vec![
            snap("c1", Some("u1")),
            snap("c2", Some("u2")),
        ]));
        let (tracker, analytics) = tracker_with(directory);

        tracker.flush().await;
        tracker.flush().await; // Same minute: upsert, not append.

        let samples = analytics.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].1, 2);
    }

    #[tokio::test]
    async fn flush_survives_directory_failure_with_local_count() {
        let analytics = Arc::new(MemoryAnalyticsSink::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("c1".to_string(), tx);

        let tracker = PresenceTracker::new(
            registry,
            Arc::new(FailingDirectory),
            analytics.clone(),
        );
        tracker.flush().await;

        let samples = analytics.samples();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].1, 1); // local connection count
    }

    #[tokio::test]
    async fn attach_tags_local_registry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("c1".to_string(), tx);

        let analytics = Arc::new(MemoryAnalyticsSink::new());
        let tracker = PresenceTracker::new(registry.clone(), registry.clone(), analytics);
        tracker.attach("c1", "u1");

        assert_eq!(registry.user_of("c1").as_deref(), Some("u1"));
        assert_eq!(tracker.sample().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (tracker, _) = tracker_with(Arc::new(FixedDirectory(Vec::new())));
        let tracker = Arc::new(tracker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(tracker.run(Duration::from_secs(3600), shutdown_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }
}
