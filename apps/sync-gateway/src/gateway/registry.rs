//! Connection registry: per-connection state, topic membership, and fan-out.
//!
//! Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
//! entry for non-poisoning, fast locking. Delivery goes through each
//! connection's unbounded mpsc sender, so a slow client stalls only its own
//! queue, never the broadcasting task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::gateway::events::OutboundEvent;
use crate::gateway::rooms::{RoomKind, TopicKey};
use crate::stores::{ConnectionDirectory, ConnectionSnapshot};

/// Per-connection state.
pub struct ConnectionEntry {
    pub conn_id: String,
    /// Attached at admission once auth resolution succeeds; `None` means the
    /// connection is excluded from per-user presence dedup.
    pub user_id: Option<String>,
    pub topics: HashSet<TopicKey>,
    sender: mpsc::UnboundedSender<OutboundEvent>,
}

/// Registry of all live connections on this process.
pub struct ConnectionRegistry {
    connections: DashMap<String, Mutex<ConnectionEntry>>,
    /// Plain process-local connection count; the presence fallback on the
    /// hot disconnect path.
    live_count: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            live_count: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, conn_id: String, sender: mpsc::UnboundedSender<OutboundEvent>) {
        let entry = ConnectionEntry {
            conn_id: conn_id.clone(),
            user_id: None,
            topics: HashSet::new(),
            sender,
        };
        self.connections.insert(conn_id, Mutex::new(entry));
        self.live_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_some() {
            self.live_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Attach the authenticated user id to a connection.
    pub fn attach_user(&self, conn_id: &str, user_id: &str) {
        if let Some(entry) = self.connections.get(conn_id) {
            entry.lock().user_id = Some(user_id.to_string());
        }
    }

    pub fn user_of(&self, conn_id: &str) -> Option<String> {
        self.connections
            .get(conn_id)
            .and_then(|entry| entry.lock().user_id.clone())
    }

    /// Subscribe a connection to a topic. Joining one protocol room evicts
    /// membership of the other for the same space, so a client never sees
    /// the same update in both wire formats.
    pub fn subscribe(&self, conn_id: &str, topic: TopicKey) {
        if let Some(entry) = self.connections.get(conn_id) {
            let mut e = entry.lock();
            if let Some(sibling) = topic.sibling_protocol_room() {
                e.topics.remove(&sibling);
            }
            e.topics.insert(topic);
        }
    }

    pub fn unsubscribe(&self, conn_id: &str, topic: &TopicKey) {
        if let Some(entry) = self.connections.get(conn_id) {
            entry.lock().topics.remove(topic);
        }
    }

    /// Drop every membership of `conn_id` within one space.
    pub fn unsubscribe_space(&self, conn_id: &str, space_type: crate::gateway::rooms::SpaceType, space_id: &str) {
        if let Some(entry) = self.connections.get(conn_id) {
            entry
                .lock()
                .topics
                .retain(|t| !(t.space_type == space_type && t.space_id == space_id));
        }
    }

    pub fn is_member(&self, conn_id: &str, topic: &TopicKey) -> bool {
        self.connections
            .get(conn_id)
            .map(|entry| entry.lock().topics.contains(topic))
            .unwrap_or(false)
    }

    /// Whether `conn_id` is in either protocol room of a space.
    pub fn protocol_room_of(&self, conn_id: &str, topic_base: &TopicKey) -> Option<RoomKind> {
        let entry = self.connections.get(conn_id)?;
        let e = entry.lock();
        for kind in [RoomKind::SyncLegacy, RoomKind::SyncCurrent] {
            let t = TopicKey::new(topic_base.space_type, topic_base.space_id.clone(), kind.clone());
            if e.topics.contains(&t) {
                return Some(kind);
            }
        }
        None
    }

    /// Deliver an event to every member of a topic, excluding `exclude`
    /// (normally the originating connection). Returns the delivery count.
    /// Send failures mean the receiving task already exited; those members
    /// are skipped.
    pub fn broadcast(
        &self,
        topic: &TopicKey,
        event: &OutboundEvent,
        exclude: Option<&str>,
    ) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            let e = entry.lock();
            if Some(e.conn_id.as_str()) == exclude {
                continue;
            }
            if !e.topics.contains(topic) {
                continue;
            }
            if e.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Process-local connection count.
    pub fn len(&self) -> usize {
        self.live_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|entry| {
                let e = entry.lock();
                ConnectionSnapshot {
                    conn_id: e.conn_id.clone(),
                    user_id: e.user_id.clone(),
                }
            })
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-process directory: the cluster is just this registry.
#[async_trait]
impl ConnectionDirectory for ConnectionRegistry {
    async fn list_connections(&self) -> Result<Vec<ConnectionSnapshot>, SyncError> {
        Ok(self.snapshot())
    }
}
