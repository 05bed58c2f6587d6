//! Update broadcast pipeline: persist first, then fan out to both protocol
//! rooms.
//!
//! The gateway keeps no per-document state across calls; durable state lives
//! in the storage collaborator. Compression of multi-update batches is a
//! best-effort optimization — a merge failure downgrades to the untouched
//! batch, it never drops the broadcast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SyncError;
use crate::gateway::events::{encode_bytes, OutboundEvent};
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::rooms::{RoomKind, SpaceType, TopicKey};
use crate::stores::{DocMeta, DocStore, UpdateMerger};

/// Process-local broadcast counters, surfaced through logs.
#[derive(Default)]
pub struct BroadcastCounters {
    updates: AtomicU64,
    compressed_batches: AtomicU64,
    plain_batches: AtomicU64,
}

impl BroadcastCounters {
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn compressed_batches(&self) -> u64 {
        self.compressed_batches.load(Ordering::Relaxed)
    }

    pub fn plain_batches(&self) -> u64 {
        self.plain_batches.load(Ordering::Relaxed)
    }
}

pub struct UpdateBroadcaster {
    registry: Arc<ConnectionRegistry>,
    merger: Arc<dyn UpdateMerger>,
    doc_meta: Arc<dyn DocMeta>,
    counters: BroadcastCounters,
}

impl UpdateBroadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        merger: Arc<dyn UpdateMerger>,
        doc_meta: Arc<dyn DocMeta>,
    ) -> Self {
        Self {
            registry,
            merger,
            doc_meta,
            counters: BroadcastCounters::default(),
        }
    }

    pub fn counters(&self) -> &BroadcastCounters {
        &self.counters
    }

    /// Accept a batch of updates for one document, persist it, and fan it
    /// out. Returns the storage-assigned timestamp.
    ///
    /// Nothing is broadcast unless the persist succeeds, and nothing is
    /// persisted when the document is blocked.
    #[allow(clippy::too_many_arguments)]
    pub async fn push(
        &self,
        store: &dyn DocStore,
        conn_id: &str,
        space_type: SpaceType,
        space_id: &str,
        doc_id: &str,
        updates: Vec<Vec<u8>>,
        editor: &str,
    ) -> Result<i64, SyncError> {
        let base = TopicKey::new(space_type, space_id, RoomKind::Sync);
        if !self.registry.is_member(conn_id, &base) {
            return Err(SyncError::NotInSpace {
                space_id: space_id.to_string(),
            });
        }

        // Userspace documents are never subject to the block flag.
        if space_type == SpaceType::Workspace
            && self.doc_meta.is_blocked(space_id, doc_id).await?
        {
            return Err(SyncError::UpdateBlocked {
                doc_id: doc_id.to_string(),
            });
        }

        let timestamp = store
            .push_doc_updates(space_id, doc_id, &updates, editor)
            .await?;

        self.fan_out(conn_id, space_type, space_id, doc_id, &updates, timestamp, editor)
            .await;

        Ok(timestamp)
    }

    async fn fan_out(
        &self,
        conn_id: &str,
        space_type: SpaceType,
        space_id: &str,
        doc_id: &str,
        updates: &[Vec<u8>],
        timestamp: i64,
        editor: &str,
    ) {
        // Legacy room: one individually-addressed event per update, all
        // carrying the batch timestamp.
        let legacy = TopicKey::new(space_type, space_id, RoomKind::SyncLegacy);
        for update in updates {
            let event = OutboundEvent::DocUpdate {
                space_type: space_type.as_str().to_string(),
                space_id: space_id.to_string(),
                doc_id: doc_id.to_string(),
                update: encode_bytes(update),
                timestamp,
                editor: editor.to_string(),
            };
            self.registry.broadcast(&legacy, &event, Some(conn_id));
        }

        // Current room: a single envelope, merged when the batch has more
        // than one update.
        let (encoded, compressed) = if updates.len() > 1 {
            match self.merger.merge(updates.to_vec()).await {
                Ok(merged) => (vec![encode_bytes(&merged)], true),
                Err(err) => {
                    tracing::warn!(
                        %err,
                        doc_id,
                        batch = updates.len(),
                        "update merge failed; broadcasting uncompressed batch"
                    );
                    (updates.iter().map(|u| encode_bytes(u)).collect(), false)
                }
            }
        } else {
            (updates.iter().map(|u| encode_bytes(u)).collect(), false)
        };

        let current = TopicKey::new(space_type, space_id, RoomKind::SyncCurrent);
        let event = OutboundEvent::DocUpdates {
            space_type: space_type.as_str().to_string(),
            space_id: space_id.to_string(),
            doc_id: doc_id.to_string(),
            updates: encoded,
            timestamp,
            editor: Some(editor.to_string()),
            compressed,
        };
        let delivered = self.registry.broadcast(&current, &event, Some(conn_id));

        self.counters
            .updates
            .fetch_add(updates.len() as u64, Ordering::Relaxed);
        if compressed {
            self.counters.compressed_batches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.plain_batches.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            doc_id,
            updates = updates.len(),
            compressed,
            current_delivered = delivered,
            "broadcast doc updates"
        );
    }
}
