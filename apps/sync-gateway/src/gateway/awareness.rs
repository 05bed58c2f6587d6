//! Ephemeral awareness relay: cursor/presence payloads between clients
//! editing the same document. Nothing here touches storage.

use std::sync::Arc;

use crate::error::SyncError;
use crate::gateway::events::OutboundEvent;
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::rooms::{
    RoomKind, RoomMembership, SpaceAction, SpaceAdapter, TopicKey,
};

pub struct AwarenessRelay {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<RoomMembership>,
}

impl AwarenessRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, membership: Arc<RoomMembership>) -> Self {
        Self {
            registry,
            membership,
        }
    }

    pub async fn join(
        &self,
        adapter: &dyn SpaceAdapter,
        conn_id: &str,
        user_id: &str,
        space_id: &str,
        doc_id: &str,
    ) -> Result<(), SyncError> {
        self.membership
            .join(
                adapter,
                conn_id,
                user_id,
                space_id,
                RoomKind::Awareness(doc_id.to_string()),
                SpaceAction::Read,
            )
            .await
    }

    pub fn leave(&self, adapter: &dyn SpaceAdapter, conn_id: &str, space_id: &str, doc_id: &str) {
        let topic = TopicKey::new(
            adapter.space_type(),
            space_id,
            RoomKind::Awareness(doc_id.to_string()),
        );
        self.membership.leave(conn_id, &topic);
    }

    /// Ask every other member of the awareness room to send its current
    /// state to the collector.
    pub fn collect(
        &self,
        adapter: &dyn SpaceAdapter,
        conn_id: &str,
        space_id: &str,
        doc_id: &str,
    ) -> Result<usize, SyncError> {
        let topic = TopicKey::new(
            adapter.space_type(),
            space_id,
            RoomKind::Awareness(doc_id.to_string()),
        );
        self.membership.assert_in(conn_id, &topic)?;

        let event = OutboundEvent::AwarenessCollect {
            doc_id: doc_id.to_string(),
            collector: conn_id.to_string(),
        };
        Ok(self.registry.broadcast(&topic, &event, Some(conn_id)))
    }

    /// Relay an opaque awareness payload verbatim to every other member.
    pub fn update(
        &self,
        adapter: &dyn SpaceAdapter,
        conn_id: &str,
        space_id: &str,
        doc_id: &str,
        awareness_update: &str,
    ) -> Result<usize, SyncError> {
        let topic = TopicKey::new(
            adapter.space_type(),
            space_id,
            RoomKind::Awareness(doc_id.to_string()),
        );
        self.membership.assert_in(conn_id, &topic)?;

        let event = OutboundEvent::AwarenessUpdate {
            doc_id: doc_id.to_string(),
            awareness_update: awareness_update.to_string(),
        };
        Ok(self.registry.broadcast(&topic, &event, Some(conn_id)))
    }
}
