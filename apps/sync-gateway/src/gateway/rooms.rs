//! Typed topics and the join/leave/assert-membership primitive.
//!
//! Room addresses are a typed sum instead of ad-hoc string concatenation, so
//! an awareness room for doc `"x:sync"` can never collide with a sync room.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::gateway::registry::ConnectionRegistry;
use crate::stores::AccessControl;

/// The two space kinds documents live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceType {
    /// Shared multi-user space; access decided by the authorization engine.
    Workspace,
    /// Private per-user space; accessible only to its owner.
    Userspace,
}

impl SpaceType {
    /// Parse the wire representation. Unknown kinds are a join-time
    /// validation failure, not an error payload.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "workspace" => Some(Self::Workspace),
            "userspace" => Some(Self::Userspace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Userspace => "userspace",
        }
    }
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast room kinds within one space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKind {
    /// Base membership room; the authorization checkpoint for doc operations.
    Sync,
    /// One-message-per-update wire format for old clients.
    SyncLegacy,
    /// Batched, optionally compressed wire format.
    SyncCurrent,
    /// Ephemeral per-document awareness relay.
    Awareness(String),
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => f.write_str("sync"),
            Self::SyncLegacy => f.write_str("sync-legacy"),
            Self::SyncCurrent => f.write_str("sync-current"),
            Self::Awareness(doc_id) => write!(f, "{doc_id}:awareness"),
        }
    }
}

/// Fully qualified broadcast topic: `{spaceType}:{spaceId}:{roomKind}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub space_type: SpaceType,
    pub space_id: String,
    pub room: RoomKind,
}

impl TopicKey {
    pub fn new(space_type: SpaceType, space_id: impl Into<String>, room: RoomKind) -> Self {
        Self {
            space_type,
            space_id: space_id.into(),
            room,
        }
    }

    /// The topic for the other protocol room of the same space, if this is a
    /// protocol room at all.
    pub fn sibling_protocol_room(&self) -> Option<TopicKey> {
        let sibling = match self.room {
            RoomKind::SyncLegacy => RoomKind::SyncCurrent,
            RoomKind::SyncCurrent => RoomKind::SyncLegacy,
            _ => return None,
        };
        Some(TopicKey::new(self.space_type, self.space_id.clone(), sibling))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.space_type, self.space_id, self.room)
    }
}

/// Action names passed through to the authorization engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceAction {
    Read,
    Write,
}

impl SpaceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Accessibility check for one space kind.
#[async_trait]
pub trait SpaceAdapter: Send + Sync {
    fn space_type(&self) -> SpaceType;

    /// Fails with `AccessDenied` unless `user_id` may perform `action` on
    /// the space.
    async fn assert_accessible(
        &self,
        space_id: &str,
        user_id: &str,
        action: SpaceAction,
    ) -> Result<(), SyncError>;
}

/// Workspace accessibility delegates to the authorization collaborator.
pub struct WorkspaceAdapter {
    access: Arc<dyn AccessControl>,
}

impl WorkspaceAdapter {
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        Self { access }
    }
}

#[async_trait]
impl SpaceAdapter for WorkspaceAdapter {
    fn space_type(&self) -> SpaceType {
        SpaceType::Workspace
    }

    async fn assert_accessible(
        &self,
        space_id: &str,
        user_id: &str,
        action: SpaceAction,
    ) -> Result<(), SyncError> {
        self.access.assert_accessible(space_id, user_id, action).await
    }
}

/// A userspace is accessible only to the user it belongs to; no external
/// call needed.
pub struct UserspaceAdapter;

#[async_trait]
impl SpaceAdapter for UserspaceAdapter {
    fn space_type(&self) -> SpaceType {
        SpaceType::Userspace
    }

    async fn assert_accessible(
        &self,
        space_id: &str,
        user_id: &str,
        _action: SpaceAction,
    ) -> Result<(), SyncError> {
        if space_id == user_id {
            Ok(())
        } else {
            Err(SyncError::AccessDenied {
                space_id: space_id.to_string(),
            })
        }
    }
}

/// The adapter pair held by every connection handler. Constructor-injected
/// rather than cached in connection-local storage.
pub struct SpaceAdapters {
    pub workspace: WorkspaceAdapter,
    pub userspace: UserspaceAdapter,
}

impl SpaceAdapters {
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        Self {
            workspace: WorkspaceAdapter::new(access),
            userspace: UserspaceAdapter,
        }
    }

    pub fn for_space(&self, space_type: SpaceType) -> &dyn SpaceAdapter {
        match space_type {
            SpaceType::Workspace => &self.workspace,
            SpaceType::Userspace => &self.userspace,
        }
    }
}

/// Join/leave/assert-membership over the connection registry.
pub struct RoomMembership {
    registry: Arc<ConnectionRegistry>,
}

impl RoomMembership {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Subscribe `conn_id` to a topic after an accessibility check.
    ///
    /// Idempotent: a second join with the same topic performs no
    /// authorization round-trip and no re-subscription.
    pub async fn join(
        &self,
        adapter: &dyn SpaceAdapter,
        conn_id: &str,
        user_id: &str,
        space_id: &str,
        room: RoomKind,
        action: SpaceAction,
    ) -> Result<(), SyncError> {
        let topic = TopicKey::new(adapter.space_type(), space_id, room);
        if self.registry.is_member(conn_id, &topic) {
            return Ok(());
        }
        adapter.assert_accessible(space_id, user_id, action).await?;
        self.registry.subscribe(conn_id, topic);
        Ok(())
    }

    /// Unsubscribe from a topic. No-op if not a member.
    pub fn leave(&self, conn_id: &str, topic: &TopicKey) {
        self.registry.unsubscribe(conn_id, topic);
    }

    /// Cheap membership guard run before every document operation, so the
    /// authorization collaborator is only consulted at join time.
    pub fn assert_in(&self, conn_id: &str, topic: &TopicKey) -> Result<(), SyncError> {
        if self.registry.is_member(conn_id, topic) {
            Ok(())
        } else {
            Err(SyncError::NotInSpace {
                space_id: topic.space_id.clone(),
            })
        }
    }
}
