pub mod config;
pub mod error;
pub mod gateway;
pub mod stores;

use std::sync::Arc;

use config::Config;
use gateway::awareness::AwarenessRelay;
use gateway::broadcast::UpdateBroadcaster;
use gateway::limiter::ConnectLimiter;
use gateway::presence::PresenceTracker;
use gateway::registry::ConnectionRegistry;
use gateway::rooms::{RoomMembership, SpaceAdapters, SpaceType};
use stores::{
    AccessControl, AnalyticsSink, ConnectionDirectory, CounterStore, DocMeta, DocStore,
    UpdateMerger,
};

/// External collaborators wired in at startup. Production supplies real
/// services; tests and the dev binary use the in-memory implementations
/// from [`stores`].
pub struct Collaborators {
    pub workspace_docs: Arc<dyn DocStore>,
    pub userspace_docs: Arc<dyn DocStore>,
    pub access: Arc<dyn AccessControl>,
    pub merger: Arc<dyn UpdateMerger>,
    pub doc_meta: Arc<dyn DocMeta>,
    pub counters: Arc<dyn CounterStore>,
    pub analytics: Arc<dyn AnalyticsSink>,
    /// Cluster-wide connection directory. `None` means single-process: the
    /// local registry is the whole cluster.
    pub directory: Option<Arc<dyn ConnectionDirectory>>,
}

/// Shared application state available to every connection handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub membership: Arc<RoomMembership>,
    pub adapters: Arc<SpaceAdapters>,
    pub presence: Arc<PresenceTracker>,
    pub limiter: Arc<ConnectLimiter>,
    pub broadcaster: Arc<UpdateBroadcaster>,
    pub awareness: Arc<AwarenessRelay>,
    workspace_docs: Arc<dyn DocStore>,
    userspace_docs: Arc<dyn DocStore>,
}

impl AppState {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let directory: Arc<dyn ConnectionDirectory> = collaborators
            .directory
            .unwrap_or_else(|| registry.clone());

        let membership = Arc::new(RoomMembership::new(registry.clone()));
        let presence = Arc::new(PresenceTracker::new(
            registry.clone(),
            directory,
            collaborators.analytics,
        ));
        let limiter = Arc::new(ConnectLimiter::new(
            collaborators.counters,
            config.connect_limit,
            std::time::Duration::from_secs(config.connect_window_secs),
        ));
        let broadcaster = Arc::new(UpdateBroadcaster::new(
            registry.clone(),
            collaborators.merger,
            collaborators.doc_meta,
        ));
        let awareness = Arc::new(AwarenessRelay::new(registry.clone(), membership.clone()));
        let adapters = Arc::new(SpaceAdapters::new(collaborators.access));

        Self {
            config: Arc::new(config),
            registry,
            membership,
            adapters,
            presence,
            limiter,
            broadcaster,
            awareness,
            workspace_docs: collaborators.workspace_docs,
            userspace_docs: collaborators.userspace_docs,
        }
    }

    /// Fully in-memory state for tests and local development.
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Collaborators {
                workspace_docs: Arc::new(stores::MemoryDocStore::new()),
                userspace_docs: Arc::new(stores::MemoryDocStore::new()),
                access: Arc::new(stores::MemoryAccessControl::new()),
                merger: Arc::new(stores::ConcatMerger),
                doc_meta: Arc::new(stores::MemoryDocMeta::new()),
                counters: Arc::new(stores::MemoryCounterStore::new()),
                analytics: Arc::new(stores::MemoryAnalyticsSink::new()),
                directory: None,
            },
        )
    }

    /// The document store for a space kind; storage is partitioned per kind.
    pub fn doc_store(&self, space_type: SpaceType) -> &dyn DocStore {
        match space_type {
            SpaceType::Workspace => self.workspace_docs.as_ref(),
            SpaceType::Userspace => self.userspace_docs.as_ref(),
        }
    }
}
