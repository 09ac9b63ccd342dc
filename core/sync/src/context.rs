//! Shared handles for the refresher and the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::locks::AccountLocks;
use crate::snapshot::EventSnapshot;
use crate::state::{SyncState, SyncStateStore, SyncStatus};
use calvault_providers::AdapterRegistry;
use calvault_vault::{CredentialStore, KeyContext};

/// Capacity of the update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Notification published after every committed state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUpdate {
    pub label: String,
    pub status: SyncStatus,
    /// Events held for the account after a successful run.
    pub event_count: Option<usize>,
    pub error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl SyncUpdate {
    /// Describe a committed state.
    pub fn from_state(state: &SyncState, event_count: Option<usize>) -> Self {
        Self {
            label: state.account_label.clone(),
            status: state.status.clone(),
            event_count,
            error: state.last_error.clone(),
            last_synced_at: state.last_synced_at,
            at: Utc::now(),
        }
    }
}

/// Everything a sync run touches, shared by reference.
pub struct SyncContext {
    pub keys: Arc<KeyContext>,
    pub store: Arc<CredentialStore>,
    pub registry: AdapterRegistry,
    pub states: SyncStateStore,
    pub snapshot: EventSnapshot,
    pub locks: AccountLocks,
    updates: broadcast::Sender<SyncUpdate>,
}

impl SyncContext {
    pub fn new(
        keys: Arc<KeyContext>,
        store: Arc<CredentialStore>,
        registry: AdapterRegistry,
        states: SyncStateStore,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            keys,
            store,
            registry,
            states,
            snapshot: EventSnapshot::new(),
            locks: AccountLocks::new(),
            updates,
        }
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    /// Publish a transition. Having no subscribers is not an error.
    pub fn publish(&self, update: SyncUpdate) {
        if self.updates.send(update).is_err() {
            trace!("No sync update subscribers");
        }
    }
}
