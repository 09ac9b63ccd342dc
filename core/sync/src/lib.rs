//! CalVault Sync Engine
//!
//! This module keeps every configured account's calendar data current:
//! - Per-account background tasks on a periodic schedule, plus triggers
//! - Proactive OAuth token renewal with suspension on revoked grants
//! - Retry strategy with exponential backoff for transient errors
//! - Persisted per-account sync state and an in-memory event snapshot

pub mod context;
pub mod locks;
pub mod refresher;
pub mod retry;
pub mod scheduler;
pub mod snapshot;
pub mod state;

#[cfg(test)]
mod testing;

pub use context::{SyncContext, SyncUpdate};
pub use locks::{AccountGuard, AccountLocks};
pub use refresher::{RefresherConfig, TokenRefresher};
pub use retry::{RetryAttempt, RetryConfig, RetryExecutor};
pub use scheduler::{SchedulerConfig, SyncReport, SyncScheduler};
pub use snapshot::EventSnapshot;
pub use state::{SyncState, SyncStateStore, SyncStatus, STATE_FILE_NAME};
