//! Per-account serialization.
//!
//! Scheduler runs and token refreshes for the same account share one async
//! mutex; different accounts never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Proof that the holder owns an account's serialization lock.
pub struct AccountGuard {
    label: String,
    _guard: OwnedMutexGuard<()>,
}

impl AccountGuard {
    /// Account the lock belongs to.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Lazily created mutex per account label.
#[derive(Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the account's lock.
    pub async fn lock(&self, label: &str) -> AccountGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(label.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        AccountGuard {
            label: label.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Forget a removed account's lock.
    ///
    /// Holders of the old lock keep it until they drop their guard.
    pub fn remove(&self, label: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(label);
    }
}
