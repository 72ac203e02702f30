//! Per-account exclusive use of the live protocol connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

use outreach_core::ResourceKey;

/// Hands out one lease per account at a time; waiters queue in FIFO order.
#[derive(Debug, Default)]
pub struct ConnectionLeases {
    locks: StdMutex<HashMap<ResourceKey, Arc<Mutex<()>>>>,
}

/// Held for as long as a job drives the account's connection.
#[derive(Debug)]
pub struct ConnectionLease {
    _guard: OwnedMutexGuard<()>,
}

impl ConnectionLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, resource: &ResourceKey) -> ConnectionLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(resource.clone()).or_default().clone()
        };
        ConnectionLease {
            _guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    /// Non-blocking variant; `None` while another job holds the account.
    pub fn try_acquire(&self, resource: &ResourceKey) -> Option<ConnectionLease> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(resource.clone()).or_default().clone()
        };
        lock.try_lock_owned()
            .ok()
            .map(|guard| ConnectionLease { _guard: guard })
    }
}
