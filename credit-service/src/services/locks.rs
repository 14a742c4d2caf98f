//! Per-account serialisation of ledger mutations.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per account. Holding the guard is the only way to
/// mutate that account's ledger.
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, account_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(account_id).or_default().clone();
        lock.lock_owned().await
    }
}
