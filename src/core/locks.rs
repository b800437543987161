/// Per-instance operation locks
///
/// Lifecycle and backup operations on one instance run one at a time; different
/// instances never contend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    /// Wait for exclusive access to `instance_id`
    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(instance_id).lock_owned().await
    }

    #[cfg(test)]
    fn try_acquire(&self, instance_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(instance_id).try_lock_owned().ok()
    }

    /// Forget the lock of a deleted instance once nobody holds or waits on it.
    /// A lock still in use stays, so later callers queue behind the same mutex.
    pub fn remove(&self, instance_id: &str) {
        let mut locks = self.locks.lock();
        if locks
            .get(instance_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(instance_id);
        }
    }
}
