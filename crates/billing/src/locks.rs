//! Per-organization mutual exclusion
//!
//! Check-then-act sequences on one organization (seat changes, subscribe, cancel,
//! reconciliation) run while holding that organization's guard. Different
//! organizations never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Default)]
pub struct OrgLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one organization-scoped operation
pub struct OrgGuard {
    org_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl OrgGuard {
    pub fn org_id(&self) -> Uuid {
        self.org_id
    }
}

impl OrgLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `org_id`
    pub async fn acquire(&self, org_id: Uuid) -> OrgGuard {
        let lock = {
            // Poisoning only happens if a holder of the map lock panicked; the map is still usable.
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds or waits on so the map stays bounded.
            locks.retain(|id, l| *id == org_id || Arc::strong_count(l) > 1);
            locks
                .entry(org_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        OrgGuard {
            org_id,
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of organizations with a live lock entry
    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_org_is_serialized() {
        let locks = Arc::new(OrgLocks::new());
        let org_id = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(org_id).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_orgs_do_not_block() {
        let locks = OrgLocks::new();
        let a = locks.acquire(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(Uuid::new_v4()))
            .await
            .expect("second organization must not wait on the first");
        assert_ne!(a.org_id(), b.org_id());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = OrgLocks::new();
        for _ in 0..10 {
            let _g = locks.acquire(Uuid::new_v4()).await;
        }
        let _last = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.tracked(), 1);
    }
}
