//! Per-key async serialization.
//!
//! Operations on the same environment id, or on the same name, queue behind
//! each other; unrelated keys never contend. Slots are dropped once nobody
//! holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

type Slot = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub(crate) struct KeyedLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: String) -> KeyGuard<'_> {
        // Declared before the slot so a waiter dropped mid-await releases
        // its slot reference first and the guard can still prune.
        let mut held = KeyGuard {
            locks: self,
            key,
            guard: None,
        };
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(held.key.clone())
            .or_default()
            .clone();
        held.guard = Some(slot.lock_owned().await);
        held
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub(crate) fn id_key(id: Uuid) -> String {
    format!("id:{id}")
}

pub(crate) fn name_key(name: &str) -> String {
    format!("name:{name}")
}

pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.locks.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map's own reference left: no holder, no waiter.
        if slots.get(&self.key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
            tasks.push(tokio::spawn(async move {
                let _g = locks.lock(name_key("same")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_releases_slot() {
        let locks = KeyedLocks::new();
        let held = locks.lock(name_key("busy")).await;

        let mut waiter = Box::pin(locks.lock(name_key("busy")));
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut waiter).await.is_err());
        // Released while the waiter is still queued, then the waiter gives up.
        drop(held);
        drop(waiter);
        assert_eq!(locks.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(id_key(Uuid::new_v4())).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(id_key(Uuid::new_v4()))).await;
        assert!(b.is_ok());
    }
}
