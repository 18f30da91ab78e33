use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;

use super::CacheKey;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug)]
struct Slot {
    /// Number of tasks holding or waiting on `lock`.
    refs: usize,
    lock: KeyLock,
}

type Slots = HashMap<CacheKey, Slot>;

/// A registry of per-key async locks.
///
/// A slot is created on first use of a key and removed as soon as nobody holds or waits for it
/// anymore, so the registry only ever contains keys that are in use.
#[derive(Debug, Clone, Default)]
pub struct CacheLocks {
    slots: Arc<Mutex<Slots>>,
}

/// Exclusive access to a single cache key, released on drop.
#[derive(Debug)]
pub struct CacheLockGuard {
    // Fields are dropped in declaration order: unlock first, then release the slot.
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef,
}

/// A counted reference to a slot, removing the slot when the last reference is dropped.
///
/// Also covers acquisitions that are cancelled while still waiting for the lock.
#[derive(Debug)]
struct SlotRef {
    slots: Arc<Mutex<Slots>>,
    key: CacheKey,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

impl CacheLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: &CacheKey) -> CacheLockGuard {
        let lock = {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(key.clone()).or_insert_with(|| Slot {
                refs: 0,
                lock: KeyLock::default(),
            });
            slot.refs += 1;
            Arc::clone(&slot.lock)
        };

        // Created before the first await point, so a cancelled acquisition still decrements.
        let slot = SlotRef {
            slots: Arc::clone(&self.slots),
            key: key.clone(),
        };

        let guard = lock.lock_owned().await;
        CacheLockGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// The number of keys that are currently held or waited on.
    pub fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The registry is never left in an inconsistent state by a panic, so poisoning is ignored.
fn lock_slots(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn key(url: &str) -> CacheKey {
        CacheKey::from_url(url)
    }

    #[tokio::test]
    async fn test_slot_removed_after_release() {
        let locks = CacheLocks::new();
        let a = key("https://factorio.com/a");

        let guard = locks.acquire(&a).await;
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert!(locks.is_empty());

        // can be acquired again
        let _guard = locks.acquire(&a).await;
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = CacheLocks::new();

        let _a = locks.acquire(&key("https://factorio.com/a")).await;
        let b = tokio::time::timeout(
            Duration::from_secs(1),
            locks.acquire(&key("https://factorio.com/b")),
        )
        .await;

        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = CacheLocks::new();
        let a = key("https://factorio.com/a");

        let guard = locks.acquire(&a).await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&a)).await;
        assert!(blocked.is_err());

        // The timed out waiter must not leak a reference, the holder keeps its slot.
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        let locks = CacheLocks::new();
        let a = key("https://factorio.com/a");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let locks = locks.clone();
                let a = a.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _guard = locks.acquire(&a).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }
}
