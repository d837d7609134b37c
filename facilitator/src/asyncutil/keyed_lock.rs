use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = Arc<StdMutex<HashMap<K, Arc<Mutex<()>>>>>;

/// A set of async mutexes addressed by key. Holding the guard for one key never blocks other keys.
/// Entries are removed again once nobody holds or waits for them.
pub struct KeyedLock<K> {
    locks: LockMap<K>,
}

impl<K> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let lock = self.entry(&key);
        let guard = lock.lock_owned().await;

        self.guard(key, guard)
    }

    /// Returns `None` if the key is currently held by someone else.
    pub fn try_lock(&self, key: K) -> Option<KeyedGuard<K>> {
        let lock = self.entry(&key);
        let guard = lock.try_lock_owned().ok()?;

        Some(self.guard(key, guard))
    }

    fn entry(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn guard(&self, key: K, guard: OwnedMutexGuard<()>) -> KeyedGuard<K> {
        KeyedGuard {
            key,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct KeyedGuard<K>
where
    K: Eq + Hash,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap<K>,
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn try_lock_is_exclusive_per_key() {
        let locks = KeyedLock::new();

        let guard = locks.try_lock("a").unwrap();
        assert!(locks.try_lock("a").is_none());
        assert!(locks.try_lock("b").is_some());

        drop(guard);
        assert!(locks.try_lock("a").is_some());
    }

    #[test]
    fn entries_are_pruned_when_released() {
        let locks = KeyedLock::new();

        let a = locks.try_lock(1).unwrap();
        let b = locks.try_lock(2).unwrap();
        assert_eq!(locks.len(), 2);

        drop(a);
        assert_eq!(locks.len(), 1);
        drop(b);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_waits_for_the_current_holder() {
        let locks = Arc::new(KeyedLock::new());
        let released = Arc::new(AtomicBool::new(false));

        let guard = locks.lock("a").await;

        let waiter = tokio::spawn({
            let locks = locks.clone();
            let released = released.clone();
            async move {
                let _guard = locks.lock("a").await;
                released.load(Ordering::SeqCst)
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(locks.len(), 1);
        released.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(waiter.await.unwrap());
        assert_eq!(locks.len(), 0);
    }
}
