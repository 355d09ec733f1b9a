//! Per-key single-flight mutex (spec.md §9 "Per-key concurrency").
//!
//! Backs both the tenant registry's cache-population single-flight (§4.B)
//! and the connection broker's per-tenant pool creation (§4.C): concurrent
//! callers for the same key block on one another, concurrent callers for
//! different keys never contend. Entries are reference-counted and removed
//! once the last holder releases its guard, so the map stays bounded by the
//! number of *currently contended* keys rather than growing with every
//! tenant ever seen.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, OwnedMutexGuard};

struct Entry {
    lock: Arc<Mutex<()>>,
    refcount: usize,
}

/// A map of independent mutexes, one per key, created lazily.
pub struct KeyedMutex<K> {
    entries: Arc<StdMutex<HashMap<K, Entry>>>,
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Acquire the lock for `key`, blocking only callers contending on the
    /// same key. The returned guard decrements the key's refcount on drop
    /// and removes its bookkeeping entry once no holder remains.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let lock = {
            let mut entries = self.entries.lock().expect("keyed mutex map poisoned");
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                lock: Arc::new(Mutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            entry.lock.clone()
        };

        let guard = lock.lock_owned().await;
        KeyGuard {
            key,
            _guard: guard,
            entries: self.entries.clone(),
        }
    }
}

/// RAII guard for a single key's lock; releases and, if no other caller is
/// waiting, garbage collects the key's bookkeeping entry on drop.
pub struct KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    _guard: OwnedMutexGuard<()>,
    entries: Arc<StdMutex<HashMap<K, Entry>>>,
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        let mut entries = self.entries.lock().expect("keyed mutex map poisoned");
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn same_key_serializes() {
        let km: Arc<KeyedMutex<&'static str>> = Arc::new(KeyedMutex::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..20 {
            let km = km.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = km.lock("tenant-a").await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(before, 0, "overlapping critical section for the same key");
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let km: KeyedMutex<&'static str> = KeyedMutex::new();
        let a = km.lock("tenant-a").await;
        let b = km.lock("tenant-b").await;
        drop(a);
        drop(b);
    }
}
