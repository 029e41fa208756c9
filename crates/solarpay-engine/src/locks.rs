//! # Keyed Locks
//!
//! In-process async mutexes addressed by string key: one per transaction
//! reference, agent or device.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  KeyedLocks                                                  │
//! │                                                              │
//! │   "SP-001"   ──► Weak ──► Arc<Mutex<()>>  ◄── guard (task A) │
//! │   "agent-7"  ──► Weak ──► Arc<Mutex<()>>  ◄── guard (task B) │
//! │   "dev-42"   ──► Weak ──► (dropped)       ← evicted on next  │
//! │                                             lock() call      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry only holds weak references, so a key whose last guard is
//! gone costs one map slot until the next sweep removes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of per-key async locks.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    ///
    /// The returned guard releases the key when dropped.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.entry(key);
        mutex.lock_owned().await
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = entries.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        // Evict dead slots before growing the map
        entries.retain(|_, weak| weak.strong_count() > 0);

        let mutex = Arc::new(AsyncMutex::new(()));
        entries.insert(key.to_string(), Arc::downgrade(&mutex));
        mutex
    }
}
