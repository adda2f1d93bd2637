//! Per-key locks for the L1 tier.
//!
//! Locks live in the local cache next to the values they guard and expire
//! with them. A single registry mutex makes find-or-create atomic; it is
//! released before the per-key lock is awaited.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::entry::EntryOptions;
use crate::local_cache::{KeyLock, LocalCache, LocalExpiration};

/// Registry handing out the per-key locks stored in the L1 tier.
pub struct KeyLocks {
    local: LocalCache,
    creation: Mutex<()>,
}

/// A held per-key lock. Dropping it releases the key.
pub struct KeyLockGuard {
    key: String,
    lock: KeyLock,
    _held: OwnedMutexGuard<()>,
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyLocks {
    pub fn new(local: LocalCache) -> Self {
        Self {
            local,
            creation: Mutex::new(()),
        }
    }

    /// Find the lock for `key`, or create one expiring per `options`.
    ///
    /// `None` creates a lock without expiration; callers that learn the real
    /// options later fix it up with [`KeyLocks::persist`].
    pub async fn get_or_create(&self, key: &str, options: Option<&EntryOptions>) -> KeyLock {
        let expiration = options
            .map(|o| LocalExpiration::from_options(o, SystemTime::now()))
            .unwrap_or(LocalExpiration::NEVER);

        let _creating = self.creation.lock().await;
        self.local.get_or_insert_lock(key, expiration)
    }

    /// Take the lock for `key`, waiting behind any current holder.
    pub async fn acquire(&self, key: &str, options: Option<&EntryOptions>) -> KeyLockGuard {
        let lock = self.get_or_create(key, options).await;
        let held = Arc::clone(&lock).lock_owned().await;
        debug!("Acquired key lock for key: {}", key);
        KeyLockGuard {
            key: key.to_owned(),
            lock,
            _held: held,
        }
    }

    /// Re-store a held lock so it expires together with its value.
    pub fn persist(&self, guard: &KeyLockGuard, options: &EntryOptions) {
        self.local.insert_lock(
            guard.key(),
            Arc::clone(&guard.lock),
            LocalExpiration::from_options(options, SystemTime::now()),
        );
    }

    pub fn remove(&self, key: &str) {
        self.local.remove_lock(key);
    }
}
