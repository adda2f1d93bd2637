//! In-process L1 tier.
//!
//! A Moka cache holding two kinds of entries side by side: cached values and
//! the per-key lock handles that guard their refill. Both are namespaced:
//! values under the instance key prefix, locks under the per-instance lock
//! prefix, so a lock entry never shadows a value and two instances' locks
//! never share a name. There is no capacity bound; entries leave the cache
//! only by expiring or being removed.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use moka::Expiry;
use moka::sync::Cache;
use tokio::sync::Mutex;

use crate::entry::{EntryOptions, time_to_live};

/// Per-key lock handle
pub type KeyLock = Arc<Mutex<()>>;

/// Expiration of an L1 entry, resolved to absolute time at write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalExpiration {
    deadline: Option<SystemTime>,
    sliding: Option<Duration>,
}

impl LocalExpiration {
    pub const NEVER: LocalExpiration = LocalExpiration {
        deadline: None,
        sliding: None,
    };

    pub fn from_options(options: &EntryOptions, now: SystemTime) -> Self {
        Self {
            deadline: options.absolute_deadline(now),
            sliding: options.sliding_expiration,
        }
    }

    pub fn is_sliding(&self) -> bool {
        self.sliding.is_some()
    }

    fn remaining(&self) -> Option<Duration> {
        time_to_live(self.deadline, self.sliding, SystemTime::now())
    }
}

#[derive(Debug, Clone)]
enum LocalValue {
    Data(Arc<[u8]>),
    Lock(KeyLock),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: LocalValue,
    expiration: LocalExpiration,
}

struct LocalExpiry;

impl Expiry<String, LocalEntry> for LocalExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.expiration.remaining()
    }

    fn expire_after_read(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        if entry.expiration.is_sliding() {
            entry.expiration.remaining()
        } else {
            duration_until_expiry
        }
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        entry.expiration.remaining()
    }
}

/// The L1 tier. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct LocalCache {
    entries: Cache<String, LocalEntry>,
    key_prefix: Arc<str>,
    lock_key_prefix: Arc<str>,
}

impl LocalCache {
    pub fn new(key_prefix: &str, lock_key_prefix: &str) -> Self {
        Self {
            entries: Cache::builder().expire_after(LocalExpiry).build(),
            key_prefix: Arc::from(key_prefix),
            lock_key_prefix: Arc::from(lock_key_prefix),
        }
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.lock_key_prefix, key)
    }

    /// Cached value for `key`, if present and unexpired.
    pub fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        match self.entries.get(&self.data_key(key))?.value {
            LocalValue::Data(data) => Some(data),
            LocalValue::Lock(_) => None,
        }
    }

    /// Cache a value. Entries with a sliding expiration are not kept: a
    /// sliding window is only tracked by the shared store, and a local copy
    /// could outlive it unnoticed.
    ///
    /// Returns whether the value was cached.
    pub fn insert(&self, key: &str, data: Arc<[u8]>, expiration: LocalExpiration) -> bool {
        let data_key = self.data_key(key);
        if expiration.is_sliding() {
            // A previous non-sliding copy would now be stale.
            self.entries.invalidate(&data_key);
            return false;
        }
        self.entries.insert(
            data_key,
            LocalEntry {
                value: LocalValue::Data(data),
                expiration,
            },
        );
        true
    }

    pub fn remove(&self, key: &str) {
        self.entries.invalidate(&self.data_key(key));
    }

    /// Lock handle for `key`, creating it with `expiration` when absent.
    pub fn get_or_insert_lock(&self, key: &str, expiration: LocalExpiration) -> KeyLock {
        let entry = self
            .entries
            .entry(self.lock_key(key))
            .or_insert_with(|| LocalEntry {
                value: LocalValue::Lock(Arc::new(Mutex::new(()))),
                expiration,
            })
            .into_value();

        match entry.value {
            LocalValue::Lock(lock) => lock,
            LocalValue::Data(_) => {
                // Unreachable through the prefixed API; repair rather than fail.
                let lock = KeyLock::default();
                self.insert_lock(key, Arc::clone(&lock), expiration);
                lock
            }
        }
    }

    /// Store a lock handle, replacing its expiration.
    pub fn insert_lock(&self, key: &str, lock: KeyLock, expiration: LocalExpiration) {
        self.entries.insert(
            self.lock_key(key),
            LocalEntry {
                value: LocalValue::Lock(lock),
                expiration,
            },
        );
    }

    pub fn has_lock(&self, key: &str) -> bool {
        self.entries.contains_key(&self.lock_key(key))
    }

    pub fn remove_lock(&self, key: &str) {
        self.entries.invalidate(&self.lock_key(key));
    }

    /// Drop both the value and the lock handle for `key`.
    pub fn evict(&self, key: &str) {
        self.remove(key);
        self.remove_lock(key);
    }
}
