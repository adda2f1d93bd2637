//! In-process shared tier.
//!
//! Behaves like a single Redis database for the commands the cache uses,
//! including keyspace/keyevent notifications when `notify-keyspace-events`
//! enables them. Several caches built on clones of one `MemoryStore` share
//! it the way separate processes share a Redis server.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, warn};

use super::{SharedStore, Subscription};
use crate::CacheError;
use crate::entry::{EntryOptions, StoredEntry, time_to_live};
use crate::message::{Channel, ChannelMessage};
use crate::verifier::{NOTIFY_KEYSPACE_EVENTS, notify_flags_enable};

const BUS_CAPACITY: usize = 1024;

struct MemoryEntry {
    fields: HashMap<String, Vec<u8>>,
    expires_at: Option<Instant>,
}

/// Deadline `ttl` from now; a TTL past what `Instant` can hold never expires.
fn expiry_instant(ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| Instant::now().checked_add(ttl))
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

struct MemoryInner {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    config: Mutex<HashMap<String, String>>,
    bus: broadcast::Sender<ChannelMessage>,
    online: watch::Sender<bool>,
    hash_reads: AtomicU64,
    publishes: AtomicU64,
}

/// Command counters, for checking how often the shared tier was hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub hash_reads: u64,
    pub publishes: u64,
}

/// Shared tier kept in process memory. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(MemoryInner {
                entries: Mutex::new(HashMap::new()),
                config: Mutex::new(HashMap::new()),
                bus,
                online,
                hash_reads: AtomicU64::new(0),
                publishes: AtomicU64::new(0),
            }),
        }
    }

    /// Set a configuration parameter, e.g. `notify-keyspace-events`.
    pub async fn config_set(&self, name: &str, value: &str) {
        self.inner
            .config
            .lock()
            .await
            .insert(name.to_owned(), value.to_owned());
    }

    /// Take the store offline or bring it back.
    ///
    /// While offline every command fails with a connection error and open
    /// subscriptions end.
    pub fn set_online(&self, online: bool) {
        self.inner.online.send_replace(online);
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            hash_reads: self.inner.hash_reads.load(Ordering::Relaxed),
            publishes: self.inner.publishes.load(Ordering::Relaxed),
        }
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if *self.inner.online.borrow() {
            Ok(())
        } else {
            Err(CacheError::Connection("memory store is offline".to_owned()))
        }
    }

    fn broadcast(&self, channel: String, payload: impl Into<Vec<u8>>) {
        // No receivers is fine: nobody is listening.
        let _ = self.inner.bus.send(ChannelMessage::new(channel, payload));
    }

    /// Emit the notifications Redis would emit for `event` on `key`.
    async fn notify(&self, event: &str, class: char, key: &str) {
        let flags = self
            .inner
            .config
            .lock()
            .await
            .get(NOTIFY_KEYSPACE_EVENTS)
            .cloned()
            .unwrap_or_default();

        if !notify_flags_enable(&flags, class) {
            return;
        }
        if notify_flags_enable(&flags, 'K') {
            self.broadcast(format!("__keyspace@0__:{key}"), event);
        }
        if notify_flags_enable(&flags, 'E') {
            self.broadcast(format!("__keyevent@0__:{event}"), key);
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check_online()?;
        let mut entries = self.inner.entries.lock().await;
        if entries.get(key).is_some_and(MemoryEntry::is_expired) {
            entries.remove(key);
        }
        Ok(entries.contains_key(key))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        self.check_online()?;
        self.inner.hash_reads.fetch_add(1, Ordering::Relaxed);
        let entries = self.inner.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &EntryOptions,
    ) -> Result<(), CacheError> {
        self.check_online()?;
        let now = SystemTime::now();
        options.validate(now)?;

        let fields = StoredEntry::to_fields(value, options, now)
            .into_iter()
            .map(|(name, field)| (name.to_owned(), field))
            .collect();
        let ttl = time_to_live(
            options.absolute_deadline(now),
            options.sliding_expiration,
            now,
        );

        self.inner.entries.lock().await.insert(
            key.to_owned(),
            MemoryEntry {
                fields,
                expires_at: expiry_instant(ttl),
            },
        );
        self.notify("hset", 'h', key).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.check_online()?;
        let removed = self.inner.entries.lock().await.remove(key);
        if removed.is_some_and(|entry| !entry.is_expired()) {
            self.notify("del", 'g', key).await;
        }
        Ok(())
    }

    async fn refresh(&self, key: &str) -> Result<(), CacheError> {
        self.check_online()?;
        let mut entries = self.inner.entries.lock().await;
        let Some(entry) = entries.get_mut(key).filter(|entry| !entry.is_expired()) else {
            return Ok(());
        };

        let stored = StoredEntry::from_fields(&entry.fields);
        if let Some(sliding) = stored.options.sliding_expiration {
            let ttl = time_to_live(
                stored.options.absolute_expiration,
                Some(sliding),
                SystemTime::now(),
            );
            entry.expires_at = expiry_instant(ttl);
            debug!("Memory store refreshed key: {}", key);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        self.check_online()?;
        self.inner.publishes.fetch_add(1, Ordering::Relaxed);
        self.broadcast(channel.to_owned(), payload);
        Ok(())
    }

    async fn config_get(&self, name: &str) -> Result<Option<String>, CacheError> {
        self.check_online()?;
        Ok(self.inner.config.lock().await.get(name).cloned())
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<Box<dyn Subscription>, CacheError> {
        self.check_online()?;
        Ok(Box::new(MemorySubscription {
            messages: self.inner.bus.subscribe(),
            online: self.inner.online.subscribe(),
            channels: channels.to_vec(),
        }))
    }
}

struct MemorySubscription {
    messages: broadcast::Receiver<ChannelMessage>,
    online: watch::Receiver<bool>,
    channels: Vec<Channel>,
}

fn subscribed_to(channels: &[Channel], name: &str) -> bool {
    channels.iter().any(|channel| match channel {
        Channel::Literal(literal) => literal == name,
        Channel::Pattern(pattern) => glob_match(pattern.as_bytes(), name.as_bytes()),
    })
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Option<ChannelMessage> {
        loop {
            tokio::select! {
                received = self.messages.recv() => match received {
                    Ok(message) if subscribed_to(&self.channels, &message.channel) => {
                        return Some(message);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Memory store subscriber lagged, {} messages dropped", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = self.online.wait_for(|online| !*online) => return None,
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some((b'?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}
