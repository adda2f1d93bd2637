//! The shared (L2) tier.
//!
//! [`SharedStore`] is everything the cache needs from the networked store:
//! hash-encoded entries, pub/sub, and a read of the server configuration.
//! Keys passed in are already namespaced by the caller.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::CacheError;
use crate::entry::EntryOptions;
use crate::message::{Channel, ChannelMessage};

mod memory_store;
mod redis_store;

pub use memory_store::{MemoryStore, MemoryStoreStats};
pub use redis_store::RedisStore;

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// All fields of the hash stored at `key`; empty when the key is absent.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, CacheError>;

    /// Store `value` with its expiration metadata, replacing any previous entry.
    async fn set(&self, key: &str, value: &[u8], options: &EntryOptions)
    -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Restart the sliding expiration window of `key`, if it has one.
    async fn refresh(&self, key: &str) -> Result<(), CacheError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError>;

    /// Current value of a server configuration parameter.
    async fn config_get(&self, name: &str) -> Result<Option<String>, CacheError>;

    /// Open a subscription to the given channels on a dedicated connection.
    async fn subscribe(&self, channels: &[Channel]) -> Result<Box<dyn Subscription>, CacheError>;
}

/// A live pub/sub subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Next message; `None` once the underlying connection is gone.
    async fn next_message(&mut self) -> Option<ChannelMessage>;

    async fn unsubscribe(self: Box<Self>) -> Result<(), CacheError>;
}
