//! tiercache - Two-layer caching library
//!
//! This library keeps a process-local L1 cache in front of a shared L2 store
//! (Redis), and keeps the L1 copies of all instances coherent:
//! - L1: in-memory Moka cache, per process
//! - L2: Redis hash entries with absolute and sliding expiration
//!
//! The cache supports:
//! - Read-through on L1 misses, write-through on sets and removals
//! - Per-key locks so concurrent misses read the shared store once
//! - Invalidation over Redis pub/sub, via explicit messages or the server's
//!   keyspace/keyevent notifications
//! - A background subscription that survives Redis restarts
//! - Async and blocking front ends

mod blocking;
mod config;
pub mod entry;
mod error;
mod key_lock;
pub mod local_cache;
pub mod message;
pub mod messaging;
pub mod store;
mod subscription;
mod two_layer_cache;
pub mod verifier;

pub use blocking::BlockingCache;
pub use config::CacheConfig;
pub use entry::EntryOptions;
pub use error::CacheError;
pub use messaging::MessagingType;
pub use store::{MemoryStore, RedisStore, SharedStore, Subscription};
pub use subscription::{CacheEvent, SubscriptionState};
pub use two_layer_cache::TwoLayerCache;

// Re-export async_trait for custom `SharedStore` implementations
pub use async_trait::async_trait;
