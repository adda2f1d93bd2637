//! Synchronous front end for callers without a Tokio runtime.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::entry::EntryOptions;
use crate::store::{RedisStore, SharedStore};
use crate::subscription::SubscriptionState;
use crate::{CacheConfig, CacheError, TwoLayerCache};

/// A [`TwoLayerCache`] driven by its own runtime.
///
/// Every method blocks the calling thread until the operation completes.
/// Must not be used, or dropped, from inside an async context.
pub struct BlockingCache {
    runtime: Runtime,
    cache: TwoLayerCache,
}

impl BlockingCache {
    pub fn new(store: Arc<dyn SharedStore>, config: CacheConfig) -> Result<Self, CacheError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tiercache-blocking")
            .enable_all()
            .build()
            .map_err(|e| CacheError::Configuration(format!("failed to build runtime: {e}")))?;

        let cache = {
            let _entered = runtime.enter();
            TwoLayerCache::new(store, config)?
        };
        Ok(Self { runtime, cache })
    }

    pub fn with_redis_url(url: &str, config: CacheConfig) -> Result<Self, CacheError> {
        Self::new(Arc::new(RedisStore::open(url)?), config)
    }

    /// The async cache behind this handle.
    pub fn as_async(&self) -> &TwoLayerCache {
        &self.cache
    }

    pub fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>, CacheError> {
        self.runtime.block_on(self.cache.get(key))
    }

    pub fn set(&self, key: &str, value: &[u8], options: &EntryOptions) -> Result<(), CacheError> {
        self.runtime.block_on(self.cache.set(key, value, options))
    }

    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.runtime.block_on(self.cache.remove(key))
    }

    pub fn refresh(&self, key: &str) -> Result<(), CacheError> {
        self.runtime.block_on(self.cache.refresh(key))
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.cache.subscription_state()
    }

    /// Block until the invalidation subscription reaches `state`.
    pub fn wait_for_subscription(&self, state: SubscriptionState) -> SubscriptionState {
        self.runtime.block_on(self.cache.wait_for_subscription(state))
    }

    /// Stop the subscription and the runtime.
    pub fn shutdown(self) {
        self.runtime.block_on(self.cache.shutdown());
    }
}
