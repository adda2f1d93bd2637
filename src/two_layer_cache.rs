use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entry::{EntryOptions, StoredEntry};
use crate::key_lock::KeyLocks;
use crate::local_cache::{LocalCache, LocalExpiration};
use crate::messaging::{MessagePublisher, Messaging};
use crate::store::{RedisStore, SharedStore};
use crate::subscription::{CacheEvent, SubscriptionManager, SubscriptionState};
use crate::verifier::ConfigurationVerifier;
use crate::{CacheConfig, CacheError};

const EVENT_CAPACITY: usize = 256;

/// Process-local L1 in front of a shared L2 store.
///
/// Reads are served from L1 when possible and otherwise read through from
/// the shared store; writes go to the shared store first and then to L1.
/// Other instances sharing the store drop their stale L1 copies when they
/// receive the invalidation for a changed key.
///
/// Clones share one instance. Dropping the last clone stops the background
/// subscription; [`TwoLayerCache::shutdown`] also waits for it to close.
#[derive(Clone)]
pub struct TwoLayerCache {
    inner: Arc<TwoLayerCacheInner>,
}

struct TwoLayerCacheInner {
    config: CacheConfig,
    instance_id: Uuid,
    store: Arc<dyn SharedStore>,
    local: LocalCache,
    locks: KeyLocks,
    publisher: Arc<dyn MessagePublisher>,
    subscription: SubscriptionManager,
    events: broadcast::Sender<CacheEvent>,
}

impl TwoLayerCache {
    /// Create a cache over `store` and start subscribing for invalidations.
    ///
    /// Must be called within a Tokio runtime. An unreachable store is not an
    /// error here: the subscription keeps retrying in the background.
    pub fn new(store: Arc<dyn SharedStore>, config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        let instance_id = Uuid::new_v4();
        let local = LocalCache::new(config.key_prefix(), &config.lock_key_prefix(instance_id));
        let messaging = Messaging::new(&config, instance_id, Arc::clone(&store), local.clone())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let subscription = SubscriptionManager::start(
            Arc::clone(&store),
            messaging.subscriber,
            ConfigurationVerifier::new(config.messaging_type),
            config.subscriber_retry_delay,
            events.clone(),
        )?;

        debug!(
            "Created cache '{}' with instance id {} ({:?} messaging)",
            config.instance_name, instance_id, config.messaging_type
        );

        Ok(Self {
            inner: Arc::new(TwoLayerCacheInner {
                locks: KeyLocks::new(local.clone()),
                local,
                instance_id,
                store,
                publisher: messaging.publisher,
                subscription,
                events,
                config,
            }),
        })
    }

    /// Create a cache backed by the Redis server at `url`.
    pub fn with_redis_url(url: &str, config: CacheConfig) -> Result<Self, CacheError> {
        Self::new(Arc::new(RedisStore::open(url)?), config)
    }

    /// Identifier stamped on this instance's invalidation messages.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The L1 tier, keyed without the instance prefix.
    pub fn local(&self) -> &LocalCache {
        &self.inner.local
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.inner.subscription.state()
    }

    /// Wait until the invalidation subscription reaches `state`.
    pub async fn wait_for_subscription(&self, state: SubscriptionState) -> SubscriptionState {
        self.inner.subscription.wait_for(state).await
    }

    /// Receive subscription and eviction events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Get the value for `key`, reading through to the shared store on an L1
    /// miss.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<[u8]>>, CacheError> {
        if let Some(value) = self.inner.local.get(key) {
            debug!("Cache hit L1 for key: {}", key);
            return Ok(Some(value));
        }

        debug!("Cache miss L1 for key: {}", key);

        let store_key = self.inner.config.prefixed_key(key);
        if !self.inner.store.exists(&store_key).await? {
            debug!("Cache miss L2 for key: {}", key);
            return Ok(None);
        }

        let guard = self.inner.locks.acquire(key, None).await;

        // Filled by another reader while we waited for the lock.
        if let Some(value) = self.inner.local.get(key) {
            debug!("Cache hit L1 for key (after lock): {}", key);
            return Ok(Some(value));
        }

        let fields = match self.inner.store.hash_get_all(&store_key).await {
            Ok(fields) => fields,
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => {
                warn!("L2 hash read error for key {} ({}). Treating as empty.", key, e);
                HashMap::new()
            }
        };

        let stored = StoredEntry::from_fields(&fields);
        let Some(data) = stored.data else {
            debug!("Cache miss L2 for key (expired): {}", key);
            // No value to tie the lock's expiration to.
            self.inner.locks.remove(key);
            return Ok(None);
        };
        debug!("Cache hit L2 for key: {}", key);

        let value: Arc<[u8]> = Arc::from(data);
        let expiration = LocalExpiration::from_options(&stored.options, SystemTime::now());
        if expiration.is_sliding() {
            // Not kept in L1, so the store sees every access.
            if let Err(e) = self.inner.store.refresh(&store_key).await {
                warn!("L2 refresh error for key {}: {}. Continuing.", key, e);
            }
        }
        self.inner.local.insert(key, Arc::clone(&value), expiration);
        self.inner.locks.persist(&guard, &stored.options);

        Ok(Some(value))
    }

    /// Write `value` to the shared store and L1, then announce the change.
    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &EntryOptions,
    ) -> Result<(), CacheError> {
        let now = SystemTime::now();
        options.validate(now)?;

        let guard = self.inner.locks.acquire(key, Some(options)).await;

        let store_key = self.inner.config.prefixed_key(key);
        self.inner.store.set(&store_key, value, options).await?;

        let expiration = LocalExpiration::from_options(options, now);
        if !self.inner.local.insert(key, Arc::from(value), expiration) {
            debug!("Sliding entry kept out of L1 for key: {}", key);
        }
        self.inner.locks.persist(&guard, options);

        self.publish(key).await;
        Ok(())
    }

    /// Delete `key` from both tiers and announce the removal.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.inner.locks.acquire(key, None).await;

        let store_key = self.inner.config.prefixed_key(key);
        self.inner.store.remove(&store_key).await?;
        self.inner.local.remove(key);

        self.publish(key).await;
        self.inner.locks.remove(key);
        debug!("Removed key: {}", key);
        Ok(())
    }

    /// Reset the sliding expiration of `key` in the shared store.
    pub async fn refresh(&self, key: &str) -> Result<(), CacheError> {
        let store_key = self.inner.config.prefixed_key(key);
        self.inner.store.refresh(&store_key).await
    }

    /// Stop the invalidation subscription and wait for it to close.
    pub async fn shutdown(&self) {
        self.inner.subscription.shutdown().await;
        debug!("Cache '{}' shut down", self.inner.config.instance_name);
    }

    async fn publish(&self, key: &str) {
        if let Err(e) = self.inner.publisher.publish(key).await {
            warn!(
                "Invalidation publish error for key {}: {}. Continuing.",
                key, e
            );
        }
    }
}
