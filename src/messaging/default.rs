//! Explicit invalidation messages on a dedicated channel.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MessagePublisher, MessageSubscriber};
use crate::CacheError;
use crate::local_cache::LocalCache;
use crate::message::{Channel, ChannelMessage, InvalidationMessage};
use crate::store::SharedStore;

pub struct DefaultPublisher {
    store: Arc<dyn SharedStore>,
    channel: String,
    publisher_id: Uuid,
}

impl DefaultPublisher {
    pub fn new(store: Arc<dyn SharedStore>, channel: String, publisher_id: Uuid) -> Self {
        Self {
            store,
            channel,
            publisher_id,
        }
    }
}

#[async_trait]
impl MessagePublisher for DefaultPublisher {
    async fn publish(&self, key: &str) -> Result<(), CacheError> {
        let payload = InvalidationMessage::new(key, self.publisher_id).encode()?;
        self.store.publish(&self.channel, &payload).await?;
        debug!(
            "Cache invalidation published on channel '{}': {}",
            self.channel, payload
        );
        Ok(())
    }
}

/// Evicts keys named in invalidation messages from other instances.
///
/// Messages carrying this instance's own id are skipped: the write that
/// produced them already updated L1.
pub struct DefaultSubscriber {
    local: LocalCache,
    channel: String,
    publisher_id: Uuid,
}

impl DefaultSubscriber {
    pub fn new(local: LocalCache, channel: String, publisher_id: Uuid) -> Self {
        Self {
            local,
            channel,
            publisher_id,
        }
    }
}

impl MessageSubscriber for DefaultSubscriber {
    fn channels(&self) -> Vec<Channel> {
        vec![Channel::literal(self.channel.as_str())]
    }

    fn process(&self, message: &ChannelMessage) -> Option<String> {
        let invalidation = match InvalidationMessage::decode(&message.payload) {
            Ok(invalidation) => invalidation,
            Err(e) => {
                warn!(
                    "Unable to parse invalidation payload on channel '{}': {}",
                    message.channel, e
                );
                return None;
            }
        };

        if invalidation.publisher_id == self.publisher_id {
            return None;
        }

        self.local.evict(&invalidation.key);
        debug!("L1 cache invalidated for key: {}", invalidation.key);
        Some(invalidation.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_cache::LocalExpiration;
    use crate::store::MemoryStore;

    fn populated_local() -> LocalCache {
        let local = LocalCache::new("app:", "lock:app:");
        local.insert("k", Arc::from(&b"v"[..]), LocalExpiration::NEVER);
        local.get_or_insert_lock("k", LocalExpiration::NEVER);
        local
    }

    fn message(key: &str, publisher_id: Uuid) -> ChannelMessage {
        let payload = InvalidationMessage::new(key, publisher_id).encode().unwrap();
        ChannelMessage::new("app:Channel", payload)
    }

    #[test]
    fn test_peer_message_evicts_value_and_lock() {
        let local = populated_local();
        let subscriber = DefaultSubscriber::new(local.clone(), "app:Channel".into(), Uuid::new_v4());

        let evicted = subscriber.process(&message("k", Uuid::new_v4()));
        assert_eq!(evicted.as_deref(), Some("k"));
        assert!(local.get("k").is_none());
        assert!(!local.has_lock("k"));
    }

    #[test]
    fn test_own_message_is_ignored() {
        let local = populated_local();
        let id = Uuid::new_v4();
        let subscriber = DefaultSubscriber::new(local.clone(), "app:Channel".into(), id);

        assert!(subscriber.process(&message("k", id)).is_none());
        assert!(local.get("k").is_some());
    }

    #[test]
    fn test_malformed_message_is_ignored() {
        let local = populated_local();
        let subscriber = DefaultSubscriber::new(local.clone(), "app:Channel".into(), Uuid::new_v4());

        assert!(
            subscriber
                .process(&ChannelMessage::new("app:Channel", "k"))
                .is_none()
        );
        assert!(local.get("k").is_some());
    }

    #[tokio::test]
    async fn test_publish_reaches_channel() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let mut subscription = store
            .subscribe(&[Channel::literal("app:Channel")])
            .await
            .unwrap();
        let publisher = DefaultPublisher::new(Arc::new(store.clone()), "app:Channel".into(), id);

        publisher.publish("k").await.unwrap();

        let received = subscription.next_message().await.unwrap();
        let decoded = InvalidationMessage::decode(&received.payload).unwrap();
        assert_eq!(decoded, InvalidationMessage::new("k", id));
    }
}
