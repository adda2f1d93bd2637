//! Propagation of L1 evictions between cache instances.
//!
//! Each [`MessagingType`] pairs a [`MessagePublisher`], run after every
//! write to the shared store, with a [`MessageSubscriber`] that turns
//! incoming pub/sub messages into L1 evictions. All instances sharing a key
//! prefix must use the same type.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::local_cache::LocalCache;
use crate::message::{Channel, ChannelMessage};
use crate::store::SharedStore;
use crate::{CacheConfig, CacheError};

mod default;
mod keyevent;
mod keyspace;

pub use default::{DefaultPublisher, DefaultSubscriber};
pub use keyevent::KeyeventSubscriber;
pub use keyspace::KeyspaceSubscriber;

/// How instances learn that another instance changed a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessagingType {
    /// Explicit invalidation messages on `<prefix>Channel`. Needs no server
    /// configuration.
    #[default]
    Default,
    /// Native keyevent notifications; the server needs at least `ghE` in
    /// `notify-keyspace-events`.
    KeyeventNotifications,
    /// Native keyspace notifications; the server needs at least `ghK` in
    /// `notify-keyspace-events`.
    KeyspaceNotifications,
}

impl MessagingType {
    /// `notify-keyspace-events` flags this type depends on.
    pub fn required_notify_flags(self) -> &'static str {
        match self {
            MessagingType::Default => "",
            MessagingType::KeyeventNotifications => "ghE",
            MessagingType::KeyspaceNotifications => "ghK",
        }
    }
}

/// Announces changes made by this instance.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, key: &str) -> Result<(), CacheError>;
}

/// Turns messages from the shared store into L1 evictions.
pub trait MessageSubscriber: Send + Sync {
    /// Channels to listen on.
    fn channels(&self) -> Vec<Channel>;

    /// Apply `message` to the local tier, returning the evicted key.
    fn process(&self, message: &ChannelMessage) -> Option<String>;
}

/// Publisher for types where the server itself announces changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPublisher;

#[async_trait]
impl MessagePublisher for NopPublisher {
    async fn publish(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// The publisher/subscriber pair for one cache instance.
#[derive(Clone)]
pub struct Messaging {
    pub publisher: Arc<dyn MessagePublisher>,
    pub subscriber: Arc<dyn MessageSubscriber>,
}

impl Messaging {
    /// Build the pair selected by `config.messaging_type`.
    pub fn new(
        config: &CacheConfig,
        instance_id: Uuid,
        store: Arc<dyn SharedStore>,
        local: LocalCache,
    ) -> Result<Self, CacheError> {
        let messaging = match config.messaging_type {
            MessagingType::Default => Self {
                publisher: Arc::new(DefaultPublisher::new(store, config.channel(), instance_id)),
                subscriber: Arc::new(DefaultSubscriber::new(local, config.channel(), instance_id)),
            },
            MessagingType::KeyeventNotifications => Self {
                publisher: Arc::new(NopPublisher),
                subscriber: Arc::new(KeyeventSubscriber::new(local, config.key_prefix())),
            },
            MessagingType::KeyspaceNotifications => Self {
                publisher: Arc::new(NopPublisher),
                subscriber: Arc::new(KeyspaceSubscriber::new(local, config.key_prefix())?),
            },
        };
        Ok(messaging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn channels_for(messaging_type: MessagingType) -> Vec<Channel> {
        let config = CacheConfig::new("app:").with_messaging_type(messaging_type);
        let messaging = Messaging::new(
            &config,
            Uuid::new_v4(),
            Arc::new(MemoryStore::new()),
            LocalCache::new("app:", "lock:app:"),
        )
        .unwrap();
        messaging.subscriber.channels()
    }

    #[test]
    fn test_channels_per_type() {
        assert_eq!(
            channels_for(MessagingType::Default),
            vec![Channel::literal("app:Channel")]
        );
        assert_eq!(
            channels_for(MessagingType::KeyeventNotifications),
            vec![
                Channel::pattern("__keyevent@*__:del"),
                Channel::pattern("__keyevent@*__:hset"),
            ]
        );
        assert_eq!(
            channels_for(MessagingType::KeyspaceNotifications),
            vec![Channel::pattern("__keyspace@*__:app:*")]
        );
    }

    #[test]
    fn test_required_flags() {
        assert_eq!(MessagingType::default().required_notify_flags(), "");
        assert_eq!(
            MessagingType::KeyeventNotifications.required_notify_flags(),
            "ghE"
        );
        assert_eq!(
            MessagingType::KeyspaceNotifications.required_notify_flags(),
            "ghK"
        );
    }
}
