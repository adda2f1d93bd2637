//! Eviction driven by the server's keyspace notifications.

use regex::Regex;
use tracing::debug;

use super::MessageSubscriber;
use crate::CacheError;
use crate::local_cache::LocalCache;
use crate::message::{Channel, ChannelMessage};

/// Listens on `__keyspace@*__:<prefix>*`; the channel names the key and the
/// payload names the operation. Only `del` and `hset` evict.
///
/// Like [`super::KeyeventSubscriber`], this also sees this instance's own
/// writes.
pub struct KeyspaceSubscriber {
    local: LocalCache,
    pattern: String,
    channel_prefix: Regex,
}

impl KeyspaceSubscriber {
    pub fn new(local: LocalCache, key_prefix: &str) -> Result<Self, CacheError> {
        let channel_prefix = Regex::new(&format!(
            r"^__keyspace@\d*__:{}",
            regex::escape(key_prefix)
        ))
        .map_err(|e| CacheError::Configuration(format!("invalid key prefix {key_prefix}: {e}")))?;

        Ok(Self {
            local,
            pattern: format!("__keyspace@*__:{key_prefix}*"),
            channel_prefix,
        })
    }
}

impl MessageSubscriber for KeyspaceSubscriber {
    fn channels(&self) -> Vec<Channel> {
        vec![Channel::pattern(self.pattern.as_str())]
    }

    fn process(&self, message: &ChannelMessage) -> Option<String> {
        match message.payload_str()? {
            "del" | "hset" => {}
            _ => return None,
        }
        let matched = self.channel_prefix.find(&message.channel)?;
        let key = &message.channel[matched.end()..];

        self.local.evict(key);
        debug!("L1 cache invalidated by keyspace event for key: {}", key);
        Some(key.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_cache::LocalExpiration;
    use std::sync::Arc;

    fn subscriber() -> (LocalCache, KeyspaceSubscriber) {
        let local = LocalCache::new("app:", "lock:app:");
        local.insert("user:1", Arc::from(&b"v"[..]), LocalExpiration::NEVER);
        let subscriber = KeyspaceSubscriber::new(local.clone(), "app:").unwrap();
        (local, subscriber)
    }

    #[test]
    fn test_channel_names_the_key() {
        let (local, subscriber) = subscriber();
        let evicted = subscriber.process(&ChannelMessage::new("__keyspace@12__:app:user:1", "del"));
        assert_eq!(evicted.as_deref(), Some("user:1"));
        assert!(local.get("user:1").is_none());
    }

    #[test]
    fn test_other_operations_are_ignored() {
        let (local, subscriber) = subscriber();
        let evicted =
            subscriber.process(&ChannelMessage::new("__keyspace@0__:app:user:1", "expire"));
        assert!(evicted.is_none());
        assert!(local.get("user:1").is_some());
    }

    #[test]
    fn test_prefix_is_matched_literally() {
        let local = LocalCache::new("a.b:", "lock:a.b:");
        let subscriber = KeyspaceSubscriber::new(local, "a.b:").unwrap();
        assert!(
            subscriber
                .process(&ChannelMessage::new("__keyspace@0__:axb:user:1", "hset"))
                .is_none()
        );
        assert_eq!(
            subscriber
                .process(&ChannelMessage::new("__keyspace@0__:a.b:user:1", "hset"))
                .as_deref(),
            Some("user:1")
        );
    }
}
