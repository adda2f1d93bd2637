//! Cache configuration

use std::time::Duration;

use uuid::Uuid;

use crate::{CacheError, MessagingType};

/// Configuration for the two-layer cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix applied to every key in the shared store (e.g. `"myapp:"`)
    pub instance_name: String,
    /// How L1 evictions are propagated between instances
    pub messaging_type: MessagingType,
    /// Delay before retrying a failed subscription
    pub subscriber_retry_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            instance_name: String::new(),
            messaging_type: MessagingType::Default,
            subscriber_retry_delay: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            ..Self::default()
        }
    }

    pub fn with_messaging_type(mut self, messaging_type: MessagingType) -> Self {
        self.messaging_type = messaging_type;
        self
    }

    pub fn with_subscriber_retry_delay(mut self, delay: Duration) -> Self {
        self.subscriber_retry_delay = delay;
        self
    }

    /// Prefix applied to logical keys in the shared store
    pub fn key_prefix(&self) -> &str {
        &self.instance_name
    }

    /// Shared-store key for a logical key
    pub fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.instance_name, key)
    }

    /// The pub/sub channel used by [`MessagingType::Default`]
    pub fn channel(&self) -> String {
        format!("{}Channel", self.instance_name)
    }

    /// Prefix for per-key lock entries in L1.
    ///
    /// Includes the instance id so lock entries can never collide with data
    /// keys, nor with another instance's lock entries.
    pub fn lock_key_prefix(&self, instance_id: Uuid) -> String {
        format!("{}:{}", instance_id, self.instance_name)
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.subscriber_retry_delay.is_zero() {
            return Err(CacheError::Configuration(
                "subscriber_retry_delay must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.messaging_type, MessagingType::Default);
        assert_eq!(config.subscriber_retry_delay, Duration::from_secs(5));
        assert_eq!(config.channel(), "Channel");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_key_naming() {
        let config = CacheConfig::new("app:");
        assert_eq!(config.prefixed_key("user:1"), "app:user:1");
        assert_eq!(config.channel(), "app:Channel");

        let id = Uuid::nil();
        assert_eq!(
            config.lock_key_prefix(id),
            "00000000-0000-0000-0000-000000000000:app:"
        );
    }

    #[test]
    fn test_zero_retry_delay_is_rejected() {
        let config = CacheConfig::new("app:").with_subscriber_retry_delay(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(CacheError::Configuration(_))
        ));
    }
}
