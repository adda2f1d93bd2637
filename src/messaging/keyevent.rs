//! Eviction driven by the server's keyevent notifications.

use tracing::debug;

use super::MessageSubscriber;
use crate::local_cache::LocalCache;
use crate::message::{Channel, ChannelMessage};

const DEL_EVENTS: &str = "__keyevent@*__:del";
const HSET_EVENTS: &str = "__keyevent@*__:hset";

/// Listens for `del` and `hset` keyevents; the payload is the full store key.
///
/// The server reports every client's writes, this instance's included, so
/// a local write is followed by an eviction of the value it just cached.
pub struct KeyeventSubscriber {
    local: LocalCache,
    key_prefix: String,
}

impl KeyeventSubscriber {
    pub fn new(local: LocalCache, key_prefix: &str) -> Self {
        Self {
            local,
            key_prefix: key_prefix.to_owned(),
        }
    }
}

impl MessageSubscriber for KeyeventSubscriber {
    fn channels(&self) -> Vec<Channel> {
        vec![Channel::pattern(DEL_EVENTS), Channel::pattern(HSET_EVENTS)]
    }

    fn process(&self, message: &ChannelMessage) -> Option<String> {
        let store_key = message.payload_str()?;
        let key = store_key.strip_prefix(self.key_prefix.as_str())?;

        self.local.evict(key);
        debug!("L1 cache invalidated by keyevent for key: {}", key);
        Some(key.to_owned())
    }
}
