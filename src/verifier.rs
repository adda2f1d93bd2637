//! Checks that the server emits the notifications a messaging type relies on.

use crate::store::SharedStore;
use crate::{CacheError, MessagingType};

/// Server parameter holding the enabled notification classes.
pub const NOTIFY_KEYSPACE_EVENTS: &str = "notify-keyspace-events";

/// Classes the server's `A` flag stands for.
const ALL_EVENT_CLASSES: &str = "g$lshzxetd";

/// Whether a `notify-keyspace-events` value enables `flag`.
pub(crate) fn notify_flags_enable(configured: &str, flag: char) -> bool {
    configured.contains(flag) || (configured.contains('A') && ALL_EVENT_CLASSES.contains(flag))
}

/// Compares the server's `notify-keyspace-events` setting with what the
/// configured [`MessagingType`] needs.
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationVerifier {
    messaging_type: MessagingType,
}

impl ConfigurationVerifier {
    pub fn new(messaging_type: MessagingType) -> Self {
        Self { messaging_type }
    }

    pub fn messaging_type(&self) -> MessagingType {
        self.messaging_type
    }

    /// `Ok(false)` means the server is reachable but misconfigured.
    ///
    /// [`MessagingType::Default`] needs nothing from the server and is
    /// verified without a round trip.
    pub async fn verify(&self, store: &dyn SharedStore) -> Result<bool, CacheError> {
        let required = self.messaging_type.required_notify_flags();
        if required.is_empty() {
            return Ok(true);
        }

        let configured = store
            .config_get(NOTIFY_KEYSPACE_EVENTS)
            .await?
            .unwrap_or_default();
        Ok(required
            .chars()
            .all(|flag| notify_flags_enable(&configured, flag)))
    }
}
