//! Background task keeping the invalidation subscription alive.
//!
//! The task verifies the server configuration, subscribes, and feeds
//! incoming messages to the [`MessageSubscriber`]. Connection failures are
//! logged and retried after a fixed delay, forever; a lost subscription is
//! re-established the same way. Cache operations never see these errors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::CacheError;
use crate::message::ChannelMessage;
use crate::messaging::MessageSubscriber;
use crate::store::{SharedStore, Subscription};
use crate::verifier::ConfigurationVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed,
    Subscribing,
    Subscribed,
    /// Shut down after having been subscribed.
    Unsubscribed,
}

/// Notifications about invalidation traffic, for hosts and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The subscription was (re-)established.
    Subscribed,
    /// A message evicted `key` from L1.
    MessageReceived { key: String },
}

/// Owns the subscription task of one cache instance.
pub struct SubscriptionManager {
    state: watch::Receiver<SubscriptionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct SubscriptionWorker {
    store: Arc<dyn SharedStore>,
    subscriber: Arc<dyn MessageSubscriber>,
    verifier: ConfigurationVerifier,
    retry_delay: Duration,
    state: watch::Sender<SubscriptionState>,
    events: broadcast::Sender<CacheEvent>,
}

enum Next {
    Cancelled,
    Message(Option<ChannelMessage>),
}

impl SubscriptionManager {
    /// Spawn the subscription task on the current Tokio runtime.
    pub fn start(
        store: Arc<dyn SharedStore>,
        subscriber: Arc<dyn MessageSubscriber>,
        verifier: ConfigurationVerifier,
        retry_delay: Duration,
        events: broadcast::Sender<CacheEvent>,
    ) -> Result<Self, CacheError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CacheError::Configuration(format!("cache must be created inside a Tokio runtime: {e}"))
        })?;

        let (state_tx, state) = watch::channel(SubscriptionState::NotSubscribed);
        let cancel = CancellationToken::new();
        let worker = SubscriptionWorker {
            store,
            subscriber,
            verifier,
            retry_delay,
            state: state_tx,
            events,
        };
        let task = runtime.spawn(worker.run(cancel.clone()));

        Ok(Self {
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Wait until the subscription reaches `target`.
    ///
    /// Returns immediately if it already has; returns early if the task ended
    /// without reaching it.
    pub async fn wait_for(&self, target: SubscriptionState) -> SubscriptionState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == target).await.map(|current| *current);
        match reached {
            Ok(current) => current,
            Err(_) => *state.borrow(),
        }
    }

    /// Stop the task and unsubscribe. Later calls do nothing.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!("Subscription task failed: {}", e);
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SubscriptionWorker {
    async fn run(self, cancel: CancellationToken) {
        loop {
            self.state.send_replace(SubscriptionState::Subscribing);

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                attempt = self.subscribe() => attempt,
            };

            match attempt {
                Ok(subscription) => {
                    self.state.send_replace(SubscriptionState::Subscribed);
                    let _ = self.events.send(CacheEvent::Subscribed);
                    info!(
                        "Subscribed for {:?} cache invalidation",
                        self.verifier.messaging_type()
                    );

                    if let Some(subscription) = self.listen(subscription, &cancel).await {
                        if let Err(e) = subscription.unsubscribe().await {
                            warn!("Failed to unsubscribe: {}", e);
                        }
                        self.state.send_replace(SubscriptionState::Unsubscribed);
                        return;
                    }
                    warn!("Invalidation subscription lost; resubscribing");
                }
                Err(e) if e.is_connection() => {
                    warn!(
                        "Failed to initialize subscriber; retrying in {:?}: {}",
                        self.retry_delay, e
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(e) => {
                    error!("Failed to initialize subscriber: {}", e);
                    break;
                }
            }
        }

        self.state.send_replace(SubscriptionState::NotSubscribed);
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>, CacheError> {
        match self.verifier.verify(self.store.as_ref()).await {
            Ok(true) => {}
            Ok(false) => error!(
                "Redis notify-keyspace-events config is invalid for messaging type {:?}",
                self.verifier.messaging_type()
            ),
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => warn!("Unable to verify notify-keyspace-events config: {}", e),
        }

        self.store.subscribe(&self.subscriber.channels()).await
    }

    /// Process messages until cancelled or the subscription ends.
    ///
    /// Hands the subscription back on cancellation so it can be closed.
    async fn listen(
        &self,
        mut subscription: Box<dyn Subscription>,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn Subscription>> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                message = subscription.next_message() => Next::Message(message),
            };

            match next {
                Next::Cancelled => return Some(subscription),
                Next::Message(None) => return None,
                Next::Message(Some(message)) => {
                    if let Some(key) = self.subscriber.process(&message) {
                        let _ = self.events.send(CacheEvent::MessageReceived { key });
                    } else {
                        debug!("Ignored message on channel '{}'", message.channel);
                    }
                }
            }
        }
    }
}
