//! Redis-backed shared tier.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, PubSub};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{SharedStore, Subscription};
use crate::CacheError;
use crate::entry::{
    ABSOLUTE_EXPIRATION_FIELD, EntryOptions, MAX_EXPIRATION, NOT_PRESENT, SLIDING_EXPIRATION_FIELD,
    duration_to_ticks, system_time_to_ticks, ticks_to_duration, ticks_to_system_time,
    time_to_live,
};
use crate::message::{Channel, ChannelMessage};

/// Writes all hash fields and the key TTL in one step, clearing the TTL of
/// a replaced entry when the new one does not expire.
///
/// KEYS[1] = key, ARGV = absexp, sldexp, ttl in milliseconds (-1 for none), data
const SET_SCRIPT: &str = r"
redis.call('HSET', KEYS[1], 'absexp', ARGV[1], 'sldexp', ARGV[2], 'data', ARGV[4])
if ARGV[3] ~= '-1' then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
else
  redis.call('PERSIST', KEYS[1])
end
return 1
";

/// Shared tier on a Redis server.
///
/// The command connection is opened on first use and then shared; each
/// subscription gets its own pub/sub connection.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    set_script: redis::Script,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            connection: OnceCell::new(),
            set_script: redis::Script::new(SET_SCRIPT),
        }
    }

    /// Build a store from a connection URL such as `redis://localhost:6379`.
    ///
    /// Only the URL is checked here; nothing is connected yet.
    pub fn open(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Configuration(format!("invalid Redis URL {url}: {e}")))?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    /// Set a server configuration parameter, e.g. `notify-keyspace-events`.
    pub async fn config_set(&self, name: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg(name)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Option<Duration>) -> i64 {
    match ttl {
        // PEXPIRE 0 deletes the key; keep it for at least a millisecond.
        Some(ttl) => i64::try_from(ttl.min(MAX_EXPIRATION).as_millis())
            .unwrap_or(i64::MAX)
            .max(1),
        None => NOT_PRESENT,
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        Ok(conn.hgetall::<_, HashMap<String, Vec<u8>>>(key).await?)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &EntryOptions,
    ) -> Result<(), CacheError> {
        let now = SystemTime::now();
        options.validate(now)?;

        let ttl = time_to_live(
            options.absolute_deadline(now),
            options.sliding_expiration,
            now,
        );
        let absolute = options
            .absolute_deadline(now)
            .map(system_time_to_ticks)
            .unwrap_or(NOT_PRESENT);
        let sliding = options
            .sliding_expiration
            .map(duration_to_ticks)
            .unwrap_or(NOT_PRESENT);

        let mut invocation = self.set_script.key(key);
        invocation
            .arg(absolute)
            .arg(sliding)
            .arg(ttl_millis(ttl))
            .arg(value);

        let mut conn = self.connection().await?;
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        debug!("Redis SET for key: {} (ttl: {:?})", key, ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn refresh(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let (absolute, sliding): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(key)
            .arg(ABSOLUTE_EXPIRATION_FIELD)
            .arg(SLIDING_EXPIRATION_FIELD)
            .query_async(&mut conn)
            .await?;

        let Some(sliding) = sliding
            .filter(|ticks| *ticks != NOT_PRESENT)
            .and_then(ticks_to_duration)
        else {
            return Ok(());
        };
        let absolute = absolute
            .filter(|ticks| *ticks != NOT_PRESENT)
            .and_then(ticks_to_system_time);

        let ttl = time_to_live(absolute, Some(sliding), SystemTime::now());
        conn.pexpire::<_, ()>(key, ttl_millis(ttl)).await?;
        debug!("Redis refresh for key: {} (ttl: {:?})", key, ttl);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn config_get(&self, name: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let mut values: HashMap<String, String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(name)
            .query_async(&mut conn)
            .await?;
        Ok(values.remove(name))
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<Box<dyn Subscription>, CacheError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            match channel {
                Channel::Literal(name) => pubsub.subscribe(name).await?,
                Channel::Pattern(pattern) => pubsub.psubscribe(pattern).await?,
            }
            debug!("Redis subscribed to {:?}", channel);
        }

        Ok(Box::new(RedisSubscription {
            pubsub,
            channels: channels.to_vec(),
        }))
    }
}

struct RedisSubscription {
    pubsub: PubSub,
    channels: Vec<Channel>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Option<ChannelMessage> {
        let msg = self.pubsub.on_message().next().await?;
        Some(ChannelMessage::new(
            msg.get_channel_name(),
            msg.get_payload_bytes(),
        ))
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), CacheError> {
        let RedisSubscription {
            mut pubsub,
            channels,
        } = *self;
        for channel in &channels {
            match channel {
                Channel::Literal(name) => pubsub.unsubscribe(name).await?,
                Channel::Pattern(pattern) => pubsub.punsubscribe(pattern).await?,
            }
        }
        Ok(())
    }
}
