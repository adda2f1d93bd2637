//! Integration tests against a real Redis server.
//!
//! Tests use testcontainers to spin up Redis and need a Docker daemon; run
//! them with `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tiercache::{
    CacheConfig, CacheEvent, EntryOptions, MessagingType, RedisStore, SharedStore,
    SubscriptionState, TwoLayerCache,
};
use tokio::sync::{OnceCell, broadcast};
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

const WAIT: Duration = Duration::from_secs(5);

async fn get_redis_url() -> String {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn cache(instance_name: &str, messaging_type: MessagingType) -> TwoLayerCache {
    let store = RedisStore::open(&get_redis_url().await).expect("open store");
    store
        .config_set("notify-keyspace-events", "AKE")
        .await
        .expect("configure notifications");

    let config = CacheConfig::new(instance_name)
        .with_messaging_type(messaging_type)
        .with_subscriber_retry_delay(Duration::from_millis(200));
    let cache = TwoLayerCache::new(Arc::new(store), config).expect("create cache");
    timeout(WAIT, cache.wait_for_subscription(SubscriptionState::Subscribed))
        .await
        .expect("subscribe");
    cache
}

async fn next_eviction(events: &mut broadcast::Receiver<CacheEvent>) -> String {
    timeout(WAIT, async {
        loop {
            if let Ok(CacheEvent::MessageReceived { key }) = events.recv().await {
                return key;
            }
        }
    })
    .await
    .expect("no eviction received")
}

async fn assert_two_instances_stay_coherent(instance_name: &str, messaging_type: MessagingType) {
    let a = cache(instance_name, messaging_type).await;
    let b = cache(instance_name, messaging_type).await;
    let mut b_events = b.subscribe_events();
    let hour =
        EntryOptions::new().with_absolute_expiration_relative_to_now(Duration::from_secs(3600));

    a.set("a1", b"x", &hour).await.unwrap();
    assert_eq!(next_eviction(&mut b_events).await, "a1");
    assert_eq!(b.get("a1").await.unwrap().as_deref(), Some(&b"x"[..]));

    a.remove("a1").await.unwrap();
    assert_eq!(next_eviction(&mut b_events).await, "a1");
    assert!(b.get("a1").await.unwrap().is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_default_messaging() {
    assert_two_instances_stay_coherent("default:", MessagingType::Default).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_keyevent_messaging() {
    assert_two_instances_stay_coherent("keyevent:", MessagingType::KeyeventNotifications).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_keyspace_messaging() {
    assert_two_instances_stay_coherent("keyspace:", MessagingType::KeyspaceNotifications).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_entry_layout_and_expiration() {
    let url = get_redis_url().await;
    let cache = cache("layout:", MessagingType::Default).await;
    let options = EntryOptions::new()
        .with_absolute_expiration_relative_to_now(Duration::from_secs(60))
        .with_sliding_expiration(Duration::from_secs(1));

    cache.set("k", b"v", &options).await.unwrap();

    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let fields: Vec<String> = redis::cmd("HKEYS")
        .arg("layout:k")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(fields.contains(&"data".to_owned()));
    assert!(fields.contains(&"absexp".to_owned()));
    assert!(fields.contains(&"sldexp".to_owned()));

    let ttl: i64 = redis::cmd("PTTL")
        .arg("layout:k")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 1000);

    // Sliding entries are read from Redis each time and kept alive by reads.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(cache.get("k").await.unwrap().is_some());
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(cache.get("k").await.unwrap().is_none());

    cache.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_overwrite_clears_previous_ttl() {
    let url = get_redis_url().await;
    let cache = cache("overwrite:", MessagingType::Default).await;
    let client = redis::Client::open(url).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();

    let minute =
        EntryOptions::new().with_absolute_expiration_relative_to_now(Duration::from_secs(60));
    cache.set("k", b"v0", &minute).await.unwrap();
    let ttl: i64 = redis::cmd("PTTL")
        .arg("overwrite:k")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0);

    cache.set("k", b"v1", &EntryOptions::new()).await.unwrap();
    let ttl: i64 = redis::cmd("PTTL")
        .arg("overwrite:k")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(ttl, -1);

    cache.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_unreachable_server() {
    let store = RedisStore::open("redis://127.0.0.1:1").unwrap();
    assert!(store.exists("k").await.unwrap_err().is_connection());

    let config = CacheConfig::new("down:").with_subscriber_retry_delay(Duration::from_millis(50));
    let cache = TwoLayerCache::new(Arc::new(store), config).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cache.subscription_state(), SubscriptionState::Subscribing);
    assert!(cache.get("k").await.unwrap_err().is_connection());
    cache.shutdown().await;
}
