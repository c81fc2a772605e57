//! Redis integration tests.
//!
//! These tests require a running Redis instance.
//! Run with: `cargo test --test redis_integration -- --ignored`
//!
//! Set `REDIS_URL` environment variable to point to your Redis instance.
//! Default: <redis://localhost:6379>

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use courier_queue::{BATCH_LOCK_NAME, DistributedLock, RedisLock, subscriber_lock_name};
use fred::prelude::*;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn connect() -> Arc<fred::clients::Client> {
    let config = fred::types::config::Config::from_url(&get_redis_url()).expect("Invalid Redis URL");
    let client = fred::clients::Client::new(config, None, None, None);
    client.connect();
    client.wait_for_connect().await.expect("Failed to connect to Redis");
    Arc::new(client)
}

/// A prefix per test run so parallel runs do not collide.
fn test_prefix(name: &str) -> String {
    format!("courier-test:{name}:{}", std::process::id())
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_acquire_is_exclusive() {
    let lock = RedisLock::new(connect().await, test_prefix("exclusive"));
    let expire = Duration::from_secs(30);

    assert!(lock.try_acquire(BATCH_LOCK_NAME, "first", expire).await.unwrap());
    assert!(!lock.try_acquire(BATCH_LOCK_NAME, "second", expire).await.unwrap());

    assert!(lock.release(BATCH_LOCK_NAME, "first").await.unwrap());
    assert!(lock.try_acquire(BATCH_LOCK_NAME, "second", expire).await.unwrap());
    assert!(lock.release(BATCH_LOCK_NAME, "second").await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_release_checks_token() {
    let lock = RedisLock::new(connect().await, test_prefix("token"));
    let name = subscriber_lock_name("sub-1");

    assert!(lock.try_acquire(&name, "owner", Duration::from_secs(30)).await.unwrap());
    assert!(!lock.release(&name, "intruder").await.unwrap());
    assert!(!lock.try_acquire(&name, "intruder", Duration::from_secs(30)).await.unwrap());
    assert!(lock.release(&name, "owner").await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_lock_expires() {
    let lock = RedisLock::new(connect().await, test_prefix("expiry"));
    let name = subscriber_lock_name("sub-2");

    assert!(lock.try_acquire(&name, "crashed", Duration::from_secs(1)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(lock.try_acquire(&name, "next", Duration::from_secs(30)).await.unwrap());
    // The crashed holder cannot release its successor's lock.
    assert!(!lock.release(&name, "crashed").await.unwrap());
    assert!(lock.release(&name, "next").await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_concurrent_acquire_single_winner() {
    let lock = Arc::new(RedisLock::new(connect().await, test_prefix("race")));
    let name = subscriber_lock_name("sub-3");

    let mut handles = Vec::new();
    for i in 0..16 {
        let lock = lock.clone();
        let name = name.clone();
        handles.push(tokio::spawn(async move {
            lock.try_acquire(&name, &format!("worker-{i}"), Duration::from_secs(30))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let client = connect().await;
    let _: i64 = client
        .del(format!("{}:lock:{name}", test_prefix("race")))
        .await
        .unwrap();
}
