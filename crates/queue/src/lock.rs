//! Named, expiring locks.
//!
//! A lock is held by whoever presents the token it was acquired with. Locks
//! lapse on their own once the expiry passes, which is how work abandoned by
//! a crashed process becomes available again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_common::{AppError, AppResult};
use fred::clients::Client as RedisClient;
use fred::interfaces::{KeysInterface, LuaInterface};
use fred::types::{Expiration, SetOptions};
use tokio::sync::Mutex;
use tracing::debug;

/// Name of the lock serializing batch runs across the fleet.
pub const BATCH_LOCK_NAME: &str = "Transmit:Articles";

/// Compose a lock name from its parts.
#[must_use]
pub fn lock_id(parts: &[&str]) -> String {
    parts.join(":")
}

/// Name of the lock giving one worker the right to transmit to a subscriber.
#[must_use]
pub fn subscriber_lock_name(subscriber_id: &str) -> String {
    lock_id(&["Subscriber", "Transmit", subscriber_id])
}

/// Mutual exclusion keyed by name.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try once to take `name` for `token`. Never waits for a holder.
    async fn try_acquire(&self, name: &str, token: &str, expire: Duration) -> AppResult<bool>;

    /// Release `name` if it is still held by `token`.
    ///
    /// Returns `false` when the lock had already lapsed or changed hands.
    async fn release(&self, name: &str, token: &str) -> AppResult<bool>;
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// Process-local lock table, for tests and single-node runs.
#[derive(Clone, Default)]
pub struct InMemoryLock {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl InMemoryLock {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently held by anyone.
    pub async fn is_held(&self, name: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(name)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, name: &str, token: &str, expire: Duration) -> AppResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some(entry) = entries.get(name) {
            if entry.expires_at > now {
                return Ok(false);
            }
            debug!(lock = %name, "Taking over expired lock");
        }

        entries.insert(
            name.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now + expire,
            },
        );
        Ok(true)
    }

    async fn release(&self, name: &str, token: &str) -> AppResult<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(name) {
            Some(entry) if entry.token == token => {
                entries.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Delete the key only while it still holds the caller's token.
const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
";

/// Redis-backed lock shared by every process using the same Redis.
#[derive(Clone)]
pub struct RedisLock {
    redis: Arc<RedisClient>,
    prefix: String,
}

impl RedisLock {
    /// Create a lock service storing keys under `{prefix}:lock:`.
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:lock:{name}", self.prefix)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, name: &str, token: &str, expire: Duration) -> AppResult<bool> {
        let expire_secs = i64::try_from(expire.as_secs().max(1)).unwrap_or(i64::MAX);

        // NX returns None if the key already exists, Some("OK") if set
        let result: Option<String> = self
            .redis
            .set(
                self.key(name),
                token,
                Some(Expiration::EX(expire_secs)),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;

        Ok(result.is_some())
    }

    async fn release(&self, name: &str, token: &str) -> AppResult<bool> {
        let deleted: i64 = self
            .redis
            .eval(RELEASE_SCRIPT, vec![self.key(name)], vec![token.to_string()])
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;

        Ok(deleted > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_names() {
        assert_eq!(lock_id(&["Transmit", "Articles"]), BATCH_LOCK_NAME);
        assert_eq!(subscriber_lock_name("sub-1"), "Subscriber:Transmit:sub-1");
    }

    #[tokio::test]
    async fn test_second_acquire_fails() {
        let lock = InMemoryLock::new();
        let expire = Duration::from_secs(60);

        assert!(lock.try_acquire("job", "a", expire).await.unwrap());
        assert!(!lock.try_acquire("job", "b", expire).await.unwrap());
        assert!(lock.is_held("job").await);
    }

    #[tokio::test]
    async fn test_release_requires_token() {
        let lock = InMemoryLock::new();
        let expire = Duration::from_secs(60);

        lock.try_acquire("job", "a", expire).await.unwrap();
        assert!(!lock.release("job", "b").await.unwrap());
        assert!(lock.is_held("job").await);

        assert!(lock.release("job", "a").await.unwrap());
        assert!(!lock.is_held("job").await);
        assert!(lock.try_acquire("job", "b", expire).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let lock = InMemoryLock::new();

        lock.try_acquire("job", "a", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(lock.try_acquire("job", "b", Duration::from_secs(60)).await.unwrap());
        // The first holder no longer owns it.
        assert!(!lock.release("job", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_names_are_independent() {
        let lock = InMemoryLock::new();
        let expire = Duration::from_secs(60);

        assert!(lock.try_acquire(&subscriber_lock_name("a"), "t", expire).await.unwrap());
        assert!(lock.try_acquire(&subscriber_lock_name("b"), "t", expire).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let lock = InMemoryLock::new();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let lock = lock.clone();
                tokio::spawn(async move {
                    lock.try_acquire("Subscriber:Transmit:s1", &format!("t{i}"), Duration::from_secs(60))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
