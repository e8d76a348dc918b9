//! Distributed lock guarding the scheduler tick
//!
//! Acquire is `SET key token NX PX ttl`; release deletes the key only if it
//! still holds our token, so a holder whose TTL expired can never release a
//! lock someone else has since acquired.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Lock key used by the scheduler
pub const SCHEDULER_LOCK_KEY: &str = "stepiq:scheduler:tick";

/// A unique holder token: `pid:timestamp_ms:nonce`
pub fn lock_token() -> String {
    format!(
        "{}:{}:{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock; false when someone else holds it
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock if `token` still holds it; false otherwise
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Process-local lock for single-process deployments and tests
#[derive(Default)]
pub struct MemoryLock {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((holder, _)) if holder == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(feature = "redis")]
pub use self::redis_lock::RedisLock;

#[cfg(feature = "redis")]
mod redis_lock {
    use super::DistributedLock;
    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use std::time::Duration;

    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    /// Redis-backed lock shared by every worker process
    pub struct RedisLock {
        conn: ConnectionManager,
        release: redis::Script,
    }

    impl RedisLock {
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url).context("Invalid Redis URL")?;
            let conn = ConnectionManager::new(client)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Self {
                conn,
                release: redis::Script::new(RELEASE_SCRIPT),
            })
        }
    }

    #[async_trait]
    impl DistributedLock for RedisLock {
        async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            let mut conn = self.conn.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .context("Failed to acquire lock")?;
            Ok(reply.is_some())
        }

        async fn release(&self, key: &str, token: &str) -> Result<bool> {
            let mut conn = self.conn.clone();
            let deleted: i64 = self
                .release
                .key(key)
                .arg(token)
                .invoke_async(&mut conn)
                .await
                .context("Failed to release lock")?;
            Ok(deleted == 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_carry_pid() {
        let a = lock_token();
        let b = lock_token();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("{}:", std::process::id())));
        assert_eq!(a.split(':').count(), 3);
    }

    #[tokio::test]
    async fn test_only_one_holder() {
        let lock = MemoryLock::new();
        let ttl = Duration::from_secs(30);
        assert!(lock.try_acquire("k", "a", ttl).await.unwrap());
        assert!(!lock.try_acquire("k", "b", ttl).await.unwrap());
        assert!(lock.try_acquire("other", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_reacquired_lock() {
        let lock = MemoryLock::new();
        assert!(lock.try_acquire("k", "old", Duration::from_millis(0)).await.unwrap());
        // Expired: a new holder takes it
        assert!(lock.try_acquire("k", "new", Duration::from_secs(30)).await.unwrap());

        assert!(!lock.release("k", "old").await.unwrap());
        assert!(!lock.try_acquire("k", "third", Duration::from_secs(30)).await.unwrap());
        assert!(lock.release("k", "new").await.unwrap());
        assert!(lock.try_acquire("k", "third", Duration::from_secs(30)).await.unwrap());
    }
}
