//! Global task concurrency limiter
//!
//! Bounds the number of concurrently running task engines. The shared
//! implementation keeps live slot tokens in a sorted set scored by wall-clock
//! expiry: acquisition purges expired tokens and admits the caller only while
//! the live count is under the limit, all in one script. Slots carry a TTL
//! renewed by the running engine, so a crashed holder's slot is reclaimed by
//! a later acquirer. The local fallback is a counting semaphore.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use podcast_tts_config::{EngineConfig, StoreConfig};
use podcast_tts_core::epoch_ms;

/// Limiter errors
#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("concurrency limit reached")]
    Busy,

    #[error("shared store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for LimiterError {
    fn from(e: redis::RedisError) -> Self {
        LimiterError::Store(e.to_string())
    }
}

/// One unit of global task concurrency.
#[derive(Debug, Clone)]
pub struct TaskSlot {
    pub token: String,
}

impl TaskSlot {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Fleet-wide concurrency gate for task engines.
#[async_trait]
pub trait TaskLimiter: Send + Sync {
    /// Acquire a slot, waiting up to `wait`. Fails with `Busy` on exhaustion.
    async fn acquire(&self, token_id: &str, wait: Duration) -> Result<TaskSlot, LimiterError>;

    /// Extend the slot's lease. The engine calls this periodically while a
    /// task runs.
    async fn renew(&self, slot: &TaskSlot) -> Result<(), LimiterError>;

    /// Release the slot. Releasing an already-released slot is a no-op.
    async fn release(&self, slot: &TaskSlot) -> Result<(), LimiterError>;

    /// Configured ceiling. Never exposes internal counters.
    fn capacity(&self) -> usize;
}

/// In-process fallback limiter.
pub struct LocalTaskLimiter {
    semaphore: std::sync::Arc<Semaphore>,
    held: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    capacity: usize,
}

impl LocalTaskLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: std::sync::Arc::new(Semaphore::new(capacity)),
            held: Mutex::new(HashMap::new()),
            capacity,
        }
    }
}

#[async_trait]
impl TaskLimiter for LocalTaskLimiter {
    async fn acquire(&self, token_id: &str, wait: Duration) -> Result<TaskSlot, LimiterError> {
        if self.held.lock().contains_key(token_id) {
            return Err(LimiterError::Busy);
        }

        let permit = tokio::time::timeout(wait, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| LimiterError::Busy)?
            .map_err(|_| LimiterError::Store("semaphore closed".to_string()))?;

        self.held.lock().insert(token_id.to_string(), permit);
        Ok(TaskSlot::new(token_id))
    }

    async fn renew(&self, _slot: &TaskSlot) -> Result<(), LimiterError> {
        // Local slots cannot leak across processes; nothing to extend.
        Ok(())
    }

    async fn release(&self, slot: &TaskSlot) -> Result<(), LimiterError> {
        self.held.lock().remove(&slot.token);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

const ACQUIRE_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if redis.call('ZSCORE', KEYS[1], ARGV[4]) then
    return 0
end
if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
    return 1
end
return 0
"#;

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shared limiter over a sorted set of expiring slot tokens.
pub struct RedisTaskLimiter {
    conn: ConnectionManager,
    key: String,
    capacity: usize,
    slot_ttl: Duration,
}

impl RedisTaskLimiter {
    pub async fn connect(
        store: &StoreConfig,
        engine: &EngineConfig,
    ) -> Result<Self, LimiterError> {
        let client = redis::Client::open(store.redis_url.as_str())?;
        let mut conn =
            tokio::time::timeout(store.probe_timeout(), ConnectionManager::new(client))
                .await
                .map_err(|_| LimiterError::Store("connectivity probe timed out".to_string()))??;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(LimiterError::Store(format!("unexpected probe reply: {pong}")));
        }

        Ok(Self {
            conn,
            key: format!("{}:slots", store.namespace),
            capacity: engine.max_concurrent_tasks,
            slot_ttl: engine.slot_ttl(),
        })
    }

    async fn try_acquire_once(&self, token: &str) -> Result<bool, LimiterError> {
        let mut conn = self.conn.clone();
        let now = epoch_ms();
        let expiry = now + self.slot_ttl.as_millis() as i64;
        let admitted: i64 = Script::new(ACQUIRE_SCRIPT)
            .key(&self.key)
            .arg(now)
            .arg(self.capacity)
            .arg(expiry)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }
}

#[async_trait]
impl TaskLimiter for RedisTaskLimiter {
    async fn acquire(&self, token_id: &str, wait: Duration) -> Result<TaskSlot, LimiterError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.try_acquire_once(token_id).await? {
                return Ok(TaskSlot::new(token_id));
            }
            if tokio::time::Instant::now() + ACQUIRE_POLL_INTERVAL > deadline {
                return Err(LimiterError::Busy);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn renew(&self, slot: &TaskSlot) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        let expiry = epoch_ms() + self.slot_ttl.as_millis() as i64;
        // XX: refresh only while the slot is still live.
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.key)
            .arg("XX")
            .arg("CH")
            .arg(expiry)
            .arg(&slot.token)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, slot: &TaskSlot) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZREM")
            .arg(&self.key)
            .arg(&slot.token)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_limiter_enforces_capacity() {
        let limiter = LocalTaskLimiter::new(2);
        let wait = Duration::from_millis(10);

        let a = limiter.acquire("t-1", wait).await.unwrap();
        let _b = limiter.acquire("t-2", wait).await.unwrap();
        assert!(matches!(
            limiter.acquire("t-3", wait).await,
            Err(LimiterError::Busy)
        ));

        limiter.release(&a).await.unwrap();
        assert!(limiter.acquire("t-3", wait).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_limiter_rejects_duplicate_token() {
        let limiter = LocalTaskLimiter::new(2);
        let wait = Duration::from_millis(10);
        let _a = limiter.acquire("t-1", wait).await.unwrap();
        assert!(matches!(
            limiter.acquire("t-1", wait).await,
            Err(LimiterError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_local_release_is_idempotent() {
        let limiter = LocalTaskLimiter::new(1);
        let wait = Duration::from_millis(10);
        let a = limiter.acquire("t-1", wait).await.unwrap();
        limiter.release(&a).await.unwrap();
        limiter.release(&a).await.unwrap();

        // The slot freed exactly once; the next acquire succeeds.
        assert!(limiter.acquire("t-2", wait).await.is_ok());
        assert!(matches!(
            limiter.acquire("t-3", wait).await,
            Err(LimiterError::Busy)
        ));
    }

    #[test]
    fn test_capacity_accessor() {
        assert_eq!(LocalTaskLimiter::new(5).capacity(), 5);
    }
}
