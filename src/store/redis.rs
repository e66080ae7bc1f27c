//! Redis-backed counter store.

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::Script;

use crate::config::schema::StoreConfig;
use crate::store::{CounterStore, StoreError, WindowCount};

/// Increment only while below the quota so the stored value never exceeds it.
const ACQUIRE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local max = tonumber(ARGV[1])
if current >= max then
  return {current, 0}
end
current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {current, 1}
"#;

/// Counter store on a pooled Redis connection.
pub struct RedisCounterStore {
    pool: Pool<RedisConnectionManager>,
    script: Script,
    command_timeout_ms: u64,
}

impl RedisCounterStore {
    /// Build the pool. Connections are established lazily so the gateway can
    /// start, in degraded mode, while Redis is down.
    pub fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let manager = RedisConnectionManager::new(config.redis_url.clone())
            .map_err(|e| StoreError::Connection(format!("invalid redis url: {}", e)))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.connect_timeout())
            .build_unchecked(manager);

        tracing::info!(
            pool_size = config.pool_size,
            command_timeout_ms = config.command_timeout_ms,
            "Redis counter store configured"
        );

        Ok(Self {
            pool,
            script: Script::new(ACQUIRE_SCRIPT),
            command_timeout_ms: config.command_timeout_ms,
        })
    }

    /// Run one store operation under the command deadline.
    async fn with_timeout<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(std::time::Duration::from_millis(self.command_timeout_ms), op)
            .await
            .map_err(|_| StoreError::Timeout(self.command_timeout_ms))?
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn acquire(&self, key: &str, max: u64, ttl_ms: u64) -> Result<WindowCount, StoreError> {
        self.with_timeout(async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            let (count, acquired): (u64, u8) = self
                .script
                .key(key)
                .arg(max)
                .arg(ttl_ms)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| StoreError::Command(e.to_string()))?;
            Ok(WindowCount {
                count: count.min(max),
                acquired: acquired == 1,
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_timeout(async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            let _: String = redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| StoreError::Command(e.to_string()))?;
            Ok(())
        })
        .await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("command_timeout_ms", &self.command_timeout_ms)
            .finish_non_exhaustive()
    }
}
