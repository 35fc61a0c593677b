//! Redis-backed counter store, shared across gateway instances.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use super::CounterStore;
use crate::error::StoreError;

/// GET, compare, INCR and EXPIRE run server-side as one atomic step.
/// Returns -1 when the window is full.
const INCR_BELOW_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return -1
end
current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return current
"#;

/// Counter store over a multiplexed, auto-reconnecting Redis connection.
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisCounterStore {
    /// Connect to `url` (e.g. `redis://localhost`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis counter store");
        Ok(Self {
            conn,
            script: Script::new(INCR_BELOW_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_below(
        &self,
        key: &str,
        limit: u32,
        ttl: Duration,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: i64 = self
            .script
            .key(key)
            .arg(limit)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        match reply {
            -1 => Ok(None),
            n if n > 0 => Ok(Some(n as u64)),
            other => Err(StoreError::Protocol(format!("unexpected counter value {other}"))),
        }
    }
}
