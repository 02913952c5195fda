//! Redis counter store, shared by every replica.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use super::store::CounterStore;
use crate::error::RelayError;

pub struct RedisStore {
    conn: ConnectionManager,
    /// Atomic INCR + PEXPIRE-on-create; returns the new count.
    incr: Script,
}

fn backend(err: redis::RedisError) -> RelayError {
    RelayError::Store(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl RedisStore {
    /// Connect, giving up after `connect_timeout` so start-up cannot hang on
    /// an unreachable server.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::open(url).map_err(backend)?;
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| RelayError::Store("connection timed out".into()))?
            .map_err(backend)?;

        let incr = Script::new(
            r#"
            local current = redis.call('INCR', KEYS[1])
            if current == 1 then
                redis.call('PEXPIRE', KEYS[1], ARGV[1])
            end
            return current
            "#,
        );

        tracing::info!("connected to redis counter store");
        Ok(Self { conn, incr })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, RelayError> {
        let mut conn = self.conn.clone();
        self.incr
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, RelayError> {
        let mut conn = self.conn.clone();
        // -2 = missing, -1 = no expiry; neither is a live window here.
        let ms: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>, RelayError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}
