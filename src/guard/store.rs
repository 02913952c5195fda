//! Counter store port.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RelayError;

/// Abstraction over the backing store for rate-limit counters and bans.
///
/// Implementations must make `incr_with_expiry` atomic per key: several
/// in-flight requests from the same user increment the same counters.  The
/// expiry is only applied when the increment creates the key, which gives
/// fixed windows.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new value.  A missing or expired key
    /// starts again at 1 with a fresh `ttl`.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, RelayError>;

    /// Remaining time to live, `None` when the key is absent or expired.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, RelayError>;

    async fn set_with_expiry(&self, key: &str, value: i64, ttl: Duration)
        -> Result<(), RelayError>;

    async fn get_int(&self, key: &str) -> Result<Option<i64>, RelayError>;

    /// Label shown on the diagnostics endpoint.
    fn kind(&self) -> &'static str;
}
