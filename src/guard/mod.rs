//! Per-user rate limiting and abuse bans.
//!
//! The guard runs a fixed sequence of checks against a [`CounterStore`]:
//! existing ban, burst window, minute/hour/day quotas, and finally strike
//! escalation for repeat offenders.  The first check that trips produces a
//! denial; a request that passes every check leaves its increments behind
//! as its contribution to future windows.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{LimitKind, RelayError};

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use store::CounterStore;

/// Limits and penalty lengths.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub enabled: bool,
    pub burst_limit: i64,
    pub burst_window: Duration,
    pub per_minute: i64,
    pub per_hour: i64,
    pub per_day: i64,
    /// Short ban handed out on a first violation.
    pub cooldown: Duration,
    /// Escalated ban for repeat offenders and day-quota abuse.
    pub long_ban: Duration,
    /// How long a strike is remembered.
    pub strike_window: Duration,
    pub key_prefix: String,
    /// Upper bound on a single store round trip.
    pub store_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst_limit: 10,
            burst_window: Duration::from_secs(2),
            per_minute: 20,
            per_hour: 200,
            per_day: 1000,
            cooldown: Duration::from_secs(10 * 60),
            long_ban: Duration::from_secs(30 * 24 * 3600),
            strike_window: Duration::from_secs(3 * 24 * 3600),
            key_prefix: "relay".to_string(),
            store_timeout: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: RelayError,
    /// User-facing text, ready to put in a reply envelope.
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(Denial),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

const WINDOW_MINUTE: Duration = Duration::from_secs(60);
const WINDOW_HOUR: Duration = Duration::from_secs(3600);
const WINDOW_DAY: Duration = Duration::from_secs(24 * 3600);

#[derive(Clone)]
pub struct AbuseGuard {
    store: Arc<dyn CounterStore>,
    cfg: GuardConfig,
}

impl AbuseGuard {
    pub fn new(store: Arc<dyn CounterStore>, cfg: GuardConfig) -> Self {
        Self { store, cfg }
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    /// Evaluate one request for `user`.  Store failures fail open: a broken
    /// or slow counter store must not take the chat down with it.
    pub async fn check(&self, user: &str) -> Verdict {
        if !self.cfg.enabled {
            return Verdict::Allowed;
        }
        let run = tokio::time::timeout(self.cfg.store_timeout, self.evaluate(user));
        match run.await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => {
                tracing::warn!(user_key = %user, error = %err, "counter store failed, allowing request");
                Verdict::Allowed
            }
            Err(_) => {
                tracing::warn!(
                    user_key = %user,
                    timeout_ms = self.cfg.store_timeout.as_millis() as u64,
                    "counter store timed out, allowing request"
                );
                Verdict::Allowed
            }
        }
    }

    fn key(&self, kind: &str, user: &str) -> String {
        format!("{}:{}:{}", self.cfg.key_prefix, kind, user)
    }

    async fn evaluate(&self, user: &str) -> Result<Verdict, RelayError> {
        // A live ban is the only gate; nothing else is counted meanwhile.
        if let Some(remaining) = self.store.ttl(&self.key("ban", user)).await? {
            return Ok(Verdict::Denied(Denial {
                reason: RelayError::Banned(remaining),
                message: self.ban_text(remaining),
            }));
        }

        let windows = [
            ("burst", self.cfg.burst_window, self.cfg.burst_limit, LimitKind::Burst),
            ("min", WINDOW_MINUTE, self.cfg.per_minute, LimitKind::Minute),
            ("hour", WINDOW_HOUR, self.cfg.per_hour, LimitKind::Hour),
            ("day", WINDOW_DAY, self.cfg.per_day, LimitKind::Day),
        ];
        for (tag, window, limit, kind) in windows {
            let key = self.key(tag, user);
            let count = self.store.incr_with_expiry(&key, window).await?;
            if count <= limit {
                continue;
            }
            // Only the reading that crosses the limit penalizes.  Requests
            // racing past it in the same window are denied without a strike.
            if count > limit.saturating_add(1) {
                return self.still_limited(user, &key, kind).await;
            }
            if kind == LimitKind::Day {
                let length = self.ban(user, self.cfg.long_ban).await?;
                tracing::warn!(user_key = %user, count, "day quota exceeded, long ban");
                return Ok(Verdict::Denied(Denial {
                    reason: RelayError::RateLimited(kind),
                    message: long_ban_text(length),
                }));
            }
            return self.escalate(user, kind).await;
        }

        Ok(Verdict::Allowed)
    }

    /// Record a strike; the second strike inside the window earns the long
    /// ban, a first one only the cooldown.
    async fn escalate(&self, user: &str, kind: LimitKind) -> Result<Verdict, RelayError> {
        let strikes = self
            .store
            .incr_with_expiry(&self.key("strike", user), self.cfg.strike_window)
            .await?;
        let wanted = if strikes >= 2 {
            self.cfg.long_ban
        } else {
            self.cfg.cooldown
        };
        let length = self.ban(user, wanted).await?;
        if length > self.cfg.cooldown {
            tracing::warn!(user_key = %user, limit = %kind, strikes, "repeat violation, long ban");
            return Ok(Verdict::Denied(Denial {
                reason: RelayError::RateLimited(kind),
                message: long_ban_text(length),
            }));
        }
        tracing::info!(user_key = %user, limit = %kind, strikes, "rate limit violation, cooldown");
        Ok(Verdict::Denied(Denial {
            reason: RelayError::RateLimited(kind),
            message: cooldown_warning_text(self.cfg.cooldown, self.cfg.long_ban),
        }))
    }

    /// Denial for a window that was already overrun.  Reports whichever
    /// lasts longer: a ban set meanwhile or the window itself.
    async fn still_limited(
        &self,
        user: &str,
        window_key: &str,
        kind: LimitKind,
    ) -> Result<Verdict, RelayError> {
        if let Some(remaining) = self.store.ttl(&self.key("ban", user)).await? {
            return Ok(Verdict::Denied(Denial {
                reason: RelayError::Banned(remaining),
                message: self.ban_text(remaining),
            }));
        }
        let remaining = self.store.ttl(window_key).await?.unwrap_or(self.cfg.cooldown);
        Ok(Verdict::Denied(Denial {
            reason: RelayError::RateLimited(kind),
            message: cooldown_active_text(remaining),
        }))
    }

    fn ban_text(&self, remaining: Duration) -> String {
        if remaining > self.cfg.cooldown {
            long_ban_text(remaining)
        } else {
            cooldown_active_text(remaining)
        }
    }

    /// Ban `user` for `length` unless a longer ban is already live.  Returns
    /// the ban that is in force afterwards.
    async fn ban(&self, user: &str, length: Duration) -> Result<Duration, RelayError> {
        let key = self.key("ban", user);
        if let Some(existing) = self.store.ttl(&key).await? {
            if existing >= length {
                return Ok(existing);
            }
        }
        self.store
            .set_with_expiry(&key, length.as_secs() as i64, length)
            .await?;
        Ok(length)
    }
}

/// Render a remaining duration for users.  Rounds up so a user is never told
/// "0 minutes"; an exhausted duration reads as "shortly".
pub fn humanize_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    if secs == 0 {
        return "잠시 후".to_string();
    }
    let minutes = secs.div_ceil(60);
    if minutes < 60 {
        return format!("약 {}분 후", minutes);
    }
    let hours = secs.div_ceil(3600);
    if hours < 48 {
        return format!("약 {}시간 후", hours);
    }
    format!("약 {}일 후", secs.div_ceil(86_400))
}

fn long_ban_text(remaining: Duration) -> String {
    format!(
        "비정상적인 사용이 반복되어 이용이 제한되었어요. {} 다시 이용할 수 있어요.",
        humanize_remaining(remaining)
    )
}

fn cooldown_active_text(remaining: Duration) -> String {
    format!(
        "요청이 너무 많아 잠시 이용이 제한되었어요. {} 다시 시도해 주세요.",
        humanize_remaining(remaining)
    )
}

fn cooldown_warning_text(cooldown: Duration, long_ban: Duration) -> String {
    format!(
        "요청이 너무 빨라요. {} 다시 시도해 주세요. 같은 행동이 반복되면 {}일 동안 이용이 제한돼요.",
        humanize_remaining(cooldown),
        long_ban.as_secs().div_ceil(86_400)
    )
}
