use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::backend::{BackendConfig, DEFAULT_BACKEND_URL};
use crate::callback::CallbackPolicy;
use crate::guard::GuardConfig;
use crate::responder::SyncPolicy;

/// The platform abandons a webhook that has not answered by then.
const PLATFORM_REPLY_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Shared counter store; `None` keeps counters in process.
    pub redis_url: Option<String>,
    /// Start with the in-process store when redis is unreachable.
    pub fallback_to_memory: bool,
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            fallback_to_memory: true,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub sync: SyncPolicy,
    pub callback: CallbackPolicy,
    pub guard: GuardConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let backend = BackendConfig {
            url: parse_string("BACKEND_URL").unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            api_key: parse_string("BACKEND_API_KEY"),
            model_id: parse_optional_u64("BACKEND_MODEL_ID")?,
            body_key: parse_string("BACKEND_BODY_KEY").unwrap_or_else(|| "message".to_string()),
        };

        let d = SyncPolicy::default();
        let sync = SyncPolicy {
            budget: parse_ms("RELAY_SYNC_BUDGET_MS", d.budget)?,
            attempt_timeout: parse_ms("RELAY_SYNC_ATTEMPT_TIMEOUT_MS", d.attempt_timeout)?,
            max_attempts: parse_optional_u64("RELAY_SYNC_MAX_ATTEMPTS")?
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(d.max_attempts),
            backoff_step: parse_ms("RELAY_SYNC_BACKOFF_STEP_MS", d.backoff_step)?,
            backoff_cap: parse_ms("RELAY_SYNC_BACKOFF_CAP_MS", d.backoff_cap)?,
        };

        let d = CallbackPolicy::default();
        let callback = CallbackPolicy {
            enabled: parse_bool_env("RELAY_CALLBACK_ENABLED")?.unwrap_or(d.enabled),
            budget: parse_ms("RELAY_CALLBACK_BUDGET_MS", d.budget)?,
            attempt_timeout: parse_ms("RELAY_CALLBACK_ATTEMPT_TIMEOUT_MS", d.attempt_timeout)?,
            initial_sleep: parse_ms("RELAY_CALLBACK_INITIAL_SLEEP_MS", d.initial_sleep)?,
            backoff_factor: parse_optional_f64("RELAY_CALLBACK_BACKOFF_FACTOR")?
                .unwrap_or(d.backoff_factor),
            max_sleep: parse_ms("RELAY_CALLBACK_MAX_SLEEP_MS", d.max_sleep)?,
            delivery_timeout: parse_ms("RELAY_CALLBACK_DELIVERY_TIMEOUT_MS", d.delivery_timeout)?,
        };

        let d = GuardConfig::default();
        let guard = GuardConfig {
            enabled: parse_bool_env("RELAY_GUARD_ENABLED")?.unwrap_or(d.enabled),
            burst_limit: parse_limit("RELAY_BURST_LIMIT", d.burst_limit)?,
            burst_window: parse_ms("RELAY_BURST_WINDOW_MS", d.burst_window)?,
            per_minute: parse_limit("RELAY_LIMIT_PER_MINUTE", d.per_minute)?,
            per_hour: parse_limit("RELAY_LIMIT_PER_HOUR", d.per_hour)?,
            per_day: parse_limit("RELAY_LIMIT_PER_DAY", d.per_day)?,
            cooldown: parse_secs("RELAY_COOLDOWN_SECS", d.cooldown)?,
            long_ban: parse_secs("RELAY_LONG_BAN_SECS", d.long_ban)?,
            strike_window: parse_secs("RELAY_STRIKE_WINDOW_SECS", d.strike_window)?,
            key_prefix: parse_string("RELAY_STORE_PREFIX").unwrap_or(d.key_prefix),
            store_timeout: parse_ms("RELAY_STORE_TIMEOUT_MS", d.store_timeout)?,
        };

        let d = StoreConfig::default();
        let store = StoreConfig {
            redis_url: parse_string("REDIS_URL"),
            fallback_to_memory: parse_bool_env("RELAY_STORE_FALLBACK_MEMORY")?
                .unwrap_or(d.fallback_to_memory),
            connect_timeout: d.connect_timeout,
        };

        let cfg = Self {
            backend,
            sync,
            callback,
            guard,
            store,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would break the platform contract.
    pub fn validate(&self) -> Result<()> {
        if self.sync.budget + self.guard.store_timeout >= PLATFORM_REPLY_DEADLINE {
            return Err(anyhow!(
                "RELAY_SYNC_BUDGET_MS plus RELAY_STORE_TIMEOUT_MS must stay below the platform's 5000ms reply deadline"
            ));
        }
        if self.callback.budget >= Duration::from_secs(60) {
            return Err(anyhow!(
                "RELAY_CALLBACK_BUDGET_MS must stay below the platform's 60000ms callback window"
            ));
        }
        if self.callback.delivery_timeout >= self.callback.budget {
            return Err(anyhow!(
                "RELAY_CALLBACK_DELIVERY_TIMEOUT_MS must be shorter than RELAY_CALLBACK_BUDGET_MS"
            ));
        }
        if self.backend.body_key.trim().is_empty() {
            return Err(anyhow!("BACKEND_BODY_KEY must not be empty"));
        }
        Ok(())
    }
}

fn parse_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_f64(var: &str) -> Result<Option<f64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 1.0)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a number >= 1.0", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_ms(var: &str, default: Duration) -> Result<Duration> {
    Ok(parse_optional_u64(var)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}

fn parse_secs(var: &str, default: Duration) -> Result<Duration> {
    Ok(parse_optional_u64(var)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

fn parse_limit(var: &str, default: i64) -> Result<i64> {
    Ok(parse_optional_u64(var)?
        .map(|v| v.min(i64::MAX as u64) as i64)
        .unwrap_or(default))
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "BACKEND_URL",
        "BACKEND_API_KEY",
        "BACKEND_MODEL_ID",
        "BACKEND_BODY_KEY",
        "RELAY_SYNC_BUDGET_MS",
        "RELAY_SYNC_MAX_ATTEMPTS",
        "RELAY_CALLBACK_ENABLED",
        "RELAY_CALLBACK_BUDGET_MS",
        "RELAY_CALLBACK_BACKOFF_FACTOR",
        "RELAY_GUARD_ENABLED",
        "RELAY_LIMIT_PER_MINUTE",
        "RELAY_COOLDOWN_SECS",
        "RELAY_STORE_PREFIX",
        "REDIS_URL",
        "RELAY_STORE_FALLBACK_MEMORY",
    ];

    fn clear() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.backend.url, DEFAULT_BACKEND_URL);
        assert!(cfg.backend.api_key.is_none());
        assert_eq!(cfg.backend.body_key, "message");
        assert_eq!(cfg.sync.budget, Duration::from_millis(4_300));
        assert_eq!(cfg.sync.max_attempts, 3);
        assert!(cfg.callback.enabled);
        assert_eq!(cfg.guard.per_minute, 20);
        assert!(cfg.store.redis_url.is_none());
        assert!(cfg.store.fallback_to_memory);
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("BACKEND_URL", "http://backend.test/chat");
        std::env::set_var("BACKEND_API_KEY", " sk-test ");
        std::env::set_var("BACKEND_MODEL_ID", "12");
        std::env::set_var("BACKEND_BODY_KEY", "query");
        std::env::set_var("RELAY_SYNC_BUDGET_MS", "3000");
        std::env::set_var("RELAY_SYNC_MAX_ATTEMPTS", "5");
        std::env::set_var("RELAY_CALLBACK_ENABLED", "off");
        std::env::set_var("RELAY_CALLBACK_BACKOFF_FACTOR", "2.0");
        std::env::set_var("RELAY_LIMIT_PER_MINUTE", "7");
        std::env::set_var("RELAY_COOLDOWN_SECS", "60");
        std::env::set_var("RELAY_STORE_PREFIX", "kakao");
        std::env::set_var("REDIS_URL", "redis://cache:6379");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.backend.url, "http://backend.test/chat");
        assert_eq!(cfg.backend.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.backend.model_id, Some(12));
        assert_eq!(cfg.backend.body_key, "query");
        assert_eq!(cfg.sync.budget, Duration::from_millis(3_000));
        assert_eq!(cfg.sync.max_attempts, 5);
        assert!(!cfg.callback.enabled);
        assert_eq!(cfg.callback.backoff_factor, 2.0);
        assert_eq!(cfg.guard.per_minute, 7);
        assert_eq!(cfg.guard.cooldown, Duration::from_secs(60));
        assert_eq!(cfg.guard.key_prefix, "kakao");
        assert_eq!(cfg.store.redis_url.as_deref(), Some("redis://cache:6379"));

        clear();
    }

    #[test]
    fn rejects_budget_past_platform_deadline() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("RELAY_SYNC_BUDGET_MS", "5000");
        let err = AppConfig::from_env().expect_err("budget must be rejected");
        assert!(format!("{}", err).contains("RELAY_SYNC_BUDGET_MS"));
        clear();
    }

    #[test]
    fn store_timeout_counts_against_reply_deadline() {
        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.sync.budget = Duration::from_millis(4_800);
        let err = cfg.validate().expect_err("4800ms + 300ms overruns the deadline");
        assert!(format!("{}", err).contains("RELAY_STORE_TIMEOUT_MS"));
    }

    #[test]
    fn delivery_timeout_must_leave_room_for_attempts() {
        let mut cfg = AppConfig::default();
        cfg.callback.budget = Duration::from_secs(5);
        cfg.callback.delivery_timeout = Duration::from_secs(5);
        let err = cfg.validate().expect_err("no time left for backend attempts");
        assert!(format!("{}", err).contains("RELAY_CALLBACK_DELIVERY_TIMEOUT_MS"));
    }

    #[test]
    fn rejects_invalid_numbers() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("BACKEND_MODEL_ID", "abc");
        let err = AppConfig::from_env().expect_err("model id must be numeric");
        assert!(format!("{}", err).contains("BACKEND_MODEL_ID"));
        std::env::set_var("BACKEND_MODEL_ID", "1");
        std::env::set_var("RELAY_CALLBACK_BACKOFF_FACTOR", "0.5");
        let err = AppConfig::from_env().expect_err("factor must be >= 1");
        assert!(format!("{}", err).contains("RELAY_CALLBACK_BACKOFF_FACTOR"));
        clear();
    }
}
