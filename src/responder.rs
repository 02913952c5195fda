//! Synchronous reply path.
//!
//! The platform drops the webhook after roughly five seconds, so the whole
//! loop runs inside one [`Deadline`].  Many short tries beat a few long ones
//! here, hence a small linear backoff.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::skill::FALLBACK_TEXT;
use crate::util::Deadline;

#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Total wall-clock budget for all attempts and sleeps.
    pub budget: Duration,
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub backoff_cap: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(4_300),
            attempt_timeout: Duration::from_millis(2_500),
            max_attempts: 3,
            backoff_step: Duration::from_millis(150),
            backoff_cap: Duration::from_millis(450),
        }
    }
}

impl SyncPolicy {
    /// Pause after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt).min(self.backoff_cap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub reply: String,
    pub attempts: u32,
    /// False when `reply` is the fallback text.
    pub answered: bool,
}

#[derive(Clone)]
pub struct SyncResponder {
    backend: Arc<dyn Backend>,
    policy: SyncPolicy,
}

impl SyncResponder {
    pub fn new(backend: Arc<dyn Backend>, policy: SyncPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub async fn respond(&self, message: &str) -> SyncOutcome {
        let deadline = Deadline::after(self.policy.budget);
        let mut attempts = 0;

        while attempts < self.policy.max_attempts {
            let timeout = deadline.clamp(self.policy.attempt_timeout);
            if timeout.is_zero() {
                break;
            }
            attempts += 1;
            // The backend is trusted to honour `timeout`, but the budget is
            // enforced here regardless.
            let call = self.backend.call(message, timeout);
            match tokio::time::timeout(timeout, call).await {
                Ok(Some(reply)) => {
                    tracing::info!(
                        attempt = attempts,
                        elapsed_ms = deadline.elapsed().as_millis() as u64,
                        "sync reply ready"
                    );
                    return SyncOutcome {
                        reply,
                        attempts,
                        answered: true,
                    };
                }
                Ok(None) => {}
                Err(_) => {
                    tracing::debug!(attempt = attempts, "sync attempt exceeded its slice");
                }
            }
            tracing::debug!(
                attempt = attempts,
                remaining_ms = deadline.remaining_ms(),
                "sync attempt failed"
            );
            if attempts < self.policy.max_attempts {
                let pause = deadline.clamp(self.policy.backoff(attempts));
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
        }

        tracing::warn!(
            attempts,
            budget_ms = self.policy.budget.as_millis() as u64,
            "sync budget exhausted, sending fallback"
        );
        SyncOutcome {
            reply: FALLBACK_TEXT.to_string(),
            attempts,
            answered: false,
        }
    }
}
