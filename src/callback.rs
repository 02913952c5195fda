//! Deferred reply path.
//!
//! When the platform hands us a callback URL the answer may take much longer
//! than the webhook deadline.  A worker retries the backend with exponential
//! backoff until its budget runs out, then POSTs exactly one reply: the
//! answer, or the same fallback text the sync path uses.  The worker has no
//! caller to report to; its only traces are the callback POST and log lines.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::backend::Backend;
use crate::skill::{SkillResponse, FALLBACK_TEXT};
use crate::util::Deadline;

#[derive(Debug, Clone)]
pub struct CallbackPolicy {
    pub enabled: bool,
    /// Covers the retries and the delivery POST.  Must stay below the
    /// platform's callback validity window (one minute).
    pub budget: Duration,
    pub attempt_timeout: Duration,
    pub initial_sleep: Duration,
    pub backoff_factor: f64,
    pub max_sleep: Duration,
    pub delivery_timeout: Duration,
}

impl Default for CallbackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            budget: Duration::from_secs(50),
            attempt_timeout: Duration::from_secs(12),
            initial_sleep: Duration::from_millis(350),
            backoff_factor: 1.6,
            max_sleep: Duration::from_secs(2),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

impl CallbackPolicy {
    fn grow(&self, sleep: Duration) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        Duration::try_from_secs_f64(sleep.as_secs_f64() * factor)
            .unwrap_or(self.max_sleep)
            .min(self.max_sleep)
    }
}

/// Summary of one worker run.  Only tests look at it; the dispatcher drops
/// the task handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackReport {
    pub attempts: u32,
    pub answered: bool,
    pub delivered: bool,
}

#[derive(Clone)]
pub struct CallbackWorker {
    backend: Arc<dyn Backend>,
    client: reqwest::Client,
    policy: CallbackPolicy,
}

impl CallbackWorker {
    pub fn new(backend: Arc<dyn Backend>, client: reqwest::Client, policy: CallbackPolicy) -> Self {
        Self {
            backend,
            client,
            policy,
        }
    }

    pub fn policy(&self) -> &CallbackPolicy {
        &self.policy
    }

    /// Start `run` as a detached task.  Nobody joins or cancels it: it ends
    /// when it has delivered, bounded by its own budget.
    pub fn spawn(&self, callback_url: String, message: String, request_id: String) {
        let worker = self.clone();
        let span = tracing::info_span!("callback", %request_id);
        let _detached = tokio::spawn(
            async move {
                worker.run(&callback_url, &message).await;
            }
            .instrument(span),
        );
    }

    pub async fn run(&self, callback_url: &str, message: &str) -> CallbackReport {
        let overall = Deadline::after(self.policy.budget);
        // Retries stop early enough to leave room for the delivery.
        let deadline = Deadline::after(
            self.policy
                .budget
                .saturating_sub(self.policy.delivery_timeout),
        );
        let mut sleep = self.policy.initial_sleep;
        let mut attempts = 0u32;
        let mut answer = None;

        loop {
            let timeout = deadline.clamp(self.policy.attempt_timeout);
            if timeout.is_zero() {
                break;
            }
            attempts += 1;
            if let Ok(Some(reply)) =
                tokio::time::timeout(timeout, self.backend.call(message, timeout)).await
            {
                answer = Some(reply);
                break;
            }
            if deadline.remaining().is_zero() {
                break;
            }
            let pause = deadline.clamp(sleep);
            tracing::debug!(
                attempt = attempts,
                sleep_ms = pause.as_millis() as u64,
                remaining_ms = deadline.remaining_ms(),
                "callback attempt failed, backing off"
            );
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(pause).await;
            }
            sleep = self.policy.grow(sleep);
        }

        let answered = answer.is_some();
        if !answered {
            tracing::warn!(attempts, "callback budget exhausted, delivering fallback");
        }
        let text = answer.unwrap_or_else(|| FALLBACK_TEXT.to_string());
        let delivered = self
            .deliver(callback_url, &text, overall.clamp(self.policy.delivery_timeout))
            .await;
        CallbackReport {
            attempts,
            answered,
            delivered,
        }
    }

    /// One POST, never retried.  Failure is only logged.
    async fn deliver(&self, callback_url: &str, text: &str, timeout: Duration) -> bool {
        let sent = self
            .client
            .post(callback_url)
            .timeout(timeout.max(Duration::from_millis(1)))
            .json(&SkillResponse::text(text))
            .send()
            .await;
        match sent {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(status = resp.status().as_u16(), "callback delivered");
                true
            }
            Ok(resp) => {
                tracing::warn!(status = resp.status().as_u16(), "callback rejected by platform");
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "callback delivery failed");
                false
            }
        }
    }
}
