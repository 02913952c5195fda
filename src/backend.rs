//! Client for the conversational AI backend.
//!
//! One `call` is one HTTP request.  Retrying is the caller's business: the
//! sync responder and the callback worker each run their own loop with their
//! own budget.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::diag::{now_rfc3339, CallAttempt, Diagnostics};
use crate::error::RelayError;
use crate::extract::{extract_reply, snippet};

/// A source of answers.  Implemented by [`HttpBackend`]; tests plug in
/// scripted doubles.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Ask once.  `None` means no usable answer within `timeout`.
    async fn call(&self, message: &str, timeout: Duration) -> Option<String>;
}

/// Where and how to reach the backend.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Sent as `ai_model_id` when set.
    pub model_id: Option<u64>,
    /// Name of the field that carries the user's message.  Depends on the
    /// backend API version.
    pub body_key: String,
}

pub const DEFAULT_BACKEND_URL: &str = "https://api.chatling.ai/v2/chatbots/0/ai/kb/chat";

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_string(),
            api_key: None,
            model_id: None,
            body_key: "message".to_string(),
        }
    }
}

pub struct HttpBackend {
    cfg: BackendConfig,
    client: reqwest::Client,
    diag: Diagnostics,
}

impl HttpBackend {
    pub fn new(cfg: BackendConfig, diag: Diagnostics) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { cfg, client, diag })
    }

    pub fn request_body(&self, message: &str) -> Value {
        let mut body = Map::new();
        body.insert(self.cfg.body_key.clone(), Value::String(message.to_string()));
        if let Some(id) = self.cfg.model_id {
            body.insert("ai_model_id".to_string(), Value::from(id));
        }
        Value::Object(body)
    }

    async fn attempt(&self, message: &str, timeout: Duration) -> Result<String, RelayError> {
        let Some(key) = self.cfg.api_key.as_deref().filter(|k| !k.is_empty()) else {
            let err = RelayError::MissingCredentials;
            self.record(0, Duration::ZERO, None, Some(&err));
            return Err(err);
        };

        let started = Instant::now();
        let sent = self
            .client
            .post(&self.cfg.url)
            .bearer_auth(key)
            .timeout(timeout)
            .json(&self.request_body(message))
            .send()
            .await;
        let resp = match sent {
            Ok(r) => r,
            Err(e) => {
                let err = classify(&e);
                self.record(0, started.elapsed(), None, Some(&err));
                return Err(err);
            }
        };

        let status = resp.status().as_u16();
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => {
                let err = classify(&e);
                self.record(status, started.elapsed(), None, Some(&err));
                return Err(err);
            }
        };
        let body_snippet = snippet(&text);

        if !(200..300).contains(&status) {
            let err = RelayError::NonSuccessStatus(status);
            self.record(status, started.elapsed(), Some(body_snippet), Some(&err));
            return Err(err);
        }

        let reply = extract_reply(&text).unwrap_or_else(|| body_snippet.clone());
        if reply.trim().is_empty() {
            let err = RelayError::UnparsableResponse;
            self.record(status, started.elapsed(), Some(body_snippet), Some(&err));
            return Err(err);
        }
        self.record(status, started.elapsed(), Some(body_snippet), None);
        Ok(reply)
    }

    fn record(
        &self,
        status: u16,
        latency: Duration,
        body_snippet: Option<String>,
        err: Option<&RelayError>,
    ) {
        self.diag.record_call(CallAttempt {
            ok: err.is_none(),
            status,
            latency_ms: latency.as_millis() as u64,
            body_snippet,
            error_kind: err.map(RelayError::kind),
            url: self.cfg.url.clone(),
            at: now_rfc3339(),
        });
    }
}

fn classify(err: &reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::Timeout
    } else {
        RelayError::Transport(err.to_string())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self, message: &str, timeout: Duration) -> Option<String> {
        match self.attempt(message, timeout).await {
            Ok(reply) => Some(reply),
            Err(err) => {
                tracing::warn!(
                    error_kind = %err.kind(),
                    error = %err,
                    timeout_ms = timeout.as_millis() as u64,
                    "backend call failed"
                );
                None
            }
        }
    }
}
