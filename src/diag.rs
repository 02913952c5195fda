//! Advisory introspection state for the `/diag` endpoint.
//!
//! Only the most recent backend call and the most recent request are kept.
//! Writers overwrite without coordination; readers may see a call record and
//! a request record from different requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CallAttempt {
    pub ok: bool,
    /// HTTP status, 0 when no response was received.
    pub status: u16,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub url: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRequest {
    pub request_id: String,
    pub utterance: String,
    pub source: &'static str,
    pub raw_usrtext: Option<String>,
    pub raw_utterance: Option<String>,
    pub user_key: String,
    /// `sync`, `callback`, `denied` or `empty`.
    pub mode: &'static str,
    /// Backend attempts made on the sync path (0 elsewhere).
    pub attempts: u32,
    pub answered: bool,
    pub at: String,
}

#[derive(Default)]
struct Counters {
    requests_total: AtomicU64,
    denied_total: AtomicU64,
    callbacks_spawned_total: AtomicU64,
    fallbacks_total: AtomicU64,
}

#[derive(Clone, Default)]
pub struct Diagnostics {
    last_call: Arc<Mutex<Option<CallAttempt>>>,
    last_request: Arc<Mutex<Option<LastRequest>>>,
    counters: Arc<Counters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Requests,
    Denied,
    CallbacksSpawned,
    Fallbacks,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, attempt: CallAttempt) {
        if let Ok(mut slot) = self.last_call.lock() {
            *slot = Some(attempt);
        }
    }

    pub fn record_request(&self, request: LastRequest) {
        if let Ok(mut slot) = self.last_request.lock() {
            *slot = Some(request);
        }
    }

    pub fn last_call(&self) -> Option<CallAttempt> {
        self.last_call.lock().ok().and_then(|g| g.clone())
    }

    pub fn last_request(&self) -> Option<LastRequest> {
        self.last_request.lock().ok().and_then(|g| g.clone())
    }

    pub fn bump(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Requests => &self.counters.requests_total,
            Counter::Denied => &self.counters.denied_total,
            Counter::CallbacksSpawned => &self.counters.callbacks_spawned_total,
            Counter::Fallbacks => &self.counters.fallbacks_total,
        }
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
