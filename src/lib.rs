//! Core library for skill-relay.  This module wires the abuse guard, the
//! backend client and the two reply paths into an axum router that speaks
//! the chat platform's skill protocol.
//!
//! The platform must only ever see HTTP 200 with a valid envelope: denials,
//! backend failures and even panics inside a handler end up as reply text.

pub mod backend;
pub mod callback;
mod config;
pub mod diag;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod guard;
pub mod responder;
pub mod skill;
pub mod util;

pub use config::{AppConfig, StoreConfig};

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::catch_panic::CatchPanicLayer;

use crate::backend::{Backend, HttpBackend};
use crate::callback::CallbackWorker;
use crate::diag::{Counter, Diagnostics};
use crate::dispatch::Dispatcher;
use crate::guard::{AbuseGuard, CounterStore, MemoryStore};
use crate::responder::SyncResponder;
use crate::skill::{SkillPayload, SkillReply, REACHABILITY_TEXT, TEMPORARY_ERROR_TEXT};

pub use crate::error::{LimitKind, RelayError};
pub use crate::util::Deadline;

/// Largest webhook body accepted.  Skill payloads are a few KiB.
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub diag: Diagnostics,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Assemble state from already-built collaborators.  Tests use this to
    /// plug in scripted backends and pre-seeded stores.
    pub fn from_parts(
        config: AppConfig,
        store: Arc<dyn CounterStore>,
        backend: Arc<dyn Backend>,
        diag: Diagnostics,
    ) -> anyhow::Result<Self> {
        let guard = AbuseGuard::new(store, config.guard.clone());
        let responder = SyncResponder::new(backend.clone(), config.sync.clone());
        let client = reqwest::Client::builder().build()?;
        let worker = CallbackWorker::new(backend, client, config.callback.clone());
        let dispatcher = Dispatcher::new(guard, responder, worker, diag.clone());
        Ok(Self {
            dispatcher,
            diag,
            config: Arc::new(config),
        })
    }
}

/// Build state from environment variables.  See [`AppConfig::from_env`]
/// for the variables read.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state(config).await
}

pub async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let diag = Diagnostics::new();
    let store = open_store(&config).await?;
    let backend: Arc<dyn Backend> =
        Arc::new(HttpBackend::new(config.backend.clone(), diag.clone())?);
    if config.backend.api_key.is_none() {
        tracing::warn!("BACKEND_API_KEY not set; every message will get the fallback reply");
    }
    AppState::from_parts(config, store, backend, diag)
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let Some(url) = config.store.redis_url.as_deref() else {
        tracing::info!("using in-process counter store; limits are not shared across replicas");
        return Ok(Arc::new(MemoryStore::new()));
    };
    match connect_shared(url, config).await {
        Ok(store) => Ok(store),
        Err(err) if config.store.fallback_to_memory => {
            tracing::warn!(error = %err, "shared counter store unavailable, falling back to in-process store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Err(err) => Err(anyhow!("REDIS_URL: {}", err)),
    }
}

#[cfg(feature = "redis")]
async fn connect_shared(url: &str, config: &AppConfig) -> Result<Arc<dyn CounterStore>, RelayError> {
    let store = guard::RedisStore::connect(url, config.store.connect_timeout).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_shared(
    _url: &str,
    _config: &AppConfig,
) -> Result<Arc<dyn CounterStore>, RelayError> {
    Err(RelayError::Store(
        "built without the `redis` feature".to_string(),
    ))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(healthz_handler))
        .route("/healthz", get(healthz_handler))
        .route("/webhook", get(reachability_handler).post(webhook_handler))
        .route("/diag", get(diag_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CatchPanicLayer::custom(panic_reply))
        .with_state(state)
}

fn skill_json(reply: &SkillReply) -> Response {
    (StatusCode::OK, Json(reply.to_json())).into_response()
}

/// Handler for `POST /webhook`.  Any body is accepted: something that does
/// not parse is treated as an empty message.
async fn webhook_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(b) => b,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "could not read webhook body");
            return skill_json(&SkillReply::Text(TEMPORARY_ERROR_TEXT.to_string()));
        }
    };
    let payload = SkillPayload::from_slice(&body);
    let reply = state.dispatcher.dispatch(&payload).await;
    skill_json(&reply)
}

/// `GET`/`HEAD /webhook`: the platform console checks the URL without a body.
async fn reachability_handler() -> Response {
    skill_json(&SkillReply::Text(REACHABILITY_TEXT.to_string()))
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Read-only view of configuration and the latest call/request.  Never
/// exposes the API key itself.
async fn diag_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let cfg = &state.config;
    let diag = &state.diag;
    let payload = serde_json::json!({
        "api_key_set": cfg.backend.api_key.as_deref().is_some_and(|k| !k.is_empty()),
        "backend_url": cfg.backend.url,
        "model_id": cfg.backend.model_id,
        "body_key": cfg.backend.body_key,
        "sync_budget_ms": cfg.sync.budget.as_millis() as u64,
        "sync_max_attempts": cfg.sync.max_attempts,
        "callback_enabled": cfg.callback.enabled,
        "callback_budget_ms": cfg.callback.budget.as_millis() as u64,
        "guard_enabled": cfg.guard.enabled,
        "store": state.dispatcher.guard().store_kind(),
        "requests_total": diag.get(Counter::Requests),
        "denied_total": diag.get(Counter::Denied),
        "callbacks_spawned_total": diag.get(Counter::CallbacksSpawned),
        "fallbacks_total": diag.get(Counter::Fallbacks),
        "last_call": diag.last_call(),
        "last_request": diag.last_request(),
    });
    if params.contains_key("pretty") {
        let body = serde_json::to_string_pretty(&payload).unwrap_or_default();
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response();
    }
    (StatusCode::OK, Json(payload)).into_response()
}

/// Outermost safety net: a panic anywhere in request handling still answers
/// 200 with a valid envelope.
fn panic_reply(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(panic = %detail, "request handler panicked");
    skill_json(&SkillReply::Text(TEMPORARY_ERROR_TEXT.to_string()))
}
