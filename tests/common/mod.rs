#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::post, Json, Router};
use serde_json::Value;
use skill_relay::{app, AppState};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Serve `router` on an ephemeral localhost port.
pub async fn serve(router: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, handle)
}

pub async fn spawn_app(state: AppState) -> (String, JoinHandle<()>) {
    let (addr, handle) = serve(app(state)).await;
    (format!("http://{}", addr), handle)
}

/// One scripted backend reply.
#[derive(Clone, Debug)]
pub enum Step {
    Status(u16),
    Answer(&'static str),
    /// Sleep before answering, to exercise client timeouts.
    Slow(Duration, &'static str),
}

#[derive(Clone)]
pub struct MockBackend {
    script: Arc<Vec<Step>>,
    hits: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockBackend {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.auth.lock().unwrap().clone()
    }
}

async fn backend_chat(
    State(mock): State<MockBackend>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    let n = mock.hits.fetch_add(1, Ordering::SeqCst);
    mock.bodies.lock().unwrap().push(body);
    mock.auth.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    // The last step repeats once the script runs out.
    let step = mock
        .script
        .get(n)
        .or_else(|| mock.script.last())
        .cloned()
        .unwrap_or(Step::Status(500));
    match step {
        Step::Status(code) => (
            StatusCode::from_u16(code).unwrap(),
            "upstream unavailable",
        )
            .into_response(),
        Step::Answer(text) => Json(serde_json::json!({
            "status": "success",
            "data": {"response": text}
        }))
        .into_response(),
        Step::Slow(delay, text) => {
            tokio::time::sleep(delay).await;
            Json(serde_json::json!({"data": {"response": text}})).into_response()
        }
    }
}

/// Backend double speaking the chat API over HTTP.
pub async fn start_backend(script: Vec<Step>) -> (String, MockBackend, JoinHandle<()>) {
    let mock = MockBackend {
        script: Arc::new(script),
        hits: Arc::new(AtomicUsize::new(0)),
        bodies: Arc::new(Mutex::new(Vec::new())),
        auth: Arc::new(Mutex::new(Vec::new())),
    };
    let router = Router::new()
        .route("/chat", post(backend_chat))
        .with_state(mock.clone());
    let (addr, handle) = serve(router).await;
    (format!("http://{}/chat", addr), mock, handle)
}

/// Records every callback delivery.
#[derive(Clone, Default)]
pub struct CallbackSink {
    received: Arc<Mutex<Vec<Value>>>,
}

impl CallbackSink {
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|v| {
                v.pointer("/template/outputs/0/simpleText/text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }

    /// Wait until `n` deliveries arrived or `within` passes.
    pub async fn wait_for(&self, n: usize, within: Duration) -> usize {
        let end = tokio::time::Instant::now() + within;
        loop {
            let got = self.received.lock().unwrap().len();
            if got >= n || tokio::time::Instant::now() >= end {
                return got;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn callback_receive(
    State(sink): State<CallbackSink>,
    Json(body): Json<Value>,
) -> Json<Value> {
    sink.received.lock().unwrap().push(body);
    Json(serde_json::json!({"taskId": "t-1", "status": "SUCCESS"}))
}

pub async fn start_callback_sink() -> (String, CallbackSink, JoinHandle<()>) {
    let sink = CallbackSink::default();
    let router = Router::new()
        .route("/callback", post(callback_receive))
        .with_state(sink.clone());
    let (addr, handle) = serve(router).await;
    (format!("http://{}/callback", addr), sink, handle)
}

pub fn reply_text(v: &Value) -> Option<&str> {
    v.pointer("/template/outputs/0/simpleText/text")
        .and_then(Value::as_str)
}
