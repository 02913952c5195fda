use axum::{routing::post, Json, Router};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reqwest::Client;
use serde_json::json;
use skill_relay::extract::extract_reply;
use skill_relay::guard::{AbuseGuard, GuardConfig, MemoryStore};
use skill_relay::{app, build_state, AppConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

fn bench_guard(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cfg = GuardConfig {
        burst_limit: i64::MAX,
        per_minute: i64::MAX,
        per_hour: i64::MAX,
        per_day: i64::MAX,
        ..GuardConfig::default()
    };
    let guard = AbuseGuard::new(Arc::new(MemoryStore::new()), cfg);

    // Same user every time: hot keys, five counter round trips per check.
    c.bench_function("guard_check_hot_user", |b| {
        b.iter(|| rt.block_on(async { black_box(guard.check("bench-user").await) }))
    });

    let mut n = 0u64;
    c.bench_function("guard_check_new_user", |b| {
        b.iter(|| {
            n += 1;
            let user = format!("user-{}", n);
            rt.block_on(async { black_box(guard.check(&user).await) })
        })
    });
}

fn bench_extract(c: &mut Criterion) {
    let plain = r#"{"status":"success","data":{"response":"서울은 오늘 맑아요."}}"#;
    let markdown = json!({
        "data": {"response": "## 요약\n\n- **첫째**: [문서](https://docs.test/a)\n- `둘째`\n\n> 참고\n\n\n\n끝"}
    })
    .to_string();
    c.bench_function("extract_plain", |b| b.iter(|| extract_reply(black_box(plain))));
    c.bench_function("extract_markdown", |b| {
        b.iter(|| extract_reply(black_box(&markdown)))
    });
}

fn bench_webhook(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let backend_url = rt.block_on(async {
        async fn answer(Json(_v): Json<serde_json::Value>) -> Json<serde_json::Value> {
            Json(json!({"status": "success", "data": {"response": "pong"}}))
        }
        let app = Router::new().route("/chat", post(answer));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/chat", addr)
    });

    let webhook_url = rt.block_on(async {
        let mut cfg = AppConfig::default();
        cfg.backend.url = backend_url;
        cfg.backend.api_key = Some("bench".into());
        cfg.guard.enabled = false;
        let state = build_state(cfg).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/webhook", addr)
    });

    let client = Client::new();
    let body = json!({
        "userRequest": {"utterance": "ping", "user": {"id": "bench"}},
        "action": {"params": {"usrtext": "ping"}}
    });

    c.bench_function("webhook_sync_roundtrip", |b| {
        b.iter_custom(|iters| {
            use std::time::Instant;
            let start = Instant::now();
            for _ in 0..iters {
                rt.block_on(async {
                    let resp = client.post(&webhook_url).json(&body).send().await.unwrap();
                    black_box(resp.status());
                });
            }
            start.elapsed()
        })
    });
}

criterion_group!(relay_group, bench_guard, bench_extract, bench_webhook);
criterion_main!(relay_group);
