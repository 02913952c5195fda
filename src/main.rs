use std::env;

use skill_relay::{app, build_state_from_env};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let state = build_state_from_env().await?;
    tracing::info!(
        store = state.dispatcher.guard().store_kind(),
        callback_enabled = state.config.callback.enabled,
        sync_budget_ms = state.config.sync.budget.as_millis() as u64,
        "relay configured"
    );
    let app = app(state);

    // Determine port to bind on. Default to 8080 if unspecified.
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], port).into();

    // Run the server with graceful shutdown on Ctrl+C. Detached callback
    // workers still running at that point are dropped with the runtime.
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
