use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};
use wordroot::{app, build_state, completion_from_config, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Structured logging, filtered by RUST_LOG.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], config.port).into();
    tracing::info!(
        model = %config.model,
        timeout_ms = config.completion_timeout_ms,
        static_dir = %config.static_dir.display(),
        "configuration loaded"
    );

    // A missing credential is not fatal: the socket still binds and
    // /query answers 500 until the process is restarted with one.
    let completion = completion_from_config(&config);
    let state = build_state(config, completion);
    let app = app(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
