//! Process entry point: parses configuration, initializes tracing, opens
//! the mirror registry, and binds the HTTP surface. Grounded on
//! `examples/http_server.rs`'s `main()` (axum `Router` + `TcpListener`
//! binding), extended with `clap`-based configuration and the event-loop
//! background task.

use clap::Parser;
use goblet::config::GobletConfig;
use goblet::events::{run_event_loop, TracingSink};
use goblet::http::build_router;
use goblet::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = GobletConfig::parse();

    if let Err(e) = tokio::fs::create_dir_all(&config.cache_root).await {
        tracing::error!(error = %e, cache_root = ?config.cache_root, "cannot create cache root");
        std::process::exit(1);
    }

    let (app_state, event_receiver) = AppState::new(
        config.cache_root.clone(),
        config.upstream_timeout,
        config.freshness_window,
        config.event_queue_capacity,
        config.request_timeout,
    );

    tokio::spawn(run_event_loop(event_receiver, TracingSink));

    let router = build_router(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = %addr, "failed to bind");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %addr, cache_root = ?config.cache_root, "goblet listening");

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
