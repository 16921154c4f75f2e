use tracing_subscriber::EnvFilter;

use boardroom_server::config::ServerConfig;
use boardroom_server::{build_app, spawn_background};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("BOARDROOM_LOG_FORMAT").is_ok_and(|v| v == "json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = ServerConfig::load();
    config.validate();
    let addr = config.listen_addr.clone();

    let (app, state) = build_app(config);
    match state.registry.rehydrate().await {
        Ok(loaded) => tracing::info!(loaded, "Store rehydration finished"),
        Err(e) => tracing::error!(error = %e, "Store rehydration failed, starting empty"),
    }
    let reaper = spawn_background(&state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind");
            std::process::exit(1);
        },
    };
    tracing::info!(addr = %addr, "Boardroom server listening");

    let shutdown = state.shutdown.clone();
    let scheduler = state.scheduler.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
            scheduler.shutdown();
        })
        .await;

    if let Err(e) = served {
        tracing::error!(error = %e, "Server error");
    }
    state.shutdown.cancel();
    let _ = reaper.await;
    state.queue.close();
}
