use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use intelliscan_rs::{build_pipeline, init_tracing, router, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::parse();
    config.validate()?;
    let addr = config.socket_addr()?;

    let pipeline = tokio::task::spawn_blocking({
        let config = config.clone();
        move || build_pipeline(&config)
    })
    .await
    .context("pipeline startup task panicked")??;

    let app = router(AppState::new(pipeline, config));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
