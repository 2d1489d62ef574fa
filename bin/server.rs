// Classroom Scores - Web Server
// REST API with Axum

use anyhow::{Context, Result};
use classroom_scores::api::{self, AppState};
use classroom_scores::{chart, init_tracing, open_database, setup_database, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();

    // Open the store once; it lives as long as the server
    let conn = open_database(&config.database_url)?;
    setup_database(&conn).context("Failed to set up database schema")?;
    info!(database = %config.database_url, "database ready");

    chart::init_chart_font(config.chart_font.as_deref());

    let app = api::router(AppState::new(conn));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
    }
}
