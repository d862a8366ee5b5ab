//! onebox - Entry point for the sync service

use anyhow::Context;
use onebox::config::Settings;
use onebox::storage::StorageLayer;
use onebox::App;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting onebox");

    if let Err(e) = run().await {
        tracing::error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load settings")?;
    let db_path = settings.storage.resolve_database_path()?;
    tracing::info!(path = %db_path.display(), "Opening database");

    let storage = StorageLayer::new(&db_path)
        .await
        .context("Failed to open database")?;
    let app = App::new(settings, storage).await?;
    app.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    app.shutdown().await;
    Ok(())
}
