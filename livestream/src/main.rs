use std::sync::Arc;

use livestream::api::{ApiServer, AppState};
use livestream::config::AppConfig;
use livestream::database::{Datastore, SqliteDatastore};
use livestream::logging::init_logging;
use livestream::process::FfmpegProcessManager;
use livestream::stream::{SessionContext, StreamManager};
use livestream::tuner::MirakurunClient;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::from_env()?);
    let (logging, _guard) = init_logging(&config.log_dir)?;

    // The database must be usable before anything else starts.
    let datastore = match SqliteDatastore::connect(&config.database_url).await {
        Ok(datastore) => datastore,
        Err(e) => {
            tracing::error!("Failed to open database {}: {}", config.database_url, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = datastore.initialize().await {
        tracing::error!("Failed to initialize database: {}", e);
        std::process::exit(1);
    }

    let tuner = Arc::new(MirakurunClient::new(config.mirakurun_url.clone())?);
    let processes = Arc::new(FfmpegProcessManager::new(config.max_processes));
    let ctx = SessionContext::new(&config, tuner, processes);
    let manager = Arc::new(StreamManager::new(
        ctx,
        config.stream_files_dir.clone(),
        config.default_priority,
    ));

    tracing::info!(
        presets = config.presets.len(),
        max_processes = config.max_processes,
        "livestream initialized"
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let shutdown_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        tracing::info!("Received Ctrl-C, shutting down");
        shutdown.cancel();
        // Open live responses only finish once their sessions are stopped.
        shutdown_manager.stop_all().await;
    });

    let state = AppState::new(manager.clone(), config.clone()).with_logging(logging);
    let server = ApiServer::new(config.bind_address.clone(), state);
    let result = server.run(cancel).await;

    manager.stop_all().await;
    result?;
    tracing::info!("livestream stopped");
    Ok(())
}
