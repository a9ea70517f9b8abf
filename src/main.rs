use anyhow::Result;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use kiosk_sentinel::api::RestApi;
use kiosk_sentinel::config;
use kiosk_sentinel::detector::OfflineDetector;
use kiosk_sentinel::mailer::OutboxMailer;
use kiosk_sentinel::registry::FleetRegistry;
use kiosk_sentinel::reports::scheduler::ReportScheduler;
use kiosk_sentinel::storage::ShardStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Optional config file path as the first argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = config::load_config(config_path.as_deref())?;

    // Initialize logging at the configured level; RUST_LOG still overrides
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.api.log_level.as_str()),
    )
    .init();
    info!("Starting kiosk fleet heartbeat monitor");
    info!("Configuration loaded");

    // Shard store and fleet registry, restored from the last snapshot so a
    // restart does not wait for the next heartbeat round
    let store = Arc::new(ShardStore::new(&config.storage.data_dir)?);
    let registry = Arc::new(FleetRegistry::new(store.clone()));
    match registry.load().await {
        Ok(count) => info!("Fleet registry ready with {} devices", count),
        Err(e) => warn!("Starting with an empty registry: {}", e),
    }

    // Mail transport boundary
    let mailer = Arc::new(OutboxMailer::new(&config.mail.outbox_dir)?);

    // Start the offline detector
    let detector = Arc::new(OfflineDetector::new(
        registry.clone(),
        mailer.clone(),
        config.detector.clone(),
        &config.mail.recipient,
        config.mail.timeout_secs,
    ));
    detector.start();
    info!("Offline detector started");

    // Start the scheduled report job
    let report_scheduler = Arc::new(ReportScheduler::new(
        store.clone(),
        registry.clone(),
        mailer,
        config.report.clone(),
        &config.mail.recipient,
    ));
    report_scheduler.start();

    // Start the REST API
    let http_server = RestApi::new(
        &config.api,
        &config.security,
        config.report.clone(),
        registry,
        store,
    )?;
    tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            error!("API server stopped: {}", e);
        }
    });

    // Wait for termination signals
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}
