use anyhow::Result;
use log::{error, info};
use std::sync::Arc;
use tokio::time::{interval, Duration};

use crate::config::ReportConfig;
use crate::devices;
use crate::mailer::{MailMessage, MailTransport};
use crate::registry::FleetRegistry;
use crate::reports::{build_report, to_csv, ReportScope};
use crate::storage::ShardStore;

/// Periodic job that builds the full report and mails it out as CSV
pub struct ReportScheduler {
    store: Arc<ShardStore>,
    registry: Arc<FleetRegistry>,
    mailer: Arc<dyn MailTransport>,
    config: ReportConfig,
    recipient: String,
}

impl ReportScheduler {
    pub fn new(
        store: Arc<ShardStore>,
        registry: Arc<FleetRegistry>,
        mailer: Arc<dyn MailTransport>,
        config: ReportConfig,
        recipient: &str,
    ) -> Self {
        Self {
            store,
            registry,
            mailer,
            config,
            recipient: recipient.to_string(),
        }
    }

    /// Start the scheduled report job in the background
    pub fn start(self: Arc<Self>) {
        if !self.config.enabled {
            info!("Scheduled report job is disabled");
            return;
        }

        info!(
            "Starting report scheduler with interval of {} seconds",
            self.config.interval_secs
        );

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(self.config.interval_secs));
            // The first tick fires immediately; skip it so a restart loop
            // does not mail a report every time the process comes up
            interval.tick().await;

            loop {
                interval.tick().await;

                if let Err(e) = self.run_once().await {
                    error!("Scheduled report run failed: {}", e);
                }
            }
        });
    }

    /// Build and mail one report covering all available shards
    pub async fn run_once(&self) -> Result<()> {
        if self.config.pull_before_report {
            devices::pull_fleet(&self.registry, self.config.pull_timeout_secs).await;
        }

        let report = build_report(&self.store, &ReportScope::All).await?;
        info!(
            "Scheduled report built: {} rows from {} shards ({} skipped)",
            report.rows.len(),
            report.shards_read,
            report.shards_skipped
        );

        let csv = to_csv(&report.rows);
        let message = MailMessage {
            to: self.recipient.clone(),
            subject: format!(
                "Fleet activity report: {} rows, {} shards",
                report.rows.len(),
                report.shards_read
            ),
            body: format!(
                "Attached: consolidated fleet activity.\nShards read: {}\nShards skipped: {}",
                report.shards_read, report.shards_skipped
            ),
            attachment: Some(("fleet-report.csv".to_string(), csv.into_bytes())),
        };
        self.mailer.send(&message).await?;

        Ok(())
    }
}
