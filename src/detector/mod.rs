use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::{interval, timeout, Duration};

use crate::config::DetectorConfig;
use crate::mailer::{MailMessage, MailTransport};
use crate::registry::models::DeviceRecord;
use crate::registry::FleetRegistry;

/// Periodic scan of the fleet that emits one alert per outage.
///
/// The transition is edge-triggered: a device alerts when it crosses the
/// staleness threshold with the latch clear, and the latch stays set until
/// the next heartbeat clears it. The latch is only set after the transport
/// confirms delivery; a failed delivery is retried on the next tick, and
/// after `max_alert_attempts` failures the latch is forced so a dead
/// transport cannot loop forever.
pub struct OfflineDetector {
    registry: Arc<FleetRegistry>,
    mailer: Arc<dyn MailTransport>,
    config: DetectorConfig,
    recipient: String,
    mail_timeout: Duration,
}

impl OfflineDetector {
    pub fn new(
        registry: Arc<FleetRegistry>,
        mailer: Arc<dyn MailTransport>,
        config: DetectorConfig,
        recipient: &str,
        mail_timeout_secs: u64,
    ) -> Self {
        Self {
            registry,
            mailer,
            config,
            recipient: recipient.to_string(),
            mail_timeout: Duration::from_secs(mail_timeout_secs),
        }
    }

    /// Start the detector loop in the background
    pub fn start(self: Arc<Self>) {
        info!(
            "Starting offline detector: threshold {}s, interval {}s",
            self.config.offline_threshold_secs, self.config.check_interval_secs
        );

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(self.config.check_interval_secs));

            loop {
                interval.tick().await;

                if let Err(e) = self.scan(Utc::now()).await {
                    error!("Detector scan failed: {}", e);
                }
            }
        });
    }

    fn is_offline(&self, record: &DeviceRecord, now: DateTime<Utc>) -> bool {
        // Saturate instead of casting: an absurd configured threshold must
        // read as "never offline", not wrap negative
        let threshold_ms = i64::try_from(self.config.offline_threshold_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        (now - record.last_seen).num_milliseconds() > threshold_ms
    }

    /// One full-fleet pass. Devices are evaluated independently: one
    /// device's delivery failure never blocks the rest of the scan.
    /// Returns the number of alerts confirmed delivered.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut delivered = 0;

        for record in self.registry.list().await {
            if !self.is_offline(&record, now) || record.offline_alert_sent {
                continue;
            }

            match self.deliver_alert(&record).await {
                Ok(()) => {
                    info!("Offline alert delivered for device {}", record.id);
                    self.registry.mark_alert_sent(&record.id).await;
                    delivered += 1;
                }
                Err(e) => {
                    warn!("Offline alert for {} failed: {}", record.id, e);
                    let attempts = self.registry.record_alert_attempt(&record.id).await;
                    if attempts.map_or(false, |n| n >= self.config.max_alert_attempts) {
                        warn!(
                            "Giving up on alert for {} after {} attempts",
                            record.id, self.config.max_alert_attempts
                        );
                        self.registry.mark_alert_sent(&record.id).await;
                    }
                }
            }
        }

        Ok(delivered)
    }

    async fn deliver_alert(&self, record: &DeviceRecord) -> Result<()> {
        let message = MailMessage {
            to: self.recipient.clone(),
            subject: format!("Kiosk offline: {} ({})", record.id, record.name),
            body: format!(
                "Device {} ({}) in {} has not reported for over {} seconds.\nLast seen: {}",
                record.id,
                record.name,
                record.country,
                self.config.offline_threshold_secs,
                record.last_seen.to_rfc3339(),
            ),
            attachment: None,
        };

        match timeout(self.mail_timeout, self.mailer.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::Error::Upstream(format!(
                "Mail delivery timed out after {:?}",
                self.mail_timeout
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::models::Heartbeat;
    use crate::storage::ShardStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockMailer {
        sent: Mutex<Vec<MailMessage>>,
        fail: AtomicBool,
        fail_matching: Mutex<Option<String>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl MailTransport for MockMailer {
        async fn send(&self, message: &MailMessage) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let selective = self
                .fail_matching
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |needle| message.subject.contains(needle));
            if self.fail.load(Ordering::SeqCst) || selective {
                return Err(crate::error::Error::Upstream("transport down".into()).into());
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<FleetRegistry>, Arc<MockMailer>, OfflineDetector) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ShardStore::new(dir.path()).unwrap());
        let registry = Arc::new(FleetRegistry::new(store));
        let mailer = Arc::new(MockMailer::default());
        let detector = OfflineDetector::new(
            registry.clone(),
            mailer.clone(),
            DetectorConfig {
                offline_threshold_secs: 300,
                check_interval_secs: 60,
                max_alert_attempts: 3,
            },
            "ops@example.com",
            10,
        );
        (dir, registry, mailer, detector)
    }

    async fn seed(registry: &FleetRegistry, id: &str) {
        let mut hb = Heartbeat::default();
        hb.kiosk_id = id.to_string();
        hb.kiosk_name = Some(format!("{} lobby", id));
        hb.country = Some("Portugal".to_string());
        registry.upsert(&hb).await.unwrap();
    }

    #[tokio::test]
    async fn exactly_one_alert_across_many_ticks() {
        let (_dir, registry, mailer, detector) = setup();
        seed(&registry, "K1").await;

        let last_seen = registry.get("K1").await.unwrap().last_seen;
        let stale = last_seen + ChronoDuration::seconds(301);

        for tick in 0..5 {
            let delivered = detector.scan(stale + ChronoDuration::seconds(tick * 60)).await.unwrap();
            assert_eq!(delivered, if tick == 0 { 1 } else { 0 });
        }

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("K1"));
        assert!(sent[0].body.contains(&last_seen.to_rfc3339()));
    }

    #[tokio::test]
    async fn fresh_device_never_alerts() {
        let (_dir, registry, mailer, detector) = setup();
        seed(&registry, "K1").await;

        let last_seen = registry.get("K1").await.unwrap().last_seen;
        // 300s exactly is still online: the transition needs strictly more
        let delivered = detector
            .scan(last_seen + ChronoDuration::seconds(300))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_threshold_never_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ShardStore::new(dir.path()).unwrap());
        let registry = Arc::new(FleetRegistry::new(store));
        let mailer = Arc::new(MockMailer::default());
        let detector = OfflineDetector::new(
            registry.clone(),
            mailer.clone(),
            DetectorConfig {
                offline_threshold_secs: u64::MAX,
                check_interval_secs: 60,
                max_alert_attempts: 3,
            },
            "ops@example.com",
            10,
        );
        seed(&registry, "K1").await;

        let far_future = Utc::now() + ChronoDuration::days(365 * 100);
        let delivered = detector.scan(far_future).await.unwrap();
        assert_eq!(delivered, 0);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_rearms_the_alert() {
        let (_dir, registry, mailer, detector) = setup();
        seed(&registry, "K1").await;

        let stale = registry.get("K1").await.unwrap().last_seen + ChronoDuration::seconds(301);
        detector.scan(stale).await.unwrap();
        assert!(registry.get("K1").await.unwrap().offline_alert_sent);

        seed(&registry, "K1").await;
        assert!(!registry.get("K1").await.unwrap().offline_alert_sent);

        let stale_again =
            registry.get("K1").await.unwrap().last_seen + ChronoDuration::seconds(301);
        detector.scan(stale_again).await.unwrap();
        assert_eq!(mailer.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_delivery_retries_then_caps() {
        let (_dir, registry, mailer, detector) = setup();
        seed(&registry, "K1").await;
        mailer.fail.store(true, Ordering::SeqCst);

        let stale = registry.get("K1").await.unwrap().last_seen + ChronoDuration::seconds(301);
        for tick in 0..5 {
            detector.scan(stale + ChronoDuration::seconds(tick * 60)).await.unwrap();
        }

        // Three attempts, then the latch is forced and ticks 4 and 5 skip
        assert_eq!(mailer.attempts.load(Ordering::SeqCst), 3);
        assert!(registry.get("K1").await.unwrap().offline_alert_sent);
    }

    #[tokio::test]
    async fn one_failing_device_does_not_block_others() {
        let (_dir, registry, mailer, detector) = setup();
        seed(&registry, "K1").await;
        seed(&registry, "K2").await;
        *mailer.fail_matching.lock().unwrap() = Some("K1".to_string());

        let stale = registry.get("K2").await.unwrap().last_seen + ChronoDuration::seconds(301);
        let delivered = detector.scan(stale).await.unwrap();

        // K1's delivery failed but K2's alert still went out
        assert_eq!(delivered, 1);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("K2"));
    }

    #[tokio::test]
    async fn stale_k1_alerts_while_fresh_k2_does_not() {
        let (_dir, registry, mailer, detector) = setup();
        seed(&registry, "K1").await;
        seed(&registry, "K2").await;

        // K1 last reported at T0; K2's most recent heartbeat lands 301
        // seconds later, with nothing from K1 in between
        let t0 = Utc::now() - ChronoDuration::seconds(301);
        registry.set_last_seen("K1", t0).await;
        let now = t0 + ChronoDuration::seconds(301) + ChronoDuration::milliseconds(1);
        registry.set_last_seen("K2", now).await;

        let delivered = detector.scan(now).await.unwrap();
        assert_eq!(delivered, 1);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("K1"));
        assert!(sent[0].body.contains(&t0.to_rfc3339()));
    }
}
