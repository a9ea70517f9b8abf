use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::Error;
use crate::storage::ShardStore;

pub mod models;

use models::{DeviceRecord, Heartbeat};

/// In-memory map of the fleet, the single authoritative copy of device
/// state. One coarse lock over the whole map: fleets are tens to low
/// hundreds of devices, so contention is not worth per-device locking.
///
/// Snapshot persistence is write-through but always happens after the lock
/// is released, so ingestion never serializes on disk latency. A failed
/// durable write is logged and the in-memory update stands; keeping the
/// service live beats losing a heartbeat.
///
/// Each snapshot is stamped with a sequence number taken inside the map's
/// critical section, and writes are gated on that sequence: a snapshot that
/// lost the race to a newer one is dropped instead of clobbering the file
/// with older state.
pub struct FleetRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    store: Arc<ShardStore>,
    snapshot_seq: AtomicU64,
    /// Highest sequence persisted so far; also serializes the file writes
    persist_gate: Mutex<u64>,
}

impl FleetRegistry {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            store,
            snapshot_seq: AtomicU64::new(0),
            persist_gate: Mutex::new(0),
        }
    }

    /// Restore the fleet from the last persisted snapshot
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.load_registry_snapshot().await?;
        let count = records.len();

        let mut devices = self.devices.write().await;
        for record in records {
            devices.insert(record.id.clone(), record);
        }

        info!("Restored {} devices from registry snapshot", count);
        Ok(count)
    }

    /// Ingest a heartbeat: wholesale replace of the device record, with
    /// `last_seen` stamped from the server clock and the offline-alert
    /// latch cleared.
    pub async fn upsert(&self, heartbeat: &Heartbeat) -> Result<DeviceRecord> {
        if heartbeat.kiosk_id.trim().is_empty() {
            return Err(Error::InvalidInput("Missing kiosk_id".to_string()).into());
        }

        let record = DeviceRecord::from_heartbeat(heartbeat, Utc::now());

        let (snapshot, seq) = {
            let mut devices = self.devices.write().await;
            devices.insert(record.id.clone(), record.clone());
            self.clone_snapshot(&devices)
        };

        self.persist(snapshot, seq).await;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(id).cloned()
    }

    /// Point-in-time snapshot of the fleet, grouped for display: country
    /// lexical, then device id lexical within country.
    pub async fn list(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> =
            self.devices.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.country.cmp(&b.country).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Delete a device. Removing an absent id is not an error.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let (removed, snapshot, seq) = {
            let mut devices = self.devices.write().await;
            let removed = devices.remove(id).is_some();
            let (snapshot, seq) = self.clone_snapshot(&devices);
            (removed, snapshot, seq)
        };

        if removed {
            info!("Removed device {} from registry", id);
            self.persist(snapshot, seq).await;
        }
        Ok(removed)
    }

    /// Latch the offline alert for a device after a confirmed delivery
    pub async fn mark_alert_sent(&self, id: &str) {
        self.flip(id, |record| {
            record.offline_alert_sent = true;
        })
        .await;
    }

    /// Count a failed delivery attempt; returns the new attempt total so
    /// the detector can enforce its cap, or `None` if the device vanished.
    pub async fn record_alert_attempt(&self, id: &str) -> Option<u32> {
        let mut attempts = None;
        self.flip(id, |record| {
            record.alert_attempts += 1;
            attempts = Some(record.alert_attempts);
        })
        .await;
        attempts
    }

    async fn flip<F: FnOnce(&mut DeviceRecord)>(&self, id: &str, apply: F) {
        let (snapshot, seq) = {
            let mut devices = self.devices.write().await;
            let Some(record) = devices.get_mut(id) else {
                return;
            };
            apply(record);
            self.clone_snapshot(&devices)
        };
        self.persist(snapshot, seq).await;
    }

    /// Clone the map and take the next snapshot sequence. Must be called
    /// with the write lock held so sequence order matches mutation order.
    fn clone_snapshot(&self, devices: &HashMap<String, DeviceRecord>) -> (Vec<DeviceRecord>, u64) {
        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        (devices.values().cloned().collect(), seq)
    }

    #[cfg(test)]
    pub async fn set_last_seen(&self, id: &str, last_seen: chrono::DateTime<Utc>) {
        self.flip(id, |record| {
            record.last_seen = last_seen;
        })
        .await;
    }

    async fn persist(&self, snapshot: Vec<DeviceRecord>, seq: u64) {
        let mut gate = self.persist_gate.lock().await;
        if seq <= *gate {
            debug!("Dropping stale snapshot seq {} (newest persisted: {})", seq, *gate);
            return;
        }
        match self.store.save_registry_snapshot(&snapshot).await {
            Ok(()) => *gate = seq,
            Err(e) => {
                warn!("Registry snapshot write failed, in-memory state kept: {}", e);
            }
        }
    }
}
