use anyhow::Result;
use chrono::NaiveDate;
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::registry::models::{DayActivity, DeviceRecord};

pub mod models;

use models::{ActivityShard, MasterIndex};

const REGISTRY_FILE: &str = "registry.json";
const INDEX_FILE: &str = "footfall-index.json";
const SHARD_PREFIX: &str = "activity-";

/// File-backed store for daily activity shards, the registry snapshot and
/// the master footfall index.
///
/// Every write is whole-file replace via a temp file and atomic rename, so
/// a crash never leaves a truncated file. Shard read-modify-writes are
/// serialized per date: two heartbeats landing on the same day queue on the
/// same mutex instead of racing the file.
pub struct ShardStore {
    data_dir: PathBuf,
    day_locks: Mutex<HashMap<NaiveDate, Arc<Mutex<()>>>>,
    index_lock: Mutex<()>,
    snapshot_lock: Mutex<()>,
}

impl ShardStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data dir: {}", e)))?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            day_locks: Mutex::new(HashMap::new()),
            index_lock: Mutex::new(()),
            snapshot_lock: Mutex::new(()),
        })
    }

    pub fn shard_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("{}{}.json", SHARD_PREFIX, date.format("%Y-%m-%d")))
    }

    fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }

    fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_FILE)
    }

    async fn day_lock(&self, date: NaiveDate) -> Arc<Mutex<()>> {
        let mut locks = self.day_locks.lock().await;
        locks.entry(date).or_default().clone()
    }

    /// Merge one device's event lists into the shard for `date`, then bring
    /// the master footfall index up to date for that (date, device) inside
    /// the same critical section so the two can never disagree.
    pub async fn append_activity(
        &self,
        date: NaiveDate,
        device_id: &str,
        device_name: &str,
        country: &str,
        activity: &DayActivity,
    ) -> Result<()> {
        let lock = self.day_lock(date).await;
        let _guard = lock.lock().await;

        let mut shard = self
            .read_shard(date)
            .await?
            .unwrap_or_else(|| ActivityShard::new(date));

        let entry = shard.devices.entry(device_id.to_string()).or_default();
        entry.device_name = device_name.to_string();
        entry.country = country.to_string();
        entry.append(activity);
        let summary = entry.footfall_summary();

        self.write_json(&self.shard_path(date), &shard).await?;

        {
            let _index_guard = self.index_lock.lock().await;
            let mut index = self.load_master_index().await?;
            index
                .days
                .entry(date)
                .or_default()
                .insert(device_id.to_string(), summary);
            self.write_json(&self.index_path(), &index).await?;
        }

        debug!("Appended activity for {} into shard {}", device_id, date);
        Ok(())
    }

    /// Read one day's shard, or `None` if no heartbeat has touched that day
    pub async fn read_shard(&self, date: NaiveDate) -> Result<Option<ActivityShard>> {
        Self::read_shard_file(&self.shard_path(date)).await
    }

    /// Parse a shard file. A file that exists but does not parse is a
    /// `MalformedShard`, which aggregation skips rather than propagates.
    pub async fn read_shard_file(path: &Path) -> Result<Option<ActivityShard>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Storage(format!("Failed to read {:?}: {}", path, e)).into())
            }
        };

        let shard = serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedShard(format!("{:?}: {}", path, e)))?;
        Ok(Some(shard))
    }

    /// All shard files on disk, sorted lexically by filename. Filenames
    /// encode the date, so lexical order is chronological order.
    pub fn shard_files(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let pattern = self
            .data_dir
            .join(format!("{}*.json", SHARD_PREFIX))
            .to_string_lossy()
            .into_owned();

        let mut files = Vec::new();
        for entry in glob::glob(&pattern)
            .map_err(|e| Error::Storage(format!("Bad shard pattern: {}", e)))?
        {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    log::warn!("Skipping unreadable shard entry: {}", e);
                    continue;
                }
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(date_str) = stem.strip_prefix(SHARD_PREFIX) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                log::warn!("Skipping shard with unparseable date: {:?}", path);
                continue;
            };
            files.push((date, path));
        }

        files.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(files)
    }

    /// Persist the full fleet snapshot (write-through from the registry)
    pub async fn save_registry_snapshot(&self, records: &[DeviceRecord]) -> Result<()> {
        let _guard = self.snapshot_lock.lock().await;
        self.write_json(&self.registry_path(), &records).await
    }

    /// Load the last persisted fleet snapshot; empty if none exists yet
    pub async fn load_registry_snapshot(&self) -> Result<Vec<DeviceRecord>> {
        let path = self.registry_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Storage(format!("Failed to read {:?}: {}", path, e)).into())
            }
        };

        let records = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("Corrupt registry snapshot: {}", e)))?;
        Ok(records)
    }

    pub async fn load_master_index(&self) -> Result<MasterIndex> {
        let path = self.index_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MasterIndex::default())
            }
            Err(e) => {
                return Err(Error::Storage(format!("Failed to read {:?}: {}", path, e)).into())
            }
        };

        let index = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Storage(format!("Corrupt master index: {}", e)))?;
        Ok(index)
    }

    /// Write-temp-then-rename so readers never observe a partial file
    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Storage(format!("Failed to serialize {:?}: {}", path, e)))?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to rename {:?}: {}", tmp, e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::RestrictedSighting;
    use chrono::{DateTime, TimeZone, Utc};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn one_sighting(ts: &str) -> DayActivity {
        DayActivity {
            general_sightings: vec![at(ts)],
            ..DayActivity::default()
        }
    }

    #[tokio::test]
    async fn append_creates_shard_lazily() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;
        let day = date("2026-08-01");

        assert!(store.read_shard(day).await?.is_none());

        store
            .append_activity(day, "K1", "Lobby", "Portugal", &one_sighting("2026-08-01T09:00:00Z"))
            .await?;

        let shard = store.read_shard(day).await?.unwrap();
        assert_eq!(shard.date, day);
        assert_eq!(shard.devices["K1"].general_sightings.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_appends_concatenate_without_dedup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;
        let day = date("2026-08-01");
        let activity = one_sighting("2026-08-01T09:00:00Z");

        store
            .append_activity(day, "K1", "Lobby", "Portugal", &activity)
            .await?;
        store
            .append_activity(day, "K1", "Lobby", "Portugal", &activity)
            .await?;

        let shard = store.read_shard(day).await?.unwrap();
        assert_eq!(shard.devices["K1"].general_sightings.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_same_day_appends_lose_nothing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(ShardStore::new(dir.path())?);
        let day = date("2026-08-01");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let id = format!("K{}", i % 4);
            handles.push(tokio::spawn(async move {
                let activity = DayActivity {
                    footfall_left: vec![at("2026-08-01T10:00:00Z")],
                    ..DayActivity::default()
                };
                store
                    .append_activity(day, &id, "Kiosk", "Portugal", &activity)
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let shard = store.read_shard(day).await?.unwrap();
        let total: usize = shard
            .devices
            .values()
            .map(|d| d.footfall_left.len())
            .sum();
        assert_eq!(total, 16);
        Ok(())
    }

    #[tokio::test]
    async fn master_index_agrees_with_shard_footfall() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;
        let day = date("2026-08-02");

        let activity = DayActivity {
            footfall_left: vec![at("2026-08-02T10:00:00Z"), at("2026-08-02T10:01:00Z")],
            footfall_right: vec![at("2026-08-02T10:02:00Z")],
            ..DayActivity::default()
        };
        store
            .append_activity(day, "K1", "Lobby", "Portugal", &activity)
            .await?;
        store
            .append_activity(day, "K1", "Lobby", "Portugal", &activity)
            .await?;

        let shard = store.read_shard(day).await?.unwrap();
        let index = store.load_master_index().await?;
        let summary = index.days[&day]["K1"];
        assert_eq!(summary.left, shard.devices["K1"].footfall_left.len() as u64);
        assert_eq!(summary.right, shard.devices["K1"].footfall_right.len() as u64);
        assert_eq!(summary.left, 4);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_round_trips_with_full_timestamp_precision() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;

        let last_seen = Utc.timestamp_opt(1_756_300_000, 123_456_789).unwrap();
        let record = DeviceRecord {
            id: "K1".to_string(),
            name: "Lobby".to_string(),
            country: "Portugal".to_string(),
            currency_code: "EUR".to_string(),
            address: "Lisbon Airport T1".to_string(),
            network_address: Some("10.0.0.7:7700".to_string()),
            last_seen,
            software_version: "2.4.1".to_string(),
            camera_state: Default::default(),
            last_restricted_time: Some(last_seen),
            last_restricted_subject: Some("bob".to_string()),
            restricted_subjects: vec!["alice".to_string(), "bob".to_string()],
            today: Default::default(),
            offline_alert_sent: true,
            alert_attempts: 2,
        };

        store.save_registry_snapshot(&[record.clone()]).await?;
        let loaded = store.load_registry_snapshot().await?;
        assert_eq!(loaded, vec![record]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_snapshot_loads_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;
        assert!(store.load_registry_snapshot().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_shard_is_reported_not_swallowed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;
        let day = date("2026-08-03");

        tokio::fs::write(store.shard_path(day), b"{ not json").await?;
        let err = store.read_shard(day).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MalformedShard(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn shard_files_enumerate_in_date_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;

        for day in ["2026-08-10", "2026-08-01", "2026-08-05"] {
            store
                .append_activity(
                    date(day),
                    "K1",
                    "Lobby",
                    "Portugal",
                    &one_sighting(&format!("{}T09:00:00Z", day)),
                )
                .await?;
        }

        let dates: Vec<NaiveDate> = store.shard_files()?.into_iter().map(|(d, _)| d).collect();
        assert_eq!(
            dates,
            vec![date("2026-08-01"), date("2026-08-05"), date("2026-08-10")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn restricted_sightings_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ShardStore::new(dir.path())?;
        let day = date("2026-08-04");

        let activity = DayActivity {
            restricted_sightings: vec![RestrictedSighting {
                subject: "bob".to_string(),
                first_seen: at("2026-08-04T09:00:00Z"),
                last_seen: at("2026-08-04T09:05:00Z"),
                count: 3,
            }],
            ..DayActivity::default()
        };
        store
            .append_activity(day, "K1", "Lobby", "Portugal", &activity)
            .await?;

        let shard = store.read_shard(day).await?.unwrap();
        let sighting = &shard.devices["K1"].restricted_sightings[0];
        assert_eq!(sighting.subject, "bob");
        assert_eq!(sighting.count, 3);
        Ok(())
    }
}
