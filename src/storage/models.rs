use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::registry::models::DayActivity;

/// A restricted-subject sighting window reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictedSighting {
    pub subject: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default = "default_count")]
    pub count: u64,
}

fn default_count() -> u64 {
    1
}

/// One device's slice of a daily shard. Event lists grow by concatenation
/// only; a day's shard is the sole source of truth for that day's counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceActivity {
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub general_sightings: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub restricted_sightings: Vec<RestrictedSighting>,
    #[serde(default)]
    pub footfall_left: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub footfall_right: Vec<DateTime<Utc>>,
}

impl DeviceActivity {
    /// Concatenate a heartbeat's event lists into this entry. No
    /// deduplication: devices are assumed to deliver at most once.
    pub fn append(&mut self, activity: &DayActivity) {
        self.general_sightings
            .extend(activity.general_sightings.iter().cloned());
        self.restricted_sightings
            .extend(activity.restricted_sightings.iter().cloned());
        self.footfall_left
            .extend(activity.footfall_left.iter().cloned());
        self.footfall_right
            .extend(activity.footfall_right.iter().cloned());
    }

    pub fn footfall_summary(&self) -> FootfallSummary {
        FootfallSummary {
            left: self.footfall_left.len() as u64,
            right: self.footfall_right.len() as u64,
        }
    }
}

/// One activity shard file: all devices' events for a single UTC day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityShard {
    pub date: NaiveDate,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceActivity>,
}

impl ActivityShard {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            devices: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FootfallSummary {
    pub left: u64,
    pub right: u64,
}

/// Denormalized footfall-only index spanning all days, for whole-fleet
/// footfall queries without touching every shard. Must agree with the
/// per-day shards; it is updated in the same critical section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MasterIndex {
    #[serde(default)]
    pub days: BTreeMap<NaiveDate, BTreeMap<String, FootfallSummary>>,
}
