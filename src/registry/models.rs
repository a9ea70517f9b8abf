use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::storage::models::RestrictedSighting;

/// Camera health as last reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Ok,
    Degraded,
    Error,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CameraState {
    pub status: CameraStatus,
    /// Free-text detail supplied by the device (driver message, frame rate, ...)
    #[serde(default)]
    pub detail: String,
}

/// Today's running counters as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TodayCounters {
    pub general: u64,
    pub restricted: u64,
}

/// One fleet device. Owned exclusively by the [`FleetRegistry`]; every
/// heartbeat replaces the record wholesale except `offline_alert_sent`
/// and `alert_attempts`, which only the registry and detector touch.
///
/// [`FleetRegistry`]: crate::registry::FleetRegistry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub country: String,
    pub currency_code: String,
    pub address: String,
    pub network_address: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub software_version: String,
    pub camera_state: CameraState,
    pub last_restricted_time: Option<DateTime<Utc>>,
    pub last_restricted_subject: Option<String>,
    /// Sorted and deduplicated for display
    pub restricted_subjects: Vec<String>,
    pub today: TodayCounters,
    /// Edge-trigger latch: true once an offline alert has gone out for the
    /// current outage, cleared by the next successful heartbeat
    pub offline_alert_sent: bool,
    /// Failed delivery attempts for the current outage
    #[serde(default)]
    pub alert_attempts: u32,
}

impl DeviceRecord {
    /// Build a record from a heartbeat, stamping `last_seen` with the
    /// server clock. Client-supplied times are never trusted for liveness.
    pub fn from_heartbeat(hb: &Heartbeat, now: DateTime<Utc>) -> Self {
        let mut subjects: Vec<String> = hb
            .restricted_users_list
            .clone()
            .unwrap_or_default();
        subjects.sort();
        subjects.dedup();

        Self {
            id: hb.kiosk_id.clone(),
            name: hb
                .kiosk_name
                .clone()
                .unwrap_or_else(|| "Unknown Kiosk".to_string()),
            country: hb
                .country
                .clone()
                .unwrap_or_else(|| "Unknown Country".to_string()),
            currency_code: hb.currency_iso.clone().unwrap_or_else(|| "N/A".to_string()),
            address: hb.address.clone().unwrap_or_else(|| "Unknown".to_string()),
            network_address: hb.network_address.clone(),
            last_seen: now,
            software_version: hb
                .software_version
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            camera_state: hb.camera_state.clone().unwrap_or_default(),
            last_restricted_time: hb.restricted_detected_time,
            last_restricted_subject: hb.restricted_filename.clone(),
            restricted_subjects: subjects,
            today: hb.today.unwrap_or_default(),
            offline_alert_sent: false,
            alert_attempts: 0,
        }
    }
}

/// Per-day event lists carried by a heartbeat, merged into that day's
/// activity shard by concatenation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DayActivity {
    #[serde(default)]
    pub general_sightings: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub restricted_sightings: Vec<RestrictedSighting>,
    #[serde(default)]
    pub footfall_left: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub footfall_right: Vec<DateTime<Utc>>,
}

impl DayActivity {
    pub fn is_empty(&self) -> bool {
        self.general_sightings.is_empty()
            && self.restricted_sightings.is_empty()
            && self.footfall_left.is_empty()
            && self.footfall_right.is_empty()
    }
}

/// Inbound heartbeat payload. Only `kiosk_id` is required; everything else
/// defaults to a documented placeholder on ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Heartbeat {
    #[serde(default)]
    pub kiosk_id: String,
    pub kiosk_name: Option<String>,
    pub country: Option<String>,
    pub currency_iso: Option<String>,
    pub address: Option<String>,
    pub network_address: Option<String>,
    pub software_version: Option<String>,
    pub camera_state: Option<CameraState>,
    pub restricted_detected_time: Option<DateTime<Utc>>,
    pub restricted_filename: Option<String>,
    pub restricted_users_list: Option<Vec<String>>,
    pub today: Option<TodayCounters>,
    /// Per-category event lists keyed by UTC calendar day
    #[serde(default)]
    pub activity: HashMap<NaiveDate, DayActivity>,
}
