use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::error::Error;
use crate::storage::models::DeviceActivity;
use crate::storage::ShardStore;

pub mod scheduler;

/// Which shard files a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportScope {
    Day(NaiveDate),
    /// Inclusive on both ends
    Range(NaiveDate, NaiveDate),
    All,
}

impl ReportScope {
    /// Parse the export query parameter: `all`, `YYYY-MM-DD`, or
    /// `YYYY-MM-DD..YYYY-MM-DD`
    pub fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if let Some((from, to)) = s.split_once("..") {
            let from = NaiveDate::parse_from_str(from, "%Y-%m-%d")
                .map_err(|e| Error::InvalidInput(format!("Bad range start {:?}: {}", from, e)))?;
            let to = NaiveDate::parse_from_str(to, "%Y-%m-%d")
                .map_err(|e| Error::InvalidInput(format!("Bad range end {:?}: {}", to, e)))?;
            if from > to {
                return Err(Error::InvalidInput(format!("Empty range {}..{}", from, to)).into());
            }
            return Ok(Self::Range(from, to));
        }
        let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| Error::InvalidInput(format!("Bad report scope {:?}: {}", s, e)))?;
        Ok(Self::Day(day))
    }

    pub fn includes(&self, date: NaiveDate) -> bool {
        match self {
            Self::Day(day) => date == *day,
            Self::Range(from, to) => date >= *from && date <= *to,
            Self::All => true,
        }
    }
}

/// Report row categories, in the order they appear within a device's rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    GeneralUser,
    RestrictedUser,
    FootfallLeft,
    FootfallRight,
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GeneralUser => write!(f, "General User"),
            Self::RestrictedUser => write!(f, "Restricted User"),
            Self::FootfallLeft => write!(f, "Footfall Left"),
            Self::FootfallRight => write!(f, "Footfall Right"),
        }
    }
}

/// One flattened report row. Restricted rows carry (subject, first, last,
/// count); sighting and footfall rows carry a single timestamp in
/// `first_seen` with the subject blank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub date: NaiveDate,
    pub country: String,
    pub device_id: String,
    pub device_name: String,
    pub category: Category,
    pub subject: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub count: u64,
}

/// A built report plus the pipeline summary callers use to spot holes
#[derive(Debug, Default)]
pub struct Report {
    pub rows: Vec<ReportRow>,
    pub shards_read: usize,
    pub shards_skipped: usize,
}

/// Build a report from the store's shard files matching `scope`
pub async fn build_report(store: &ShardStore, scope: &ReportScope) -> Result<Report> {
    let files: Vec<PathBuf> = store
        .shard_files()?
        .into_iter()
        .filter(|(date, _)| scope.includes(*date))
        .map(|(_, path)| path)
        .collect();
    build_report_from_files(&files).await
}

/// Build a report from an explicit shard-file list, in the given order.
///
/// When two files cover the same (date, device), the later-loaded file's
/// entry replaces the earlier one wholesale. Callers wanting union
/// semantics must pre-merge their shards. A file that fails to parse is
/// skipped and counted, never fatal.
pub async fn build_report_from_files(files: &[PathBuf]) -> Result<Report> {
    let mut date_order: Vec<NaiveDate> = Vec::new();
    let mut merged: HashMap<NaiveDate, BTreeMap<String, DeviceActivity>> = HashMap::new();
    let mut report = Report::default();

    for path in files {
        let shard = match ShardStore::read_shard_file(path).await {
            Ok(Some(shard)) => shard,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping unreadable shard {:?}: {}", path, e);
                report.shards_skipped += 1;
                continue;
            }
        };
        report.shards_read += 1;

        let devices = merged.entry(shard.date).or_insert_with(|| {
            date_order.push(shard.date);
            BTreeMap::new()
        });
        for (device_id, activity) in shard.devices {
            // Last-loaded-wins per device-day
            devices.insert(device_id, activity);
        }
    }

    for date in date_order {
        for (device_id, activity) in &merged[&date] {
            flatten_device(&mut report.rows, date, device_id, activity);
        }
    }

    Ok(report)
}

fn flatten_device(
    rows: &mut Vec<ReportRow>,
    date: NaiveDate,
    device_id: &str,
    activity: &DeviceActivity,
) {
    let base = |category: Category| ReportRow {
        date,
        country: activity.country.clone(),
        device_id: device_id.to_string(),
        device_name: activity.device_name.clone(),
        category,
        subject: String::new(),
        first_seen: None,
        last_seen: None,
        count: 1,
    };

    for ts in &activity.general_sightings {
        rows.push(ReportRow {
            first_seen: Some(*ts),
            ..base(Category::GeneralUser)
        });
    }
    for sighting in &activity.restricted_sightings {
        rows.push(ReportRow {
            subject: sighting.subject.clone(),
            first_seen: Some(sighting.first_seen),
            last_seen: Some(sighting.last_seen),
            count: sighting.count,
            ..base(Category::RestrictedUser)
        });
    }
    for ts in &activity.footfall_left {
        rows.push(ReportRow {
            first_seen: Some(*ts),
            ..base(Category::FootfallLeft)
        });
    }
    for ts in &activity.footfall_right {
        rows.push(ReportRow {
            first_seen: Some(*ts),
            ..base(Category::FootfallRight)
        });
    }
}

pub const CSV_HEADER: &str =
    "Date,Country,Device Id,Device Name,Category,Subject/Detail,First Seen,Last Seen,Count";

/// Render rows as CSV with the fixed export header
pub fn to_csv(rows: &[ReportRow]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for row in rows {
        let fields = [
            row.date.format("%Y-%m-%d").to_string(),
            row.country.clone(),
            row.device_id.clone(),
            row.device_name.clone(),
            row.category.to_string(),
            row.subject.clone(),
            row.first_seen.map(|t| t.to_rfc3339()).unwrap_or_default(),
            row.last_seen.map(|t| t.to_rfc3339()).unwrap_or_default(),
            row.count.to_string(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }

    out
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
