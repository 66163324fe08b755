use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::TrackerSettings;
use crate::model::{DailySummary, RateLimitSnapshot, UsageEvent, UsageType};

const SCHEMA_VERSION: u32 = 1;
const FLUSH_DEBOUNCE: Duration = Duration::from_secs(5);
const MAX_EVENT_AGE_DAYS: i64 = 7;
const SUMMARY_RETENTION_DAYS: i64 = 90;

/// What the tracker needs from durable storage.
pub trait UsageStore {
    /// Records an accepted event. Durability may be deferred.
    fn append_event(&mut self, event: &UsageEvent);

    /// Current settings, with any overrides already merged in.
    fn load_settings(&self) -> TrackerSettings;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid usage data in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to serialize usage data: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedUsageData {
    #[serde(default = "unversioned")]
    pub version: u32,
    pub events: Vec<UsageEvent>,
    pub daily_summaries: Vec<DailySummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_rate_limit: Option<RateLimitSnapshot>,
}

impl Default for PersistedUsageData {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            events: Vec::new(),
            daily_summaries: Vec::new(),
            last_known_rate_limit: None,
        }
    }
}

fn unversioned() -> u32 {
    0
}

impl PersistedUsageData {
    fn migrate(&mut self) -> bool {
        if self.version >= SCHEMA_VERSION {
            return false;
        }
        // Version 0 files predate the version field; the layout is otherwise unchanged.
        self.version = SCHEMA_VERSION;
        true
    }
}

/// Usage history kept in a single JSON document, written with a debounce.
#[derive(Debug)]
pub struct JsonUsageStore {
    path: PathBuf,
    settings: TrackerSettings,
    data: PersistedUsageData,
    flush_due_at: Option<Instant>,
}

impl JsonUsageStore {
    pub fn open(path: PathBuf, settings: TrackerSettings) -> Result<Self, StoreError> {
        let mut pending = false;
        let data = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|source| StoreError::Read {
                path: path.clone(),
                source,
            })?;
            let mut data: PersistedUsageData =
                serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?;
            pending = data.migrate();
            data
        } else {
            PersistedUsageData::default()
        };

        Ok(Self {
            path,
            settings,
            data,
            flush_due_at: pending.then(|| Instant::now() + FLUSH_DEBOUNCE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &PersistedUsageData {
        &self.data
    }

    pub fn set_settings(&mut self, settings: TrackerSettings) {
        self.settings = settings;
    }

    pub fn has_pending_write(&self) -> bool {
        self.flush_due_at.is_some()
    }

    /// Writes pending data once the debounce window has passed.
    pub fn tick(&mut self, now: Instant) {
        if self.flush_due_at.is_some_and(|due| now >= due)
            && let Err(err) = self.flush()
        {
            warn!(error = %err, "failed to persist usage data");
        }
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.flush_due_at.is_none() {
            return Ok(());
        }
        self.write_now()?;
        self.flush_due_at = None;
        Ok(())
    }

    /// Rolls raw events older than a week into per-day summaries and drops
    /// summaries past the retention window.
    pub fn prune_old_data(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::days(MAX_EVENT_AGE_DAYS);
        let (old_events, recent_events): (Vec<UsageEvent>, Vec<UsageEvent>) = self
            .data
            .events
            .drain(..)
            .partition(|event| event.timestamp < cutoff);

        let by_date = group_by_utc_date(old_events);
        let pruned_days = by_date.len();
        for (date, events) in by_date {
            if self
                .data
                .daily_summaries
                .iter()
                .any(|summary| summary.date == date)
            {
                continue;
            }
            self.data
                .daily_summaries
                .push(summarize_day(date, &events));
        }

        let summary_cutoff = (now - ChronoDuration::days(SUMMARY_RETENTION_DAYS))
            .format("%Y-%m-%d")
            .to_string();
        self.data
            .daily_summaries
            .retain(|summary| summary.date >= summary_cutoff);
        self.data
            .daily_summaries
            .sort_by(|a, b| a.date.cmp(&b.date));

        self.data.events = recent_events;
        debug!(pruned_days, "pruned usage history");
        self.schedule_flush();
    }

    /// One summary per UTC day: archived days plus days still held as raw
    /// events, oldest first.
    pub fn daily_history(&self) -> Vec<DailySummary> {
        let mut days: BTreeMap<String, DailySummary> = self
            .data
            .daily_summaries
            .iter()
            .map(|summary| (summary.date.clone(), summary.clone()))
            .collect();
        for (date, events) in group_by_utc_date(self.data.events.iter().cloned()) {
            days.entry(date.clone())
                .or_insert_with(|| summarize_day(date, &events));
        }
        days.into_values().collect()
    }

    pub fn clear_all_data(&mut self) -> Result<(), StoreError> {
        self.data = PersistedUsageData::default();
        self.write_now()?;
        self.flush_due_at = None;
        Ok(())
    }

    fn schedule_flush(&mut self) {
        self.flush_due_at = Some(Instant::now() + FLUSH_DEBOUNCE);
    }

    fn write_now(&self) -> Result<(), StoreError> {
        let serialized = serde_json::to_string_pretty(&self.data)?;
        let write_error = |source: io::Error| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(write_error)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(write_error)?;
        tmp.write_all(serialized.as_bytes()).map_err(write_error)?;
        tmp.persist(&self.path)
            .map_err(|err| write_error(err.error))?;
        Ok(())
    }
}

impl UsageStore for JsonUsageStore {
    fn append_event(&mut self, event: &UsageEvent) {
        self.data.events.push(event.clone());
        if let Some(snapshot) = &event.rate_limit_snapshot {
            self.data.last_known_rate_limit = Some(snapshot.clone());
        }
        self.schedule_flush();
    }

    fn load_settings(&self) -> TrackerSettings {
        self.settings.clone()
    }
}

impl Drop for JsonUsageStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to flush usage data on shutdown");
        }
    }
}

fn group_by_utc_date(
    events: impl IntoIterator<Item = UsageEvent>,
) -> BTreeMap<String, Vec<UsageEvent>> {
    let mut by_date: BTreeMap<String, Vec<UsageEvent>> = BTreeMap::new();
    for event in events {
        by_date
            .entry(event.timestamp.format("%Y-%m-%d").to_string())
            .or_default()
            .push(event);
    }
    by_date
}

fn summarize_day(date: String, events: &[UsageEvent]) -> DailySummary {
    let mut by_model: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_type: BTreeMap<UsageType, usize> =
        UsageType::ALL.iter().map(|kind| (*kind, 0)).collect();
    let mut minute_buckets: BTreeMap<i64, usize> = BTreeMap::new();

    for event in events {
        *by_model.entry(event.model.clone()).or_default() += 1;
        *by_type.entry(event.usage_type).or_default() += 1;
        *minute_buckets
            .entry(event.timestamp.timestamp_millis().div_euclid(60_000))
            .or_default() += 1;
    }

    DailySummary {
        date,
        total_requests: events.len(),
        by_model,
        by_type,
        peak_requests_per_minute: minute_buckets.values().copied().max().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionSource;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn event(id: &str, timestamp: DateTime<Utc>, model: &str) -> UsageEvent {
        UsageEvent {
            id: id.to_string(),
            timestamp,
            model: model.to_string(),
            usage_type: UsageType::Unknown,
            source: DetectionSource::LogFile,
            token_estimate: None,
            rate_limit_snapshot: None,
        }
    }

    fn open(tmp: &TempDir) -> JsonUsageStore {
        JsonUsageStore::open(tmp.path().join("usage-data.json"), TrackerSettings::default())
            .expect("open store")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap()
    }

    #[test]
    fn missing_file_opens_empty() {
        let tmp = TempDir::new().expect("temp dir");
        let store = open(&tmp);
        assert_eq!(store.data(), &PersistedUsageData::default());
        assert!(!store.has_pending_write());
    }

    #[test]
    fn append_is_debounced_then_flushed() {
        let tmp = TempDir::new().expect("temp dir");
        let mut store = open(&tmp);
        store.append_event(&event("a", now(), "gemini-3-pro"));

        assert!(store.has_pending_write());
        store.tick(Instant::now());
        assert!(!store.path().exists());

        store.tick(Instant::now() + FLUSH_DEBOUNCE + Duration::from_millis(1));
        assert!(!store.has_pending_write());
        let reopened = open(&tmp);
        assert_eq!(reopened.data().events.len(), 1);
        assert_eq!(reopened.data().events[0].id, "a");
    }

    #[test]
    fn drop_flushes_pending_events() {
        let tmp = TempDir::new().expect("temp dir");
        {
            let mut store = open(&tmp);
            store.append_event(&event("a", now(), "m"));
        }
        assert_eq!(open(&tmp).data().events.len(), 1);
    }

    #[test]
    fn snapshot_updates_last_known_rate_limit() {
        let tmp = TempDir::new().expect("temp dir");
        let mut store = open(&tmp);
        let snapshot = RateLimitSnapshot {
            remaining: 0,
            limit: 100,
            reset_at: now(),
            percent_used: 100.0,
        };
        let mut limited = event("a", now(), "m");
        limited.rate_limit_snapshot = Some(snapshot.clone());

        store.append_event(&limited);
        store.append_event(&event("b", now(), "m"));

        assert_eq!(store.data().last_known_rate_limit, Some(snapshot));
    }

    #[test]
    fn prune_rolls_old_events_into_daily_summaries() {
        let tmp = TempDir::new().expect("temp dir");
        let mut store = open(&tmp);
        let old_day = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        store.append_event(&event("a", old_day, "gemini-3-pro"));
        store.append_event(&event("b", old_day + ChronoDuration::seconds(20), "gemini-3-pro"));
        store.append_event(&event("c", old_day + ChronoDuration::minutes(5), "gemini-2.5-flash"));
        store.append_event(&event("d", now() - ChronoDuration::days(1), "gemini-3-pro"));

        store.prune_old_data(now());

        let data = store.data();
        assert_eq!(data.events.len(), 1);
        assert_eq!(data.events[0].id, "d");
        assert_eq!(data.daily_summaries.len(), 1);
        let summary = &data.daily_summaries[0];
        assert_eq!(summary.date, "2026-03-01");
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.by_model.get("gemini-3-pro"), Some(&2));
        assert_eq!(summary.by_type.get(&UsageType::Unknown), Some(&3));
        assert_eq!(summary.by_type.get(&UsageType::Chat), Some(&0));
        assert_eq!(summary.peak_requests_per_minute, 2);
    }

    #[test]
    fn prune_keeps_existing_summary_and_drops_expired_ones() {
        let tmp = TempDir::new().expect("temp dir");
        let mut store = open(&tmp);
        let existing = summarize_day("2026-03-01".to_string(), &[]);
        let expired = summarize_day("2025-11-01".to_string(), &[]);
        store.data.daily_summaries = vec![expired, existing.clone()];
        store.append_event(&event(
            "a",
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
            "m",
        ));

        store.prune_old_data(now());

        assert_eq!(store.data().daily_summaries, vec![existing]);
        assert!(store.data().events.is_empty());
    }

    #[test]
    fn daily_history_merges_archived_and_raw_days() {
        let tmp = TempDir::new().expect("temp dir");
        let mut store = open(&tmp);
        store.data.daily_summaries = vec![summarize_day("2026-03-01".to_string(), &[])];
        store.append_event(&event("a", now(), "m"));
        store.append_event(&event("b", now() - ChronoDuration::days(1), "m"));
        store.append_event(&event("c", now(), "m"));

        let history = store.daily_history();
        let days: Vec<_> = history
            .iter()
            .map(|day| (day.date.as_str(), day.total_requests))
            .collect();
        assert_eq!(
            days,
            vec![("2026-03-01", 0), ("2026-03-19", 1), ("2026-03-20", 2)]
        );
    }

    #[test]
    fn clear_resets_and_writes_immediately() {
        let tmp = TempDir::new().expect("temp dir");
        let mut store = open(&tmp);
        store.append_event(&event("a", now(), "m"));
        store.clear_all_data().expect("clear");

        assert!(!store.has_pending_write());
        assert!(open(&tmp).data().events.is_empty());
    }

    #[test]
    fn unversioned_file_is_migrated() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("usage-data.json");
        fs::write(&path, r#"{"events":[]}"#).expect("write");

        let store = JsonUsageStore::open(path, TrackerSettings::default()).expect("open");
        assert_eq!(store.data().version, SCHEMA_VERSION);
        assert!(store.data().daily_summaries.is_empty());
        assert!(store.has_pending_write());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("usage-data.json");
        fs::write(&path, "{not json").expect("write");

        let err = JsonUsageStore::open(path, TrackerSettings::default()).expect_err("parse error");
        assert!(matches!(err, StoreError::Parse { .. }));
    }
}
