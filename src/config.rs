use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::DetectionSource;

const CONFIG_SCHEMA_VERSION: u32 = 1;
const DEFAULT_POLL_MS: u64 = 2_000;
const MIN_POLL_MS: u64 = 250;
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const HOME_ENV: &str = "ANTIGRAVITY_USAGE_HOME";
const LOG_DIR_ENV: &str = "ANTIGRAVITY_LOG_DIR";
const POLL_MS_ENV: &str = "ANTIGRAVITY_USAGE_POLL_MS";
const DAILY_LIMIT_ENV: &str = "ANTIGRAVITY_USAGE_DAILY_LIMIT";
const MINUTE_LIMIT_ENV: &str = "ANTIGRAVITY_USAGE_MINUTE_LIMIT";
const WARNING_PERCENT_ENV: &str = "ANTIGRAVITY_USAGE_WARNING_PERCENT";
const CRITICAL_PERCENT_ENV: &str = "ANTIGRAVITY_USAGE_CRITICAL_PERCENT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerSettings {
    pub schema_version: u32,
    pub warning_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    pub estimated_daily_limit: u64,
    pub estimated_per_minute_limit: u64,
    pub tracking_enabled: bool,
    pub detection_strategies: Vec<DetectionSource>,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            warning_threshold_percent: 70.0,
            critical_threshold_percent: 90.0,
            estimated_daily_limit: 1_500,
            estimated_per_minute_limit: 30,
            tracking_enabled: true,
            detection_strategies: vec![
                DetectionSource::LogFile,
                DetectionSource::CompletionEvent,
                DetectionSource::Manual,
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub log_poll_interval: Duration,
    pub refresh_interval: Duration,
}

impl TrackerSettings {
    /// Loads the config file (creating it with defaults on first run) and
    /// applies environment overrides on top. Overrides are never saved.
    pub fn load_or_init() -> Result<Self> {
        let loaded = Self::load_or_init_at(&config_path())?;
        Ok(loaded.with_overrides(|name| env::var(name).ok()))
    }

    pub fn load_or_init_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut parsed: TrackerSettings = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(path)?;
            }
            Ok(parsed)
        } else {
            let settings = TrackerSettings::default();
            settings.save_to(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn strategy_enabled(&self, source: DetectionSource) -> bool {
        self.detection_strategies.contains(&source)
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |name: &str| {
            lookup(name)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
        };
        if let Some(limit) = number(DAILY_LIMIT_ENV) {
            self.estimated_daily_limit = limit as u64;
        }
        if let Some(limit) = number(MINUTE_LIMIT_ENV) {
            self.estimated_per_minute_limit = limit as u64;
        }
        if let Some(percent) = number(WARNING_PERCENT_ENV) {
            self.warning_threshold_percent = percent.min(100.0);
        }
        if let Some(percent) = number(CRITICAL_PERCENT_ENV) {
            self.critical_threshold_percent = percent.min(100.0);
        }
        self
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        for percent in [
            &mut self.warning_threshold_percent,
            &mut self.critical_threshold_percent,
        ] {
            let normalized = clamp_percent(*percent);
            if normalized != *percent {
                *percent = normalized;
                changed = true;
            }
        }

        let mut unique: Vec<DetectionSource> = Vec::with_capacity(self.detection_strategies.len());
        for source in &self.detection_strategies {
            if !unique.contains(source) {
                unique.push(*source);
            }
        }
        if unique != self.detection_strategies {
            self.detection_strategies = unique;
            changed = true;
        }

        changed
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    RuntimeSettings {
        log_poll_interval: Duration::from_millis(
            env_u64(POLL_MS_ENV, DEFAULT_POLL_MS).max(MIN_POLL_MS),
        ),
        refresh_interval: REFRESH_INTERVAL,
    }
}

pub fn data_home() -> PathBuf {
    if let Ok(custom) = env::var(HOME_ENV) {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".antigravity-usage")
}

pub fn config_path() -> PathBuf {
    data_home().join("config.json")
}

pub fn usage_data_path() -> PathBuf {
    data_home().join("usage-data.json")
}

pub fn log_root_override() -> Option<PathBuf> {
    env::var(LOG_DIR_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn clamp_percent(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let settings = TrackerSettings::default();
        assert_eq!(settings.warning_threshold_percent, 70.0);
        assert_eq!(settings.critical_threshold_percent, 90.0);
        assert_eq!(settings.estimated_daily_limit, 1_500);
        assert_eq!(settings.estimated_per_minute_limit, 30);
        assert!(settings.tracking_enabled);
        assert!(settings.strategy_enabled(DetectionSource::LogFile));
        assert!(!settings.strategy_enabled(DetectionSource::InlineChat));
    }

    #[test]
    fn first_load_writes_defaults() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("nested").join("config.json");

        let settings = TrackerSettings::load_or_init_at(&path).expect("load");

        assert_eq!(settings, TrackerSettings::default());
        assert!(path.exists());
    }

    #[test]
    fn partial_file_is_filled_with_defaults() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"schema_version":1,"estimated_daily_limit":500}"#).expect("write");

        let settings = TrackerSettings::load_or_init_at(&path).expect("load");

        assert_eq!(settings.estimated_daily_limit, 500);
        assert_eq!(settings.warning_threshold_percent, 70.0);
    }

    #[test]
    fn migration_clamps_thresholds_and_dedups_strategies() {
        let mut settings = TrackerSettings {
            schema_version: 0,
            warning_threshold_percent: -5.0,
            critical_threshold_percent: 140.0,
            detection_strategies: vec![
                DetectionSource::Manual,
                DetectionSource::LogFile,
                DetectionSource::Manual,
            ],
            ..TrackerSettings::default()
        };

        assert!(settings.normalize_and_migrate());
        assert_eq!(settings.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(settings.warning_threshold_percent, 0.0);
        assert_eq!(settings.critical_threshold_percent, 100.0);
        assert_eq!(
            settings.detection_strategies,
            vec![DetectionSource::Manual, DetectionSource::LogFile]
        );
        assert!(!settings.normalize_and_migrate());
    }

    #[test]
    fn overrides_replace_limits_and_ignore_garbage() {
        let settings = TrackerSettings::default().with_overrides(|name| match name {
            DAILY_LIMIT_ENV => Some(" 250 ".to_string()),
            WARNING_PERCENT_ENV => Some("abc".to_string()),
            CRITICAL_PERCENT_ENV => Some("150".to_string()),
            _ => None,
        });

        assert_eq!(settings.estimated_daily_limit, 250);
        assert_eq!(settings.warning_threshold_percent, 70.0);
        assert_eq!(settings.critical_threshold_percent, 100.0);
        assert_eq!(settings.estimated_per_minute_limit, 30);
    }
}
