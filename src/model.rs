use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionSource {
    OutputChannel,
    LogFile,
    CompletionEvent,
    InlineChat,
    Manual,
}

impl DetectionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutputChannel => "output-channel",
            Self::LogFile => "log-file",
            Self::CompletionEvent => "completion-event",
            Self::InlineChat => "inline-chat",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UsageType {
    Completion,
    Chat,
    InlineEdit,
    #[default]
    Unknown,
}

impl UsageType {
    pub const ALL: [UsageType; 4] = [
        UsageType::Completion,
        UsageType::Chat,
        UsageType::InlineEdit,
        UsageType::Unknown,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStatus {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl RateLimitStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Rate-limit fields observed on a single signal. Any subset may be known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRateLimit {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub percent_used: Option<f64>,
}

impl PartialRateLimit {
    /// Promotes the hint to a snapshot only when every field was observed.
    pub fn complete(&self) -> Option<RateLimitSnapshot> {
        Some(RateLimitSnapshot {
            remaining: self.remaining?,
            limit: self.limit?,
            reset_at: self.reset_at?,
            percent_used: self.percent_used?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_none()
            && self.limit.is_none()
            && self.reset_at.is_none()
            && self.percent_used.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    pub percent_used: f64,
}

/// A raw signal from one detection strategy. Consumed by the tracker, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedEvent {
    pub timestamp: DateTime<Utc>,
    pub source: DetectionSource,
    pub model_hint: Option<String>,
    pub token_estimate: Option<u64>,
    pub rate_limit_info: Option<PartialRateLimit>,
}

impl DetectedEvent {
    pub fn new(timestamp: DateTime<Utc>, source: DetectionSource) -> Self {
        Self {
            timestamp,
            source,
            model_hint: None,
            token_estimate: None,
            rate_limit_info: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    #[serde(rename = "type")]
    pub usage_type: UsageType,
    pub source: DetectionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_snapshot: Option<RateLimitSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub current_minute_count: usize,
    pub current_hour_count: usize,
    pub current_day_count: usize,
    pub session_count: usize,
    pub rate_limit_status: RateLimitStatus,
    pub rate_limit_percent_used: f64,
    pub last_event_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    /// UTC calendar date, `YYYY-MM-DD`.
    pub date: String,
    pub total_requests: usize,
    pub by_model: BTreeMap<String, usize>,
    pub by_type: BTreeMap<UsageType, usize>,
    pub peak_requests_per_minute: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reset() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 15, 19, 20, 0).unwrap()
    }

    #[test]
    fn complete_partial_promotes_to_snapshot() {
        let partial = PartialRateLimit {
            remaining: Some(10),
            limit: Some(100),
            reset_at: Some(reset()),
            percent_used: Some(90.0),
        };
        let snapshot = partial.complete().expect("snapshot");
        assert_eq!(snapshot.remaining, 10);
        assert_eq!(snapshot.limit, 100);
        assert_eq!(snapshot.reset_at, reset());
    }

    #[test]
    fn partial_missing_any_field_is_not_promoted() {
        let full = PartialRateLimit {
            remaining: Some(0),
            limit: Some(50),
            reset_at: Some(reset()),
            percent_used: Some(100.0),
        };
        let variants = [
            PartialRateLimit { remaining: None, ..full.clone() },
            PartialRateLimit { limit: None, ..full.clone() },
            PartialRateLimit { reset_at: None, ..full.clone() },
            PartialRateLimit { percent_used: None, ..full.clone() },
        ];
        for partial in variants {
            assert!(partial.complete().is_none(), "{partial:?}");
        }
    }

    #[test]
    fn usage_event_serializes_with_wire_names() {
        let event = UsageEvent {
            id: "abc".to_string(),
            timestamp: reset(),
            model: "unknown".to_string(),
            usage_type: UsageType::InlineEdit,
            source: DetectionSource::CompletionEvent,
            token_estimate: Some(12),
            rate_limit_snapshot: None,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "inline-edit");
        assert_eq!(json["source"], "completion-event");
        assert_eq!(json["tokenEstimate"], 12);
        assert!(json.get("rateLimitSnapshot").is_none());
    }
}
