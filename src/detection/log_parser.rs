//! Line-level interpretation of the Antigravity extension host log.
//!
//! Lines of interest look like:
//!
//! ```text
//! 2026-02-15 19:07:54.257 [info] ... URL: https://daily-cloudcode-pa.googleapis.com/v1internal:streamGenerateContent ...
//! ... rateLimits={"gemini-antigravity:antigravity-gemini-3-pro":"734s"}
//! ... RESOURCE_EXHAUSTED / status: 429
//! ```
//!
//! The format belongs to the host process; the literals below must match it exactly.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::model::{DetectedEvent, DetectionSource, PartialRateLimit};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

static API_CALL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{3}).*URL:\s*https://.*:streamGenerateContent",
    )
    .expect("api call pattern")
});

static LEADING_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{3})").expect("timestamp pattern")
});

// The captured token must name a model family, not just any identifier after `model:`.
static MODEL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:model[=:]\s*["']?)([a-zA-Z0-9._-]+(?:gemini|pro|flash|ultra)[a-zA-Z0-9._-]*)"#,
    )
    .expect("model pattern")
});

static RATE_LIMIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"rateLimits=\{([^}]+)\}").expect("rate limit pattern"));

static EXHAUSTED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"RESOURCE_EXHAUSTED|status[=:]\s*429").expect("exhausted pattern"));

/// Turns one log line into a detection, or `None` when the line carries no
/// usage signal. `now` is the fallback timestamp and the base for reset times.
pub fn parse_log_line(line: &str, now: DateTime<Utc>) -> Option<DetectedEvent> {
    let exhausted = EXHAUSTED_PATTERN.is_match(line);
    if !exhausted && !API_CALL_PATTERN.is_match(line) {
        return None;
    }

    let timestamp = leading_timestamp(line).unwrap_or(now);
    let mut event = DetectedEvent::new(timestamp, DetectionSource::LogFile);
    event.model_hint = model_hint(line);

    let mut rate_limit = PartialRateLimit {
        reset_at: rate_limit_reset(line, now),
        ..PartialRateLimit::default()
    };
    if exhausted {
        rate_limit.remaining = Some(0);
        rate_limit.percent_used = Some(100.0);
    }
    if !rate_limit.is_empty() {
        event.rate_limit_info = Some(rate_limit);
    }

    Some(event)
}

fn leading_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let raw = LEADING_TIMESTAMP.captures(line)?.get(1)?.as_str();
    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn model_hint(line: &str) -> Option<String> {
    MODEL_PATTERN
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn rate_limit_reset(line: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let body = RATE_LIMIT_PATTERN.captures(line)?.get(1)?.as_str();
    let parsed: Map<String, Value> = serde_json::from_str(&format!("{{{body}}}")).ok()?;
    let seconds = parsed
        .values()
        .filter_map(|value| value.as_str().and_then(parse_seconds))
        .min()?;
    // Out-of-range values are treated like any other unusable fragment.
    now.checked_add_signed(Duration::try_seconds(seconds)?)
}

fn parse_seconds(raw: &str) -> Option<i64> {
    raw.trim()
        .strip_suffix('s')?
        .parse::<i64>()
        .ok()
        .filter(|secs| *secs >= 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const API_LINE: &str = "2026-02-15 19:07:54.257 [info] [Gemini] request model: gemini-2.5-pro URL: https://daily-cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse";

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn local_instant(raw: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).expect("naive");
        Local
            .from_local_datetime(&naive)
            .earliest()
            .expect("local")
            .with_timezone(&Utc)
    }

    #[test]
    fn api_call_line_uses_embedded_timestamp() {
        let line = "2026-02-15 19:07:54.257 [info] ... URL: https://daily-cloudcode-pa.googleapis.com/v1internal:streamGenerateContent ...";
        let event = parse_log_line(line, now()).expect("event");

        assert_eq!(event.source, DetectionSource::LogFile);
        assert_eq!(event.timestamp, local_instant("2026-02-15 19:07:54.257"));
        assert!(event.rate_limit_info.is_none());
    }

    #[test]
    fn unrelated_lines_are_discarded() {
        assert!(parse_log_line("2026-02-15 19:07:54.257 [info] extension activated", now()).is_none());
        assert!(parse_log_line("", now()).is_none());
        assert!(parse_log_line("URL: https://example.com/v1:generateContent", now()).is_none());
    }

    #[test]
    fn extracts_model_family_hint() {
        let event = parse_log_line(API_LINE, now()).expect("event");
        assert_eq!(event.model_hint.as_deref(), Some("gemini-2.5-pro"));
    }

    #[test]
    fn ignores_model_tokens_without_known_family() {
        let line = "2026-02-15 19:07:54.257 [info] model: claude-sonnet URL: https://x.googleapis.com/v1internal:streamGenerateContent";
        let event = parse_log_line(line, now()).expect("event");
        assert!(event.model_hint.is_none());
    }

    #[test]
    fn rate_limit_fragment_sets_reset_time() {
        let line = r#"2026-02-15 19:07:54.257 [info] URL: https://x.googleapis.com/v1internal:streamGenerateContent rateLimits={"gemini-antigravity:antigravity-gemini-3-pro":"734s"}"#;
        let before = Utc::now();
        let event = parse_log_line(line, Utc::now()).expect("event");
        let info = event.rate_limit_info.expect("rate limit info");
        let reset_at = info.reset_at.expect("reset");

        let expected = before + Duration::milliseconds(734_000);
        assert!((reset_at - expected).num_milliseconds().abs() < 1_000);
        assert!(info.remaining.is_none());
        assert!(info.complete().is_none());
    }

    #[test]
    fn malformed_rate_limit_fragment_is_dropped() {
        let line = r#"2026-02-15 19:07:54.257 [info] URL: https://x.googleapis.com/v1internal:streamGenerateContent rateLimits={not json}"#;
        let event = parse_log_line(line, now()).expect("event");
        assert!(event.rate_limit_info.is_none());

        let line = r#"2026-02-15 19:07:54.257 [info] URL: https://x.googleapis.com/v1internal:streamGenerateContent rateLimits={"m":"soon"}"#;
        let event = parse_log_line(line, now()).expect("event");
        assert!(event.rate_limit_info.is_none());
    }

    #[test]
    fn exhaustion_forces_zero_remaining_and_full_usage() {
        let line = r#"2026-02-15 19:08:01.002 [error] RESOURCE_EXHAUSTED rateLimits={"gemini-antigravity:antigravity-gemini-3-pro":"60s"}"#;
        let now = now();
        let event = parse_log_line(line, now).expect("event");
        let info = event.rate_limit_info.expect("info");

        assert_eq!(info.remaining, Some(0));
        assert_eq!(info.percent_used, Some(100.0));
        assert_eq!(info.reset_at, Some(now + Duration::seconds(60)));
        assert!(info.limit.is_none());
    }

    #[test]
    fn out_of_range_reset_is_dropped() {
        let line = r#"2026-02-15 19:07:54.257 [info] URL: https://x.googleapis.com/v1internal:streamGenerateContent rateLimits={"m":"100000000000000s"}"#;
        let event = parse_log_line(line, now()).expect("event");
        assert!(event.rate_limit_info.is_none());

        let line = r#"2026-02-15 19:08:01.002 [error] RESOURCE_EXHAUSTED rateLimits={"m":"9300000000000000s"}"#;
        let event = parse_log_line(line, now()).expect("event");
        let info = event.rate_limit_info.expect("info");
        assert_eq!(info.remaining, Some(0));
        assert!(info.reset_at.is_none());
    }

    #[test]
    fn status_429_without_timestamp_falls_back_to_now() {
        let now = now();
        let event = parse_log_line("request failed status: 429 Too Many Requests", now).expect("event");
        assert_eq!(event.timestamp, now);
        assert_eq!(event.rate_limit_info.and_then(|i| i.remaining), Some(0));
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_now() {
        let now = now();
        let line = "2026-13-45 99:99:99.999 RESOURCE_EXHAUSTED";
        let event = parse_log_line(line, now).expect("event");
        assert_eq!(event.timestamp, now);
    }
}
