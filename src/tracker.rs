use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::TrackerSettings;
use crate::detection::DetectionStrategy;
use crate::emitter::{Emitter, Subscription};
use crate::model::{
    DetectedEvent, DetectionSource, RateLimitStatus, UsageEvent, UsageSummary, UsageType,
};
use crate::store::UsageStore;
use crate::timer::Interval;

const DEDUP_WINDOW_MS: i64 = 500;
const ONE_MINUTE_MS: i64 = 60_000;
const ONE_HOUR_MS: i64 = 3_600_000;
const UNKNOWN_MODEL: &str = "unknown";

pub type SharedStore = Rc<RefCell<dyn UsageStore>>;

/// State reachable from strategy callbacks. Strategies themselves live in
/// [`UsageTracker`] so that a callback never needs to borrow them.
struct TrackerCore {
    store: SharedStore,
    events: RefCell<Vec<UsageEvent>>,
    on_usage_updated: Emitter<UsageSummary>,
}

/// Fuses detections from every registered strategy into one deduplicated,
/// append-only usage log and publishes rolling summaries.
pub struct UsageTracker {
    core: Rc<TrackerCore>,
    session_start: DateTime<Utc>,
    strategies: Vec<Box<dyn DetectionStrategy>>,
    strategy_listeners: Vec<Subscription>,
    refresh_timer: Option<Interval>,
}

impl UsageTracker {
    pub fn new(store: SharedStore, refresh_interval: Duration) -> Self {
        Self {
            core: Rc::new(TrackerCore {
                store,
                events: RefCell::new(Vec::new()),
                on_usage_updated: Emitter::new(),
            }),
            session_start: Utc::now(),
            strategies: Vec::new(),
            strategy_listeners: Vec::new(),
            refresh_timer: Some(Interval::starting_at(refresh_interval, Instant::now())),
        }
    }

    /// Fired on every accepted detection and on each refresh tick.
    pub fn on_usage_updated(&self) -> &Emitter<UsageSummary> {
        &self.core.on_usage_updated
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.session_start
    }

    pub fn register_strategy(&mut self, mut strategy: Box<dyn DetectionStrategy>) {
        let core = Rc::downgrade(&self.core);
        let listener = strategy.on_detected().subscribe(move |event| {
            if let Some(core) = core.upgrade() {
                core.handle_detected(event);
            }
        });
        self.strategy_listeners.push(listener);
        debug!(source = %strategy.source(), "registered detection strategy");
        strategy.start();
        self.strategies.push(strategy);
    }

    pub fn strategy_sources(&self) -> Vec<DetectionSource> {
        self.strategies.iter().map(|s| s.source()).collect()
    }

    pub fn watched_path(&self) -> Option<PathBuf> {
        self.strategies
            .iter()
            .find_map(|s| s.watched_path())
            .map(Path::to_path_buf)
    }

    /// Advances strategy timers, then re-broadcasts the summary when the
    /// refresh interval has elapsed so aging windows stay current.
    pub fn tick(&mut self, now: Instant) {
        for strategy in &mut self.strategies {
            strategy.poll(now);
        }
        if self
            .refresh_timer
            .as_mut()
            .is_some_and(|timer| timer.is_due(now))
        {
            self.core.broadcast(Utc::now());
        }
    }

    pub fn compute_summary(&self) -> UsageSummary {
        self.compute_summary_at(Utc::now())
    }

    pub fn compute_summary_at(&self, now: DateTime<Utc>) -> UsageSummary {
        self.core.compute_summary(now)
    }

    /// The last `count` events, oldest first.
    pub fn get_recent_events(&self, count: usize) -> Vec<UsageEvent> {
        let events = self.core.events.borrow();
        let start = events.len().saturating_sub(count);
        events[start..].to_vec()
    }

    /// Stops the refresh timer, detaches and disposes every strategy, and
    /// closes the summary stream. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.refresh_timer = None;
        for mut listener in self.strategy_listeners.drain(..) {
            listener.dispose();
        }
        for mut strategy in self.strategies.drain(..) {
            strategy.dispose();
        }
        self.core.on_usage_updated.close();
    }
}

impl Drop for UsageTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl TrackerCore {
    fn handle_detected(&self, detected: &DetectedEvent) {
        if self.is_duplicate(detected) {
            debug!(source = %detected.source, "dropping duplicate detection");
            return;
        }

        let event = canonicalize(detected);
        debug!(
            source = %event.source,
            model = %event.model,
            rate_limited = event.rate_limit_snapshot.is_some(),
            "usage event recorded"
        );
        self.events.borrow_mut().push(event.clone());
        self.store.borrow_mut().append_event(&event);
        self.broadcast(Utc::now());
    }

    // The log is ordered by arrival, which tracks detection time, so the
    // backward scan can stop at the first entry outside the window.
    fn is_duplicate(&self, detected: &DetectedEvent) -> bool {
        let window = ChronoDuration::milliseconds(DEDUP_WINDOW_MS);
        for existing in self.events.borrow().iter().rev() {
            let diff = (detected.timestamp - existing.timestamp).abs();
            if diff > window {
                break;
            }
            if existing.source == detected.source {
                return true;
            }
        }
        false
    }

    fn compute_summary(&self, now: DateTime<Utc>) -> UsageSummary {
        let settings = self.store.borrow().load_settings();
        summarize(&self.events.borrow(), now, &settings)
    }

    fn broadcast(&self, now: DateTime<Utc>) {
        let summary = self.compute_summary(now);
        self.on_usage_updated.fire(&summary);
    }
}

fn canonicalize(detected: &DetectedEvent) -> UsageEvent {
    UsageEvent {
        id: Uuid::new_v4().to_string(),
        timestamp: detected.timestamp,
        model: detected
            .model_hint
            .clone()
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string()),
        usage_type: UsageType::Unknown,
        source: detected.source,
        token_estimate: detected.token_estimate,
        rate_limit_snapshot: detected
            .rate_limit_info
            .as_ref()
            .and_then(|info| info.complete()),
    }
}

/// Rolling-window counts and rate-limit classification over `events` at `now`.
/// Every event in the slice counts toward the session total.
pub fn summarize(
    events: &[UsageEvent],
    now: DateTime<Utc>,
    settings: &TrackerSettings,
) -> UsageSummary {
    let minute_ago = now - ChronoDuration::milliseconds(ONE_MINUTE_MS);
    let hour_ago = now - ChronoDuration::milliseconds(ONE_HOUR_MS);
    let day_start = local_midnight(now);

    let count_since = |start: DateTime<Utc>| events.iter().filter(|e| e.timestamp >= start).count();
    let current_day_count = count_since(day_start);

    let rate_limit_percent_used = if settings.estimated_daily_limit > 0 {
        current_day_count as f64 / settings.estimated_daily_limit as f64 * 100.0
    } else {
        0.0
    };

    UsageSummary {
        current_minute_count: count_since(minute_ago),
        current_hour_count: count_since(hour_ago),
        current_day_count,
        session_count: events.len(),
        rate_limit_status: classify(rate_limit_percent_used, settings),
        rate_limit_percent_used,
        last_event_timestamp: events.last().map(|e| e.timestamp),
    }
}

fn classify(percent_used: f64, settings: &TrackerSettings) -> RateLimitStatus {
    if percent_used >= settings.critical_threshold_percent {
        RateLimitStatus::Critical
    } else if percent_used >= settings.warning_threshold_percent {
        RateLimitStatus::Warning
    } else {
        RateLimitStatus::Ok
    }
}

fn local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        .with_timezone(&Local)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}
