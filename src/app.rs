use std::cell::{Cell, RefCell};
use std::io::{self, IsTerminal};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use tracing::{debug, info};

use crate::config::{self, RuntimeSettings, TrackerSettings};
use crate::detection::log_file::{discover_log_directory, find_latest_log_file};
use crate::detection::{HostPlatform, LogFileDetector, ManualDetector, ManualTrigger, SystemHost};
use crate::model::DetectionSource;
use crate::store::JsonUsageStore;
use crate::tracker::{SharedStore, UsageTracker, summarize};
use crate::ui::{self, RenderData};

const RECENT_EVENTS: usize = 8;
const REDRAW_EVERY: Duration = Duration::from_secs(1);
const HEADLESS_SLEEP: Duration = Duration::from_millis(250);

/// Foreground tracker: live view on a terminal, status lines otherwise.
pub fn run(settings: TrackerSettings, runtime: RuntimeSettings) -> Result<()> {
    let stop = install_stop_signal()?;
    let store = Rc::new(RefCell::new(open_store(&settings)?));
    store.borrow_mut().prune_old_data(Utc::now());

    let (mut tracker, manual) = build_tracker(&store, &settings, &runtime, Box::new(SystemHost));
    let result = if io::stdout().is_terminal() {
        run_foreground_tui(&mut tracker, &store, manual, &settings, &stop)
    } else {
        run_headless_foreground(&mut tracker, &store, &stop);
        Ok(())
    };

    tracker.dispose();
    store
        .borrow_mut()
        .flush()
        .context("failed to save usage data")?;
    result
}

fn open_store(settings: &TrackerSettings) -> Result<JsonUsageStore> {
    let path = config::usage_data_path();
    JsonUsageStore::open(path, settings.clone()).context("failed to open usage data")
}

fn build_tracker(
    store: &Rc<RefCell<JsonUsageStore>>,
    settings: &TrackerSettings,
    runtime: &RuntimeSettings,
    host: Box<dyn HostPlatform>,
) -> (UsageTracker, Option<ManualTrigger>) {
    let shared: SharedStore = store.clone();
    let mut tracker = UsageTracker::new(shared, runtime.refresh_interval);
    let mut manual = None;

    if !settings.tracking_enabled {
        info!("tracking is disabled; no detection strategies registered");
        return (tracker, manual);
    }

    let mut host = Some(host);
    for source in &settings.detection_strategies {
        match source {
            DetectionSource::LogFile => {
                let Some(host) = host.take() else {
                    debug!("log file detection already registered");
                    continue;
                };
                tracker.register_strategy(Box::new(LogFileDetector::new(
                    host,
                    runtime.log_poll_interval,
                )));
            }
            DetectionSource::Manual => {
                let detector = ManualDetector::new();
                manual = Some(detector.trigger());
                tracker.register_strategy(Box::new(detector));
            }
            DetectionSource::CompletionEvent => {
                info!("completion-event detection needs an editor edit feed; skipped in terminal mode");
            }
            DetectionSource::OutputChannel | DetectionSource::InlineChat => {
                debug!(source = %source, "no detector available for source");
            }
        }
    }

    (tracker, manual)
}

fn run_foreground_tui(
    tracker: &mut UsageTracker,
    store: &Rc<RefCell<JsonUsageStore>>,
    manual: Option<ManualTrigger>,
    settings: &TrackerSettings,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    let dirty = Rc::new(Cell::new(true));
    let flag = Rc::clone(&dirty);
    let _updates = tracker.on_usage_updated().subscribe(move |_| flag.set(true));

    let started = Instant::now();
    let mut last_render_signature = String::new();
    let mut last_render_at = Instant::now() - REDRAW_EVERY;
    let mut force_redraw = true;

    ui::enter_terminal()?;

    let mut run = || -> Result<()> {
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let now = Instant::now();
            tracker.tick(now);
            store.borrow_mut().tick(now);

            if dirty.replace(false) || force_redraw || last_render_at.elapsed() >= REDRAW_EVERY {
                let summary = tracker.compute_summary();
                let recent = tracker.get_recent_events(RECENT_EVENTS);
                let strategies = tracker.strategy_sources();
                let watched = tracker.watched_path();
                let store_ref = store.borrow();
                let render = RenderData {
                    running_for: started.elapsed(),
                    tracking_enabled: settings.tracking_enabled,
                    watched_log: watched.as_deref(),
                    strategies: &strategies,
                    settings,
                    summary: &summary,
                    last_rate_limit: store_ref.data().last_known_rate_limit.as_ref(),
                    recent: &recent,
                };
                let signature = ui::frame_signature(&render);
                if force_redraw
                    || signature != last_render_signature
                    || last_render_at.elapsed() >= REDRAW_EVERY
                {
                    ui::draw(&render)?;
                    last_render_signature = signature;
                    last_render_at = Instant::now();
                    force_redraw = false;
                }
            }

            if event::poll(Duration::from_millis(100))? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
                        KeyCode::Char('q') => break,
                        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                            break;
                        }
                        KeyCode::Char('m') => {
                            if let Some(trigger) = &manual {
                                trigger.log_event();
                            }
                        }
                        _ => {}
                    },
                    Event::Resize(_, _) => {
                        force_redraw = true;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    };

    let run_result = run();
    let _ = ui::leave_terminal();
    run_result
}

fn run_headless_foreground(
    tracker: &mut UsageTracker,
    store: &Rc<RefCell<JsonUsageStore>>,
    stop: &Arc<AtomicBool>,
) {
    println!("No interactive terminal detected; running in headless foreground mode.");
    println!("Press Ctrl+C to stop.");

    let last_line = Rc::new(RefCell::new(String::new()));
    let _printer = tracker.on_usage_updated().subscribe(move |summary| {
        let line = format!(
            "{} | {:.1}% of daily estimate ({})",
            ui::status_line(summary),
            summary.rate_limit_percent_used,
            summary.rate_limit_status.label()
        );
        let mut last = last_line.borrow_mut();
        if *last != line {
            println!("{line}");
            *last = line;
        }
    });

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        tracker.tick(now);
        store.borrow_mut().tick(now);
        thread::sleep(HEADLESS_SLEEP);
    }
}

pub fn print_status(settings: &TrackerSettings) -> Result<()> {
    let store = open_store(settings)?;
    let data = store.data();
    let summary = summarize(&data.events, Utc::now(), settings);

    println!("antigravity-usage status");
    println!("tracking: {}", enabled_label(settings.tracking_enabled));
    println!("data: {}", store.path().display());
    println!("{}", ui::status_line(&summary));
    for line in ui::summary_lines(&summary, settings) {
        println!("  {line}");
    }
    if let Some(snapshot) = &data.last_known_rate_limit {
        println!(
            "  last reported limit: {} remaining of {} (reset {})",
            snapshot.remaining,
            snapshot.limit,
            crate::util::format_time_until(Some(snapshot.reset_at))
        );
    }
    Ok(())
}

pub fn doctor(settings: &TrackerSettings) -> Result<u8> {
    let mut issues = 0u8;

    println!("antigravity-usage doctor");
    println!("config_path: {}", config::config_path().display());
    println!("data_path: {}", config::usage_data_path().display());

    match discover_log_directory(&SystemHost) {
        Some(log_dir) => {
            println!("[OK] Log directory found: {}", log_dir.display());
            match find_latest_log_file(&log_dir) {
                Some(file) => println!("[OK] Latest agent log: {}", file.display()),
                None => {
                    issues += 1;
                    println!("[WARN] No session contains an Antigravity.log yet.");
                }
            }
        }
        None => {
            issues += 1;
            println!("[WARN] Antigravity log directory not found; log file detection is unavailable.");
        }
    }

    match open_store(settings) {
        Ok(store) => println!(
            "[OK] Usage data readable ({} events, {} archived days).",
            store.data().events.len(),
            store.data().daily_summaries.len()
        ),
        Err(err) => {
            issues += 1;
            println!("[WARN] {err:#}");
        }
    }

    if settings.tracking_enabled {
        println!("[OK] Tracking enabled.");
    } else {
        issues += 1;
        println!("[WARN] Tracking disabled (run `antigravity-usage toggle`).");
    }

    if settings.detection_strategies.is_empty() {
        issues += 1;
        println!("[WARN] No detection strategies configured.");
    } else {
        let names: Vec<_> = settings
            .detection_strategies
            .iter()
            .map(|s| s.as_str())
            .collect();
        println!("[OK] Detection strategies: {}", names.join(", "));
    }

    if settings.warning_threshold_percent > settings.critical_threshold_percent {
        issues += 1;
        println!(
            "[WARN] Warning threshold ({:.0}%) is above critical threshold ({:.0}%).",
            settings.warning_threshold_percent, settings.critical_threshold_percent
        );
    }

    if settings.estimated_daily_limit == 0 {
        println!("[INFO] Daily limit is 0; usage percentage will always read 0%.");
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

pub fn print_history(settings: &TrackerSettings, days: usize) -> Result<()> {
    let store = open_store(settings)?;
    let history = store.daily_history();
    if history.is_empty() {
        println!("No usage recorded yet.");
        return Ok(());
    }

    println!("{:<10}  {:>8}  {:>8}  top model", "date (UTC)", "requests", "peak/min");
    let start = history.len().saturating_sub(days);
    for day in &history[start..] {
        let top_model = day
            .by_model
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(model, count)| format!("{model} ({count})"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10}  {:>8}  {:>8}  {}",
            day.date, day.total_requests, day.peak_requests_per_minute, top_model
        );
    }
    Ok(())
}

pub fn log_manual(settings: &TrackerSettings, runtime: &RuntimeSettings) -> Result<()> {
    if !settings.tracking_enabled {
        bail!("tracking is disabled; run `antigravity-usage toggle` to enable it");
    }

    let store = Rc::new(RefCell::new(open_store(settings)?));
    let shared: SharedStore = store.clone();
    let mut tracker = UsageTracker::new(shared, runtime.refresh_interval);
    let detector = ManualDetector::new();
    let trigger = detector.trigger();
    tracker.register_strategy(Box::new(detector));

    // The tracker only sees this run's events; the summary is over stored history.
    trigger.log_event();
    tracker.dispose();

    let mut store = store.borrow_mut();
    store.flush().context("failed to save usage data")?;
    let summary = summarize(&store.data().events, Utc::now(), settings);
    println!("Recorded manual request. {}", ui::status_line(&summary));
    Ok(())
}

pub fn reset(settings: &TrackerSettings, confirmed: bool) -> Result<u8> {
    if !confirmed {
        println!("This deletes all stored usage history. Re-run with --yes to confirm.");
        return Ok(1);
    }
    let mut store = open_store(settings)?;
    store
        .clear_all_data()
        .context("failed to clear usage data")?;
    println!("Usage history cleared: {}", store.path().display());
    Ok(0)
}

pub fn prune(settings: &TrackerSettings) -> Result<()> {
    let mut store = open_store(settings)?;
    let before = store.data().events.len();
    store.prune_old_data(Utc::now());
    store.flush().context("failed to save usage data")?;
    let after = store.data().events.len();
    println!(
        "Pruned {} event(s); {} raw event(s) and {} daily summary(ies) kept.",
        before - after,
        after,
        store.data().daily_summaries.len()
    );
    Ok(())
}

/// Flips `tracking_enabled` in the config file. Environment overrides are not
/// applied here so they never get written back.
pub fn toggle() -> Result<()> {
    let path = config::config_path();
    let mut settings = TrackerSettings::load_or_init_at(&path)?;
    settings.tracking_enabled = !settings.tracking_enabled;
    settings.save_to(&path)?;
    println!("Tracking {}.", enabled_label(settings.tracking_enabled));
    Ok(())
}

fn enabled_label(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
