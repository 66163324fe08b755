use std::fmt::Write as _;
use std::io::{Write, stdout};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::execute;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};

use crate::config::TrackerSettings;
use crate::model::{DetectionSource, RateLimitSnapshot, RateLimitStatus, UsageEvent, UsageSummary};
use crate::util::{
    format_time_ago, format_time_until, human_duration, local_clock, now_local, progress_bar,
    truncate,
};

const FOOTER_ROWS: u16 = 1;
const FOOTER_TEXT: &str = "m: log request | q or Ctrl+C: quit";

const BANNER: [&str; 2] = ["ANTIGRAVITY USAGE", "Agent requests + rate-limit estimate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiLayoutMode {
    Full,
    Compact,
    Minimal,
}

pub struct RenderData<'a> {
    pub running_for: Duration,
    pub tracking_enabled: bool,
    pub watched_log: Option<&'a Path>,
    pub strategies: &'a [DetectionSource],
    pub settings: &'a TrackerSettings,
    pub summary: &'a UsageSummary,
    pub last_rate_limit: Option<&'a RateLimitSnapshot>,
    pub recent: &'a [UsageEvent],
}

/// Compact one-line form, e.g. `AG: 3/min | 120 today`.
pub fn status_line(summary: &UsageSummary) -> String {
    format!(
        "AG: {}/min | {} today",
        summary.current_minute_count, summary.current_day_count
    )
}

pub fn status_color(status: RateLimitStatus) -> Color {
    match status {
        RateLimitStatus::Ok => Color::Green,
        RateLimitStatus::Warning => Color::Yellow,
        RateLimitStatus::Critical => Color::Red,
    }
}

/// The detailed breakdown shared by the live view and `status`.
pub fn summary_lines(summary: &UsageSummary, settings: &TrackerSettings) -> Vec<String> {
    vec![
        kv_line(
            "Minute",
            &format!(
                "{} / ~{}",
                summary.current_minute_count, settings.estimated_per_minute_limit
            ),
        ),
        kv_line("Hour", &summary.current_hour_count.to_string()),
        kv_line(
            "Today",
            &format!(
                "{} / ~{}",
                summary.current_day_count, settings.estimated_daily_limit
            ),
        ),
        kv_line("Session", &summary.session_count.to_string()),
        kv_line(
            "Rate Limit",
            &format!(
                "{:.1}% used ({})",
                summary.rate_limit_percent_used,
                summary.rate_limit_status.label()
            ),
        ),
        kv_line("Last Event", &format_time_ago(summary.last_event_timestamp)),
    ]
}

pub fn enter_terminal() -> Result<()> {
    let mut out = stdout();
    terminal::enable_raw_mode()?;
    execute!(out, EnterAlternateScreen, Hide)?;
    Ok(())
}

pub fn leave_terminal() -> Result<()> {
    let mut out = stdout();
    execute!(out, Show, LeaveAlternateScreen)?;
    terminal::disable_raw_mode()?;
    Ok(())
}

pub fn draw(data: &RenderData<'_>) -> Result<()> {
    let mut out = stdout();
    let (width, height) = terminal::size()?;
    if width == 0 || height == 0 {
        return Ok(());
    }

    let max_body_row = height.saturating_sub(FOOTER_ROWS.min(height));
    let layout = select_layout_mode(width, height);
    let w = width as usize;

    execute!(out, MoveTo(0, 0), Clear(ClearType::All))?;

    let mut row = 0u16;
    if !matches!(layout, UiLayoutMode::Minimal) {
        for text in BANNER {
            if !write_line(&mut out, &mut row, max_body_row, w, &center_line(text, w))? {
                break;
            }
        }
        let _ = write_line(&mut out, &mut row, max_body_row, w, "")?;
    }

    render_usage_section(&mut out, &mut row, max_body_row, w, layout, data)?;
    let _ = write_line(&mut out, &mut row, max_body_row, w, "")?;

    render_runtime_section(&mut out, &mut row, max_body_row, w, layout, data)?;

    if !matches!(layout, UiLayoutMode::Minimal) {
        let _ = write_line(&mut out, &mut row, max_body_row, w, "")?;
        render_recent_section(&mut out, &mut row, max_body_row, w, data)?;
    }

    render_footer(&mut out, w, height)?;
    out.flush()?;
    Ok(())
}

/// Changes whenever anything visible on screen would change.
pub fn frame_signature(data: &RenderData<'_>) -> String {
    let summary = data.summary;
    let mut signature = String::with_capacity(256);
    let _ = write!(
        signature,
        "{}|{}|{}|{}|{}|{:.1}|{}|",
        data.tracking_enabled,
        summary.current_minute_count,
        summary.current_hour_count,
        summary.current_day_count,
        summary.session_count,
        summary.rate_limit_percent_used,
        summary.rate_limit_status.label(),
    );
    if let Some(path) = data.watched_log {
        let _ = write!(signature, "log:{}|", path.display());
    }
    if let Some(snapshot) = data.last_rate_limit {
        let _ = write!(signature, "reset:{}|", snapshot.reset_at);
    }
    for event in data.recent {
        let _ = write!(signature, "{}|", event.id);
    }
    signature
}

fn render_usage_section(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    layout: UiLayoutMode,
    data: &RenderData<'_>,
) -> Result<()> {
    if !write_line(out, row, max_body_row, width, &hr("Usage", width))? {
        return Ok(());
    }

    let summary = data.summary;
    let color = status_color(summary.rate_limit_status);
    let headline = truncate(&status_line(summary), width);
    if !write_line_unchecked(out, row, max_body_row, &headline.with(color).bold().to_string())? {
        return Ok(());
    }

    if !matches!(layout, UiLayoutMode::Minimal) {
        let bar_width = width.saturating_sub(24).clamp(10, 40);
        let bar = progress_bar(summary.rate_limit_percent_used, bar_width).with(color);
        let pct = format!("{:>5.1}%", summary.rate_limit_percent_used).with(color);
        if !write_line_unchecked(out, row, max_body_row, &format!("Daily est.  [{pct}] {bar}"))? {
            return Ok(());
        }
    }

    for line in summary_lines(summary, data.settings) {
        if !write_line(out, row, max_body_row, width, &line)? {
            return Ok(());
        }
    }

    if let Some(snapshot) = data.last_rate_limit {
        let text = format!(
            "{} remaining of {} | reset {}",
            snapshot.remaining,
            snapshot.limit,
            format_time_until(Some(snapshot.reset_at))
        );
        let _ = write_line(out, row, max_body_row, width, &kv_line("Reported", &text))?;
    }

    Ok(())
}

fn render_runtime_section(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    layout: UiLayoutMode,
    data: &RenderData<'_>,
) -> Result<()> {
    if !write_line(out, row, max_body_row, width, &hr("Runtime", width))? {
        return Ok(());
    }

    let tracking = if data.tracking_enabled {
        "enabled"
    } else {
        "disabled"
    };
    let mut lines = vec![
        kv_line("Now", &now_local()),
        kv_line("Uptime", &human_duration(data.running_for)),
        kv_line("Tracking", tracking),
    ];

    if !matches!(layout, UiLayoutMode::Minimal) {
        let strategies = if data.strategies.is_empty() {
            "none".to_string()
        } else {
            data.strategies
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        lines.push(kv_line("Strategies", &strategies));
        let log = data
            .watched_log
            .map(|path| truncate(&path.display().to_string(), width.saturating_sub(13)))
            .unwrap_or_else(|| "not found".to_string());
        lines.push(kv_line("Log File", &log));
    }

    for line in lines {
        if !write_line(out, row, max_body_row, width, &line)? {
            break;
        }
    }

    Ok(())
}

fn render_recent_section(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    data: &RenderData<'_>,
) -> Result<()> {
    if !write_line(out, row, max_body_row, width, &hr("Recent Requests", width))? {
        return Ok(());
    }

    if data.recent.is_empty() {
        let _ = write_line(out, row, max_body_row, width, "No requests recorded this session.")?;
        return Ok(());
    }

    for event in data.recent.iter().rev() {
        if !write_line(out, row, max_body_row, width, &event_line(event))? {
            break;
        }
    }
    Ok(())
}

pub fn event_line(event: &UsageEvent) -> String {
    let mut line = format!(
        "{} | {:<16} | {}",
        local_clock(event.timestamp),
        event.source.as_str(),
        truncate(&event.model, 24)
    );
    if let Some(tokens) = event.token_estimate {
        let _ = write!(line, " | ~{tokens} tok");
    }
    line
}

fn render_footer(out: &mut impl Write, width: usize, height: u16) -> Result<()> {
    if height == 0 {
        return Ok(());
    }
    execute!(out, MoveTo(0, height - 1), Clear(ClearType::CurrentLine))?;
    write!(out, "{}", truncate(FOOTER_TEXT, width).dark_grey())?;
    Ok(())
}

fn write_line(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    width: usize,
    text: &str,
) -> Result<bool> {
    write_line_unchecked(out, row, max_body_row, &truncate(text, width))
}

// Styled text carries escape codes, so it cannot be truncated by length.
fn write_line_unchecked(
    out: &mut impl Write,
    row: &mut u16,
    max_body_row: u16,
    text: &str,
) -> Result<bool> {
    if *row >= max_body_row {
        return Ok(false);
    }

    execute!(out, MoveTo(0, *row), Clear(ClearType::CurrentLine))?;
    write!(out, "{text}")?;
    *row += 1;
    Ok(true)
}

fn kv_line(label: &str, value: &str) -> String {
    format!("{label:<11}: {value}")
}

fn hr(title: &str, width: usize) -> String {
    if width == 0 {
        return String::new();
    }

    let core = format!(" {title} ");
    if core.len() >= width {
        return truncate(title, width);
    }

    let side = (width - core.len()) / 2;
    let right = width - core.len() - side;
    format!("{}{}{}", "-".repeat(side), core, "-".repeat(right))
}

fn select_layout_mode(width: u16, height: u16) -> UiLayoutMode {
    if width >= 80 && height >= 24 {
        UiLayoutMode::Full
    } else if width >= 56 && height >= 16 {
        UiLayoutMode::Compact
    } else {
        UiLayoutMode::Minimal
    }
}

fn center_line(text: &str, width: usize) -> String {
    let clipped = truncate(text, width);
    let left_pad = width.saturating_sub(clipped.len()) / 2;
    format!("{}{}", " ".repeat(left_pad), clipped)
}
