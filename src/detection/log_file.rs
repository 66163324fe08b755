use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use chrono::Utc;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::DetectionStrategy;
use super::log_parser::parse_log_line;
use crate::config;
use crate::emitter::Emitter;
use crate::model::{DetectedEvent, DetectionSource};
use crate::timer::Interval;

const SESSION_LOG_RELATIVE: [&str; 4] = [
    "window1",
    "exthost",
    "google.antigravity",
    "Antigravity.log",
];
const AGENT_LOG_DIR_MARKER: &str = "google.antigravity";
const AGENT_LOG_FILE_NAME: &str = "Antigravity.log";
const WATCH_DEPTH: usize = SESSION_LOG_RELATIVE.len() + 1;
const MAX_PARTIAL_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Self::MacOs,
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }
}

/// What the log detector needs to know about the machine it runs on.
pub trait HostPlatform {
    fn home_dir(&self) -> Option<PathBuf>;

    fn os_family(&self) -> OsFamily;

    fn log_root_override(&self) -> Option<PathBuf> {
        None
    }

    /// Starts reporting agent log files created anywhere under `root`.
    fn watch_created_logs(&self, root: &Path, poll_interval: Duration) -> Box<dyn CreatedLogs> {
        watch_log_root(root, poll_interval)
    }
}

/// A feed of newly created agent log files, drained from the owner's poll path.
pub trait CreatedLogs {
    /// Paths created since the last call, oldest first. Each path is reported once.
    fn drain_created(&mut self, now: Instant) -> Vec<PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostPlatform for SystemHost {
    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    fn os_family(&self) -> OsFamily {
        OsFamily::current()
    }

    fn log_root_override(&self) -> Option<PathBuf> {
        config::log_root_override()
    }
}

pub fn log_root_for(os: OsFamily, home: &Path) -> Option<PathBuf> {
    let root = match os {
        OsFamily::MacOs => home
            .join("Library")
            .join("Application Support")
            .join("Antigravity"),
        OsFamily::Linux => home.join(".config").join("Antigravity"),
        OsFamily::Windows => home.join("AppData").join("Roaming").join("Antigravity"),
        OsFamily::Other => return None,
    };
    Some(root.join("logs"))
}

/// The host's log root, if it exists. Absence is an expected state, not an error.
pub fn discover_log_directory(host: &dyn HostPlatform) -> Option<PathBuf> {
    let candidate = match host.log_root_override() {
        Some(custom) => custom,
        None => log_root_for(host.os_family(), &host.home_dir()?)?,
    };
    candidate.is_dir().then_some(candidate)
}

/// Session directories are named by a sortable timestamp (`20260214T182055`),
/// so the newest session sorts last.
pub fn find_latest_log_file(log_dir: &Path) -> Option<PathBuf> {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(path = %log_dir.display(), error = %err, "failed to list log directory");
            return None;
        }
    };

    let mut sessions: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(ToString::to_string))
        .collect();
    sessions.sort_unstable_by(|a, b| b.cmp(a));

    sessions.into_iter().find_map(|session| {
        let candidate = SESSION_LOG_RELATIVE
            .iter()
            .fold(log_dir.join(session), |path, part| path.join(part));
        candidate.is_file().then_some(candidate)
    })
}

// Extension directories may carry a version suffix, so the marker is a substring match.
fn is_agent_log(path: &Path) -> bool {
    path.file_name().and_then(|name| name.to_str()) == Some(AGENT_LOG_FILE_NAME)
        && path.to_string_lossy().contains(AGENT_LOG_DIR_MARKER)
}

fn scan_agent_logs(root: &Path) -> HashSet<PathBuf> {
    WalkDir::new(root)
        .max_depth(WATCH_DEPTH)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_agent_log(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

/// Filesystem notifications when the platform supports them, a periodic
/// rescan otherwise.
pub fn watch_log_root(root: &Path, poll_interval: Duration) -> Box<dyn CreatedLogs> {
    match LogRootWatcher::new(root) {
        Ok(watcher) => Box::new(watcher),
        Err(err) => {
            warn!(path = %root.display(), error = %err, "filesystem watch unavailable; rescanning log root instead");
            Box::new(LogRootRescan::new(root.to_path_buf(), poll_interval, Instant::now()))
        }
    }
}

/// Incremental reader over one growing log file.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    cursor: u64,
    partial: Vec<u8>,
    discarding: bool,
}

impl LogTail {
    /// Starts at the current end of file: content written before now is never read.
    pub fn at_end(path: PathBuf) -> Self {
        let cursor = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        Self::at(path, cursor)
    }

    /// Reads the whole file. For files created after tailing began, whose
    /// entire content is new.
    pub fn from_start(path: PathBuf) -> Self {
        Self::at(path, 0)
    }

    fn at(path: PathBuf, cursor: u64) -> Self {
        Self {
            path,
            cursor,
            partial: Vec::new(),
            discarding: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Complete lines appended since the last call. I/O failures reset the
    /// cursor and yield nothing; the next call retries from a fresh stat.
    pub fn read_new_lines(&mut self) -> Vec<String> {
        match self.try_read() {
            Ok(lines) => lines,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "log read failed; resetting cursor");
                self.reset();
                Vec::new()
            }
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.partial.clear();
        self.discarding = false;
    }

    fn try_read(&mut self) -> io::Result<Vec<String>> {
        let size = fs::metadata(&self.path)?.len();
        if size < self.cursor {
            debug!(path = %self.path.display(), size, cursor = self.cursor, "log shrank; assuming rotation");
            self.reset();
        }
        if size == self.cursor {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.cursor))?;
        let mut chunk = Vec::new();
        file.take(size - self.cursor).read_to_end(&mut chunk)?;
        self.cursor += chunk.len() as u64;

        // The rest of an oversized line is skipped up to and including its newline.
        if self.discarding {
            let Some(end) = chunk.iter().position(|byte| *byte == b'\n') else {
                return Ok(Vec::new());
            };
            chunk.drain(..=end);
            self.discarding = false;
        }

        self.partial.extend_from_slice(&chunk);
        let lines = self.drain_complete_lines();
        if self.partial.len() > MAX_PARTIAL_LINE_BYTES {
            debug!(path = %self.path.display(), bytes = self.partial.len(), "dropping oversized unterminated line");
            self.partial.clear();
            self.discarding = true;
        }
        Ok(lines)
    }

    fn drain_complete_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.partial.iter().rposition(|byte| *byte == b'\n') else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        complete[..last_newline]
            .split(|byte| *byte == b'\n')
            .map(|line| {
                String::from_utf8_lossy(line)
                    .trim_end_matches('\r')
                    .to_string()
            })
            .collect()
    }
}

/// Recursive filesystem watch on the log root.
///
/// Notifications arrive on the watcher's own thread and queue in a channel
/// until the next drain. A new session directory can be created together
/// with its log file before the recursive watch covers it, so created
/// directories are also scanned for agent logs at drain time.
pub struct LogRootWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    reported: HashSet<PathBuf>,
}

impl LogRootWatcher {
    pub fn new(root: &Path) -> notify::Result<Self> {
        let (tx, events) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(tx, Config::default())?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        debug!(path = %root.display(), "watching log root for new sessions");
        Ok(Self {
            _watcher: watcher,
            events,
            reported: HashSet::new(),
        })
    }
}

impl CreatedLogs for LogRootWatcher {
    fn drain_created(&mut self, _now: Instant) -> Vec<PathBuf> {
        let mut created = Vec::new();
        while let Ok(result) = self.events.try_recv() {
            let event = match result {
                Ok(event) => event,
                Err(err) => {
                    debug!(error = %err, "log root watch error");
                    continue;
                }
            };
            if !matches!(event.kind, EventKind::Create(_)) {
                continue;
            }
            for path in event.paths {
                let mut found: Vec<PathBuf> = if path.is_dir() {
                    scan_agent_logs(&path).into_iter().collect()
                } else if is_agent_log(&path) {
                    vec![path]
                } else {
                    Vec::new()
                };
                found.sort();
                for log in found {
                    if self.reported.insert(log.clone()) {
                        created.push(log);
                    }
                }
            }
        }
        created
    }
}

/// Periodic rescan of the log root, used where no filesystem watch can be set up.
#[derive(Debug)]
pub struct LogRootRescan {
    root: PathBuf,
    known: HashSet<PathBuf>,
    timer: Interval,
}

impl LogRootRescan {
    pub fn new(root: PathBuf, period: Duration, now: Instant) -> Self {
        let known = scan_agent_logs(&root);
        Self {
            root,
            known,
            timer: Interval::starting_at(period, now),
        }
    }
}

impl CreatedLogs for LogRootRescan {
    fn drain_created(&mut self, now: Instant) -> Vec<PathBuf> {
        if !self.timer.is_due(now) {
            return Vec::new();
        }
        let current = scan_agent_logs(&self.root);
        let mut created: Vec<PathBuf> = current
            .iter()
            .filter(|path| !self.known.contains(*path))
            .cloned()
            .collect();
        created.sort();
        self.known.extend(current);
        created
    }
}

/// Follows the newest Antigravity session log and reports API calls and
/// rate-limit hits found in it.
pub struct LogFileDetector {
    host: Box<dyn HostPlatform>,
    poll_interval: Duration,
    emitter: Emitter<DetectedEvent>,
    started: bool,
    tail: Option<LogTail>,
    tail_timer: Option<Interval>,
    created_logs: Option<Box<dyn CreatedLogs>>,
}

impl LogFileDetector {
    pub fn new(host: Box<dyn HostPlatform>, poll_interval: Duration) -> Self {
        Self {
            host,
            poll_interval,
            emitter: Emitter::new(),
            started: false,
            tail: None,
            tail_timer: None,
            created_logs: None,
        }
    }

    pub fn watched_file(&self) -> Option<&Path> {
        self.tail.as_ref().map(LogTail::path)
    }

    fn start_tailing(&mut self, tail: LogTail, now: Instant) {
        // Replacing the timer cancels the previous file's schedule.
        self.tail_timer = Some(Interval::starting_at(self.poll_interval, now));
        info!(path = %tail.path().display(), cursor = tail.cursor(), "tailing agent log");
        self.tail = Some(tail);
    }

    fn read_new_content(&mut self) {
        let Some(tail) = self.tail.as_mut() else {
            return;
        };
        let lines = tail.read_new_lines();
        let now = Utc::now();
        for line in lines {
            if let Some(event) = parse_log_line(&line, now) {
                self.emitter.fire(&event);
            }
        }
    }

    fn next_created_log(&mut self, now: Instant) -> Option<PathBuf> {
        let created = self.created_logs.as_mut()?.drain_created(now);
        let current = self.watched_file().map(Path::to_path_buf);
        created
            .into_iter()
            .find(|path| current.as_ref() != Some(path))
    }
}

impl DetectionStrategy for LogFileDetector {
    fn source(&self) -> DetectionSource {
        DetectionSource::LogFile
    }

    fn on_detected(&self) -> &Emitter<DetectedEvent> {
        &self.emitter
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let Some(log_dir) = discover_log_directory(self.host.as_ref()) else {
            info!("no Antigravity log directory found; log file detection disabled");
            return;
        };
        info!(path = %log_dir.display(), "discovered Antigravity log directory");

        // Watch before looking for the current log so nothing created in between is missed.
        let now = Instant::now();
        self.created_logs = Some(self.host.watch_created_logs(&log_dir, self.poll_interval));
        if let Some(log_file) = find_latest_log_file(&log_dir) {
            self.start_tailing(LogTail::at_end(log_file), now);
        }
    }

    fn poll(&mut self, now: Instant) {
        // A log created after start holds only new requests, so it is read
        // from its beginning right away.
        if let Some(newest) = self.next_created_log(now) {
            info!(path = %newest.display(), "new agent log file detected");
            self.start_tailing(LogTail::from_start(newest), now);
            self.read_new_content();
            return;
        }

        if self
            .tail_timer
            .as_mut()
            .is_some_and(|timer| timer.is_due(now))
        {
            self.read_new_content();
        }
    }

    fn watched_path(&self) -> Option<&Path> {
        self.watched_file()
    }

    fn dispose(&mut self) {
        self.tail_timer = None;
        self.created_logs = None;
        self.tail = None;
        self.emitter.close();
    }
}
