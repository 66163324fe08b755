//! Pluggable producers of [`DetectedEvent`]s, one per signal source.

use std::path::Path;
use std::time::Instant;

use crate::emitter::Emitter;
use crate::model::{DetectedEvent, DetectionSource};

pub mod completion;
pub mod log_file;
pub mod log_parser;
pub mod manual;

pub use completion::{CompletionDetector, ContentChange, DocumentChangeEvent};
pub use log_file::{CreatedLogs, HostPlatform, LogFileDetector, OsFamily, SystemHost};
pub use manual::{ManualDetector, ManualTrigger};

pub trait DetectionStrategy {
    fn source(&self) -> DetectionSource;

    fn on_detected(&self) -> &Emitter<DetectedEvent>;

    /// Begins any background watching. Called once, right after the tracker subscribes.
    fn start(&mut self);

    /// Drives owned timers. The host calls this from its loop; strategies
    /// without background work keep the default.
    fn poll(&mut self, _now: Instant) {}

    /// The file currently being followed, for strategies that follow one.
    fn watched_path(&self) -> Option<&Path> {
        None
    }

    /// Stops background work and closes the notification stream.
    fn dispose(&mut self);
}
