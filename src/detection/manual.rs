use chrono::Utc;

use super::DetectionStrategy;
use crate::emitter::Emitter;
use crate::model::{DetectedEvent, DetectionSource};

/// User-confirmed ground truth: one event per explicit `log_event` call.
pub struct ManualDetector {
    emitter: Emitter<DetectedEvent>,
}

impl ManualDetector {
    pub fn new() -> Self {
        Self {
            emitter: Emitter::new(),
        }
    }

    /// A handle the host keeps after the detector itself is handed to the tracker.
    pub fn trigger(&self) -> ManualTrigger {
        ManualTrigger {
            emitter: self.emitter.clone(),
        }
    }

    pub fn log_event(&self) {
        self.trigger().log_event();
    }
}

impl Default for ManualDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionStrategy for ManualDetector {
    fn source(&self) -> DetectionSource {
        DetectionSource::Manual
    }

    fn on_detected(&self) -> &Emitter<DetectedEvent> {
        &self.emitter
    }

    fn start(&mut self) {}

    fn dispose(&mut self) {
        self.emitter.close();
    }
}

#[derive(Clone)]
pub struct ManualTrigger {
    emitter: Emitter<DetectedEvent>,
}

impl ManualTrigger {
    /// Fires synchronously. A no-op once the owning detector is disposed.
    pub fn log_event(&self) {
        self.emitter
            .fire(&DetectedEvent::new(Utc::now(), DetectionSource::Manual));
    }
}
