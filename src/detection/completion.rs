use std::cell::Cell;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::DetectionStrategy;
use crate::emitter::{Emitter, Subscription};
use crate::model::{DetectedEvent, DetectionSource};

const MIN_LINES_FOR_AI: usize = 5;
const COOLDOWN_MS: i64 = 2_000;
const CHARS_PER_TOKEN: u64 = 4;

/// One edit notification from the host editor.
#[derive(Debug, Clone)]
pub struct DocumentChangeEvent {
    pub uri_scheme: String,
    pub changes: Vec<ContentChange>,
}

#[derive(Debug, Clone)]
pub struct ContentChange {
    pub text: String,
}

impl DocumentChangeEvent {
    pub fn file(changes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            uri_scheme: "file".to_string(),
            changes: changes
                .into_iter()
                .map(|text| ContentChange { text: text.into() })
                .collect(),
        }
    }
}

/// Treats large multi-line insertions as likely AI completions.
pub struct CompletionDetector {
    edits: Emitter<DocumentChangeEvent>,
    state: Rc<InsertionHeuristic>,
    listener: Option<Subscription>,
}

struct InsertionHeuristic {
    emitter: Emitter<DetectedEvent>,
    last_candidate_at: Cell<Option<DateTime<Utc>>>,
}

impl CompletionDetector {
    pub fn new(edits: Emitter<DocumentChangeEvent>) -> Self {
        Self {
            edits,
            state: Rc::new(InsertionHeuristic {
                emitter: Emitter::new(),
                last_candidate_at: Cell::new(None),
            }),
            listener: None,
        }
    }
}

impl InsertionHeuristic {
    fn analyze_changes(&self, event: &DocumentChangeEvent, now: DateTime<Utc>) {
        // Output channels, git views and settings editors are not user documents.
        if event.uri_scheme != "file" {
            return;
        }

        for change in &event.changes {
            let inserted_lines = change.text.matches('\n').count();
            if inserted_lines >= MIN_LINES_FOR_AI {
                self.observe_candidate(change.text.chars().count(), now);
            }
        }
    }

    fn observe_candidate(&self, char_count: usize, now: DateTime<Utc>) {
        let previous = self.last_candidate_at.replace(Some(now));
        if let Some(previous) = previous
            && now - previous < Duration::milliseconds(COOLDOWN_MS)
        {
            debug!(char_count, "large insertion suppressed by cooldown");
            return;
        }

        let mut event = DetectedEvent::new(now, DetectionSource::CompletionEvent);
        event.token_estimate = Some((char_count as u64).div_ceil(CHARS_PER_TOKEN));
        self.emitter.fire(&event);
    }
}

impl DetectionStrategy for CompletionDetector {
    fn source(&self) -> DetectionSource {
        DetectionSource::CompletionEvent
    }

    fn on_detected(&self) -> &Emitter<DetectedEvent> {
        &self.state.emitter
    }

    fn start(&mut self) {
        if self.listener.is_some() {
            return;
        }
        let state = Rc::clone(&self.state);
        self.listener = Some(
            self.edits
                .subscribe(move |event| state.analyze_changes(event, Utc::now())),
        );
    }

    fn dispose(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.dispose();
        }
        self.state.emitter.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::RefCell;

    fn collect(detector: &CompletionDetector) -> (Rc<RefCell<Vec<DetectedEvent>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let sub = detector
            .on_detected()
            .subscribe(move |event: &DetectedEvent| sink.borrow_mut().push(event.clone()));
        (seen, sub)
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 15, 12, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn lines(count: usize) -> String {
        "let x = 1;\n".repeat(count)
    }

    #[test]
    fn five_line_insertion_emits_token_estimate() {
        let detector = CompletionDetector::new(Emitter::new());
        let (seen, _sub) = collect(&detector);
        let text = lines(5);

        detector
            .state
            .analyze_changes(&DocumentChangeEvent::file([text.clone()]), at(0));

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].source, DetectionSource::CompletionEvent);
        assert_eq!(
            seen[0].token_estimate,
            Some((text.chars().count() as u64).div_ceil(4))
        );
    }

    #[test]
    fn small_edits_and_non_file_documents_are_ignored() {
        let detector = CompletionDetector::new(Emitter::new());
        let (seen, _sub) = collect(&detector);

        detector
            .state
            .analyze_changes(&DocumentChangeEvent::file([lines(4)]), at(0));
        let output = DocumentChangeEvent {
            uri_scheme: "output".to_string(),
            ..DocumentChangeEvent::file([lines(20)])
        };
        detector.state.analyze_changes(&output, at(5_000));

        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn cooldown_restarts_on_every_qualifying_edit() {
        let detector = CompletionDetector::new(Emitter::new());
        let (seen, _sub) = collect(&detector);
        let edit = DocumentChangeEvent::file([lines(6)]);

        detector.state.analyze_changes(&edit, at(0));
        detector.state.analyze_changes(&edit, at(1_500));
        // 2.5s after the first emission, but only 1.5s after the suppressed edit.
        detector.state.analyze_changes(&edit, at(3_000));
        detector.state.analyze_changes(&edit, at(5_000));

        let times: Vec<_> = seen.borrow().iter().map(|e| e.timestamp).collect();
        assert_eq!(times, vec![at(0), at(5_000)]);
    }

    #[test]
    fn start_subscribes_to_host_edits_and_dispose_detaches() {
        let edits: Emitter<DocumentChangeEvent> = Emitter::new();
        let mut detector = CompletionDetector::new(edits.clone());
        let (seen, _sub) = collect(&detector);

        detector.start();
        edits.fire(&DocumentChangeEvent::file([lines(8)]));
        assert_eq!(seen.borrow().len(), 1);

        detector.dispose();
        assert_eq!(edits.listener_count(), 0);
        edits.fire(&DocumentChangeEvent::file([lines(8)]));
        assert_eq!(seen.borrow().len(), 1);
    }
}
