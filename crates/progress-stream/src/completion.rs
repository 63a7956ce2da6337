use crate::errors::SessionFailure;
use crate::event::{EventKind, SessionOutcome, StreamEvent};

/// What the session should do with an observed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Ordinary progress event.
    Pass,
    /// First terminal event; the session must deliver it and close.
    Terminal(SessionOutcome),
    /// Arrived after the outcome was set.
    Discard,
}

/// Declares a session finished exactly once and fires `ready` at most once.
#[derive(Debug, Clone, Default)]
pub struct CompletionDetector {
    outcome: Option<SessionOutcome>,
    ready_fired: bool,
}

impl CompletionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &StreamEvent) -> Detection {
        if self.outcome.is_some() {
            return Detection::Discard;
        }
        let outcome = match event.kind {
            EventKind::Complete => SessionOutcome::Completed(event.clone()),
            EventKind::Error => SessionOutcome::Errored(SessionFailure::Workflow {
                message: event.failure_message(),
            }),
            _ => return Detection::Pass,
        };
        self.outcome = Some(outcome.clone());
        Detection::Terminal(outcome)
    }

    /// Sets an outcome that did not come from the event stream. Returns
    /// `false` when one was already set.
    pub fn settle(&mut self, outcome: SessionOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Returns `true` only the first time it is called.
    pub fn signal_ready(&mut self) -> bool {
        !std::mem::replace(&mut self.ready_fired, true)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_fired
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_fires_once() {
        let mut detector = CompletionDetector::new();
        let events = ["agent_start", "agent_complete", "complete", "complete"]
            .map(StreamEvent::new);
        let detections: Vec<Detection> = events.iter().map(|e| detector.observe(e)).collect();
        assert_eq!(detections[0], Detection::Pass);
        assert_eq!(detections[1], Detection::Pass);
        assert!(matches!(
            detections[2],
            Detection::Terminal(SessionOutcome::Completed(_))
        ));
        assert_eq!(detections[3], Detection::Discard);
        assert!(detector.is_terminal());
    }

    #[test]
    fn workflow_error_becomes_errored_outcome() {
        let mut detector = CompletionDetector::new();
        let event = StreamEvent::new("error").with_message("backtest crashed");
        assert_eq!(
            detector.observe(&event),
            Detection::Terminal(SessionOutcome::Errored(SessionFailure::Workflow {
                message: "backtest crashed".into()
            }))
        );
        assert_eq!(
            detector.observe(&StreamEvent::new("complete")),
            Detection::Discard
        );
    }

    #[test]
    fn ready_fires_once() {
        let mut detector = CompletionDetector::new();
        assert!(!detector.is_ready());
        assert!(detector.signal_ready());
        assert!(!detector.signal_ready());
        assert!(detector.is_ready());
        assert!(!detector.is_terminal());
    }

    #[test]
    fn settle_never_overrides() {
        let mut detector = CompletionDetector::new();
        assert!(detector.settle(SessionOutcome::Cancelled));
        assert!(!detector.settle(SessionOutcome::Completed(StreamEvent::new("complete"))));
        assert_eq!(detector.outcome(), Some(&SessionOutcome::Cancelled));
        assert_eq!(
            detector.observe(&StreamEvent::new("complete")),
            Detection::Discard
        );
    }
}
