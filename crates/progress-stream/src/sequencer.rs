//! Turns raw transport frames into ordered, de-duplicated events.

use tracing::{debug, warn};

use crate::event::{EventKind, StreamEvent};
use crate::transport::RawFrame;

/// Discontinuity between what the sequencer expected and what arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub expected: u64,
    pub received: u64,
}

/// Result of feeding one frame to the sequencer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequencedBatch {
    /// Events to hand to subscribers, in arrival order.
    pub events: Vec<StreamEvent>,
    /// A `ready` control event was part of the frame.
    pub ready: bool,
    pub gap: Option<SequenceGap>,
    /// Entries dropped because they were already delivered.
    pub duplicates: usize,
    /// Entries that could not be parsed.
    pub malformed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EventSequencer {
    cursor: u64,
    last_sequence: Option<u64>,
}

impl EventSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a known cursor, e.g. when resuming a poll stream.
    pub fn with_cursor(cursor: u64) -> Self {
        Self {
            cursor,
            last_sequence: None,
        }
    }

    /// Number of server-side entries consumed so far.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn accept(&mut self, frame: RawFrame) -> SequencedBatch {
        match frame {
            RawFrame::Batch { from, events } => self.accept_batch(from, events),
            RawFrame::Text(text) => self.accept_text(&text),
        }
    }

    fn accept_batch(&mut self, from: u64, entries: Vec<serde_json::Value>) -> SequencedBatch {
        let mut batch = SequencedBatch::default();
        let mut skip = 0usize;
        if from < self.cursor {
            skip = usize::try_from(self.cursor - from).unwrap_or(usize::MAX);
            batch.duplicates = skip.min(entries.len());
            debug!(from, cursor = self.cursor, duplicates = batch.duplicates, "dropping replayed entries");
        } else if from > self.cursor {
            let gap = SequenceGap {
                expected: self.cursor,
                received: from,
            };
            warn!(expected = gap.expected, received = gap.received, "poll cursor gap");
            batch.gap = Some(gap);
            self.cursor = from;
        }

        for entry in entries.into_iter().skip(skip) {
            self.cursor += 1;
            match StreamEvent::from_json(entry) {
                Ok(event) => route(event, &mut batch),
                Err(err) => {
                    warn!(cursor = self.cursor, error = %err, "skipping malformed progress entry");
                    batch.malformed += 1;
                }
            }
        }
        batch
    }

    fn accept_text(&mut self, text: &str) -> SequencedBatch {
        let mut batch = SequencedBatch::default();
        if text.trim().is_empty() {
            return batch;
        }
        let event = match StreamEvent::from_json_str(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, frame = %truncate(text, 200), "skipping malformed progress frame");
                batch.malformed = 1;
                return batch;
            }
        };

        if let Some(sequence) = event.sequence {
            if let Some(last) = self.last_sequence {
                if sequence <= last {
                    debug!(sequence, last, "dropping duplicate progress frame");
                    batch.duplicates = 1;
                    return batch;
                }
                if sequence > last + 1 {
                    let gap = SequenceGap {
                        expected: last + 1,
                        received: sequence,
                    };
                    warn!(expected = gap.expected, received = gap.received, "progress sequence gap");
                    batch.gap = Some(gap);
                }
            }
            self.last_sequence = Some(sequence);
        }

        self.cursor += 1;
        route(event, &mut batch);
        batch
    }
}

fn route(event: StreamEvent, batch: &mut SequencedBatch) {
    match event.kind {
        EventKind::Ready => batch.ready = true,
        EventKind::Connected | EventKind::Heartbeat => {}
        _ => batch.events.push(event),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn batch(from: u64, kinds: &[&str]) -> RawFrame {
        RawFrame::Batch {
            from,
            events: kinds.iter().map(|k| json!({"kind": k})).collect(),
        }
    }

    fn kinds(batch: &SequencedBatch) -> Vec<String> {
        batch.events.iter().map(|e| e.kind.to_string()).collect()
    }

    #[test]
    fn batches_advance_cursor_by_entries_consumed() {
        let mut seq = EventSequencer::new();
        let first = seq.accept(batch(0, &["agent_start", "agent_complete"]));
        assert_eq!(kinds(&first), vec!["agent_start", "agent_complete"]);
        assert_eq!(seq.cursor(), 2);

        let empty = seq.accept(batch(2, &[]));
        assert!(empty.events.is_empty());
        assert_eq!(seq.cursor(), 2);

        let next = seq.accept(batch(2, &["complete"]));
        assert_eq!(kinds(&next), vec!["complete"]);
        assert_eq!(seq.cursor(), 3);
    }

    #[test]
    fn replayed_batch_entries_are_dropped() {
        let mut seq = EventSequencer::with_cursor(2);
        let out = seq.accept(batch(1, &["agent_complete", "iteration_start"]));
        assert_eq!(out.duplicates, 1);
        assert_eq!(kinds(&out), vec!["iteration_start"]);
        assert_eq!(seq.cursor(), 3);
    }

    #[test]
    fn batch_ahead_of_cursor_is_flagged_as_gap() {
        let mut seq = EventSequencer::new();
        let out = seq.accept(batch(4, &["refinement"]));
        assert_eq!(
            out.gap,
            Some(SequenceGap {
                expected: 0,
                received: 4
            })
        );
        assert_eq!(seq.cursor(), 5);
    }

    #[test]
    fn malformed_entries_still_consume_cursor() {
        let mut seq = EventSequencer::new();
        let out = seq.accept(RawFrame::Batch {
            from: 0,
            events: vec![json!({"nope": true}), json!({"kind": "agent_start"})],
        });
        assert_eq!(out.malformed, 1);
        assert_eq!(kinds(&out), vec!["agent_start"]);
        assert_eq!(seq.cursor(), 2);
    }

    #[test]
    fn control_kinds_are_filtered_and_ready_is_flagged() {
        let mut seq = EventSequencer::new();
        assert!(seq.accept(RawFrame::Text(r#"{"type":"connected"}"#.into())).events.is_empty());
        assert!(seq.accept(RawFrame::Text(r#"{"type":"heartbeat"}"#.into())).events.is_empty());
        let ready = seq.accept(RawFrame::Text(r#"{"type":"ready"}"#.into()));
        assert!(ready.ready);
        assert!(ready.events.is_empty());
        let start = seq.accept(RawFrame::Text(
            r#"{"type":"agent_start","agent":"researcher"}"#.into(),
        ));
        assert!(!start.ready);
        assert_eq!(start.events[0].agent.as_deref(), Some("researcher"));
    }

    #[test]
    fn malformed_text_frame_is_skipped() {
        let mut seq = EventSequencer::new();
        let out = seq.accept(RawFrame::Text("{not json".into()));
        assert_eq!(out.malformed, 1);
        assert!(out.events.is_empty());
        let next = seq.accept(RawFrame::Text(r#"{"type":"refinement"}"#.into()));
        assert_eq!(kinds(&next), vec!["refinement"]);
    }

    #[test]
    fn sequenced_text_frames_drop_duplicates_and_flag_gaps() {
        let mut seq = EventSequencer::new();
        let frame = |n: u64| RawFrame::Text(format!(r#"{{"type":"refinement","sequence":{n}}}"#));
        assert_eq!(seq.accept(frame(1)).events.len(), 1);
        let dup = seq.accept(frame(1));
        assert_eq!(dup.duplicates, 1);
        assert!(dup.events.is_empty());
        let jumped = seq.accept(frame(4));
        assert_eq!(
            jumped.gap,
            Some(SequenceGap {
                expected: 2,
                received: 4
            })
        );
        assert_eq!(jumped.events.len(), 1);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
