/// Task segmentation: split one session's UI event stream into one segment
/// per benchmark task attempt and attribute the session to a condition.
use crate::classify::{self, Classifier};
use crate::logs::{Role, SessionLogs, UiEvent};
use crate::record::Condition;
use std::collections::HashSet;

/// One task attempt inside a session's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSegment {
    pub task_number: u32,
    pub session_id: String,
    /// Index of the event that started the task.
    pub start_index: usize,
    /// Epoch milliseconds of the start event.
    pub start_timestamp: i64,
    /// Inclusive index of the last event belonging to the task.
    pub end_index: Option<usize>,
    pub end_timestamp: Option<i64>,
    pub condition: Condition,
    /// The end timestamp was out of range and clamped to the session end.
    pub end_clamped: bool,
}

/// A detected task-start event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStart {
    pub task_number: u32,
    pub index: usize,
    pub timestamp: i64,
}

pub struct Segmenter<'a> {
    classifier: &'a Classifier,
}

impl<'a> Segmenter<'a> {
    pub fn new(classifier: &'a Classifier) -> Self {
        Self { classifier }
    }

    /// Session condition from the first marker reference in the event stream,
    /// falling back to user messages in the call history.
    pub fn detect_condition(&self, logs: &SessionLogs) -> Option<Condition> {
        logs.events
            .iter()
            .find_map(|e| self.classifier.condition_marker(e.text()))
            .or_else(|| {
                logs.calls
                    .iter()
                    .filter(|c| c.role == Role::User)
                    .flat_map(|c| c.texts())
                    .find_map(|t| self.classifier.condition_marker(t))
            })
    }

    /// Task-start events in stream order. Only the first start of each task
    /// number counts; later repeats are ignored.
    pub fn detect_starts(&self, events: &[UiEvent]) -> Vec<TaskStart> {
        let mut seen = HashSet::new();
        let mut starts = Vec::new();

        for (index, event) in events.iter().enumerate() {
            if !classify::is_instruction_bearing(event) {
                continue;
            }
            let text = event.text();
            if !self.classifier.references_marker_document(text) {
                continue;
            }
            let Some(task_number) = classify::task_number(text) else {
                continue;
            };
            let Some(timestamp) = event.timestamp() else {
                tracing::debug!(index, task_number, "task start without timestamp ignored");
                continue;
            };
            if seen.insert(task_number) {
                starts.push(TaskStart {
                    task_number,
                    index,
                    timestamp,
                });
            } else {
                tracing::debug!(index, task_number, "repeated task start ignored");
            }
        }
        starts
    }

    /// Partition a session into task segments. A session without a condition
    /// marker or without any task start yields no segments.
    pub fn segment(&self, logs: &SessionLogs) -> Vec<TaskSegment> {
        let Some(condition) = self.detect_condition(logs) else {
            return Vec::new();
        };
        let starts = self.detect_starts(&logs.events);
        if starts.is_empty() {
            return Vec::new();
        }
        let last_valid = last_valid_event(&logs.events);

        let mut segments: Vec<TaskSegment> = starts
            .iter()
            .map(|s| TaskSegment {
                task_number: s.task_number,
                session_id: logs.session_id.clone(),
                start_index: s.index,
                start_timestamp: s.timestamp,
                end_index: None,
                end_timestamp: None,
                condition,
                end_clamped: false,
            })
            .collect();

        for (i, segment) in segments.iter_mut().enumerate() {
            match starts.get(i + 1) {
                Some(next) => {
                    segment.end_index = Some(next.index.saturating_sub(1));
                    segment.end_timestamp = Some(next.timestamp);
                }
                None => {
                    segment.end_index = last_valid.map(|(idx, _)| idx);
                    segment.end_timestamp = last_valid.map(|(_, ts)| ts);
                }
            }
            if let Some((_, session_end)) = last_valid {
                validate_end(segment, session_end);
            }
        }
        segments
    }
}

/// Index and timestamp of the last event that can close a session: not a
/// resume marker and carrying a numeric timestamp.
pub fn last_valid_event(events: &[UiEvent]) -> Option<(usize, i64)> {
    events
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, e)| !classify::is_resume(e))
        .find_map(|(i, e)| e.timestamp().map(|ts| (i, ts)))
}

/// Clamp an end timestamp that is missing, before the start, or past the
/// session end to the session end.
fn validate_end(segment: &mut TaskSegment, session_end: i64) {
    let out_of_range = match segment.end_timestamp {
        None => true,
        Some(end) => end < segment.start_timestamp || end > session_end,
    };
    if out_of_range {
        tracing::warn!(
            session = %segment.session_id,
            task = segment.task_number,
            start = segment.start_timestamp,
            end = ?segment.end_timestamp,
            session_end,
            "task end boundary out of range, clamping to session end"
        );
        segment.end_timestamp = Some(session_end);
        segment.end_clamped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_model_signatures, MarkerConfig};
    use crate::logs::fixtures::{ask, call, say};

    fn classifier() -> Classifier {
        Classifier::new(&MarkerConfig::default(), default_model_signatures())
    }

    fn filler(n: usize, ts0: i64) -> Vec<UiEvent> {
        (0..n)
            .map(|i| say("api_req_started", "{}", ts0 + i as i64 * 1000))
            .collect()
    }

    fn logs(events: Vec<UiEvent>) -> SessionLogs {
        SessionLogs {
            session_id: "sess".to_string(),
            calls: Vec::new(),
            events,
        }
    }

    #[test]
    fn no_condition_marker_yields_no_segments() {
        let c = classifier();
        let l = logs(vec![say("text", "Complete Task 1 using the tools", 1000)]);
        assert!(Segmenter::new(&c).segment(&l).is_empty());
    }

    #[test]
    fn condition_without_task_start_yields_no_segments() {
        let c = classifier();
        let l = logs(vec![say("text", "Read mcp_instructions.md", 1000)]);
        let seg = Segmenter::new(&c);
        assert_eq!(seg.detect_condition(&l), Some(Condition::Mcp));
        assert!(seg.segment(&l).is_empty());
    }

    #[test]
    fn condition_falls_back_to_call_history() {
        let c = classifier();
        let mut l = logs(vec![say("text", "hello", 1000)]);
        l.calls
            .push(call(Role::Assistant, "see mcp_instructions.md"));
        l.calls
            .push(call(Role::User, "<task>use control_instructions.md</task>"));
        assert_eq!(
            Segmenter::new(&c).detect_condition(&l),
            Some(Condition::Control)
        );
    }

    #[test]
    fn single_task_single_segment_idempotent() {
        let c = classifier();
        let mut events = vec![say(
            "text",
            "Complete Task 3 using the commands in control_instructions.md",
            10_000,
        )];
        events.extend(filler(4, 11_000));
        let l = logs(events);
        let seg = Segmenter::new(&c);

        let first = seg.segment(&l);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].task_number, 3);
        assert_eq!(first[0].condition, Condition::Control);
        assert_eq!(first[0].start_index, 0);
        assert_eq!(first[0].end_index, Some(4));
        assert_eq!(first[0].end_timestamp, Some(14_000));
        assert!(!first[0].end_clamped);

        assert_eq!(seg.segment(&l), first);
    }

    #[test]
    fn start_requires_marker_reference() {
        let c = classifier();
        let events = vec![
            say("text", "Task 1 warmup", 1000),
            say("text", "Complete Task 2 using the mcp_instructions.md", 2000),
        ];
        let starts = Segmenter::new(&c).detect_starts(&events);
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].task_number, 2);
    }

    #[test]
    fn duplicate_task_number_first_wins() {
        let c = classifier();
        let events = vec![
            say("text", "Complete Task 1 using the mcp_instructions.md", 1000),
            say("user_feedback", "Task 1 again, see mcp_instructions.md", 2000),
        ];
        let starts = Segmenter::new(&c).detect_starts(&events);
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].index, 0);
    }

    #[test]
    fn non_instruction_events_do_not_start_tasks() {
        let c = classifier();
        let events = vec![say(
            "completion_result",
            "Finished Task 1 per mcp_instructions.md",
            1000,
        )];
        assert!(Segmenter::new(&c).detect_starts(&events).is_empty());
    }

    #[test]
    fn boundaries_do_not_overlap() {
        let c = classifier();
        let mut events = filler(30, 1000);
        events[5] = say("text", "Complete Task 1 using the mcp_instructions.md", 6000);
        events[12] = say("text", "Complete Task 2 using the mcp_instructions.md", 13_000);
        let segs = Segmenter::new(&c).segment(&logs(events));

        assert_eq!(segs.len(), 2);
        assert_eq!((segs[0].start_index, segs[0].end_index), (5, Some(11)));
        assert_eq!((segs[1].start_index, segs[1].end_index), (12, Some(29)));
        assert_eq!(segs[0].end_timestamp, Some(13_000));
        assert_eq!(segs[1].end_timestamp, Some(30_000));
        assert!(segs[0].end_index.unwrap() < segs[1].start_index);
    }

    #[test]
    fn last_valid_skips_resume_and_untimed_events() {
        let mut events = filler(3, 1000);
        events.push(ask("resume_task", "", 99_000));
        let mut untimed = say("text", "tail", 0);
        untimed.raw_ts = None;
        events.push(untimed);
        assert_eq!(last_valid_event(&events), Some((2, 3000)));
    }

    #[test]
    fn out_of_order_end_is_clamped() {
        let c = classifier();
        let events = vec![
            say("text", "Complete Task 1 using the mcp_instructions.md", 50_000),
            say("text", "Complete Task 2 using the mcp_instructions.md", 40_000),
            say("api_req_started", "{}", 60_000),
        ];
        let segs = Segmenter::new(&c).segment(&logs(events));
        assert_eq!(segs.len(), 2);
        // Task 2 starts "before" task 1 on the clock.
        assert!(segs[0].end_clamped);
        assert_eq!(segs[0].end_timestamp, Some(60_000));
        assert!(!segs[1].end_clamped);
    }

    #[test]
    fn end_past_session_end_is_clamped() {
        let c = classifier();
        let events = vec![
            say("text", "Complete Task 1 using the mcp_instructions.md", 1000),
            say("text", "Complete Task 2 using the mcp_instructions.md", 90_000),
            say("api_req_started", "{}", 5000),
        ];
        let segs = Segmenter::new(&c).segment(&logs(events));
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].end_index, Some(0));
        assert_eq!(segs[0].end_timestamp, Some(5000));
        assert!(segs[0].end_clamped);
    }

    #[test]
    fn zero_duration_segment_allowed() {
        let c = classifier();
        let events = vec![
            say("text", "Complete Task 9 using the control_instructions.md", 5000),
            ask("resume_task", "", 9000),
        ];
        let segs = Segmenter::new(&c).segment(&logs(events));
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].end_index, Some(0));
        assert_eq!(segs[0].end_timestamp, Some(5000));
        assert!(!segs[0].end_clamped);
    }
}
