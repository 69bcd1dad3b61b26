/// Correlation of a task segment with both logs: the UI events inside the
/// segment's index range that matter for metrics, and the call-history
/// entries whose recovered timestamp falls inside a padded time window.
use crate::classify::{self, EventClass};
use crate::config::WindowConfig;
use crate::logs::{CallEntry, SessionLogs, UiEvent};
use crate::segment::TaskSegment;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Asymmetric padding around a segment's time range.
///
/// The two logs are clocked independently: the call history's times come
/// from the agent's environment block and lag at startup, and responses keep
/// arriving after the last UI event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub lead_ms: i64,
    pub trail_ms: i64,
}

impl TimeWindow {
    pub const DEFAULT_LEAD_MS: i64 = 60_000;
    pub const DEFAULT_TRAIL_MS: i64 = 300_000;

    pub fn from_config(config: &WindowConfig) -> Self {
        Self {
            lead_ms: (config.lead_secs as i64).saturating_mul(1000),
            trail_ms: (config.trail_secs as i64).saturating_mul(1000),
        }
    }

    /// Whether `ts` lies in `[start - lead, end + trail]`.
    pub fn contains(&self, start: i64, end: i64, ts: i64) -> bool {
        ts >= start.saturating_sub(self.lead_ms) && ts <= end.saturating_add(self.trail_ms)
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            lead_ms: Self::DEFAULT_LEAD_MS,
            trail_ms: Self::DEFAULT_TRAIL_MS,
        }
    }
}

/// Why an event was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    CallStart,
    ToolUsage,
    UserAuthored,
    Narrative,
}

#[derive(Debug, Clone)]
pub struct RelevantEvent {
    pub index: usize,
    pub event: UiEvent,
    pub relevance: Relevance,
    pub conversation_index: Option<u64>,
}

/// A task segment joined with its slice of both logs.
#[derive(Debug, Clone)]
pub struct CorrelatedSegment {
    pub segment: TaskSegment,
    pub call_entries: Vec<CallEntry>,
    pub relevant_events: Vec<RelevantEvent>,
}

/// First relevance rule an event satisfies; administrative events match none.
pub fn relevance(event: &UiEvent) -> Option<Relevance> {
    match classify::event_class(event) {
        EventClass::GenericCallStart | EventClass::ProtocolCallStart => Some(Relevance::CallStart),
        EventClass::Narrative => {
            if classify::contains_any(event.text(), classify::TOOL_USAGE_SUBSTRINGS) {
                Some(Relevance::ToolUsage)
            } else if event.subtype() == "user_feedback"
                || event
                    .originator
                    .as_deref()
                    .is_some_and(|o| o.eq_ignore_ascii_case("user"))
            {
                Some(Relevance::UserAuthored)
            } else {
                Some(Relevance::Narrative)
            }
        }
        EventClass::Administrative => None,
    }
}

static LOOSE_HISTORY_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)conversation_?history_?index["']?\s*[:=]\s*(\d+)"#).unwrap()
});

/// Position in the call history this event refers to, when recoverable.
pub fn conversation_index(event: &UiEvent) -> Option<u64> {
    if let Some(idx) = event.history_index() {
        return Some(idx);
    }
    let text = event.text();
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        if let Some(idx) = v.get("conversationHistoryIndex").and_then(|i| i.as_u64()) {
            return Some(idx);
        }
    }
    LOOSE_HISTORY_INDEX
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub struct Correlator {
    window: TimeWindow,
}

impl Correlator {
    pub fn new(window: TimeWindow) -> Self {
        Self { window }
    }

    pub fn correlate(&self, segment: &TaskSegment, logs: &SessionLogs) -> CorrelatedSegment {
        let last = logs.events.len().saturating_sub(1);
        let end_index = segment.end_index.unwrap_or(last).min(last);

        let relevant_events = if logs.events.is_empty() || segment.start_index > end_index {
            Vec::new()
        } else {
            logs.events[segment.start_index..=end_index]
                .iter()
                .enumerate()
                .filter_map(|(offset, event)| {
                    relevance(event).map(|relevance| RelevantEvent {
                        index: segment.start_index + offset,
                        conversation_index: conversation_index(event),
                        event: event.clone(),
                        relevance,
                    })
                })
                .collect()
        };

        let start = segment.start_timestamp;
        let end = segment.end_timestamp.unwrap_or(start);
        let call_entries: Vec<CallEntry> = logs
            .calls
            .iter()
            .filter(|c| {
                c.timestamp_ms()
                    .is_some_and(|ts| self.window.contains(start, end, ts))
            })
            .cloned()
            .collect();

        tracing::debug!(
            session = %segment.session_id,
            task = segment.task_number,
            events = relevant_events.len(),
            calls = call_entries.len(),
            first_event = ?relevant_events.first().map(|e| e.index),
            last_event = ?relevant_events.last().map(|e| e.index),
            "segment correlated"
        );

        CorrelatedSegment {
            segment: segment.clone(),
            call_entries,
            relevant_events,
        }
    }
}
