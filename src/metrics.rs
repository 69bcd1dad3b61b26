//! Per-segment metric derivation.
//!
//! Turns a correlated segment into one `MetricRecord`: call and interaction
//! counts, token and cost totals, the serving model, and the final condition.
//!
//! The call count is a proxy sum of three overlapping counters (assistant
//! tool traffic in the call history, call-start events, and tool mentions in
//! narrative). One logical call is usually seen by more than one counter. The
//! bias is the same for both conditions, so the sum is kept as is.

use crate::classify::{self, Classifier, EventClass};
use crate::config::RatesConfig;
use crate::correlate::{CorrelatedSegment, Relevance};
use crate::logs::{Role, UiEvent};
use crate::record::{Condition, MetricRecord};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Input tokens credited to a completion result that has no usage payload.
pub const COMPLETION_INPUT_CREDIT: u64 = 32;
/// Rendered characters per output token for the completion estimate.
pub const CHARS_PER_OUTPUT_TOKEN: u64 = 3;

/// Caller-supplied record fields.
#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub model_override: Option<String>,
    pub default_model: String,
    pub client: String,
    pub server: String,
    pub success: bool,
}

/// The three call counters, kept separately for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub history_tool_calls: u64,
    pub call_start_events: u64,
    pub narrative_tool_mentions: u64,
}

impl CallCounts {
    pub fn total(&self) -> u64 {
        self.history_tool_calls
            .saturating_add(self.call_start_events)
            .saturating_add(self.narrative_tool_mentions)
    }
}

/// Token and cost totals for a segment.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UsageTotals {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    /// Sum of embedded cost fields; `None` when no source carried one.
    pub embedded_cost: Option<f64>,
    /// Completion results that were estimated from text length.
    pub estimated_completions: u64,
}

impl UsageTotals {
    fn add_tokens(&mut self, input: u64, output: u64, cache_writes: u64, cache_reads: u64) {
        self.tokens_in = self.tokens_in.saturating_add(input);
        self.tokens_out = self.tokens_out.saturating_add(output);
        self.cache_writes = self.cache_writes.saturating_add(cache_writes);
        self.cache_reads = self.cache_reads.saturating_add(cache_reads);
    }

    fn add_cost(&mut self, cost: f64) {
        *self.embedded_cost.get_or_insert(0.0) += cost;
    }
}

pub struct MetricsEngine<'a> {
    classifier: &'a Classifier,
    rates: &'a RatesConfig,
    options: &'a RecordOptions,
}

impl<'a> MetricsEngine<'a> {
    pub fn new(
        classifier: &'a Classifier,
        rates: &'a RatesConfig,
        options: &'a RecordOptions,
    ) -> Self {
        Self {
            classifier,
            rates,
            options,
        }
    }

    /// Derive the record for one segment.
    pub fn compute(&self, seg: &CorrelatedSegment) -> Result<MetricRecord, MetricsError> {
        let segment = &seg.segment;
        let start_ms = segment.start_timestamp;
        let end_ms = segment.end_timestamp.unwrap_or(start_ms);
        let start_time = to_datetime(start_ms)?;
        let end_time = to_datetime(end_ms)?;

        let condition = self.resolve_condition(seg);
        let calls = self.count_calls(seg);
        let interactions = self.count_interactions(seg);
        let usage = tally_usage(seg);
        let model = self.resolve_model(seg);

        let mut notes = Vec::new();
        if condition != segment.condition {
            notes.push(format!(
                "condition upgraded from {} to {}: protocol invocation in call history",
                segment.condition, condition
            ));
        }
        if segment.end_clamped {
            notes.push("end boundary clamped to session end".to_string());
        }
        if usage.estimated_completions > 0 {
            notes.push(format!(
                "{} completion result(s) estimated from text length",
                usage.estimated_completions
            ));
        }
        let cost = match usage.embedded_cost {
            Some(cost) => cost,
            None => {
                notes.push("cost estimated from rate table".to_string());
                estimate_cost(self.rates, &model, usage.tokens_in, usage.tokens_out)
            }
        };

        tracing::debug!(
            session = %segment.session_id,
            task = segment.task_number,
            condition = %condition,
            history_tool_calls = calls.history_tool_calls,
            call_start_events = calls.call_start_events,
            narrative_tool_mentions = calls.narrative_tool_mentions,
            interactions,
            tokens_in = usage.tokens_in,
            tokens_out = usage.tokens_out,
            "segment metrics derived"
        );

        Ok(MetricRecord {
            condition,
            task_id: segment.task_number,
            session_id: segment.session_id.clone(),
            model,
            client: self.options.client.clone(),
            server: self.options.server.clone(),
            start_time,
            end_time,
            duration: end_ms.saturating_sub(start_ms).max(0) as u64,
            api_calls: calls.total(),
            interactions,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            total_tokens: usage.tokens_in.saturating_add(usage.tokens_out),
            cache_writes: usage.cache_writes,
            cache_reads: usage.cache_reads,
            conversation_history_index: seg
                .relevant_events
                .iter()
                .filter_map(|e| e.conversation_index)
                .max(),
            cost,
            success: self.options.success,
            notes: notes.join("; "),
        })
    }

    /// Protocol-assisted if any assistant entry invokes the protocol, else the
    /// segment's initial condition.
    pub fn resolve_condition(&self, seg: &CorrelatedSegment) -> Condition {
        let invoked = seg
            .call_entries
            .iter()
            .filter(|c| c.role == Role::Assistant)
            .any(|c| self.classifier.is_protocol_invocation(&c.rendered()));
        if invoked {
            Condition::Mcp
        } else {
            seg.segment.condition
        }
    }

    pub fn count_calls(&self, seg: &CorrelatedSegment) -> CallCounts {
        let history_tool_calls = seg
            .call_entries
            .iter()
            .filter(|c| c.role == Role::Assistant)
            .filter(|c| {
                let rendered = c.rendered();
                classify::contains_any(&rendered, classify::TOOL_CALL_MARKERS)
                    || self.classifier.is_protocol_invocation(&rendered)
            })
            .count() as u64;

        let call_start_events = seg
            .relevant_events
            .iter()
            .filter(|e| {
                matches!(
                    classify::event_class(&e.event),
                    EventClass::GenericCallStart | EventClass::ProtocolCallStart
                )
            })
            .count() as u64;

        let narrative_tool_mentions = seg
            .relevant_events
            .iter()
            .filter(|e| e.relevance == Relevance::ToolUsage)
            .count() as u64;

        CallCounts {
            history_tool_calls,
            call_start_events,
            narrative_tool_mentions,
        }
    }

    /// User instructions in canonical phrasing, each distinct text counted once
    /// across the event stream and the call history's user-query tags.
    pub fn count_interactions(&self, seg: &CorrelatedSegment) -> u64 {
        let mut seen: HashSet<String> = HashSet::new();
        let mut count = 0;

        for relevant in &seg.relevant_events {
            let event = &relevant.event;
            if !self.is_user_instruction(event) {
                continue;
            }
            if seen.insert(content_hash(event.text())) {
                count += 1;
            }
        }

        let queries = seg
            .call_entries
            .iter()
            .filter(|c| c.role == Role::User)
            .flat_map(|c| c.texts())
            .flat_map(classify::user_queries);
        for query in queries {
            if self.classifier.canonical_instruction(query).is_none() {
                continue;
            }
            if seen.insert(content_hash(query)) {
                count += 1;
            }
        }
        count
    }

    fn is_user_instruction(&self, event: &UiEvent) -> bool {
        if !classify::is_instruction_bearing(event) {
            return false;
        }
        if let Some(rule) = classify::assistant_authorship(event) {
            tracing::trace!(?rule, "narrative excluded as assistant-authored");
            return false;
        }
        let text = event.text();
        if classify::contains_any(text, classify::TOOL_USAGE_SUBSTRINGS) {
            return false;
        }
        self.classifier.canonical_instruction(text).is_some()
    }

    /// Model from the first known signature in assistant traffic, unless overridden.
    pub fn resolve_model(&self, seg: &CorrelatedSegment) -> String {
        if let Some(model) = &self.options.model_override {
            return model.clone();
        }
        seg.call_entries
            .iter()
            .filter(|c| c.role == Role::Assistant)
            .find_map(|c| self.classifier.model_signature(&c.rendered()).map(str::to_string))
            .unwrap_or_else(|| self.options.default_model.clone())
    }
}

/// Sum usage from call-history usage blocks and request-start payloads, and
/// estimate completion results that carry no usage of their own.
pub fn tally_usage(seg: &CorrelatedSegment) -> UsageTotals {
    let mut totals = UsageTotals::default();

    for entry in &seg.call_entries {
        if let Some(usage) = &entry.usage {
            totals.add_tokens(
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_creation_input_tokens,
                usage.cache_read_input_tokens,
            );
        }
        if let Some(cost) = entry.cost {
            totals.add_cost(cost);
        }
    }

    for relevant in &seg.relevant_events {
        let event = &relevant.event;
        let payload = usage_payload(event.text());
        if let Some(p) = &payload {
            totals.add_tokens(
                field_u64(p, "tokensIn"),
                field_u64(p, "tokensOut"),
                field_u64(p, "cacheWrites"),
                field_u64(p, "cacheReads"),
            );
            if let Some(cost) = p.get("cost").and_then(|c| c.as_f64()) {
                totals.add_cost(cost);
            }
        } else if classify::is_completion(event) {
            let chars = event.text().chars().count() as u64;
            totals.add_tokens(
                COMPLETION_INPUT_CREDIT,
                chars.div_ceil(CHARS_PER_OUTPUT_TOKEN),
                0,
                0,
            );
            totals.estimated_completions += 1;
        }
    }
    totals
}

/// A JSON object in event text carrying token usage fields.
fn usage_payload(text: &str) -> Option<Value> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let v: Value = serde_json::from_str(trimmed).ok()?;
    (v.get("tokensIn").is_some() || v.get("tokensOut").is_some()).then_some(v)
}

fn field_u64(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(|t| t.as_u64()).unwrap_or(0)
}

/// Cost from the per-million-token rate table.
pub fn estimate_cost(rates: &RatesConfig, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let (input_rate, output_rate) = rates.for_model(model);
    (tokens_in as f64 * input_rate + tokens_out as f64 * output_rate) / 1_000_000.0
}

fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.trim().as_bytes()))
}

fn to_datetime(ms: i64) -> Result<DateTime<Utc>, MetricsError> {
    DateTime::from_timestamp_millis(ms).ok_or(MetricsError::InvalidTimestamp(ms))
}

#[derive(Debug)]
pub enum MetricsError {
    /// A segment boundary is outside the representable time range.
    InvalidTimestamp(i64),
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsError::InvalidTimestamp(ms) => {
                write!(f, "timestamp {ms} ms is out of range")
            }
        }
    }
}

impl std::error::Error for MetricsError {}
