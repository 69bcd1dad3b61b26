//! Canonical per-attempt records and the sorted summary collection built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Experimental arm a task attempt is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Baseline tooling.
    Control,
    /// Protocol-assisted tooling.
    Mcp,
}

impl Condition {
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::Control => "control",
            Condition::Mcp => "mcp",
        }
    }

    /// Human-readable label used in the summary.
    pub fn label(self) -> &'static str {
        match self {
            Condition::Control => "Control",
            Condition::Mcp => "MCP",
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Efficiency metrics for one task attempt inside one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub condition: Condition,
    #[serde(rename = "taskNumber")]
    pub task_id: u32,
    #[serde(rename = "directoryId")]
    pub session_id: String,
    pub model: String,
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub server: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Milliseconds between start and end.
    pub duration: u64,
    pub api_calls: u64,
    pub interactions: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_writes: u64,
    #[serde(default)]
    pub cache_reads: u64,
    #[serde(default)]
    pub conversation_history_index: Option<u64>,
    pub cost: f64,
    pub success: bool,
    #[serde(default)]
    pub notes: String,
}

impl MetricRecord {
    /// Sum of call, interaction and token counts; ranks two records for the same session.
    pub fn activity_score(&self) -> u64 {
        self.api_calls
            .saturating_add(self.interactions)
            .saturating_add(self.tokens_in)
            .saturating_add(self.tokens_out)
    }

    fn sort_key(&self) -> (u32, Condition, &str) {
        (self.task_id, self.condition, self.model.as_str())
    }

    fn merge_key(&self) -> (Condition, u32, DateTime<Utc>) {
        (self.condition, self.task_id, self.start_time)
    }
}

/// A record in the shape written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEntry {
    #[serde(flatten)]
    pub record: MetricRecord,
    pub task_label: String,
    pub condition_label: String,
}

impl From<MetricRecord> for SummaryEntry {
    fn from(record: MetricRecord) -> Self {
        Self {
            task_label: format!("Task {}", record.task_id),
            condition_label: record.condition.label().to_string(),
            record,
        }
    }
}

/// Ordered aggregate of records, sorted by (taskId, condition, model).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryCollection {
    entries: Vec<SummaryEntry>,
}

impl SummaryCollection {
    /// Build from keyed records: every record is kept, then sorted.
    pub fn from_records(records: impl IntoIterator<Item = MetricRecord>) -> Self {
        let mut collection = Self {
            entries: records.into_iter().map(SummaryEntry::from).collect(),
        };
        collection.sort();
        collection
    }

    /// Build from raw extraction output, keeping only the most active record
    /// per session.
    pub fn from_raw(records: impl IntoIterator<Item = MetricRecord>) -> Self {
        Self::from_records(dedupe_by_session(records))
    }

    pub fn from_entries(entries: Vec<SummaryEntry>) -> Self {
        let mut collection = Self { entries };
        collection.sort();
        collection
    }

    /// Replace entries sharing (condition, taskId, startTime) in place, append
    /// the rest, then re-sort. Returns `(replaced, appended)`.
    pub fn merge_or_replace(
        &mut self,
        records: impl IntoIterator<Item = MetricRecord>,
    ) -> (usize, usize) {
        let mut replaced = 0;
        let mut appended = 0;
        for record in records {
            let key = record.merge_key();
            match self
                .entries
                .iter_mut()
                .find(|e| e.record.merge_key() == key)
            {
                Some(existing) => {
                    *existing = SummaryEntry::from(record);
                    replaced += 1;
                }
                None => {
                    self.entries.push(SummaryEntry::from(record));
                    appended += 1;
                }
            }
        }
        self.sort();
        (replaced, appended)
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.record.sort_key().cmp(&b.record.sort_key()));
    }

    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keep one record per session: the higher activity score wins, and on an
/// exact tie the first one seen stays. Output preserves first-seen order.
pub fn dedupe_by_session(records: impl IntoIterator<Item = MetricRecord>) -> Vec<MetricRecord> {
    let mut kept: Vec<MetricRecord> = Vec::new();
    let mut slot: HashMap<String, usize> = HashMap::new();

    for record in records {
        match slot.get(&record.session_id) {
            Some(&idx) => {
                if record.activity_score() > kept[idx].activity_score() {
                    tracing::debug!(
                        session = %record.session_id,
                        kept = record.activity_score(),
                        dropped = kept[idx].activity_score(),
                        "duplicate session record replaced by more active one"
                    );
                    kept[idx] = record;
                }
            }
            None => {
                slot.insert(record.session_id.clone(), kept.len());
                kept.push(record);
            }
        }
    }
    kept
}
