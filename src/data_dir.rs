use crate::record::Condition;
use std::path::{Path, PathBuf};

/// Manages the results directory layout.
///
/// Every persisted artifact lives directly under a single output root: one
/// `{condition}_task{taskId}_{sessionId}.json` per record plus the aggregate
/// `summary.json`. The key-to-path mapping is deterministic so that existence
/// checks and overwrites address the same file.
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub const SUMMARY_FILE: &'static str = "summary.json";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `results/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the aggregate summary file.
    pub fn summary(&self) -> PathBuf {
        self.root.join(Self::SUMMARY_FILE)
    }

    /// Filename for a record key, e.g. `mcp_task3_1742412345678.json`.
    pub fn record_file_name(condition: Condition, task_id: u32, session_id: &str) -> String {
        format!("{}_task{task_id}_{session_id}.json", condition.as_str())
    }

    /// Path to the record artifact for a key.
    pub fn record_file(&self, condition: Condition, task_id: u32, session_id: &str) -> PathBuf {
        self.root
            .join(Self::record_file_name(condition, task_id, session_id))
    }

    /// Glob matching record artifacts for `(condition, task_id)` and an optional session.
    pub fn record_pattern(condition: Condition, task_id: u32, session_id: Option<&str>) -> String {
        let session = match session_id {
            Some(id) => glob::Pattern::escape(id),
            None => "*".to_string(),
        };
        format!("{}_task{task_id}_{session}.json", condition.as_str())
    }

    /// Glob matching every record artifact regardless of key.
    pub fn all_records_pattern() -> &'static str {
        "*_task*_*.json"
    }
}
