//! Batch extraction: discover session directories, run the
//! segment → correlate → metrics → write pipeline for each session
//! concurrently, then rebuild the summary once everything has finished.
//!
//! Per-item problems (skipped sessions, failed segments, corrupt records)
//! are collected into the final `RunReport`. Only setup problems abort a run.

use crate::classify::Classifier;
use crate::config::BenchConfig;
use crate::correlate::{Correlator, TimeWindow};
use crate::data_dir::OutputDir;
use crate::logs::{self, SessionLogs};
use crate::metrics::{MetricsEngine, RecordOptions};
use crate::record::{MetricRecord, SummaryCollection};
use crate::segment::Segmenter;
use crate::store::{MergeReport, RebuildReport, RecordStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Options for one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub logs_root: PathBuf,
    pub output_dir: PathBuf,
    /// Overwrite records that already exist.
    pub force: bool,
    pub record: RecordOptions,
}

/// Why a session produced no records. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingArtifact(&'static str),
    NoConditionMarker,
    NoTaskSegments,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingArtifact(name) => write!(f, "missing {name}"),
            SkipReason::NoConditionMarker => write!(f, "no condition marker"),
            SkipReason::NoTaskSegments => write!(f, "no task segments"),
        }
    }
}

/// What happened to one session.
#[derive(Debug)]
pub enum SessionOutcome {
    Skipped {
        session_id: String,
        reason: SkipReason,
    },
    Processed(SessionReport),
}

#[derive(Debug, Default)]
pub struct SessionReport {
    pub session_id: String,
    pub written: Vec<PathBuf>,
    pub existing: usize,
    pub clamped: usize,
    pub failures: Vec<String>,
}

/// Final status of an extraction run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub sessions: usize,
    pub skipped: Vec<(String, SkipReason)>,
    pub records_written: usize,
    pub records_existing: usize,
    pub warnings: usize,
    pub failures: Vec<String>,
    pub rebuild: Option<RebuildReport>,
}

impl RunReport {
    fn absorb(&mut self, outcome: SessionOutcome) {
        self.sessions += 1;
        match outcome {
            SessionOutcome::Skipped { session_id, reason } => {
                tracing::info!(session = %session_id, %reason, "session skipped");
                self.skipped.push((session_id, reason));
            }
            SessionOutcome::Processed(report) => {
                self.records_written += report.written.len();
                self.records_existing += report.existing;
                self.warnings += report.clamped;
                self.failures.extend(
                    report
                        .failures
                        .into_iter()
                        .map(|f| format!("{}: {f}", report.session_id)),
                );
            }
        }
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} session(s): {} record(s) written, {} already present, {} skipped, {} warning(s), {} failure(s)",
            self.sessions,
            self.records_written,
            self.records_existing,
            self.skipped.len(),
            self.warnings,
            self.failures.len(),
        )?;
        if let Some(rebuild) = &self.rebuild {
            write!(f, "; summary: {} entries", rebuild.entries)?;
            if !rebuild.failed.is_empty() {
                write!(f, ", unreadable: {}", rebuild.failed.join(", "))?;
            }
        }
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

/// Shared, read-only pipeline state handed to every session task.
struct Pipeline {
    classifier: Classifier,
    window: TimeWindow,
    rates: crate::config::RatesConfig,
    record: RecordOptions,
    store: RecordStore,
    force: bool,
}

impl Pipeline {
    fn new(config: &BenchConfig, opts: &ExtractOptions) -> Self {
        Self {
            classifier: Classifier::new(&config.markers, config.model_signatures()),
            window: TimeWindow::from_config(&config.window),
            rates: config.rates.clone(),
            record: opts.record.clone(),
            store: RecordStore::new(OutputDir::new(&opts.output_dir)),
            force: opts.force,
        }
    }

    /// Run all four stages for one session directory, sequentially.
    fn process_session(&self, dir: &Path) -> SessionOutcome {
        let session_id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        let skip = |reason| SessionOutcome::Skipped {
            session_id: session_id.clone(),
            reason,
        };

        let Some(call_path) = logs::find_artifact(dir, logs::CALL_HISTORY_FILE) else {
            return skip(SkipReason::MissingArtifact(logs::CALL_HISTORY_FILE));
        };
        let Some(event_path) = logs::find_artifact(dir, logs::UI_EVENTS_FILE) else {
            return skip(SkipReason::MissingArtifact(logs::UI_EVENTS_FILE));
        };

        let mut report = SessionReport {
            session_id: session_id.clone(),
            ..Default::default()
        };
        let session = match SessionLogs::load(session_id.clone(), &call_path, &event_path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "failed to load session logs");
                report.failures.push(e.to_string());
                return SessionOutcome::Processed(report);
            }
        };

        let segmenter = Segmenter::new(&self.classifier);
        if segmenter.detect_condition(&session).is_none() {
            return skip(SkipReason::NoConditionMarker);
        }
        let segments = segmenter.segment(&session);
        if segments.is_empty() {
            return skip(SkipReason::NoTaskSegments);
        }

        let correlator = Correlator::new(self.window);
        let engine = MetricsEngine::new(&self.classifier, &self.rates, &self.record);

        for segment in &segments {
            if segment.end_clamped {
                report.clamped += 1;
            }
            let correlated = correlator.correlate(segment, &session);
            let record = match engine.compute(&correlated) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        session = %session_id,
                        task = segment.task_number,
                        error = %e,
                        "metric derivation failed, skipping segment"
                    );
                    report
                        .failures
                        .push(format!("task {}: {e}", segment.task_number));
                    continue;
                }
            };
            match self.persist(&record) {
                Ok(Some(path)) => report.written.push(path),
                Ok(None) => report.existing += 1,
                Err(e) => report
                    .failures
                    .push(format!("task {}: {e}", segment.task_number)),
            }
        }
        SessionOutcome::Processed(report)
    }

    /// Write a record unless it already exists and the run isn't forced.
    fn persist(&self, record: &MetricRecord) -> Result<Option<PathBuf>, StoreError> {
        if !self.force
            && self.store.exists_record(
                record.condition,
                record.task_id,
                Some(&record.session_id),
            )?
        {
            tracing::debug!(
                session = %record.session_id,
                task = record.task_id,
                condition = %record.condition,
                "record exists, skipping (use --force to overwrite)"
            );
            return Ok(None);
        }
        self.store.write_record(record).map(Some)
    }
}

/// Extract records for every session under the logs root, then rebuild the summary.
pub async fn run_extraction(
    config: &BenchConfig,
    opts: ExtractOptions,
) -> Result<RunReport, SetupError> {
    if !opts.logs_root.is_dir() {
        return Err(SetupError::MissingInputRoot(opts.logs_root.clone()));
    }
    require_output_root(&opts.output_dir)?;

    let dirs = logs::discover_sessions(&opts.logs_root).map_err(|e| SetupError::Discover {
        path: opts.logs_root.clone(),
        source: e,
    })?;
    tracing::info!(
        sessions = dirs.len(),
        root = %opts.logs_root.display(),
        "discovered session directories"
    );

    let pipeline = Arc::new(Pipeline::new(config, &opts));
    let semaphore = Arc::new(Semaphore::new(config.extract.max_parallel.max(1)));
    let mut tasks = JoinSet::new();

    for dir in dirs {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let pipeline = Arc::clone(&pipeline);
        tasks.spawn_blocking(move || {
            let _permit = permit;
            pipeline.process_session(&dir)
        });
    }

    let mut report = RunReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => report.absorb(outcome),
            Err(e) => {
                tracing::error!(error = %e, "session task aborted");
                report.sessions += 1;
                report.failures.push(format!("session task aborted: {e}"));
            }
        }
    }

    match pipeline.store.rebuild_summary() {
        Ok(rebuild) => report.rebuild = Some(rebuild),
        Err(e) => {
            tracing::error!(error = %e, "summary rebuild failed");
            report.failures.push(format!("summary rebuild: {e}"));
        }
    }
    Ok(report)
}

/// Rebuild the summary from the records already on disk.
pub fn rebuild_summary(output_dir: &Path) -> Result<RebuildReport, SetupError> {
    require_output_root(output_dir)?;
    RecordStore::new(OutputDir::new(output_dir))
        .rebuild_summary()
        .map_err(SetupError::Store)
}

/// Outcome of merging raw record files into the summary.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub merge: MergeReport,
    pub failed: Vec<String>,
}

/// Merge raw extraction output (JSON arrays of records) into the summary,
/// keeping only the most active record per session.
pub fn merge_raw_files(output_dir: &Path, files: &[PathBuf]) -> Result<MergeOutcome, SetupError> {
    require_output_root(output_dir)?;

    let mut records: Vec<MetricRecord> = Vec::new();
    let mut failed = Vec::new();
    for file in files {
        let parsed = std::fs::read_to_string(file)
            .map_err(|e| e.to_string())
            .and_then(|c| {
                serde_json::from_str::<Vec<MetricRecord>>(&c).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(mut batch) => records.append(&mut batch),
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "skipping unreadable record batch");
                failed.push(file.display().to_string());
            }
        }
    }

    let raw = SummaryCollection::from_raw(records);
    if raw.is_empty() {
        tracing::warn!(files = files.len(), "no records to merge");
    }
    let merge = RecordStore::new(OutputDir::new(output_dir))
        .merge_or_replace(raw.entries().iter().map(|e| e.record.clone()))
        .map_err(SetupError::Store)?;
    Ok(MergeOutcome { merge, failed })
}

fn require_output_root(path: &Path) -> Result<(), SetupError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(SetupError::MissingOutputRoot(path.to_path_buf()))
    }
}

/// Errors that stop a run before or outside per-session processing.
#[derive(Debug)]
pub enum SetupError {
    MissingInputRoot(PathBuf),
    MissingOutputRoot(PathBuf),
    Discover {
        path: PathBuf,
        source: std::io::Error,
    },
    Store(StoreError),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::MissingInputRoot(p) => {
                write!(f, "input root {} does not exist", p.display())
            }
            SetupError::MissingOutputRoot(p) => {
                write!(f, "output root {} does not exist", p.display())
            }
            SetupError::Discover { path, source } => {
                write!(f, "failed to list sessions in {}: {}", path.display(), source)
            }
            SetupError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::Discover { source, .. } => Some(source),
            SetupError::Store(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::fixtures::env_block;
    use crate::record::Condition;
    use serde_json::json;
    use tempfile::TempDir;

    const T0: i64 = 1_742_400_000_000;
    const MCP_TASK: &str = "Complete Task 1 using the commands in mcp_instructions.md";

    fn options(root: &TempDir, force: bool) -> ExtractOptions {
        ExtractOptions {
            logs_root: root.path().join("logs"),
            output_dir: root.path().join("out"),
            force,
            record: RecordOptions {
                model_override: None,
                default_model: "default-model".to_string(),
                client: "cline".to_string(),
                server: "none".to_string(),
                success: true,
            },
        }
    }

    fn layout() -> TempDir {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("logs")).unwrap();
        std::fs::create_dir(root.path().join("out")).unwrap();
        root
    }

    fn write_session(root: &TempDir, id: &str, calls: serde_json::Value, events: serde_json::Value) {
        let dir = root.path().join("logs").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(logs::CALL_HISTORY_FILE), calls.to_string()).unwrap();
        std::fs::write(dir.join(logs::UI_EVENTS_FILE), events.to_string()).unwrap();
    }

    fn benchmark_session(root: &TempDir, id: &str) {
        let calls = json!([
            {"role": "user", "content": [
                {"type": "text", "text": format!("<task>\n{MCP_TASK}\n</task>")},
                {"type": "text", "text": env_block(T0)}
            ]},
            {"role": "assistant", "content": [
                {"type": "text", "text": "<use_mcp_tool><server_name>svc</server_name></use_mcp_tool>"},
                {"type": "text", "text": env_block(T0 + 2000)}
            ]}
        ]);
        let events = json!([
            {"type": "say", "say": "text", "text": MCP_TASK, "ts": T0, "conversationHistoryIndex": -1},
            {"type": "say", "say": "api_req_started",
             "text": "{\"tokensIn\":100,\"tokensOut\":50,\"cost\":0.01}", "ts": T0 + 1000},
            {"type": "say", "say": "completion_result", "text": "Done", "ts": T0 + 5000}
        ]);
        write_session(root, id, calls, events);
    }

    #[tokio::test]
    async fn extracts_one_record_and_rebuilds_summary() {
        let root = layout();
        benchmark_session(&root, "1742400000000");
        let cfg = BenchConfig::default();

        let report = run_extraction(&cfg, options(&root, false)).await.unwrap();
        assert_eq!(report.sessions, 1);
        assert_eq!(report.records_written, 1);
        assert!(report.failures.is_empty());
        assert_eq!(report.rebuild.as_ref().unwrap().entries, 1);

        let path = root.path().join("out/mcp_task1_1742400000000.json");
        let record = RecordStore::read_record(&path).unwrap();
        assert_eq!(record.condition, Condition::Mcp);
        assert_eq!(record.interactions, 1);
        assert_eq!(record.api_calls, 2);
        assert_eq!(record.duration, 5000);
        assert_eq!(record.tokens_in, 100 + 32);
        assert_eq!(record.tokens_out, 50 + 2);
        assert!((record.cost - 0.01).abs() < 1e-9);
        assert!(root.path().join("out/summary.json").exists());
    }

    #[tokio::test]
    async fn rerun_skips_existing_unless_forced() {
        let root = layout();
        benchmark_session(&root, "s1");
        let cfg = BenchConfig::default();

        run_extraction(&cfg, options(&root, false)).await.unwrap();
        let again = run_extraction(&cfg, options(&root, false)).await.unwrap();
        assert_eq!(again.records_written, 0);
        assert_eq!(again.records_existing, 1);

        let forced = run_extraction(&cfg, options(&root, true)).await.unwrap();
        assert_eq!(forced.records_written, 1);
        assert_eq!(forced.rebuild.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn sessions_without_artifacts_or_markers_are_skipped() {
        let root = layout();
        let only_calls = root.path().join("logs/partial");
        std::fs::create_dir_all(&only_calls).unwrap();
        std::fs::write(only_calls.join(logs::CALL_HISTORY_FILE), "[]").unwrap();
        write_session(
            &root,
            "unmarked",
            json!([]),
            json!([{"type": "say", "say": "text", "text": "hello", "ts": T0}]),
        );
        write_session(
            &root,
            "marker-only",
            json!([]),
            json!([{"type": "say", "say": "text", "text": "see mcp_instructions.md", "ts": T0}]),
        );
        let cfg = BenchConfig::default();

        let report = run_extraction(&cfg, options(&root, false)).await.unwrap();
        assert_eq!(report.sessions, 3);
        assert_eq!(report.records_written, 0);
        let mut reasons: Vec<(String, SkipReason)> = report.skipped.clone();
        reasons.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            reasons,
            vec![
                ("marker-only".to_string(), SkipReason::NoTaskSegments),
                (
                    "partial".to_string(),
                    SkipReason::MissingArtifact(logs::UI_EVENTS_FILE)
                ),
                ("unmarked".to_string(), SkipReason::NoConditionMarker),
            ]
        );
        assert_eq!(report.rebuild.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn malformed_session_is_reported_and_run_continues() {
        let root = layout();
        benchmark_session(&root, "good");
        let bad = root.path().join("logs/bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(logs::CALL_HISTORY_FILE), "{oops").unwrap();
        std::fs::write(bad.join(logs::UI_EVENTS_FILE), "[]").unwrap();
        let cfg = BenchConfig::default();

        let report = run_extraction(&cfg, options(&root, false)).await.unwrap();
        assert_eq!(report.records_written, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("bad:"));
        assert!(report.to_string().contains("1 failure(s)"));
    }

    #[tokio::test]
    async fn missing_roots_are_setup_errors() {
        let root = TempDir::new().unwrap();
        let cfg = BenchConfig::default();
        let err = run_extraction(&cfg, options(&root, false)).await.unwrap_err();
        assert!(matches!(err, SetupError::MissingInputRoot(_)));

        std::fs::create_dir(root.path().join("logs")).unwrap();
        let err = run_extraction(&cfg, options(&root, false)).await.unwrap_err();
        assert!(matches!(err, SetupError::MissingOutputRoot(_)));
    }

    #[test]
    fn rebuild_requires_output_root() {
        let err = rebuild_summary(Path::new("/nonexistent/taskbench")).unwrap_err();
        assert!(matches!(err, SetupError::MissingOutputRoot(_)));
    }

    #[test]
    fn merge_raw_files_dedupes_by_session() {
        let root = layout();
        let out = root.path().join("out");
        let quiet = crate::record::fixtures::record(Condition::Control, 1, "s");
        let mut busy = crate::record::fixtures::record(Condition::Mcp, 1, "s");
        busy.api_calls = 50;
        let batch = root.path().join("batch.json");
        std::fs::write(&batch, serde_json::to_string(&vec![quiet, busy]).unwrap()).unwrap();
        let junk = root.path().join("junk.json");
        std::fs::write(&junk, "not json").unwrap();

        let outcome = merge_raw_files(&out, &[batch, junk.clone()]).unwrap();
        assert_eq!(outcome.merge.appended, 1);
        assert_eq!(outcome.merge.total, 1);
        assert_eq!(outcome.failed, vec![junk.display().to_string()]);

        let summary = RecordStore::new(OutputDir::new(&out)).load_summary().unwrap();
        assert_eq!(summary.entries()[0].record.condition, Condition::Mcp);
    }
}
