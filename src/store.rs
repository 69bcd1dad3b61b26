/// Durable record artifacts and the aggregate summary.
///
/// Each record is written atomically to its own keyed file, so concurrent
/// sessions never touch the same path. The summary is rebuilt from whatever
/// record files are readable; corrupt ones are reported, not fatal.
use crate::data_dir::OutputDir;
use crate::record::{Condition, MetricRecord, SummaryCollection, SummaryEntry};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Outcome of a summary rebuild.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// Entries written to the summary.
    pub entries: usize,
    /// Filenames that could not be read or parsed.
    pub failed: Vec<String>,
}

/// Outcome of merging records into the summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub replaced: usize,
    pub appended: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: OutputDir,
}

impl RecordStore {
    pub fn new(dir: OutputDir) -> Self {
        Self { dir }
    }

    /// Whether a record for `(condition, task_id)` exists, for one session or any.
    pub fn exists_record(
        &self,
        condition: Condition,
        task_id: u32,
        session_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let raw = OutputDir::record_pattern(condition, task_id, session_id);
        let pattern = glob::Pattern::new(&raw).map_err(|e| StoreError::Pattern {
            pattern: raw.clone(),
            source: e,
        })?;
        Ok(self
            .file_names()?
            .iter()
            .any(|name| pattern.matches(name)))
    }

    /// Persist one record under its key, replacing any previous version.
    pub fn write_record(&self, record: &MetricRecord) -> Result<PathBuf, StoreError> {
        let path = self
            .dir
            .record_file(record.condition, record.task_id, &record.session_id);
        let json = serde_json::to_string_pretty(record).map_err(|e| StoreError::Serialize {
            path: path.clone(),
            source: e,
        })?;
        write_atomic(&path, json.as_bytes())?;
        tracing::info!(
            path = %path.display(),
            condition = %record.condition,
            task = record.task_id,
            session = %record.session_id,
            "record written"
        );
        Ok(path)
    }

    /// Record artifact paths, sorted by filename.
    pub fn record_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        let pattern = glob::Pattern::new(OutputDir::all_records_pattern()).map_err(|e| {
            StoreError::Pattern {
                pattern: OutputDir::all_records_pattern().to_string(),
                source: e,
            }
        })?;
        let mut names: Vec<String> = self
            .file_names()?
            .into_iter()
            .filter(|n| n != OutputDir::SUMMARY_FILE && pattern.matches(n))
            .collect();
        names.sort();
        Ok(names.into_iter().map(|n| self.dir.root().join(n)).collect())
    }

    pub fn read_record(path: &Path) -> Result<MetricRecord, StoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&contents).map_err(|e| StoreError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Rebuild `summary.json` from every persisted record.
    pub fn rebuild_summary(&self) -> Result<RebuildReport, StoreError> {
        let mut records = Vec::new();
        let mut failed = Vec::new();

        for path in self.record_files()? {
            match Self::read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable record");
                    failed.push(
                        path.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.display().to_string()),
                    );
                }
            }
        }

        let summary = SummaryCollection::from_records(records);
        self.write_summary(&summary)?;
        tracing::info!(
            entries = summary.len(),
            failed = failed.len(),
            path = %self.dir.summary().display(),
            "summary rebuilt"
        );
        Ok(RebuildReport {
            entries: summary.len(),
            failed,
        })
    }

    /// Current summary, or an empty one if none has been written.
    pub fn load_summary(&self) -> Result<SummaryCollection, StoreError> {
        let path = self.dir.summary();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SummaryCollection::default())
            }
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };
        let entries: Vec<SummaryEntry> =
            serde_json::from_str(&contents).map_err(|e| StoreError::Parse { path, source: e })?;
        Ok(SummaryCollection::from_entries(entries))
    }

    pub fn write_summary(&self, summary: &SummaryCollection) -> Result<(), StoreError> {
        let path = self.dir.summary();
        let json =
            serde_json::to_string_pretty(summary.entries()).map_err(|e| StoreError::Serialize {
                path: path.clone(),
                source: e,
            })?;
        write_atomic(&path, json.as_bytes())
    }

    /// Merge records into the existing summary, replacing entries that share
    /// (condition, taskId, startTime).
    pub fn merge_or_replace(
        &self,
        records: impl IntoIterator<Item = MetricRecord>,
    ) -> Result<MergeReport, StoreError> {
        let mut summary = self.load_summary()?;
        let (replaced, appended) = summary.merge_or_replace(records);
        self.write_summary(&summary)?;
        tracing::info!(replaced, appended, total = summary.len(), "summary merged");
        Ok(MergeReport {
            replaced,
            appended,
            total: summary.len(),
        })
    }

    fn file_names(&self) -> Result<Vec<String>, StoreError> {
        let root = self.dir.root();
        let entries = std::fs::read_dir(root).map_err(|e| StoreError::Io {
            path: root.to_path_buf(),
            source: e,
        })?;
        Ok(entries
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect())
    }
}

/// Write to a temporary file in the same directory, then rename over `path`,
/// so readers never see a partial artifact.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[derive(Debug)]
pub enum StoreError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            StoreError::Serialize { path, source } => {
                write!(f, "failed to serialize {}: {}", path.display(), source)
            }
            StoreError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            StoreError::Pattern { pattern, source } => {
                write!(f, "invalid filename pattern {pattern}: {source}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Serialize { source, .. } => Some(source),
            StoreError::Parse { source, .. } => Some(source),
            StoreError::Pattern { source, .. } => Some(source),
        }
    }
}
