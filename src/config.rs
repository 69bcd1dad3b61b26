use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from taskbench.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BenchConfig {
    pub paths: PathsConfig,
    pub markers: MarkerConfig,
    pub window: WindowConfig,
    pub defaults: DefaultsConfig,
    pub rates: RatesConfig,
    pub models: Vec<ModelSignature>,
    pub extract: ExtractConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub logs_root: PathBuf,
    pub output_dir: PathBuf,
}

/// Identifying substrings for the two experimental conditions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub control_document: String,
    pub mcp_document: String,
    pub protocol_invocation: String,
}

/// Padding around a segment when pulling in call-history entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub lead_secs: u64,
    pub trail_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub model: String,
    pub client: String,
    pub server: String,
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub models: Vec<ModelRate>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelRate {
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// A system-prompt substring that identifies which model served a session.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelSignature {
    pub signature: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub max_parallel: usize,
}

impl RatesConfig {
    /// Per-million (input, output) rates for a model, falling back to the defaults.
    pub fn for_model(&self, model: &str) -> (f64, f64) {
        self.models
            .iter()
            .find(|r| r.model == model)
            .map(|r| (r.input_per_million, r.output_per_million))
            .unwrap_or((self.input_per_million, self.output_per_million))
    }
}

/// Load configuration from `path`, or defaults if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<BenchConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(BenchConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

// --- Default implementations ---

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_root: PathBuf::from("logs"),
            output_dir: PathBuf::from("results"),
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            control_document: "control_instructions.md".to_string(),
            mcp_document: "mcp_instructions.md".to_string(),
            protocol_invocation: "use_mcp_tool".to_string(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            lead_secs: 60,
            trail_secs: 300,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-7-sonnet-20250219".to_string(),
            client: "cline".to_string(),
            server: "none".to_string(),
            success: true,
        }
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            models: vec![
                ModelRate {
                    model: "claude-3-5-haiku-20241022".to_string(),
                    input_per_million: 0.8,
                    output_per_million: 4.0,
                },
                ModelRate {
                    model: "claude-3-opus-20240229".to_string(),
                    input_per_million: 15.0,
                    output_per_million: 75.0,
                },
            ],
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

/// Built-in signature table, most specific first.
pub fn default_model_signatures() -> Vec<ModelSignature> {
    [
        ("claude-3-7-sonnet", "claude-3-7-sonnet-20250219"),
        ("Claude 3.7 Sonnet", "claude-3-7-sonnet-20250219"),
        ("claude-3-5-sonnet", "claude-3-5-sonnet-20241022"),
        ("Claude 3.5 Sonnet", "claude-3-5-sonnet-20241022"),
        ("claude-3-5-haiku", "claude-3-5-haiku-20241022"),
        ("Claude 3.5 Haiku", "claude-3-5-haiku-20241022"),
        ("claude-3-opus", "claude-3-opus-20240229"),
        ("Claude 3 Opus", "claude-3-opus-20240229"),
    ]
    .into_iter()
    .map(|(signature, model)| ModelSignature {
        signature: signature.to_string(),
        model: model.to_string(),
    })
    .collect()
}

impl BenchConfig {
    /// Signature table in effect: configured entries, or the built-ins when none are set.
    pub fn model_signatures(&self) -> Vec<ModelSignature> {
        if self.models.is_empty() {
            default_model_signatures()
        } else {
            self.models.clone()
        }
    }
}
