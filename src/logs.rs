/// Read-only view of one session's two log artifacts: the call history sent
/// to the model and the UI event stream shown to the user.
///
/// Both artifacts are JSON arrays written by the agent tool. Either may be
/// stored zstd-compressed as `<name>.zst`.
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const CALL_HISTORY_FILE: &str = "api_conversation_history.json";
pub const UI_EVENTS_FILE: &str = "ui_messages.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

/// One typed block of a call-history message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub text: Option<String>,
    pub name: Option<String>,
}

/// Provider usage block attached to a call-history entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// One message of the structured call history.
#[derive(Debug, Clone, Deserialize)]
pub struct CallEntry {
    pub role: Role,
    #[serde(default, deserialize_with = "content_blocks")]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// One entry of the UI event stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UiEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub say: Option<String>,
    pub ask: Option<String>,
    #[serde(rename = "from")]
    pub originator: Option<String>,
    pub text: Option<String>,
    #[serde(rename = "ts")]
    pub raw_ts: Option<Value>,
    /// Kept raw: the agent writes `-1` before any call history exists.
    #[serde(rename = "conversationHistoryIndex")]
    pub raw_history_index: Option<Value>,
}

/// Both artifacts of one session, loaded into memory.
#[derive(Debug, Clone, Default)]
pub struct SessionLogs {
    pub session_id: String,
    pub calls: Vec<CallEntry>,
    pub events: Vec<UiEvent>,
}

/// Accepts either a plain string or an array of blocks.
fn content_blocks<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Content {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    Ok(match Option::<Content>::deserialize(deserializer)? {
        Some(Content::Text(text)) => vec![ContentBlock {
            kind: "text".to_string(),
            text: Some(text),
            name: None,
        }],
        Some(Content::Blocks(blocks)) => blocks,
        None => Vec::new(),
    })
}

impl CallEntry {
    /// All block types, names and texts joined into one searchable string.
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            out.push_str(&block.kind);
            out.push('\n');
            if let Some(name) = &block.name {
                out.push_str(name);
                out.push('\n');
            }
            if let Some(text) = &block.text {
                out.push_str(text);
                out.push('\n');
            }
        }
        out
    }

    /// Iterate the text payloads of this entry.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| b.text.as_deref())
    }

    /// Epoch milliseconds recovered from an environment block carrying the
    /// current time. Entries without one have no timestamp.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.texts()
            .filter(|t| t.contains("environment_details") && t.contains("Current Time"))
            .find_map(parse_current_time)
    }
}

impl UiEvent {
    /// The `say` or `ask` discriminator.
    pub fn subtype(&self) -> &str {
        let (primary, fallback) = if self.kind == "ask" {
            (&self.ask, &self.say)
        } else {
            (&self.say, &self.ask)
        };
        primary
            .as_deref()
            .or(fallback.as_deref())
            .unwrap_or_default()
    }

    /// Call-history position; negative or non-numeric values count as absent.
    pub fn history_index(&self) -> Option<u64> {
        self.raw_history_index.as_ref()?.as_u64()
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    /// Event time in epoch milliseconds; non-numeric values count as absent.
    pub fn timestamp(&self) -> Option<i64> {
        match self.raw_ts.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }
}

static CURRENT_TIME_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\s*Current Time\s*\r?\n\s*([^\r\n]+)").unwrap());

static LOCAL_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{1,2}/\d{1,2}/\d{4}),?\s+(\d{1,2}:\d{2}:\d{2})\s*([AaPp][Mm])(?:.*?UTC\s*([+-])(\d{1,2})(?::(\d{2}))?)?",
    )
    .unwrap()
});

/// Parse the line following `# Current Time` into epoch milliseconds.
///
/// Accepts the agent's locale rendering, e.g.
/// `3/19/2025, 2:35:14 PM (America/Los_Angeles, UTC-7:00)`, or RFC 3339.
/// A local rendering without a UTC offset is taken as UTC.
fn parse_current_time(text: &str) -> Option<i64> {
    let line = CURRENT_TIME_LINE.captures(text)?.get(1)?.as_str().trim();

    if let Some(caps) = LOCAL_TIME.captures(line) {
        let stamp = format!(
            "{} {} {}",
            &caps[1],
            &caps[2],
            caps[3].to_ascii_uppercase()
        );
        let naive = NaiveDateTime::parse_from_str(&stamp, "%m/%d/%Y %I:%M:%S %p").ok()?;
        let offset_secs = match (caps.get(4), caps.get(5)) {
            (Some(sign), Some(hours)) => {
                let hours: i32 = hours.as_str().parse().ok()?;
                let minutes: i32 = caps
                    .get(6)
                    .map(|m| m.as_str().parse().unwrap_or(0))
                    .unwrap_or(0);
                let secs = hours * 3600 + minutes * 60;
                if sign.as_str() == "-" {
                    -secs
                } else {
                    secs
                }
            }
            _ => 0,
        };
        let offset = FixedOffset::east_opt(offset_secs)?;
        return offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp_millis());
    }

    let token = line.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// Locate an artifact in a session directory, preferring the plain file over
/// its compressed form.
pub fn find_artifact(session_dir: &Path, name: &str) -> Option<PathBuf> {
    let plain = session_dir.join(name);
    if plain.is_file() {
        return Some(plain);
    }
    let compressed = session_dir.join(format!("{name}.zst"));
    compressed.is_file().then_some(compressed)
}

fn read_artifact<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, LogError> {
    let bytes = std::fs::read(path).map_err(|e| LogError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let bytes = if path.extension().is_some_and(|ext| ext == "zst") {
        zstd::decode_all(bytes.as_slice()).map_err(|e| LogError::Io {
            path: path.to_path_buf(),
            source: e,
        })?
    } else {
        bytes
    };
    serde_json::from_slice(&bytes).map_err(|e| LogError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl SessionLogs {
    /// Load both artifacts from explicit paths.
    pub fn load(
        session_id: impl Into<String>,
        call_history: &Path,
        ui_events: &Path,
    ) -> Result<Self, LogError> {
        let calls = read_artifact(call_history)?;
        let events = read_artifact(ui_events)?;
        Ok(Self {
            session_id: session_id.into(),
            calls,
            events,
        })
    }
}

/// List candidate session directories under `root`, sorted by name.
pub fn discover_sessions(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[derive(Debug)]
pub enum LogError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            LogError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Io { source, .. } => Some(source),
            LogError::Parse { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
pub mod fixtures {
    //! Builders shared by the pipeline tests.
    use super::*;

    pub fn say(subtype: &str, text: &str, ts: i64) -> UiEvent {
        UiEvent {
            kind: "say".to_string(),
            say: Some(subtype.to_string()),
            text: Some(text.to_string()),
            raw_ts: Some(Value::from(ts)),
            ..Default::default()
        }
    }

    pub fn ask(subtype: &str, text: &str, ts: i64) -> UiEvent {
        UiEvent {
            kind: "ask".to_string(),
            ask: Some(subtype.to_string()),
            text: Some(text.to_string()),
            raw_ts: Some(Value::from(ts)),
            ..Default::default()
        }
    }

    /// An environment block stamping `ts_ms` as an RFC 3339 current time.
    pub fn env_block(ts_ms: i64) -> String {
        let dt = Utc.timestamp_millis_opt(ts_ms).unwrap();
        format!(
            "<environment_details>\n# Current Time\n{}\n</environment_details>",
            dt.to_rfc3339()
        )
    }

    pub fn call(role: Role, text: &str) -> CallEntry {
        CallEntry {
            role,
            content: vec![ContentBlock {
                kind: "text".to_string(),
                text: Some(text.to_string()),
                name: None,
            }],
            usage: None,
            cost: None,
        }
    }

    /// A call entry with a text block followed by an environment block at `ts_ms`.
    pub fn timed_call(role: Role, text: &str, ts_ms: i64) -> CallEntry {
        let mut entry = call(role, text);
        entry.content.push(ContentBlock {
            kind: "text".to_string(),
            text: Some(env_block(ts_ms)),
            name: None,
        });
        entry
    }
}
