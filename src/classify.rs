//! Text classification rule tables.
//!
//! Every heuristic used to interpret the logs lives here as an ordered table
//! evaluated first-match-wins, so each rule can be audited and tested on its
//! own. The pipeline stages only ask questions of these tables.

use crate::config::{MarkerConfig, ModelSignature};
use crate::logs::UiEvent;
use crate::record::Condition;
use regex::Regex;
use std::sync::LazyLock;

/// Coarse role of a UI event in the metrics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Start of a generic model request.
    GenericCallStart,
    /// Start of a protocol (MCP) server call.
    ProtocolCallStart,
    /// Human-readable conversation content.
    Narrative,
    /// Bookkeeping with no metric value (checkpoints, resumes, finishes).
    Administrative,
}

/// Subtype → class table.
const EVENT_CLASSES: &[(&str, EventClass)] = &[
    ("api_req_started", EventClass::GenericCallStart),
    ("mcp_server_request_started", EventClass::ProtocolCallStart),
    ("use_mcp_server", EventClass::ProtocolCallStart),
    ("text", EventClass::Narrative),
    ("user_feedback", EventClass::Narrative),
    ("completion_result", EventClass::Narrative),
    ("tool", EventClass::Narrative),
    ("command", EventClass::Narrative),
    ("command_output", EventClass::Narrative),
    ("followup", EventClass::Narrative),
    ("mcp_server_response", EventClass::Narrative),
    ("reasoning", EventClass::Narrative),
];

/// Subtypes that can carry a user's instruction.
const INSTRUCTION_SUBTYPES: &[&str] = &["text", "user_feedback"];

/// Subtypes recorded when a session is resumed; never a valid end boundary.
const RESUME_SUBTYPES: &[&str] = &["resume_task", "resume_completed_task"];

pub const COMPLETION_SUBTYPE: &str = "completion_result";

/// Substrings in narrative text that indicate a tool was used.
pub const TOOL_USAGE_SUBSTRINGS: &[&str] = &[
    "use_mcp_tool",
    "access_mcp_resource",
    "execute_command",
    "read_file",
    "write_to_file",
    "replace_in_file",
    "search_files",
    "list_files",
    "list_code_definition_names",
    "browser_action",
];

/// Substrings in assistant call-history content that mark a tool call or result.
pub const TOOL_CALL_MARKERS: &[&str] = &[
    "tool_use",
    "tool_result",
    "use_mcp_tool",
    "access_mcp_resource",
];

/// Why a narrative event was judged to be written by the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorshipRule {
    AssistantOriginator,
    FirstPerson(&'static str),
    ControlSubstring(&'static str),
}

/// First-person openers typical of assistant narration.
const FIRST_PERSON_OPENERS: &[&str] = &[
    "I'll ",
    "I will ",
    "I've ",
    "I have ",
    "I'm ",
    "Let me ",
    "Now I ",
    "Now let me ",
    "Great",
    "Perfect",
    "Based on ",
];

/// Substrings that only appear in tool or control traffic.
const CONTROL_SUBSTRINGS: &[&str] = &[
    "<environment_details>",
    "[TASK RESUMPTION]",
    "api_req",
    "<use_mcp_tool>",
    "<execute_command>",
];

/// Call-history tags that wrap literal user input.
const USER_QUERY_TAGS: &[(&str, &str)] = &[
    ("<task>", "</task>"),
    ("<feedback>", "</feedback>"),
    ("<user_message>", "</user_message>"),
];

static TASK_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btask\s*#?\s*(\d+)\b").unwrap());

static CANONICAL_INSTRUCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcomplete\s+task\s+(\d+)\s+using\s+the\b").unwrap());

pub fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

pub fn event_class(event: &UiEvent) -> EventClass {
    let subtype = event.subtype();
    EVENT_CLASSES
        .iter()
        .find(|(name, _)| *name == subtype)
        .map(|(_, class)| *class)
        .unwrap_or(EventClass::Administrative)
}

pub fn is_instruction_bearing(event: &UiEvent) -> bool {
    INSTRUCTION_SUBTYPES.contains(&event.subtype())
}

pub fn is_resume(event: &UiEvent) -> bool {
    RESUME_SUBTYPES.contains(&event.subtype())
}

pub fn is_completion(event: &UiEvent) -> bool {
    event.subtype() == COMPLETION_SUBTYPE
}

/// First authorship rule that marks this event as assistant-written, if any.
pub fn assistant_authorship(event: &UiEvent) -> Option<AuthorshipRule> {
    if event
        .originator
        .as_deref()
        .is_some_and(|o| o.eq_ignore_ascii_case("assistant"))
    {
        return Some(AuthorshipRule::AssistantOriginator);
    }
    let text = event.text().trim_start();
    if let Some(opener) = FIRST_PERSON_OPENERS.iter().find(|o| text.starts_with(**o)) {
        return Some(AuthorshipRule::FirstPerson(*opener));
    }
    CONTROL_SUBSTRINGS
        .iter()
        .find(|s| text.contains(**s))
        .map(|s| AuthorshipRule::ControlSubstring(*s))
}

/// Task number mentioned in a phrase like `Task 3` or `task #3`.
pub fn task_number(text: &str) -> Option<u32> {
    TASK_NUMBER
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Literal user input wrapped in known call-history tags.
pub fn user_queries(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for (open, close) in USER_QUERY_TAGS {
        let mut rest = text;
        while let Some(start) = rest.find(open) {
            let after = &rest[start + open.len()..];
            let Some(end) = after.find(close) else {
                break;
            };
            out.push(after[..end].trim());
            rest = &after[end + close.len()..];
        }
    }
    out
}

/// Marker-driven rules bound to a configuration.
#[derive(Debug, Clone)]
pub struct Classifier {
    condition_markers: Vec<(Condition, String)>,
    protocol_invocation: String,
    model_signatures: Vec<ModelSignature>,
}

impl Classifier {
    pub fn new(markers: &MarkerConfig, model_signatures: Vec<ModelSignature>) -> Self {
        Self {
            condition_markers: vec![
                (Condition::Mcp, markers.mcp_document.clone()),
                (Condition::Control, markers.control_document.clone()),
            ],
            protocol_invocation: markers.protocol_invocation.clone(),
            model_signatures,
        }
    }

    /// Condition whose marker document the text references, first rule wins.
    pub fn condition_marker(&self, text: &str) -> Option<Condition> {
        self.condition_markers
            .iter()
            .find(|(_, marker)| !marker.is_empty() && text.contains(marker.as_str()))
            .map(|(condition, _)| *condition)
    }

    pub fn references_marker_document(&self, text: &str) -> bool {
        self.condition_marker(text).is_some()
    }

    pub fn is_protocol_invocation(&self, text: &str) -> bool {
        !self.protocol_invocation.is_empty() && text.contains(self.protocol_invocation.as_str())
    }

    /// Task number if the text is a canonical benchmark instruction: it names a
    /// marker document and says `Complete Task N using the ...`.
    pub fn canonical_instruction(&self, text: &str) -> Option<u32> {
        if !self.references_marker_document(text) {
            return None;
        }
        CANONICAL_INSTRUCTION
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Canonical model for the first signature found in `text`.
    pub fn model_signature(&self, text: &str) -> Option<&str> {
        self.model_signatures
            .iter()
            .find(|s| text.contains(s.signature.as_str()))
            .map(|s| s.model.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_model_signatures, MarkerConfig};
    use crate::logs::fixtures::{ask, say};

    fn classifier() -> Classifier {
        Classifier::new(&MarkerConfig::default(), default_model_signatures())
    }

    #[test]
    fn event_classes() {
        assert_eq!(
            event_class(&say("api_req_started", "{}", 1)),
            EventClass::GenericCallStart
        );
        assert_eq!(
            event_class(&say("mcp_server_request_started", "", 1)),
            EventClass::ProtocolCallStart
        );
        assert_eq!(
            event_class(&ask("use_mcp_server", "", 1)),
            EventClass::ProtocolCallStart
        );
        assert_eq!(event_class(&say("text", "hi", 1)), EventClass::Narrative);
        assert_eq!(
            event_class(&say("completion_result", "done", 1)),
            EventClass::Narrative
        );
        assert_eq!(
            event_class(&say("api_req_finished", "", 1)),
            EventClass::Administrative
        );
        assert_eq!(
            event_class(&ask("resume_task", "", 1)),
            EventClass::Administrative
        );
    }

    #[test]
    fn resume_and_instruction_subtypes() {
        assert!(is_resume(&ask("resume_task", "", 1)));
        assert!(is_resume(&ask("resume_completed_task", "", 1)));
        assert!(!is_resume(&say("text", "", 1)));
        assert!(is_instruction_bearing(&say("user_feedback", "", 1)));
        assert!(!is_instruction_bearing(&say("completion_result", "", 1)));
        assert!(is_completion(&say("completion_result", "", 1)));
    }

    #[test]
    fn condition_marker_rules() {
        let c = classifier();
        assert_eq!(
            c.condition_marker("Read mcp_instructions.md first"),
            Some(Condition::Mcp)
        );
        assert_eq!(
            c.condition_marker("See control_instructions.md"),
            Some(Condition::Control)
        );
        assert_eq!(c.condition_marker("nothing here"), None);
    }

    #[test]
    fn protocol_invocation_rule() {
        let c = classifier();
        assert!(c.is_protocol_invocation("<use_mcp_tool><server_name>x</server_name>"));
        assert!(!c.is_protocol_invocation("<read_file>"));
    }

    #[test]
    fn authorship_originator_rule() {
        let mut e = say("text", "Complete Task 1 using the mcp_instructions.md", 1);
        e.originator = Some("assistant".to_string());
        assert_eq!(
            assistant_authorship(&e),
            Some(AuthorshipRule::AssistantOriginator)
        );
    }

    #[test]
    fn authorship_first_person_rule() {
        let e = say("text", "  I'll start by reading the file.", 1);
        assert_eq!(
            assistant_authorship(&e),
            Some(AuthorshipRule::FirstPerson("I'll "))
        );
        let e = say("text", "Let me check the instructions.", 1);
        assert_eq!(
            assistant_authorship(&e),
            Some(AuthorshipRule::FirstPerson("Let me "))
        );
    }

    #[test]
    fn authorship_control_substring_rule() {
        let e = say("text", "[TASK RESUMPTION] continue", 1);
        assert_eq!(
            assistant_authorship(&e),
            Some(AuthorshipRule::ControlSubstring("[TASK RESUMPTION]"))
        );
    }

    #[test]
    fn authorship_user_text_passes() {
        let mut e = say(
            "text",
            "Complete Task 2 using the commands in control_instructions.md",
            1,
        );
        e.originator = Some("user".to_string());
        assert_eq!(assistant_authorship(&e), None);
    }

    #[test]
    fn task_number_phrases() {
        assert_eq!(task_number("Complete Task 3 using the tools"), Some(3));
        assert_eq!(task_number("task #12 please"), Some(12));
        assert_eq!(task_number("TASK 7"), Some(7));
        assert_eq!(task_number("multitasking 5"), None);
        assert_eq!(task_number("no number"), None);
    }

    #[test]
    fn canonical_instruction_requires_marker_and_phrase() {
        let c = classifier();
        assert_eq!(
            c.canonical_instruction("Complete Task 4 using the commands in mcp_instructions.md"),
            Some(4)
        );
        assert_eq!(c.canonical_instruction("Complete Task 4 using the commands"), None);
        assert_eq!(c.canonical_instruction("Do task 4 per mcp_instructions.md"), None);
    }

    #[test]
    fn user_queries_extracts_tag_contents() {
        let text = "<task>\nComplete Task 1 using the x\n</task>\n<feedback>more</feedback><feedback>again</feedback><user_message>unterminated";
        let queries = user_queries(text);
        assert_eq!(queries, vec!["Complete Task 1 using the x", "more", "again"]);
    }

    #[test]
    fn model_signature_first_match() {
        let c = classifier();
        assert_eq!(
            c.model_signature("You are running claude-3-5-haiku today"),
            Some("claude-3-5-haiku-20241022")
        );
        assert_eq!(c.model_signature("no model mentioned"), None);
    }
}
