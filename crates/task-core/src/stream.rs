//! Parsing of the agent's line-delimited output.
//!
//! The agent writes one JSON object per line (`--output-format stream-json`).
//! Each line parses into zero or more [`StreamLine`]s; anything that is not a
//! recognised event falls back to [`StreamLine::Unrecognized`] carrying the raw
//! text.

use crate::types::OutputKind;
use serde::Deserialize;
use serde_json::Value;

/// Maximum characters of a tool argument shown in a summary.
const SUMMARY_ARG_MAX: usize = 120;

/// One parsed item of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    AssistantText(String),
    ToolUse { tool: String, summary: String },
    SessionInit {
        session_id: Option<String>,
        model: Option<String>,
    },
    Result { is_error: bool, text: Option<String> },
    Unrecognized(String),
}

impl StreamLine {
    /// Output kind and display text for this line.
    pub fn render(&self) -> (OutputKind, String) {
        match self {
            Self::AssistantText(text) => (OutputKind::Text, text.clone()),
            Self::ToolUse { summary, .. } => (OutputKind::Tool, summary.clone()),
            Self::SessionInit { model, .. } => (
                OutputKind::System,
                match model {
                    Some(model) => format!("session started ({model})"),
                    None => "session started".to_string(),
                },
            ),
            Self::Result { is_error: true, text } => (
                OutputKind::System,
                format!("agent reported an error: {}", text.as_deref().unwrap_or("no detail")),
            ),
            Self::Result { is_error: false, .. } => (OutputKind::System, "agent finished".to_string()),
            Self::Unrecognized(raw) => (OutputKind::Text, raw.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: RawMessage,
    },
    /// Tool results echoed back to the agent.
    User,
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
    /// Streaming delta form of assistant text.
    ContentBlockDelta {
        delta: RawDelta,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContent {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Parse a single output line.
///
/// Blank lines and events with nothing to show (tool results, non-text
/// deltas) produce an empty vector.
pub fn parse_line(line: &str) -> Vec<StreamLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let Ok(event) = serde_json::from_str::<RawEvent>(trimmed) else {
        return vec![StreamLine::Unrecognized(trimmed.to_string())];
    };

    match event {
        RawEvent::System {
            subtype,
            session_id,
            model,
        } => {
            if subtype.as_deref() == Some("init") {
                vec![StreamLine::SessionInit { session_id, model }]
            } else {
                Vec::new()
            }
        }
        RawEvent::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(|content| match content {
                RawContent::Text { text } if !text.trim().is_empty() => {
                    Some(StreamLine::AssistantText(text))
                }
                RawContent::ToolUse { name, input } => {
                    let summary = summarize_tool(&name, &input);
                    Some(StreamLine::ToolUse {
                        tool: name,
                        summary,
                    })
                }
                _ => None,
            })
            .collect(),
        RawEvent::User => Vec::new(),
        RawEvent::Result { is_error, result } => vec![StreamLine::Result {
            is_error,
            text: result,
        }],
        RawEvent::ContentBlockDelta {
            delta: RawDelta::TextDelta { text },
        } => vec![StreamLine::AssistantText(text)],
        RawEvent::ContentBlockDelta { .. } => Vec::new(),
        RawEvent::Other => vec![StreamLine::Unrecognized(trimmed.to_string())],
    }
}

/// Short human-readable summary of a tool invocation.
pub fn summarize_tool(name: &str, input: &Value) -> String {
    let arg = |key: &str| {
        input
            .get(key)
            .and_then(Value::as_str)
            .map(|s| truncate_str(s.lines().next().unwrap_or(""), SUMMARY_ARG_MAX))
    };

    let described = match name {
        "Read" => arg("file_path").map(|p| format!("reading file {p}")),
        "Write" => arg("file_path").map(|p| format!("writing file {p}")),
        "Edit" | "MultiEdit" => arg("file_path").map(|p| format!("editing file {p}")),
        "NotebookEdit" => arg("notebook_path").map(|p| format!("editing notebook {p}")),
        "Bash" => arg("command").map(|c| format!("running command {c}")),
        "Grep" => arg("pattern").map(|p| format!("searching for {p}")),
        "Glob" => arg("pattern").map(|p| format!("finding files {p}")),
        "LS" => arg("path").map(|p| format!("listing {p}")),
        "WebFetch" => arg("url").map(|u| format!("fetching {u}")),
        "WebSearch" => arg("query").map(|q| format!("searching the web for {q}")),
        "Task" => arg("description").map(|d| format!("delegating: {d}")),
        "TodoWrite" => Some("updating todo list".to_string()),
        _ => None,
    };

    described.unwrap_or_else(|| format!("using tool {name}"))
}

fn truncate_str(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_session_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude-sonnet-4","tools":[]}"#;
        assert_eq!(
            parse_line(line),
            vec![StreamLine::SessionInit {
                session_id: Some("abc".to_string()),
                model: Some("claude-sonnet-4".to_string()),
            }]
        );
    }

    #[test]
    fn assistant_message_yields_text_and_tools_in_order() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the code"},{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"src/main.rs"}}]}}"#;
        assert_eq!(
            parse_line(line),
            vec![
                StreamLine::AssistantText("Looking at the code".to_string()),
                StreamLine::ToolUse {
                    tool: "Read".to_string(),
                    summary: "reading file src/main.rs".to_string(),
                },
            ]
        );
    }

    #[test]
    fn tool_results_are_silent() {
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"fn main() {}"}]}}"#;
        assert!(parse_line(line).is_empty());
    }

    #[test]
    fn parses_result() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"Done."}"#;
        assert_eq!(
            parse_line(line),
            vec![StreamLine::Result {
                is_error: false,
                text: Some("Done.".to_string()),
            }]
        );
    }

    #[test]
    fn text_deltas_are_assistant_text() {
        let line = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        assert_eq!(parse_line(line), vec![StreamLine::AssistantText("Hello".to_string())]);
        let json_delta = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#;
        assert!(parse_line(json_delta).is_empty());
    }

    #[test]
    fn plain_text_falls_back_to_unrecognized() {
        assert_eq!(
            parse_line("compiling foo v0.1.0\n"),
            vec![StreamLine::Unrecognized("compiling foo v0.1.0".to_string())]
        );
        assert_eq!(
            parse_line(r#"{"type":"telemetry","x":1}"#),
            vec![StreamLine::Unrecognized(r#"{"type":"telemetry","x":1}"#.to_string())]
        );
        assert!(parse_line("   ").is_empty());
    }

    #[test]
    fn summaries_cover_common_tools() {
        assert_eq!(
            summarize_tool("Bash", &json!({"command": "cargo test\necho done"})),
            "running command cargo test"
        );
        assert_eq!(
            summarize_tool("Grep", &json!({"pattern": "fn main"})),
            "searching for fn main"
        );
        assert_eq!(summarize_tool("Mystery", &json!({})), "using tool Mystery");
        assert_eq!(summarize_tool("Read", &json!({})), "using tool Read");
    }

    #[test]
    fn long_arguments_are_truncated() {
        let long = "x".repeat(500);
        let summary = summarize_tool("Bash", &json!({ "command": long }));
        assert!(summary.ends_with("..."));
        assert!(summary.len() < 200);
    }

    #[test]
    fn render_error_result() {
        let (kind, text) = StreamLine::Result {
            is_error: true,
            text: Some("rate limited".to_string()),
        }
        .render();
        assert_eq!(kind, OutputKind::System);
        assert!(text.contains("rate limited"));
    }
}
