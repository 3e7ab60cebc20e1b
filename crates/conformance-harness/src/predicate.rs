use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;

/// Tool-name prefixes identifying desktop/browser automation tools.
pub const BROWSER_TOOL_PREFIXES: &[&str] = &[
    "desktop_",
    "playwright_",
    "browser_",
    "mcp__desktop__",
    "mcp__playwright__",
];

/// Decides whether a run has observed the event shape it needs.
///
/// Every policy is a pure function of a snapshot and only looks at counts and
/// sets that grow, so once satisfied it stays satisfied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Thinking, text deltas, two assistant messages and a matched tool call.
    StreamingShape { require_thinking: bool },
    /// An assistant message plus a tool call/result from a named tool family.
    ToolPrefix { required_prefixes: Vec<String> },
    /// A chat-completion stream with content and a finish reason.
    ChatCompletion,
}

impl CompletionPolicy {
    pub fn streaming_shape(require_thinking: bool) -> Self {
        Self::StreamingShape { require_thinking }
    }

    pub fn tool_prefix<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ToolPrefix {
            required_prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Tool-prefix policy over [`BROWSER_TOOL_PREFIXES`].
    pub fn browser_tools() -> Self {
        Self::tool_prefix(BROWSER_TOOL_PREFIXES.iter().copied())
    }

    pub fn is_satisfied(&self, snapshot: &StatsSnapshot) -> bool {
        self.unmet(snapshot).is_empty()
    }

    /// Human-readable description of every condition that does not hold yet.
    pub fn unmet(&self, s: &StatsSnapshot) -> Vec<String> {
        let mut unmet = Vec::new();
        match self {
            Self::StreamingShape { require_thinking } => {
                if s.assistant_messages < 2 {
                    unmet.push(format!("expected >= 2 assistant messages, saw {}", s.assistant_messages));
                }
                if s.text_deltas < 1 {
                    unmet.push("no text_delta events".to_string());
                }
                if *require_thinking && s.thinking_chunks < 1 {
                    unmet.push("no thinking events".to_string());
                }
                if s.tool_calls < 1 {
                    unmet.push("no tool_call events".to_string());
                }
                if s.tool_results < 1 {
                    unmet.push("no tool_result events".to_string());
                }
                if s.matched_tool_ids().is_empty() {
                    unmet.push("no tool_result matched a tool_call id".to_string());
                }
            }
            Self::ToolPrefix { required_prefixes } => {
                if s.assistant_messages < 1 {
                    unmet.push("no assistant_message events".to_string());
                }
                if s.tool_calls < 1 {
                    unmet.push("no tool_call events".to_string());
                }
                if s.tool_results < 1 {
                    unmet.push("no tool_result events".to_string());
                }
                let saw_required = s.tool_names.iter().any(|name| {
                    required_prefixes
                        .iter()
                        .any(|prefix| name.starts_with(prefix.as_str()))
                });
                if !saw_required {
                    unmet.push(format!(
                        "no tool name matched prefixes [{}]",
                        required_prefixes.join(", ")
                    ));
                }
            }
            Self::ChatCompletion => {
                if s.chat_chunks < 1 {
                    unmet.push("no chat-completion chunks".to_string());
                }
                if s.content_fragments.is_empty() {
                    unmet.push("no non-empty content deltas".to_string());
                }
                if s.finish_reason.is_none() {
                    unmet.push("no finish_reason".to_string());
                }
            }
        }
        unmet
    }
}
