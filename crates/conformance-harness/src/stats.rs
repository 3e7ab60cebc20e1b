use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{StreamEvent, truthy};

/// Point-in-time copy of everything a run has aggregated so far.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub thinking_chunks: u64,
    pub text_deltas: u64,
    pub assistant_messages: u64,
    pub tool_calls: u64,
    pub tool_results: u64,
    pub assistant_models: BTreeSet<String>,
    pub tool_call_ids: BTreeSet<String>,
    pub tool_result_ids: BTreeSet<String>,
    pub tool_names: BTreeSet<String>,
    /// Concatenated `text_delta` content in arrival order.
    pub text: String,
    pub chat_chunks: u64,
    pub content_fragments: Vec<String>,
    pub finish_reason: Option<String>,
    pub chat_model: Option<String>,
    pub usage: Option<Value>,
    pub errors: Vec<String>,
}

impl StatsSnapshot {
    /// Tool-result ids that were also seen as tool-call ids.
    pub fn matched_tool_ids(&self) -> BTreeSet<String> {
        self.tool_call_ids
            .intersection(&self.tool_result_ids)
            .cloned()
            .collect()
    }

    /// Chat-completion content fragments joined in arrival order.
    pub fn chat_content(&self) -> String {
        self.content_fragments.concat()
    }
}

/// Shared, append-only counters for one verification run.
///
/// Cloning shares the same underlying state. Every mutation and every snapshot
/// takes the lock once, so readers never see a half-applied event.
#[derive(Clone, Debug, Default)]
pub struct StatsAggregator {
    inner: Arc<Mutex<StatsSnapshot>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies the session-stream routing table. Returns `false` when the event
    /// type is not one the table knows about.
    pub fn record_event(&self, event: &StreamEvent) -> bool {
        let mut stats = self.lock();
        match event.event_type.as_str() {
            "thinking" => {
                if event.has_content() {
                    stats.thinking_chunks += 1;
                }
            }
            "text_delta" => {
                if event.has_content() {
                    stats.text_deltas += 1;
                    if let Some(text) = event.str_field("content") {
                        stats.text.push_str(text);
                    }
                }
            }
            "assistant_message" => {
                stats.assistant_messages += 1;
                if let Some(model) = event.str_field("model").map(str::trim)
                    && !model.is_empty()
                {
                    stats.assistant_models.insert(model.to_string());
                }
            }
            "tool_call" => {
                stats.tool_calls += 1;
                if let Some(id) = &event.correlation_id {
                    stats.tool_call_ids.insert(id.clone());
                }
                if let Some(name) = event.str_field("name").filter(|n| !n.is_empty()) {
                    stats.tool_names.insert(name.to_string());
                }
            }
            "tool_result" => {
                stats.tool_results += 1;
                if let Some(id) = &event.correlation_id {
                    stats.tool_result_ids.insert(id.clone());
                }
            }
            _ => return false,
        }
        true
    }

    /// Records one chat-completion chunk shaped as
    /// `{model, choices: [{delta: {content}, finish_reason}], usage}`.
    pub fn record_chat_chunk(&self, chunk: &Value) {
        let mut stats = self.lock();
        stats.chat_chunks += 1;
        if stats.chat_model.is_none()
            && let Some(model) = chunk.get("model").and_then(Value::as_str)
        {
            stats.chat_model = Some(model.to_string());
        }
        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(content) = choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                {
                    stats.content_fragments.push(content.to_string());
                }
                if let Some(reason) = choice
                    .get("finish_reason")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                {
                    stats.finish_reason = Some(reason.to_string());
                }
            }
        }
        if let Some(usage) = chunk.get("usage").filter(|u| truthy(u)) {
            stats.usage = Some(usage.clone());
        }
    }

    /// Appends to the run's error log.
    pub fn record_error(&self, message: impl Into<String>) {
        self.lock().errors.push(message.into());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.lock().errors.len()
    }
}
