use std::time::Duration;

use chrono::Utc;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::connection::{HttpStreamConnector, LineStream, StreamConnector as _};
use crate::errors::HarnessError;
use crate::event::truthy;
use crate::frame::{EventFrameParser, SseFrame};
use crate::orchestrator::{RunReport, Verdict};
use crate::predicate::CompletionPolicy;
use crate::stats::{StatsAggregator, StatsSnapshot};

const STREAMING_PROMPT: &str =
    "Reply with exactly: 'Hello, I am a language model.' and nothing else.";
const NON_STREAMING_PROMPT: &str = "Reply with exactly: 'OK' and nothing else.";
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);
/// Terminal sentinel payload of a chat-completion stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Request body for `/v1/chat/completions`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_tokens: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatRequest {
    pub fn user(model: impl Into<String>, prompt: impl Into<String>, stream: bool, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.into(),
            }],
            stream,
            max_tokens,
        }
    }
}

/// The parts of a non-streaming response the probe looks at.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<Value>,
    pub error: Option<String>,
}

impl ChatCompletion {
    pub fn from_response(body: &Value) -> Self {
        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            content,
            model: body.get("model").and_then(Value::as_str).map(ToOwned::to_owned),
            usage: body.get("usage").cloned(),
            error: body.get("error").filter(|e| truthy(e)).map(describe_error),
        }
    }
}

/// Whether `model` is listed, directly or under a `prefix/*` wildcard entry.
pub fn model_available(models: &[String], model: &str) -> bool {
    models.iter().any(|listed| {
        listed == model
            || (listed.contains('*') && model.starts_with(listed.trim_end_matches(['/', '*'])))
    })
}

/// Smoke probe for an OpenAI-compatible chat-completion proxy.
pub struct ChatProbe {
    config: ChatConfig,
    client: reqwest::Client,
}

impl ChatProbe {
    pub fn new(config: ChatConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Model ids from `GET /v1/models`.
    pub async fn list_models(&self) -> Result<Vec<String>, HarnessError> {
        let url = self.config.models_url();
        let body = self
            .send_json(self.client.get(&url).timeout(MODELS_TIMEOUT), &url)
            .await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Model listing, streaming completion and, when enabled, a
    /// non-streaming completion.
    pub async fn run(&self) -> RunReport {
        let mut report = RunReport::default();
        report.push(self.check_models().await);
        report.push(self.run_streaming().await);
        if self.config.non_streaming {
            report.push(self.run_non_streaming().await);
        }
        report
    }

    async fn check_models(&self) -> Verdict {
        let started = Instant::now();
        let started_at = Utc::now();
        let reasons = match self.list_models().await {
            Ok(models) => {
                info!(event = "chat.models", domain = "chat", count = models.len() as u64, models = ?models);
                if models.is_empty() {
                    warn!(event = "chat.models_empty", domain = "chat", "no model chains configured");
                } else if !model_available(&models, &self.config.model) {
                    warn!(event = "chat.model_missing", domain = "chat", model = %self.config.model);
                }
                Vec::new()
            }
            Err(err) => vec![format!("failed to list models: {err}")],
        };
        Verdict::new(
            &self.config.model,
            "proxy-models",
            started_at,
            started.elapsed(),
            StatsSnapshot::default(),
            reasons,
        )
    }

    /// Streams one completion and checks its shape. The whole stream is
    /// bounded by the configured timeout.
    pub async fn run_streaming(&self) -> Verdict {
        let started = Instant::now();
        let started_at = Utc::now();
        let deadline = started + self.config.timeout;
        let stats = StatsAggregator::new();
        let request = ChatRequest::user(&self.config.model, STREAMING_PROMPT, true, 50);

        let opened = match self.streaming_connector(&request) {
            Ok(connector) => connector.open(self.config.timeout).await,
            Err(err) => Err(err),
        };
        match opened {
            Ok(lines) => consume_chat_stream(lines, &stats, deadline).await,
            Err(err) => stats.record_error(err.to_string()),
        }

        let snapshot = stats.snapshot();
        let mut reasons = CompletionPolicy::ChatCompletion.unmet(&snapshot);
        if !snapshot.errors.is_empty() {
            reasons.push(format!("stream reported {} error(s)", snapshot.errors.len()));
            reasons.extend(snapshot.errors.iter().take(5).map(|e| format!("error: {e}")));
        }
        info!(
            event = "chat.streaming_finished",
            domain = "chat",
            chunks = snapshot.chat_chunks,
            content_len = snapshot.chat_content().len() as u64,
            finish_reason = ?snapshot.finish_reason,
            model = ?snapshot.chat_model,
            errors = snapshot.errors.len() as u64
        );
        Verdict::new(
            &self.config.model,
            "proxy-streaming",
            started_at,
            started.elapsed(),
            snapshot,
            reasons,
        )
    }

    /// One non-streaming completion; passes when it has content and no error.
    pub async fn run_non_streaming(&self) -> Verdict {
        let started = Instant::now();
        let started_at = Utc::now();
        let url = self.config.completions_url();
        let request = self
            .client
            .post(&url)
            .timeout(self.config.timeout)
            .json(&ChatRequest::user(&self.config.model, NON_STREAMING_PROMPT, false, 10));

        let mut snapshot = StatsSnapshot::default();
        let mut reasons = Vec::new();
        match self.send_json(request, &url).await {
            Ok(body) => {
                let completion = ChatCompletion::from_response(&body);
                info!(
                    event = "chat.non_streaming_finished",
                    domain = "chat",
                    content_len = completion.content.len() as u64,
                    model = ?completion.model
                );
                if completion.content.is_empty() {
                    reasons.push("completion content was empty".to_string());
                } else {
                    snapshot.content_fragments.push(completion.content);
                }
                if let Some(error) = completion.error {
                    let message = format!("API error: {error}");
                    snapshot.errors.push(message.clone());
                    reasons.push(message);
                }
                snapshot.chat_model = completion.model;
                snapshot.usage = completion.usage;
            }
            Err(err) => {
                snapshot.errors.push(err.to_string());
                reasons.push(format!("request failed: {err}"));
            }
        }
        Verdict::new(
            &self.config.model,
            "proxy-non-streaming",
            started_at,
            started.elapsed(),
            snapshot,
            reasons,
        )
    }

    fn streaming_connector(&self, request: &ChatRequest) -> Result<HttpStreamConnector, HarnessError> {
        let body = serde_json::to_value(request)
            .map_err(|e| HarnessError::Validation(format!("unserializable chat request: {e}")))?;
        Ok(HttpStreamConnector::with_client(
            self.client.clone(),
            self.config.completions_url(),
            &self.config.proxy_secret,
        )?
        .json_body(body))
    }

    async fn send_json(&self, request: reqwest::RequestBuilder, url: &str) -> Result<Value, HarnessError> {
        let response = request
            .bearer_auth(&self.config.proxy_secret)
            .send()
            .await
            .map_err(|e| HarnessError::http(url, None, e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| HarnessError::http(url, Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            return Err(HarnessError::http(
                url,
                Some(status.as_u16()),
                format!("HTTP {status}: {text}"),
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&text)
            .map_err(|e| HarnessError::http(url, Some(status.as_u16()), format!("invalid JSON response: {e}")))
    }
}

async fn consume_chat_stream(mut lines: LineStream, stats: &StatsAggregator, deadline: Instant) {
    let mut parser = EventFrameParser::new();
    loop {
        match tokio::time::timeout_at(deadline, lines.next()).await {
            Err(_) => {
                debug!(event = "chat.stream_deadline", domain = "chat");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                stats.record_error(err.to_string());
                break;
            }
            Ok(Some(Ok(line))) => {
                if let Some(frame) = parser.push_line(&line) {
                    record_chat_frame(stats, &frame);
                }
            }
        }
    }
}

/// Applies one chat-completion frame to `stats`.
pub fn record_chat_frame(stats: &StatsAggregator, frame: &SseFrame) {
    if frame.data == DONE_SENTINEL {
        return;
    }
    let payload: Value = match serde_json::from_str(&frame.data) {
        Ok(payload) => payload,
        Err(_) => {
            let preview: String = frame.data.chars().take(100).collect();
            stats.record_error(format!("Invalid JSON: {preview}"));
            return;
        }
    };
    if let Some(error) = payload.get("error").filter(|e| truthy(e)) {
        stats.record_error(format!("API error: {}", describe_error(error)));
        return;
    }
    debug!(event = "chat.chunk", domain = "chat", data = %frame.data);
    stats.record_chat_chunk(&payload);
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubRoute, StubServer};
    use serde_json::json;

    fn chunk(content: &str, finish: Option<&str>) -> String {
        let payload = json!({
            "model": "smart-chain",
            "choices": [{"delta": {"content": content}, "finish_reason": finish}],
        });
        format!("event: message\ndata: {payload}\n\n")
    }

    fn probe(server: &StubServer) -> ChatProbe {
        ChatProbe::new(ChatConfig::new(server.base_url(), "secret").timeout(Duration::from_secs(5)))
            .expect("probe")
    }

    #[test]
    fn wildcard_entries_cover_prefixed_models() {
        let models = vec!["builtin/smart".to_string(), "openrouter/*".to_string()];
        assert!(model_available(&models, "builtin/smart"));
        assert!(model_available(&models, "openrouter/gpt-5"));
        assert!(!model_available(&models, "builtin/fast"));
        assert!(!model_available(&[], "builtin/smart"));
    }

    #[test]
    fn chat_frames_skip_done_and_log_bad_payloads() {
        let stats = StatsAggregator::new();
        let frame = |data: &str| SseFrame {
            event: "message".into(),
            data: data.into(),
        };
        record_chat_frame(&stats, &frame("[DONE]"));
        record_chat_frame(&stats, &frame(&"x".repeat(150)));
        record_chat_frame(&stats, &frame(r#"{"error":"rate limited"}"#));
        record_chat_frame(&stats, &frame(r#"{"error":{"code":429}}"#));
        let snap = stats.snapshot();
        assert_eq!(snap.chat_chunks, 0);
        assert_eq!(snap.errors[0], format!("Invalid JSON: {}", "x".repeat(100)));
        assert_eq!(snap.errors[1], "API error: rate limited");
        assert_eq!(snap.errors[2], r#"API error: {"code":429}"#);
    }

    #[test]
    fn completion_reads_first_choice_message() {
        let completion = ChatCompletion::from_response(&json!({
            "model": "m",
            "choices": [{"message": {"content": "OK"}}],
            "usage": {"total_tokens": 4},
            "error": null
        }));
        assert_eq!(completion.content, "OK");
        assert_eq!(completion.model.as_deref(), Some("m"));
        assert_eq!(completion.error, None);
        assert_eq!(ChatCompletion::from_response(&json!({})).content, "");
    }

    #[tokio::test]
    async fn streaming_probe_passes_on_well_formed_stream() {
        let body = format!(
            ": keepalive\n{}{}{}event: message\ndata: [DONE]\n\n",
            chunk("Hello, ", None),
            chunk("I am ", None),
            chunk("a model.", Some("stop")),
        );
        let server = StubServer::spawn(vec![StubRoute::new(
            "POST",
            "/v1/chat/completions",
            200,
            "text/event-stream",
            &body,
        )])
        .await;
        let verdict = probe(&server).run_streaming().await;

        assert!(verdict.passed, "{:?}", verdict.failure_reasons);
        assert_eq!(verdict.scenario, "proxy-streaming");
        assert_eq!(verdict.stats.chat_chunks, 3);
        assert_eq!(verdict.stats.chat_content(), "Hello, I am a model.");
        assert_eq!(verdict.stats.finish_reason.as_deref(), Some("stop"));
        let request = server.requests().pop().expect("request");
        assert!(request.contains("\"stream\":true"));
        assert!(request.contains("\"max_tokens\":50"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn streaming_probe_fails_when_errors_were_logged() {
        let body = format!(
            "{}event: message\ndata: {{\"error\":\"upstream overloaded\"}}\n\n{}",
            chunk("Hi", None),
            chunk("!", Some("stop")),
        );
        let server = StubServer::spawn(vec![StubRoute::new(
            "POST",
            "/v1/chat/completions",
            200,
            "text/event-stream",
            &body,
        )])
        .await;
        let verdict = probe(&server).run_streaming().await;

        assert!(CompletionPolicy::ChatCompletion.is_satisfied(&verdict.stats));
        assert!(!verdict.passed);
        assert_eq!(verdict.stats.errors, vec!["API error: upstream overloaded".to_string()]);
    }

    #[tokio::test]
    async fn streaming_probe_records_rejected_request() {
        let server = StubServer::spawn(vec![StubRoute::new(
            "POST",
            "/v1/chat/completions",
            401,
            "application/json",
            r#"{"error":"bad secret"}"#,
        )])
        .await;
        let verdict = probe(&server).run_streaming().await;
        assert!(!verdict.passed);
        assert!(verdict.stats.errors[0].contains("401"));
        assert!(verdict.failure_reasons.contains(&"no chat-completion chunks".to_string()));
    }

    #[tokio::test]
    async fn non_streaming_probe_checks_content_and_error() {
        let server = StubServer::spawn(vec![StubRoute::new(
            "POST",
            "/v1/chat/completions",
            200,
            "application/json",
            r#"{"model":"m","choices":[{"message":{"content":"OK"}}],"usage":{"total_tokens":3}}"#,
        )])
        .await;
        let verdict = probe(&server).run_non_streaming().await;
        assert!(verdict.passed, "{:?}", verdict.failure_reasons);
        assert_eq!(verdict.stats.chat_content(), "OK");
        let request = server.requests().pop().expect("request");
        assert!(request.contains("\"stream\":false"));
        assert!(request.contains("\"max_tokens\":10"));

        let server = StubServer::spawn(vec![StubRoute::new(
            "POST",
            "/v1/chat/completions",
            200,
            "application/json",
            r#"{"choices":[],"error":"no chain"}"#,
        )])
        .await;
        let verdict = probe(&server).run_non_streaming().await;
        assert!(!verdict.passed);
        assert_eq!(
            verdict.failure_reasons,
            vec![
                "completion content was empty".to_string(),
                "API error: no chain".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn full_run_lists_models_and_only_warns_on_missing_model() {
        let server = StubServer::spawn(vec![
            StubRoute::new("GET", "/v1/models", 200, "application/json", r#"{"data":[{"id":"other/model"}]}"#),
            StubRoute::new(
                "POST",
                "/v1/chat/completions",
                200,
                "text/event-stream",
                &chunk("Hello", Some("stop")),
            ),
        ])
        .await;
        let probe = probe(&server);
        assert_eq!(probe.list_models().await.expect("models"), vec!["other/model".to_string()]);
        let report = probe.run().await;
        assert_eq!(report.verdicts.len(), 2);
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn env_gated_smoke_proxy_streaming_if_secret_present() {
        let Ok(config) = ChatConfig::from_env() else {
            eprintln!("skipping proxy smoke test (SANDBOXED_SH_DEV_URL or SANDBOXED_PROXY_SECRET missing)");
            return;
        };
        let verdict = ChatProbe::new(config).expect("probe").run_streaming().await;
        assert!(verdict.passed, "proxy smoke failed: {:?}", verdict.failure_reasons);
    }
}
