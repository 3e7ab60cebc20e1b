use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::HarnessError;
use crate::event::truthy;

/// Body of a create-session request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSession {
    pub title: String,
    pub workspace_id: String,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
}

/// Server acknowledgement for one stimulus.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StimulusAck {
    /// Whether the server queued the message behind running work.
    pub queued: bool,
    pub raw: Value,
}

impl StimulusAck {
    pub fn from_response(raw: Value) -> Self {
        let queued = raw.get("queued").is_some_and(truthy);
        Self { queued, raw }
    }
}

/// Which stored events to return from a transcript query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptFilter {
    pub types: Vec<String>,
    pub limit: u32,
    pub offset: u32,
}

impl TranscriptFilter {
    /// The most recent page of assistant messages.
    pub fn assistant_messages() -> Self {
        Self {
            types: vec!["assistant_message".to_string()],
            limit: 50,
            offset: 0,
        }
    }

    fn query(&self) -> String {
        format!(
            "types={}&limit={}&offset={}",
            self.types.join(","),
            self.limit,
            self.offset
        )
    }
}

/// One stored event from a session transcript.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub sequence: i64,
    pub event_type: Option<String>,
    pub content: String,
}

impl TranscriptEntry {
    /// Lenient conversion: missing fields become defaults.
    pub fn from_value(value: &Value) -> Self {
        Self {
            sequence: value.get("sequence").and_then(Value::as_i64).unwrap_or(0),
            event_type: value
                .get("event_type")
                .or_else(|| value.get("type"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            content: value
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// Content of the entry with the highest sequence number, or `""`.
pub fn latest_content(entries: &[TranscriptEntry]) -> &str {
    entries
        .iter()
        .max_by_key(|entry| entry.sequence)
        .map(|entry| entry.content.as_str())
        .unwrap_or_default()
}

/// Remote session lifecycle used by the orchestrator.
#[async_trait::async_trait]
pub trait SessionApi: Send + Sync {
    /// Creates a session and makes it the target of later stimuli.
    async fn create_session(&self, request: &CreateSession) -> Result<String, HarnessError>;

    async fn send_stimulus(&self, session_id: &str, content: &str)
    -> Result<StimulusAck, HarnessError>;

    /// Point-in-time query of stored events (not the live stream).
    async fn fetch_transcript(
        &self,
        session_id: &str,
        filter: &TranscriptFilter,
    ) -> Result<Vec<TranscriptEntry>, HarnessError>;
}

/// Mission-control HTTP API with bearer authentication.
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    user_agent: Option<String>,
}

impl HttpSessionApi {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, HarnessError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(HarnessError::Config("session API token must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            user_agent: None,
        })
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// URL of the live event stream served next to this API.
    pub fn stream_url(&self) -> String {
        format!("{}/api/control/stream", self.base_url)
    }

    async fn request_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, HarnessError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(&self.token);
        if let Some(user_agent) = &self.user_agent {
            request = request.header(reqwest::header::USER_AGENT, user_agent);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        debug!(event = "session.request", domain = "session", method = %method, url = %url);

        let response = request
            .send()
            .await
            .map_err(|e| HarnessError::http(&url, None, e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| HarnessError::http(&url, Some(status.as_u16()), e.to_string()))?;
        if !status.is_success() {
            return Err(HarnessError::http(
                &url,
                Some(status.as_u16()),
                format!("HTTP {status}: {text}"),
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&text).map_err(|e| {
            HarnessError::http(&url, Some(status.as_u16()), format!("invalid JSON response: {e}"))
        })
    }
}

#[async_trait::async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, request: &CreateSession) -> Result<String, HarnessError> {
        let body = serde_json::to_value(request)
            .map_err(|e| HarnessError::Validation(format!("unserializable session request: {e}")))?;
        let created = self
            .request_json(reqwest::Method::POST, "/api/control/missions", Some(&body))
            .await
            .map_err(|e| HarnessError::session_creation(&request.backend, e.to_string()))?;
        let Some(session_id) = created
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        else {
            return Err(HarnessError::session_creation(
                &request.backend,
                format!("response carried no session id: {created}"),
            ));
        };

        let load_path = format!("/api/control/missions/{session_id}/load");
        self.request_json(
            reqwest::Method::POST,
            &load_path,
            Some(&Value::Object(serde_json::Map::new())),
        )
        .await
        .map_err(|e| HarnessError::session_creation(&request.backend, e.to_string()))?;
        Ok(session_id.to_string())
    }

    async fn send_stimulus(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<StimulusAck, HarnessError> {
        // Messages go to whichever session was loaded last.
        debug!(event = "session.stimulus", domain = "session", session_id, content_len = content.len() as u64);
        let raw = self
            .request_json(
                reqwest::Method::POST,
                "/api/control/message",
                Some(&serde_json::json!({ "content": content })),
            )
            .await?;
        Ok(StimulusAck::from_response(raw))
    }

    async fn fetch_transcript(
        &self,
        session_id: &str,
        filter: &TranscriptFilter,
    ) -> Result<Vec<TranscriptEntry>, HarnessError> {
        let path = format!("/api/control/missions/{session_id}/events?{}", filter.query());
        let value = self.request_json(reqwest::Method::GET, &path, None).await?;
        Ok(value
            .as_array()
            .map(|items| items.iter().map(TranscriptEntry::from_value).collect())
            .unwrap_or_default())
    }
}
