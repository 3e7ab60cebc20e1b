use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::{self, Stream};
use tracing::debug;

use crate::errors::HarnessError;
use crate::frame::LineDecoder;

/// Lines read from one open event stream, terminators stripped.
///
/// The stream ends when the remote closes. Any read failure is yielded once as
/// `HarnessError::Connection`.
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, HarnessError>> + Send + 'static>>;

/// Opens long-lived event-stream connections.
#[async_trait::async_trait]
pub trait StreamConnector: Send + Sync {
    /// Opens one stream. `timeout` bounds the wait for the response headers,
    /// not the lifetime of the stream.
    async fn open(&self, timeout: Duration) -> Result<LineStream, HarnessError>;
}

/// Streaming HTTP request with bearer auth and `Accept: text/event-stream`.
///
/// Issues a `GET` unless a JSON body is attached, in which case it `POST`s.
pub struct HttpStreamConnector {
    client: reqwest::Client,
    url: String,
    token: String,
    body: Option<serde_json::Value>,
    user_agent: Option<String>,
}

impl HttpStreamConnector {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Result<Self, HarnessError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| HarnessError::Config(format!("failed to build HTTP client: {e}")))?;
        Self::with_client(client, url, token)
    }

    pub fn with_client(
        client: reqwest::Client,
        url: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, HarnessError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(HarnessError::Config("stream bearer token must not be empty".into()));
        }
        Ok(Self {
            client,
            url: url.into(),
            token,
            body: None,
            user_agent: None,
        })
    }

    /// Sends `body` as JSON with a `POST` instead of a plain `GET`.
    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn open(&self, timeout: Duration) -> Result<LineStream, HarnessError> {
        let mut request = match &self.body {
            Some(body) => self.client.post(&self.url).json(body),
            None => self.client.get(&self.url),
        }
        .bearer_auth(&self.token)
        .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(user_agent) = &self.user_agent {
            request = request.header(reqwest::header::USER_AGENT, user_agent);
        }

        debug!(
            event = "stream.open",
            domain = "stream",
            url = %self.url,
            timeout_ms = timeout.as_millis() as u64
        );
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| {
                HarnessError::connection(format!(
                    "timed out after {}ms opening {}",
                    timeout.as_millis(),
                    self.url
                ))
            })?
            .map_err(|e| HarnessError::connection(format!("stream request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = tokio::time::timeout(timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_else(|| "<unreadable body>".to_string());
            return Err(HarnessError::connection_status(
                status.as_u16(),
                format!("HTTP {status} from {}: {body}", self.url),
            ));
        }

        Ok(lines_from_bytes(response.bytes_stream()))
    }
}

/// Adapts a chunked byte stream into a [`LineStream`].
pub fn lines_from_bytes<S, E>(bytes: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        bytes: Pin<Box<S>>,
        decoder: LineDecoder,
        pending: VecDeque<String>,
        done: bool,
    }

    Box::pin(stream::try_unfold(
        State {
            bytes: Box::pin(bytes),
            decoder: LineDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(line) = state.pending.pop_front() {
                    return Ok(Some((line, state)));
                }
                if state.done {
                    return Ok(None);
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let lines = state.decoder.push_chunk(&chunk)?;
                        state.pending.extend(lines);
                    }
                    Some(Err(e)) => {
                        return Err(HarnessError::connection(format!("stream read failed: {e}")));
                    }
                    None => {
                        state.done = true;
                        let tail = state.decoder.finish();
                        state.pending.extend(tail);
                    }
                }
            }
        },
    ))
}
