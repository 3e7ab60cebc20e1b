use std::time::Duration;

use crate::errors::HarnessError;
use crate::watcher::WatcherSettings;

pub const ENV_BASE_URL: &str = "SANDBOXED_SH_DEV_URL";
pub const ENV_TOKEN: &str = "SANDBOXED_SH_TOKEN";
pub const ENV_WORKSPACE_ID: &str = "SANDBOXED_SH_WORKSPACE_ID";
pub const ENV_PROXY_SECRET: &str = "SANDBOXED_PROXY_SECRET";

/// Backends exercised by the streaming-shape scenario when none are named.
pub const STREAM_DEFAULT_BACKENDS: &[&str] = &["claudecode", "opencode", "codex"];
/// Backends exercised by the browser-tool scenario when none are named.
pub const BROWSER_DEFAULT_BACKENDS: &[&str] = &["claudecode", "codex"];

pub const DEFAULT_CHAT_MODEL: &str = "builtin/smart";
/// Desktop browser `User-Agent` sent by the browser scenario.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Connection and timing settings for session-based runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Server root, without a trailing slash.
    pub base_url: String,
    /// Bearer credential for both the stream and the session API.
    pub token: String,
    pub workspace_id: String,
    /// Backends to run, in order.
    pub backends: Vec<String>,
    /// Overall budget per backend run.
    pub run_timeout: Duration,
    /// Sleep between completion checks.
    pub poll_interval: Duration,
    /// How long to wait for a stopped watcher to end.
    pub join_timeout: Duration,
    pub watcher: WatcherSettings,
    /// Timeout for request/response calls (create, stimulus, transcript).
    pub request_timeout: Duration,
    /// `User-Agent` sent on every session call and stream request, when set.
    pub user_agent: Option<String>,
}

impl HarnessConfig {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            workspace_id: workspace_id.into(),
            backends: STREAM_DEFAULT_BACKENDS.iter().map(|b| b.to_string()).collect(),
            run_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(500),
            join_timeout: Duration::from_secs(5),
            watcher: WatcherSettings::default(),
            request_timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }

    /// Builds a config from `SANDBOXED_SH_DEV_URL`, `SANDBOXED_SH_TOKEN` and
    /// `SANDBOXED_SH_WORKSPACE_ID`.
    pub fn from_env() -> Result<Self, HarnessError> {
        Ok(Self::new(
            required_env(ENV_BASE_URL)?,
            required_env(ENV_TOKEN)?,
            required_env(ENV_WORKSPACE_ID)?,
        ))
    }

    /// Replaces the backend list. An empty list keeps the current one.
    pub fn backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backends: Vec<String> = backends.into_iter().map(Into::into).collect();
        if !backends.is_empty() {
            self.backends = backends;
        }
        self
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn watcher(mut self, settings: WatcherSettings) -> Self {
        self.watcher = settings;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn stream_url(&self) -> String {
        format!("{}/api/control/stream", self.base_url)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.base_url.trim().is_empty() {
            return Err(HarnessError::Config(format!("missing base URL ({ENV_BASE_URL})")));
        }
        if self.token.trim().is_empty() {
            return Err(HarnessError::Config(format!("missing token ({ENV_TOKEN})")));
        }
        if self.workspace_id.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "missing workspace id ({ENV_WORKSPACE_ID})"
            )));
        }
        if self.backends.iter().any(|b| b.trim().is_empty()) {
            return Err(HarnessError::Config("backend names must not be empty".into()));
        }
        if self.run_timeout.is_zero() {
            return Err(HarnessError::Config("run timeout must be greater than 0".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(HarnessError::Config("poll interval must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Settings for the chat-completion proxy probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatConfig {
    pub base_url: String,
    pub proxy_secret: String,
    /// Model or model chain to request.
    pub model: String,
    /// Bounds the whole streamed response, and each non-streaming request.
    pub timeout: Duration,
    /// Also run the non-streaming request.
    pub non_streaming: bool,
}

impl ChatConfig {
    pub fn new(base_url: impl Into<String>, proxy_secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            proxy_secret: proxy_secret.into(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            non_streaming: false,
        }
    }

    /// Builds a config from `SANDBOXED_SH_DEV_URL` and `SANDBOXED_PROXY_SECRET`.
    pub fn from_env() -> Result<Self, HarnessError> {
        Ok(Self::new(
            required_env(ENV_BASE_URL)?,
            required_env(ENV_PROXY_SECRET)?,
        ))
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn non_streaming(mut self, enabled: bool) -> Self {
        self.non_streaming = enabled;
        self
    }

    pub(crate) fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    pub(crate) fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.base_url.trim().is_empty() {
            return Err(HarnessError::Config(format!("missing base URL ({ENV_BASE_URL})")));
        }
        if self.proxy_secret.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "missing proxy secret ({ENV_PROXY_SECRET})"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(HarnessError::Config("model must not be empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(HarnessError::Config("timeout must be greater than 0".into()));
        }
        Ok(())
    }
}

fn required_env(key: &str) -> Result<String, HarnessError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(HarnessError::Config(format!("missing {key}"))),
    }
}
