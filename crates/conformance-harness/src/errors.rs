/// Errors produced while driving a conformance run.
///
/// Only `SessionCreation` ends a backend run early. Connection and decode
/// failures are recorded on the run's stats and the run carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HarnessError {
    /// The event stream could not be opened, returned a non-2xx status, or
    /// broke while reading. Transient: the watcher reconnects.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        status_code: Option<u16>,
    },
    /// Event payload text was not a JSON object. The event is dropped.
    #[error("invalid payload: {message}")]
    Decode { message: String },
    /// The remote session could not be created or loaded for a backend.
    #[error("session creation failed ({backend}): {message}")]
    SessionCreation { backend: String, message: String },
    /// A request/response call (stimulus, transcript, model list) failed.
    #[error("request to {url} failed: {message}")]
    Http {
        url: String,
        status_code: Option<u16>,
        message: String,
    },
    /// Invalid or missing configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid input to a builder or plan.
    #[error("validation error: {0}")]
    Validation(String),
}

impl HarnessError {
    /// Creates a connection error without an HTTP status.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            status_code: None,
        }
    }

    /// Creates a connection error for a non-2xx stream response.
    pub fn connection_status(status_code: u16, message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Creates a payload decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a session creation error for `backend`.
    pub fn session_creation(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SessionCreation {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates a request error for `url`.
    pub fn http(url: impl Into<String>, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            status_code,
            message: message.into(),
        }
    }

    /// Whether the watcher should reconnect after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// HTTP status associated with the error, when there was one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Connection { status_code, .. } | Self::Http { status_code, .. } => *status_code,
            _ => None,
        }
    }
}
