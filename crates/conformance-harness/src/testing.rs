//! In-process fakes shared by unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::connection::{LineStream, StreamConnector};
use crate::errors::HarnessError;
use crate::session::{CreateSession, SessionApi, StimulusAck, TranscriptEntry, TranscriptFilter};

/// One canned HTTP response, matched on method and path prefix.
#[derive(Clone, Debug)]
pub(crate) struct StubRoute {
    method: String,
    path: String,
    status: u16,
    content_type: String,
    body: String,
}

impl StubRoute {
    pub(crate) fn new(method: &str, path: &str, status: u16, content_type: &str, body: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            status,
            content_type: content_type.to_string(),
            body: body.to_string(),
        }
    }
}

/// Minimal HTTP/1.1 server on a loopback port. Each connection gets one
/// response and is then closed. Unmatched requests get a 404.
pub(crate) struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub(crate) async fn spawn(routes: Vec<StubRoute>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub server");
        let addr = listener.local_addr().expect("stub server addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);
        let log = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let routes = routes.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = serve_one(socket, &routes, &log).await;
                });
            }
        });
        Self { addr, requests, task }
    }

    pub(crate) fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Raw text of every request received so far, in arrival order.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("request log").clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(
    mut socket: TcpStream,
    routes: &[StubRoute],
    log: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let raw = String::from_utf8_lossy(&buf).to_string();
    log.lock().expect("request log").push(raw);

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let target = request_line.next().unwrap_or_default();
    let route = routes
        .iter()
        .find(|route| route.method == method && target.starts_with(route.path.as_str()));
    let (status, content_type, body) = match route {
        Some(route) => (route.status, route.content_type.as_str(), route.body.as_str()),
        None => (404, "text/plain", "no route"),
    };
    let response = format!(
        "HTTP/1.1 {status} {}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        if status < 400 { "OK" } else { "Error" },
        body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

/// What a [`FakeConnector`] does on one `open` call.
#[derive(Clone, Debug)]
pub(crate) enum FakeOpen {
    Fail(String),
    /// Yields the lines, then the remote closes.
    Lines(Vec<String>),
    /// Yields the lines, then stays open with nothing more to read.
    LinesThenPending(Vec<String>),
}

/// Scripted [`StreamConnector`]. Once the script is exhausted every open
/// behaves like `fallback`.
pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<FakeOpen>>,
    fallback: FakeOpen,
    opens: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new(script: Vec<FakeOpen>, fallback: FakeOpen) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            opens: AtomicUsize::new(0),
        }
    }

    pub(crate) fn always_failing() -> Self {
        Self::new(Vec::new(), FakeOpen::Fail("connection refused".into()))
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

/// Lines of one complete SSE frame, blank terminator included.
pub(crate) fn frame_lines(event: &str, data: serde_json::Value) -> Vec<String> {
    vec![format!("event: {event}"), format!("data: {data}"), String::new()]
}

#[async_trait::async_trait]
impl StreamConnector for FakeConnector {
    async fn open(&self, _timeout: Duration) -> Result<LineStream, HarnessError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .expect("connector script")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match next {
            FakeOpen::Fail(message) => Err(HarnessError::connection(message)),
            FakeOpen::Lines(lines) => Ok(Box::pin(stream::iter(lines.into_iter().map(Ok)))),
            FakeOpen::LinesThenPending(lines) => Ok(Box::pin(
                stream::iter(lines.into_iter().map(Ok)).chain(stream::pending()),
            )),
        }
    }
}

/// In-memory [`SessionApi`]. Session ids are `session-{backend}`.
#[derive(Default)]
pub(crate) struct FakeSessionApi {
    pub(crate) failing_backends: BTreeSet<String>,
    pub(crate) ack_queued: bool,
    pub(crate) failing_stimulus: bool,
    pub(crate) transcript: Vec<TranscriptEntry>,
    pub(crate) created: Mutex<Vec<CreateSession>>,
    pub(crate) stimuli: Mutex<Vec<(String, String)>>,
}

impl FakeSessionApi {
    pub(crate) fn failing_for(mut self, backend: &str) -> Self {
        self.failing_backends.insert(backend.to_string());
        self
    }

    pub(crate) fn queued(mut self, queued: bool) -> Self {
        self.ack_queued = queued;
        self
    }

    pub(crate) fn with_transcript(mut self, entries: Vec<TranscriptEntry>) -> Self {
        self.transcript = entries;
        self
    }

    pub(crate) fn created(&self) -> Vec<CreateSession> {
        self.created.lock().expect("created log").clone()
    }

    pub(crate) fn stimuli(&self) -> Vec<(String, String)> {
        self.stimuli.lock().expect("stimulus log").clone()
    }
}

#[async_trait::async_trait]
impl SessionApi for FakeSessionApi {
    async fn create_session(&self, request: &CreateSession) -> Result<String, HarnessError> {
        self.created.lock().expect("created log").push(request.clone());
        if self.failing_backends.contains(&request.backend) {
            return Err(HarnessError::session_creation(&request.backend, "HTTP 500: backend unavailable"));
        }
        Ok(format!("session-{}", request.backend))
    }

    async fn send_stimulus(&self, session_id: &str, content: &str) -> Result<StimulusAck, HarnessError> {
        self.stimuli
            .lock()
            .expect("stimulus log")
            .push((session_id.to_string(), content.to_string()));
        if self.failing_stimulus {
            return Err(HarnessError::http("fake://message", Some(502), "bad gateway"));
        }
        Ok(StimulusAck::from_response(serde_json::json!({ "queued": self.ack_queued })))
    }

    async fn fetch_transcript(
        &self,
        _session_id: &str,
        _filter: &TranscriptFilter,
    ) -> Result<Vec<TranscriptEntry>, HarnessError> {
        Ok(self.transcript.clone())
    }
}
