use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{LineStream, StreamConnector};
use crate::errors::HarnessError;
use crate::event::StreamEvent;
use crate::frame::{EventFrameParser, SseFrame};
use crate::stats::StatsAggregator;

/// Lifecycle of a background stream watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    Connecting,
    Listening,
    /// Between a dropped connection and the next attempt.
    Disconnected,
    Stopped,
}

/// Timing knobs for one watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Upper bound on waiting for the stream response headers.
    pub connect_timeout: Duration,
    /// How long one read may sit idle before stop and deadline are re-checked.
    pub idle_read_timeout: Duration,
    /// Pause between a failed or closed connection and the next attempt.
    pub reconnect_pause: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_read_timeout: Duration::from_secs(5),
            reconnect_pause: Duration::from_secs(1),
        }
    }
}

/// How [`StreamWatcher::stop`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherExit {
    Finished,
    /// The task did not end within the join timeout and was left running.
    Abandoned,
}

/// Decodes frames for one session and feeds them into its stats.
#[derive(Clone, Debug)]
pub struct MissionRouter {
    session_id: String,
    stats: StatsAggregator,
}

impl MissionRouter {
    pub fn new(session_id: impl Into<String>, stats: StatsAggregator) -> Self {
        Self {
            session_id: session_id.into(),
            stats,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Returns `true` when the frame changed the stats.
    ///
    /// Undecodable payloads and events labelled with another session are
    /// dropped.
    pub fn route(&self, frame: &SseFrame) -> bool {
        let event = match StreamEvent::decode(frame) {
            Ok(event) => event,
            Err(err) => {
                debug!(
                    event = "stream.decode_failed",
                    domain = "stream",
                    session_id = %self.session_id,
                    error = %err
                );
                return false;
            }
        };
        if !event.belongs_to(&self.session_id) {
            return false;
        }
        debug!(
            event = "stream.event",
            domain = "stream",
            session_id = %self.session_id,
            event_type = %event.event_type,
            data = %frame.data
        );
        self.stats.record_event(&event)
    }
}

/// Requests that a watcher stop. Cloneable and idempotent.
#[derive(Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Stop is advisory: an in-flight read may still complete first.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Background task that keeps one event stream open until stopped or until
/// its deadline passes, reconnecting after every failure.
pub struct StreamWatcher {
    stop: StopHandle,
    state_rx: watch::Receiver<WatcherState>,
    task: JoinHandle<()>,
}

impl StreamWatcher {
    /// Starts watching. Must be called inside a tokio runtime.
    pub fn spawn(
        connector: Arc<dyn StreamConnector>,
        router: MissionRouter,
        settings: WatcherSettings,
        deadline: Instant,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(WatcherState::Idle);
        let task = tokio::spawn(watch_task(
            connector, router, settings, deadline, stop_rx, state_tx,
        ));
        Self {
            stop: StopHandle { tx: stop_tx },
            state_rx,
            task,
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state_rx.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Signals stop and waits up to `join_timeout` for the task to end.
    pub async fn stop(mut self, join_timeout: Duration) -> WatcherExit {
        self.stop.stop();
        match tokio::time::timeout(join_timeout, &mut self.task).await {
            Ok(_) => WatcherExit::Finished,
            Err(_) => {
                warn!(
                    event = "stream.watcher_abandoned",
                    domain = "stream",
                    join_timeout_ms = join_timeout.as_millis() as u64,
                    "watcher did not stop in time, leaving it behind"
                );
                WatcherExit::Abandoned
            }
        }
    }
}

enum ListenOutcome {
    Stopped,
    Closed,
    Failed(HarnessError),
}

async fn watch_task(
    connector: Arc<dyn StreamConnector>,
    router: MissionRouter,
    settings: WatcherSettings,
    deadline: Instant,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<WatcherState>,
) {
    let session_id = router.session_id().to_string();
    let mut parser = EventFrameParser::new();
    let mut attempt = 0_u64;

    loop {
        let now = Instant::now();
        if *stop_rx.borrow() || now >= deadline {
            break;
        }
        attempt += 1;
        state_tx.send_replace(WatcherState::Connecting);
        let open_timeout = settings
            .connect_timeout
            .min(deadline.saturating_duration_since(now));

        let opened = tokio::select! {
            _ = stop_requested(&mut stop_rx) => break,
            opened = tokio::time::timeout(open_timeout, connector.open(open_timeout)) => {
                opened.unwrap_or_else(|_| Err(HarnessError::connection(format!(
                    "timed out after {}ms opening stream",
                    open_timeout.as_millis()
                ))))
            }
        };

        let failure = match opened {
            Ok(mut lines) => {
                parser.reset();
                state_tx.send_replace(WatcherState::Listening);
                info!(event = "stream.connected", domain = "stream", session_id = %session_id, attempt);
                match listen(&mut lines, &mut parser, &router, &settings, deadline, &mut stop_rx).await {
                    ListenOutcome::Stopped => break,
                    ListenOutcome::Closed => {
                        debug!(event = "stream.closed", domain = "stream", session_id = %session_id);
                        None
                    }
                    ListenOutcome::Failed(err) => Some(err),
                }
            }
            Err(err) => Some(err),
        };
        if let Some(err) = failure {
            warn!(
                event = "stream.connection_failed",
                domain = "stream",
                session_id = %session_id,
                attempt,
                error = %err
            );
            router.stats().record_error(err.to_string());
        }

        state_tx.send_replace(WatcherState::Disconnected);
        let resume_at = (Instant::now() + settings.reconnect_pause).min(deadline);
        tokio::select! {
            _ = stop_requested(&mut stop_rx) => break,
            _ = tokio::time::sleep_until(resume_at) => {}
        }
    }

    state_tx.send_replace(WatcherState::Stopped);
    debug!(event = "stream.watcher_stopped", domain = "stream", session_id = %session_id, attempts = attempt);
}

async fn listen(
    lines: &mut LineStream,
    parser: &mut EventFrameParser,
    router: &MissionRouter,
    settings: &WatcherSettings,
    deadline: Instant,
    stop_rx: &mut watch::Receiver<bool>,
) -> ListenOutcome {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return ListenOutcome::Stopped;
        }
        let read_timeout = settings
            .idle_read_timeout
            .min(deadline.saturating_duration_since(now));
        tokio::select! {
            _ = stop_requested(stop_rx) => return ListenOutcome::Stopped,
            next = tokio::time::timeout(read_timeout, lines.next()) => {
                match next {
                    // Idle; loop to re-check the deadline.
                    Err(_) => {}
                    Ok(Some(Ok(line))) => {
                        if let Some(frame) = parser.push_line(&line) {
                            router.route(&frame);
                        }
                    }
                    Ok(Some(Err(err))) => return ListenOutcome::Failed(err),
                    Ok(None) => return ListenOutcome::Closed,
                }
            }
        }
    }
}

/// Resolves once stop is requested or every stop handle is gone.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::CompletionPolicy;
    use crate::testing::{FakeConnector, FakeOpen, frame_lines};
    use serde_json::json;

    fn fast_settings() -> WatcherSettings {
        WatcherSettings {
            connect_timeout: Duration::from_millis(500),
            idle_read_timeout: Duration::from_millis(50),
            reconnect_pause: Duration::from_millis(20),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let limit = Instant::now() + Duration::from_secs(5);
        while Instant::now() < limit {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn tool_frames(session: &str, id: &str) -> Vec<String> {
        let mut lines = frame_lines("tool_call", json!({"tool_call_id": id, "mission_id": session}));
        lines.extend(frame_lines("tool_result", json!({"tool_call_id": id, "mission_id": session})));
        lines
    }

    #[tokio::test]
    async fn reconnects_after_two_failures_and_routes_events() {
        let connector = Arc::new(FakeConnector::new(
            vec![
                FakeOpen::Fail("refused".into()),
                FakeOpen::Fail("reset".into()),
            ],
            FakeOpen::LinesThenPending(tool_frames("m1", "x1")),
        ));
        let stats = StatsAggregator::new();
        let watcher = StreamWatcher::spawn(
            connector.clone(),
            MissionRouter::new("m1", stats.clone()),
            fast_settings(),
            Instant::now() + Duration::from_secs(10),
        );

        assert!(eventually(|| stats.snapshot().tool_results == 1).await);
        assert_eq!(watcher.state(), WatcherState::Listening);
        assert_eq!(connector.opens(), 3);

        let snap = stats.snapshot();
        assert_eq!(snap.tool_calls, 1);
        assert_eq!(snap.errors.len(), 2);
        assert!(snap.errors[0].contains("refused"));

        let mut states = watcher.subscribe();
        assert_eq!(watcher.stop(Duration::from_secs(1)).await, WatcherExit::Finished);
        assert_eq!(*states.borrow_and_update(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn partial_frame_from_dropped_connection_is_discarded() {
        let mut first = frame_lines("tool_call", json!({"tool_call_id": "a"}));
        // Cut off before the terminating blank line.
        first.extend(["event: tool_result".to_string(), "data: {\"tool_call_id\":\"a\"}".to_string()]);
        let mut second = vec![String::new()];
        second.extend(frame_lines("assistant_message", json!({"content": "done"})));
        let connector = Arc::new(FakeConnector::new(
            vec![FakeOpen::Lines(first), FakeOpen::Fail("reset".into())],
            FakeOpen::LinesThenPending(second),
        ));
        let stats = StatsAggregator::new();
        let watcher = StreamWatcher::spawn(
            connector,
            MissionRouter::new("m1", stats.clone()),
            fast_settings(),
            Instant::now() + Duration::from_secs(10),
        );

        assert!(eventually(|| stats.snapshot().assistant_messages == 1).await);
        let snap = stats.snapshot();
        assert_eq!(snap.tool_calls, 1);
        assert_eq!(snap.tool_results, 0);
        watcher.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_interrupts_an_idle_stream() {
        let connector = Arc::new(FakeConnector::new(
            Vec::new(),
            FakeOpen::LinesThenPending(Vec::new()),
        ));
        let settings = WatcherSettings {
            idle_read_timeout: Duration::from_secs(30),
            ..fast_settings()
        };
        let watcher = StreamWatcher::spawn(
            connector,
            MissionRouter::new("m1", StatsAggregator::new()),
            settings,
            Instant::now() + Duration::from_secs(60),
        );
        let mut states = watcher.subscribe();
        assert!(eventually(|| *states.borrow_and_update() == WatcherState::Listening).await);

        let started = Instant::now();
        assert_eq!(watcher.stop(Duration::from_secs(2)).await, WatcherExit::Finished);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn deadline_ends_a_watcher_that_never_connects() {
        let connector = Arc::new(FakeConnector::always_failing());
        let stats = StatsAggregator::new();
        let watcher = StreamWatcher::spawn(
            connector.clone(),
            MissionRouter::new("m1", stats.clone()),
            WatcherSettings {
                reconnect_pause: Duration::from_millis(50),
                ..fast_settings()
            },
            Instant::now() + Duration::from_millis(300),
        );
        let mut states = watcher.subscribe();
        assert!(eventually(|| *states.borrow_and_update() == WatcherState::Stopped).await);
        assert!(connector.opens() >= 2);
        assert!(stats.error_count() >= 2);
        assert_eq!(watcher.stop(Duration::from_millis(100)).await, WatcherExit::Finished);
    }

    fn route_lines(router: &MissionRouter, lines: &[&str]) {
        let mut parser = EventFrameParser::new();
        for line in lines {
            if let Some(frame) = parser.push_line(line) {
                router.route(&frame);
            }
        }
    }

    #[test]
    fn raw_tool_call_and_result_lines_match_by_id() {
        let stats = StatsAggregator::new();
        let router = MissionRouter::new("m1", stats.clone());
        route_lines(
            &router,
            &[
                "event: tool_call",
                r#"data: {"tool_call_id":"x1","name":"bash"}"#,
                "",
                "event: tool_result",
                r#"data: {"tool_call_id":"x1"}"#,
                "",
            ],
        );
        let snap = stats.snapshot();
        assert_eq!(snap.tool_calls, 1);
        assert_eq!(snap.tool_results, 1);
        assert_eq!(
            snap.matched_tool_ids(),
            std::collections::BTreeSet::from(["x1".to_string()])
        );
    }

    #[test]
    fn non_object_payloads_change_no_counter() {
        let stats = StatsAggregator::new();
        let router = MissionRouter::new("m1", stats.clone());
        let frames = [
            ("assistant_message", "null"),
            ("assistant_message", "42"),
            ("tool_call", r#"["x"]"#),
            ("tool_result", r#""oops""#),
        ];
        for (event, data) in frames {
            let frame = SseFrame {
                event: event.into(),
                data: data.into(),
            };
            assert!(!router.route(&frame), "{event}: {data}");
        }
        let snap = stats.snapshot();
        assert_eq!(snap.assistant_messages, 0);
        assert_eq!(snap.tool_calls, 0);
        assert_eq!(snap.tool_results, 0);
        assert!(!CompletionPolicy::streaming_shape(false).is_satisfied(&snap));
    }

    #[test]
    fn router_discards_foreign_and_undecodable_events() {
        let stats = StatsAggregator::new();
        let router = MissionRouter::new("m1", stats.clone());
        let foreign = SseFrame {
            event: "assistant_message".into(),
            data: r#"{"mission_id":"m2"}"#.into(),
        };
        let garbled = SseFrame {
            event: "assistant_message".into(),
            data: "{oops".into(),
        };
        let own = SseFrame {
            event: "assistant_message".into(),
            data: r#"{"mission_id":"m1","model":"gpt"}"#.into(),
        };
        assert!(!router.route(&foreign));
        assert!(!router.route(&garbled));
        assert!(router.route(&own));
        let snap = stats.snapshot();
        assert_eq!(snap.assistant_messages, 1);
        assert!(snap.errors.is_empty());
    }
}
