use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::connection::StreamConnector;
use crate::errors::HarnessError;
use crate::predicate::CompletionPolicy;
use crate::session::{CreateSession, SessionApi, TranscriptFilter, latest_content};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::watcher::{MissionRouter, StreamWatcher, WatcherExit};

pub const QUEUED_NOT_ACKNOWLEDGED: &str = "queued stimulus was not acknowledged as queued";

/// One message sent to the session under test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stimulus {
    pub content: String,
    /// The server must report this message as queued behind running work.
    #[serde(default)]
    pub expect_queued: bool,
}

impl Stimulus {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            expect_queued: false,
        }
    }

    pub fn queued(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            expect_queued: true,
        }
    }

    /// Content with every `{backend}` placeholder replaced.
    pub fn render(&self, backend: &str) -> String {
        self.content.replace("{backend}", backend)
    }
}

/// Case-insensitive assertion on the latest stored assistant message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptCheck {
    pub needle: String,
}

/// Everything that varies between scenarios.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioPlan {
    /// Short name, used in session titles and reports.
    pub name: String,
    pub stimuli: Vec<Stimulus>,
    pub policy: CompletionPolicy,
    /// Fail when no assistant message carried model metadata.
    #[serde(default)]
    pub require_model: bool,
    /// Backend to substring that some observed model name must contain.
    #[serde(default)]
    pub expected_models: BTreeMap<String, String>,
    /// Backend to model sent with session creation.
    #[serde(default)]
    pub model_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub transcript_check: Option<TranscriptCheck>,
}

impl ScenarioPlan {
    pub fn new(name: impl Into<String>, policy: CompletionPolicy) -> Self {
        Self {
            name: name.into(),
            stimuli: Vec::new(),
            policy,
            require_model: false,
            expected_models: BTreeMap::new(),
            model_overrides: BTreeMap::new(),
            transcript_check: None,
        }
    }

    pub fn stimulus(mut self, stimulus: Stimulus) -> Self {
        self.stimuli.push(stimulus);
        self
    }

    pub fn require_model(mut self, required: bool) -> Self {
        self.require_model = required;
        self
    }

    pub fn expected_models(mut self, expected: BTreeMap<String, String>) -> Self {
        self.expected_models = expected;
        self
    }

    pub fn model_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.model_overrides = overrides;
        self
    }

    pub fn transcript_check(mut self, needle: impl Into<String>) -> Self {
        self.transcript_check = Some(TranscriptCheck {
            needle: needle.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::Validation("scenario name must not be empty".into()));
        }
        if self.stimuli.is_empty() {
            return Err(HarnessError::Validation(
                "at least one stimulus is required".into(),
            ));
        }
        if self.stimuli.iter().any(|s| s.content.trim().is_empty()) {
            return Err(HarnessError::Validation("stimulus content must not be empty".into()));
        }
        if let Some(check) = &self.transcript_check
            && check.needle.trim().is_empty()
        {
            return Err(HarnessError::Validation("transcript needle must not be empty".into()));
        }
        Ok(())
    }
}

/// Identity and budget of one backend run.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub backend: String,
    pub session_id: String,
    pub run_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub deadline: Instant,
}

impl RunContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Pass/fail result for one backend (or one probe).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub backend: String,
    pub scenario: String,
    pub session_id: Option<String>,
    pub run_id: uuid::Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub passed: bool,
    /// Acknowledgement of the queued stimulus, when the plan had one.
    pub queued_ok: Option<bool>,
    pub stats: StatsSnapshot,
    pub failure_reasons: Vec<String>,
}

impl Verdict {
    /// A verdict passes exactly when it has no failure reasons.
    pub fn new(
        backend: impl Into<String>,
        scenario: impl Into<String>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        stats: StatsSnapshot,
        failure_reasons: Vec<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            scenario: scenario.into(),
            session_id: None,
            run_id: uuid::Uuid::new_v4(),
            started_at,
            elapsed_ms: elapsed.as_millis() as u64,
            passed: failure_reasons.is_empty(),
            queued_ok: None,
            stats,
            failure_reasons,
        }
    }
}

/// Verdicts for every backend of one scenario.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub verdicts: Vec<Verdict>,
}

impl RunReport {
    pub fn push(&mut self, verdict: Verdict) {
        self.verdicts.push(verdict);
    }

    pub fn all_passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }

    /// Process exit status: 1 when any verdict failed.
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() { 0 } else { 1 }
    }
}

/// Drives one scenario across backends, sequentially.
///
/// Each backend run owns its own stats and watcher. A failure in one backend
/// never prevents the next from running.
pub struct RunOrchestrator {
    api: Arc<dyn SessionApi>,
    connector: Arc<dyn StreamConnector>,
    config: HarnessConfig,
}

impl RunOrchestrator {
    pub fn new(
        api: Arc<dyn SessionApi>,
        connector: Arc<dyn StreamConnector>,
        config: HarnessConfig,
    ) -> Self {
        Self {
            api,
            connector,
            config,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs `plan` against every configured backend.
    pub async fn run_all(&self, plan: &ScenarioPlan) -> Result<RunReport, HarnessError> {
        plan.validate()?;
        let mut report = RunReport::default();
        for backend in &self.config.backends {
            report.push(self.run_backend(backend, plan).await);
        }
        Ok(report)
    }

    pub async fn run_backend(&self, backend: &str, plan: &ScenarioPlan) -> Verdict {
        let started = Instant::now();
        let started_at = Utc::now();
        let request = CreateSession {
            title: format!("{}-smoke-{}-{}", plan.name, backend, started_at.timestamp()),
            workspace_id: self.config.workspace_id.clone(),
            backend: backend.to_string(),
            model_override: plan.model_overrides.get(backend).cloned(),
        };

        let session_id = match self.api.create_session(&request).await {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    event = "run.session_failed",
                    domain = "run",
                    backend,
                    scenario = %plan.name,
                    error = %err
                );
                return Verdict::new(
                    backend,
                    &plan.name,
                    started_at,
                    started.elapsed(),
                    StatsSnapshot::default(),
                    vec![err.to_string()],
                );
            }
        };

        let ctx = RunContext {
            backend: backend.to_string(),
            session_id,
            run_id: uuid::Uuid::new_v4(),
            started_at,
            deadline: Instant::now() + self.config.run_timeout,
        };
        info!(
            event = "run.started",
            domain = "run",
            backend,
            scenario = %plan.name,
            session_id = %ctx.session_id,
            run_id = %ctx.run_id,
            timeout_ms = self.config.run_timeout.as_millis() as u64
        );

        let stats = StatsAggregator::new();
        let watcher = StreamWatcher::spawn(
            self.connector.clone(),
            MissionRouter::new(ctx.session_id.clone(), stats.clone()),
            self.config.watcher,
            ctx.deadline,
        );

        let mut reasons = Vec::new();
        let mut queued_ok = None;
        let mut delivered = true;
        for stimulus in &plan.stimuli {
            let content = stimulus.render(backend);
            let send = self.api.send_stimulus(&ctx.session_id, &content);
            let sent = match tokio::time::timeout(ctx.remaining(), send).await {
                Ok(sent) => sent.map_err(|e| e.to_string()),
                Err(_) => Err("run deadline passed while sending".to_string()),
            };
            match sent {
                Ok(ack) => {
                    if stimulus.expect_queued {
                        queued_ok = Some(ack.queued);
                        if !ack.queued {
                            reasons.push(QUEUED_NOT_ACKNOWLEDGED.to_string());
                        }
                    }
                }
                Err(err) => {
                    warn!(event = "run.stimulus_failed", domain = "run", backend, error = %err);
                    reasons.push(format!("stimulus failed: {err}"));
                    delivered = false;
                    break;
                }
            }
        }

        let satisfied = delivered && self.await_completion(&plan.policy, &stats, &ctx).await;
        if watcher.stop(self.config.join_timeout).await == WatcherExit::Abandoned {
            warn!(event = "run.watcher_leaked", domain = "run", backend, session_id = %ctx.session_id);
        }

        let snapshot = stats.snapshot();
        let unmet = plan.policy.unmet(&snapshot);
        if delivered && !satisfied && !unmet.is_empty() {
            reasons.push(format!(
                "required events not observed within {}s",
                self.config.run_timeout.as_secs_f64()
            ));
        }
        reasons.extend(unmet);
        reasons.extend(model_failures(plan, backend, &snapshot));
        if let Some(check) = &plan.transcript_check
            && let Some(reason) = self.check_transcript(&ctx, check).await
        {
            reasons.push(reason);
        }

        let mut verdict = Verdict::new(
            backend,
            &plan.name,
            ctx.started_at,
            started.elapsed(),
            snapshot,
            reasons,
        );
        verdict.session_id = Some(ctx.session_id);
        verdict.run_id = ctx.run_id;
        verdict.queued_ok = queued_ok;
        info!(
            event = "run.finished",
            domain = "run",
            backend,
            scenario = %plan.name,
            passed = verdict.passed,
            errors = verdict.stats.errors.len() as u64,
            elapsed_ms = verdict.elapsed_ms
        );
        verdict
    }

    async fn await_completion(
        &self,
        policy: &CompletionPolicy,
        stats: &StatsAggregator,
        ctx: &RunContext,
    ) -> bool {
        loop {
            if policy.is_satisfied(&stats.snapshot()) {
                return true;
            }
            let now = Instant::now();
            if now >= ctx.deadline {
                return false;
            }
            tokio::time::sleep_until((now + self.config.poll_interval).min(ctx.deadline)).await;
        }
    }

    /// Runs even when the budget is spent; the fetch is bounded by the
    /// session API's request timeout, not by the run deadline.
    async fn check_transcript(&self, ctx: &RunContext, check: &TranscriptCheck) -> Option<String> {
        let entries = match self
            .api
            .fetch_transcript(&ctx.session_id, &TranscriptFilter::assistant_messages())
            .await
        {
            Ok(entries) => entries,
            Err(err) => return Some(format!("transcript fetch failed: {err}")),
        };
        let latest = latest_content(&entries);
        if latest.to_lowercase().contains(&check.needle.to_lowercase()) {
            None
        } else {
            Some(format!(
                "latest assistant message does not mention '{}'",
                check.needle
            ))
        }
    }
}

fn model_failures(plan: &ScenarioPlan, backend: &str, snapshot: &StatsSnapshot) -> Vec<String> {
    let mut reasons = Vec::new();
    if plan.require_model && snapshot.assistant_models.is_empty() {
        reasons.push("no assistant_message carried model metadata".to_string());
    }
    if let Some(expected) = plan.expected_models.get(backend).filter(|s| !s.is_empty())
        && !snapshot
            .assistant_models
            .iter()
            .any(|model| model.contains(expected.as_str()))
    {
        let seen: Vec<&str> = snapshot.assistant_models.iter().map(String::as_str).collect();
        reasons.push(format!(
            "expected model substring '{expected}' not found in [{}]",
            seen.join(", ")
        ));
    }
    reasons
}
