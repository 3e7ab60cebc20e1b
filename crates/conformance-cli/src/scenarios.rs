use std::collections::BTreeMap;

use anyhow::{Result, bail};
use conformance_harness::prelude::*;

const STREAM_STEPS: &str = "This is a streaming smoke test. Use the Bash tool for every step. \
Steps: \
1) Run: printf 'stream-test:%s\\n' \"$(date)\" > stream_test_{backend}.txt \
2) Run: sleep 4 \
3) Run: ls -1 stream_test_{backend}.txt \
Then reply with a one-line summary.";

const STREAM_QUEUED: &str = "Queued message: once you finish, reply with 'queued-ok'.";

const BROWSER_STEPS: &str = "Use desktop tools (not bash) to open a browser. \
Steps: \
1) desktop_start_session with launch_browser=true and url=https://example.com \
2) desktop_screenshot (wait_seconds=2) \
3) desktop_get_text to read the page title text. \
Then reply with 'title: Example Domain' and stop the session with desktop_stop_session.";

/// Needle the browser scenario expects in the final assistant message.
pub const BROWSER_NEEDLE: &str = "example domain";

pub struct StreamOptions {
    pub require_thinking: bool,
    pub require_model: bool,
    pub model_overrides: BTreeMap<String, String>,
    pub expected_models: BTreeMap<String, String>,
}

/// Tool-using task plus a queued follow-up; checks the full streaming shape.
pub fn stream_plan(options: StreamOptions) -> ScenarioPlan {
    ScenarioPlan::new(
        "stream",
        CompletionPolicy::streaming_shape(options.require_thinking),
    )
    .stimulus(Stimulus::new(STREAM_STEPS))
    .stimulus(Stimulus::queued(STREAM_QUEUED))
    .require_model(options.require_model)
    .model_overrides(options.model_overrides)
    .expected_models(options.expected_models)
}

/// Desktop-browser task; checks browser tool usage and, optionally, the
/// page title in the final reply.
pub fn browser_plan(require_example_domain: bool) -> ScenarioPlan {
    let plan = ScenarioPlan::new("browser", CompletionPolicy::browser_tools())
        .stimulus(Stimulus::new(BROWSER_STEPS));
    if require_example_domain {
        plan.transcript_check(BROWSER_NEEDLE)
    } else {
        plan
    }
}

/// Parses repeated `backend=value` flags.
pub fn parse_backend_map(values: &[String], flag: &str) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for raw in values {
        let Some((backend, value)) = raw.split_once('=') else {
            bail!("invalid {flag} '{raw}'. Expected format backend=value (example: opencode=builtin/smart)");
        };
        let (backend, value) = (backend.trim(), value.trim());
        if backend.is_empty() || value.is_empty() {
            bail!("invalid {flag} '{raw}'. Expected format backend=value (example: opencode=builtin/smart)");
        }
        parsed.insert(backend.to_string(), value.to_string());
    }
    Ok(parsed)
}
