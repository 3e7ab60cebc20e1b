//! Runs the agent stream conformance scenarios against a live server.

mod report;
mod scenarios;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use conformance_harness::config::{BROWSER_DEFAULT_BACKENDS, BROWSER_USER_AGENT, STREAM_DEFAULT_BACKENDS};
use conformance_harness::prelude::*;
use conformance_harness::{ObservabilityOptions, init_observability};

use crate::scenarios::{StreamOptions, browser_plan, parse_backend_map, stream_plan};

#[derive(Parser, Debug)]
#[command(name = "stream-conformance", version, about = "Agent event-stream conformance checks")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log every stream event (sets the log level to debug).
    #[arg(long, global = true)]
    verbose: bool,

    /// Print the report as JSON instead of summary lines.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Streaming shape: thinking, text deltas, tool call/result pairs and a queued message.
    Stream {
        #[command(flatten)]
        session: SessionArgs,

        /// Backend-specific model override as backend=model. Can be repeated.
        #[arg(long = "model-override")]
        model_overrides: Vec<String>,

        /// Backend-specific expected model substring as backend=substring. Can be repeated.
        #[arg(long = "expect-model")]
        expected_models: Vec<String>,

        /// Allow missing thinking events (text deltas are still required).
        #[arg(long)]
        allow_no_thinking: bool,

        /// Do not fail when assistant messages omit model metadata.
        #[arg(long)]
        allow_missing_model: bool,
    },
    /// Browser task through desktop tools, checked against the stored transcript.
    Browser {
        #[command(flatten)]
        session: SessionArgs,

        /// Do not require 'Example Domain' in the final assistant message.
        #[arg(long)]
        allow_nonexample: bool,
    },
    /// OpenAI-compatible chat-completion proxy.
    Proxy {
        /// Server base URL.
        #[arg(long, env = "SANDBOXED_SH_DEV_URL")]
        base_url: Option<String>,

        /// Proxy bearer secret.
        #[arg(long, env = "SANDBOXED_PROXY_SECRET", hide_env_values = true)]
        proxy_secret: Option<String>,

        /// Model or model chain to request.
        #[arg(long, default_value = conformance_harness::config::DEFAULT_CHAT_MODEL)]
        model: String,

        /// Seconds to wait for a response.
        #[arg(long, default_value_t = 60.0)]
        timeout: f64,

        /// Also test a non-streaming completion.
        #[arg(long)]
        non_streaming: bool,
    },
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Server base URL.
    #[arg(long, env = "SANDBOXED_SH_DEV_URL")]
    base_url: Option<String>,

    /// Bearer token.
    #[arg(long, env = "SANDBOXED_SH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Workspace id sessions are created in.
    #[arg(long, env = "SANDBOXED_SH_WORKSPACE_ID")]
    workspace_id: Option<String>,

    /// Backend to test. Can be repeated; defaults depend on the scenario.
    #[arg(long = "backend")]
    backends: Vec<String>,

    /// Seconds to wait per backend.
    #[arg(long)]
    timeout: Option<f64>,
}

impl SessionArgs {
    fn into_config(self, default_backends: &[&str], default_timeout: Duration) -> Result<HarnessConfig> {
        let backends = if self.backends.is_empty() {
            default_backends.iter().map(|b| b.to_string()).collect()
        } else {
            self.backends
        };
        let timeout = match self.timeout {
            Some(seconds) => seconds_to_duration(seconds, "--timeout")?,
            None => default_timeout,
        };
        let config = HarnessConfig::new(
            self.base_url.unwrap_or_default(),
            self.token.unwrap_or_default(),
            self.workspace_id.unwrap_or_default(),
        )
        .backends(backends)
        .run_timeout(timeout);
        config.validate().context("invalid session configuration")?;
        Ok(config)
    }
}

fn seconds_to_duration(seconds: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|d| !d.is_zero())
        .with_context(|| format!("{flag} must be a positive number of seconds, got {seconds}"))
}

/// The browser scenario talks to the server as a desktop browser would.
fn browser_config(session: SessionArgs) -> Result<HarnessConfig> {
    Ok(session
        .into_config(BROWSER_DEFAULT_BACKENDS, Duration::from_secs(240))?
        .user_agent(BROWSER_USER_AGENT))
}

fn orchestrator(config: HarnessConfig) -> Result<RunOrchestrator> {
    let mut api = HttpSessionApi::new(&config.base_url, &config.token, config.request_timeout)?;
    let mut connector = HttpStreamConnector::new(config.stream_url(), &config.token)?;
    if let Some(user_agent) = &config.user_agent {
        api = api.user_agent(user_agent);
        connector = connector.user_agent(user_agent);
    }
    Ok(RunOrchestrator::new(Arc::new(api), Arc::new(connector), config))
}

async fn run(command: Command) -> Result<RunReport> {
    match command {
        Command::Stream {
            session,
            model_overrides,
            expected_models,
            allow_no_thinking,
            allow_missing_model,
        } => {
            let plan = stream_plan(StreamOptions {
                require_thinking: !allow_no_thinking,
                require_model: !allow_missing_model,
                model_overrides: parse_backend_map(&model_overrides, "--model-override")?,
                expected_models: parse_backend_map(&expected_models, "--expect-model")?,
            });
            let config = session.into_config(STREAM_DEFAULT_BACKENDS, Duration::from_secs(180))?;
            Ok(orchestrator(config)?.run_all(&plan).await?)
        }
        Command::Browser {
            session,
            allow_nonexample,
        } => {
            let plan = browser_plan(!allow_nonexample);
            let config = browser_config(session)?;
            Ok(orchestrator(config)?.run_all(&plan).await?)
        }
        Command::Proxy {
            base_url,
            proxy_secret,
            model,
            timeout,
            non_streaming,
        } => {
            let config = ChatConfig::new(base_url.unwrap_or_default(), proxy_secret.unwrap_or_default())
                .model(model)
                .timeout(seconds_to_duration(timeout, "--timeout")?)
                .non_streaming(non_streaming);
            let probe = ChatProbe::new(config).context("invalid proxy configuration")?;
            Ok(probe.run().await)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_observability(ObservabilityOptions {
        verbose: cli.verbose,
    });

    let report = run(cli.command).await?;
    if cli.json {
        println!("{}", report::render_json(&report)?);
    } else {
        print!("{}", report::render_text(&report));
    }
    tracing::info!(
        event = "cli.finished",
        domain = "cli",
        verdicts = report.verdicts.len() as u64,
        passed = report.all_passed()
    );
    Ok(ExitCode::from(report.exit_code() as u8))
}
