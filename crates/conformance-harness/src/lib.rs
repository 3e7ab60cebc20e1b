//! Black-box conformance checks for agent event streams.
//!
//! A run creates a remote session per backend, watches its server-sent event
//! stream in the background, sends stimuli and polls a completion policy over
//! the aggregated stats until it holds or the run's deadline passes.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use conformance_harness::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), HarnessError> {
//! let config = HarnessConfig::from_env()?.backends(["codex"]);
//! config.validate()?;
//! let api = HttpSessionApi::new(&config.base_url, &config.token, config.request_timeout)?;
//! let connector = HttpStreamConnector::new(config.stream_url(), &config.token)?;
//!
//! let plan = ScenarioPlan::new("stream", CompletionPolicy::streaming_shape(true))
//!     .stimulus(Stimulus::new("Run `ls` with the Bash tool, then summarise."));
//! let report = RunOrchestrator::new(Arc::new(api), Arc::new(connector), config)
//!     .run_all(&plan)
//!     .await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

/// Chat-completion proxy probe.
pub mod chat;
/// Harness and probe configuration.
pub mod config;
/// Streaming connections and the line stream they produce.
pub mod connection;
/// Error taxonomy.
pub mod errors;
/// Decoded stream events.
pub mod event;
/// Server-sent event framing.
pub mod frame;
/// Process-wide logging setup.
pub mod observability;
/// Per-backend run sequencing and verdicts.
pub mod orchestrator;
/// Completion policies over aggregated stats.
pub mod predicate;
/// Common imports for typical usage.
pub mod prelude;
/// Remote session lifecycle.
pub mod session;
/// Shared run counters.
pub mod stats;
/// Background stream watcher.
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use chat::{ChatCompletion, ChatProbe, ChatRequest, model_available};
pub use config::{ChatConfig, HarnessConfig};
pub use connection::{HttpStreamConnector, LineStream, StreamConnector};
pub use errors::HarnessError;
pub use event::StreamEvent;
pub use frame::{EventFrameParser, LineDecoder, SseFrame};
pub use observability::{ObservabilityOptions, init_observability};
pub use orchestrator::{RunContext, RunOrchestrator, RunReport, ScenarioPlan, Stimulus, TranscriptCheck, Verdict};
pub use predicate::{BROWSER_TOOL_PREFIXES, CompletionPolicy};
pub use session::{CreateSession, HttpSessionApi, SessionApi, StimulusAck, TranscriptEntry, TranscriptFilter};
pub use stats::{StatsAggregator, StatsSnapshot};
pub use watcher::{MissionRouter, StopHandle, StreamWatcher, WatcherExit, WatcherSettings, WatcherState};
