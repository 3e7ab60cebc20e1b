//! Common imports for typical harness usage.
pub use crate::{
    ChatConfig, ChatProbe, CompletionPolicy, HarnessConfig, HarnessError, HttpSessionApi,
    HttpStreamConnector, RunOrchestrator, RunReport, ScenarioPlan, SessionApi, StatsSnapshot,
    Stimulus, StreamConnector, Verdict,
};
