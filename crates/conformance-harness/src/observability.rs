use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const ENV_ENABLED: &str = "CONFORMANCE_OBSERVABILITY_ENABLED";
const ENV_ENABLED_SHORT: &str = "CONFORMANCE_OBSERVABILITY";
const ENV_LOG_LEVEL: &str = "CONFORMANCE_LOG_LEVEL";
const ENV_JSON_LOG_PATH: &str = "CONFORMANCE_JSON_LOG_PATH";
const DEFAULT_JSON_LOG_FILE: &str = "conformance.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

/// Logging options chosen by the caller rather than the environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservabilityOptions {
    /// Force `debug` level, which includes every raw stream event.
    pub verbose: bool,
}

/// Where log records go.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LogSink {
    Off,
    /// Compact lines on stderr. Stdout carries the run report.
    Stderr,
    /// JSON lines appended to a file.
    JsonFile { dir: PathBuf, file_name: String },
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn resolve_sink(lookup: impl Fn(&str) -> Option<String>) -> LogSink {
    let enabled = [ENV_ENABLED, ENV_ENABLED_SHORT]
        .into_iter()
        .find_map(|key| lookup(key))
        .is_none_or(|value| parse_flag(&value).unwrap_or(true));
    if !enabled {
        return LogSink::Off;
    }
    match lookup(ENV_JSON_LOG_PATH) {
        Some(raw) => {
            let path = PathBuf::from(raw);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_JSON_LOG_FILE)
                .to_string();
            LogSink::JsonFile { dir, file_name }
        }
        None => LogSink::Stderr,
    }
}

fn resolve_filter(options: ObservabilityOptions, lookup: impl Fn(&str) -> Option<String>) -> EnvFilter {
    if options.verbose {
        return EnvFilter::new("debug");
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL)
        && let Ok(filter) = EnvFilter::try_new(level)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Installs the global subscriber on first call; later calls do nothing.
///
/// `CONFORMANCE_OBSERVABILITY_ENABLED` (or `CONFORMANCE_OBSERVABILITY`) turns
/// logging off with `0`/`false`/`off`. `CONFORMANCE_LOG_LEVEL` overrides the
/// filter, then `RUST_LOG`, then `info`. `CONFORMANCE_JSON_LOG_PATH` switches
/// from stderr to a JSON lines file.
pub fn init_observability(options: ObservabilityOptions) {
    INIT.get_or_init(|| {
        let filter = resolve_filter(options, env_lookup);
        match resolve_sink(env_lookup) {
            LogSink::Off => {}
            LogSink::Stderr => {
                let layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
            }
            LogSink::JsonFile { dir, file_name } => {
                let _ = std::fs::create_dir_all(&dir);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn flags_parse_loosely() {
        assert_eq!(parse_flag(" Yes "), Some(true));
        assert_eq!(parse_flag("disabled"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn sink_defaults_to_stderr_and_honours_the_off_switch() {
        assert_eq!(resolve_sink(vars(&[])), LogSink::Stderr);
        assert_eq!(resolve_sink(vars(&[(ENV_ENABLED, "off")])), LogSink::Off);
        assert_eq!(resolve_sink(vars(&[(ENV_ENABLED_SHORT, "0")])), LogSink::Off);
        assert_eq!(resolve_sink(vars(&[(ENV_ENABLED, "garbage")])), LogSink::Stderr);
    }

    #[test]
    fn json_path_splits_into_dir_and_file() {
        assert_eq!(
            resolve_sink(vars(&[(ENV_JSON_LOG_PATH, "logs/run.jsonl")])),
            LogSink::JsonFile {
                dir: PathBuf::from("logs"),
                file_name: "run.jsonl".into(),
            }
        );
        assert_eq!(
            resolve_sink(vars(&[(ENV_JSON_LOG_PATH, "run.jsonl")])),
            LogSink::JsonFile {
                dir: PathBuf::from("."),
                file_name: "run.jsonl".into(),
            }
        );
    }

    #[test]
    fn verbose_wins_over_configured_level() {
        let filter = resolve_filter(
            ObservabilityOptions { verbose: true },
            vars(&[(ENV_LOG_LEVEL, "warn")]),
        );
        assert!(filter.to_string().contains("debug"));
        let filter = resolve_filter(ObservabilityOptions::default(), vars(&[(ENV_LOG_LEVEL, "warn")]));
        assert!(filter.to_string().contains("warn"));
    }

    #[test]
    fn init_is_idempotent() {
        init_observability(ObservabilityOptions::default());
        init_observability(ObservabilityOptions { verbose: true });
    }
}
