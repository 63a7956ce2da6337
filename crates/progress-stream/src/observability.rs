use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "progress-stream.logs.jsonl";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn logging_enabled() -> bool {
    std::env::var("PROGRESS_STREAM_OBSERVABILITY_ENABLED")
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(true)
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("PROGRESS_STREAM_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Splits a JSONL log path into the directory and file name the appender
/// writes to.
fn json_log_target(raw: &str) -> (PathBuf, String) {
    let path = Path::new(raw.trim());
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Initialize session logging once per process.
///
/// Environment variables:
/// - `PROGRESS_STREAM_OBSERVABILITY_ENABLED`: optional enable/disable flag (default enabled).
/// - `PROGRESS_STREAM_LOG_LEVEL`: optional level/filter override (`info`, `debug`, etc.).
/// - `PROGRESS_STREAM_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file.
///   If unset, logs go to stderr in a compact console format, leaving stdout to the caller.
/// - `RUST_LOG`: optional filter override.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !logging_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        match std::env::var("PROGRESS_STREAM_JSON_LOG_PATH") {
            Ok(raw) if !raw.trim().is_empty() => {
                let (dir, file_name) = json_log_target(&raw);
                let _ = std::fs::create_dir_all(&dir);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            _ => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
