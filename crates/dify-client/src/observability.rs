use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "dify-client.logs.jsonl";

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn enabled(lookup: impl Fn(&str) -> Option<String>) -> bool {
    ["DIFY_OBSERVABILITY_ENABLED", "DIFY_OBSERVABILITY"]
        .into_iter()
        .find_map(|key| lookup(key))
        .map(|value| parse_flag(&value).unwrap_or(true))
        .unwrap_or(true)
}

fn env_filter() -> EnvFilter {
    if let Ok(level) = std::env::var("DIFY_LOG_LEVEL")
        && let Ok(filter) = EnvFilter::try_new(level)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Splits a log path into the directory and file name handed to the appender.
fn log_target(path: &Path) -> (PathBuf, String) {
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

/// Installs the process-wide `tracing` subscriber. Later calls are no-ops.
///
/// - `DIFY_OBSERVABILITY_ENABLED` / `DIFY_OBSERVABILITY`: on/off switch, on by default.
/// - `DIFY_LOG_LEVEL`: filter directive, falling back to `RUST_LOG` and then `info`.
/// - `DIFY_JSON_LOG_PATH`: write JSONL to this file instead of compact lines on stderr.
///
/// Console output goes to stderr so streamed answers on stdout stay clean.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !enabled(|key| std::env::var(key).ok()) {
            return;
        }

        let filter = env_filter();
        match std::env::var("DIFY_JSON_LOG_PATH") {
            Ok(raw) if !raw.trim().is_empty() => {
                let (dir, file_name) = log_target(Path::new(raw.trim()));
                let _ = std::fs::create_dir_all(&dir);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init();
            }
            _ => {
                let layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .try_init();
            }
        }
    });
}
