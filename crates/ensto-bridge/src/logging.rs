//! Logging setup.
//!
//! Session work runs inside a `device` span, so every event logged for a
//! thermostat carries its identifier:
//!
//! - **Production**: JSON lines with the span's `device` field flattened in,
//!   written to a rolling file, plus a timestamp-free stdout stream for journald
//! - **Development**: pretty stdout including span close timings
//!
//! Filter precedence: `RUST_LOG`, then `--log-level`, then `ENSTO_LOG_LEVEL`,
//! then [`DEFAULT_DIRECTIVES`].

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Used when nothing else selects a filter. The MQTT and BlueZ clients are
/// chatty at `info`.
pub const DEFAULT_DIRECTIVES: &str = "info,rumqttc=warn,bluer=warn";

/// Rotated log files kept on disk.
const RETAINED_FILES: usize = 14;

// Keep the non-blocking writers flushing until exit.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Pick the filter directives by precedence.
fn directives(rust_log: Option<String>, cli: Option<&str>, env_level: Option<String>) -> String {
    rust_log
        .filter(|v| !v.trim().is_empty())
        .or_else(|| cli.map(str::to_string))
        .or_else(|| env_level.filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string())
}

/// Install the global subscriber.
///
/// `level` is the `--log-level` value.
///
/// # Errors
///
/// Returns an error if the filter does not parse, or in production if the log
/// directory cannot be created.
pub fn init(is_production: bool, level: Option<&str>) -> anyhow::Result<()> {
    let directives = directives(
        std::env::var("RUST_LOG").ok(),
        level,
        std::env::var("ENSTO_LOG_LEVEL").ok(),
    );
    let env_filter = EnvFilter::try_new(&directives)?;

    if is_production {
        init_production(env_filter)?;
    } else {
        init_development(env_filter);
    }

    tracing::debug!(%directives, production = is_production, "Logging initialized");
    Ok(())
}

fn init_production(env_filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("ensto-bridge")
        .filename_suffix("log")
        .max_log_files(RETAINED_FILES)
        .build(&log_dir)?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    // One JSON object per event; `device` sits next to the event fields.
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(file_writer)
        .with_target(true);

    // journald adds its own timestamp and unit name.
    let journal_layer = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_ansi(false)
        .with_target(false)
        .with_writer(stdout_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(journal_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/ensto-bridge")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "ensto-bridge")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_valid_path() {
        let dir = log_directory();
        assert!(dir.to_string_lossy().contains("ensto-bridge"));
    }

    #[test]
    fn test_filter_precedence() {
        assert_eq!(
            directives(Some("trace".into()), Some("debug"), Some("warn".into())),
            "trace"
        );
        assert_eq!(directives(None, Some("debug"), Some("warn".into())), "debug");
        assert_eq!(directives(Some(" ".into()), None, Some("warn".into())), "warn");
        assert_eq!(directives(None, None, None), DEFAULT_DIRECTIVES);
    }

    #[test]
    fn test_default_directives_parse() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
        assert!(EnvFilter::try_new("ensto_core=debug,rumqttc=warn").is_ok());
    }
}
