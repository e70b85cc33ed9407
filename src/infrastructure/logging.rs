use crate::domain::settings::{LogRotation, LogSettings};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the non-blocking file writer alive so buffered lines are flushed
pub struct LoggingGuard {
    _guards: Vec<WorkerGuard>,
}

/// `RUST_LOG` wins over the configured level
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

/// Relative log directories live next to the settings file
fn resolve_log_dir(log_dir: &str) -> PathBuf {
    let dir = PathBuf::from(log_dir);
    if dir.is_absolute() {
        return dir;
    }
    dirs::config_dir()
        .map(|base| base.join("BeatXPConnect").join(&dir))
        .unwrap_or(dir)
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let mut log_dir = None;
    let file_layer = if settings.file_logging_enabled {
        let dir = resolve_log_dir(&settings.log_dir);
        std::fs::create_dir_all(&dir)?;

        let appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(rotation(settings.rotation))
            .filename_prefix(&settings.file_name_prefix)
            .filename_suffix("log")
            .build(&dir)?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        log_dir = Some(dir);

        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter(&settings.level))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if let Some(dir) = &log_dir {
        tracing::info!("Writing logs to {}", dir.display());
    }

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_mapping() {
        assert_eq!(rotation(LogRotation::Hourly), Rotation::HOURLY);
        assert_eq!(rotation(LogRotation::Never), Rotation::NEVER);
        assert_eq!(rotation(LogRotation::default()), Rotation::DAILY);
    }

    #[test]
    fn test_absolute_log_dir_is_kept() {
        let dir = std::env::temp_dir().join("beatxp_logs");
        assert_eq!(resolve_log_dir(dir.to_str().unwrap()), dir);
    }

    #[test]
    fn test_relative_log_dir_is_nested() {
        let resolved = resolve_log_dir("logs");
        assert!(resolved.ends_with("logs"));
    }
}
