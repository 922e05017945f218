//! Tracing bootstrap for hosts embedding the engine. Library code only
//! emits events; a binary host calls `init_tracing` once at startup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking file writer alive; drop it to flush.
pub struct FileLogGuard {
    _guard: WorkerGuard,
}

pub fn file_logging_enabled() -> bool {
    std::env::var("ENABLE_FILE_LOGS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

pub fn init_tracing(log_level: &str) -> Option<FileLogGuard> {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let base = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true));

    if !file_logging_enabled() {
        base.init();
        return None;
    }

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {log_dir}: {err}");
        base.init();
        return None;
    }

    let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "exam-engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    base.with(
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_target(true),
    )
    .init();
    Some(FileLogGuard { _guard: guard })
}
