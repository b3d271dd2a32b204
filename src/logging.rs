use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::BundleConfig;

pub const LOG_FILE_PREFIX: &str = "clinic-bundle.log";

/// Keeps the non-blocking file writer alive. Drop it last.
#[must_use]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Install the process-wide subscriber.
///
/// JSON lines go to stderr so stdout stays free for reports. When
/// `log_dir` is configured a daily-rolling file sink is added beside it.
/// `log` records (sqlx) are bridged into tracing.
pub fn init(config: &BundleConfig) -> anyhow::Result<LoggingGuard> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("parse log filter {:?}", config.log_filter))?;

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer);

    let _ = tracing_log::LogTracer::init();
    tracing::subscriber::set_global_default(subscriber)
        .context("install tracing subscriber")?;

    Ok(LoggingGuard { _file: guard })
}
