use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Destination for broker logs.
pub enum LogTarget {
    Stdout,
    /// Daily-rolling files under `dir`, named after `prefix`.
    RollingFile { dir: String, prefix: String },
}

/// Install the global subscriber and hand back the guard that keeps the
/// background log writer alive. The selector thread never blocks on log
/// output; the writer drains on its own thread.
pub fn init_tracing(level: tracing::Level, target: LogTarget) -> Result<WorkerGuard> {
    match target {
        LogTarget::Stdout => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            tracing_subscriber::registry()
                .with(broker_filter(level))
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_target(true)
                        .compact(),
                )
                .init();
            Ok(guard)
        }
        LogTarget::RollingFile { dir, prefix } => {
            let appender = tracing_appender::rolling::daily(dir, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(broker_filter(level))
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true)
                        .compact(),
                )
                .init();
            Ok(guard)
        }
    }
}

/// This crate at the requested level; mio and rustls capped at warn so a
/// trace run stays readable.
fn broker_filter(level: tracing::Level) -> EnvFilter {
    let level = level.as_str().to_lowercase();
    EnvFilter::builder()
        .with_default_directive(tracing::Level::WARN.into())
        .parse_lossy(format!("mqtt_broker_mio={level},mio=warn,rustls=warn"))
}
