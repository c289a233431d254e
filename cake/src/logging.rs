use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Guard returned by `init`; drop it only on process exit so the
/// non-blocking file appender (if any) flushes its queue.
pub struct LogGuard(Option<tracing_appender::non_blocking::WorkerGuard>);

/// Install the global tracing subscriber: stderr always, plus an optional
/// rolling file layer when `log_dir` is set. Honors `RUST_LOG`, defaulting
/// to `info` when unset.
pub fn init(log_dir: Option<&std::path::Path>) -> LogGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "cake.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();

            LogGuard(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();

            LogGuard(None)
        }
    }
}
