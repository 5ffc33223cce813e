use std::{fs, path::Path};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initializes the tracing subscriber with layered output:
/// 1. Stderr: formatted based on `log_json` and `verbose`. Stdout is left to
///    command output so `--json` stays machine readable.
/// 2. File: full JSON debug logs to `<log_dir>/<file_name>` when requested.
///
/// Returns a WorkerGuard that must be held by main() to ensure file logs are flushed.
pub fn init(
    verbose: bool,
    log_json: bool,
    log_file: Option<(&Path, &str)>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let registry = tracing_subscriber::registry();
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_env_filter(verbose));

    let (file_layer, guard) = match log_file {
        Some((log_dir, file_name)) => match fs::create_dir_all(log_dir) {
            Ok(()) => {
                let file_appender = tracing_appender::rolling::never(log_dir, file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                let layer = fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_filter(Targets::new().with_default(tracing::Level::DEBUG));
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("Warning: Failed to create log dir {}: {e}", log_dir.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    let console_layer: Box<dyn Layer<Registry> + Send + Sync> = if log_json {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
    } else if verbose {
        Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_filter(console_filter),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_level(true)
                .with_filter(console_filter),
        )
    };

    registry.with(console_layer).with(file_layer).init();

    guard
}

fn default_env_filter(verbose: bool) -> EnvFilter {
    let spec = if verbose {
        "vulcan_sentinel=debug,info"
    } else {
        "vulcan_sentinel=info,warn"
    };
    EnvFilter::new(spec)
}
