//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable that points the log output at a file instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "NPU_PLUGIN_LOG_PATH";

/// Number of rotated log files kept on disk.
const MAX_LOG_FILES: usize = 3;

/// Boxed formatting layer, erased over the subscriber it is attached to.
pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Build the formatting layer shared by all binaries.
///
/// Without a path the layer writes to stderr. With a path, events go to a daily
/// rolling file next to it and the returned guard must be kept alive until exit,
/// otherwise buffered lines are lost.
pub fn get_fmt_layer<S, P>(log_path: Option<P>) -> (BoxedLayer<S>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    P: AsRef<Path>,
{
    let Some(log_path) = log_path else {
        return (stderr_layer(), None);
    };

    let log_path = log_path.as_ref();
    let directory = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("npu-device-plugin.log");

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
    {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let fmt_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (fmt_layer, Some(guard))
        }
        Err(e) => {
            eprintln!(
                "failed to create rolling log file at {}: {e}, logging to stderr",
                log_path.display()
            );
            (stderr_layer(), None)
        }
    }
}

fn stderr_layer<S>() -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed()
}
