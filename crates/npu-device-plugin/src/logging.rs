//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::Registry;

/// initiate the global tracing subscriber
///
/// `RUST_LOG` directives apply on top of the `info` default.
pub(crate) fn init<P: AsRef<Path>>(log_path: Option<P>) -> Option<WorkerGuard> {
    let (fmt_layer, guard) = utils::logging::get_fmt_layer::<Registry, _>(log_path);

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    registry().with(fmt_layer.with_filter(env_filter)).init();
    guard
}
