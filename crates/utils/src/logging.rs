//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// `RUST_LOG` overrides `default_level`. Logs go to stderr so that stdout
/// stays free for command output such as exported handles.
pub fn init(default_level: filter::LevelFilter) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    if registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
}
