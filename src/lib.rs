//! screenrec - screen, microphone and webcam recording with post-processing.
//!
//! This is the main library crate for the `screenrec` command line tool.
//! It provides the recording session supervisor, the post-processing
//! pipeline and the command handlers behind the CLI.
//!
//! Capture processes are supervised through unix signals, so only unix
//! targets (Linux, macOS) are supported.

#[cfg(not(unix))]
compile_error!("screenrec supervises captures with unix signals and builds on unix targets only");

pub mod commands;
pub mod config;
pub mod pipeline;
pub mod project;
pub mod recorder;
pub mod utils;

pub use config::Settings;
pub use recorder::{ProcessSupervisor, RecordingOptions, RecordingStatus};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging; `RUST_LOG` overrides the default filter
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screenrec=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!("screenrec v{}", env!("CARGO_PKG_VERSION"));
}
