pub use crate::config::{
    FinderConfig, MonitorConfig, SeederConfig, SynchronizerConfig, ValidatorConfig,
};
pub use crate::database::Database;
pub use crate::error::{BigBrotrError, Result};
pub use crate::models::{Event, EventRelay, Metadata, MetadataType, Network, Relay};
pub use crate::services::{
    Finder, Monitor, Outcome, Seeder, Service, Shutdown, Synchronizer, Validator, run_forever,
};

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::path::Path;

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod nips;
pub mod services;
pub mod transport;

static TRACING_GUARDS: OnceCell<(WorkerGuard, WorkerGuard)> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Initialize tracing once: a daily-rolling file appender plus stdout,
/// both non-blocking, filtered by `RUST_LOG` (or the level given on the
/// command line).
pub fn init_tracing(logs_dir: &Path, default_level: &str) {
    let default_level = default_level.to_string();
    TRACING_INIT.get_or_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("bigbrotr")
            .filename_suffix("log")
            .build(logs_dir)
            .expect("Failed to create file appender");

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS.set((file_guard, stdout_guard)).ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        Registry::default()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with(stdout_layer)
            .with(file_layer)
            .init();
    });
}
