//! Tracing subscriber setup for hosts embedding the session manager.

use sheetkeep_config::LoggingSection;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{Error, Result};

/// Filter applied to the rolling file layer.
const FILE_FILTER: &str = "sheetkeep=trace,info";

/// File name stem for the daily-rolling log.
const LOG_FILE: &str = "sheetkeep.log";

/// Install the global subscriber: a console layer filtered by
/// `logging.filter`, plus a daily-rolling JSON file layer when
/// `logging.directory` is set.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Fails if the filter does not parse or a global
/// subscriber is already installed.
pub fn init_tracing(logging: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let console_filter = EnvFilter::try_new(&logging.filter)
        .map_err(|e| Error::Telemetry(format!("invalid filter '{}': {e}", logging.filter)))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if logging.json {
        layers.push(fmt::layer().json().with_filter(console_filter).boxed());
    } else {
        layers.push(
            fmt::layer()
                .with_target(true)
                .with_filter(console_filter)
                .boxed(),
        );
    }

    let guard = logging.directory.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new(FILE_FILTER))
                .boxed(),
        );
        guard
    });

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| Error::Telemetry(e.to_string()))?;
    Ok(guard)
}
