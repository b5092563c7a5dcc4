//! Logging initialization and access to the root logger.

use super::settings::{LogFormat, LogOutput, LoggingSettings};
use crate::{BootstrapResult, ServiceInfo};
use once_cell::sync::OnceCell;
use slog::{Drain, Fuse, Logger};
use slog_async::Async as AsyncDrain;
use slog_json::Json as JsonDrain;
use slog_term::{FullFormat as TextDrain, PlainDecorator, TermDecorator};
use std::fs::File;
use std::io;

static ROOT: OnceCell<Logger> = OnceCell::new();

// NOTE: the slog-async default of 128 is easy to overflow with per-request
// records on a busy proxy.
const CHANNEL_SIZE: usize = 1024;

/// Initializes the root logger.
///
/// Does nothing if logging has already been initialized in this process.
pub fn init(service_info: &ServiceInfo, settings: &LoggingSettings) -> BootstrapResult<()> {
    if ROOT.get().is_some() {
        return Ok(());
    }

    let base_drain = get_base_drain(settings)?;
    let drain = base_drain
        .filter_level(settings.verbosity.into())
        .fuse();

    let root = Logger::root(
        drain,
        slog::o!(
            "version" => service_info.version,
            "pid" => std::process::id(),
        ),
    );

    let _ = ROOT.set(root);

    Ok(())
}

/// Returns the root logger.
///
/// Records logged before [`init`] are discarded.
pub fn root() -> Logger {
    match ROOT.get() {
        Some(log) => log.clone(),
        None => Logger::root(slog::Discard, slog::o!()),
    }
}

/// Returns a child logger tagged with the given subsystem name.
pub fn subsystem(name: &'static str) -> Logger {
    root().new(slog::o!("subsystem" => name))
}

fn get_base_drain(settings: &LoggingSettings) -> BootstrapResult<AsyncDrain> {
    Ok(match (&settings.output, &settings.format) {
        (LogOutput::Terminal, LogFormat::Text) => {
            let drain = TextDrain::new(TermDecorator::new().stdout().build())
                .build()
                .fuse();
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
        (LogOutput::Terminal, LogFormat::Json) => {
            let drain = build_json_log_drain(io::stdout());
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
        (LogOutput::File(file), LogFormat::Text) => {
            let drain = TextDrain::new(PlainDecorator::new(File::create(file)?))
                .build()
                .fuse();
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
        (LogOutput::File(file), LogFormat::Json) => {
            let drain = build_json_log_drain(File::create(file)?);
            AsyncDrain::new(drain).chan_size(CHANNEL_SIZE).build()
        }
    })
}

fn build_json_log_drain<O>(output: O) -> Fuse<JsonDrain<O>>
where
    O: io::Write + Send + 'static,
{
    JsonDrain::new(output)
        .add_default_keys()
        .set_pretty(false)
        .build()
        .fuse()
}
