//! Logging setup shared by every binary in the workspace.
//!
//! Builds a [`slog`] logger that stamps every record with a timestamp, level
//! and the key/value pairs of its child loggers, routes records at `Error`
//! and above to stderr and everything below to stdout, and optionally
//! duplicates the stream into an append-only file.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Level, Logger};

use chrono::Local;
use slog::{Drain, Duplicate, LevelFilter, Never, OwnedKVList, Record};
use slog_term::{FullFormat, PlainSyncDecorator};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

/// Routes each record to one of two inner drains based on severity.
struct RouteDrain<O, E> {
    out: O,
    err: E,
}

impl<O, E> Drain for RouteDrain<O, E>
where
    O: Drain<Ok = (), Err = Never>,
    E: Drain<Ok = (), Err = Never>,
{
    type Ok = ();
    type Err = Never;

    fn log(&self, record: &Record, values: &OwnedKVList) -> Result<(), Never> {
        match record.level() {
            Level::Critical | Level::Error => self.err.log(record, values),
            _ => self.out.log(record, values),
        }
    }
}

fn timestamp(out: &mut dyn io::Write) -> io::Result<()> {
    write!(out, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
}

fn format_drain<W>(sink: W) -> impl Drain<Ok = (), Err = Never>
where
    W: io::Write + Send + 'static,
{
    FullFormat::new(PlainSyncDecorator::new(sink))
        .use_custom_timestamp(timestamp)
        .build()
        .ignore_res()
}

/// Construct the root logger. Records below `min_level` are discarded. When
/// `log_file` is given, every surviving record is also appended to that file.
pub fn build_logger(min_level: Level, log_file: Option<&Path>) -> io::Result<Logger> {
    let console = RouteDrain {
        out: format_drain(io::stdout()),
        err: format_drain(io::stderr()),
    };

    let logger = match log_file {
        Some(path) => {
            let sink = OpenOptions::new().create(true).append(true).open(path)?;
            let drain = Duplicate::new(console, format_drain(sink));
            Logger::root(LevelFilter::new(drain, min_level).ignore_res(), o!())
        }
        None => Logger::root(LevelFilter::new(console, min_level).ignore_res(), o!()),
    };

    Ok(logger)
}
