//! Thin wrapper around `slog` so the rest of the workspace can write
//! `logging::debug!(log, "..."; "k" => v)` without pulling in `slog` directly.
pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the root logger for a standalone process (master, router daemon, ...).
/// Library code should never call this; it belongs to whatever binary assembles the
/// network, which then hands child loggers down via `log.new(o!(...))`.
pub fn root_logger(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().unwrap_or_else(|_| Logger::root(Discard, o!()))
}

/// A logger that discards everything, used as the default when a component is built
/// without an explicit parent logger (unit tests, ad-hoc scripts).
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
