//! The logging collaborator used for diagnostic tracing.
//!
//! Reactors and producers never depend on a sink being present. They hold an
//! `Option<Arc<dyn LogSink>>` and skip all formatting when it is [`None`] or when
//! [`LogSink::enabled`] rejects the level.

use std::fmt;

pub use log::Level;

/// A destination for diagnostic messages.
pub trait LogSink: Send + Sync {
    /// Returns whether messages of `level` would be recorded.
    ///
    /// Callers check this before formatting a message.
    fn enabled(&self, level: Level) -> bool {
        let _ = level;
        true
    }

    /// Records a formatted message.
    fn log(&self, level: Level, message: fmt::Arguments<'_>);
}

/// Forwards messages to the [`log`] facade under the `reactor_demux` target.
///
/// If the application hasn't installed a logger, this does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFacade;

const TARGET: &str = "reactor_demux";

impl LogSink for LogFacade {
    fn enabled(&self, level: Level) -> bool {
        log::log_enabled!(target: TARGET, level)
    }

    fn log(&self, level: Level, message: fmt::Arguments<'_>) {
        log::log!(target: TARGET, level, "{message}");
    }
}

/// Emits a message to an `Option<&dyn LogSink>`, formatting it only when the sink wants it.
macro_rules! sink_log {
    ($sink:expr, $level:expr, $($arg:tt)+) => {
        if let Some(sink) = $sink {
            let level = $level;
            if $crate::sink::LogSink::enabled(sink, level) {
                $crate::sink::LogSink::log(sink, level, format_args!($($arg)+));
            }
        }
    };
}
