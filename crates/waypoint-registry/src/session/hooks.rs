//! Session observers: retry hooks and the log sink.

use tracing::Level;

/// Callback fired around lease recovery attempts.
///
/// Any `Fn()` closure is a hook.
pub trait RetryHook: Send + Sync {
    fn on_retry(&self);
}

impl<F> RetryHook for F
where
    F: Fn() + Send + Sync,
{
    fn on_retry(&self) {
        self()
    }
}

/// Destination for a session's or cache's own log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Default sink: forwards to `tracing` at the given level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!("{message}"),
            Level::WARN => tracing::warn!("{message}"),
            Level::INFO => tracing::info!("{message}"),
            Level::DEBUG => tracing::debug!("{message}"),
            Level::TRACE => tracing::trace!("{message}"),
        }
    }
}
