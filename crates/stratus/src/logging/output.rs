// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Output destinations for the log sink.

use std::io::{self, Write};

/// Severity of a log record, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Fine-grained protocol tracing (record dumps, state transitions).
    Trace,
    /// Development diagnostics.
    Debug,
    /// Normal operational messages.
    Info,
    /// Recoverable anomalies (rate limiting, retransmissions exhausted).
    Warning,
    /// Failures that end the current session.
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warning,
            log::Level::Error => LogLevel::Error,
        }
    }
}

impl LogLevel {
    /// Short uppercase tag used in formatted output.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// A log output destination.
///
/// Implementations must be cheap to call; the protocol logs from inside the
/// driving loop.
pub trait Output: Send + Sync {
    /// Write one formatted record.
    fn write(&self, level: LogLevel, category: &str, message: &str) -> io::Result<()>;

    /// Flush any buffering.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Stderr output for development hosts.
pub struct ConsoleOutput;

impl ConsoleOutput {
    #[must_use]
    pub fn new() -> Self {
        ConsoleOutput
    }
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for ConsoleOutput {
    fn write(&self, level: LogLevel, category: &str, message: &str) -> io::Result<()> {
        let mut err = io::stderr().lock();
        writeln!(err, "{:5} [{}] {}", level.tag(), category, message)
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().lock().flush()
    }
}

/// Forwards every record to a host-supplied function.
///
/// This is the embedded path: the host owns the actual sink (serial port,
/// ring buffer, syslog bridge) and the core never touches I/O directly.
pub struct CallbackOutput {
    callback: Box<dyn Fn(LogLevel, &str, &str) + Send + Sync>,
}

impl CallbackOutput {
    /// Wrap a host log function `(level, category, message)`.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(LogLevel, &str, &str) + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl Output for CallbackOutput {
    fn write(&self, level: LogLevel, category: &str, message: &str) -> io::Result<()> {
        (self.callback)(level, category, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_level_from_log_crate() {
        assert_eq!(LogLevel::from(log::Level::Warn), LogLevel::Warning);
        assert_eq!(LogLevel::from(log::Level::Trace), LogLevel::Trace);
    }

    #[test]
    fn test_callback_output_forwards() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let output = CallbackOutput::new(move |level, category, message| {
            assert_eq!(level, LogLevel::Info);
            assert_eq!(category, "comm.coap");
            assert_eq!(message, "hello");
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        output
            .write(LogLevel::Info, "comm.coap", "hello")
            .expect("callback write");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_console_output_writes() {
        let output = ConsoleOutput::new();
        assert!(output.write(LogLevel::Debug, "test", "message").is_ok());
        assert!(output.flush().is_ok());
    }
}
