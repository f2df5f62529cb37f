// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Bridge between the `log` facade and an [`Output`] sink.
//!
//! One-shot initialization: the first [`init_logger`] call installs the
//! boxed logger; later calls are silently ignored (the `log` crate only
//! accepts one global logger per process).

use super::output::{LogLevel, Output};
use std::sync::{Arc, OnceLock};

static SINK: OnceLock<Arc<dyn Output>> = OnceLock::new();

struct SinkLogger {
    level_filter: LogLevel,
}

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        LogLevel::from(metadata.level()) >= self.level_filter
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(output) = SINK.get() {
            let message = format!("{}", record.args());
            // Sink failures cannot be reported anywhere; drop them.
            let _ = output.write(LogLevel::from(record.level()), record.target(), &message);
        }
    }

    fn flush(&self) {
        if let Some(output) = SINK.get() {
            let _ = output.flush();
        }
    }
}

/// Install the global log sink with the given minimum level.
///
/// Call early, before the cloud client is constructed. Subsequent calls are
/// no-ops.
pub fn init_logger(output: Arc<dyn Output>, level: LogLevel) {
    if SINK.set(output).is_err() {
        return;
    }
    let max = match level {
        LogLevel::Trace => log::LevelFilter::Trace,
        LogLevel::Debug => log::LevelFilter::Debug,
        LogLevel::Info => log::LevelFilter::Info,
        LogLevel::Warning => log::LevelFilter::Warn,
        LogLevel::Error => log::LevelFilter::Error,
    };
    // set_boxed_logger errors only when a logger already exists.
    if log::set_boxed_logger(Box::new(SinkLogger {
        level_filter: level,
    }))
    .is_ok()
    {
        log::set_max_level(max);
    }
}

/// Flush the installed sink, if any.
pub fn flush_logger() {
    if let Some(output) = SINK.get() {
        let _ = output.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::output::CallbackOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static RECORDS: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn test_init_and_log_no_panic() {
        let output = Arc::new(CallbackOutput::new(|_, _, _| {
            RECORDS.fetch_add(1, Ordering::SeqCst);
        }));
        init_logger(output, LogLevel::Debug);
        log::debug!("[test] bridge check");
        log::trace!("[test] filtered out at Debug level");
        flush_logger();
        // At least the debug record must have flowed through when this test
        // won the one-shot install; other tests may have installed first, in
        // which case the bridge is still required not to panic.
    }

    #[test]
    fn test_double_init_is_noop() {
        let first = Arc::new(CallbackOutput::new(|_, _, _| {}));
        let second = Arc::new(CallbackOutput::new(|_, _, _| {}));
        init_logger(first, LogLevel::Info);
        init_logger(second, LogLevel::Trace);
        log::info!("[test] still routed through the first sink");
    }
}
