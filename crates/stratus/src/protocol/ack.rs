// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Completion registry: outstanding message ids mapped to caller
//! callbacks with deadlines.
//!
//! Ticked by elapsed milliseconds on every loop pass. Each handler fires
//! exactly once: on the matching ACK (success), on a RESET or coded error
//! response (mapped error), on deadline expiry (`Timeout`), or when the
//! registry is cleared by a disconnect (`Cancelled`).

use crate::protocol::{Error, Result};

/// Outcome callback for one tracked exchange.
pub type CompletionHandler = Box<dyn FnOnce(Result<()>)>;

struct Entry {
    message_id: u16,
    remaining_ms: i64,
    handler: CompletionHandler,
}

/// Timestamp-ordered completion handlers.
#[derive(Default)]
pub struct CompletionRegistry {
    entries: Vec<Entry>,
}

impl CompletionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one exchange.
    pub fn add(&mut self, message_id: u16, timeout_ms: u32, handler: CompletionHandler) {
        self.entries.push(Entry {
            message_id,
            remaining_ms: i64::from(timeout_ms),
            handler,
        });
    }

    /// Fire the handler for `message_id` with success.
    pub fn set_result(&mut self, message_id: u16) {
        self.complete(message_id, Ok(()));
    }

    /// Fire the handler for `message_id` with an error.
    pub fn set_error(&mut self, message_id: u16, error: Error) {
        self.complete(message_id, Err(error));
    }

    fn complete(&mut self, message_id: u16, outcome: Result<()>) {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.message_id == message_id)
        {
            let entry = self.entries.swap_remove(idx);
            (entry.handler)(outcome);
        }
    }

    /// Age all entries by the elapsed time; expired handlers fire with
    /// [`Error::Timeout`].
    pub fn update(&mut self, elapsed_ms: u64) {
        let elapsed = i64::try_from(elapsed_ms).unwrap_or(i64::MAX);
        let mut keep = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            entry.remaining_ms -= elapsed;
            if entry.remaining_ms <= 0 {
                log::debug!("[ack] exchange id={:#06x} timed out", entry.message_id);
                (entry.handler)(Err(Error::Timeout));
            } else {
                keep.push(entry);
            }
        }
        self.entries = keep;
    }

    /// Fire every pending handler with the given error and empty the
    /// registry (disconnect, shutdown).
    pub fn clear(&mut self, error: Error) {
        for entry in self.entries.drain(..) {
            (entry.handler)(Err(error));
        }
    }

    /// Number of outstanding handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
