// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Reconnect backoff with jitter.
//!
//! The first attempt after a disconnect waits one second; each following
//! attempt doubles from a 7.5 s base and the ladder stops at retry 4,
//! where it reaches the 60 s ceiling. Every delay is scaled by a random
//! factor in `[1.0, 1.512)`. The retry counter resets after a session
//! reaches Ready, and stays pinned at zero until the device has ever
//! connected successfully, so a brand-new device keeps retrying fast.

use crate::config::{
    RECONNECT_BASE_MS, RECONNECT_CAP_MS, RECONNECT_JITTER_MILLI, RECONNECT_RETRY_CAP,
    RECONNECT_STEP_MS,
};

/// Reconnect scheduling state.
#[derive(Debug)]
pub struct ReconnectBackoff {
    retry_count: u32,
    ever_connected: bool,
    next_attempt_at: Option<u64>,
}

impl ReconnectBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry_count: 0,
            ever_connected: false,
            next_attempt_at: None,
        }
    }

    /// Current retry count (for diagnostics).
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Delay before attempt `retry` (before jitter), in ms.
    ///
    /// Retry 0 waits [`RECONNECT_BASE_MS`]; retries 1..=4 double from
    /// [`RECONNECT_STEP_MS`] and reach the ceiling exactly at the retry
    /// cap.
    #[must_use]
    pub fn base_delay_ms(retry: u32) -> u32 {
        if retry == 0 {
            RECONNECT_BASE_MS
        } else {
            let exponent = retry.min(RECONNECT_RETRY_CAP) - 1;
            let doubled = RECONNECT_STEP_MS.saturating_mul(1 << exponent);
            doubled.min(RECONNECT_CAP_MS)
        }
    }

    /// Schedule the next attempt after a failure at `now`.
    ///
    /// `jitter` is a fresh random word; the delay is scaled by
    /// `1 + (jitter % 512)/1000`.
    pub fn schedule(&mut self, now: u64, jitter: u32) {
        let base = u64::from(Self::base_delay_ms(self.retry_count));
        let scale = 1_000 + u64::from(jitter % RECONNECT_JITTER_MILLI);
        let delay = base * scale / 1_000;
        self.next_attempt_at = Some(now + delay);
        log::info!(
            "[supervisor] reconnect in {} ms (retry {})",
            delay,
            self.retry_count
        );
        // A device that has never connected keeps retrying at the base
        // cadence instead of backing off; otherwise the retry index stops
        // advancing at the cap, where the ceiling delay binds.
        if self.ever_connected {
            self.retry_count = self.retry_count.saturating_add(1).min(RECONNECT_RETRY_CAP);
        }
    }

    /// True when the scheduled attempt time has arrived.
    #[must_use]
    pub fn due(&self, now: u64) -> bool {
        match self.next_attempt_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// A session reached Ready: reset the ladder.
    pub fn on_success(&mut self) {
        self.retry_count = 0;
        self.ever_connected = true;
        self.next_attempt_at = None;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}
