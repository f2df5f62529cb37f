// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Broker time synchronization.
//!
//! One GET to `/t` per sync; duplicate requests while a response is
//! outstanding are suppressed. The sync moment is remembered so hosts can
//! extrapolate wall-clock time between syncs.

/// Time-request bookkeeping.
#[derive(Debug, Default)]
pub struct TimeSync {
    last_sync_millis: u64,
    request_sent_millis: u64,
    last_sync_time: u32,
    expecting_response: bool,
}

impl TimeSync {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget any outstanding request (session restart).
    pub fn reset(&mut self) {
        self.expecting_response = false;
        self.request_sent_millis = 0;
    }

    /// Decide whether a request should go out; true means "send now".
    ///
    /// Returns false while a response is already outstanding.
    pub fn begin_request(&mut self, now: u64) -> bool {
        if self.expecting_response {
            return false;
        }
        self.request_sent_millis = now;
        self.expecting_response = true;
        log::info!("[time] requesting broker time");
        true
    }

    /// Record the broker's answer; returns the time to hand to the host.
    pub fn handle_response(&mut self, time: u32, now: u64) -> u32 {
        log::info!("[time] broker time {}", time);
        self.expecting_response = false;
        self.last_sync_time = time;
        self.last_sync_millis = now;
        time
    }

    /// True while a request is in flight.
    #[must_use]
    pub fn is_request_pending(&self) -> bool {
        self.expecting_response
    }

    /// Last synced time and the loop millis it arrived at.
    #[must_use]
    pub fn last_sync(&self) -> (u32, u64) {
        (self.last_sync_time, self.last_sync_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_requests_suppressed() {
        let mut sync = TimeSync::new();
        assert!(sync.begin_request(100));
        assert!(!sync.begin_request(200));
        assert!(sync.is_request_pending());
    }

    #[test]
    fn test_response_reopens_requests() {
        let mut sync = TimeSync::new();
        sync.begin_request(100);
        assert_eq!(sync.handle_response(1_700_000_000, 150), 1_700_000_000);
        assert!(!sync.is_request_pending());
        assert_eq!(sync.last_sync(), (1_700_000_000, 150));
        assert!(sync.begin_request(400));
    }

    #[test]
    fn test_reset_clears_pending() {
        let mut sync = TimeSync::new();
        sync.begin_request(100);
        sync.reset();
        assert!(!sync.is_request_pending());
        assert!(sync.begin_request(200));
    }
}
