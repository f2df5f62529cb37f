// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Keepalive scheduling.
//!
//! The pinger watches the time since the last message in either direction
//! and asks for an empty CON ping when the interval elapses. The interval
//! has two writers, the system profile and the user override; a user
//! override sticks until the user changes it again.

/// Who last set the keepalive interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveSource {
    System,
    User,
}

/// Keepalive scheduler.
#[derive(Debug)]
pub struct Pinger {
    ping_interval_ms: u64,
    source: KeepAliveSource,
}

impl Pinger {
    /// Disabled pinger; call [`Pinger::init`] with the link profile.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ping_interval_ms: 0,
            source: KeepAliveSource::System,
        }
    }

    /// Install the link profile's interval.
    pub fn init(&mut self, interval_ms: u64) {
        self.ping_interval_ms = interval_ms;
        self.source = KeepAliveSource::System;
    }

    /// Update the interval.
    ///
    /// A system update never displaces a user override:
    ///
    /// | last   | current | applied? |
    /// |--------|---------|----------|
    /// | System | System  | yes      |
    /// | System | User    | yes      |
    /// | User   | System  | no       |
    /// | User   | User    | yes      |
    pub fn set_interval(&mut self, interval_ms: u64, source: KeepAliveSource) {
        if self.source == KeepAliveSource::User && source == KeepAliveSource::System {
            return;
        }
        self.ping_interval_ms = interval_ms;
        self.source = source;
    }

    /// Current interval (0 = disabled).
    #[must_use]
    pub fn interval_ms(&self) -> u64 {
        self.ping_interval_ms
    }

    /// True when a keepalive should be sent now.
    #[must_use]
    pub fn should_ping(&self, millis_since_last_message: u64) -> bool {
        self.ping_interval_ms != 0 && self.ping_interval_ms < millis_since_last_message
    }
}

impl Default for Pinger {
    fn default() -> Self {
        Self::new()
    }
}
