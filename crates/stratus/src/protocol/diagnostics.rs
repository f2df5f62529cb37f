// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Diagnostic registry: 16-bit keys mapped to 32-bit signed values,
//! serialized into the binary describe payload.
//!
//! Per-key semantics:
//!
//! - counters (disconnects, attempts, unacked messages) accumulate;
//! - signal figures are fixed-point, 8.8 for RSSI/strength/quality and
//!   16.16 for their `-value` variants;
//! - the country code is negated when below 100 to mark the 2-digit form;
//! - everything else stores the raw value.
//!
//! The wire form is a little-endian sequence of 6-byte records
//! `key(2) | value(4)`, ordered by key so identical state serializes to
//! identical bytes.

use std::collections::BTreeMap;

/// System-scope diagnostic keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DiagnosticSystem {
    LastResetReason = 1,
    FreeMemory = 2,
    BatteryCharge = 3,
    SystemLoops = 4,
    ApplicationLoops = 5,
    Uptime = 6,
    BatteryState = 7,
    PowerSource = 24,
    TotalRam = 25,
    UsedRam = 26,
}

/// Network-scope diagnostic keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DiagnosticNetwork {
    ConnectionStatus = 8,
    ConnectionErrorCode = 9,
    Disconnects = 12,
    Ipv4Address = 15,
    Ipv4Gateway = 16,
    Flags = 17,
    CountryCode = 18,
    Rssi = 19,
    ConnectionAttempts = 27,
    DisconnectionReason = 28,
    SignalStrength = 33,
    SignalQuality = 34,
    SignalQualityValue = 35,
    AccessTechnology = 36,
    SignalStrengthValue = 37,
    CellGlobalIdentityMobileCountryCode = 40,
    CellGlobalIdentityMobileNetworkCode = 41,
    CellGlobalIdentityLocationAreaCode = 42,
    CellGlobalIdentityCellId = 43,
    MacAddressOui = 91,
    MacAddressNic = 92,
}

/// Cloud-scope diagnostic keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DiagnosticCloud {
    ConnectionStatus = 10,
    ConnectionErrorCode = 13,
    Disconnects = 14,
    RateLimitedEvents = 20,
    RepeatedMessages = 21,
    UnacknowledgedMessages = 22,
    ConnectionAttempts = 29,
    DisconnectionReason = 30,
    CoapRoundTrip = 31,
}

/// Convert a float to 8.8 or 16.16 fixed point.
fn fixed_point(value: f64, shift_bytes: u32) -> i32 {
    let int_part = value.trunc();
    let fract_part = value.fract();
    if shift_bytes == 1 {
        ((int_part as i32) << 8) | ((fract_part * 256.0) as i32 & 0xFF)
    } else {
        ((int_part as i32) << 16) | ((fract_part * 256.0 * 256.0) as i32 & 0xFFFF)
    }
}

/// The key→value registry.
#[derive(Debug, Default)]
pub struct DiagnosticRegistry {
    values: BTreeMap<u16, i32>,
}

impl DiagnosticRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a system-scope value.
    pub fn system(&mut self, key: DiagnosticSystem, value: f64) {
        let stored = match key {
            DiagnosticSystem::BatteryCharge => fixed_point(value, 1),
            _ => value as i32,
        };
        self.set(key as u16, stored);
    }

    /// Record a network-scope value.
    pub fn network(&mut self, key: DiagnosticNetwork, value: f64) {
        let stored = match key {
            DiagnosticNetwork::CountryCode => {
                let raw = value as i32;
                if raw < 100 {
                    -raw
                } else {
                    raw
                }
            }
            DiagnosticNetwork::Rssi
            | DiagnosticNetwork::SignalStrength
            | DiagnosticNetwork::SignalQuality => fixed_point(value, 1),
            DiagnosticNetwork::SignalStrengthValue
            | DiagnosticNetwork::SignalQualityValue => fixed_point(value, 2),
            DiagnosticNetwork::Disconnects | DiagnosticNetwork::ConnectionAttempts => {
                self.get(key as u16).saturating_add(value as i32)
            }
            _ => value as i32,
        };
        self.set(key as u16, stored);
    }

    /// Record a cloud-scope value.
    pub fn cloud(&mut self, key: DiagnosticCloud, value: f64) {
        let stored = match key {
            DiagnosticCloud::Disconnects
            | DiagnosticCloud::ConnectionAttempts
            | DiagnosticCloud::UnacknowledgedMessages => {
                self.get(key as u16).saturating_add(value as i32)
            }
            _ => value as i32,
        };
        self.set(key as u16, stored);
    }

    /// Raw value for a key (0 when never recorded).
    #[must_use]
    pub fn get(&self, key: u16) -> i32 {
        self.values.get(&key).copied().unwrap_or(0)
    }

    fn set(&mut self, key: u16, value: i32) {
        log::trace!("[diag] {}={}", key, value);
        self.values.insert(key, value);
    }

    /// Number of recorded keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Serialize as the binary describe payload body.
    pub fn append_metrics(&self, out: &mut Vec<u8>) {
        for (&key, &value) in &self.values {
            out.extend_from_slice(&key.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}
