// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Stratus global configuration - single source of truth.
//!
//! This module centralizes protocol constants and per-link-type timeout
//! defaults. **Never hardcode elsewhere!**
//!
//! Two levels:
//!
//! - **Static**: compile-time constants (CoAP timers, wire limits, broker
//!   endpoint).
//! - **Per-connection**: [`ConnectionProperties`] derived from
//!   [`ConnectionType`], overridable by the host before `connect()`.

// =======================================================================
// Broker endpoint
// =======================================================================

/// UDP port of the cloud broker (CoAPS, RFC 7252 Sec.12.7).
pub const BROKER_PORT: u16 = 5684;

/// Broker host suffix; the full host is `<device-id-hex>.` + this.
pub const BROKER_HOST_SUFFIX: &str = "udp.device.trackle.io";

// =======================================================================
// Identity and key material sizes
// =======================================================================

/// Device identifier length in bytes.
pub const DEVICE_ID_LEN: usize = 12;

/// DER-encoded ECDSA P-256 device private key length (SEC1 ECPrivateKey).
pub const PRIVATE_KEY_LEN: usize = 122;

/// DER-encoded pinned broker public key length (SubjectPublicKeyInfo).
pub const PUBLIC_KEY_LEN: usize = 92;

/// Upper bound of the opaque persisted DTLS session blob.
///
/// Fixed header plus the variable trailer; hosts must provide at least this
/// much storage to the session-persistence callback.
pub const SESSION_BLOB_MAX: usize = 272;

// =======================================================================
// CoAP reliability timers (RFC 7252 Sec.4.2, tuned per link type)
// =======================================================================

/// Maximum number of retransmissions of a confirmable message.
pub const MAX_RETRANSMIT: u8 = 4;

/// Total window a confirmable exchange may stay in flight (ms).
///
/// `ACK_TIMEOUT * ((2 ** (MAX_RETRANSMIT + 1)) - 1) * ACK_RANDOM_FACTOR`
/// rounded up to the RFC 7252 default of 93 s.
pub const MAX_TRANSMIT_WAIT_MS: u32 = 93_000;

/// Additional window granted to the Hello acknowledgement after the
/// DTLS handshake completes (ms).
pub const HELLO_ACK_TIMEOUT_MS: u32 = 4_000;

// =======================================================================
// Application protocol limits
// =======================================================================

/// Maximum length of a registered function or variable key.
pub const MAX_KEY_LEN: usize = 64;

/// Maximum length of a function/variable call argument.
pub const MAX_ARG_LEN: usize = 622;

/// Maximum length of an event name.
pub const MAX_EVENT_NAME_LEN: usize = 63;

/// Maximum length of the claim code.
pub const CLAIM_CODE_LEN: usize = 63;

/// Single CoAP block payload size for block-wise transfer (SZX=6).
pub const MAX_BLOCK_SIZE: usize = 1024;

/// Maximum number of blocks in one outbound block-wise publish.
pub const MAX_BLOCKS_NUMBER: usize = 5;

/// Maximum simultaneously running block-publish transactions.
pub const MAX_CONCURRENT_MESSAGES: usize = 4;

/// Default event time-to-live (seconds); the TTL option is elided on the
/// wire when a publish uses this value.
pub const DEFAULT_TTL: u32 = 60;

/// Completion deadline for an event published with an ACK request (ms).
pub const SEND_EVENT_ACK_TIMEOUT_MS: u32 = 20_000;

// =======================================================================
// Publish identifier scheme
// =======================================================================

/// Publish counter wraps below this bound.
pub const PUBLISH_COUNTER_MAX: u32 = 9_999_999;

/// Multiplier applied to the random publish prefix.
///
/// Publish ids are `prefix * PUBLISH_PREFIX_SCALE + counter` with
/// `prefix in [1, 199]`, so ids land in `[10_000_000, 1_999_999_999]`
/// without persistent state across reboots.
pub const PUBLISH_PREFIX_SCALE: u32 = 10_000_000;

/// Upper bound (inclusive) of the random publish prefix.
pub const PUBLISH_PREFIX_MAX: u32 = 199;

// =======================================================================
// Supervisor timers
// =======================================================================

/// Diagnostic refresh cadence inside the driving loop (ms).
pub const DIAGNOSTIC_REFRESH_MS: u32 = 5_000;

/// First reconnect attempt delay (ms).
pub const RECONNECT_BASE_MS: u32 = 1_000;

/// Doubling base for reconnect attempts after the first (ms); retries
/// 1..=4 walk 7.5 s, 15 s, 30 s, 60 s, hitting the ceiling at retry 4.
pub const RECONNECT_STEP_MS: u32 = 7_500;

/// Reconnect backoff ceiling (ms).
pub const RECONNECT_CAP_MS: u32 = 60_000;

/// Retry index where the backoff ladder stops advancing.
pub const RECONNECT_RETRY_CAP: u32 = 4;

/// Jitter numerator: backoff is scaled by `1 + U(0, 512)/1000`.
pub const RECONNECT_JITTER_MILLI: u32 = 512;

// =======================================================================
// Link-type profiles
// =======================================================================

/// Physical link the device reaches the broker through.
///
/// Selects the default timeout profile; see [`ConnectionProperties::for_link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// 802.11 Wi-Fi.
    WiFi,
    /// Wired Ethernet.
    Ethernet,
    /// LTE cellular.
    Lte,
    /// Narrowband IoT cellular.
    NbIot,
    /// LTE Cat-M cellular.
    CatM,
}

impl ConnectionType {
    /// True for cellular links (longer round trips, slower handshakes).
    #[must_use]
    pub fn is_cellular(self) -> bool {
        matches!(self, Self::Lte | Self::NbIot | Self::CatM)
    }
}

/// Per-link timeout profile.
///
/// The three timers the protocol layers consume. Constructed from the link
/// type; the host may override the ping interval afterwards (the supervisor
/// caps it at [`ConnectionProperties::PING_INTERVAL_CAP_MS`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionProperties {
    /// Keepalive interval (ms): an empty CON ping is sent when no message
    /// has crossed the channel for this long.
    pub ping_interval_ms: u32,
    /// Initial retransmission timeout for confirmable messages (ms).
    pub ack_timeout_ms: u32,
    /// Bound on the DTLS handshake, from first flight to Finished (ms).
    pub handshake_timeout_ms: u32,
}

impl ConnectionProperties {
    /// Largest ping interval a host override may request (ms).
    pub const PING_INTERVAL_CAP_MS: u32 = 23 * 60 * 1_000;

    /// Default profile for the given link type.
    #[must_use]
    pub fn for_link(link: ConnectionType) -> Self {
        if link.is_cellular() {
            Self {
                ping_interval_ms: 150_000,
                ack_timeout_ms: 5_000,
                handshake_timeout_ms: 20_000,
            }
        } else {
            Self {
                ping_interval_ms: 30_000,
                ack_timeout_ms: 2_000,
                handshake_timeout_ms: 10_000,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cellular_profile_is_slower() {
        let wifi = ConnectionProperties::for_link(ConnectionType::WiFi);
        let lte = ConnectionProperties::for_link(ConnectionType::Lte);
        assert!(lte.ping_interval_ms > wifi.ping_interval_ms);
        assert!(lte.ack_timeout_ms > wifi.ack_timeout_ms);
        assert!(lte.handshake_timeout_ms > wifi.handshake_timeout_ms);
    }

    #[test]
    fn test_wifi_defaults() {
        let p = ConnectionProperties::for_link(ConnectionType::WiFi);
        assert_eq!(p.ping_interval_ms, 30_000);
        assert_eq!(p.ack_timeout_ms, 2_000);
        assert_eq!(p.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn test_publish_id_range() {
        let max_id = PUBLISH_PREFIX_MAX * PUBLISH_PREFIX_SCALE + (PUBLISH_COUNTER_MAX - 1);
        assert_eq!(max_id, 1_999_999_998);
    }

    #[test]
    fn test_link_classification() {
        assert!(!ConnectionType::WiFi.is_cellular());
        assert!(!ConnectionType::Ethernet.is_cellular());
        assert!(ConnectionType::Lte.is_cellular());
        assert!(ConnectionType::NbIot.is_cellular());
        assert!(ConnectionType::CatM.is_cellular());
    }
}
