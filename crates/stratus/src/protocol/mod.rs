// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Protocol facade and feature registries.
//!
//! This module owns everything above the CoAP layer: the facade driving one
//! loop pass ([`Protocol`]), the subscription table, the publisher with its
//! rate limiter and block-wise transactions, the firmware chunked-transfer
//! engine, the completion registry, the pinger and time-sync helpers, and
//! the diagnostic registry.
//!
//! All state is owned by the facade; host callbacks borrow. Nothing here is
//! shared across threads.

pub mod ack;
pub mod chunked;
pub mod diagnostics;
mod facade;
pub mod functions;
pub mod ping;
pub mod publisher;
pub mod subscriptions;
pub mod timesync;
pub mod variables;

pub use ack::CompletionRegistry;
pub use chunked::{ChunkDescriptor, ChunkedTransfer, FirmwareSink};
pub use diagnostics::{
    DiagnosticCloud, DiagnosticNetwork, DiagnosticRegistry, DiagnosticSystem,
};
pub use facade::{
    BeginOutcome, HostCallbacks, Protocol, ProtocolStatus, DESCRIBE_APPLICATION,
    DESCRIBE_DEFAULT, DESCRIBE_METRICS, DESCRIBE_SYSTEM,
};
pub use functions::{FunctionPermission, FunctionRegistry};
pub use ping::{KeepAliveSource, Pinger};
pub use publisher::Publisher;
pub use subscriptions::{EventScope, SubscriptionTable};
pub use timesync::TimeSync;
pub use variables::{VariableKind, VariableRegistry, VariableValue};

/// Errors surfaced by the protocol core.
///
/// Transport and DTLS failures terminate the current session (the supervisor
/// reconnects); CoAP decode failures drop the offending datagram;
/// application-level failures are answered with coded 4.xx responses and do
/// not appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A bounded wait elapsed (handshake, ack, hello).
    Timeout,
    /// Transport or record-layer I/O failure.
    Io,
    /// Operation not valid in the current connection state.
    InvalidState,
    /// Peer identity or signature check failed.
    Authentication,
    /// Publish rejected by the event rate limiter.
    BandwidthExceeded,
    /// A bounded buffer or table is full.
    InsufficientStorage,
    /// Feature not supported by this build.
    NotImplemented,
    /// Malformed or unexpected protocol data.
    Protocol,
    /// An operation required a message id that was never assigned.
    MissingMessageId,
    /// The persisted DTLS session was rejected; a fresh handshake is needed.
    SessionDiscarded,
    /// The operation was abandoned by a disconnect or shutdown.
    Cancelled,
    /// Broker answered with a 4.xx response code.
    CoapClientError,
    /// Broker answered with a 5.xx response code.
    CoapServerError,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Timeout => write!(f, "Timed out"),
            Error::Io => write!(f, "I/O error"),
            Error::InvalidState => write!(f, "Invalid state"),
            Error::Authentication => write!(f, "Authentication failed"),
            Error::BandwidthExceeded => write!(f, "Event rate limit exceeded"),
            Error::InsufficientStorage => write!(f, "Insufficient storage"),
            Error::NotImplemented => write!(f, "Not implemented"),
            Error::Protocol => write!(f, "Protocol error"),
            Error::MissingMessageId => write!(f, "Missing message id"),
            Error::SessionDiscarded => write!(f, "Session discarded"),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::CoapClientError => write!(f, "Request rejected by broker (4.xx)"),
            Error::CoapServerError => write!(f, "Broker-side failure (5.xx)"),
        }
    }
}

impl std::error::Error for Error {}

/// Convenient alias for results using the protocol [`Error`].
pub type Result<T> = core::result::Result<T, Error>;

/// Visibility of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Readable by any subscriber (`e` on the wire).
    Public,
    /// Restricted to the owning account (`E` on the wire).
    Private,
}

impl EventType {
    /// Wire marker: the first Uri-Path character of the event message.
    #[must_use]
    pub fn marker(self) -> u8 {
        match self {
            EventType::Public => b'e',
            EventType::Private => b'E',
        }
    }
}

/// Delivery options for a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags {
    /// Send confirmable and report the outcome through the completion
    /// registry.
    pub with_ack: bool,
}

impl EventFlags {
    /// Fire-and-forget delivery.
    pub const NO_ACK: EventFlags = EventFlags { with_ack: false };
    /// Confirmable delivery with completion callback.
    pub const WITH_ACK: EventFlags = EventFlags { with_ack: true };
}

/// Firmware-update behavior flags carried by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateFlags(pub u32);

impl UpdateFlags {
    /// Previous update validated only, do not apply.
    pub const VALIDATE_ONLY: u32 = 0x02;
    /// Control returns to the application after `finish`; no reboot.
    pub const DONT_RESET: u32 = 0x04;
    /// The broker forces the update past a host-side disable.
    pub const FORCED: u32 = 0x01;

    #[must_use]
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// Platform services the core cannot provide itself.
///
/// The monotonic clock and the random source are host-owned; everything in
/// the core that needs time or randomness receives it through this trait.
pub trait Platform {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn millis(&mut self) -> u64;

    /// Uniform random 32-bit value.
    ///
    /// Used for message-id seeds, publish-id prefixes, backoff jitter and
    /// DTLS randoms. Quality matters: back this with a real entropy source.
    fn random_u32(&mut self) -> u32;
}

/// [`Platform`] over a pair of closures, for hosts without a natural struct.
pub struct ClosurePlatform<M, R> {
    millis: M,
    random: R,
}

impl<M, R> ClosurePlatform<M, R>
where
    M: FnMut() -> u64,
    R: FnMut() -> u32,
{
    pub fn new(millis: M, random: R) -> Self {
        Self { millis, random }
    }
}

impl<M, R> Platform for ClosurePlatform<M, R>
where
    M: FnMut() -> u64,
    R: FnMut() -> u32,
{
    fn millis(&mut self) -> u64 {
        (self.millis)()
    }

    fn random_u32(&mut self) -> u32 {
        (self.random)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Timeout.to_string(), "Timed out");
        assert_eq!(
            Error::BandwidthExceeded.to_string(),
            "Event rate limit exceeded"
        );
    }

    #[test]
    fn test_event_type_markers() {
        assert_eq!(EventType::Public.marker(), b'e');
        assert_eq!(EventType::Private.marker(), b'E');
    }

    #[test]
    fn test_closure_platform() {
        let mut t = 0u64;
        let mut platform = ClosurePlatform::new(
            move || {
                t += 10;
                t
            },
            || 42,
        );
        assert_eq!(platform.millis(), 10);
        assert_eq!(platform.millis(), 20);
        assert_eq!(platform.random_u32(), 42);
    }
}
