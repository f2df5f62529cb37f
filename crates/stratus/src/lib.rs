// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! # Stratus - device-side IoT cloud protocol client
//!
//! A pure Rust implementation of the device half of a CoAP-over-DTLS cloud
//! protocol: a constrained device keeps a long-lived secure session with a
//! cloud broker over UDP, publishes events, exposes remotely callable
//! functions and readable variables, receives firmware updates, and reports
//! diagnostics.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratus::{Cloud, ConnectionType, Result};
//!
//! fn main() -> Result<()> {
//!     let mut cloud = Cloud::builder()
//!         .device_id(*b"\x10\xaf\x26\x43\x74\xed\x83\x43\x02\xae\xb9\x84")
//!         .private_key(&device_key_der())
//!         .server_public_key(&broker_key_der())
//!         .connection_type(ConnectionType::WiFi)
//!         .build()?;
//!
//!     cloud.connect()?;
//!     loop {
//!         cloud.run_loop();
//!         std::thread::sleep(std::time::Duration::from_millis(20));
//!     }
//! }
//! # fn device_key_der() -> Vec<u8> { vec![] }
//! # fn broker_key_der() -> Vec<u8> { vec![] }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Application Layer                       |
//! |    Cloud (connect/loop/publish/subscribe/get/post)           |
//! +--------------------------------------------------------------+
//! |                      Protocol Layer                          |
//! |  Facade | Subscriptions | Publisher | Chunked OTA | Pinger   |
//! +--------------------------------------------------------------+
//! |                        CoAP Layer                            |
//! |  Message codec | Retransmit store | Dedup | Ack routing      |
//! +--------------------------------------------------------------+
//! |                        DTLS Layer                            |
//! |  ECDHE-ECDSA handshake | AES-128-CCM-8 records | Migration   |
//! +--------------------------------------------------------------+
//! |                      Transport Layer                         |
//! |  UDP adapter (or any host-supplied Transport)                |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`cloud`] - Public client and connection supervisor (start here)
//! - [`protocol`] - Protocol facade and per-feature registries
//! - [`coap`] - CoAP message codec and reliability store
//! - [`dtls`] - DTLS 1.2 channel (`TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8`)
//! - [`transport`] - Datagram transport contract and UDP adapter
//!
//! The entire core is single-threaded and cooperative: all progress is made
//! from [`Cloud::run_loop`], no operation blocks, and no state is shared
//! across threads.

/// Public cloud client and connection supervisor.
pub mod cloud;
/// CoAP message model, wire codec and reliability store.
pub mod coap;
/// Connection-type timeout tables and protocol constants.
pub mod config;
/// DTLS 1.2 message channel (handshake, records, session persistence).
pub mod dtls;
/// Log sink wiring for the `log` facade (console or host callback).
pub mod logging;
/// Protocol facade and feature registries (events, functions, OTA, metrics).
pub mod protocol;
/// Datagram transport contract and the default UDP adapter.
pub mod transport;

pub use cloud::{Cloud, CloudBuilder, ConnectionEvent, ConnectionStatus, StdPlatform};
pub use config::{
    ConnectionProperties, ConnectionType, DEVICE_ID_LEN, PRIVATE_KEY_LEN, PUBLIC_KEY_LEN,
};
pub use dtls::{Credentials, SessionStore};
pub use protocol::{
    DiagnosticCloud, DiagnosticNetwork, DiagnosticSystem, Error, EventFlags, EventScope,
    EventType, FunctionPermission, Platform, Result, UpdateFlags, VariableKind, VariableValue,
};
pub use transport::{Transport, TransportStatus};
