// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! DTLS 1.2 message channel.
//!
//! One cipher suite only: `TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8` (RFC 7251)
//! over DTLS 1.2 (RFC 6347). The device authenticates with a raw ECDSA
//! P-256 key pair; the broker is authenticated against a pinned public key,
//! not a certificate chain.
//!
//! - [`crypto`]: PRF, key schedule, CCM sealing, ECDSA/ECDH and DER key
//!   parsing.
//! - [`record`]: record-layer framing, epochs, sequence numbers, the
//!   NAT-rebind signature and the move-session record type.
//! - [`handshake`]: the client-side flight machine.
//! - [`session`]: the persisted session blob for resumption.
//! - [`channel`]: the [`DtlsChannel`] tying it together behind the
//!   message-channel contract.

pub mod channel;
pub mod crypto;
pub mod handshake;
pub mod record;
pub mod session;
#[cfg(test)]
pub(crate) mod testsrv;

pub use channel::{ChannelStatus, DtlsChannel};
pub use session::{NoSessionStore, SessionStore};

use crate::config::{DEVICE_ID_LEN, PRIVATE_KEY_LEN, PUBLIC_KEY_LEN};
use crate::protocol::{Error, Result};

/// The credentials a device is provisioned with.
///
/// The private key is SEC1 `ECPrivateKey` DER with the public point
/// embedded; the broker key is `SubjectPublicKeyInfo` DER. Both buffers may
/// carry provisioning trailer bytes after the DER body; the parsers scan for
/// the key material and ignore the rest.
#[derive(Clone)]
pub struct Credentials {
    pub device_id: [u8; DEVICE_ID_LEN],
    pub private_key_der: Vec<u8>,
    pub server_public_der: Vec<u8>,
}

impl Credentials {
    /// Validate buffer sizes early, before the first connect.
    pub fn validate(&self) -> Result<()> {
        if self.private_key_der.is_empty() || self.private_key_der.len() > 2 * PRIVATE_KEY_LEN {
            return Err(Error::Authentication);
        }
        if self.server_public_der.is_empty() || self.server_public_der.len() > 4 * PUBLIC_KEY_LEN
        {
            return Err(Error::Authentication);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.debug_struct("Credentials")
            .field("device_id", &self.device_id)
            .field("private_key_der", &"<redacted>")
            .field("server_public_der", &self.server_public_der.len())
            .finish()
    }
}
