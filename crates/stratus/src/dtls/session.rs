// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! DTLS session persistence.
//!
//! The negotiated session (master secret, record keys, epoch, sequence
//! counters) is serialized into a bounded opaque blob and handed to the
//! host's persistence callback. On the next boot the blob is restored and
//! the channel resumes the session without a wire handshake.
//!
//! The blob is bound to the device id and to a fingerprint of the pinned
//! broker key: re-provisioning either invalidates it. The outbound sequence
//! counter is saved with a slack ahead of its live value so that records
//! sent after the last save can never collide with post-restore nonces.

use super::crypto::{KeyMaterial, MASTER_SECRET_LEN};
use crate::config::{DEVICE_ID_LEN, SESSION_BLOB_MAX};
use crate::protocol::{Error, Result};

const MAGIC: [u8; 4] = *b"STSN";
const VERSION: u8 = 1;
const CIPHER_SUITE: u16 = 0xC0AE;

/// Sequence-number headroom added on save.
pub const SEQUENCE_SLACK: u64 = 4096;

/// Encoded blob length.
pub const BLOB_LEN: usize = 4 + 1 + 2 + 2 + 6 + 6 + MASTER_SECRET_LEN + 40 + DEVICE_ID_LEN + 32;

/// Host-side session persistence.
///
/// Both calls return a non-negative count on success and a negative value
/// on failure or absence; the core never retains the buffers past the call.
pub trait SessionStore {
    /// Persist the blob; returns bytes written or negative on failure.
    fn save(&mut self, blob: &[u8]) -> i32;

    /// Read the persisted blob into `buf`; returns bytes read, or negative
    /// when nothing is stored.
    fn restore(&mut self, buf: &mut [u8]) -> i32;

    /// Drop the persisted blob (session discarded by the broker).
    fn discard(&mut self) {}
}

/// Store that never persists; every connect performs a full handshake.
pub struct NoSessionStore;

impl SessionStore for NoSessionStore {
    fn save(&mut self, _blob: &[u8]) -> i32 {
        -1
    }

    fn restore(&mut self, _buf: &mut [u8]) -> i32 {
        -1
    }
}

/// The decoded session state.
pub struct SessionPersist {
    pub master: [u8; MASTER_SECRET_LEN],
    pub keys: KeyMaterial,
    pub epoch: u16,
    pub sequence_out: u64,
    pub sequence_in: u64,
    pub device_id: [u8; DEVICE_ID_LEN],
    pub server_fingerprint: [u8; 32],
}

impl SessionPersist {
    /// Serialize, applying the outbound sequence slack.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOB_LEN);
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&CIPHER_SUITE.to_be_bytes());
        out.extend_from_slice(&self.epoch.to_be_bytes());
        let saved_seq = self.sequence_out + SEQUENCE_SLACK;
        out.extend_from_slice(&saved_seq.to_be_bytes()[2..8]);
        out.extend_from_slice(&self.sequence_in.to_be_bytes()[2..8]);
        out.extend_from_slice(&self.master);
        out.extend_from_slice(&self.keys.client_write_key);
        out.extend_from_slice(&self.keys.server_write_key);
        out.extend_from_slice(&self.keys.client_iv);
        out.extend_from_slice(&self.keys.server_iv);
        out.extend_from_slice(&self.device_id);
        out.extend_from_slice(&self.server_fingerprint);
        debug_assert_eq!(out.len(), BLOB_LEN);
        debug_assert!(out.len() <= SESSION_BLOB_MAX);
        out
    }

    /// Decode and validate a persisted blob.
    ///
    /// Rejects wrong magic/version/cipher, a device-id mismatch, and a
    /// broker-key fingerprint mismatch, all as [`Error::SessionDiscarded`].
    pub fn decode(
        blob: &[u8],
        device_id: &[u8; DEVICE_ID_LEN],
        server_fingerprint: &[u8; 32],
    ) -> Result<Self> {
        if blob.len() < BLOB_LEN {
            return Err(Error::SessionDiscarded);
        }
        if blob[..4] != MAGIC || blob[4] != VERSION {
            return Err(Error::SessionDiscarded);
        }
        let mut idx = 5;
        let cipher = u16::from_be_bytes([blob[idx], blob[idx + 1]]);
        idx += 2;
        if cipher != CIPHER_SUITE {
            return Err(Error::SessionDiscarded);
        }
        let epoch = u16::from_be_bytes([blob[idx], blob[idx + 1]]);
        idx += 2;
        let sequence_out = read_u48(&blob[idx..idx + 6]);
        idx += 6;
        let sequence_in = read_u48(&blob[idx..idx + 6]);
        idx += 6;

        let mut master = [0u8; MASTER_SECRET_LEN];
        master.copy_from_slice(&blob[idx..idx + MASTER_SECRET_LEN]);
        idx += MASTER_SECRET_LEN;

        let mut keys = KeyMaterial {
            client_write_key: [0; 16],
            server_write_key: [0; 16],
            client_iv: [0; 4],
            server_iv: [0; 4],
        };
        keys.client_write_key.copy_from_slice(&blob[idx..idx + 16]);
        idx += 16;
        keys.server_write_key.copy_from_slice(&blob[idx..idx + 16]);
        idx += 16;
        keys.client_iv.copy_from_slice(&blob[idx..idx + 4]);
        idx += 4;
        keys.server_iv.copy_from_slice(&blob[idx..idx + 4]);
        idx += 4;

        let mut stored_device = [0u8; DEVICE_ID_LEN];
        stored_device.copy_from_slice(&blob[idx..idx + DEVICE_ID_LEN]);
        idx += DEVICE_ID_LEN;
        let mut stored_fp = [0u8; 32];
        stored_fp.copy_from_slice(&blob[idx..idx + 32]);

        if stored_device != *device_id || stored_fp != *server_fingerprint {
            log::debug!("[DTLS] persisted session does not match credentials");
            return Err(Error::SessionDiscarded);
        }

        Ok(Self {
            master,
            keys,
            epoch,
            sequence_out,
            sequence_in,
            device_id: stored_device,
            server_fingerprint: stored_fp,
        })
    }
}

fn read_u48(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        0, 0, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionPersist {
        SessionPersist {
            master: [0x4D; MASTER_SECRET_LEN],
            keys: KeyMaterial {
                client_write_key: [0x0C; 16],
                server_write_key: [0x05; 16],
                client_iv: [0xC1; 4],
                server_iv: [0x51; 4],
            },
            epoch: 1,
            sequence_out: 1_000,
            sequence_in: 900,
            device_id: [0xAB; DEVICE_ID_LEN],
            server_fingerprint: [0xFE; 32],
        }
    }

    #[test]
    fn test_blob_fits_bound() {
        let blob = sample().encode();
        assert_eq!(blob.len(), BLOB_LEN);
        assert!(blob.len() <= SESSION_BLOB_MAX);
    }

    #[test]
    fn test_roundtrip_with_slack() {
        let original = sample();
        let blob = original.encode();
        let decoded =
            SessionPersist::decode(&blob, &original.device_id, &original.server_fingerprint)
                .expect("decodes");
        assert_eq!(decoded.epoch, 1);
        assert_eq!(decoded.sequence_out, 1_000 + SEQUENCE_SLACK);
        assert_eq!(decoded.sequence_in, 900);
        assert_eq!(decoded.master, original.master);
        assert_eq!(
            decoded.keys.client_write_key,
            original.keys.client_write_key
        );
    }

    #[test]
    fn test_device_mismatch_rejected() {
        let original = sample();
        let blob = original.encode();
        let other_device = [0x00; DEVICE_ID_LEN];
        assert_eq!(
            SessionPersist::decode(&blob, &other_device, &original.server_fingerprint)
                .err(),
            Some(Error::SessionDiscarded)
        );
    }

    #[test]
    fn test_fingerprint_mismatch_rejected() {
        let original = sample();
        let blob = original.encode();
        assert_eq!(
            SessionPersist::decode(&blob, &original.device_id, &[0u8; 32]).err(),
            Some(Error::SessionDiscarded)
        );
    }

    #[test]
    fn test_corrupt_blob_rejected() {
        let original = sample();
        let mut blob = original.encode();
        blob[0] = b'X';
        assert!(SessionPersist::decode(
            &blob,
            &original.device_id,
            &original.server_fingerprint
        )
        .is_err());
        assert!(SessionPersist::decode(
            &[],
            &original.device_id,
            &original.server_fingerprint
        )
        .is_err());
    }

    #[test]
    fn test_no_session_store() {
        let mut store = NoSessionStore;
        assert!(store.save(&[1, 2, 3]) < 0);
        assert!(store.restore(&mut [0u8; 16]) < 0);
        store.discard();
    }
}
