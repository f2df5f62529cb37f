// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! DTLS 1.2 record layer: framing, epochs, sequence numbers, AEAD
//! protection, and the session-migration record type.
//!
//! Epoch 0 records are plaintext (handshake flights before ChangeCipherSpec);
//! epoch 1 records are AES-128-CCM-8 protected with the 4-byte implicit
//! salt plus the 8-byte explicit epoch+sequence nonce carried on the wire.

use super::crypto::{self, KeyMaterial};
use crate::protocol::{Error, Result};

/// ChangeCipherSpec content type.
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
/// Alert content type.
pub const CONTENT_ALERT: u8 = 21;
/// Handshake content type.
pub const CONTENT_HANDSHAKE: u8 = 22;
/// Application data content type.
pub const CONTENT_APPLICATION_DATA: u8 = 23;
/// Custom move-session record type: same session, new 5-tuple.
pub const CONTENT_MOVE_SESSION: u8 = 0xFE;

/// DTLS 1.2 on the wire (`{254, 253}`).
pub const DTLS_VERSION: u16 = 0xFEFD;

/// Record header length.
pub const RECORD_HEADER_LEN: usize = 13;

/// The 15-byte datagram a NAT rebind makes the broker emit: a DTLS 1.2
/// handshake header announcing a 16-byte body that never follows. Receiving
/// it flags the session for migration.
pub const REBIND_SIGNATURE: [u8; 15] = [
    0x16, 0xFE, 0xFD, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00,
];

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub epoch: u16,
    pub sequence: u64,
    pub length: u16,
}

impl RecordHeader {
    /// Parse one header; returns the header and the body offset.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<(RecordHeader, usize)> {
        if buf.len() < RECORD_HEADER_LEN {
            return None;
        }
        let version = u16::from_be_bytes([buf[1], buf[2]]);
        if version != DTLS_VERSION {
            return None;
        }
        let epoch = u16::from_be_bytes([buf[3], buf[4]]);
        let sequence = u64::from_be_bytes([0, 0, buf[5], buf[6], buf[7], buf[8], buf[9], buf[10]]);
        let length = u16::from_be_bytes([buf[11], buf[12]]);
        Some((
            RecordHeader {
                content_type: buf[0],
                epoch,
                sequence,
                length,
            },
            RECORD_HEADER_LEN,
        ))
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.content_type);
        out.extend_from_slice(&DTLS_VERSION.to_be_bytes());
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes()[2..8]);
        out.extend_from_slice(&self.length.to_be_bytes());
    }
}

/// One direction's cipher state.
#[derive(Clone)]
struct CipherState {
    key: [u8; 16],
    iv: [u8; 4],
}

impl CipherState {
    fn nonce(&self, epoch: u16, sequence: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.iv);
        nonce[4..6].copy_from_slice(&epoch.to_be_bytes());
        nonce[6..12].copy_from_slice(&sequence.to_be_bytes()[2..8]);
        nonce
    }
}

fn aead_aad(content_type: u8, epoch: u16, sequence: u64, length: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..2].copy_from_slice(&epoch.to_be_bytes());
    aad[2..8].copy_from_slice(&sequence.to_be_bytes()[2..8]);
    aad[8] = content_type;
    aad[9..11].copy_from_slice(&DTLS_VERSION.to_be_bytes());
    aad[11..13].copy_from_slice(&(length as u16).to_be_bytes());
    aad
}

/// Record encoder/decoder with per-direction state.
pub struct RecordLayer {
    epoch_out: u16,
    sequence_out: u64,
    epoch_in: u16,
    /// Highest sequence accepted in the current read epoch.
    sequence_in: u64,
    write: Option<CipherState>,
    read: Option<CipherState>,
}

impl RecordLayer {
    /// Fresh layer at epoch 0 (plaintext handshake).
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch_out: 0,
            sequence_out: 0,
            epoch_in: 0,
            sequence_in: 0,
            write: None,
            read: None,
        }
    }

    /// Restore a layer from persisted session state.
    #[must_use]
    pub fn resume(keys: &KeyMaterial, epoch: u16, sequence_out: u64, sequence_in: u64) -> Self {
        Self {
            epoch_out: epoch,
            sequence_out,
            epoch_in: epoch,
            sequence_in,
            write: Some(CipherState {
                key: keys.client_write_key,
                iv: keys.client_iv,
            }),
            read: Some(CipherState {
                key: keys.server_write_key,
                iv: keys.server_iv,
            }),
        }
    }

    /// Install negotiated keys; write side activates on
    /// [`RecordLayer::bump_write_epoch`], read side on the peer's CCS.
    pub fn install(&mut self, keys: &KeyMaterial) {
        self.write = Some(CipherState {
            key: keys.client_write_key,
            iv: keys.client_iv,
        });
        self.read = Some(CipherState {
            key: keys.server_write_key,
            iv: keys.server_iv,
        });
    }

    /// Advance the write epoch after sending ChangeCipherSpec.
    pub fn bump_write_epoch(&mut self) {
        self.epoch_out += 1;
        self.sequence_out = 0;
    }

    /// Advance the read epoch after receiving ChangeCipherSpec.
    pub fn bump_read_epoch(&mut self) {
        self.epoch_in += 1;
        self.sequence_in = 0;
    }

    /// Current write epoch.
    #[must_use]
    pub fn write_epoch(&self) -> u16 {
        self.epoch_out
    }

    /// Sequence counters, for session persistence.
    #[must_use]
    pub fn sequences(&self) -> (u64, u64) {
        (self.sequence_out, self.sequence_in)
    }

    /// Encode one outbound record, sealing it when the write epoch is
    /// protected.
    pub fn encode(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let sequence = self.sequence_out;
        self.sequence_out += 1;

        if self.epoch_out == 0 {
            let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
            RecordHeader {
                content_type,
                epoch: 0,
                sequence,
                length: payload.len() as u16,
            }
            .write(&mut out);
            out.extend_from_slice(payload);
            return Ok(out);
        }

        let write = self.write.as_ref().ok_or(Error::InvalidState)?;
        let nonce = write.nonce(self.epoch_out, sequence);
        let aad = aead_aad(content_type, self.epoch_out, sequence, payload.len());
        let sealed = crypto::ccm_seal(&write.key, &nonce, &aad, payload)?;

        // Wire body: 8-byte explicit nonce then ciphertext+tag.
        let mut body = Vec::with_capacity(8 + sealed.len());
        body.extend_from_slice(&self.epoch_out.to_be_bytes());
        body.extend_from_slice(&sequence.to_be_bytes()[2..8]);
        body.extend_from_slice(&sealed);

        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
        RecordHeader {
            content_type,
            epoch: self.epoch_out,
            sequence,
            length: body.len() as u16,
        }
        .write(&mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decrypt one inbound record body.
    ///
    /// Epoch 0 bodies pass through; protected bodies are opened against the
    /// read cipher. Replayed or stale sequences are rejected with
    /// [`Error::Protocol`].
    pub fn decode(&mut self, header: &RecordHeader, body: &[u8]) -> Result<Vec<u8>> {
        if usize::from(header.length) != body.len() {
            return Err(Error::Protocol);
        }
        if header.epoch == 0 {
            return Ok(body.to_vec());
        }
        if header.epoch != self.epoch_in {
            return Err(Error::Protocol);
        }
        let read = self.read.as_ref().ok_or(Error::InvalidState)?;
        if body.len() < 8 + 8 {
            return Err(Error::Protocol);
        }

        // Explicit nonce from the wire; must agree with the header.
        let epoch = u16::from_be_bytes([body[0], body[1]]);
        let sequence =
            u64::from_be_bytes([0, 0, body[2], body[3], body[4], body[5], body[6], body[7]]);
        if epoch != header.epoch || sequence != header.sequence {
            return Err(Error::Protocol);
        }
        if sequence < self.sequence_in {
            return Err(Error::Protocol);
        }

        let nonce = read.nonce(epoch, sequence);
        let ciphertext = &body[8..];
        let aad = aead_aad(
            header.content_type,
            epoch,
            sequence,
            ciphertext.len() - 8,
        );
        let plaintext = crypto::ccm_open(&read.key, &nonce, &aad, ciphertext)?;
        self.sequence_in = sequence + 1;
        Ok(plaintext)
    }
}

impl Default for RecordLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a datagram into records.
pub struct RecordIter<'a> {
    data: &'a [u8],
    idx: usize,
}

impl<'a> RecordIter<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, idx: 0 }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = (RecordHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.idx..)?;
        let (header, body_offset) = RecordHeader::parse(rest)?;
        let start = self.idx + body_offset;
        let end = start + usize::from(header.length);
        let body = self.data.get(start..end)?;
        self.idx = end;
        Some((header, body))
    }
}

/// Rewrite a sealed application record into a move-session datagram:
/// the record type byte becomes [`CONTENT_MOVE_SESSION`] and
/// `device_id | device_id_len` is appended after the payload. The broker
/// re-binds the session to the new source address.
#[must_use]
pub fn wrap_move_session(mut datagram: Vec<u8>, device_id: &[u8]) -> Vec<u8> {
    if datagram.is_empty() {
        return datagram;
    }
    datagram[0] = CONTENT_MOVE_SESSION;
    datagram.extend_from_slice(device_id);
    datagram.push(device_id.len() as u8);
    datagram
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> KeyMaterial {
        KeyMaterial {
            client_write_key: [0x0C; 16],
            server_write_key: [0x05; 16],
            client_iv: [0xC1; 4],
            server_iv: [0x51; 4],
        }
    }

    /// A layer looking back at the client, for decoding what we sealed.
    fn server_view(keys: &KeyMaterial) -> RecordLayer {
        let mirrored = KeyMaterial {
            client_write_key: keys.server_write_key,
            server_write_key: keys.client_write_key,
            client_iv: keys.server_iv,
            server_iv: keys.client_iv,
        };
        RecordLayer::resume(&mirrored, 1, 0, 0)
    }

    #[test]
    fn test_plaintext_record_roundtrip() {
        let mut layer = RecordLayer::new();
        let record = layer
            .encode(CONTENT_HANDSHAKE, b"client hello bytes")
            .expect("encode");
        let (header, body) = RecordHeader::parse(&record)
            .map(|(h, off)| (h, &record[off..]))
            .expect("parses");
        assert_eq!(header.content_type, CONTENT_HANDSHAKE);
        assert_eq!(header.epoch, 0);
        assert_eq!(header.sequence, 0);
        assert_eq!(body, b"client hello bytes");

        // Sequence advances per record.
        let second = layer.encode(CONTENT_HANDSHAKE, b"x").expect("encode");
        let (header, _) = RecordHeader::parse(&second).expect("parses");
        assert_eq!(header.sequence, 1);
    }

    #[test]
    fn test_sealed_record_roundtrip() {
        let keys = test_keys();
        let mut client = RecordLayer::resume(&keys, 1, 0, 0);
        let mut server = server_view(&keys);

        let record = client
            .encode(CONTENT_APPLICATION_DATA, b"coap frame")
            .expect("seal");
        let (header, body_off) = RecordHeader::parse(&record).expect("parses");
        assert_eq!(header.epoch, 1);
        let plaintext = server
            .decode(&header, &record[body_off..])
            .expect("open");
        assert_eq!(plaintext, b"coap frame");
    }

    #[test]
    fn test_tampered_record_rejected() {
        let keys = test_keys();
        let mut client = RecordLayer::resume(&keys, 1, 0, 0);
        let mut server = server_view(&keys);

        let mut record = client
            .encode(CONTENT_APPLICATION_DATA, b"coap frame")
            .expect("seal");
        let last = record.len() - 1;
        record[last] ^= 0x80;
        let (header, body_off) = RecordHeader::parse(&record).expect("parses");
        assert!(server.decode(&header, &record[body_off..]).is_err());
    }

    #[test]
    fn test_replayed_record_rejected() {
        let keys = test_keys();
        let mut client = RecordLayer::resume(&keys, 1, 0, 0);
        let mut server = server_view(&keys);

        let record = client
            .encode(CONTENT_APPLICATION_DATA, b"one")
            .expect("seal");
        let (header, body_off) = RecordHeader::parse(&record).expect("parses");
        assert!(server.decode(&header, &record[body_off..]).is_ok());
        // Same record again: stale sequence.
        assert_eq!(
            server.decode(&header, &record[body_off..]),
            Err(Error::Protocol)
        );
    }

    #[test]
    fn test_record_iter_coalesced_datagram() {
        let mut layer = RecordLayer::new();
        let mut datagram = layer.encode(CONTENT_HANDSHAKE, b"first").expect("encode");
        datagram.extend(layer.encode(CONTENT_CHANGE_CIPHER_SPEC, &[1]).expect("encode"));

        let records: Vec<_> = RecordIter::new(&datagram).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0.content_type, CONTENT_HANDSHAKE);
        assert_eq!(records[0].1, b"first");
        assert_eq!(records[1].0.content_type, CONTENT_CHANGE_CIPHER_SPEC);
        assert_eq!(records[1].1, &[1]);
    }

    #[test]
    fn test_record_iter_stops_on_garbage() {
        let records: Vec<_> = RecordIter::new(&[0x17, 0x00, 0x00]).collect();
        assert!(records.is_empty());
    }

    #[test]
    fn test_rebind_signature_is_handshake_header() {
        let (header, _) = RecordHeader::parse(&REBIND_SIGNATURE).expect("parses");
        assert_eq!(header.content_type, CONTENT_HANDSHAKE);
        assert_eq!(header.epoch, 1);
        assert_eq!(header.length, 0);
        assert_eq!(REBIND_SIGNATURE[12], 0x10);
    }

    #[test]
    fn test_wrap_move_session() {
        let keys = test_keys();
        let mut client = RecordLayer::resume(&keys, 1, 0, 0);
        let record = client
            .encode(CONTENT_APPLICATION_DATA, b"payload")
            .expect("seal");
        let original_len = record.len();
        let device_id = [0xAB_u8; 12];

        let wrapped = wrap_move_session(record, &device_id);
        assert_eq!(wrapped[0], CONTENT_MOVE_SESSION);
        assert_eq!(wrapped.len(), original_len + 13);
        assert_eq!(&wrapped[original_len..original_len + 12], &device_id);
        assert_eq!(wrapped[original_len + 12], 12);
    }

    #[test]
    fn test_epoch_bumps() {
        let mut layer = RecordLayer::new();
        layer.install(&test_keys());
        layer.encode(CONTENT_HANDSHAKE, b"pre-ccs").expect("encode");
        layer.bump_write_epoch();
        assert_eq!(layer.write_epoch(), 1);
        let record = layer.encode(CONTENT_HANDSHAKE, b"finished").expect("seal");
        let (header, _) = RecordHeader::parse(&record).expect("parses");
        assert_eq!(header.epoch, 1);
        assert_eq!(header.sequence, 0);
    }
}
