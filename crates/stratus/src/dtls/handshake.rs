// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Client-side DTLS 1.2 handshake flight machine.
//!
//! Drives the `TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8` exchange against the
//! broker:
//!
//! ```text
//! ClientHello          -->
//!                      <-- HelloVerifyRequest (cookie)
//! ClientHello+cookie   -->
//!                      <-- ServerHello, Certificate, ServerKeyExchange,
//!                          [CertificateRequest], ServerHelloDone
//! Certificate, ClientKeyExchange, [CertificateVerify],
//! ChangeCipherSpec, Finished -->
//!                      <-- ChangeCipherSpec, Finished
//! ```
//!
//! Trust is a pinned key, not a chain: the ServerKeyExchange signature is
//! verified directly against the provisioned broker public key and the
//! certificate body is not inspected. Both sides exchange raw public keys
//! (RFC 7250 certificate types).
//!
//! Flights are retransmitted verbatim with doubling timers; the overall
//! bound is enforced by the channel's handshake timeout.

use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::NonZeroScalar;

use super::crypto::{self, KeyMaterial, MASTER_SECRET_LEN, POINT_LEN, VERIFY_DATA_LEN};
use super::record::{
    RecordLayer, CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE,
};
use crate::protocol::{Error, Platform, Result};

const HT_CLIENT_HELLO: u8 = 1;
const HT_SERVER_HELLO: u8 = 2;
const HT_HELLO_VERIFY_REQUEST: u8 = 3;
const HT_CERTIFICATE: u8 = 11;
const HT_SERVER_KEY_EXCHANGE: u8 = 12;
const HT_CERTIFICATE_REQUEST: u8 = 13;
const HT_SERVER_HELLO_DONE: u8 = 14;
const HT_CERTIFICATE_VERIFY: u8 = 15;
const HT_CLIENT_KEY_EXCHANGE: u8 = 16;
const HT_FINISHED: u8 = 20;

/// TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8 (RFC 7251).
const CIPHER_SUITE: u16 = 0xC0AE;
const NAMED_CURVE_SECP256R1: u16 = 0x0017;
const SIG_ECDSA_SHA256: [u8; 2] = [0x04, 0x03];
const CERT_TYPE_RAW_PUBLIC_KEY: u8 = 2;

const HS_HEADER_LEN: usize = 12;
const INITIAL_RETRANSMIT_MS: u64 = 1_000;

/// Identity material the handshake signs and verifies with.
pub struct HandshakeIdentity<'a> {
    pub signing: &'a SigningKey,
    pub device_point: &'a [u8; POINT_LEN],
    pub server_key: &'a VerifyingKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitServerHello,
    AwaitServerHelloDone,
    AwaitChangeCipherSpec,
    AwaitFinished,
    Complete,
}

struct Reassembly {
    msg_type: u8,
    msg_seq: u16,
    total: usize,
    data: Vec<u8>,
}

/// The in-flight handshake.
pub struct Handshake {
    state: State,
    client_random: [u8; 32],
    server_random: [u8; 32],
    cookie: Vec<u8>,
    msg_seq_out: u16,
    next_recv_seq: u16,
    transcript: Vec<u8>,
    ephemeral: Option<NonZeroScalar>,
    server_point: Vec<u8>,
    certificate_requested: bool,
    master: Option<[u8; MASTER_SECRET_LEN]>,
    keys: Option<KeyMaterial>,
    flight: Vec<u8>,
    retransmit_at: u64,
    retransmit_interval: u64,
    reassembly: Option<Reassembly>,
}

impl Handshake {
    /// Begin a fresh handshake; returns the first-flight datagram.
    pub fn start(
        layer: &mut RecordLayer,
        platform: &mut dyn Platform,
        now: u64,
    ) -> Result<(Self, Vec<u8>)> {
        let mut client_random = [0u8; 32];
        crypto::fill_random(platform, &mut client_random);
        let ephemeral = crypto::random_scalar(platform)?;

        let mut hs = Handshake {
            state: State::AwaitServerHello,
            client_random,
            server_random: [0u8; 32],
            cookie: Vec::new(),
            msg_seq_out: 0,
            next_recv_seq: 0,
            transcript: Vec::new(),
            ephemeral: Some(ephemeral),
            server_point: Vec::new(),
            certificate_requested: false,
            master: None,
            keys: None,
            flight: Vec::new(),
            retransmit_at: 0,
            retransmit_interval: INITIAL_RETRANSMIT_MS,
            reassembly: None,
        };

        let datagram = hs.send_client_hello(layer, now)?;
        Ok((hs, datagram))
    }

    /// True once both Finished messages have verified.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Negotiated secrets, available once complete.
    pub fn take_keys(&mut self) -> Result<([u8; MASTER_SECRET_LEN], KeyMaterial)> {
        match (self.master.take(), self.keys.take()) {
            (Some(master), Some(keys)) => Ok((master, keys)),
            _ => Err(Error::InvalidState),
        }
    }

    /// Retransmit the current flight when its timer has elapsed.
    pub fn poll_retransmit(&mut self, now: u64) -> Option<Vec<u8>> {
        if self.state == State::Complete || self.flight.is_empty() || now < self.retransmit_at {
            return None;
        }
        self.retransmit_interval *= 2;
        self.retransmit_at = now + self.retransmit_interval;
        log::debug!("[DTLS] retransmitting handshake flight");
        Some(self.flight.clone())
    }

    /// Process one ChangeCipherSpec record.
    pub fn handle_ccs(&mut self, layer: &mut RecordLayer) -> Result<()> {
        if self.state != State::AwaitChangeCipherSpec {
            return Err(Error::Protocol);
        }
        layer.bump_read_epoch();
        self.state = State::AwaitFinished;
        Ok(())
    }

    /// Process the handshake messages inside one decrypted record body.
    ///
    /// Returns a datagram to transmit when this input completes a flight.
    pub fn handle_record(
        &mut self,
        body: &[u8],
        layer: &mut RecordLayer,
        identity: &HandshakeIdentity<'_>,
        now: u64,
    ) -> Result<Option<Vec<u8>>> {
        let mut response = None;
        let mut idx = 0usize;
        while idx + HS_HEADER_LEN <= body.len() {
            let msg_type = body[idx];
            let length = read_u24(&body[idx + 1..idx + 4]);
            let msg_seq = u16::from_be_bytes([body[idx + 4], body[idx + 5]]);
            let frag_off = read_u24(&body[idx + 6..idx + 9]);
            let frag_len = read_u24(&body[idx + 9..idx + 12]);
            let frag_end = idx + HS_HEADER_LEN + frag_len;
            if frag_end > body.len() {
                return Err(Error::Protocol);
            }
            let fragment = &body[idx + HS_HEADER_LEN..frag_end];
            idx = frag_end;

            // Drop retransmissions of messages already consumed; the flight
            // timer re-sends our side.
            if msg_seq < self.next_recv_seq {
                continue;
            }
            if msg_seq > self.next_recv_seq {
                // Out-of-order future message within the flight; the peer
                // retransmits, so dropping is safe.
                continue;
            }

            let complete = if frag_off == 0 && frag_len == length {
                Some(fragment.to_vec())
            } else {
                self.reassemble(msg_type, msg_seq, length, frag_off, fragment)?
            };
            let Some(message) = complete else { continue };

            self.next_recv_seq += 1;
            if let Some(out) = self.handle_message(msg_type, msg_seq, &message, layer, identity, now)? {
                response = Some(out);
            }
        }
        Ok(response)
    }

    fn reassemble(
        &mut self,
        msg_type: u8,
        msg_seq: u16,
        total: usize,
        frag_off: usize,
        fragment: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let continues = self.reassembly.as_ref().is_some_and(|r| {
            r.msg_type == msg_type
                && r.msg_seq == msg_seq
                && r.total == total
                && frag_off == r.data.len()
        });
        if continues {
            if let Some(buffer) = self.reassembly.as_mut() {
                buffer.data.extend_from_slice(fragment);
            }
        } else if frag_off == 0 {
            // Restart from scratch on a leading fragment.
            self.reassembly = Some(Reassembly {
                msg_type,
                msg_seq,
                total,
                data: fragment.to_vec(),
            });
        } else {
            // Non-sequential fragment with no usable prefix; the peer
            // retransmits the whole message.
            self.reassembly = None;
            return Ok(None);
        }

        if self.reassembly.as_ref().is_some_and(|r| r.data.len() >= total) {
            return Ok(self.reassembly.take().map(|r| r.data));
        }
        Ok(None)
    }

    fn handle_message(
        &mut self,
        msg_type: u8,
        msg_seq: u16,
        message: &[u8],
        layer: &mut RecordLayer,
        identity: &HandshakeIdentity<'_>,
        now: u64,
    ) -> Result<Option<Vec<u8>>> {
        match msg_type {
            HT_HELLO_VERIFY_REQUEST => {
                // Cookie exchange: the verify request and the first hello
                // are excluded from the transcript.
                if message.len() < 3 {
                    return Err(Error::Protocol);
                }
                let cookie_len = usize::from(message[2]);
                let cookie = message.get(3..3 + cookie_len).ok_or(Error::Protocol)?;
                self.cookie = cookie.to_vec();
                self.transcript.clear();
                log::trace!("[DTLS] cookie received len={}", cookie_len);
                Ok(Some(self.send_client_hello(layer, now)?))
            }
            HT_SERVER_HELLO => {
                self.append_transcript(msg_type, msg_seq, message);
                self.parse_server_hello(message)?;
                self.state = State::AwaitServerHelloDone;
                Ok(None)
            }
            HT_CERTIFICATE => {
                // Pinned-key trust model: the body is not inspected, the
                // ServerKeyExchange signature is what authenticates.
                self.append_transcript(msg_type, msg_seq, message);
                Ok(None)
            }
            HT_SERVER_KEY_EXCHANGE => {
                self.append_transcript(msg_type, msg_seq, message);
                let point = self.verify_server_key_exchange(message, identity)?;
                self.server_point = point;
                Ok(None)
            }
            HT_CERTIFICATE_REQUEST => {
                self.append_transcript(msg_type, msg_seq, message);
                self.certificate_requested = true;
                Ok(None)
            }
            HT_SERVER_HELLO_DONE => {
                self.append_transcript(msg_type, msg_seq, message);
                let flight = self.send_client_flight(layer, identity, now)?;
                self.state = State::AwaitChangeCipherSpec;
                Ok(Some(flight))
            }
            HT_FINISHED => {
                if self.state != State::AwaitFinished {
                    return Err(Error::Protocol);
                }
                self.verify_server_finished(message)?;
                self.state = State::Complete;
                self.flight.clear();
                log::debug!("[DTLS] handshake complete");
                Ok(None)
            }
            other => {
                log::debug!("[DTLS] ignoring handshake message type={}", other);
                Ok(None)
            }
        }
    }

    // ===== Outbound flights =====

    fn send_client_hello(&mut self, layer: &mut RecordLayer, now: u64) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(80 + self.cookie.len());
        body.extend_from_slice(&super::record::DTLS_VERSION.to_be_bytes());
        body.extend_from_slice(&self.client_random);
        body.push(0); // empty session id
        body.push(self.cookie.len() as u8);
        body.extend_from_slice(&self.cookie);
        body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
        body.extend_from_slice(&CIPHER_SUITE.to_be_bytes());
        body.push(1); // one compression method
        body.push(0); // null

        let mut ext = Vec::with_capacity(32);
        // supported_groups: secp256r1
        ext.extend_from_slice(&[0x00, 0x0A, 0x00, 0x04, 0x00, 0x02, 0x00, 0x17]);
        // ec_point_formats: uncompressed
        ext.extend_from_slice(&[0x00, 0x0B, 0x00, 0x02, 0x01, 0x00]);
        // signature_algorithms: ecdsa_secp256r1_sha256
        ext.extend_from_slice(&[0x00, 0x0D, 0x00, 0x04, 0x00, 0x02, 0x04, 0x03]);
        // client/server certificate type: raw public key
        ext.extend_from_slice(&[0x00, 0x13, 0x00, 0x02, 0x01, CERT_TYPE_RAW_PUBLIC_KEY]);
        ext.extend_from_slice(&[0x00, 0x14, 0x00, 0x02, 0x01, CERT_TYPE_RAW_PUBLIC_KEY]);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let msg_seq = self.msg_seq_out;
        self.msg_seq_out += 1;
        let message = hs_message(HT_CLIENT_HELLO, msg_seq, &body);
        self.append_transcript_raw(&message);

        let datagram = layer.encode(CONTENT_HANDSHAKE, &message)?;
        self.arm_flight(datagram.clone(), now);
        Ok(datagram)
    }

    fn parse_server_hello(&mut self, message: &[u8]) -> Result<()> {
        // version(2) random(32) session_id cipher(2) compression(1)
        if message.len() < 2 + 32 + 1 {
            return Err(Error::Protocol);
        }
        self.server_random.copy_from_slice(&message[2..34]);
        let sid_len = usize::from(message[34]);
        let cipher_idx = 35 + sid_len;
        let cipher = message
            .get(cipher_idx..cipher_idx + 2)
            .ok_or(Error::Protocol)?;
        if u16::from_be_bytes([cipher[0], cipher[1]]) != CIPHER_SUITE {
            log::warn!("[DTLS] broker offered unexpected cipher suite");
            return Err(Error::Protocol);
        }
        Ok(())
    }

    fn verify_server_key_exchange(
        &mut self,
        message: &[u8],
        identity: &HandshakeIdentity<'_>,
    ) -> Result<Vec<u8>> {
        // ECParameters: curve_type(1)=named_curve, curve(2), point_len(1), point
        if message.len() < 4 {
            return Err(Error::Protocol);
        }
        if message[0] != 3 || u16::from_be_bytes([message[1], message[2]]) != NAMED_CURVE_SECP256R1
        {
            return Err(Error::Protocol);
        }
        let point_len = usize::from(message[3]);
        let params_end = 4 + point_len;
        let point = message.get(4..params_end).ok_or(Error::Protocol)?.to_vec();

        // signature: hash(1) sig_alg(1) len(2) DER
        let trailer = message.get(params_end..).ok_or(Error::Protocol)?;
        if trailer.len() < 4 {
            return Err(Error::Protocol);
        }
        if trailer[..2] != SIG_ECDSA_SHA256 {
            return Err(Error::Authentication);
        }
        let sig_len = usize::from(u16::from_be_bytes([trailer[2], trailer[3]]));
        let signature = trailer.get(4..4 + sig_len).ok_or(Error::Protocol)?;

        // Signed data: client_random | server_random | ECParameters.
        let mut signed = Vec::with_capacity(64 + params_end);
        signed.extend_from_slice(&self.client_random);
        signed.extend_from_slice(&self.server_random);
        signed.extend_from_slice(&message[..params_end]);
        crypto::ecdsa_verify(identity.server_key, &signed, signature)?;
        log::trace!("[DTLS] broker key exchange verified against pinned key");
        Ok(point)
    }

    fn send_client_flight(
        &mut self,
        layer: &mut RecordLayer,
        identity: &HandshakeIdentity<'_>,
        now: u64,
    ) -> Result<Vec<u8>> {
        if self.server_point.is_empty() {
            return Err(Error::Protocol);
        }
        let mut datagram = Vec::with_capacity(512);

        // Certificate: raw public key (length-prefixed point).
        let mut cert_body = Vec::with_capacity(3 + POINT_LEN);
        write_u24(&mut cert_body, POINT_LEN);
        cert_body.extend_from_slice(identity.device_point);
        let msg = self.next_message(HT_CERTIFICATE, &cert_body);
        datagram.extend(layer.encode(CONTENT_HANDSHAKE, &msg)?);

        // ClientKeyExchange: our ephemeral point.
        let ephemeral = self.ephemeral.take().ok_or(Error::InvalidState)?;
        let our_point = p256::PublicKey::from_secret_scalar(&ephemeral);
        let encoded = p256::elliptic_curve::sec1::ToEncodedPoint::to_encoded_point(
            &our_point, false,
        );
        let mut cke_body = Vec::with_capacity(1 + POINT_LEN);
        cke_body.push(POINT_LEN as u8);
        cke_body.extend_from_slice(encoded.as_bytes());
        let msg = self.next_message(HT_CLIENT_KEY_EXCHANGE, &cke_body);
        datagram.extend(layer.encode(CONTENT_HANDSHAKE, &msg)?);

        // Secrets: premaster -> master -> key block.
        let premaster = crypto::ecdh_premaster(&ephemeral, &self.server_point)?;
        let master = crypto::master_secret(&premaster, &self.client_random, &self.server_random);
        let keys = crypto::key_material(&master, &self.client_random, &self.server_random);

        // CertificateVerify over the transcript so far.
        if self.certificate_requested {
            let signature = crypto::ecdsa_sign(identity.signing, &self.transcript);
            let mut cv_body = Vec::with_capacity(4 + signature.len());
            cv_body.extend_from_slice(&SIG_ECDSA_SHA256);
            cv_body.extend_from_slice(&(signature.len() as u16).to_be_bytes());
            cv_body.extend_from_slice(&signature);
            let msg = self.next_message(HT_CERTIFICATE_VERIFY, &cv_body);
            datagram.extend(layer.encode(CONTENT_HANDSHAKE, &msg)?);
        }

        // ChangeCipherSpec, then the sealed Finished.
        datagram.extend(layer.encode(CONTENT_CHANGE_CIPHER_SPEC, &[1])?);
        layer.install(&keys);
        layer.bump_write_epoch();

        let verify = crypto::finished_verify_data(
            &master,
            &crypto::transcript_hash(&self.transcript),
            true,
        );
        let msg = self.next_message(HT_FINISHED, &verify);
        datagram.extend(layer.encode(CONTENT_HANDSHAKE, &msg)?);

        self.master = Some(master);
        self.keys = Some(keys);
        self.arm_flight(datagram.clone(), now);
        Ok(datagram)
    }

    fn verify_server_finished(&mut self, message: &[u8]) -> Result<()> {
        let master = self.master.as_ref().ok_or(Error::InvalidState)?;
        if message.len() != VERIFY_DATA_LEN {
            return Err(Error::Protocol);
        }
        let expected = crypto::finished_verify_data(
            master,
            &crypto::transcript_hash(&self.transcript),
            false,
        );
        if expected[..] != message[..] {
            log::warn!("[DTLS] server Finished verification failed");
            return Err(Error::Authentication);
        }
        Ok(())
    }

    // ===== Helpers =====

    fn next_message(&mut self, msg_type: u8, body: &[u8]) -> Vec<u8> {
        let msg_seq = self.msg_seq_out;
        self.msg_seq_out += 1;
        let message = hs_message(msg_type, msg_seq, body);
        self.append_transcript_raw(&message);
        message
    }

    fn append_transcript(&mut self, msg_type: u8, msg_seq: u16, body: &[u8]) {
        let message = hs_message(msg_type, msg_seq, body);
        self.append_transcript_raw(&message);
    }

    fn append_transcript_raw(&mut self, message: &[u8]) {
        self.transcript.extend_from_slice(message);
    }

    fn arm_flight(&mut self, datagram: Vec<u8>, now: u64) {
        self.flight = datagram;
        self.retransmit_interval = INITIAL_RETRANSMIT_MS;
        self.retransmit_at = now + self.retransmit_interval;
    }
}

/// Encode a handshake message with the 12-byte DTLS header, unfragmented.
fn hs_message(msg_type: u8, msg_seq: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HS_HEADER_LEN + body.len());
    out.push(msg_type);
    write_u24(&mut out, body.len());
    out.extend_from_slice(&msg_seq.to_be_bytes());
    write_u24(&mut out, 0); // fragment offset
    write_u24(&mut out, body.len());
    out.extend_from_slice(body);
    out
}

fn write_u24(out: &mut Vec<u8>, value: usize) {
    out.push((value >> 16) as u8);
    out.push((value >> 8) as u8);
    out.push(value as u8);
}

fn read_u24(bytes: &[u8]) -> usize {
    (usize::from(bytes[0]) << 16) | (usize::from(bytes[1]) << 8) | usize::from(bytes[2])
}
