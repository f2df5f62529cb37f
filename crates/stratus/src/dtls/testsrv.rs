// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! In-memory broker simulator for handshake and channel tests.
//!
//! Speaks just enough of the server side of
//! `TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8` to complete a handshake against the
//! client flight machine, exchange application records, and reproduce the
//! NAT-rebind signature. Test-only; never compiled into the library.

use p256::ecdsa::SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::NonZeroScalar;

use super::crypto::{self, KeyMaterial, MASTER_SECRET_LEN};
use super::record::{
    RecordHeader, RecordIter, RecordLayer, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC,
    CONTENT_HANDSHAKE,
};

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

const COOKIE: &[u8] = b"stratus-test-cookie";

#[derive(Debug, PartialEq, Eq)]
enum BrokerState {
    AwaitFirstHello,
    AwaitCookieHello,
    AwaitClientFlight,
    Established,
}

/// Minimal broker-side DTLS peer.
pub struct TestBroker {
    signing: SigningKey,
    ephemeral: NonZeroScalar,
    state: BrokerState,
    layer: RecordLayer,
    msg_seq: u16,
    client_random: [u8; 32],
    server_random: [u8; 32],
    transcript: Vec<u8>,
    client_point: Vec<u8>,
    master: Option<[u8; MASTER_SECRET_LEN]>,
    keys: Option<KeyMaterial>,
    client_finished_ok: bool,
    /// Application payloads decrypted from the client.
    pub received: Vec<Vec<u8>>,
    /// Whether to run the cookie exchange.
    pub use_cookie: bool,
    /// Whether to request a client certificate.
    pub request_certificate: bool,
}

impl TestBroker {
    pub fn new(seed: u64) -> Self {
        let mut state = seed | 1;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        let mut scalar_bytes = [0u8; 32];
        for chunk in scalar_bytes.chunks_mut(8) {
            chunk.copy_from_slice(&next().to_be_bytes()[..chunk.len()]);
        }
        let signing = SigningKey::from_slice(&scalar_bytes).expect("test server key");
        let mut eph_bytes = [0u8; 32];
        for chunk in eph_bytes.chunks_mut(8) {
            chunk.copy_from_slice(&next().to_be_bytes()[..chunk.len()]);
        }
        let ephemeral = Option::<NonZeroScalar>::from(NonZeroScalar::from_repr(eph_bytes.into()))
            .expect("test ephemeral");
        let mut server_random = [0u8; 32];
        for chunk in server_random.chunks_mut(8) {
            chunk.copy_from_slice(&next().to_be_bytes()[..chunk.len()]);
        }
        Self {
            signing,
            ephemeral,
            state: BrokerState::AwaitFirstHello,
            layer: RecordLayer::new(),
            msg_seq: 0,
            client_random: [0; 32],
            server_random,
            transcript: Vec::new(),
            client_point: Vec::new(),
            master: None,
            keys: None,
            client_finished_ok: false,
            received: Vec::new(),
            use_cookie: true,
            request_certificate: true,
        }
    }

    /// SPKI DER of the broker's public key, as devices pin it.
    pub fn public_key_der(&self) -> Vec<u8> {
        let point = self.signing.verifying_key().to_encoded_point(false);
        let mut der = vec![
            0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06,
            0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
        ];
        der.extend_from_slice(point.as_bytes());
        der
    }

    pub fn is_established(&self) -> bool {
        self.state == BrokerState::Established && self.client_finished_ok
    }

    /// Encrypt one application payload toward the device.
    pub fn seal_application(&mut self, payload: &[u8]) -> Vec<u8> {
        self.layer
            .encode(CONTENT_APPLICATION_DATA, payload)
            .expect("broker seal")
    }

    /// Feed one client datagram; returns response datagrams.
    pub fn process_datagram(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let mut responses = Vec::new();
        let records: Vec<(RecordHeader, Vec<u8>)> = RecordIter::new(datagram)
            .map(|(h, b)| (h, b.to_vec()))
            .collect();
        for (header, body) in records {
            match header.content_type {
                CONTENT_HANDSHAKE => {
                    let plaintext = self.layer.decode(&header, &body).expect("broker decode");
                    self.handle_handshake(&plaintext, &mut responses);
                }
                CONTENT_CHANGE_CIPHER_SPEC => {
                    self.layer.bump_read_epoch();
                }
                CONTENT_APPLICATION_DATA => {
                    let plaintext = self.layer.decode(&header, &body).expect("broker open");
                    self.received.push(plaintext);
                }
                _ => {}
            }
        }
        responses
    }

    fn handle_handshake(&mut self, body: &[u8], responses: &mut Vec<Vec<u8>>) {
        let mut idx = 0usize;
        while idx + 12 <= body.len() {
            let msg_type = body[idx];
            let length = read_u24(&body[idx + 1..idx + 4]);
            let msg_seq = u16::from_be_bytes([body[idx + 4], body[idx + 5]]);
            let message = body[idx + 12..idx + 12 + length].to_vec();
            idx += 12 + length;
            self.handle_message(msg_type, msg_seq, &message, responses);
        }
    }

    fn handle_message(
        &mut self,
        msg_type: u8,
        msg_seq: u16,
        message: &[u8],
        responses: &mut Vec<Vec<u8>>,
    ) {
        match (msg_type, &self.state) {
            (HT_CLIENT_HELLO, BrokerState::AwaitFirstHello) if self.use_cookie => {
                // Stateless cookie round: nothing enters the transcript.
                let mut body = vec![0xFE, 0xFD, COOKIE.len() as u8];
                body.extend_from_slice(COOKIE);
                let hvr = self.message(HT_HELLO_VERIFY_REQUEST, &body);
                responses.push(self.plain_record(&hvr));
                self.state = BrokerState::AwaitCookieHello;
            }
            (HT_CLIENT_HELLO, BrokerState::AwaitFirstHello | BrokerState::AwaitCookieHello) => {
                self.client_random.copy_from_slice(&message[2..34]);
                self.transcript
                    .extend_from_slice(&hs_message(msg_type, msg_seq, message));
                self.send_server_flight(responses);
                self.state = BrokerState::AwaitClientFlight;
            }
            (HT_CERTIFICATE, BrokerState::AwaitClientFlight) => {
                self.transcript
                    .extend_from_slice(&hs_message(msg_type, msg_seq, message));
            }
            (HT_CLIENT_KEY_EXCHANGE, BrokerState::AwaitClientFlight) => {
                let len = usize::from(message[0]);
                self.client_point = message[1..1 + len].to_vec();
                self.transcript
                    .extend_from_slice(&hs_message(msg_type, msg_seq, message));
                self.derive_secrets();
            }
            (HT_CERTIFICATE_VERIFY, BrokerState::AwaitClientFlight) => {
                self.transcript
                    .extend_from_slice(&hs_message(msg_type, msg_seq, message));
            }
            (HT_FINISHED, BrokerState::AwaitClientFlight) => {
                let master = self.master.expect("secrets derived");
                let expected = crypto::finished_verify_data(
                    &master,
                    &crypto::transcript_hash(&self.transcript),
                    true,
                );
                self.client_finished_ok = expected[..] == message[..];
                self.transcript
                    .extend_from_slice(&hs_message(msg_type, msg_seq, message));

                // CCS + server Finished.
                responses.push(
                    self.layer
                        .encode(CONTENT_CHANGE_CIPHER_SPEC, &[1])
                        .expect("ccs"),
                );
                self.layer.bump_write_epoch();
                let verify = crypto::finished_verify_data(
                    &master,
                    &crypto::transcript_hash(&self.transcript),
                    false,
                );
                let finished = self.message(HT_FINISHED, &verify);
                responses.push(
                    self.layer
                        .encode(CONTENT_HANDSHAKE, &finished)
                        .expect("finished"),
                );
                self.state = BrokerState::Established;
            }
            _ => {}
        }
    }

    fn send_server_flight(&mut self, responses: &mut Vec<Vec<u8>>) {
        // ServerHello
        let mut sh = Vec::new();
        sh.extend_from_slice(&[0xFE, 0xFD]);
        sh.extend_from_slice(&self.server_random);
        sh.push(0); // no session id
        sh.extend_from_slice(&0xC0AEu16.to_be_bytes());
        sh.push(0);
        let sh_msg = self.tracked_message(HT_SERVER_HELLO, &sh);
        responses.push(self.plain_record(&sh_msg));

        // Certificate: raw public key point.
        let point = self.signing.verifying_key().to_encoded_point(false);
        let mut cert = Vec::new();
        write_u24(&mut cert, point.as_bytes().len());
        cert.extend_from_slice(point.as_bytes());
        let cert_msg = self.tracked_message(HT_CERTIFICATE, &cert);
        responses.push(self.plain_record(&cert_msg));

        // ServerKeyExchange, signed over randoms + params.
        let eph_point = p256::PublicKey::from_secret_scalar(&self.ephemeral)
            .to_encoded_point(false);
        let mut params = vec![3, 0x00, 0x17, eph_point.as_bytes().len() as u8];
        params.extend_from_slice(eph_point.as_bytes());
        let mut signed = Vec::new();
        signed.extend_from_slice(&self.client_random);
        signed.extend_from_slice(&self.server_random);
        signed.extend_from_slice(&params);
        let signature = crypto::ecdsa_sign(&self.signing, &signed);
        let mut ske = params;
        ske.extend_from_slice(&[0x04, 0x03]);
        ske.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        ske.extend_from_slice(&signature);
        let ske_msg = self.tracked_message(HT_SERVER_KEY_EXCHANGE, &ske);
        responses.push(self.plain_record(&ske_msg));

        // Optional CertificateRequest.
        if self.request_certificate {
            let cr = vec![1, 64, 0x00, 0x02, 0x04, 0x03, 0x00, 0x00];
            let cr_msg = self.tracked_message(HT_CERTIFICATE_REQUEST, &cr);
            responses.push(self.plain_record(&cr_msg));
        }

        // ServerHelloDone.
        let shd_msg = self.tracked_message(HT_SERVER_HELLO_DONE, &[]);
        responses.push(self.plain_record(&shd_msg));
    }

    fn derive_secrets(&mut self) {
        let premaster =
            crypto::ecdh_premaster(&self.ephemeral, &self.client_point).expect("broker ecdh");
        let master = crypto::master_secret(&premaster, &self.client_random, &self.server_random);
        let keys = crypto::key_material(&master, &self.client_random, &self.server_random);
        // Server view: swap directions.
        let mirrored = KeyMaterial {
            client_write_key: keys.server_write_key,
            server_write_key: keys.client_write_key,
            client_iv: keys.server_iv,
            server_iv: keys.client_iv,
        };
        self.layer.install(&mirrored);
        self.master = Some(master);
        self.keys = Some(keys);
    }

    fn message(&mut self, msg_type: u8, body: &[u8]) -> Vec<u8> {
        let seq = self.msg_seq;
        self.msg_seq += 1;
        hs_message(msg_type, seq, body)
    }

    fn tracked_message(&mut self, msg_type: u8, body: &[u8]) -> Vec<u8> {
        let msg = self.message(msg_type, body);
        self.transcript.extend_from_slice(&msg);
        msg
    }

    fn plain_record(&mut self, message: &[u8]) -> Vec<u8> {
        self.layer
            .encode(CONTENT_HANDSHAKE, message)
            .expect("broker encode")
    }
}

fn hs_message(msg_type: u8, msg_seq: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + body.len());
    out.push(msg_type);
    write_u24(&mut out, body.len());
    out.extend_from_slice(&msg_seq.to_be_bytes());
    write_u24(&mut out, 0);
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
