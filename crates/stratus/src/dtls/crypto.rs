// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stratus contributors

//! Cryptographic primitives for the DTLS channel.
//!
//! TLS 1.2 PRF (P_SHA256), the AES-128-CCM-8 record AEAD, ECDSA P-256
//! signing/verification, ECDHE key agreement, and the tolerant DER scanners
//! for the provisioned key blobs.

use aes::Aes128;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U12, U8};
use ccm::Ccm;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::{AffinePoint, EncodedPoint, NonZeroScalar, PublicKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::protocol::{Error, Platform, Result};

type HmacSha256 = Hmac<Sha256>;

/// AES-128-CCM with an 8-byte tag and 12-byte nonce (RFC 6655 / RFC 7251).
type AesCcm8 = Ccm<Aes128, U8, U12>;

/// Length of the master secret (RFC 5246 Sec.8.1).
pub const MASTER_SECRET_LEN: usize = 48;

/// Length of a Finished verify_data field.
pub const VERIFY_DATA_LEN: usize = 12;

/// Uncompressed SEC1 P-256 point length.
pub const POINT_LEN: usize = 65;

// =======================================================================
// TLS 1.2 PRF
// =======================================================================

fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// TLS 1.2 PRF with P_SHA256 (RFC 5246 Sec.5).
#[must_use]
pub fn prf_sha256(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len);
    let mut a = hmac_sha256(secret, &[label, seed]);
    while out.len() < out_len {
        let block = hmac_sha256(secret, &[&a, label, seed]);
        let take = (out_len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        a = hmac_sha256(secret, &[&a]);
    }
    out
}

/// Derive the 48-byte master secret from the ECDHE premaster.
#[must_use]
pub fn master_secret(
    pre_master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> [u8; MASTER_SECRET_LEN] {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);
    let bytes = prf_sha256(pre_master, b"master secret", &seed, MASTER_SECRET_LEN);
    let mut out = [0u8; MASTER_SECRET_LEN];
    out.copy_from_slice(&bytes);
    out
}

/// Record-protection keys for `TLS_ECDHE_ECDSA_WITH_AES_128_CCM_8`.
///
/// AEAD suites carry no MAC keys; the key block is two 16-byte write keys
/// plus two 4-byte implicit nonce salts.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub client_write_key: [u8; 16],
    pub server_write_key: [u8; 16],
    pub client_iv: [u8; 4],
    pub server_iv: [u8; 4],
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.client_write_key.zeroize();
        self.server_write_key.zeroize();
        self.client_iv.zeroize();
        self.server_iv.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Expand the key block (RFC 5246 Sec.6.3; server_random first).
#[must_use]
pub fn key_material(
    master: &[u8; MASTER_SECRET_LEN],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> KeyMaterial {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);
    let mut block = prf_sha256(master, b"key expansion", &seed, 40);
    let mut keys = KeyMaterial {
        client_write_key: [0; 16],
        server_write_key: [0; 16],
        client_iv: [0; 4],
        server_iv: [0; 4],
    };
    keys.client_write_key.copy_from_slice(&block[0..16]);
    keys.server_write_key.copy_from_slice(&block[16..32]);
    keys.client_iv.copy_from_slice(&block[32..36]);
    keys.server_iv.copy_from_slice(&block[36..40]);
    block.zeroize();
    keys
}

/// Finished verify_data over the transcript hash.
#[must_use]
pub fn finished_verify_data(
    master: &[u8; MASTER_SECRET_LEN],
    transcript_hash: &[u8; 32],
    client: bool,
) -> [u8; VERIFY_DATA_LEN] {
    let label: &[u8] = if client {
        b"client finished"
    } else {
        b"server finished"
    };
    let bytes = prf_sha256(master, label, transcript_hash, VERIFY_DATA_LEN);
    let mut out = [0u8; VERIFY_DATA_LEN];
    out.copy_from_slice(&bytes);
    out
}

/// SHA-256 of the handshake transcript.
#[must_use]
pub fn transcript_hash(transcript: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(transcript);
    digest.into()
}

// =======================================================================
// Record AEAD
// =======================================================================

/// Seal one record: returns ciphertext plus the 8-byte tag.
pub fn ccm_seal(key: &[u8; 16], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = AesCcm8::new(key.into());
    cipher
        .encrypt(
            nonce.into(),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Io)
}

/// Open one record; authentication failure is an [`Error::Io`].
pub fn ccm_open(
    key: &[u8; 16],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = AesCcm8::new(key.into());
    cipher
        .decrypt(
            nonce.into(),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Io)
}

// =======================================================================
// Signatures and key agreement
// =======================================================================

/// ECDSA P-256/SHA-256 signature in DER form.
#[must_use]
pub fn ecdsa_sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(message);
    signature.to_der().as_bytes().to_vec()
}

/// Verify a DER ECDSA P-256/SHA-256 signature.
pub fn ecdsa_verify(key: &VerifyingKey, message: &[u8], der_signature: &[u8]) -> Result<()> {
    let signature =
        Signature::from_der(der_signature).map_err(|_| Error::Authentication)?;
    key.verify(message, &signature)
        .map_err(|_| Error::Authentication)
}

/// ECDH: x-coordinate of the shared point, the TLS premaster secret.
pub fn ecdh_premaster(secret: &NonZeroScalar, peer_point: &[u8]) -> Result<Vec<u8>> {
    let encoded = EncodedPoint::from_bytes(peer_point).map_err(|_| Error::Protocol)?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or(Error::Protocol)?;
    let public = PublicKey::from_affine(affine).map_err(|_| Error::Protocol)?;
    let shared = p256::ecdh::diffie_hellman(secret, public.as_affine());
    Ok(shared.raw_secret_bytes().to_vec())
}

/// Draw an ephemeral non-zero scalar from the host RNG.
pub fn random_scalar(platform: &mut dyn Platform) -> Result<NonZeroScalar> {
    // A uniformly random 256-bit string is a valid scalar with overwhelming
    // probability; bound the loop anyway.
    for _ in 0..8 {
        let mut bytes = [0u8; 32];
        fill_random(platform, &mut bytes);
        let candidate = Option::<NonZeroScalar>::from(NonZeroScalar::from_repr(bytes.into()));
        bytes.zeroize();
        if let Some(scalar) = candidate {
            return Ok(scalar);
        }
    }
    Err(Error::Io)
}

/// Fill a buffer from the host RNG word stream.
pub fn fill_random(platform: &mut dyn Platform, out: &mut [u8]) {
    for chunk in out.chunks_mut(4) {
        let word = platform.random_u32().to_be_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}

// =======================================================================
// Provisioned key parsing
// =======================================================================

/// Parsed device identity: the signing key plus its uncompressed point.
pub struct DeviceKeyPair {
    pub signing: SigningKey,
    pub public_point: [u8; POINT_LEN],
}

/// Scan a SEC1 `ECPrivateKey` DER blob for the private scalar and the
/// embedded public point.
///
/// Walks the TLV structure tolerantly: the private scalar is the OCTET
/// STRING (tag 0x04) body right-aligned to 32 bytes; the public point lives
/// six bytes into the `[1]` context element (tag 0xA1). Provisioning
/// trailers after the DER body are ignored.
pub fn parse_device_key(der: &[u8]) -> Result<DeviceKeyPair> {
    if der.len() < 4 {
        return Err(Error::Authentication);
    }
    let body_len = usize::from(der[1]);
    let mut scalar = [0u8; 32];
    let mut have_scalar = false;
    let mut point = [0u8; POINT_LEN];
    let mut have_point = false;

    let mut i = 2usize;
    while i + 1 < der.len() && i < 2 + body_len {
        let tag = der[i];
        let len = usize::from(der[i + 1]);
        let value = i + 2;
        if tag == 0x04 && len <= 32 && value + len <= der.len() {
            scalar[32 - len..].copy_from_slice(&der[value..value + len]);
            have_scalar = true;
        } else if tag == 0xA1 && i + 70 <= der.len() {
            // [1] wraps a BIT STRING: inner tag, length, unused-bits byte,
            // 0x04 point marker, then x||y.
            let px = i + 6;
            point[0] = 0x04;
            point[1..].copy_from_slice(&der[px..px + 64]);
            have_point = true;
        }
        i = value + len;
    }

    if !have_scalar {
        return Err(Error::Authentication);
    }
    let signing = SigningKey::from_slice(&scalar).map_err(|_| Error::Authentication)?;
    scalar.zeroize();

    if !have_point {
        // Derive the point from the scalar when the blob omits it.
        let encoded = signing.verifying_key().to_encoded_point(false);
        point.copy_from_slice(encoded.as_bytes());
    }

    Ok(DeviceKeyPair {
        signing,
        public_point: point,
    })
}

/// Scan a `SubjectPublicKeyInfo` DER blob for the pinned broker key.
///
/// The uncompressed point marker is located by trial: the first `0x04` with
/// 64 bytes behind it that parses as a valid curve point wins. This accepts
/// the standard 91-byte SPKI as well as provisioning blobs with endpoint
/// trailer bytes.
pub fn parse_server_public(der: &[u8]) -> Result<VerifyingKey> {
    for i in 0..der.len().saturating_sub(POINT_LEN - 1) {
        if der[i] != 0x04 {
            continue;
        }
        if let Ok(key) = VerifyingKey::from_sec1_bytes(&der[i..i + POINT_LEN]) {
            return Ok(key);
        }
    }
    Err(Error::Authentication)
}

/// Fingerprint of the pinned broker key blob, stored in the session blob so
/// a key rotation invalidates persisted sessions.
#[must_use]
pub fn key_fingerprint(der: &[u8]) -> [u8; 32] {
    transcript_hash(der)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    struct TestPlatform {
        t: u64,
        seed: u32,
    }

    impl Platform for TestPlatform {
        fn millis(&mut self) -> u64 {
            self.t += 1;
            self.t
        }
        fn random_u32(&mut self) -> u32 {
            // xorshift; deterministic test entropy
            self.seed ^= self.seed << 13;
            self.seed ^= self.seed >> 17;
            self.seed ^= self.seed << 5;
            self.seed
        }
    }

    fn platform() -> TestPlatform {
        TestPlatform {
            t: 0,
            seed: 0x1234_5678,
        }
    }

    #[test]
    fn test_prf_rfc_shape() {
        // Determinism and requested length.
        let a = prf_sha256(b"secret", b"label", b"seed", 48);
        let b = prf_sha256(b"secret", b"label", b"seed", 48);
        assert_eq!(a, b);
        assert_eq!(a.len(), 48);
        let c = prf_sha256(b"secret", b"label", b"tilt", 48);
        assert_ne!(a, c);
        assert_eq!(prf_sha256(b"s", b"l", b"x", 100).len(), 100);
    }

    #[test]
    fn test_prf_known_vector() {
        // Published P_SHA256 test vector (Mavrogiannopoulos):
        // secret 9bbe436ba940f017b17652849a71db35, seed a0ba9f936cda311827a6f796ffd5198c,
        // label "test label", output 100 bytes starting e3f229ba727be17b.
        let secret = [
            0x9b, 0xbe, 0x43, 0x6b, 0xa9, 0x40, 0xf0, 0x17, 0xb1, 0x76, 0x52, 0x84, 0x9a, 0x71,
            0xdb, 0x35,
        ];
        let seed = [
            0xa0, 0xba, 0x9f, 0x93, 0x6c, 0xda, 0x31, 0x18, 0x27, 0xa6, 0xf7, 0x96, 0xff, 0xd5,
            0x19, 0x8c,
        ];
        let out = prf_sha256(&secret, b"test label", &seed, 100);
        assert_eq!(
            &out[..8],
            &[0xe3, 0xf2, 0x29, 0xba, 0x72, 0x7b, 0xe1, 0x7b]
        );
        assert_eq!(&out[92..], &[0x66, 0x2f, 0xb2, 0xb7, 0x46, 0x3c, 0x63, 0x42]);
    }

    #[test]
    fn test_master_secret_and_keys_deterministic() {
        let pre = [0x42u8; 32];
        let cr = [0x01u8; 32];
        let sr = [0x02u8; 32];
        let master = master_secret(&pre, &cr, &sr);
        let keys_a = key_material(&master, &cr, &sr);
        let keys_b = key_material(&master, &cr, &sr);
        assert_eq!(keys_a.client_write_key, keys_b.client_write_key);
        assert_ne!(keys_a.client_write_key, keys_a.server_write_key);
    }

    #[test]
    fn test_ccm_roundtrip_and_tamper() {
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 12];
        let aad = b"record header";
        let sealed = ccm_seal(&key, &nonce, aad, b"application data").expect("seal");
        assert_eq!(sealed.len(), 16 + 8); // payload + 8-byte tag

        let opened = ccm_open(&key, &nonce, aad, &sealed).expect("open");
        assert_eq!(opened, b"application data");

        let mut tampered = sealed.clone();
        tampered[0] ^= 1;
        assert_eq!(ccm_open(&key, &nonce, aad, &tampered), Err(Error::Io));
        assert_eq!(ccm_open(&key, &nonce, b"other aad", &sealed), Err(Error::Io));
    }

    #[test]
    fn test_ecdsa_sign_verify() {
        let mut p = platform();
        let scalar = random_scalar(&mut p).expect("scalar");
        let signing = SigningKey::from_bytes(&scalar.to_bytes()).expect("key");
        let verifying = *signing.verifying_key();

        let sig = ecdsa_sign(&signing, b"handshake transcript");
        assert!(ecdsa_verify(&verifying, b"handshake transcript", &sig).is_ok());
        assert_eq!(
            ecdsa_verify(&verifying, b"tampered transcript", &sig),
            Err(Error::Authentication)
        );
    }

    #[test]
    fn test_ecdh_agreement_matches() {
        let mut p = platform();
        let a = random_scalar(&mut p).expect("a");
        let b = random_scalar(&mut p).expect("b");

        let a_pub = PublicKey::from_secret_scalar(&a)
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let b_pub = PublicKey::from_secret_scalar(&b)
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();

        let ab = ecdh_premaster(&a, &b_pub).expect("ab");
        let ba = ecdh_premaster(&b, &a_pub).expect("ba");
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), 32);
    }

    #[test]
    fn test_ecdh_rejects_garbage_point() {
        let mut p = platform();
        let a = random_scalar(&mut p).expect("a");
        assert!(ecdh_premaster(&a, &[0x04; 65]).is_err());
        assert!(ecdh_premaster(&a, &[]).is_err());
    }

    fn sec1_private_key_der(signing: &SigningKey) -> Vec<u8> {
        // Minimal SEC1 ECPrivateKey with embedded public point:
        // SEQUENCE { INTEGER 1, OCTET STRING scalar, [1] BIT STRING point }
        let scalar = signing.to_bytes();
        let point = signing.verifying_key().to_encoded_point(false);
        let mut body = vec![0x02, 0x01, 0x01, 0x04, 0x20];
        body.extend_from_slice(&scalar);
        body.push(0xA1);
        body.push(68);
        body.extend_from_slice(&[0x03, 0x42, 0x00, 0x04]);
        body.extend_from_slice(&point.as_bytes()[1..]);
        let mut der = vec![0x30, body.len() as u8];
        der.extend_from_slice(&body);
        der
    }

    #[test]
    fn test_parse_device_key_roundtrip() {
        let mut p = platform();
        let scalar = random_scalar(&mut p).expect("scalar");
        let signing = SigningKey::from_bytes(&scalar.to_bytes()).expect("key");
        let der = sec1_private_key_der(&signing);

        let parsed = parse_device_key(&der).expect("parses");
        assert_eq!(
            parsed.public_point.as_slice(),
            signing.verifying_key().to_encoded_point(false).as_bytes()
        );
        let sig = ecdsa_sign(&parsed.signing, b"msg");
        assert!(ecdsa_verify(signing.verifying_key(), b"msg", &sig).is_ok());
    }

    #[test]
    fn test_parse_device_key_rejects_junk() {
        assert!(parse_device_key(&[]).is_err());
        assert!(parse_device_key(&[0x30, 0x02, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_parse_server_public_with_trailer() {
        let mut p = platform();
        let scalar = random_scalar(&mut p).expect("scalar");
        let public = PublicKey::from_secret_scalar(&scalar);
        let point = public.to_encoded_point(false);

        // SPKI-shaped blob followed by provisioning trailer bytes.
        let mut der = vec![
            0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01, 0x06,
            0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
        ];
        der.extend_from_slice(point.as_bytes());
        der.extend_from_slice(b"\x10test.endpoint\x16\x33");

        let parsed = parse_server_public(&der).expect("parses");
        assert_eq!(
            parsed.to_encoded_point(false).as_bytes(),
            point.as_bytes()
        );
    }

    #[test]
    fn test_parse_server_public_rejects_junk() {
        assert!(parse_server_public(&[0u8; 91]).is_err());
    }

    #[test]
    fn test_finished_verify_data_sides_differ() {
        let master = [7u8; MASTER_SECRET_LEN];
        let hash = transcript_hash(b"messages");
        assert_ne!(
            finished_verify_data(&master, &hash, true),
            finished_verify_data(&master, &hash, false)
        );
    }

    #[test]
    fn test_fill_random_covers_tail() {
        let mut p = platform();
        let mut buf = [0u8; 7];
        fill_random(&mut p, &mut buf);
        assert_ne!(buf, [0u8; 7]);
    }
}
