//! Versioned authenticated encryption of rpc payloads.
//!
//! Outbound payloads are always nip-44 v2:
//! `base64(0x02 || nonce[32] || chacha20(pad(plaintext)) || hmac[32])`.
//! The legacy nip-04 format is understood on the inbound path only,
//! see [decrypt_any].

use crate::encoding::PublicKey;
use crate::identity::SecretKey;
use crate::*;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::ops::Range;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub mod nip04;

/// Version byte of the current payload format.
pub const VERSION: u8 = 2;

const SALT: &[u8] = b"nip44-v2";
const MESSAGE_KEYS_SIZE: usize = 76;
const CHACHA_KEY: Range<usize> = 0..32;
const CHACHA_NONCE: Range<usize> = 32..44;
const HMAC_KEY: Range<usize> = 44..76;

const MIN_PLAINTEXT: usize = 1;
const MAX_PLAINTEXT: usize = 65535;

// decoded: version + nonce + 2 byte length + 32 byte min pad + mac
const MIN_DECODED: usize = 99;
const MAX_DECODED: usize = 65603;
const MIN_ENCODED: usize = 132;
const MAX_ENCODED: usize = 87472;

/// Symmetric key material shared by two parties. Overwritten on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    conversation_key: [u8; 32],
    legacy_key: [u8; 32],
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

impl SharedSecret {
    /// The nip-44 v2 conversation key.
    pub fn conversation_key(&self) -> &[u8; 32] {
        &self.conversation_key
    }

    pub(crate) fn legacy_key(&self) -> &[u8; 32] {
        &self.legacy_key
    }
}

/// x coordinate of `my_secret * their_pubkey`.
fn ecdh_x(
    my_secret: &SecretKey,
    their_pubkey: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let sk = my_secret
        .to_k256()
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    // x-only keys lift to the even-y point; the shared x is the same
    // for either lift
    let mut sec1 = [0_u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(their_pubkey.as_bytes());
    let pk = k256::PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| CryptoError::InvalidPublicKey(their_pubkey.to_hex()))?;

    let shared =
        k256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
    let mut out = Zeroizing::new([0_u8; 32]);
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// Derive the key shared between `my_secret` and `their_pubkey`.
///
/// Symmetric: both sides arrive at the same value.
pub fn shared_secret(
    my_secret: &SecretKey,
    their_pubkey: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    let x = ecdh_x(my_secret, their_pubkey)?;
    let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &x[..]);
    let mut conversation_key = [0_u8; 32];
    conversation_key.copy_from_slice(&prk);
    Ok(SharedSecret {
        conversation_key,
        legacy_key: *x,
    })
}

struct MessageKeys(Zeroizing<[u8; MESSAGE_KEYS_SIZE]>);

impl MessageKeys {
    fn derive(
        secret: &SharedSecret,
        nonce: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(&secret.conversation_key)
            .map_err(|_| CryptoError::Malformed("conversation key".into()))?;
        let mut okm = Zeroizing::new([0_u8; MESSAGE_KEYS_SIZE]);
        hk.expand(nonce, &mut okm[..])
            .map_err(|_| CryptoError::Malformed("hkdf expand".into()))?;
        Ok(Self(okm))
    }

    fn cipher(&self) -> ChaCha20 {
        let mut key = [0_u8; 32];
        let mut nonce = [0_u8; 12];
        key.copy_from_slice(&self.0[CHACHA_KEY]);
        nonce.copy_from_slice(&self.0[CHACHA_NONCE]);
        let cipher = ChaCha20::new(&key.into(), &nonce.into());
        key.zeroize();
        cipher
    }

    fn mac(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Hmac<Sha256>, CryptoError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.0[HMAC_KEY])
            .map_err(|_| CryptoError::Malformed("hmac key".into()))?;
        mac.update(nonce);
        mac.update(ciphertext);
        Ok(mac)
    }
}

/// Padded length for a plaintext of `len` bytes.
fn calc_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1_usize << ((len - 1).ilog2() + 1);
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT..=MAX_PLAINTEXT).contains(&len) {
        return Err(CryptoError::Malformed(format!(
            "plaintext length {len} out of range"
        )));
    }
    let mut out = Vec::with_capacity(2 + calc_padded_len(len));
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(plaintext);
    out.resize(2 + calc_padded_len(len), 0);
    Ok(out)
}

fn unpad(padded: &[u8]) -> Result<&[u8], CryptoError> {
    let bad = || CryptoError::Malformed("invalid padding".into());
    if padded.len() < 2 {
        return Err(bad());
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if len < MIN_PLAINTEXT || padded.len() != 2 + calc_padded_len(len) {
        return Err(bad());
    }
    Ok(&padded[2..2 + len])
}

/// Encrypt with a caller chosen nonce.
fn encrypt_with_nonce(
    secret: &SharedSecret,
    plaintext: &str,
    nonce: [u8; 32],
) -> Result<String, CryptoError> {
    let keys = MessageKeys::derive(secret, &nonce)?;
    let mut ciphertext = pad(plaintext.as_bytes())?;
    keys.cipher().apply_keystream(&mut ciphertext);
    let tag = keys.mac(&nonce, &ciphertext)?.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&tag);
    Ok(BASE64.encode(payload))
}

/// Encrypt `plaintext` under a fresh random nonce.
///
/// Fails with [CryptoError::Malformed] for an empty plaintext or one
/// longer than 65535 bytes.
pub fn encrypt(
    secret: &SharedSecret,
    plaintext: &str,
) -> Result<String, CryptoError> {
    let mut nonce = [0_u8; 32];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| CryptoError::Malformed(format!("rng failure: {e}")))?;
    encrypt_with_nonce(secret, plaintext, nonce)
}

/// Decrypt a versioned payload.
///
/// The tag is compared in constant time before padding is looked at, so
/// a tampered payload always reports [CryptoError::AuthenticationFailed].
pub fn decrypt(
    secret: &SharedSecret,
    payload: &str,
) -> Result<String, CryptoError> {
    if payload.starts_with('#') {
        return Err(CryptoError::UnsupportedVersion(0));
    }
    if !(MIN_ENCODED..=MAX_ENCODED).contains(&payload.len()) {
        return Err(CryptoError::Malformed(format!(
            "payload length {} out of range",
            payload.len()
        )));
    }
    let data = BASE64
        .decode(payload)
        .map_err(|e| CryptoError::Malformed(format!("base64: {e}")))?;
    if !(MIN_DECODED..=MAX_DECODED).contains(&data.len()) {
        return Err(CryptoError::Malformed(format!(
            "decoded length {} out of range",
            data.len()
        )));
    }
    if data[0] != VERSION {
        return Err(CryptoError::UnsupportedVersion(data[0]));
    }

    let mut nonce = [0_u8; 32];
    nonce.copy_from_slice(&data[1..33]);
    let ciphertext = &data[33..data.len() - 32];
    let tag = &data[data.len() - 32..];

    let keys = MessageKeys::derive(secret, &nonce)?;
    keys.mac(&nonce, ciphertext)?
        .verify_slice(tag)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let mut padded = Zeroizing::new(ciphertext.to_vec());
    keys.cipher().apply_keystream(&mut padded);
    let plaintext = unpad(&padded)?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|_| CryptoError::Malformed("plaintext is not utf-8".into()))
}

/// True if the payload is in the legacy nip-04 layout.
pub fn is_legacy(payload: &str) -> bool {
    payload.contains("?iv=")
}

/// Decrypt either format. Legacy payloads are refused with
/// [CryptoError::UnsupportedVersion] unless `accept_legacy` is set.
pub fn decrypt_any(
    secret: &SharedSecret,
    payload: &str,
    accept_legacy: bool,
) -> Result<String, CryptoError> {
    if is_legacy(payload) {
        if !accept_legacy {
            return Err(CryptoError::UnsupportedVersion(nip04::LEGACY_VERSION));
        }
        return nip04::decrypt(secret, payload);
    }
    decrypt(secret, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EphemeralIdentity;
    use pretty_assertions::assert_eq;

    fn scalar(n: u8) -> SecretKey {
        let mut b = [0_u8; 32];
        b[31] = n;
        SecretKey::from_bytes(b)
    }

    fn pair() -> (EphemeralIdentity, EphemeralIdentity) {
        (
            EphemeralIdentity::generate().unwrap(),
            EphemeralIdentity::generate().unwrap(),
        )
    }

    #[test]
    fn known_vector() {
        let two = EphemeralIdentity::from_secret(scalar(2)).unwrap();
        let secret = shared_secret(&scalar(1), &two.public_key()).unwrap();
        assert_eq!(
            "c41c775356fd92eadc63ff5a0dc1da211b268cbea22316767095b2871ea1412d",
            hex::encode(secret.conversation_key()),
        );

        let mut nonce = [0_u8; 32];
        nonce[31] = 1;
        let payload = encrypt_with_nonce(&secret, "a", nonce).unwrap();
        assert_eq!(
            "AgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAABee0G5VSK0/9YypIObAtDKfYEAjD35uVkHyB0F4DwrcNaCXlCWZKaArsGrY6M9wnuTMxWfp1RTN9Xga8no+kF5Vsb",
            payload,
        );
        assert_eq!("a", decrypt(&secret, &payload).unwrap());
    }

    #[test]
    fn shared_secret_is_symmetric() {
        let (a, b) = pair();
        let ab = shared_secret(a.secret_key(), &b.public_key()).unwrap();
        let ba = shared_secret(b.secret_key(), &a.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn round_trip_and_fresh_nonce() {
        let (a, b) = pair();
        let s = shared_secret(a.secret_key(), &b.public_key()).unwrap();
        let long = "é".repeat(400);
        for msg in ["x", r#"{"id":"1","result":"ack"}"#, long.as_str()] {
            let c1 = encrypt(&s, msg).unwrap();
            let c2 = encrypt(&s, msg).unwrap();
            assert_ne!(c1, c2);
            assert_eq!(msg, decrypt(&s, &c1).unwrap());
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let (a, b) = pair();
        let c = EphemeralIdentity::generate().unwrap();
        let good = shared_secret(a.secret_key(), &b.public_key()).unwrap();
        let other = shared_secret(a.secret_key(), &c.public_key()).unwrap();
        let payload = encrypt(&good, "hello").unwrap();
        assert_eq!(
            Err(CryptoError::AuthenticationFailed),
            decrypt(&other, &payload),
        );
    }

    #[test]
    fn tampered_padding_fails_authentication() {
        let (a, b) = pair();
        let s = shared_secret(a.secret_key(), &b.public_key()).unwrap();
        let mut raw = BASE64.decode(encrypt(&s, "hello").unwrap()).unwrap();
        // flip a bit inside the zero padding region
        raw[33 + 20] ^= 1;
        assert_eq!(
            Err(CryptoError::AuthenticationFailed),
            decrypt(&s, &BASE64.encode(raw)),
        );
    }

    #[test]
    fn version_and_length_checks() {
        let (a, b) = pair();
        let s = shared_secret(a.secret_key(), &b.public_key()).unwrap();

        assert_eq!(
            Err(CryptoError::UnsupportedVersion(0)),
            decrypt(&s, "#future"),
        );

        let mut raw = BASE64.decode(encrypt(&s, "hello").unwrap()).unwrap();
        raw[0] = 1;
        assert_eq!(
            Err(CryptoError::UnsupportedVersion(1)),
            decrypt(&s, &BASE64.encode(raw)),
        );

        assert!(matches!(decrypt(&s, "short"), Err(CryptoError::Malformed(_))));
        assert!(matches!(
            decrypt(&s, &"!".repeat(200)),
            Err(CryptoError::Malformed(_)),
        ));
    }

    #[test]
    fn plaintext_bounds() {
        let (a, b) = pair();
        let s = shared_secret(a.secret_key(), &b.public_key()).unwrap();
        assert!(matches!(encrypt(&s, ""), Err(CryptoError::Malformed(_))));
        assert!(encrypt(&s, &"a".repeat(MAX_PLAINTEXT)).is_ok());
        assert!(matches!(
            encrypt(&s, &"a".repeat(MAX_PLAINTEXT + 1)),
            Err(CryptoError::Malformed(_)),
        ));
    }

    #[test]
    fn padding_sizes() {
        assert_eq!(32, calc_padded_len(1));
        assert_eq!(32, calc_padded_len(32));
        assert_eq!(64, calc_padded_len(33));
        assert_eq!(320, calc_padded_len(257));
        assert_eq!(65536, calc_padded_len(65535));
    }

    #[test]
    fn invalid_pubkey_rejected() {
        let a = EphemeralIdentity::generate().unwrap();
        // x >= field prime
        assert!(matches!(
            shared_secret(a.secret_key(), &PublicKey([0xff; 32])),
            Err(CryptoError::InvalidPublicKey(_)),
        ));
    }

    #[test]
    fn legacy_gate() {
        let (a, b) = pair();
        let s = shared_secret(a.secret_key(), &b.public_key()).unwrap();
        let legacy = nip04::encrypt(&s, "ping").unwrap();
        assert_eq!("ping", decrypt_any(&s, &legacy, true).unwrap());
        assert_eq!(
            Err(CryptoError::UnsupportedVersion(nip04::LEGACY_VERSION)),
            decrypt_any(&s, &legacy, false),
        );
        let modern = encrypt(&s, "ping").unwrap();
        assert_eq!("ping", decrypt_any(&s, &modern, false).unwrap());
    }
}
