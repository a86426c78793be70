//! Legacy `base64(ciphertext)?iv=base64(iv)` payloads.
//!
//! AES-256-CBC with PKCS#7 padding, keyed directly by the ecdh x
//! coordinate. There is no authentication tag; a wrong key usually shows
//! up as a padding failure and is reported as [CryptoError::Malformed].

use super::SharedSecret;
use crate::*;
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::cipher::{
    block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Version reported for legacy payloads, which carry no version byte.
pub const LEGACY_VERSION: u8 = 0;

const IV_MARKER: &str = "?iv=";

/// Encrypt in the legacy format. Only used to talk to old signers in
/// tests; the engine always sends the versioned format.
pub fn encrypt(
    secret: &SharedSecret,
    plaintext: &str,
) -> Result<String, CryptoError> {
    let mut iv = [0_u8; 16];
    getrandom::getrandom(&mut iv)
        .map_err(|e| CryptoError::Malformed(format!("rng failure: {e}")))?;
    let cipher = Aes256CbcEnc::new(secret.legacy_key().into(), &iv.into());
    let ciphertext =
        cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!(
        "{}{IV_MARKER}{}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Decrypt a legacy payload.
pub fn decrypt(
    secret: &SharedSecret,
    payload: &str,
) -> Result<String, CryptoError> {
    let (ct, iv) = payload
        .split_once(IV_MARKER)
        .ok_or_else(|| CryptoError::Malformed("missing iv".into()))?;
    let ct = BASE64
        .decode(ct)
        .map_err(|e| CryptoError::Malformed(format!("base64: {e}")))?;
    let iv = BASE64
        .decode(iv)
        .map_err(|e| CryptoError::Malformed(format!("base64 iv: {e}")))?;
    if iv.len() != 16 {
        return Err(CryptoError::Malformed("iv must be 16 bytes".into()));
    }
    let cipher =
        Aes256CbcDec::new(secret.legacy_key().into(), iv.as_slice().into());
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|_| CryptoError::Malformed("invalid padding".into()))?;
    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::Malformed("plaintext is not utf-8".into()))
}
