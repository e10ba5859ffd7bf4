//! Payload encryption primitive.
//!
//! XChaCha20-Poly1305 with a random 24-byte nonce prepended to the
//! ciphertext. Used for per-token payload encryption and for sealing
//! config fields at rest.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: key mismatch or tampered ciphertext")]
    Decrypt,
    #[error("ciphertext too short")]
    Truncated,
    #[error("invalid key encoding")]
    BadKey,
}

/// Generate a fresh symmetric key from OS randomness.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Decode a hex key string into raw bytes.
pub fn decode_key(hex_key: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = hex::decode(hex_key).map_err(|_| CryptoError::BadKey)?;
    bytes.try_into().map_err(|_| CryptoError::BadKey)
}

/// Encrypt `plaintext`, returning `nonce || ciphertext`.
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let aead = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let mut buf = plaintext.to_vec();
    aead.encrypt_in_place(&nonce, b"", &mut buf)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&buf);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext` blob produced by [`encrypt`].
pub fn decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::Truncated);
    }

    let aead = XChaCha20Poly1305::new(key.into());
    let nonce_bytes: [u8; NONCE_LEN] = data[..NONCE_LEN].try_into().unwrap();
    let nonce = XNonce::from(nonce_bytes);

    let mut buf = data[NONCE_LEN..].to_vec();
    aead.decrypt_in_place(&nonce, b"", &mut buf)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(buf)
}
