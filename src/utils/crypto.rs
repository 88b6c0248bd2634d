//! Unit-price encryption.
//!
//! Stored prices are AES-256-GCM sealed and base64 encoded, with the 12-byte
//! nonce prepended to the ciphertext. The key is compiled in and can be
//! overridden at build time via the `CRYPTO_KEY` environment variable.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::AppError;

const DEFAULT_CRYPTO_KEY: &str = "Af0b2Bc5e9d0C84adF0A5887cF43aB63";

/// Process-wide crypto key. Runtime override is not supported.
pub const CRYPTO_KEY: &str = match option_env!("CRYPTO_KEY") {
    Some(key) => key,
    None => DEFAULT_CRYPTO_KEY,
};

const NONCE_SIZE: usize = 12;

fn cipher(key: &[u8]) -> Result<Aes256Gcm, AppError> {
    if key.len() != 32 {
        return Err(AppError::CryptoError(anyhow::anyhow!(
            "crypto key must be 32 bytes, got {}",
            key.len()
        )));
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}

pub fn encrypt_with_key(plaintext: &[u8], key: &[u8]) -> Result<String, AppError> {
    let cipher = cipher(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| AppError::CryptoError(anyhow::anyhow!("encrypt failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

pub fn decrypt_with_key(ciphertext: &str, key: &[u8]) -> Result<Vec<u8>, AppError> {
    let cipher = cipher(key)?;
    let raw = BASE64
        .decode(ciphertext)
        .map_err(|e| AppError::CryptoError(anyhow::anyhow!("invalid ciphertext: {}", e)))?;
    if raw.len() < NONCE_SIZE {
        return Err(AppError::CryptoError(anyhow::anyhow!(
            "ciphertext too short"
        )));
    }
    let (nonce, sealed) = raw.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|e| AppError::CryptoError(anyhow::anyhow!("decrypt failed: {}", e)))
}

pub fn encrypt_int64(value: i64) -> Result<String, AppError> {
    encrypt_with_key(value.to_string().as_bytes(), CRYPTO_KEY.as_bytes())
}

pub fn encrypt_float64(value: f64) -> Result<String, AppError> {
    encrypt_with_key(value.to_string().as_bytes(), CRYPTO_KEY.as_bytes())
}

pub fn decrypt_int64_with_key(ciphertext: &str, key: &[u8]) -> Result<i64, AppError> {
    let plaintext = decrypt_with_key(ciphertext, key)?;
    let text = String::from_utf8(plaintext)
        .map_err(|e| AppError::CryptoError(anyhow::anyhow!("plaintext not utf-8: {}", e)))?;
    text.trim()
        .parse()
        .map_err(|e| AppError::CryptoError(anyhow::anyhow!("plaintext not an i64: {}", e)))
}

pub fn decrypt_int64(ciphertext: &str) -> Result<i64, AppError> {
    decrypt_int64_with_key(ciphertext, CRYPTO_KEY.as_bytes())
}

pub fn decrypt_float64(ciphertext: &str) -> Result<f64, AppError> {
    let plaintext = decrypt_with_key(ciphertext, CRYPTO_KEY.as_bytes())?;
    let text = String::from_utf8(plaintext)
        .map_err(|e| AppError::CryptoError(anyhow::anyhow!("plaintext not utf-8: {}", e)))?;
    text.trim()
        .parse()
        .map_err(|e| AppError::CryptoError(anyhow::anyhow!("plaintext not an f64: {}", e)))
}
