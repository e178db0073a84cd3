#![forbid(unsafe_code)]

//! Token secrets at rest: PBKDF2-HMAC-SHA256 stretches the user key with a
//! per-secret salt, AES-256-GCM seals the secret. Stored as base64 of
//! `iv || salt || ciphertext`.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use auth2_contracts::envelope::UserKey;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

const IV_LEN: usize = 12;
const SALT_LEN: usize = 12;
const DERIVED_KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretCipherError {
    #[error("secret encryption failed")]
    Encrypt,

    #[error("data decryption error")]
    Decrypt,

    #[error("sealed secret is malformed: {0}")]
    Malformed(String),
}

pub fn encrypt_secret(user_key: &UserKey, secret: &str) -> Result<String, SecretCipherError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let derived = derive_key(user_key.as_bytes(), &salt);
    let cipher = Aes256Gcm::new_from_slice(&derived).map_err(|_| SecretCipherError::Encrypt)?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), secret.as_bytes())
        .map_err(|_| SecretCipherError::Encrypt)?;

    let mut out = Vec::with_capacity(IV_LEN + SALT_LEN + sealed.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

pub fn decrypt_secret(user_key: &UserKey, sealed: &str) -> Result<String, SecretCipherError> {
    let raw = BASE64
        .decode(sealed.trim().as_bytes())
        .map_err(|e| SecretCipherError::Malformed(e.to_string()))?;
    if raw.len() <= IV_LEN + SALT_LEN {
        return Err(SecretCipherError::Malformed("too short".to_string()));
    }
    let (iv, rest) = raw.split_at(IV_LEN);
    let (salt, ciphertext) = rest.split_at(SALT_LEN);

    let derived = derive_key(user_key.as_bytes(), salt);
    let cipher = Aes256Gcm::new_from_slice(&derived).map_err(|_| SecretCipherError::Decrypt)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| SecretCipherError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| SecretCipherError::Malformed("not UTF-8".to_string()))
}

fn derive_key(user_key: &[u8], salt: &[u8]) -> [u8; DERIVED_KEY_LEN] {
    let mut key = [0u8; DERIVED_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(user_key, salt, PBKDF2_ROUNDS, &mut key);
    key
}
