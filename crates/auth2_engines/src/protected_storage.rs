#![forbid(unsafe_code)]

//! Platform-protected storage seen through two narrow capabilities: a store of
//! wrapping keys that never hands key material out, and a store of sealed
//! records addressed by alias.
//!
//! The file-backed implementations are the desktop stand-in for a hardware
//! keystore: the wrapping key lives in a `0600` file next to the record.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use auth2_contracts::envelope::{EncryptionEnvelope, ENVELOPE_IV_LEN, WRAPPING_KEY_LEN};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProtectedStorageError {
    #[error("invalid alias: {0}")]
    InvalidAlias(String),

    #[error("wrapping key not found: {0}")]
    MissingWrappingKey(String),

    #[error("wrapping key material is invalid")]
    InvalidWrappingKey,

    #[error("wrapping key already exists: {0}")]
    KeyExists(String),

    #[error("protected record already exists: {0}")]
    RecordExists(String),

    #[error("protected record is malformed: {0}")]
    MalformedRecord(String),

    #[error("protected storage cryptographic operation failed")]
    Crypto,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protected storage lock poisoned")]
    LockPoisoned,
}

/// Wrapping keys are used in place: callers hand data in to be sealed or
/// opened and never see the key itself.
pub trait WrappingKeyStore: Send + Sync + Debug {
    fn contains_key(&self, alias: &str) -> Result<bool, ProtectedStorageError>;

    /// AES-256-GCM, no padding. Fails if the alias already holds a key.
    fn generate_key(&self, alias: &str) -> Result<(), ProtectedStorageError>;

    fn seal(
        &self,
        alias: &str,
        iv: &[u8; ENVELOPE_IV_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProtectedStorageError>;

    fn open(
        &self,
        alias: &str,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtectedStorageError>;
}

pub trait EnvelopeRecordStore: Send + Sync + Debug {
    fn load(&self, alias: &str) -> Result<Option<EncryptionEnvelope>, ProtectedStorageError>;

    /// Never overwrites: an existing record yields `RecordExists`.
    fn insert_new(&self, envelope: &EncryptionEnvelope) -> Result<(), ProtectedStorageError>;
}

#[derive(Debug, Clone)]
pub struct FileWrappingKeyStore {
    dir: PathBuf,
}

impl FileWrappingKeyStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self, alias: &str) -> Result<PathBuf, ProtectedStorageError> {
        validate_alias(alias)?;
        Ok(self.dir.join(format!("{alias}.wrapping.key")))
    }

    fn load_key(&self, alias: &str) -> Result<[u8; WRAPPING_KEY_LEN], ProtectedStorageError> {
        let path = self.key_path(alias)?;
        if !path.exists() {
            return Err(ProtectedStorageError::MissingWrappingKey(alias.to_string()));
        }
        let encoded = fs::read_to_string(&path)?;
        let decoded = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|_| ProtectedStorageError::InvalidWrappingKey)?;
        key_from_slice(&decoded)
    }
}

impl WrappingKeyStore for FileWrappingKeyStore {
    fn contains_key(&self, alias: &str) -> Result<bool, ProtectedStorageError> {
        Ok(self.key_path(alias)?.exists())
    }

    fn generate_key(&self, alias: &str) -> Result<(), ProtectedStorageError> {
        let path = self.key_path(alias)?;
        if path.exists() {
            return Err(ProtectedStorageError::KeyExists(alias.to_string()));
        }
        fs::create_dir_all(&self.dir)?;
        let mut key = [0u8; WRAPPING_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        write_new_file_restricted(&path, BASE64.encode(key).as_bytes())?;
        Ok(())
    }

    fn seal(
        &self,
        alias: &str,
        iv: &[u8; ENVELOPE_IV_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProtectedStorageError> {
        let key = self.load_key(alias)?;
        gcm_seal(&key, iv, plaintext)
    }

    fn open(
        &self,
        alias: &str,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtectedStorageError> {
        let key = self.load_key(alias)?;
        gcm_open(&key, iv, ciphertext)
    }
}

// Versionless; the field names are the persisted layout.
#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeFile {
    iv: String,
    encrypted_key: String,
}

#[derive(Debug, Clone)]
pub struct FileEnvelopeRecordStore {
    dir: PathBuf,
}

impl FileEnvelopeRecordStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, alias: &str) -> Result<PathBuf, ProtectedStorageError> {
        validate_alias(alias)?;
        Ok(self.dir.join(format!("{alias}.envelope.json")))
    }
}

impl EnvelopeRecordStore for FileEnvelopeRecordStore {
    fn load(&self, alias: &str) -> Result<Option<EncryptionEnvelope>, ProtectedStorageError> {
        let path = self.record_path(alias)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let file: EnvelopeFile = serde_json::from_str(&raw)
            .map_err(|e| ProtectedStorageError::MalformedRecord(e.to_string()))?;
        let initialization_vector = BASE64
            .decode(file.iv.trim().as_bytes())
            .map_err(|e| ProtectedStorageError::MalformedRecord(format!("iv: {e}")))?;
        let ciphertext = BASE64
            .decode(file.encrypted_key.trim().as_bytes())
            .map_err(|e| ProtectedStorageError::MalformedRecord(format!("encrypted_key: {e}")))?;
        Ok(Some(EncryptionEnvelope {
            wrapping_key_alias: alias.to_string(),
            initialization_vector,
            ciphertext,
        }))
    }

    fn insert_new(&self, envelope: &EncryptionEnvelope) -> Result<(), ProtectedStorageError> {
        let path = self.record_path(&envelope.wrapping_key_alias)?;
        if path.exists() {
            return Err(ProtectedStorageError::RecordExists(
                envelope.wrapping_key_alias.clone(),
            ));
        }
        fs::create_dir_all(&self.dir)?;
        let file = EnvelopeFile {
            iv: BASE64.encode(&envelope.initialization_vector),
            encrypted_key: BASE64.encode(&envelope.ciphertext),
        };
        atomic_write(&path, &serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }
}

/// In-process keystore. Keys vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryWrappingKeyStore {
    keys: Mutex<BTreeMap<String, [u8; WRAPPING_KEY_LEN]>>,
}

impl MemoryWrappingKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a key the way an OS credential change invalidates a hardware key.
    pub fn invalidate_key(&self, alias: &str) -> Result<bool, ProtectedStorageError> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| ProtectedStorageError::LockPoisoned)?;
        Ok(keys.remove(alias).is_some())
    }

    fn key(&self, alias: &str) -> Result<[u8; WRAPPING_KEY_LEN], ProtectedStorageError> {
        let keys = self
            .keys
            .lock()
            .map_err(|_| ProtectedStorageError::LockPoisoned)?;
        keys.get(alias)
            .copied()
            .ok_or_else(|| ProtectedStorageError::MissingWrappingKey(alias.to_string()))
    }
}

impl WrappingKeyStore for MemoryWrappingKeyStore {
    fn contains_key(&self, alias: &str) -> Result<bool, ProtectedStorageError> {
        let keys = self
            .keys
            .lock()
            .map_err(|_| ProtectedStorageError::LockPoisoned)?;
        Ok(keys.contains_key(alias))
    }

    fn generate_key(&self, alias: &str) -> Result<(), ProtectedStorageError> {
        validate_alias(alias)?;
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| ProtectedStorageError::LockPoisoned)?;
        if keys.contains_key(alias) {
            return Err(ProtectedStorageError::KeyExists(alias.to_string()));
        }
        let mut key = [0u8; WRAPPING_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        keys.insert(alias.to_string(), key);
        Ok(())
    }

    fn seal(
        &self,
        alias: &str,
        iv: &[u8; ENVELOPE_IV_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProtectedStorageError> {
        gcm_seal(&self.key(alias)?, iv, plaintext)
    }

    fn open(
        &self,
        alias: &str,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtectedStorageError> {
        gcm_open(&self.key(alias)?, iv, ciphertext)
    }
}

#[derive(Debug, Default)]
pub struct MemoryEnvelopeRecordStore {
    records: Mutex<BTreeMap<String, EncryptionEnvelope>>,
}

impl MemoryEnvelopeRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnvelopeRecordStore for MemoryEnvelopeRecordStore {
    fn load(&self, alias: &str) -> Result<Option<EncryptionEnvelope>, ProtectedStorageError> {
        let records = self
            .records
            .lock()
            .map_err(|_| ProtectedStorageError::LockPoisoned)?;
        Ok(records.get(alias).cloned())
    }

    fn insert_new(&self, envelope: &EncryptionEnvelope) -> Result<(), ProtectedStorageError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| ProtectedStorageError::LockPoisoned)?;
        if records.contains_key(&envelope.wrapping_key_alias) {
            return Err(ProtectedStorageError::RecordExists(
                envelope.wrapping_key_alias.clone(),
            ));
        }
        records.insert(envelope.wrapping_key_alias.clone(), envelope.clone());
        Ok(())
    }
}

fn validate_alias(alias: &str) -> Result<(), ProtectedStorageError> {
    let ok = !alias.is_empty()
        && alias.len() <= 64
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(ProtectedStorageError::InvalidAlias(alias.to_string()))
    }
}

fn key_from_slice(raw: &[u8]) -> Result<[u8; WRAPPING_KEY_LEN], ProtectedStorageError> {
    if raw.len() != WRAPPING_KEY_LEN {
        return Err(ProtectedStorageError::InvalidWrappingKey);
    }
    let mut key = [0u8; WRAPPING_KEY_LEN];
    key.copy_from_slice(raw);
    Ok(key)
}

fn gcm_seal(
    key: &[u8; WRAPPING_KEY_LEN],
    iv: &[u8; ENVELOPE_IV_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtectedStorageError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ProtectedStorageError::Crypto)?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| ProtectedStorageError::Crypto)
}

fn gcm_open(
    key: &[u8; WRAPPING_KEY_LEN],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ProtectedStorageError> {
    if iv.len() != ENVELOPE_IV_LEN {
        return Err(ProtectedStorageError::Crypto);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| ProtectedStorageError::Crypto)?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| ProtectedStorageError::Crypto)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ProtectedStorageError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn write_new_file_restricted(path: &Path, data: &[u8]) -> Result<(), ProtectedStorageError> {
    let mut file = OpenOptions::new().create_new(true).write(true).open(path)?;
    file.write_all(data)?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
