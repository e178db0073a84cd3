#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use auth2_contracts::envelope::{
    EncryptionEnvelope, UserKey, ENCRYPTION_KEY_ALIAS, ENVELOPE_IV_LEN,
};
use auth2_contracts::{ContractViolation, Validate};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::protected_storage::{
    EnvelopeRecordStore, FileEnvelopeRecordStore, FileWrappingKeyStore, MemoryEnvelopeRecordStore,
    MemoryWrappingKeyStore, ProtectedStorageError, WrappingKeyStore,
};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("key envelope used before initialize()")]
    NotInitialized,

    /// First run: nothing was ever stored. Expected, not a failure.
    #[error("no encryption key has been stored")]
    Unavailable,

    /// A record exists but cannot be opened. Never recovered automatically:
    /// a fresh key would strand every secret sealed with the old one.
    #[error("stored encryption key cannot be decrypted: {0}")]
    Corrupt(String),

    #[error("encryption key is already set and cannot be changed")]
    AlreadySet,

    #[error("invalid encryption key: {0}")]
    InvalidKey(#[from] ContractViolation),

    #[error("protected storage error: {0}")]
    Storage(#[from] ProtectedStorageError),

    #[error("key envelope lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStatus {
    Present,
    Absent,
    Corrupt,
}

impl EnvelopeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Corrupt => "corrupt",
        }
    }
}

#[derive(Debug, Default)]
struct EnvelopeGuard {
    initialized: bool,
}

/// The user key at rest, sealed under a wrapping key that stays inside
/// protected storage. One record per installation, set once, never rotated.
///
/// Every operation runs inside one critical section so concurrent `get`/`set`
/// calls cannot interleave partial writes.
#[derive(Debug)]
pub struct EncryptedKeyEnvelope {
    alias: String,
    wrapping: Arc<dyn WrappingKeyStore>,
    records: Arc<dyn EnvelopeRecordStore>,
    guard: Mutex<EnvelopeGuard>,
}

impl EncryptedKeyEnvelope {
    pub fn new(
        alias: impl Into<String>,
        wrapping: Arc<dyn WrappingKeyStore>,
        records: Arc<dyn EnvelopeRecordStore>,
    ) -> Self {
        Self {
            alias: alias.into(),
            wrapping,
            records,
            guard: Mutex::new(EnvelopeGuard::default()),
        }
    }

    /// File-backed keystore rooted at `dir`, under the fixed alias.
    pub fn for_dir(dir: PathBuf) -> Self {
        Self::new(
            ENCRYPTION_KEY_ALIAS,
            Arc::new(FileWrappingKeyStore::new(dir.clone())),
            Arc::new(FileEnvelopeRecordStore::new(dir)),
        )
    }

    pub fn in_memory() -> Self {
        Self::new(
            ENCRYPTION_KEY_ALIAS,
            Arc::new(MemoryWrappingKeyStore::new()),
            Arc::new(MemoryEnvelopeRecordStore::new()),
        )
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Idempotent. Generates the wrapping key on first use.
    pub fn initialize(&self) -> Result<(), EnvelopeError> {
        let mut guard = self.guard.lock().map_err(|_| EnvelopeError::LockPoisoned)?;
        if !self.wrapping.contains_key(&self.alias)? {
            tracing::info!(alias = %self.alias, "generating wrapping key");
            self.wrapping.generate_key(&self.alias)?;
        }
        guard.initialized = true;
        Ok(())
    }

    pub fn get(&self) -> Result<UserKey, EnvelopeError> {
        let guard = self.guard.lock().map_err(|_| EnvelopeError::LockPoisoned)?;
        if !guard.initialized {
            return Err(EnvelopeError::NotInitialized);
        }
        self.open_locked()
    }

    /// Rejected with `AlreadySet` once any envelope exists; there is no way
    /// to change the key short of wiping the installation.
    pub fn set(&self, key: &UserKey) -> Result<(), EnvelopeError> {
        key.validate()?;
        let guard = self.guard.lock().map_err(|_| EnvelopeError::LockPoisoned)?;
        if !guard.initialized {
            return Err(EnvelopeError::NotInitialized);
        }
        if self.record_present_locked()? {
            return Err(EnvelopeError::AlreadySet);
        }

        let mut iv = [0u8; ENVELOPE_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = self.wrapping.seal(&self.alias, &iv, key.as_bytes())?;
        let envelope = EncryptionEnvelope {
            wrapping_key_alias: self.alias.clone(),
            initialization_vector: iv.to_vec(),
            ciphertext,
        };
        envelope.validate()?;
        match self.records.insert_new(&envelope) {
            Ok(()) => {}
            Err(ProtectedStorageError::RecordExists(_)) => return Err(EnvelopeError::AlreadySet),
            Err(err) => return Err(err.into()),
        }
        tracing::info!(alias = %self.alias, "encryption key committed");
        Ok(())
    }

    pub fn status(&self) -> Result<EnvelopeStatus, EnvelopeError> {
        match self.get() {
            Ok(_) => Ok(EnvelopeStatus::Present),
            Err(EnvelopeError::Unavailable) => Ok(EnvelopeStatus::Absent),
            Err(EnvelopeError::Corrupt(_)) => Ok(EnvelopeStatus::Corrupt),
            Err(err) => Err(err),
        }
    }

    fn record_present_locked(&self) -> Result<bool, EnvelopeError> {
        match self.records.load(&self.alias) {
            Ok(record) => Ok(record.is_some()),
            // A malformed record still counts as "set".
            Err(ProtectedStorageError::MalformedRecord(_)) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    fn open_locked(&self) -> Result<UserKey, EnvelopeError> {
        let envelope = match self.records.load(&self.alias) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Err(EnvelopeError::Unavailable),
            Err(ProtectedStorageError::MalformedRecord(reason)) => {
                return Err(EnvelopeError::Corrupt(reason))
            }
            Err(err) => return Err(err.into()),
        };
        envelope
            .validate()
            .map_err(|v| EnvelopeError::Corrupt(v.to_string()))?;

        let plaintext = self
            .wrapping
            .open(
                &self.alias,
                &envelope.initialization_vector,
                &envelope.ciphertext,
            )
            .map_err(|err| match err {
                ProtectedStorageError::Crypto => {
                    EnvelopeError::Corrupt("wrapping key cannot open the envelope".to_string())
                }
                ProtectedStorageError::MissingWrappingKey(alias) => {
                    EnvelopeError::Corrupt(format!("wrapping key {alias} is gone"))
                }
                other => EnvelopeError::Storage(other),
            })?;
        let key = String::from_utf8(plaintext)
            .map_err(|_| EnvelopeError::Corrupt("key is not valid UTF-8".to_string()))?;
        UserKey::new(key).map_err(|v| EnvelopeError::Corrupt(v.to_string()))
    }
}
