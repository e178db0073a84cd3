#![forbid(unsafe_code)]

use std::fmt;

use crate::common::require_non_blank;
use crate::{ContractViolation, Validate};

/// Fixed, versionless alias of the protected record holding the user key.
/// Changing it (or the record layout) orphans every existing installation.
pub const ENCRYPTION_KEY_ALIAS: &str = "encryptKey";
pub const ENVELOPE_IV_LEN: usize = 12;
pub const WRAPPING_KEY_LEN: usize = 32;
const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionEnvelope {
    pub wrapping_key_alias: String,
    pub initialization_vector: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Validate for EncryptionEnvelope {
    fn validate(&self) -> Result<(), ContractViolation> {
        require_non_blank("wrapping_key_alias", &self.wrapping_key_alias)?;
        if self.initialization_vector.len() != ENVELOPE_IV_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "initialization_vector",
                reason: "must be 12 bytes",
            });
        }
        if self.ciphertext.len() <= GCM_TAG_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "ciphertext",
                reason: "must be longer than the authentication tag",
            });
        }
        Ok(())
    }
}

/// User-chosen secret-encryption key. Permanent once committed.
#[derive(Clone, PartialEq, Eq)]
pub struct UserKey(String);

impl UserKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(key.into());
        v.validate()?;
        Ok(v)
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Validate for UserKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        require_non_blank("encryption_key", &self.0)
    }
}

impl fmt::Debug for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserKey(<redacted>)")
    }
}
