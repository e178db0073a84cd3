#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use auth2_contracts::common::SchemaVersion;
use auth2_contracts::token::{
    TokenAlg, TokenDetail, TokenId, TokenSummary, DEFAULT_DIGITS, DEFAULT_PERIOD_SECS, MAX_DIGITS,
    MAX_PERIOD_SECS, MIN_DIGITS,
};
use auth2_contracts::{ContractViolation, Validate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// v1: token table. v2: every row carries digits/period/algorithm.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion(2);

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database schema {found} needs migration to {expected}")]
    MigrationRequired { found: u32, expected: u32 },

    #[error("mismatched migration is found: schema {found} is newer than {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("database document is malformed: {0}")]
    Malformed(String),

    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: TokenId,
    pub account: String,
    pub service: Option<String>,
    /// Sealed with the user key; never plaintext.
    pub secret: String,
    pub algorithm: TokenAlg,
    pub digits: u8,
    pub period: u32,
}

impl TokenRecord {
    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            id: self.id,
            account: self.account.clone(),
            service: self.service.clone(),
        }
    }

    pub fn detail(&self) -> TokenDetail {
        TokenDetail {
            id: self.id,
            account: self.account.clone(),
            service: self.service.clone(),
            algorithm: self.algorithm,
            digits: self.digits,
            period: self.period,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecordInput {
    pub account: String,
    pub service: Option<String>,
    pub sealed_secret: String,
    pub algorithm: TokenAlg,
    pub digits: u8,
    pub period: u32,
}

impl Validate for TokenRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.account.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "account",
                reason: "must not be empty",
            });
        }
        if self.sealed_secret.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "secret",
                reason: "must not be empty",
            });
        }
        if !(MIN_DIGITS..=MAX_DIGITS).contains(&self.digits) {
            return Err(ContractViolation::InvalidRange {
                field: "digits",
                min: u64::from(MIN_DIGITS),
                max: u64::from(MAX_DIGITS),
                got: u64::from(self.digits),
            });
        }
        if !(1..=MAX_PERIOD_SECS).contains(&self.period) {
            return Err(ContractViolation::InvalidRange {
                field: "period",
                min: 1,
                max: u64::from(MAX_PERIOD_SECS),
                got: u64::from(self.period),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenDocument {
    schema_version: u32,
    next_id: u64,
    tokens: Vec<TokenRecord>,
}

#[derive(Debug, Clone)]
enum Backend {
    File(PathBuf),
    Memory(Option<String>),
}

/// Token database kept as one JSON document. An absent or empty document is
/// schema 0; everything else must be migrated to `CURRENT_SCHEMA_VERSION`
/// before tokens can be read or written.
#[derive(Debug, Clone)]
pub struct TokenStore {
    backend: Backend,
}

impl TokenStore {
    pub fn open(path: PathBuf) -> Self {
        Self {
            backend: Backend::File(path),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(None),
        }
    }

    /// In-memory store seeded with a raw document, e.g. one written by an
    /// older release.
    pub fn from_raw_document(raw: impl Into<String>) -> Self {
        Self {
            backend: Backend::Memory(Some(raw.into())),
        }
    }

    pub fn schema_version(&self) -> Result<SchemaVersion, StorageError> {
        match self.read_value()? {
            None => Ok(SchemaVersion(0)),
            Some(value) => version_of(&value),
        }
    }

    pub fn is_migration_available(&self) -> Result<bool, StorageError> {
        let found = self.schema_version()?;
        if found > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                found: found.0,
                expected: CURRENT_SCHEMA_VERSION.0,
            });
        }
        Ok(found < CURRENT_SCHEMA_VERSION)
    }

    /// Applies every pending step and persists once. Returns the new version.
    pub fn run_migration(&mut self) -> Result<SchemaVersion, StorageError> {
        let mut value = self.read_value()?;
        let mut version = match &value {
            None => SchemaVersion(0),
            Some(v) => version_of(v)?,
        };
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                found: version.0,
                expected: CURRENT_SCHEMA_VERSION.0,
            });
        }
        if version == CURRENT_SCHEMA_VERSION {
            return Ok(version);
        }

        while version < CURRENT_SCHEMA_VERSION {
            value = Some(match version.0 {
                0 => migrate_v0_to_v1(value)?,
                1 => migrate_v1_to_v2(value)?,
                other => {
                    return Err(StorageError::Malformed(format!(
                        "no migration step from schema {other}"
                    )))
                }
            });
            version = SchemaVersion(version.0 + 1);
            tracing::info!(schema_version = version.0, "token database migrated");
        }

        let value = value.ok_or_else(|| StorageError::Malformed("empty document".to_string()))?;
        // Typed round-trip proves the migrated document is loadable.
        let doc: TokenDocument = serde_json::from_value(value)?;
        self.save(&doc)?;
        Ok(version)
    }

    /// Destroys every token. The next `is_migration_available` reports true.
    pub fn reset(&mut self) -> Result<(), StorageError> {
        match &mut self.backend {
            Backend::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, b"")?;
            }
            Backend::Memory(raw) => *raw = None,
        }
        tracing::warn!("token database reset");
        Ok(())
    }

    pub fn insert_token(&mut self, input: TokenRecordInput) -> Result<TokenId, StorageError> {
        input.validate()?;
        let mut doc = self.load()?;
        let id = TokenId(doc.next_id);
        doc.next_id = doc
            .next_id
            .checked_add(1)
            .ok_or_else(|| StorageError::Malformed("token id space exhausted".to_string()))?;
        doc.tokens.push(TokenRecord {
            id,
            account: input.account,
            service: input.service,
            secret: input.sealed_secret,
            algorithm: input.algorithm,
            digits: input.digits,
            period: input.period,
        });
        self.save(&doc)?;
        Ok(id)
    }

    pub fn remove_token(&mut self, id: TokenId) -> Result<bool, StorageError> {
        let mut doc = self.load()?;
        let before = doc.tokens.len();
        doc.tokens.retain(|t| t.id != id);
        let removed = doc.tokens.len() != before;
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    pub fn list_tokens(&self) -> Result<Vec<TokenSummary>, StorageError> {
        let doc = self.load()?;
        let mut out: Vec<TokenSummary> = doc.tokens.iter().map(TokenRecord::summary).collect();
        out.sort_by_key(|t| t.id);
        Ok(out)
    }

    pub fn token(&self, id: TokenId) -> Result<Option<TokenRecord>, StorageError> {
        let doc = self.load()?;
        Ok(doc.tokens.into_iter().find(|t| t.id == id))
    }

    fn load(&self) -> Result<TokenDocument, StorageError> {
        let Some(value) = self.read_value()? else {
            return Err(StorageError::MigrationRequired {
                found: 0,
                expected: CURRENT_SCHEMA_VERSION.0,
            });
        };
        let found = version_of(&value)?;
        if found > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                found: found.0,
                expected: CURRENT_SCHEMA_VERSION.0,
            });
        }
        if found < CURRENT_SCHEMA_VERSION {
            return Err(StorageError::MigrationRequired {
                found: found.0,
                expected: CURRENT_SCHEMA_VERSION.0,
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    fn save(&mut self, doc: &TokenDocument) -> Result<(), StorageError> {
        let serialized = serde_json::to_string_pretty(doc)?;
        match &mut self.backend {
            Backend::File(path) => atomic_write(path, serialized.as_bytes())?,
            Backend::Memory(raw) => *raw = Some(serialized),
        }
        Ok(())
    }

    fn read_value(&self) -> Result<Option<Value>, StorageError> {
        let raw = match &self.backend {
            Backend::File(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                fs::read_to_string(path)?
            }
            Backend::Memory(raw) => match raw {
                Some(raw) => raw.clone(),
                None => return Ok(None),
            },
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

fn version_of(value: &Value) -> Result<SchemaVersion, StorageError> {
    let raw = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| StorageError::Malformed("missing schema_version".to_string()))?;
    let v = u32::try_from(raw)
        .map_err(|_| StorageError::Malformed("schema_version out of range".to_string()))?;
    Ok(SchemaVersion(v))
}

fn migrate_v0_to_v1(_value: Option<Value>) -> Result<Value, StorageError> {
    Ok(json!({
        "schema_version": 1,
        "next_id": 1,
        "tokens": [],
    }))
}

fn migrate_v1_to_v2(value: Option<Value>) -> Result<Value, StorageError> {
    let mut value =
        value.ok_or_else(|| StorageError::Malformed("schema 1 document missing".to_string()))?;
    let tokens = value
        .get_mut("tokens")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| StorageError::Malformed("tokens must be an array".to_string()))?;
    for token in tokens.iter_mut() {
        let row = token
            .as_object_mut()
            .ok_or_else(|| StorageError::Malformed("token row must be an object".to_string()))?;
        row.entry("digits").or_insert(json!(DEFAULT_DIGITS));
        row.entry("period").or_insert(json!(DEFAULT_PERIOD_SECS));
        row.entry("algorithm")
            .or_insert(json!(TokenAlg::default().as_str()));
    }
    let obj = value
        .as_object_mut()
        .ok_or_else(|| StorageError::Malformed("document must be an object".to_string()))?;
    obj.insert("schema_version".to_string(), json!(2));
    Ok(value)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}
