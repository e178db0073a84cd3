#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use auth2_contracts::envelope::UserKey;
use auth2_contracts::token::{GeneratedCode, NewToken, TokenDetail, TokenId, TokenSummary};
use auth2_contracts::{BridgeError, ContractViolation};
use auth2_engines::secret_cipher::{decrypt_secret, encrypt_secret, SecretCipherError};
use auth2_engines::totp::{
    generate_at, generate_current, parse_enrollment_url, Clock, SystemClock, TotpError, TotpParams,
};
use auth2_storage::token_store::{StorageError, TokenRecordInput, TokenStore};

use crate::bridge::{CodeGenerator, KeySource, MigrationBridge, TokenBridge};

/// In-process core: JSON token store, secrets sealed with the user key,
/// codes from `totp-rs`. Store and cipher work runs on the blocking pool.
#[derive(Clone)]
pub struct LocalCore {
    store: Arc<Mutex<TokenStore>>,
    keys: Arc<dyn KeySource>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for LocalCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCore")
            .field("keys", &self.keys)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl LocalCore {
    pub fn new(store: TokenStore, keys: Arc<dyn KeySource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            keys,
            clock,
        }
    }

    pub fn with_system_clock(store: TokenStore, keys: Arc<dyn KeySource>) -> Self {
        Self::new(store, keys, Arc::new(SystemClock))
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&mut TokenStore, &dyn KeySource, &dyn Clock) -> Result<T, BridgeError>
            + Send
            + 'static,
    {
        let store = Arc::clone(&self.store);
        let keys = Arc::clone(&self.keys);
        let clock = Arc::clone(&self.clock);
        tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|_| BridgeError::Internal("token store lock poisoned".to_string()))?;
            f(&mut guard, keys.as_ref(), clock.as_ref())
        })
        .await
        .map_err(|e| BridgeError::Internal(format!("{op} task failed: {e}")))?
    }
}

#[async_trait]
impl MigrationBridge for LocalCore {
    async fn migration_is_available(&self) -> Result<bool, BridgeError> {
        self.blocking("migration_is_available", |store, _, _| {
            store.is_migration_available().map_err(migration_err)
        })
        .await
    }

    async fn run_migration(&self) -> Result<(), BridgeError> {
        self.blocking("run_migration", |store, _, _| {
            store.run_migration().map(|_| ()).map_err(migration_err)
        })
        .await
    }

    async fn reset_database(&self) -> Result<(), BridgeError> {
        self.blocking("reset_database", |store, _, _| {
            store.reset().map_err(migration_err)
        })
        .await
    }
}

#[async_trait]
impl TokenBridge for LocalCore {
    async fn add_token(&self, token: NewToken) -> Result<TokenDetail, BridgeError> {
        self.blocking("add_token", move |store, keys, _| {
            let key = require_key(keys)?;
            insert_token(store, &key, token)
        })
        .await
    }

    async fn add_token_from_url(&self, url: &str) -> Result<TokenDetail, BridgeError> {
        let url = url.to_string();
        self.blocking("add_token_from_url", move |store, keys, _| {
            let params = parse_enrollment_url(&url).map_err(|e| {
                tracing::warn!(error = %e, "enrollment link rejected");
                BridgeError::LinkRejected(e.to_string())
            })?;
            let token = NewToken::v1(
                params.account,
                params.issuer,
                params.secret_base32,
                Some(params.algorithm),
                Some(params.digits),
                Some(params.period),
            )
            .map_err(|v| BridgeError::LinkRejected(v.to_string()))?;
            let key = require_key(keys)?;
            insert_token(store, &key, token)
        })
        .await
    }

    async fn list_tokens(&self) -> Result<Vec<TokenSummary>, BridgeError> {
        self.blocking("list_tokens", |store, _, _| {
            store.list_tokens().map_err(storage_err)
        })
        .await
    }

    async fn token_detail(&self, id: TokenId) -> Result<Option<TokenDetail>, BridgeError> {
        self.blocking("token_detail", move |store, _, _| {
            Ok(store.token(id).map_err(storage_err)?.map(|r| r.detail()))
        })
        .await
    }

    async fn remove_token(&self, id: TokenId) -> Result<(), BridgeError> {
        self.blocking("remove_token", move |store, _, _| {
            if store.remove_token(id).map_err(storage_err)? {
                tracing::info!(token_id = %id, "token removed");
                Ok(())
            } else {
                Err(BridgeError::NotFound(id))
            }
        })
        .await
    }
}

#[async_trait]
impl CodeGenerator for LocalCore {
    async fn generate_current_code(&self, id: TokenId) -> Result<GeneratedCode, BridgeError> {
        self.blocking("generate_current_code", move |store, keys, clock| {
            let key = require_key(keys)?;
            let record = store
                .token(id)
                .map_err(storage_err)?
                .ok_or(BridgeError::NotFound(id))?;
            let secret = decrypt_secret(&key, &record.secret).map_err(cipher_err)?;
            let params = TotpParams {
                algorithm: record.algorithm,
                digits: record.digits,
                period: record.period,
                secret_base32: secret,
                issuer: record.service,
                account: record.account,
            };
            generate_current(&params, clock).map_err(|e| BridgeError::Generation(e.to_string()))
        })
        .await
    }
}

fn insert_token(
    store: &mut TokenStore,
    key: &UserKey,
    token: NewToken,
) -> Result<TokenDetail, BridgeError> {
    let params = TotpParams {
        algorithm: token.algorithm_or_default(),
        digits: token.digits_or_default(),
        period: token.period_or_default(),
        secret_base32: token.secret.trim().to_string(),
        issuer: token.service.clone(),
        account: token.account.clone(),
    };
    // Refuse secrets that could never produce a code.
    generate_at(&params, 0).map_err(|e| match e {
        TotpError::InvalidSecret(_) => BridgeError::Contract(ContractViolation::InvalidValue {
            field: "secret",
            reason: "must be base32",
        }),
        other => BridgeError::Generation(other.to_string()),
    })?;

    let sealed = encrypt_secret(key, &params.secret_base32).map_err(cipher_err)?;
    let id = store
        .insert_token(TokenRecordInput {
            account: params.account,
            service: params.issuer,
            sealed_secret: sealed,
            algorithm: params.algorithm,
            digits: params.digits,
            period: params.period,
        })
        .map_err(storage_err)?;
    tracing::info!(token_id = %id, "token added");
    store
        .token(id)
        .map_err(storage_err)?
        .map(|r| r.detail())
        .ok_or(BridgeError::NotFound(id))
}

fn require_key(keys: &dyn KeySource) -> Result<UserKey, BridgeError> {
    keys.user_key()?.ok_or(BridgeError::KeyUnavailable)
}

fn migration_err(err: StorageError) -> BridgeError {
    tracing::error!(error = %err, "token database migration step failed");
    BridgeError::Migration(err.to_string())
}

fn storage_err(err: StorageError) -> BridgeError {
    match err {
        StorageError::ContractViolation(v) => BridgeError::Contract(v),
        other => {
            tracing::error!(error = %other, "token store error");
            BridgeError::Internal(other.to_string())
        }
    }
}

fn cipher_err(err: SecretCipherError) -> BridgeError {
    match err {
        SecretCipherError::Decrypt => BridgeError::Decrypt,
        other => BridgeError::Internal(other.to_string()),
    }
}
