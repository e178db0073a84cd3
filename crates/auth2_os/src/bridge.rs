#![forbid(unsafe_code)]

//! Narrow capability seams between the bootstrap orchestration and the
//! credential core. Every seam is a trait so tests inject fakes.

use std::fmt::Debug;

use async_trait::async_trait;
use auth2_contracts::envelope::UserKey;
use auth2_contracts::readiness::AuthenticationOutcome;
use auth2_contracts::token::{GeneratedCode, NewToken, TokenDetail, TokenId, TokenSummary};
use auth2_contracts::BridgeError;
use auth2_engines::key_envelope::{EncryptedKeyEnvelope, EnvelopeError};

#[async_trait]
pub trait MigrationBridge: Send + Sync {
    async fn migration_is_available(&self) -> Result<bool, BridgeError>;

    async fn run_migration(&self) -> Result<(), BridgeError>;

    /// Destructive. Only reachable through a user-confirmed reset.
    async fn reset_database(&self) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait TokenBridge: Send + Sync {
    async fn add_token(&self, token: NewToken) -> Result<TokenDetail, BridgeError>;

    /// `LinkRejected` for anything that is not a TOTP enrollment link.
    async fn add_token_from_url(&self, url: &str) -> Result<TokenDetail, BridgeError>;

    async fn list_tokens(&self) -> Result<Vec<TokenSummary>, BridgeError>;

    async fn token_detail(&self, id: TokenId) -> Result<Option<TokenDetail>, BridgeError>;

    /// `NotFound` when no such token exists.
    async fn remove_token(&self, id: TokenId) -> Result<(), BridgeError>;
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate_current_code(&self, id: TokenId) -> Result<GeneratedCode, BridgeError>;
}

/// Everything the client consumes from the core.
pub trait CoreBridge: MigrationBridge + TokenBridge + CodeGenerator {}

impl<T> CoreBridge for T where T: MigrationBridge + TokenBridge + CodeGenerator + ?Sized {}

#[async_trait]
pub trait BiometricAuthenticator: Send + Sync {
    async fn authenticate(&self) -> AuthenticationOutcome;
}

/// Where the core obtains the user key. `Ok(None)` means none was ever set.
pub trait KeySource: Send + Sync + Debug {
    fn user_key(&self) -> Result<Option<UserKey>, BridgeError>;
}

impl KeySource for EncryptedKeyEnvelope {
    fn user_key(&self) -> Result<Option<UserKey>, BridgeError> {
        match self.get() {
            Ok(key) => Ok(Some(key)),
            Err(EnvelopeError::Unavailable) => Ok(None),
            Err(EnvelopeError::Corrupt(reason)) => Err(BridgeError::KeyCorrupt(reason)),
            Err(err) => Err(BridgeError::Internal(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KeySource;
    use auth2_contracts::envelope::UserKey;
    use auth2_contracts::BridgeError;
    use auth2_engines::key_envelope::EncryptedKeyEnvelope;

    #[test]
    fn at_bridge_01_envelope_key_source_maps_absence_to_none() {
        let env = EncryptedKeyEnvelope::in_memory();
        env.initialize().unwrap();
        assert_eq!(env.user_key().unwrap(), None);

        env.set(&UserKey::new("hunter2").unwrap()).unwrap();
        let key = env.user_key().unwrap().unwrap();
        assert_eq!(key.expose_secret(), "hunter2");
    }

    #[test]
    fn at_bridge_02_uninitialized_envelope_is_internal_error() {
        let env = EncryptedKeyEnvelope::in_memory();
        assert!(matches!(env.user_key(), Err(BridgeError::Internal(_))));
    }
}
