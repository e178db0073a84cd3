#![forbid(unsafe_code)]

use std::sync::Arc;

use auth2_contracts::envelope::UserKey;
use auth2_contracts::readiness::{
    AuthenticationOutcome, GateBlocker, GateStatus, MigrationOutcome, ReadinessState,
};
use auth2_engines::key_envelope::{EncryptedKeyEnvelope, EnvelopeError};
use tokio::sync::{watch, Mutex};

use crate::bridge::{BiometricAuthenticator, MigrationBridge};

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("operation requires {expected}, gate is {actual}")]
    WrongState {
        expected: ReadinessState,
        actual: ReadinessState,
    },

    #[error("database reset is only offered after a failed migration")]
    ResetNotOffered,

    #[error("migration failed; only a confirmed database reset can continue")]
    ResetRequired,

    #[error("stored encryption key is corrupt: {0}")]
    EnvelopeCorrupt(String),

    #[error("key envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Proof that the user explicitly agreed to wipe the token database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetConfirmation {
    _confirmed: (),
}

impl ResetConfirmation {
    pub fn confirmed_by_user() -> Self {
        Self { _confirmed: () }
    }
}

/// Launch sequencing: migration, then biometric unlock, then the encryption
/// key. Transitions are strictly sequential and forward-only except for the
/// confirmed reset, which re-runs migration from `Migrating`.
///
/// `Ready` is only published after the envelope has returned the user key.
pub struct ReadinessGate {
    migration: Arc<dyn MigrationBridge>,
    authenticator: Arc<dyn BiometricAuthenticator>,
    envelope: Arc<EncryptedKeyEnvelope>,
    status: watch::Sender<GateStatus>,
    step: Mutex<()>,
}

impl ReadinessGate {
    pub fn new(
        migration: Arc<dyn MigrationBridge>,
        authenticator: Arc<dyn BiometricAuthenticator>,
        envelope: Arc<EncryptedKeyEnvelope>,
    ) -> Self {
        let (status, _) = watch::channel(GateStatus::initial());
        Self {
            migration,
            authenticator,
            envelope,
            status,
            step: Mutex::new(()),
        }
    }

    pub fn status(&self) -> GateStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ReadinessState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<GateStatus> {
        self.status.subscribe()
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.status.subscribe();
        // The sender lives as long as `self`, so this only returns on Ready.
        let _ = rx.wait_for(GateStatus::is_ready).await;
    }

    /// Runs migration if one is pending. A failure leaves the gate in
    /// `Migrating` with a `MigrationFailed` blocker; after that only
    /// `reset_and_migrate` can move it.
    pub async fn start_migration(&self) -> Result<MigrationOutcome, GateError> {
        let _step = self.step.lock().await;
        let status = self.require(ReadinessState::Migrating)?;
        if matches!(status.blocker, Some(GateBlocker::MigrationFailed { .. })) {
            return Err(GateError::ResetRequired);
        }

        let available = match self.migration.migration_is_available().await {
            Ok(available) => available,
            Err(err) => {
                tracing::error!(error = %err, "migration availability check failed");
                return Ok(self.migration_failed(err.to_string()));
            }
        };
        if !available {
            tracing::info!("no migration pending");
            self.transition(ReadinessState::AwaitingAuthentication, None);
            return Ok(MigrationOutcome::not_needed());
        }

        Ok(self.run_migration_locked().await)
    }

    /// Destructive recovery after a failed migration: wipes the database,
    /// then migrates again.
    pub async fn reset_and_migrate(
        &self,
        _confirmation: ResetConfirmation,
    ) -> Result<MigrationOutcome, GateError> {
        let _step = self.step.lock().await;
        let status = self.require(ReadinessState::Migrating)?;
        if !matches!(status.blocker, Some(GateBlocker::MigrationFailed { .. })) {
            return Err(GateError::ResetNotOffered);
        }

        tracing::warn!("user confirmed database reset");
        if let Err(err) = self.migration.reset_database().await {
            tracing::error!(error = %err, "database reset failed");
            return Ok(self.migration_failed(err.to_string()));
        }
        Ok(self.run_migration_locked().await)
    }

    /// One biometric prompt. Failure keeps the gate where it is; callers may
    /// retry without limit.
    pub async fn authenticate(&self) -> Result<AuthenticationOutcome, GateError> {
        let _step = self.step.lock().await;
        self.require(ReadinessState::AwaitingAuthentication)?;

        let outcome = self.authenticator.authenticate().await;
        match &outcome {
            AuthenticationOutcome::Succeeded => {
                self.transition(ReadinessState::AwaitingEncryptionKey, None);
            }
            AuthenticationOutcome::Failed => {
                tracing::warn!("biometric authentication failed");
                self.block(GateBlocker::AuthenticationFailed {
                    message: "authentication failed".to_string(),
                });
            }
            AuthenticationOutcome::Error(message) => {
                tracing::warn!(error = %message, "biometric authentication error");
                self.block(GateBlocker::AuthenticationFailed {
                    message: message.clone(),
                });
            }
        }
        Ok(outcome)
    }

    /// Prompts until the authenticator succeeds. There is no bypass.
    pub async fn authenticate_until_success(&self) -> Result<u32, GateError> {
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            if self.authenticate().await?.is_success() {
                return Ok(attempts);
            }
        }
    }

    /// Opens the envelope. Present key: `Ready`. No key yet: stays in
    /// `AwaitingEncryptionKey` with an `EncryptionKeyRequired` blocker.
    /// Corrupt: terminal.
    pub async fn resolve_encryption_key(&self) -> Result<ReadinessState, GateError> {
        let _step = self.step.lock().await;
        self.require_key_stage()?;

        let envelope = Arc::clone(&self.envelope);
        let opened = tokio::task::spawn_blocking(move || {
            envelope.initialize()?;
            envelope.get()
        })
        .await
        .map_err(|e| GateError::Join(e.to_string()))?;

        match opened {
            Ok(_) => {
                self.transition(ReadinessState::Ready, None);
                Ok(ReadinessState::Ready)
            }
            Err(EnvelopeError::Unavailable) => {
                tracing::info!("no encryption key stored yet");
                self.block(GateBlocker::EncryptionKeyRequired);
                Ok(ReadinessState::AwaitingEncryptionKey)
            }
            Err(err) => Err(self.envelope_failure(err)),
        }
    }

    /// Stores the user's first key, reads it back, then opens the gate.
    pub async fn commit_encryption_key(&self, key: UserKey) -> Result<(), GateError> {
        let _step = self.step.lock().await;
        self.require_key_stage()?;

        let envelope = Arc::clone(&self.envelope);
        let committed = tokio::task::spawn_blocking(move || {
            envelope.initialize()?;
            envelope.set(&key)?;
            envelope.get().map(|_| ())
        })
        .await
        .map_err(|e| GateError::Join(e.to_string()))?;

        match committed {
            Ok(()) => {
                self.transition(ReadinessState::Ready, None);
                Ok(())
            }
            Err(EnvelopeError::AlreadySet) => {
                tracing::warn!("encryption key already set; resolve it instead");
                Err(GateError::Envelope(EnvelopeError::AlreadySet))
            }
            Err(err) => Err(self.envelope_failure(err)),
        }
    }

    /// Runs the next step that needs no user input and returns the new
    /// status. Steps that are blocked on the user are left alone.
    pub async fn advance(&self) -> Result<GateStatus, GateError> {
        let status = self.status();
        match (status.state, &status.blocker) {
            (ReadinessState::Migrating, None) => {
                self.start_migration().await?;
            }
            (ReadinessState::AwaitingAuthentication, _) => {
                self.authenticate().await?;
            }
            (ReadinessState::AwaitingEncryptionKey, None) => {
                self.resolve_encryption_key().await?;
            }
            _ => {}
        }
        Ok(self.status())
    }

    async fn run_migration_locked(&self) -> MigrationOutcome {
        tracing::info!("running token database migration");
        match self.migration.run_migration().await {
            Ok(()) => {
                self.transition(ReadinessState::AwaitingAuthentication, None);
                MigrationOutcome::succeeded()
            }
            Err(err) => {
                tracing::error!(error = %err, "token database migration failed");
                self.migration_failed(err.to_string())
            }
        }
    }

    fn migration_failed(&self, message: String) -> MigrationOutcome {
        self.block(GateBlocker::MigrationFailed {
            message: message.clone(),
        });
        MigrationOutcome::failed(message)
    }

    fn envelope_failure(&self, err: EnvelopeError) -> GateError {
        match err {
            EnvelopeError::Corrupt(message) => {
                tracing::error!(error = %message, "stored encryption key is corrupt");
                self.block(GateBlocker::EnvelopeCorrupt {
                    message: message.clone(),
                });
                GateError::EnvelopeCorrupt(message)
            }
            other => {
                tracing::error!(error = %other, "key envelope failure");
                GateError::Envelope(other)
            }
        }
    }

    fn require(&self, expected: ReadinessState) -> Result<GateStatus, GateError> {
        let status = self.status();
        if status.state != expected {
            return Err(GateError::WrongState {
                expected,
                actual: status.state,
            });
        }
        Ok(status)
    }

    fn require_key_stage(&self) -> Result<(), GateError> {
        let status = self.require(ReadinessState::AwaitingEncryptionKey)?;
        if let Some(GateBlocker::EnvelopeCorrupt { message }) = status.blocker {
            return Err(GateError::EnvelopeCorrupt(message));
        }
        Ok(())
    }

    fn transition(&self, next: ReadinessState, blocker: Option<GateBlocker>) {
        let from = self.state();
        self.status.send_replace(GateStatus {
            state: next,
            blocker,
        });
        tracing::info!(from = %from, to = %next, "readiness transition");
    }

    fn block(&self, blocker: GateBlocker) {
        self.status.send_modify(|s| s.blocker = Some(blocker));
    }
}
