#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use auth2_contracts::readiness::ReadinessState;
use auth2_engines::key_envelope::EncryptedKeyEnvelope;
use auth2_storage::token_store::TokenStore;

use crate::bridge::{BiometricAuthenticator, CodeGenerator, CoreBridge, TokenBridge};
use crate::config::Auth2Config;
use crate::link_ingress::LinkIngestionBuffer;
use crate::local_core::LocalCore;
use crate::readiness_gate::{GateError, ReadinessGate};
use crate::token_list::{ConsumerHandle, TokenListConsumer};
use crate::token_refresh::TokenRefreshScheduler;

/// Composition root. Owns the single envelope and link buffer of the
/// process and hands them to each component.
pub struct AppRuntime {
    tokens: Arc<dyn TokenBridge>,
    codes: Arc<dyn CodeGenerator>,
    envelope: Arc<EncryptedKeyEnvelope>,
    links: LinkIngestionBuffer,
    gate: Arc<ReadinessGate>,
    refresh_tick: Duration,
}

impl AppRuntime {
    pub fn new<C>(
        core: Arc<C>,
        envelope: Arc<EncryptedKeyEnvelope>,
        authenticator: Arc<dyn BiometricAuthenticator>,
        refresh_tick: Duration,
    ) -> Self
    where
        C: CoreBridge + 'static,
    {
        let gate = Arc::new(ReadinessGate::new(
            core.clone(),
            authenticator,
            Arc::clone(&envelope),
        ));
        Self {
            tokens: core.clone(),
            codes: core,
            envelope,
            links: LinkIngestionBuffer::new(),
            gate,
            refresh_tick,
        }
    }

    /// File-backed store and keystore under the configured data directory.
    pub fn from_config(
        config: &Auth2Config,
        authenticator: Arc<dyn BiometricAuthenticator>,
    ) -> Self {
        let envelope = Arc::new(EncryptedKeyEnvelope::for_dir(config.keystore_dir.clone()));
        let core = Arc::new(LocalCore::with_system_clock(
            TokenStore::open(config.database_path.clone()),
            envelope.clone(),
        ));
        tracing::info!(
            database = %config.database_path.display(),
            keystore = %config.keystore_dir.display(),
            "runtime assembled"
        );
        Self::new(core, envelope, authenticator, config.refresh_tick)
    }

    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }

    pub fn links(&self) -> &LinkIngestionBuffer {
        &self.links
    }

    pub fn envelope(&self) -> &Arc<EncryptedKeyEnvelope> {
        &self.envelope
    }

    /// Starts the token list and link import. Only allowed once the gate is
    /// `Ready`.
    pub async fn open_main_session(&self) -> Result<MainSession, GateError> {
        let state = self.gate.state();
        if state != ReadinessState::Ready {
            return Err(GateError::WrongState {
                expected: ReadinessState::Ready,
                actual: state,
            });
        }
        let consumer = TokenListConsumer::new(Arc::clone(&self.tokens), self.links.clone());
        if let Err(err) = consumer.reload().await {
            tracing::error!(error = %err, "initial token list load failed");
        }
        let link_import = consumer.attach();
        tracing::info!("main session opened");
        Ok(MainSession {
            consumer,
            scheduler: TokenRefreshScheduler::new(Arc::clone(&self.codes), self.refresh_tick),
            _link_import: link_import,
        })
    }
}

pub struct MainSession {
    pub consumer: TokenListConsumer,
    pub scheduler: TokenRefreshScheduler,
    _link_import: ConsumerHandle,
}

#[cfg(test)]
mod tests {
    use super::AppRuntime;
    use crate::bridge::BiometricAuthenticator;
    use crate::local_core::LocalCore;
    use crate::readiness_gate::GateError;
    use crate::token_list::LinkImportReport;
    use async_trait::async_trait;
    use auth2_contracts::envelope::UserKey;
    use auth2_contracts::readiness::{AuthenticationOutcome, ReadinessState};
    use auth2_engines::key_envelope::EncryptedKeyEnvelope;
    use auth2_storage::token_store::TokenStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Present;

    #[async_trait]
    impl BiometricAuthenticator for Present {
        async fn authenticate(&self) -> AuthenticationOutcome {
            AuthenticationOutcome::Succeeded
        }
    }

    fn runtime() -> AppRuntime {
        let envelope = Arc::new(EncryptedKeyEnvelope::in_memory());
        let core = Arc::new(LocalCore::with_system_clock(
            TokenStore::new_in_memory(),
            envelope.clone(),
        ));
        AppRuntime::new(core, envelope, Arc::new(Present), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn at_runtime_01_session_refused_before_ready() {
        let rt = runtime();
        assert!(matches!(
            rt.open_main_session().await,
            Err(GateError::WrongState {
                expected: ReadinessState::Ready,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn at_runtime_02_early_link_reaches_token_list_after_unlock() {
        let rt = runtime();
        rt.links().deliver(
            "otpauth://totp/Example:alice?secret=JBSWY3DPEHPK3PXP&issuer=Example",
        );

        let gate = rt.gate();
        gate.advance().await.unwrap();
        gate.advance().await.unwrap();
        let status = gate.advance().await.unwrap();
        assert_eq!(status.state, ReadinessState::AwaitingEncryptionKey);
        gate.commit_encryption_key(UserKey::new("pw").unwrap())
            .await
            .unwrap();
        assert!(rt.links().has_pending());

        let session = rt.open_main_session().await.unwrap();
        let mut reports = session.consumer.reports();
        let mut cache = session.consumer.watch_tokens();
        // The import may finish before `reports()` subscribed; the cache
        // covers both orders.
        timeout(Duration::from_secs(5), cache.wait_for(|t| t.len() == 1))
            .await
            .unwrap()
            .unwrap();
        assert!(!rt.links().has_pending());
        if let Ok(report) = reports.try_recv() {
            assert!(matches!(report, LinkImportReport::Imported(_)));
        }

        let id = session.consumer.tokens()[0].id;
        let view = session.scheduler.activate(id);
        let mut state = view.watch();
        let shown = timeout(
            Duration::from_secs(5),
            state.wait_for(|s| s.current_code.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(shown.current_code.as_deref().map(str::len), Some(6));
        assert!((1..=30).contains(&shown.seconds_remaining));
    }
}
