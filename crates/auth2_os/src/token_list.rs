#![forbid(unsafe_code)]

use std::sync::Arc;

use auth2_contracts::token::{NewToken, TokenDetail, TokenId, TokenSummary};
use auth2_contracts::BridgeError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::bridge::TokenBridge;
use crate::link_ingress::LinkIngestionBuffer;

const REPORT_CAPACITY: usize = 16;

/// Result of importing one delivered enrollment link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkImportReport {
    Imported(TokenDetail),
    Rejected { reason: String },
}

struct ConsumerInner {
    tokens: Arc<dyn TokenBridge>,
    links: LinkIngestionBuffer,
    cache: watch::Sender<Vec<TokenSummary>>,
    reports: broadcast::Sender<LinkImportReport>,
}

/// The main token list. Owns the cached summaries and, once attached,
/// imports every enrollment link delivered to the buffer.
#[derive(Clone)]
pub struct TokenListConsumer {
    inner: Arc<ConsumerInner>,
}

impl TokenListConsumer {
    pub fn new(tokens: Arc<dyn TokenBridge>, links: LinkIngestionBuffer) -> Self {
        let (cache, _) = watch::channel(Vec::new());
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            inner: Arc::new(ConsumerInner {
                tokens,
                links,
                cache,
                reports,
            }),
        }
    }

    /// Subscribes first, then drains anything delivered before attaching,
    /// so no link falls between the two.
    pub fn attach(&self) -> ConsumerHandle {
        let mut subscription = self.inner.links.subscribe();
        let consumer = self.clone();
        let task = tokio::spawn(async move {
            consumer.drain_pending().await;
            while subscription.wait().await {
                consumer.drain_pending().await;
            }
            tracing::debug!("link buffer closed; consumer stopped");
        });
        ConsumerHandle { task }
    }

    pub fn tokens(&self) -> Vec<TokenSummary> {
        self.inner.cache.borrow().clone()
    }

    pub fn watch_tokens(&self) -> watch::Receiver<Vec<TokenSummary>> {
        self.inner.cache.subscribe()
    }

    pub fn reports(&self) -> broadcast::Receiver<LinkImportReport> {
        self.inner.reports.subscribe()
    }

    pub async fn reload(&self) -> Result<Vec<TokenSummary>, BridgeError> {
        let tokens = self.inner.tokens.list_tokens().await?;
        self.inner.cache.send_replace(tokens.clone());
        Ok(tokens)
    }

    pub async fn add_token(&self, token: NewToken) -> Result<TokenDetail, BridgeError> {
        let detail = self.inner.tokens.add_token(token).await?;
        self.reload_logged().await;
        Ok(detail)
    }

    pub async fn remove_token(&self, id: TokenId) -> Result<(), BridgeError> {
        self.inner.tokens.remove_token(id).await?;
        self.reload_logged().await;
        Ok(())
    }

    pub async fn token_detail(&self, id: TokenId) -> Result<Option<TokenDetail>, BridgeError> {
        self.inner.tokens.token_detail(id).await
    }

    /// Imports one link and publishes the outcome. The URL carries the
    /// secret and is not logged.
    pub async fn import_url(&self, url: &str) -> LinkImportReport {
        let report = match self.inner.tokens.add_token_from_url(url).await {
            Ok(detail) => {
                tracing::info!(token_id = %detail.id, "enrollment link imported");
                self.reload_logged().await;
                LinkImportReport::Imported(detail)
            }
            Err(err) => {
                tracing::warn!(error = %err, "enrollment link not imported");
                LinkImportReport::Rejected {
                    reason: err.to_string(),
                }
            }
        };
        let _ = self.inner.reports.send(report.clone());
        report
    }

    async fn drain_pending(&self) {
        while let Some(url) = self.inner.links.take_latest() {
            self.import_url(&url).await;
        }
    }

    async fn reload_logged(&self) {
        if let Err(err) = self.reload().await {
            tracing::error!(error = %err, "token list reload failed");
        }
    }
}

/// Keeps the link import task alive. Dropping it detaches the consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
