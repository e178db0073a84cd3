#![forbid(unsafe_code)]

//! Local HTTP ingress: the desktop stand-in for the OS deep-link entry point.

use std::future::Future;

use auth2_contracts::readiness::GateStatus;
use auth2_os::link_ingress::LinkIngestionBuffer;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct IngressState {
    links: LinkIngestionBuffer,
    readiness: watch::Receiver<GateStatus>,
}

impl IngressState {
    pub fn new(links: LinkIngestionBuffer, readiness: watch::Receiver<GateStatus>) -> Self {
        Self { links, readiness }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub readiness: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LinkDeliveryRequest {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LinkDeliveryResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/links", post(deliver_link))
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: IngressState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "link ingress listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn healthz(State(state): State<IngressState>) -> (StatusCode, Json<HealthResponse>) {
    let readiness = state.readiness.borrow().state;
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            readiness: readiness.as_str().to_string(),
        }),
    )
}

/// Accepted before the gate opens too; the buffer holds the link until the
/// token list attaches.
pub async fn deliver_link(
    State(state): State<IngressState>,
    Json(request): Json<LinkDeliveryRequest>,
) -> (StatusCode, Json<LinkDeliveryResponse>) {
    let url = request.url.trim();
    if url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(LinkDeliveryResponse {
                status: "error".to_string(),
                reason: Some("url must not be empty".to_string()),
            }),
        );
    }
    state.links.deliver(url);
    (
        StatusCode::ACCEPTED,
        Json(LinkDeliveryResponse {
            status: "queued".to_string(),
            reason: None,
        }),
    )
}
