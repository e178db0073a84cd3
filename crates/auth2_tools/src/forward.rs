#![forbid(unsafe_code)]

use std::time::Duration;

use auth2_adapter::{LinkDeliveryRequest, LinkDeliveryResponse};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);
const REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Hands an enrollment link to an already running `auth2 run`. Returns the
/// ingress status (`queued`). The link is never echoed in errors.
pub fn forward_link(base_url: &str, link: &str) -> Result<String, String> {
    let link = link.trim();
    if link.is_empty() {
        return Err("link must not be empty".to_string());
    }
    let payload = serde_json::to_string(&LinkDeliveryRequest {
        url: link.to_string(),
    })
    .map_err(|e| format!("link payload encode failed: {e}"))?;

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(REQUEST_TIMEOUT)
        .timeout_write(REQUEST_TIMEOUT)
        .build();
    let endpoint = format!("{}/v1/links", base_url.trim_end_matches('/'));
    match agent
        .post(&endpoint)
        .set("content-type", "application/json")
        .send_string(&payload)
    {
        Ok(resp) => {
            let body = resp
                .into_string()
                .map_err(|e| format!("failed to read ingress reply: {e}"))?;
            let reply: LinkDeliveryResponse = serde_json::from_str(&body)
                .map_err(|e| format!("unexpected ingress reply: {e}"))?;
            Ok(reply.status)
        }
        Err(ureq::Error::Status(code, resp)) => {
            let reason = resp
                .into_string()
                .ok()
                .and_then(|body| serde_json::from_str::<LinkDeliveryResponse>(&body).ok())
                .and_then(|r| r.reason)
                .unwrap_or_default();
            Err(format!("ingress refused link with http status {code} {reason}")
                .trim_end()
                .to_string())
        }
        Err(ureq::Error::Transport(err)) => Err(format!(
            "no running auth2 instance at {base_url}: {err}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::forward_link;
    use auth2_adapter::{serve, IngressState};
    use auth2_contracts::readiness::GateStatus;
    use auth2_os::link_ingress::LinkIngestionBuffer;
    use tokio::net::TcpListener;
    use tokio::sync::{oneshot, watch};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_forward_01_link_reaches_running_ingress() {
        let links = LinkIngestionBuffer::new();
        let (_status_tx, status_rx) = watch::channel(GateStatus::initial());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(
            listener,
            IngressState::new(links.clone(), status_rx),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let link = "otpauth://totp/Example:alice?secret=JBSWY3DPEHPK3PXP&issuer=Example";
        let status = tokio::task::spawn_blocking(move || forward_link(&base, link))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, "queued");
        assert_eq!(links.take_latest().as_deref(), Some(link));

        let _ = stop_tx.send(());
        server.await.unwrap().unwrap();
    }

    #[test]
    fn at_forward_02_nothing_listening_is_reported() {
        let err = forward_link("http://127.0.0.1:9", "otpauth://totp/x?secret=AAAA").unwrap_err();
        assert!(err.contains("no running auth2 instance"));
        assert!(!err.contains("secret=AAAA"));
    }

    #[test]
    fn at_forward_03_blank_link_rejected_locally() {
        assert_eq!(
            forward_link("http://127.0.0.1:9", "  ").unwrap_err(),
            "link must not be empty"
        );
    }
}
