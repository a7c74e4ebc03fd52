//! Signature-verified webhook ingress
//!
//! Websub hubs sign every delivery with `x-hub-signature: <algo>=<hex>`, an
//! HMAC of the raw body under the shared secret. Only deliveries whose
//! signature matches are forwarded to the dispatcher.

use crate::error::SignatureError;
use crate::events::{Event, EventDispatcher};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Sha256, Sha384, Sha512};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

fn mac<M: Mac + KeyInit>(secret: &[u8], body: &[u8]) -> Option<Vec<u8>> {
    let mut mac = <M as KeyInit>::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}

/// HMAC of `body` under `secret`, or None for an unsupported algorithm.
fn digest(algorithm: &str, secret: &[u8], body: &[u8]) -> Option<Vec<u8>> {
    match algorithm.to_ascii_lowercase().as_str() {
        "sha256" => mac::<Hmac<Sha256>>(secret, body),
        "sha384" => mac::<Hmac<Sha384>>(secret, body),
        "sha512" => mac::<Hmac<Sha512>>(secret, body),
        _ => None,
    }
}

/// Signature header value for `body`, as a hub would send it.
pub fn sign(algorithm: &str, secret: &[u8], body: &[u8]) -> Option<String> {
    digest(algorithm, secret, body).map(|d| format!("{}={}", algorithm, hex::encode(d)))
}

/// Check a signature header against `body`.
///
/// The digests are compared in constant time.
pub fn verify_signature(
    header: Option<&str>,
    body: &[u8],
    secret: &[u8],
) -> Result<(), SignatureError> {
    let header = header.map(str::trim).filter(|h| !h.is_empty());
    let Some(header) = header else {
        return Err(SignatureError::Missing);
    };
    let (algorithm, signature) = header.split_once('=').ok_or(SignatureError::Invalid)?;
    let expected = digest(algorithm, secret, body).ok_or(SignatureError::Invalid)?;
    let given = hex::decode(signature.trim()).map_err(|_| SignatureError::Invalid)?;

    if bool::from(expected.as_slice().ct_eq(given.as_slice())) {
        Ok(())
    } else {
        Err(SignatureError::Invalid)
    }
}

/// Entry point for websub deliveries.
pub struct WebhookIngress {
    secret: Vec<u8>,
    dispatcher: Arc<EventDispatcher>,
}

impl WebhookIngress {
    pub fn new(secret: impl Into<Vec<u8>>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            secret: secret.into(),
            dispatcher,
        }
    }

    /// Verify a delivery and forward its payload as a webhook event.
    pub async fn handle(&self, headers: &HeaderMap, body: &[u8]) -> (StatusCode, &'static str) {
        let verified = match headers.get(SIGNATURE_HEADER).map(|value| value.to_str()) {
            Some(Err(_)) => Err(SignatureError::Invalid),
            header => verify_signature(header.and_then(Result::ok), body, &self.secret),
        };
        if let Err(e) = verified {
            warn!("Rejected webhook delivery: {}", e);
            let message = match e {
                SignatureError::Missing => "Missing signature",
                SignatureError::Invalid => "Invalid signature",
            };
            return (StatusCode::BAD_REQUEST, message);
        }

        let payload: Value = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Rejected webhook delivery with non-JSON body: {}", e);
                return (StatusCode::BAD_REQUEST, "Invalid payload");
            }
        };

        let report = self.dispatcher.emit(Event::Webhook { payload }).await;
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "webhook delivery dispatched"
        );
        (StatusCode::OK, "Acknowledged")
    }
}

async fn callback(
    State(ingress): State<Arc<WebhookIngress>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    ingress.handle(&headers, &body).await
}

/// Answer a hub's verification of intent by echoing its challenge.
async fn verify_intent(Query(params): Query<HashMap<String, String>>) -> (StatusCode, String) {
    let mode = params.get("hub.mode").map(String::as_str);
    match (mode, params.get("hub.challenge")) {
        (Some("subscribe" | "unsubscribe"), Some(challenge)) => {
            info!(mode = mode.unwrap_or_default(), "Confirmed websub intent");
            (StatusCode::OK, challenge.clone())
        }
        _ => (StatusCode::BAD_REQUEST, "Invalid intent".to_string()),
    }
}

/// Routes of the webhook endpoint.
pub fn router(ingress: Arc<WebhookIngress>) -> Router {
    Router::new()
        .route("/callback", post(callback).get(verify_intent))
        .with_state(ingress)
}

/// Serve the webhook endpoint on `listener` until `cancel` fires.
pub async fn serve(
    ingress: Arc<WebhookIngress>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Failed to read webhook listener address")?;
    info!("Webhook ingress listening on {}", addr);
    axum::serve(listener, router(ingress))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Webhook server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::Recorder;
    use crate::events::Topic;
    use axum::http::HeaderValue;
    use serde_json::json;

    const SECRET: &[u8] = b"websub-secret";

    fn ingress() -> (WebhookIngress, Arc<Recorder>) {
        let recorder = Recorder::new(&[Topic::Webhook]);
        let dispatcher = Arc::new(EventDispatcher::builder().subscribe(recorder.clone()).build());
        (WebhookIngress::new(SECRET, dispatcher), recorder)
    }

    fn signed(signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(signature).unwrap());
        headers
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"hello":"world"}"#;
        let header = sign("sha256", SECRET, body).unwrap();
        assert!(header.starts_with("sha256="));
        assert_eq!(verify_signature(Some(&header), body, SECRET), Ok(()));

        assert_eq!(
            verify_signature(Some(&header), b"tampered", SECRET),
            Err(SignatureError::Invalid)
        );
        assert_eq!(verify_signature(None, body, SECRET), Err(SignatureError::Missing));
        assert_eq!(verify_signature(Some(""), body, SECRET), Err(SignatureError::Missing));
        assert_eq!(
            verify_signature(Some("md5=abcd"), body, SECRET),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            verify_signature(Some("sha256=not-hex"), body, SECRET),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            verify_signature(Some("no-separator"), body, SECRET),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn test_other_algorithms() {
        let body = b"payload";
        for algorithm in ["sha384", "sha512", "SHA256"] {
            let header = sign(algorithm, SECRET, body).unwrap();
            assert_eq!(verify_signature(Some(&header), body, SECRET), Ok(()));
        }
        // Truncated digest.
        let header = sign("sha512", SECRET, body).unwrap();
        let truncated = &header[..header.len() - 2];
        assert_eq!(
            verify_signature(Some(truncated), body, SECRET),
            Err(SignatureError::Invalid)
        );
    }

    #[tokio::test]
    async fn test_valid_delivery_is_acknowledged_and_forwarded() {
        let (ingress, recorder) = ingress();
        let body = serde_json::to_vec(&json!({"event": "registration", "addresses": []})).unwrap();
        let headers = signed(&sign("sha256", SECRET, &body).unwrap());

        assert_eq!(ingress.handle(&headers, &body).await, (StatusCode::OK, "Acknowledged"));
        assert_eq!(
            recorder.events(),
            vec![Event::Webhook {
                payload: json!({"event": "registration", "addresses": []})
            }]
        );
    }

    #[tokio::test]
    async fn test_rejected_deliveries_are_not_forwarded() {
        let (ingress, recorder) = ingress();
        let body = br#"{"a":1}"#;

        let wrong = signed(&sign("sha256", b"other-secret", body).unwrap());
        assert_eq!(
            ingress.handle(&wrong, body).await,
            (StatusCode::BAD_REQUEST, "Invalid signature")
        );
        assert_eq!(
            ingress.handle(&HeaderMap::new(), body).await,
            (StatusCode::BAD_REQUEST, "Missing signature")
        );

        let not_json = b"not json";
        let headers = signed(&sign("sha256", SECRET, not_json).unwrap());
        assert_eq!(
            ingress.handle(&headers, not_json).await,
            (StatusCode::BAD_REQUEST, "Invalid payload")
        );

        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_http_endpoint() {
        let (ingress, recorder) = ingress();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(Arc::new(ingress), listener, cancel.clone()));

        let client = reqwest::Client::new();
        let url = format!("http://{}/callback", addr);
        let body = br#"{"ping":true}"#.to_vec();

        let response = client
            .post(&url)
            .header(SIGNATURE_HEADER, sign("sha256", SECRET, &body).unwrap())
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "Acknowledged");

        let response = client.post(&url).body(body).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 400);
        assert_eq!(response.text().await.unwrap(), "Missing signature");

        let response = client
            .get(format!("{}?hub.mode=subscribe&hub.challenge=abc123", url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "abc123");

        assert_eq!(recorder.events().len(), 1);
        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
