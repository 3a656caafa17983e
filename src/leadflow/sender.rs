//! Outbound adapter to the messaging provider.
//!
//! [`OutboundSender`] abstracts the provider's send surface: plain text
//! plus media by publicly reachable URL. Implementations are best
//! effort: no internal retry; the response processor decides retry
//! policy from the [`SendError`] classification.

use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::Serialize;

use crate::leadflow::assets::MediaKind;
use crate::leadflow::error::SendError;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client keeps TLS sessions and DNS lookups warm across
    /// the many small sends a busy funnel produces.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Trait-driven abstraction over the messaging provider's send API.
///
/// Implementations must be thread-safe (`Send + Sync`); a single shared
/// instance serves every thread. Each call returns the provider's
/// message id on success.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    /// Send a plain text message.
    async fn send_text(&self, to: &str, body: &str) -> Result<String, SendError>;

    /// Send a media message. `url` must be reachable by the provider.
    async fn send_media(&self, to: &str, url: &str, kind: MediaKind) -> Result<String, SendError>;
}

#[derive(Serialize)]
struct SendPayload<'a> {
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_kind: Option<MediaKind>,
}

/// Reqwest-backed sender posting JSON to the provider's send endpoint.
///
/// Status mapping: 2xx is success (the `message_id` field of the
/// response body, or the raw body when the provider returns none),
/// 5xx and transport failures are [`SendError::Transient`], everything
/// else is [`SendError::Permanent`].
pub struct HttpOutboundSender {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpOutboundSender {
    pub fn new(endpoint: &str, token: Option<&str>, timeout: Duration) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            endpoint: endpoint.to_string(),
            token: token.map(|t| t.to_string()),
            timeout,
        }
    }

    async fn post(&self, payload: &SendPayload<'_>) -> Result<String, SendError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SendError::Transient(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            let message_id = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("message_id")
                        .and_then(|id| id.as_str())
                        .map(|id| id.to_string())
                })
                .unwrap_or(body);
            return Ok(message_id);
        }
        if status.is_server_error() {
            Err(SendError::Transient(format!(
                "provider returned {}: {}",
                status, body
            )))
        } else {
            Err(SendError::Permanent(format!(
                "provider returned {}: {}",
                status, body
            )))
        }
    }
}

#[async_trait]
impl OutboundSender for HttpOutboundSender {
    async fn send_text(&self, to: &str, body: &str) -> Result<String, SendError> {
        self.post(&SendPayload {
            to,
            body: Some(body),
            media_url: None,
            media_kind: None,
        })
        .await
    }

    async fn send_media(&self, to: &str, url: &str, kind: MediaKind) -> Result<String, SendError> {
        self.post(&SendPayload {
            to,
            body: None,
            media_url: Some(url),
            media_kind: Some(kind),
        })
        .await
    }
}
