//! HTTP client for the outbound messaging vendor.
//!
//! Sends a single POST per message with a JSON body of `{email, message}`.
//! Response status is classified into transient/permanent so callers know
//! whether a retry is worthwhile.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone)]
pub struct VendorOptions {
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct VendorClient {
    http: Client,
    options: VendorOptions,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    email: &'a str,
    message: &'a str,
}

/// Outcome of a single send attempt, already classified for retry purposes.
#[derive(Debug, Error)]
pub enum VendorError {
    #[error("vendor request timed out or connection failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("vendor returned transient error {status}: {body}")]
    Transient { status: StatusCode, body: String },

    #[error("vendor returned permanent error {status}: {body}")]
    Permanent { status: StatusCode, body: String },
}

impl VendorError {
    /// Whether the caller should retry this attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, VendorError::Transport(_) | VendorError::Transient { .. })
    }
}

impl VendorClient {
    pub fn new(options: VendorOptions) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client with static config always builds");
        Self { http, options }
    }

    /// Send a message to a single recipient, tagged with an idempotency key
    /// the vendor may use for deduplication. Does not retry; callers own
    /// backoff policy.
    pub async fn send_message(
        &self,
        email: &str,
        message: &str,
        idempotency_key: &str,
    ) -> Result<(), VendorError> {
        let url = format!("{}/messages", self.options.base_url);

        let response = self
            .http
            .post(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&SendMessageRequest { email, message })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            tracing::warn!(%status, "vendor returned transient error");
            Err(VendorError::Transient { status, body })
        } else {
            tracing::warn!(%status, "vendor returned permanent error");
            Err(VendorError::Permanent { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> VendorClient {
        VendorClient::new(VendorOptions {
            base_url: server.uri(),
        })
    }

    #[tokio::test]
    async fn sends_idempotency_header_and_succeeds_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header(IDEMPOTENCY_HEADER, "user-1:BIRTHDAY:2026-07-27"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let result = client
            .send_message("a@example.com", "hi", "user-1:BIRTHDAY:2026-07-27")
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn classifies_429_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .send_message("a@example.com", "hi", "k")
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn classifies_400_as_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .send_message("a@example.com", "hi", "k")
            .await
            .unwrap_err();

        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn classifies_500_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .send_message("a@example.com", "hi", "k")
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }
}
