//! Shared HTTP layer for feed fetches, robots.txt lookups, and page unfurls.
//!
//! One [`Transport`] wraps one `reqwest::Client` and is shared (via `Arc`)
//! by every worker in both pools. Status-code interpretation is left to
//! callers; this layer only distinguishes "got a response" from transport
//! failure or timeout.

use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use std::time::Duration;
use thiserror::Error;

/// Default user-agent, sent on every request unless overridden.
pub const DEFAULT_USER_AGENT: &str =
    concat!("trawl/", env!("CARGO_PKG_VERSION"), " (+https://github.com/trawl-rs/trawl)");

/// Redirect hop cap. The user-agent is set on the client, so it is preserved
/// across hops.
const MAX_REDIRECTS: usize = 10;

/// Errors from the transport layer. Opaque to callers beyond the
/// network/timeout distinction.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS, connection, TLS, too many redirects, etc.)
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// Request exceeded its deadline
    #[error("request timed out")]
    Timeout,
    /// The client itself could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Network(err)
        }
    }
}

/// HTTP client with default headers, a redirect cap, and size-capped body
/// reading.
pub struct Transport {
    client: Client,
    timeout: Duration,
}

impl Transport {
    /// Builds a transport with the given user-agent (or [`DEFAULT_USER_AGENT`])
    /// and default per-request timeout.
    pub fn new(user_agent: Option<&str>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(TransportError::Build)?;

        Ok(Self { client, timeout })
    }

    /// The default per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issues a GET with the transport's default timeout.
    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<Response, TransportError> {
        self.get_with_timeout(url, headers, self.timeout).await
    }

    /// Issues a GET with an explicit deadline. The deadline covers the whole
    /// exchange through the end of the response body.
    pub async fn get_with_timeout(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let response = self
            .client
            .get(url)
            .headers(headers)
            .timeout(timeout)
            .send()
            .await?;
        Ok(response)
    }

    /// Reads a response body up to `limit` bytes, silently truncating past
    /// the cap. Mid-stream network errors still surface as errors.
    pub async fn read_capped(
        &self,
        response: Response,
        limit: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(TransportError::from)?;
            let remaining = limit.saturating_sub(bytes.len());
            if remaining == 0 {
                break;
            }
            if chunk.len() > remaining {
                bytes.extend_from_slice(&chunk[..remaining]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_default_user_agent_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", DEFAULT_USER_AGENT))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = Transport::new(None, Duration::from_secs(5)).unwrap();
        let response = transport
            .get(&mock_server.uri(), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_custom_user_agent_overrides_default() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "custom-bot/1.0"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = Transport::new(Some("custom-bot/1.0"), Duration::from_secs(5)).unwrap();
        transport
            .get(&mock_server.uri(), HeaderMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_capped_truncates_silently() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 1000]))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(None, Duration::from_secs(5)).unwrap();
        let response = transport
            .get(&mock_server.uri(), HeaderMap::new())
            .await
            .unwrap();
        let body = transport.read_capped(response, 100).await.unwrap();
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn test_read_capped_keeps_small_body_whole() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(None, Duration::from_secs(5)).unwrap();
        let response = transport
            .get(&mock_server.uri(), HeaderMap::new())
            .await
            .unwrap();
        let body = transport.read_capped(response, 1024).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_timeout_reported_as_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let transport = Transport::new(None, Duration::from_secs(5)).unwrap();
        let result = transport
            .get_with_timeout(&mock_server.uri(), HeaderMap::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
