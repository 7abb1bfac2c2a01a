//! HTTP client abstraction for webhook delivery.
//!
//! The engine talks to webhooks through the [`HttpClient`] trait so that tests
//! can substitute a scripted client. [`ReqwestHttpClient`] is the production
//! implementation; [`MockHttpClient`] replays canned responses and tracks
//! call/in-flight counts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::oneshot;

/// A fully rendered webhook request: resolved URL, merged headers, JSON body.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// A webhook response with its status, body, and headers.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// Failure modes of a delivery attempt that never produced an HTTP response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    /// DNS, connect, TLS, or timeout failure before a response arrived.
    #[error("request failed: {0}")]
    Transport(String),

    /// A response arrived but its body could not be read.
    #[error("could not read response body: {0}")]
    Body(String),

    /// Anything else (invalid header values, request construction).
    #[error("{0}")]
    Other(String),
}

/// Trait for issuing webhook POSTs.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Issue the request with the given per-attempt timeout.
    async fn post(
        &self,
        request: &WebhookRequest,
        timeout: Duration,
    ) -> Result<WebhookResponse, HttpError>;
}

/// Production HTTP client backed by a shared reqwest connection pool.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post(
        &self,
        request: &WebhookRequest,
        timeout: Duration,
    ) -> Result<WebhookResponse, HttpError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HttpError::Other(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::Other(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        // The body is serialized by hand so the merged headers stay
        // authoritative for Content-Type.
        let body = serde_json::to_vec(&request.body)
            .map_err(|e| HttpError::Other(format!("could not serialize payload: {e}")))?;

        let response = self
            .client
            .post(&request.url)
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    HttpError::Other(e.to_string())
                } else {
                    HttpError::Transport(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| HttpError::Body(e.to_string()))?;

        Ok(WebhookResponse {
            status,
            body,
            headers: response_headers,
        })
    }
}

type CannedResponse = (
    Result<WebhookResponse, HttpError>,
    Option<oneshot::Receiver<()>>,
);

/// Scripted HTTP client for tests.
///
/// Responses are returned in FIFO order; when the queue is empty, a plain
/// `200` with an empty body is returned. `add_response_with_trigger` gates a
/// response on a oneshot send, which lets tests hold a request in flight and
/// observe concurrency limits.
#[derive(Default)]
pub struct MockHttpClient {
    responses: Mutex<VecDeque<CannedResponse>>,
    calls: Mutex<Vec<WebhookRequest>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, response: Result<WebhookResponse, HttpError>) {
        self.responses.lock().push_back((response, None));
    }

    /// Queue a response that is only returned once the returned sender fires.
    pub fn add_response_with_trigger(
        &self,
        response: Result<WebhookResponse, HttpError>,
    ) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses.lock().push_back((response, Some(rx)));
        tx
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> Vec<WebhookRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn post(
        &self,
        request: &WebhookRequest,
        _timeout: Duration,
    ) -> Result<WebhookResponse, HttpError> {
        self.calls.lock().push(request.clone());
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let (response, gate) = self.responses.lock().pop_front().unwrap_or((
            Ok(WebhookResponse {
                status: 200,
                body: String::new(),
                headers: Vec::new(),
            }),
            None,
        ));

        if let Some(gate) = gate {
            let _ = gate.await;
        }

        response
    }
}

/// Convenience constructor used throughout the tests.
#[cfg(test)]
pub(crate) fn response(status: u16) -> WebhookResponse {
    WebhookResponse {
        status,
        body: String::new(),
        headers: Vec::new(),
    }
}
