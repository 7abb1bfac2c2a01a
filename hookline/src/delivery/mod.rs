//! Request composition, outcome classification, and the retry verdict.
//!
//! Everything here is pure: the daemon module wires these helpers to the
//! HTTP client and storage.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};

use crate::event::INVOCATION_VERSION;
use crate::http::{HttpError, WebhookRequest, WebhookResponse};
use crate::registry::{Header, RetryConf};

/// Synthesized status for transport-level failures (DNS, connect, timeout).
pub const STATUS_TRANSPORT_ERROR: i32 = 1000;
/// Synthesized status for responses whose body could not be read.
pub const STATUS_BODY_ERROR: i32 = 1001;
/// Synthesized status for other framework errors.
pub const STATUS_OTHER_ERROR: i32 = 500;

const USER_AGENT: &str = concat!("hookline/", env!("CARGO_PKG_VERSION"));

/// Render the request for a trigger: default headers merged with the
/// configured ones, configured winning on name collision.
pub fn build_request(url: &str, configured: &[Header], body: Value) -> WebhookRequest {
    let mut headers: Vec<(String, String)> = vec![
        ("User-Agent".to_string(), USER_AGENT.to_string()),
        ("Content-Type".to_string(), "application/json".to_string()),
    ];
    for header in configured {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case(&header.name));
        headers.push((header.name.clone(), header.value.clone()));
    }
    WebhookRequest {
        url: url.to_string(),
        headers,
        body,
    }
}

/// The classified result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// The webhook answered; carries the real HTTP status.
    Response(WebhookResponse),
    /// No usable response; `status` is one of the synthesized `>= 1000`
    /// codes, or 500 for other framework errors.
    ClientError { status: i32, message: String },
}

impl DeliveryOutcome {
    pub fn classify(result: Result<WebhookResponse, HttpError>) -> Self {
        match result {
            Ok(response) => Self::Response(response),
            Err(HttpError::Transport(message)) => Self::ClientError {
                status: STATUS_TRANSPORT_ERROR,
                message,
            },
            Err(HttpError::Body(message)) => Self::ClientError {
                status: STATUS_BODY_ERROR,
                message,
            },
            Err(HttpError::Other(message)) => Self::ClientError {
                status: STATUS_OTHER_ERROR,
                message,
            },
        }
    }

    /// The status stored on the invocation row.
    pub fn status(&self) -> i32 {
        match self {
            Self::Response(response) => response.status as i32,
            Self::ClientError { status, .. } => *status,
        }
    }

    /// Delivered iff the webhook answered below 400.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Response(response) if (100..400).contains(&response.status))
    }

    /// `Retry-After` response header in seconds. Only positive integers
    /// count; anything else is ignored.
    pub fn retry_after_seconds(&self) -> Option<i64> {
        let Self::Response(response) = self else {
            return None;
        };
        response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
            .and_then(|(_, value)| value.trim().parse::<i64>().ok())
            .filter(|seconds| *seconds > 0)
    }

    /// The response half of the invocation log row.
    pub fn to_log_json(&self) -> Value {
        match self {
            Self::Response(response) => json!({
                "type": "webhook_response",
                "version": INVOCATION_VERSION,
                "data": {
                    "body": response.body,
                    "headers": header_log_json(&response.headers),
                    "status": response.status,
                },
            }),
            Self::ClientError { message, .. } => json!({
                "type": "client_error",
                "version": INVOCATION_VERSION,
                "data": {
                    "message": message,
                },
            }),
        }
    }
}

/// The request half of the invocation log row.
pub fn request_log_json(request: &WebhookRequest) -> Value {
    json!({
        "payload": request.body,
        "headers": header_log_json(&request.headers),
        "version": INVOCATION_VERSION,
    })
}

fn header_log_json(headers: &[(String, String)]) -> Vec<Value> {
    headers
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect()
}

/// What to do with a row after a delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Delivered,
    Retry(DateTime<Utc>),
    Failed,
}

/// Decide a row's fate after an attempt. `tries` is the row's attempt count
/// before this attempt.
///
/// A `Retry-After` header always schedules another attempt, even with the
/// retry budget spent, and its value takes precedence over the configured
/// interval.
pub fn verdict(
    outcome: &DeliveryOutcome,
    tries: i32,
    retry: &RetryConf,
    now: DateTime<Utc>,
) -> Verdict {
    if outcome.is_success() {
        return Verdict::Delivered;
    }
    let retry_after = outcome.retry_after_seconds();
    if tries < retry.num_retries || retry_after.is_some() {
        let delay = retry_after.unwrap_or(retry.interval_seconds as i64);
        Verdict::Retry(now + Duration::seconds(delay))
    } else {
        Verdict::Failed
    }
}
