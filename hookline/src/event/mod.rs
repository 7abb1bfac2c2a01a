//! Queue row types and the wire envelopes built from them.
//!
//! Both queues hand out rows that are already leased (`locked = true` in
//! storage); the consuming transition methods in [`transitions`] record a
//! single outcome per lease.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::registry::{RetryConf, ScheduledTriggerConfig};

pub mod transitions;

/// Version literal stamped into every serialized invocation request and
/// response.
pub const INVOCATION_VERSION: &str = "2";

/// Opaque row identifier, shared by both queues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl From<String> for EventId {
    fn from(id: String) -> Self {
        EventId(id)
    }
}

impl std::ops::Deref for EventId {
    type Target = String;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A leased row from the `event_log` queue.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub schema_name: String,
    pub table_name: String,
    pub trigger_name: String,
    /// The row-change delta captured by the database trigger.
    pub payload: Value,
    /// Delivery attempts recorded so far.
    pub tries: i32,
    pub created_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Event {
    /// The request envelope POSTed to the webhook.
    pub fn envelope(&self, retry: &RetryConf) -> Value {
        json!({
            "id": self.id.0,
            "table": {
                "schema": self.schema_name,
                "name": self.table_name,
            },
            "trigger": {
                "name": self.trigger_name,
            },
            "event": self.payload,
            "delivery_info": {
                "current_retry": self.tries,
                "max_retries": retry.num_retries,
            },
            "created_at": self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        })
    }
}

/// A leased row from the `hdb_scheduled_events` queue.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub id: EventId,
    /// Name of the scheduled trigger this row belongs to.
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    /// Per-event payload override; the trigger's default applies when absent.
    pub additional_payload: Option<Value>,
    pub tries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ScheduledEvent {
    /// The request envelope POSTed to the webhook.
    pub fn envelope(&self, trigger: &ScheduledTriggerConfig) -> Value {
        let payload = self
            .additional_payload
            .clone()
            .or_else(|| trigger.payload.clone())
            .unwrap_or(Value::Null);
        json!({
            "id": self.id.0,
            "name": self.name,
            "scheduled_time": self.scheduled_time.to_rfc3339_opts(SecondsFormat::Micros, true),
            "tries": self.tries,
            "webhook": trigger.webhook_url,
            "payload": payload,
            "retry_conf": trigger.retry,
        })
    }

    /// Whether the event is too late to deliver and must be declared dead.
    pub fn is_past_tolerance(&self, tolerance_seconds: u64, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.scheduled_time)
            > chrono::Duration::seconds(tolerance_seconds as i64)
    }
}

/// A scheduled-event row about to be inserted, by the materializer or the
/// ad-hoc API.
#[derive(Debug, Clone)]
pub struct NewScheduledEvent {
    pub id: EventId,
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub additional_payload: Option<Value>,
}

impl NewScheduledEvent {
    /// A materialized cron firing; the payload comes from the trigger.
    pub fn cron(name: &str, scheduled_time: DateTime<Utc>) -> Self {
        Self {
            id: EventId(Uuid::new_v4().to_string()),
            name: name.to_string(),
            scheduled_time,
            additional_payload: None,
        }
    }

    /// An API-inserted one-off event, optionally with a payload override.
    pub fn ad_hoc(name: &str, scheduled_time: DateTime<Utc>, payload: Option<Value>) -> Self {
        Self {
            id: EventId(Uuid::new_v4().to_string()),
            name: name.to_string(),
            scheduled_time,
            additional_payload: payload,
        }
    }
}

/// One recorded delivery attempt: the serialized request and classified
/// response for a row, written atomically with the row's transition.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub event_id: EventId,
    /// Real HTTP status, or a synthesized `>= 1000` client-error status.
    pub status: i32,
    pub request: Value,
    pub response: Value,
}

impl Invocation {
    pub fn new(event_id: EventId, status: i32, request: Value, response: Value) -> Self {
        Self {
            event_id,
            status,
            request,
            response,
        }
    }
}
