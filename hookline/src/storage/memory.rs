//! In-memory [`Storage`] used by the engine tests.
//!
//! Mirrors the Postgres semantics closely enough for lifecycle assertions:
//! leases flip `locked`, invocation records bump `tries`, terminal flags are
//! permanent, and cron materialization dedupes on `(name, scheduled_time)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Storage, TriggerStats};
use crate::error::{HooklineError, Result};
use crate::event::{Event, EventId, Invocation, NewScheduledEvent, ScheduledEvent};

/// A full `event_log` row, flags included.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: EventId,
    pub schema_name: String,
    pub table_name: String,
    pub trigger_name: String,
    pub payload: serde_json::Value,
    pub tries: i32,
    pub created_at: DateTime<Utc>,
    pub locked: bool,
    pub delivered: bool,
    pub error: bool,
    pub archived: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl EventRow {
    fn is_terminal(&self) -> bool {
        self.delivered || self.error
    }
}

/// A full `hdb_scheduled_events` row, flags included.
#[derive(Debug, Clone)]
pub struct ScheduledEventRow {
    pub id: EventId,
    pub name: String,
    pub scheduled_time: DateTime<Utc>,
    pub additional_payload: Option<serde_json::Value>,
    pub tries: i32,
    pub locked: bool,
    pub delivered: bool,
    pub error: bool,
    pub dead: bool,
    pub cancelled: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ScheduledEventRow {
    fn is_terminal(&self) -> bool {
        self.delivered || self.error || self.dead || self.cancelled
    }
}

#[derive(Default)]
struct Inner {
    events: Vec<EventRow>,
    scheduled: Vec<ScheduledEventRow>,
    event_invocations: Vec<Invocation>,
    scheduled_invocations: Vec<Invocation>,
    trigger_names: Vec<String>,
    next_seq: u64,
}

/// In-memory queue storage for tests.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_event(&self, trigger_name: &str, payload: serde_json::Value) -> EventId {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let id = EventId(format!("ev-{}", inner.next_seq));
        inner.events.push(EventRow {
            id: id.clone(),
            schema_name: "public".to_string(),
            table_name: "widgets".to_string(),
            trigger_name: trigger_name.to_string(),
            payload,
            tries: 0,
            created_at: Utc::now(),
            locked: false,
            delivered: false,
            error: false,
            archived: false,
            next_retry_at: None,
        });
        id
    }

    /// Seed an event that still holds a stale lease, as left behind by a
    /// crashed engine.
    pub fn seed_locked_event(&self, trigger_name: &str) -> EventId {
        let id = self.seed_event(trigger_name, serde_json::json!({}));
        let mut inner = self.inner.lock();
        if let Some(row) = inner.events.iter_mut().find(|row| row.id == id) {
            row.locked = true;
        }
        id
    }

    pub fn seed_scheduled_event(
        &self,
        name: &str,
        scheduled_time: DateTime<Utc>,
        additional_payload: Option<serde_json::Value>,
    ) -> EventId {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let id = EventId(format!("se-{}", inner.next_seq));
        inner.scheduled.push(ScheduledEventRow {
            id: id.clone(),
            name: name.to_string(),
            scheduled_time,
            additional_payload,
            tries: 0,
            locked: false,
            delivered: false,
            error: false,
            dead: false,
            cancelled: false,
            next_retry_at: None,
        });
        id
    }

    /// Register a trigger name so it shows up in the stats view.
    pub fn define_trigger(&self, name: &str) {
        let mut inner = self.inner.lock();
        if !inner.trigger_names.iter().any(|n| n == name) {
            inner.trigger_names.push(name.to_string());
        }
    }

    pub fn event(&self, id: &EventId) -> Option<EventRow> {
        self.inner.lock().events.iter().find(|r| &r.id == id).cloned()
    }

    pub fn scheduled(&self, id: &EventId) -> Option<ScheduledEventRow> {
        self.inner
            .lock()
            .scheduled
            .iter()
            .find(|r| &r.id == id)
            .cloned()
    }

    pub fn scheduled_rows(&self, name: &str) -> Vec<ScheduledEventRow> {
        self.inner
            .lock()
            .scheduled
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    pub fn event_invocations(&self, id: &EventId) -> Vec<Invocation> {
        self.inner
            .lock()
            .event_invocations
            .iter()
            .filter(|i| &i.event_id == id)
            .cloned()
            .collect()
    }

    pub fn scheduled_invocations(&self, id: &EventId) -> Vec<Invocation> {
        self.inner
            .lock()
            .scheduled_invocations
            .iter()
            .filter(|i| &i.event_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn fetch_events(&self, limit: i64) -> Result<Vec<Event>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let mut due: Vec<&mut EventRow> = inner
            .events
            .iter_mut()
            .filter(|row| {
                !row.locked
                    && !row.is_terminal()
                    && !row.archived
                    && row.next_retry_at.is_none_or(|at| at <= now)
            })
            .collect();
        due.sort_by_key(|row| row.created_at);

        let mut leased = Vec::new();
        for row in due.into_iter().take(limit as usize) {
            row.locked = true;
            leased.push(Event {
                id: row.id.clone(),
                schema_name: row.schema_name.clone(),
                table_name: row.table_name.clone(),
                trigger_name: row.trigger_name.clone(),
                payload: row.payload.clone(),
                tries: row.tries,
                created_at: row.created_at,
                next_retry_at: row.next_retry_at,
            });
        }
        Ok(leased)
    }

    async fn record_event_success(&self, event: &Event, invocation: &Invocation) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.event_invocations.push(invocation.clone());
        let row = inner
            .events
            .iter_mut()
            .find(|r| r.id == event.id)
            .ok_or_else(|| HooklineError::EventNotFound(event.id.clone()))?;
        row.tries += 1;
        row.delivered = true;
        row.locked = false;
        row.next_retry_at = None;
        Ok(())
    }

    async fn record_event_error(&self, event: &Event, invocation: &Invocation) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.event_invocations.push(invocation.clone());
        let row = inner
            .events
            .iter_mut()
            .find(|r| r.id == event.id)
            .ok_or_else(|| HooklineError::EventNotFound(event.id.clone()))?;
        row.tries += 1;
        row.error = true;
        row.locked = false;
        row.next_retry_at = None;
        Ok(())
    }

    async fn record_event_retry(
        &self,
        event: &Event,
        invocation: &Invocation,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.event_invocations.push(invocation.clone());
        let row = inner
            .events
            .iter_mut()
            .find(|r| r.id == event.id)
            .ok_or_else(|| HooklineError::EventNotFound(event.id.clone()))?;
        row.tries += 1;
        row.next_retry_at = Some(retry_at);
        row.locked = false;
        Ok(())
    }

    async fn unlock_all_events(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut unlocked = 0;
        for row in inner.events.iter_mut().filter(|r| r.locked) {
            row.locked = false;
            unlocked += 1;
        }
        Ok(unlocked)
    }

    async fn fetch_scheduled_events(&self, limit: i64) -> Result<Vec<ScheduledEvent>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let mut leased = Vec::new();
        for row in inner.scheduled.iter_mut() {
            if leased.len() as i64 >= limit {
                break;
            }
            let due = match row.next_retry_at {
                Some(at) => at <= now,
                None => row.scheduled_time <= now,
            };
            if row.locked || row.is_terminal() || !due {
                continue;
            }
            row.locked = true;
            leased.push(ScheduledEvent {
                id: row.id.clone(),
                name: row.name.clone(),
                scheduled_time: row.scheduled_time,
                additional_payload: row.additional_payload.clone(),
                tries: row.tries,
                next_retry_at: row.next_retry_at,
            });
        }
        Ok(leased)
    }

    async fn record_scheduled_success(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.scheduled_invocations.push(invocation.clone());
        let row = inner
            .scheduled
            .iter_mut()
            .find(|r| r.id == event.id)
            .ok_or_else(|| HooklineError::EventNotFound(event.id.clone()))?;
        row.tries += 1;
        row.delivered = true;
        row.locked = false;
        row.next_retry_at = None;
        Ok(())
    }

    async fn record_scheduled_error(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.scheduled_invocations.push(invocation.clone());
        let row = inner
            .scheduled
            .iter_mut()
            .find(|r| r.id == event.id)
            .ok_or_else(|| HooklineError::EventNotFound(event.id.clone()))?;
        row.tries += 1;
        row.error = true;
        row.locked = false;
        // next_retry_at stays, matching the Postgres backend.
        Ok(())
    }

    async fn record_scheduled_retry(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.scheduled_invocations.push(invocation.clone());
        let row = inner
            .scheduled
            .iter_mut()
            .find(|r| r.id == event.id)
            .ok_or_else(|| HooklineError::EventNotFound(event.id.clone()))?;
        row.tries += 1;
        row.next_retry_at = Some(retry_at);
        row.locked = false;
        Ok(())
    }

    async fn mark_scheduled_dead(&self, id: &EventId) -> Result<()> {
        let mut inner = self.inner.lock();
        let row = inner
            .scheduled
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| HooklineError::EventNotFound(id.clone()))?;
        row.dead = true;
        row.locked = false;
        Ok(())
    }

    async fn cancel_scheduled_event(&self, id: &EventId) -> Result<()> {
        let mut inner = self.inner.lock();
        let row = inner
            .scheduled
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| HooklineError::EventNotFound(id.clone()))?;
        if row.locked || row.is_terminal() {
            return Err(HooklineError::NotCancellable(id.clone()));
        }
        row.cancelled = true;
        Ok(())
    }

    async fn insert_scheduled_events(&self, events: &[NewScheduledEvent]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut inserted = 0;
        for event in events {
            let duplicate = inner
                .scheduled
                .iter()
                .any(|r| r.name == event.name && r.scheduled_time == event.scheduled_time);
            if duplicate {
                continue;
            }
            inner.scheduled.push(ScheduledEventRow {
                id: event.id.clone(),
                name: event.name.clone(),
                scheduled_time: event.scheduled_time,
                additional_payload: event.additional_payload.clone(),
                tries: 0,
                locked: false,
                delivered: false,
                error: false,
                dead: false,
                cancelled: false,
                next_retry_at: None,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn unlock_all_scheduled_events(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut unlocked = 0;
        for row in inner.scheduled.iter_mut().filter(|r| r.locked) {
            row.locked = false;
            unlocked += 1;
        }
        Ok(unlocked)
    }

    async fn trigger_stats_below(&self, horizon: i64) -> Result<Vec<TriggerStats>> {
        let inner = self.inner.lock();
        let stats = inner
            .trigger_names
            .iter()
            .map(|name| {
                let rows: Vec<_> = inner.scheduled.iter().filter(|r| &r.name == name).collect();
                TriggerStats {
                    name: name.clone(),
                    upcoming_events_count: rows.iter().filter(|r| !r.is_terminal()).count() as i64,
                    max_scheduled_time: rows.iter().map(|r| r.scheduled_time).max(),
                }
            })
            .filter(|stats| stats.upcoming_events_count < horizon)
            .collect();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_skips_locked_and_terminal_rows() {
        let storage = MemoryStorage::new();
        let fresh = storage.seed_event("t", serde_json::json!({}));
        storage.seed_locked_event("t");

        let leased = storage.fetch_events(10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, fresh);
        assert!(storage.event(&fresh).unwrap().locked);

        // A second fetch sees nothing: the fresh row is now leased.
        assert!(storage.fetch_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tries_bumps_once_per_invocation() {
        let storage = MemoryStorage::new();
        let id = storage.seed_event("t", serde_json::json!({}));
        let leased = storage.fetch_events(10).await.unwrap().remove(0);

        let invocation = Invocation::new(
            id.clone(),
            500,
            serde_json::json!({}),
            serde_json::json!({}),
        );
        storage
            .record_event_retry(&leased, &invocation, Utc::now())
            .await
            .unwrap();

        let row = storage.event(&id).unwrap();
        assert_eq!(row.tries, 1);
        assert!(!row.locked);
        assert!(row.next_retry_at.is_some());
        assert_eq!(storage.event_invocations(&id).len(), 1);
    }

    #[tokio::test]
    async fn cancel_rejects_leased_and_terminal_rows() {
        let storage = MemoryStorage::new();
        let id = storage.seed_scheduled_event("t", Utc::now(), None);

        let leased = storage.fetch_scheduled_events(10).await.unwrap().remove(0);
        assert!(matches!(
            storage.cancel_scheduled_event(&id).await,
            Err(HooklineError::NotCancellable(_))
        ));

        leased.die(&storage).await.unwrap();
        assert!(matches!(
            storage.cancel_scheduled_event(&id).await,
            Err(HooklineError::NotCancellable(_))
        ));

        let cancellable = storage.seed_scheduled_event("t", Utc::now(), None);
        storage.cancel_scheduled_event(&cancellable).await.unwrap();
        assert!(storage.scheduled(&cancellable).unwrap().cancelled);
    }
}
