//! Persistent state operations over the two work queues.
//!
//! The [`Storage`] trait is the engine's only view of the database. Fetches
//! lease rows atomically; every `record_*` method writes the invocation log
//! row and the queue-row transition in one transaction, so the attempt
//! counter and the row state can never drift apart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::event::{Event, EventId, Invocation, NewScheduledEvent, ScheduledEvent};

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
pub mod memory;

/// Per-trigger horizon numbers from the scheduled-events stats view.
#[derive(Debug, Clone)]
pub struct TriggerStats {
    pub name: String,
    /// Non-terminal rows currently queued for the trigger.
    pub upcoming_events_count: i64,
    /// Latest `scheduled_time` across the trigger's rows, if any exist.
    pub max_scheduled_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Storage: Send + Sync {
    // Event trigger queue.

    /// Atomically lease up to `limit` due rows: not locked, not terminal,
    /// `next_retry_at` absent or elapsed, ordered by `created_at`. Leased
    /// rows are flipped to `locked` so concurrent engines skip them.
    async fn fetch_events(&self, limit: i64) -> Result<Vec<Event>>;

    /// Record the invocation (bumping `tries`) and mark the row delivered,
    /// clearing `next_retry_at` and releasing the lease. One transaction.
    async fn record_event_success(&self, event: &Event, invocation: &Invocation) -> Result<()>;

    /// Record the invocation and mark the row errored (terminal), clearing
    /// `next_retry_at` and releasing the lease. One transaction.
    async fn record_event_error(&self, event: &Event, invocation: &Invocation) -> Result<()>;

    /// Record the invocation and set `next_retry_at`, releasing the lease.
    /// One transaction.
    async fn record_event_retry(
        &self,
        event: &Event,
        invocation: &Invocation,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Release every lease in the queue. Run at startup and on clean
    /// shutdown; idempotent.
    async fn unlock_all_events(&self) -> Result<u64>;

    // Scheduled trigger queue.

    /// Atomically lease up to `limit` due rows: not locked, not terminal,
    /// and either `next_retry_at` has elapsed or it is unset and
    /// `scheduled_time` has arrived. No ordering guarantee.
    async fn fetch_scheduled_events(&self, limit: i64) -> Result<Vec<ScheduledEvent>>;

    async fn record_scheduled_success(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
    ) -> Result<()>;

    /// Like [`Storage::record_event_error`], except `next_retry_at` is left
    /// as-is on this queue.
    async fn record_scheduled_error(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
    ) -> Result<()>;

    async fn record_scheduled_retry(
        &self,
        event: &ScheduledEvent,
        invocation: &Invocation,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Mark a row dead (too late to deliver). No invocation row is written
    /// and `tries` is not bumped.
    async fn mark_scheduled_dead(&self, id: &EventId) -> Result<()>;

    /// Cancel a pending row on behalf of the external API. Fails with
    /// [`crate::HooklineError::NotCancellable`] when the row is terminal or
    /// currently leased, and with
    /// [`crate::HooklineError::EventNotFound`] when it does not exist.
    async fn cancel_scheduled_event(&self, id: &EventId) -> Result<()>;

    /// Insert rows with on-conflict-do-nothing semantics on
    /// `(name, scheduled_time)`, returning how many were actually inserted.
    /// Used by the materializer and the ad-hoc API.
    async fn insert_scheduled_events(&self, events: &[NewScheduledEvent]) -> Result<u64>;

    async fn unlock_all_scheduled_events(&self) -> Result<u64>;

    // Materializer input.

    /// Stats rows for triggers whose upcoming-event count has dropped below
    /// `horizon`.
    async fn trigger_stats_below(&self, horizon: i64) -> Result<Vec<TriggerStats>>;
}
