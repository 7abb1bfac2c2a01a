//! Terminal transitions for leased queue rows.
//!
//! Every row handed out by a fetch holds its lease until exactly one of these
//! consuming methods runs. Each records the invocation (which also bumps
//! `tries`) and updates the row inside a single storage transaction, so a
//! crash between attempt and record leaves the row leased for the next
//! unlock sweep rather than half-transitioned.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::storage::Storage;

use super::{Event, Invocation, ScheduledEvent};

impl Event {
    /// The webhook accepted the delivery: `delivered` is set, the retry
    /// timestamp cleared, and the lease released.
    pub async fn succeed<S: Storage + ?Sized>(
        self,
        invocation: Invocation,
        storage: &S,
    ) -> Result<()> {
        storage.record_event_success(&self, &invocation).await
    }

    /// Retries are exhausted: `error` is set and the lease released.
    pub async fn fail<S: Storage + ?Sized>(
        self,
        invocation: Invocation,
        storage: &S,
    ) -> Result<()> {
        storage.record_event_error(&self, &invocation).await
    }

    /// Schedule another attempt at `retry_at`; releasing the lease makes the
    /// row eligible again once the timestamp passes.
    pub async fn retry_at<S: Storage + ?Sized>(
        self,
        invocation: Invocation,
        retry_at: DateTime<Utc>,
        storage: &S,
    ) -> Result<()> {
        storage
            .record_event_retry(&self, &invocation, retry_at)
            .await
    }
}

impl ScheduledEvent {
    pub async fn succeed<S: Storage + ?Sized>(
        self,
        invocation: Invocation,
        storage: &S,
    ) -> Result<()> {
        storage.record_scheduled_success(&self, &invocation).await
    }

    pub async fn fail<S: Storage + ?Sized>(
        self,
        invocation: Invocation,
        storage: &S,
    ) -> Result<()> {
        storage.record_scheduled_error(&self, &invocation).await
    }

    pub async fn retry_at<S: Storage + ?Sized>(
        self,
        invocation: Invocation,
        retry_at: DateTime<Utc>,
        storage: &S,
    ) -> Result<()> {
        storage
            .record_scheduled_retry(&self, &invocation, retry_at)
            .await
    }

    /// The event is too late to deliver. No HTTP attempt was made, so no
    /// invocation row is written and `tries` stays untouched.
    pub async fn die<S: Storage + ?Sized>(self, storage: &S) -> Result<()> {
        storage.mark_scheduled_dead(&self.id).await
    }
}
