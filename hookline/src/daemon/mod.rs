//! Engine supervisor: worker loops, cron materialization, lifecycle.
//!
//! One engine owns two worker loops sharing a permit pool:
//!
//! - the event loop drains `event_log` with a double-buffered
//!   fetch-then-dispatch cycle (the next lease is issued while the current
//!   batch is in flight);
//! - the scheduled loop materializes cron firings, then drains due
//!   `hdb_scheduled_events` rows sequentially, once per tick.
//!
//! Startup and clean shutdown both reset leaked leases, so a crashed peer's
//! rows are recovered by whichever instance comes up next.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::delivery::{self, DeliveryOutcome, STATUS_OTHER_ERROR, Verdict};
use crate::error::Result;
use crate::event::{Event, Invocation, NewScheduledEvent, ScheduledEvent};
use crate::http::{HttpClient, WebhookRequest};
use crate::registry::{EventTriggerConfig, RegistrySource, TriggerRegistry};
use crate::schedule::generate_schedule_times;
use crate::storage::Storage;

const EVENT_LOG: &str = "event_trigger_log";
const SCHEDULED_LOG: &str = "scheduled_trigger_log";

/// Number of consecutive full batches before the event loop reports
/// saturation.
const FULL_BATCH_WARN_THRESHOLD: u32 = 3;

/// Configuration for the engine.
#[derive(Clone)]
pub struct EngineConfig {
    /// Maximum number of rows to lease per fetch, for both queues.
    pub fetch_batch_size: i64,

    /// How long the event loop sleeps when a fetch comes back empty.
    pub fetch_interval_ms: u64,

    /// Pause between scheduled-trigger ticks.
    pub scheduled_tick_ms: u64,

    /// Global cap on in-flight webhook calls, shared by both loops.
    pub http_pool_size: usize,

    /// Upcoming-event horizon maintained per cron trigger.
    pub cron_horizon: usize,

    /// Interval for logging the in-flight gauge. None disables it.
    pub status_log_interval_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_batch_size: 100,
            fetch_interval_ms: 1000,
            scheduled_tick_ms: 60_000,
            http_pool_size: 100,
            cron_horizon: 100,
            status_log_interval_ms: Some(10_000),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `EVENTS_HTTP_POOL_SIZE` and
    /// `EVENTS_FETCH_INTERVAL_MS` where set. Unparseable values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("EVENTS_HTTP_POOL_SIZE") {
            match value.parse() {
                Ok(size) => config.http_pool_size = size,
                Err(_) => {
                    tracing::warn!(value = %value, "ignoring unparseable EVENTS_HTTP_POOL_SIZE");
                }
            }
        }
        if let Ok(value) = std::env::var("EVENTS_FETCH_INTERVAL_MS") {
            match value.parse() {
                Ok(interval) => config.fetch_interval_ms = interval,
                Err(_) => {
                    tracing::warn!(value = %value, "ignoring unparseable EVENTS_FETCH_INTERVAL_MS");
                }
            }
        }
        config
    }
}

/// The delivery engine.
///
/// Owns the storage handle, the HTTP client, the registry source, and the
/// permit pool. [`Engine::run`] resets leaked leases and spawns the worker
/// loops; the returned [`EngineHandle`] shuts them down cooperatively.
pub struct Engine<S, H>
where
    S: Storage,
    H: HttpClient,
{
    engine_id: Uuid,
    storage: Arc<S>,
    http_client: Arc<H>,
    registry: RegistrySource,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    event_pool_warned: AtomicBool,
    scheduled_pool_warned: AtomicBool,
    shutdown: CancellationToken,
}

impl<S, H> Engine<S, H>
where
    S: Storage + 'static,
    H: HttpClient + 'static,
{
    pub fn new(
        storage: Arc<S>,
        http_client: Arc<H>,
        registry: RegistrySource,
        config: EngineConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.http_pool_size));
        Self {
            engine_id: Uuid::new_v4(),
            storage,
            http_client,
            registry,
            config,
            permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            event_pool_warned: AtomicBool::new(false),
            scheduled_pool_warned: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Reset leaked leases from a prior ungraceful exit, then spawn the
    /// worker loops.
    #[tracing::instrument(skip(self), fields(engine_id = %self.engine_id))]
    pub async fn run(self: Arc<Self>) -> Result<EngineHandle> {
        let unlocked_events = self.storage.unlock_all_events().await?;
        let unlocked_scheduled = self.storage.unlock_all_scheduled_events().await?;
        if unlocked_events > 0 || unlocked_scheduled > 0 {
            tracing::info!(
                unlocked_events,
                unlocked_scheduled,
                "released leases left behind by a previous run"
            );
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().run_event_loop());
        tasks.spawn(self.clone().run_scheduled_loop());
        if let Some(interval_ms) = self.config.status_log_interval_ms {
            tasks.spawn(self.clone().run_status_loop(interval_ms));
        }

        Ok(EngineHandle {
            shutdown: self.shutdown.clone(),
            tasks,
        })
    }

    // Event trigger loop.

    #[tracing::instrument(skip(self), fields(engine_id = %self.engine_id))]
    async fn run_event_loop(self: Arc<Self>) -> Result<()> {
        tracing::info!(category = EVENT_LOG, "event trigger worker started");

        let mut consecutive_full: u32 = 0;
        let mut saturation_reported = false;
        let mut buffered: Vec<Event> = Vec::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if buffered.is_empty() {
                buffered = self.lease_events().await;
                if buffered.is_empty() {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(self.config.fetch_interval_ms)) => {}
                    }
                    continue;
                }
            }

            let registry = (self.registry)();
            let batch = std::mem::take(&mut buffered);
            let batch_len = batch.len() as i64;

            // Prefetch the next lease while the current batch is in flight;
            // at most two batches are ever held in memory.
            let (next, ()) = tokio::join!(
                self.lease_events_unless_stopping(),
                self.clone().dispatch_event_batch(batch, registry)
            );
            buffered = next;

            if batch_len == self.config.fetch_batch_size {
                consecutive_full += 1;
                if consecutive_full == FULL_BATCH_WARN_THRESHOLD && !saturation_reported {
                    saturation_reported = true;
                    tracing::info!(
                        category = EVENT_LOG,
                        batch_size = batch_len,
                        "events are arriving faster than they are dispatched; \
                         consider a larger HTTP pool"
                    );
                }
            } else {
                if saturation_reported {
                    tracing::info!(
                        category = EVENT_LOG,
                        "event backlog drained back below the batch size"
                    );
                }
                consecutive_full = 0;
                saturation_reported = false;
            }
        }

        // Clean exit: release whatever is still leased, including any
        // prefetched batch that was never dispatched.
        if let Err(e) = self.storage.unlock_all_events().await {
            tracing::error!(category = EVENT_LOG, error = %e, "failed to release leases on shutdown");
        }
        tracing::info!(category = EVENT_LOG, "event trigger worker stopped");
        Ok(())
    }

    async fn lease_events(&self) -> Vec<Event> {
        match self.storage.fetch_events(self.config.fetch_batch_size).await {
            Ok(events) => events,
            Err(e) => {
                // Transient; the next tick retries.
                tracing::error!(category = EVENT_LOG, error = %e, "failed to lease events");
                Vec::new()
            }
        }
    }

    async fn lease_events_unless_stopping(&self) -> Vec<Event> {
        if self.shutdown.is_cancelled() {
            return Vec::new();
        }
        self.lease_events().await
    }

    async fn dispatch_event_batch(self: Arc<Self>, batch: Vec<Event>, registry: Arc<TriggerRegistry>) {
        let mut join_set = JoinSet::new();
        for event in batch {
            let Some(trigger) = registry.event_trigger(&event.trigger_name) else {
                // The row keeps its lease until an unlock sweep runs, so a
                // re-registered trigger redelivers after a restart.
                tracing::error!(
                    category = EVENT_LOG,
                    event_id = %event.id,
                    trigger = %event.trigger_name,
                    "trigger is not registered; skipping event"
                );
                continue;
            };
            let trigger = trigger.clone();
            let engine = Arc::clone(&self);
            join_set.spawn(async move {
                engine.deliver_event(event, trigger).await;
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(category = EVENT_LOG, error = %join_error, "delivery task panicked");
            }
        }
    }

    async fn deliver_event(&self, event: Event, trigger: EventTriggerConfig) {
        let event_id = event.id.clone();
        let envelope = event.envelope(&trigger.retry);
        let request = delivery::build_request(&trigger.webhook_url, &trigger.headers, envelope);
        let outcome = self
            .post_with_permit(
                &request,
                trigger.retry.timeout_seconds,
                EVENT_LOG,
                &self.event_pool_warned,
            )
            .await;

        tracing::info!(
            category = "http_log",
            event_id = %event_id,
            url = %request.url,
            status = outcome.status(),
            "webhook delivery attempt"
        );

        let invocation = Invocation::new(
            event_id.clone(),
            outcome.status(),
            delivery::request_log_json(&request),
            outcome.to_log_json(),
        );
        let result = match delivery::verdict(&outcome, event.tries, &trigger.retry, Utc::now()) {
            Verdict::Delivered => event.succeed(invocation, self.storage.as_ref()).await,
            Verdict::Retry(at) => {
                tracing::debug!(
                    category = EVENT_LOG,
                    event_id = %event_id,
                    retry_at = %at,
                    "delivery failed; scheduling retry"
                );
                event.retry_at(invocation, at, self.storage.as_ref()).await
            }
            Verdict::Failed => {
                tracing::warn!(
                    category = EVENT_LOG,
                    event_id = %event_id,
                    tries = event.tries + 1,
                    "retries exhausted; marking event errored"
                );
                event.fail(invocation, self.storage.as_ref()).await
            }
        };
        if let Err(e) = result {
            // The row stays leased until a sweep recovers it.
            tracing::error!(
                category = EVENT_LOG,
                event_id = %event_id,
                error = %e,
                "failed to persist delivery outcome"
            );
        }
    }

    // Scheduled trigger loop.

    #[tracing::instrument(skip(self), fields(engine_id = %self.engine_id))]
    async fn run_scheduled_loop(self: Arc<Self>) -> Result<()> {
        tracing::info!(category = SCHEDULED_LOG, "scheduled trigger worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let registry = (self.registry)();

            if let Err(e) = self.materialize_cron_events(&registry).await {
                tracing::error!(category = SCHEDULED_LOG, error = %e, "cron materialization failed");
            }

            match self
                .storage
                .fetch_scheduled_events(self.config.fetch_batch_size)
                .await
            {
                Ok(batch) => {
                    for event in batch {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        self.deliver_scheduled_event(event, &registry).await;
                    }
                }
                Err(e) => {
                    tracing::error!(category = SCHEDULED_LOG, error = %e, "failed to lease scheduled events");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(self.config.scheduled_tick_ms)) => {}
            }
        }

        if let Err(e) = self.storage.unlock_all_scheduled_events().await {
            tracing::error!(category = SCHEDULED_LOG, error = %e, "failed to release leases on shutdown");
        }
        tracing::info!(category = SCHEDULED_LOG, "scheduled trigger worker stopped");
        Ok(())
    }

    async fn deliver_scheduled_event(&self, event: ScheduledEvent, registry: &TriggerRegistry) {
        let Some(trigger) = registry.scheduled_trigger(&event.name) else {
            tracing::error!(
                category = SCHEDULED_LOG,
                event_id = %event.id,
                trigger = %event.name,
                "trigger is not registered; skipping event"
            );
            return;
        };

        let event_id = event.id.clone();
        let now = Utc::now();
        if event.is_past_tolerance(trigger.tolerance_seconds, now) {
            tracing::info!(
                category = SCHEDULED_LOG,
                event_id = %event_id,
                scheduled_time = %event.scheduled_time,
                tolerance_seconds = trigger.tolerance_seconds,
                "scheduled event past tolerance; marking dead"
            );
            if let Err(e) = event.die(self.storage.as_ref()).await {
                tracing::error!(category = SCHEDULED_LOG, event_id = %event_id, error = %e, "failed to mark event dead");
            }
            return;
        }

        let envelope = event.envelope(trigger);
        let request = delivery::build_request(&trigger.webhook_url, &trigger.headers, envelope);
        let outcome = self
            .post_with_permit(
                &request,
                trigger.retry.timeout_seconds,
                SCHEDULED_LOG,
                &self.scheduled_pool_warned,
            )
            .await;

        tracing::info!(
            category = "http_log",
            event_id = %event_id,
            url = %request.url,
            status = outcome.status(),
            "webhook delivery attempt"
        );

        let invocation = Invocation::new(
            event_id.clone(),
            outcome.status(),
            delivery::request_log_json(&request),
            outcome.to_log_json(),
        );
        let result = match delivery::verdict(&outcome, event.tries, &trigger.retry, Utc::now()) {
            Verdict::Delivered => event.succeed(invocation, self.storage.as_ref()).await,
            Verdict::Retry(at) => event.retry_at(invocation, at, self.storage.as_ref()).await,
            Verdict::Failed => {
                tracing::warn!(
                    category = SCHEDULED_LOG,
                    event_id = %event_id,
                    tries = event.tries + 1,
                    "retries exhausted; marking event errored"
                );
                event.fail(invocation, self.storage.as_ref()).await
            }
        };
        if let Err(e) = result {
            tracing::error!(
                category = SCHEDULED_LOG,
                event_id = %event_id,
                error = %e,
                "failed to persist delivery outcome"
            );
        }
    }

    /// Top the cron queue back up to the configured horizon.
    ///
    /// For each cron trigger whose upcoming-event count has dropped below the
    /// horizon, the next `horizon` firing times strictly after its latest
    /// scheduled row (or now, when it has none) are inserted. The unique
    /// `(name, scheduled_time)` constraint makes re-runs idempotent.
    async fn materialize_cron_events(&self, registry: &TriggerRegistry) -> Result<()> {
        let stats = self
            .storage
            .trigger_stats_below(self.config.cron_horizon as i64)
            .await?;

        for stat in stats {
            let Some(trigger) = registry.scheduled_trigger(&stat.name) else {
                continue;
            };
            // Ad-hoc triggers are inserted through the API, never generated.
            let Some(schedule) = trigger.schedule.cron_schedule() else {
                continue;
            };

            let from = stat.max_scheduled_time.unwrap_or_else(Utc::now);
            let times = generate_schedule_times(schedule, self.config.cron_horizon, from);
            let rows: Vec<NewScheduledEvent> = times
                .into_iter()
                .map(|time| NewScheduledEvent::cron(&stat.name, time))
                .collect();

            match self.storage.insert_scheduled_events(&rows).await {
                Ok(inserted) => {
                    tracing::info!(
                        category = SCHEDULED_LOG,
                        trigger = %stat.name,
                        upcoming = stat.upcoming_events_count,
                        inserted,
                        "materialized cron events"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        category = SCHEDULED_LOG,
                        trigger = %stat.name,
                        error = %e,
                        "failed to insert materialized events"
                    );
                }
            }
        }
        Ok(())
    }

    // Shared plumbing.

    /// Acquire a delivery permit, issue the request, classify the result.
    ///
    /// The permit is released when this function returns; the in-flight
    /// gauge is decremented on every exit path.
    async fn post_with_permit(
        &self,
        request: &WebhookRequest,
        timeout_seconds: u64,
        category: &'static str,
        pool_warned: &AtomicBool,
    ) -> DeliveryOutcome {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                if !pool_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        category,
                        pool_size = self.config.http_pool_size,
                        "HTTP pool exhausted; waiting for a delivery permit"
                    );
                }
                match self.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return DeliveryOutcome::ClientError {
                            status: STATUS_OTHER_ERROR,
                            message: "delivery permit pool closed".to_string(),
                        };
                    }
                }
            }
        };
        let _permit = permit;

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.clone();
        let _in_flight_guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        let result = self
            .http_client
            .post(request, Duration::from_secs(timeout_seconds))
            .await;
        DeliveryOutcome::classify(result)
    }

    async fn run_status_loop(self: Arc<Self>, interval_ms: u64) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    tracing::debug!(
                        engine_id = %self.engine_id,
                        in_flight = self.in_flight.load(Ordering::Relaxed),
                        available_permits = self.permits.available_permits(),
                        "delivery status"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Handle to a running engine.
pub struct EngineHandle {
    shutdown: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

impl EngineHandle {
    /// Signal cooperative shutdown and wait for the workers to drain.
    ///
    /// No new batches are leased; in-flight deliveries complete (bounded by
    /// their per-attempt timeout); both queues get a final unlock sweep.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "worker exited with error"),
                Err(join_error) => tracing::error!(error = %join_error, "worker panicked"),
            }
        }
    }
}
