//! Durable webhook delivery over SQL-backed work queues.
//!
//! `hookline` drains two persistent queues and POSTs their rows to
//! user-configured webhooks with at-least-once semantics:
//!
//! - **event triggers**: row-change events appended to `event_log` by
//!   database triggers, delivered as soon as possible in approximate
//!   insertion order;
//! - **scheduled triggers**: cron firings (materialized ahead of time) and
//!   ad-hoc events in `hdb_scheduled_events`, delivered when due.
//!
//! Rows are leased with `FOR UPDATE SKIP LOCKED`, so several engine
//! processes can share one database without double-delivering. Failed
//! attempts are retried per-trigger with `Retry-After` honored; exhausted
//! rows land in terminal states (`delivered`, `error`, `dead`, `cancelled`)
//! and every attempt is recorded in an invocation log.
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use hookline::{Engine, EngineConfig, PostgresStorage, ReqwestHttpClient};
//!
//! let storage = Arc::new(PostgresStorage::new(pool));
//! storage.migrate().await?;
//!
//! let engine = Arc::new(Engine::new(
//!     storage,
//!     Arc::new(ReqwestHttpClient::default()),
//!     registry_source, // Arc<dyn Fn() -> Arc<TriggerRegistry>>
//!     EngineConfig::from_env(),
//! ));
//! let handle = engine.run().await?;
//!
//! // ... later:
//! handle.shutdown().await;
//! ```

pub mod daemon;
pub mod delivery;
pub mod error;
pub mod event;
pub mod http;
pub mod registry;
pub mod schedule;
pub mod storage;

pub use daemon::{Engine, EngineConfig, EngineHandle};
pub use delivery::{DeliveryOutcome, Verdict};
pub use error::{HooklineError, Result};
pub use event::{
    Event, EventId, INVOCATION_VERSION, Invocation, NewScheduledEvent, ScheduledEvent,
};
pub use http::{HttpClient, MockHttpClient, ReqwestHttpClient, WebhookRequest, WebhookResponse};
pub use registry::{
    EventTriggerConfig, Header, RegistrySource, RetryConf, ScheduledTriggerConfig, TriggerRegistry,
    TriggerSchedule, fixed_registry,
};
pub use storage::{Storage, TriggerStats};

#[cfg(feature = "postgres")]
pub use storage::postgres::PostgresStorage;
