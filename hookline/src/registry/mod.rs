//! Read-only trigger configuration snapshots.
//!
//! The engine never manages trigger metadata itself. It is handed a
//! [`RegistrySource`] callback producing an immutable [`TriggerRegistry`]
//! snapshot, which it re-queries once per processing cycle so configuration
//! changes become visible without a restart.

use std::collections::HashMap;
use std::sync::Arc;

use cron::Schedule;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::schedule::parse_cron;

/// Retry policy attached to a trigger.
#[derive(Debug, Clone, Serialize)]
pub struct RetryConf {
    pub num_retries: i32,
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for RetryConf {
    fn default() -> Self {
        Self {
            num_retries: 0,
            interval_seconds: 10,
            timeout_seconds: 60,
        }
    }
}

/// A resolved header to send with every delivery for a trigger.
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// When a scheduled trigger fires.
#[derive(Debug, Clone)]
pub enum TriggerSchedule {
    /// Fires at cron-specified times; events are materialized ahead of time.
    Cron(Schedule),
    /// Events are inserted on demand through the API.
    AdHoc,
}

impl TriggerSchedule {
    /// Build a cron schedule from a five- or six-field expression.
    pub fn cron(expression: &str) -> Result<Self> {
        Ok(Self::Cron(parse_cron(expression)?))
    }

    pub fn cron_schedule(&self) -> Option<&Schedule> {
        match self {
            Self::Cron(schedule) => Some(schedule),
            Self::AdHoc => None,
        }
    }
}

/// Configuration of one event trigger.
#[derive(Debug, Clone)]
pub struct EventTriggerConfig {
    pub name: String,
    /// Resolved webhook URL (environment interpolation already applied).
    pub webhook_url: String,
    pub headers: Vec<Header>,
    pub retry: RetryConf,
}

/// Configuration of one scheduled trigger.
#[derive(Debug, Clone)]
pub struct ScheduledTriggerConfig {
    pub name: String,
    pub webhook_url: String,
    pub headers: Vec<Header>,
    pub retry: RetryConf,
    pub schedule: TriggerSchedule,
    /// Default payload when an event row carries no override.
    pub payload: Option<Value>,
    /// Maximum lateness before an event is declared dead instead of delivered.
    pub tolerance_seconds: u64,
}

/// Default tolerance for scheduled triggers: six hours.
pub const DEFAULT_TOLERANCE_SECONDS: u64 = 21_600;

/// Immutable mapping from trigger name to configuration.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    event_triggers: HashMap<String, EventTriggerConfig>,
    scheduled_triggers: HashMap<String, ScheduledTriggerConfig>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event_trigger(&mut self, config: EventTriggerConfig) {
        self.event_triggers.insert(config.name.clone(), config);
    }

    pub fn add_scheduled_trigger(&mut self, config: ScheduledTriggerConfig) {
        self.scheduled_triggers.insert(config.name.clone(), config);
    }

    pub fn event_trigger(&self, name: &str) -> Option<&EventTriggerConfig> {
        self.event_triggers.get(name)
    }

    pub fn scheduled_trigger(&self, name: &str) -> Option<&ScheduledTriggerConfig> {
        self.scheduled_triggers.get(name)
    }

    /// Scheduled triggers with a cron schedule, the materializer's input.
    pub fn cron_triggers(&self) -> impl Iterator<Item = &ScheduledTriggerConfig> {
        self.scheduled_triggers
            .values()
            .filter(|trigger| matches!(trigger.schedule, TriggerSchedule::Cron(_)))
    }
}

/// Callback producing the current registry snapshot.
///
/// Re-queried at the start of each processing cycle, like the metadata cache
/// it fronts; the engine itself never mutates trigger configuration.
pub type RegistrySource = Arc<dyn Fn() -> Arc<TriggerRegistry> + Send + Sync>;

/// Wrap a fixed registry in a [`RegistrySource`], for embedders whose
/// configuration does not change at runtime (and for tests).
pub fn fixed_registry(registry: TriggerRegistry) -> RegistrySource {
    let registry = Arc::new(registry);
    Arc::new(move || registry.clone())
}
