//! Cron schedule parsing and firing-time generation.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{HooklineError, Result};

/// Parse a standard five- or six-field cron expression, interpreted in UTC.
///
/// The underlying parser wants a seconds column first, so five-field
/// expressions get one prepended; six-field expressions are taken to already
/// carry it.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| HooklineError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// The next `count` firing times of `schedule`, strictly after `from`.
///
/// Starting with the first match after `from`, each subsequent value is the
/// first match after its predecessor, so the result is strictly increasing.
pub fn generate_schedule_times(
    schedule: &Schedule,
    count: usize,
    from: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    schedule.after(&from).take(count).collect()
}
