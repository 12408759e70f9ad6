// Schedule parsing and due-time calculation
// Cron expressions with optional seconds field

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Parse and validate a cron expression
///
/// Classic 5-field expressions (`min hour dom mon dow`) are accepted and run
/// at second zero; 6 and 7 field expressions are passed through unchanged.
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// First firing strictly after `after`
pub fn next_execution(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    parse_cron_expression(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| ScheduleError::NoNextExecution(expression.to_string()))
}

/// Whether the schedule fired in the window `(after, until]`
pub fn fired_between(schedule: &CronSchedule, after: DateTime<Utc>, until: DateTime<Utc>) -> bool {
    schedule
        .after(&after)
        .next()
        .is_some_and(|next| next <= until)
}
