use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde_json::Value;

use runway_types::{Result, Schedule, ScheduleType, ServerError};

/// Next due time for a schedule, strictly after `after`, in UTC. `None`
/// means the schedule has no further runs (once-schedules).
pub fn compute_next_run(
    schedule: &Schedule,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule.schedule_type {
        ScheduleType::Cron => {
            let expression = schedule
                .cron_expression
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .ok_or_else(|| {
                    ServerError::Validation(format!(
                        "cron schedule '{}' has no cron_expression",
                        schedule.name
                    ))
                })?;
            Ok(Some(next_cron(expression, &schedule.timezone, after)?))
        }
        ScheduleType::Interval => {
            let seconds = schedule.interval_seconds.filter(|s| *s > 0).ok_or_else(|| {
                ServerError::Validation(format!(
                    "interval schedule '{}' has no interval_seconds",
                    schedule.name
                ))
            })?;
            Ok(Some(after + Duration::seconds(seconds)))
        }
        ScheduleType::Weekday => {
            let config = schedule
                .weekday_config_json
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| {
                    ServerError::Validation(format!(
                        "weekday schedule '{}' has no weekday_config_json",
                        schedule.name
                    ))
                })?;
            Ok(Some(next_weekday(config, &schedule.timezone, after)?))
        }
        ScheduleType::Once => Ok(None),
    }
}

fn parse_tz(timezone: &str) -> Result<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| ServerError::Validation(format!("unknown timezone: {timezone}")))
}

/// Cron expressions are evaluated in the schedule's timezone and the result
/// converted back to UTC.
fn next_cron(expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tz = parse_tz(timezone)?;
    let cron = Cron::new(expression)
        .parse()
        .map_err(|e| ServerError::Validation(format!("bad cron expression '{expression}': {e}")))?;
    let local_after = after.with_timezone(&tz);
    let next_local = cron
        .find_next_occurrence(&local_after, false)
        .map_err(|e| {
            ServerError::Validation(format!("cron expression '{expression}' has no next time: {e}"))
        })?;
    Ok(next_local.with_timezone(&Utc))
}

/// `{days: [0..6, Monday=0], time: "HH:MM"}` in the schedule's timezone.
fn next_weekday(config_json: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let config: Value = serde_json::from_str(config_json)
        .map_err(|e| ServerError::Validation(format!("bad weekday config: {e}")))?;
    let days: Vec<u32> = config
        .get("days")
        .and_then(|d| d.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_u64().map(|n| n as u32)).collect())
        .unwrap_or_default();
    if days.is_empty() {
        return Err(ServerError::Validation(
            "weekday schedule has no days configured".to_string(),
        ));
    }
    let time_str = config
        .get("time")
        .and_then(|t| t.as_str())
        .unwrap_or("09:00");
    let time = NaiveTime::parse_from_str(time_str, "%H:%M")
        .map_err(|e| ServerError::Validation(format!("bad weekday time '{time_str}': {e}")))?;

    let tz = parse_tz(timezone)?;
    let local_after = after.with_timezone(&tz);

    let mut candidate_date = local_after.date_naive();
    // If today's slot already passed, start from tomorrow.
    if local_after.time() >= time.with_second(0).unwrap_or(time) {
        candidate_date += Duration::days(1);
    }
    for _ in 0..8 {
        // chrono: Monday=0 via num_days_from_monday.
        let weekday = candidate_date.weekday().num_days_from_monday();
        if days.contains(&weekday) {
            let naive = candidate_date.and_time(time);
            let localized = match tz.from_local_datetime(&naive) {
                chrono::LocalResult::Single(dt) => dt,
                chrono::LocalResult::Ambiguous(first, _) => first,
                // The slot falls into a DST gap; take the next valid instant.
                chrono::LocalResult::None => {
                    candidate_date += Duration::days(1);
                    continue;
                }
            };
            let utc = localized.with_timezone(&Utc);
            if utc > after {
                return Ok(utc);
            }
        }
        candidate_date += Duration::days(1);
    }
    Err(ServerError::Validation(
        "weekday schedule found no slot within 8 days".to_string(),
    ))
}
