use rusqlite::params;

use runway_types::{
    Result, Schedule, ScheduleExecution, ScheduleExecutionStatus, ServerError,
};

use crate::rows::{execution_from_row, schedule_from_row, EXECUTION_COLS, SCHEDULE_COLS};
use crate::{db_err, Db};

impl Db {
    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedule (id, name, enabled, schedule_type, cron_expression,
                 interval_seconds, weekday_config_json, timezone, next_run_at, last_run_at,
                 priority, action_id, inputs_json, execution_mode, work_item_queue,
                 max_concurrent, skip_if_running, depends_on_schedule_id, dependency_mode,
                 retry_enabled, retry_max_attempts, retry_delay_seconds,
                 retry_backoff_multiplier, rate_limit_enabled, rate_limit_max_per_hour,
                 rate_limit_max_per_day, notify_on_success, notify_on_failure,
                 notification_webhook_url, notification_email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29,
                 ?30, ?31, ?32)",
            params![
                schedule.id,
                schedule.name,
                schedule.enabled as i64,
                schedule.schedule_type.as_str(),
                schedule.cron_expression,
                schedule.interval_seconds,
                schedule.weekday_config_json,
                schedule.timezone,
                schedule.next_run_at,
                schedule.last_run_at,
                schedule.priority,
                schedule.action_id,
                schedule.inputs_json,
                schedule.execution_mode.as_str(),
                schedule.work_item_queue,
                schedule.max_concurrent,
                schedule.skip_if_running as i64,
                schedule.depends_on_schedule_id,
                schedule.dependency_mode.as_str(),
                schedule.retry_enabled as i64,
                schedule.retry_max_attempts,
                schedule.retry_delay_seconds,
                schedule.retry_backoff_multiplier,
                schedule.rate_limit_enabled as i64,
                schedule.rate_limit_max_per_hour,
                schedule.rate_limit_max_per_day,
                schedule.notify_on_success as i64,
                schedule.notify_on_failure as i64,
                schedule.notification_webhook_url,
                schedule.notification_email,
                schedule.created_at,
                schedule.updated_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE schedule SET name = ?2, enabled = ?3, schedule_type = ?4,
                     cron_expression = ?5, interval_seconds = ?6, weekday_config_json = ?7,
                     timezone = ?8, next_run_at = ?9, last_run_at = ?10, priority = ?11,
                     action_id = ?12, inputs_json = ?13, execution_mode = ?14,
                     work_item_queue = ?15, max_concurrent = ?16, skip_if_running = ?17,
                     depends_on_schedule_id = ?18, dependency_mode = ?19,
                     retry_enabled = ?20, retry_max_attempts = ?21,
                     retry_delay_seconds = ?22, retry_backoff_multiplier = ?23,
                     rate_limit_enabled = ?24, rate_limit_max_per_hour = ?25,
                     rate_limit_max_per_day = ?26, notify_on_success = ?27,
                     notify_on_failure = ?28, notification_webhook_url = ?29,
                     notification_email = ?30, updated_at = ?31
                 WHERE id = ?1",
                params![
                    schedule.id,
                    schedule.name,
                    schedule.enabled as i64,
                    schedule.schedule_type.as_str(),
                    schedule.cron_expression,
                    schedule.interval_seconds,
                    schedule.weekday_config_json,
                    schedule.timezone,
                    schedule.next_run_at,
                    schedule.last_run_at,
                    schedule.priority,
                    schedule.action_id,
                    schedule.inputs_json,
                    schedule.execution_mode.as_str(),
                    schedule.work_item_queue,
                    schedule.max_concurrent,
                    schedule.skip_if_running as i64,
                    schedule.depends_on_schedule_id,
                    schedule.dependency_mode.as_str(),
                    schedule.retry_enabled as i64,
                    schedule.retry_max_attempts,
                    schedule.retry_delay_seconds,
                    schedule.retry_backoff_multiplier,
                    schedule.rate_limit_enabled as i64,
                    schedule.rate_limit_max_per_hour,
                    schedule.rate_limit_max_per_day,
                    schedule.notify_on_success as i64,
                    schedule.notify_on_failure as i64,
                    schedule.notification_webhook_url,
                    schedule.notification_email,
                    schedule.updated_at,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::NotFound(format!(
                "schedule not found: {}",
                schedule.id
            )));
        }
        Ok(())
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM schedule_execution WHERE schedule_id = ?1",
            params![id],
        )
        .map_err(db_err)?;
        let changed = tx
            .execute("DELETE FROM schedule WHERE id = ?1", params![id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        if changed == 0 {
            return Err(ServerError::NotFound(format!("schedule not found: {id}")));
        }
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Schedule> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {SCHEDULE_COLS} FROM schedule WHERE id = ?1"),
            params![id],
            schedule_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ServerError::NotFound(format!("schedule not found: {id}"))
            }
            other => db_err(other),
        })
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {SCHEDULE_COLS} FROM schedule ORDER BY name"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], schedule_from_row).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// Enabled schedules whose next_run_at has passed, highest priority
    /// first, oldest due time first within a priority.
    pub async fn due_schedules(&self, now_iso: &str) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedule
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY priority DESC, next_run_at ASC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![now_iso], schedule_from_row)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// Enabled schedules that never had next_run_at computed (fresh rows,
    /// or rows re-enabled after a once-schedule fired).
    pub async fn schedules_missing_next_run(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedule
                 WHERE enabled = 1 AND next_run_at IS NULL"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], schedule_from_row).map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    pub async fn set_schedule_next_run(
        &self,
        id: &str,
        next_run_at: Option<&str>,
        updated_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedule SET next_run_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, next_run_at, updated_at],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Bookkeeping after a terminal execution: last_run_at, the recomputed
    /// next_run_at, and for once-schedules the auto-disable.
    pub async fn settle_schedule_after_execution(
        &self,
        id: &str,
        last_run_at: &str,
        next_run_at: Option<&str>,
        disable: bool,
        updated_at: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        if disable {
            conn.execute(
                "UPDATE schedule
                 SET last_run_at = ?2, next_run_at = NULL, enabled = 0, updated_at = ?3
                 WHERE id = ?1",
                params![id, last_run_at, updated_at],
            )
            .map_err(db_err)?;
        } else {
            conn.execute(
                "UPDATE schedule
                 SET last_run_at = ?2, next_run_at = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, last_run_at, next_run_at, updated_at],
            )
            .map_err(db_err)?;
        }
        Ok(())
    }

    pub async fn insert_schedule_execution(&self, execution: &ScheduleExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO schedule_execution (id, schedule_id, run_id, work_item_id,
                 scheduled_time, actual_start_time, actual_end_time, duration_ms, status,
                 skip_reason, attempt_number, result_json, error_message,
                 notification_sent, notification_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                execution.id,
                execution.schedule_id,
                execution.run_id,
                execution.work_item_id,
                execution.scheduled_time,
                execution.actual_start_time,
                execution.actual_end_time,
                execution.duration_ms,
                execution.status.as_str(),
                execution.skip_reason.map(|r| r.as_str()),
                execution.attempt_number,
                execution.result_json,
                execution.error_message,
                execution.notification_sent as i64,
                execution.notification_error,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Retry-ladder bookkeeping: same row, bumped attempt, RETRYING status.
    pub async fn mark_execution_retrying(&self, id: &str, attempt_number: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedule_execution SET attempt_number = ?2, status = ?3 WHERE id = ?1",
            params![id, attempt_number, ScheduleExecutionStatus::Retrying.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_execution(
        &self,
        id: &str,
        actual_end_time: &str,
        duration_ms: i64,
        status: ScheduleExecutionStatus,
        run_id: Option<&str>,
        work_item_id: Option<&str>,
        result_json: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedule_execution
             SET actual_end_time = ?2, duration_ms = ?3, status = ?4, run_id = ?5,
                 work_item_id = ?6, result_json = ?7, error_message = ?8
             WHERE id = ?1",
            params![
                id,
                actual_end_time,
                duration_ms,
                status.as_str(),
                run_id,
                work_item_id,
                result_json,
                error_message,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn set_execution_notification(
        &self,
        id: &str,
        sent: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE schedule_execution
             SET notification_sent = ?2, notification_error = ?3
             WHERE id = ?1",
            params![id, sent as i64, error],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn latest_execution(&self, schedule_id: &str) -> Result<Option<ScheduleExecution>> {
        let conn = self.conn.lock().await;
        let row = conn.query_row(
            &format!(
                "SELECT {EXECUTION_COLS} FROM schedule_execution
                 WHERE schedule_id = ?1
                 ORDER BY actual_start_time DESC LIMIT 1"
            ),
            params![schedule_id],
            execution_from_row,
        );
        match row {
            Ok(execution) => Ok(Some(execution)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(other) => Err(db_err(other)),
        }
    }

    pub async fn list_executions(
        &self,
        schedule_id: &str,
        limit: i64,
    ) -> Result<Vec<ScheduleExecution>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXECUTION_COLS} FROM schedule_execution
                 WHERE schedule_id = ?1
                 ORDER BY actual_start_time DESC LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![schedule_id, limit.clamp(1, 1000)], execution_from_row)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }
}
