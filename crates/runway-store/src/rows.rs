// Row mapping. Each mapper reads columns in the order of the matching
// `SELECT` column list constant, so queries and mappers stay in lockstep.

use rusqlite::Row;

use runway_types::{
    Action, ActionKind, ActionPackage, DependencyMode, ExecutionMode, Run, RunStatus, RunType,
    Schedule, ScheduleExecution, ScheduleExecutionStatus, ScheduleSkipReason, ScheduleType,
    Trigger, TriggerInvocation, TriggerInvocationStatus, WorkItem, WorkItemState,
};

pub(crate) const PACKAGE_COLS: &str = "id, name, directory, environment_hash, env_json";

pub(crate) fn package_from_row(row: &Row<'_>) -> rusqlite::Result<ActionPackage> {
    Ok(ActionPackage {
        id: row.get(0)?,
        name: row.get(1)?,
        directory: row.get(2)?,
        environment_hash: row.get(3)?,
        env_json: row.get(4)?,
    })
}

pub(crate) const ACTION_COLS: &str = "id, action_package_id, name, docs, file, lineno, \
     input_schema, output_schema, managed_params_json, options_json, \
     is_consequential, enabled, kind";

pub(crate) fn action_from_row(row: &Row<'_>) -> rusqlite::Result<Action> {
    let kind: String = row.get(12)?;
    Ok(Action {
        id: row.get(0)?,
        action_package_id: row.get(1)?,
        name: row.get(2)?,
        docs: row.get(3)?,
        file: row.get(4)?,
        lineno: row.get(5)?,
        input_schema: row.get(6)?,
        output_schema: row.get(7)?,
        managed_params_json: row.get(8)?,
        options_json: row.get(9)?,
        is_consequential: row
            .get::<_, Option<i64>>(10)?
            .map(|v| v != 0),
        enabled: row.get::<_, i64>(11)? != 0,
        kind: ActionKind::parse(&kind).unwrap_or(ActionKind::Action),
    })
}

pub(crate) const RUN_COLS: &str = "id, numbered_id, status, action_id, start_time, run_time, \
     inputs, result, error_message, relative_artifacts_dir, request_id, run_type";

pub(crate) fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let run_type: String = row.get(11)?;
    Ok(Run {
        id: row.get(0)?,
        numbered_id: row.get(1)?,
        status: RunStatus::from_code(row.get(2)?).unwrap_or(RunStatus::Failed),
        action_id: row.get(3)?,
        start_time: row.get(4)?,
        run_time: row.get(5)?,
        inputs: row.get(6)?,
        result: row.get(7)?,
        error_message: row.get(8)?,
        relative_artifacts_dir: row.get(9)?,
        request_id: row.get(10)?,
        run_type: RunType::parse(&run_type).unwrap_or(RunType::Action),
    })
}

pub(crate) const SCHEDULE_COLS: &str = "id, name, enabled, schedule_type, cron_expression, interval_seconds, \
     weekday_config_json, timezone, next_run_at, last_run_at, priority, \
     action_id, inputs_json, execution_mode, work_item_queue, max_concurrent, \
     skip_if_running, depends_on_schedule_id, dependency_mode, retry_enabled, \
     retry_max_attempts, retry_delay_seconds, retry_backoff_multiplier, \
     rate_limit_enabled, rate_limit_max_per_hour, rate_limit_max_per_day, \
     notify_on_success, notify_on_failure, notification_webhook_url, \
     notification_email, created_at, updated_at";

pub(crate) fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let schedule_type: String = row.get(3)?;
    let execution_mode: String = row.get(13)?;
    let dependency_mode: String = row.get(18)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        schedule_type: ScheduleType::parse(&schedule_type).unwrap_or(ScheduleType::Once),
        cron_expression: row.get(4)?,
        interval_seconds: row.get(5)?,
        weekday_config_json: row.get(6)?,
        timezone: row.get(7)?,
        next_run_at: row.get(8)?,
        last_run_at: row.get(9)?,
        priority: row.get(10)?,
        action_id: row.get(11)?,
        inputs_json: row.get(12)?,
        execution_mode: ExecutionMode::parse(&execution_mode).unwrap_or(ExecutionMode::Run),
        work_item_queue: row.get(14)?,
        max_concurrent: row.get(15)?,
        skip_if_running: row.get::<_, i64>(16)? != 0,
        depends_on_schedule_id: row.get(17)?,
        dependency_mode: DependencyMode::parse(&dependency_mode)
            .unwrap_or(DependencyMode::AfterSuccess),
        retry_enabled: row.get::<_, i64>(19)? != 0,
        retry_max_attempts: row.get(20)?,
        retry_delay_seconds: row.get(21)?,
        retry_backoff_multiplier: row.get(22)?,
        rate_limit_enabled: row.get::<_, i64>(23)? != 0,
        rate_limit_max_per_hour: row.get(24)?,
        rate_limit_max_per_day: row.get(25)?,
        notify_on_success: row.get::<_, i64>(26)? != 0,
        notify_on_failure: row.get::<_, i64>(27)? != 0,
        notification_webhook_url: row.get(28)?,
        notification_email: row.get(29)?,
        created_at: row.get(30)?,
        updated_at: row.get(31)?,
    })
}

pub(crate) const EXECUTION_COLS: &str = "id, schedule_id, run_id, work_item_id, scheduled_time, actual_start_time, \
     actual_end_time, duration_ms, status, skip_reason, attempt_number, \
     result_json, error_message, notification_sent, notification_error";

pub(crate) fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleExecution> {
    let status: String = row.get(8)?;
    let skip_reason: Option<String> = row.get(9)?;
    Ok(ScheduleExecution {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        run_id: row.get(2)?,
        work_item_id: row.get(3)?,
        scheduled_time: row.get(4)?,
        actual_start_time: row.get(5)?,
        actual_end_time: row.get(6)?,
        duration_ms: row.get(7)?,
        status: ScheduleExecutionStatus::parse(&status)
            .unwrap_or(ScheduleExecutionStatus::Failed),
        skip_reason: skip_reason.as_deref().and_then(ScheduleSkipReason::parse),
        attempt_number: row.get(10)?,
        result_json: row.get(11)?,
        error_message: row.get(12)?,
        notification_sent: row.get::<_, i64>(13)? != 0,
        notification_error: row.get(14)?,
    })
}

pub(crate) const TRIGGER_COLS: &str = "id, name, enabled, action_id, execution_mode, work_item_queue, \
     inputs_template_json, webhook_secret, rate_limit_enabled, \
     rate_limit_max_per_minute, last_triggered_at, trigger_count, \
     created_at, updated_at";

pub(crate) fn trigger_from_row(row: &Row<'_>) -> rusqlite::Result<Trigger> {
    let execution_mode: String = row.get(4)?;
    Ok(Trigger {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        action_id: row.get(3)?,
        execution_mode: ExecutionMode::parse(&execution_mode).unwrap_or(ExecutionMode::Run),
        work_item_queue: row.get(5)?,
        inputs_template_json: row.get(6)?,
        webhook_secret: row.get(7)?,
        rate_limit_enabled: row.get::<_, i64>(8)? != 0,
        rate_limit_max_per_minute: row.get(9)?,
        last_triggered_at: row.get(10)?,
        trigger_count: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

pub(crate) const INVOCATION_COLS: &str = "id, trigger_id, invoked_at, source_ip, payload_json, headers_json, \
     status, run_id, work_item_id, error_message";

pub(crate) fn invocation_from_row(row: &Row<'_>) -> rusqlite::Result<TriggerInvocation> {
    let status: String = row.get(6)?;
    Ok(TriggerInvocation {
        id: row.get(0)?,
        trigger_id: row.get(1)?,
        invoked_at: row.get(2)?,
        source_ip: row.get(3)?,
        payload_json: row.get(4)?,
        headers_json: row.get(5)?,
        status: TriggerInvocationStatus::parse(&status)
            .unwrap_or(TriggerInvocationStatus::Error),
        run_id: row.get(7)?,
        work_item_id: row.get(8)?,
        error_message: row.get(9)?,
    })
}

pub(crate) const WORK_ITEM_COLS: &str = "id, queue_name, state, payload_json, created_at, started_at, finished_at, \
     lease_owner, attempts, exception_type, exception_code, exception_message";

pub(crate) fn work_item_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let state: String = row.get(2)?;
    Ok(WorkItem {
        id: row.get(0)?,
        queue_name: row.get(1)?,
        state: WorkItemState::parse(&state).unwrap_or(WorkItemState::Failed),
        payload_json: row.get(3)?,
        created_at: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        lease_owner: row.get(7)?,
        attempts: row.get(8)?,
        exception_type: row.get(9)?,
        exception_code: row.get(10)?,
        exception_message: row.get(11)?,
    })
}
