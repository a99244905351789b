/// Ordered schema migrations. Applied ids are recorded in the `migration`
/// table; a database holding an id newer than the last entry here refuses
/// to open.
pub const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "initial",
        "CREATE TABLE IF NOT EXISTS action_package (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            directory TEXT NOT NULL,
            environment_hash TEXT NOT NULL,
            env_json TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS action (
            id TEXT PRIMARY KEY,
            action_package_id TEXT NOT NULL REFERENCES action_package(id),
            name TEXT NOT NULL,
            docs TEXT NOT NULL,
            file TEXT NOT NULL,
            lineno INTEGER NOT NULL,
            input_schema TEXT NOT NULL,
            output_schema TEXT NOT NULL,
            managed_params_json TEXT,
            options_json TEXT,
            is_consequential INTEGER,
            enabled INTEGER NOT NULL DEFAULT 1,
            kind TEXT NOT NULL DEFAULT 'action',
            UNIQUE(action_package_id, name)
        );
        CREATE TABLE IF NOT EXISTS run (
            id TEXT PRIMARY KEY,
            numbered_id INTEGER NOT NULL,
            status INTEGER NOT NULL,
            action_id TEXT NOT NULL REFERENCES action(id),
            start_time TEXT NOT NULL,
            run_time REAL,
            inputs TEXT NOT NULL,
            result TEXT,
            error_message TEXT,
            relative_artifacts_dir TEXT NOT NULL,
            run_type TEXT NOT NULL DEFAULT 'action'
        );
        CREATE INDEX IF NOT EXISTS idx_run_numbered_id ON run(numbered_id);
        CREATE INDEX IF NOT EXISTS idx_run_action ON run(action_id);
        CREATE TABLE IF NOT EXISTS counter (
            id TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );",
    ),
    (
        2,
        "add-run-request-id",
        "ALTER TABLE run ADD COLUMN request_id TEXT;",
    ),
    (
        3,
        "add-schedules",
        "CREATE TABLE IF NOT EXISTS schedule (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            schedule_type TEXT NOT NULL,
            cron_expression TEXT,
            interval_seconds INTEGER,
            weekday_config_json TEXT,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            next_run_at TEXT,
            last_run_at TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            action_id TEXT REFERENCES action(id),
            inputs_json TEXT,
            execution_mode TEXT NOT NULL DEFAULT 'run',
            work_item_queue TEXT,
            max_concurrent INTEGER NOT NULL DEFAULT 1,
            skip_if_running INTEGER NOT NULL DEFAULT 1,
            depends_on_schedule_id TEXT,
            dependency_mode TEXT NOT NULL DEFAULT 'after_success',
            retry_enabled INTEGER NOT NULL DEFAULT 0,
            retry_max_attempts INTEGER NOT NULL DEFAULT 3,
            retry_delay_seconds REAL NOT NULL DEFAULT 60.0,
            retry_backoff_multiplier REAL NOT NULL DEFAULT 2.0,
            rate_limit_enabled INTEGER NOT NULL DEFAULT 0,
            rate_limit_max_per_hour INTEGER,
            rate_limit_max_per_day INTEGER,
            notify_on_success INTEGER NOT NULL DEFAULT 0,
            notify_on_failure INTEGER NOT NULL DEFAULT 0,
            notification_webhook_url TEXT,
            notification_email TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_schedule_due
            ON schedule(enabled, next_run_at);
        CREATE TABLE IF NOT EXISTS schedule_execution (
            id TEXT PRIMARY KEY,
            schedule_id TEXT NOT NULL REFERENCES schedule(id),
            run_id TEXT,
            work_item_id TEXT,
            scheduled_time TEXT NOT NULL,
            actual_start_time TEXT NOT NULL,
            actual_end_time TEXT,
            duration_ms INTEGER,
            status TEXT NOT NULL,
            skip_reason TEXT,
            attempt_number INTEGER NOT NULL DEFAULT 1,
            result_json TEXT,
            error_message TEXT,
            notification_sent INTEGER NOT NULL DEFAULT 0,
            notification_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_schedule_execution_schedule
            ON schedule_execution(schedule_id, actual_start_time);",
    ),
    (
        4,
        "add-triggers",
        "CREATE TABLE IF NOT EXISTS trigger (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            action_id TEXT REFERENCES action(id),
            execution_mode TEXT NOT NULL DEFAULT 'run',
            work_item_queue TEXT,
            inputs_template_json TEXT,
            webhook_secret TEXT,
            rate_limit_enabled INTEGER NOT NULL DEFAULT 0,
            rate_limit_max_per_minute INTEGER NOT NULL DEFAULT 60,
            last_triggered_at TEXT,
            trigger_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS trigger_invocation (
            id TEXT PRIMARY KEY,
            trigger_id TEXT NOT NULL REFERENCES trigger(id),
            invoked_at TEXT NOT NULL,
            source_ip TEXT,
            payload_json TEXT,
            headers_json TEXT,
            status TEXT NOT NULL,
            run_id TEXT,
            work_item_id TEXT,
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_trigger_invocation_trigger
            ON trigger_invocation(trigger_id, invoked_at);",
    ),
    (
        5,
        "add-work-items",
        "CREATE TABLE IF NOT EXISTS work_item (
            id TEXT PRIMARY KEY,
            queue_name TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'PENDING',
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            lease_owner TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            exception_type TEXT,
            exception_code TEXT,
            exception_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_work_item_queue
            ON work_item(queue_name, state, created_at);",
    ),
];
