// Embedded scheduler: a single cooperative loop that admits due schedules
// through ordered gates, dispatches runs or work items, applies the retry
// ladder and reports outcomes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use runway_store::Db;
use runway_types::{
    datetime_to_iso, gen_id, EventBus, ExecutionMode, Result, Schedule, ScheduleExecution,
    ScheduleExecutionStatus, ScheduleSkipReason, ScheduleType, ServerEvent,
};

mod next_run;
mod notify;

pub use next_run::compute_next_run;
pub use notify::NotificationService;

/// Where admitted schedules send their work. The server wires this to the
/// run engine and the work-items queue.
#[async_trait]
pub trait ExecutionDispatcher: Send + Sync {
    /// Create (and start) a run for the schedule; returns the run id.
    async fn dispatch_run(
        &self,
        schedule: &Schedule,
        inputs: Value,
        request_id: String,
    ) -> Result<String>;

    /// Seed one work item onto the schedule's queue; returns the item id.
    async fn dispatch_work_item(&self, schedule: &Schedule, inputs: Value) -> Result<String>;
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub max_concurrent_global: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            max_concurrent_global: 10,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    running: HashMap<String, HashSet<String>>,
    global_running: usize,
    rate: HashMap<String, Vec<DateTime<Utc>>>,
}

enum Admission {
    Admit,
    DeferGlobal,
    Skip(ScheduleSkipReason),
}

enum DispatchTarget {
    Run(String),
    WorkItem(String),
}

pub struct SchedulerEngine {
    db: Db,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    notifier: NotificationService,
    event_bus: EventBus,
    config: SchedulerConfig,
    state: Mutex<TrackerState>,
}

impl SchedulerEngine {
    pub fn new(
        db: Db,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        event_bus: EventBus,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            dispatcher,
            notifier: NotificationService::new(),
            event_bus,
            config,
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// Give fresh schedules their first due time. Called once at startup.
    pub async fn initialize_next_runs(&self) -> Result<()> {
        let now = Utc::now();
        for schedule in self.db.schedules_missing_next_run().await? {
            match compute_next_run(&schedule, now) {
                Ok(Some(next)) => {
                    self.db
                        .set_schedule_next_run(
                            &schedule.id,
                            Some(&datetime_to_iso(next)),
                            &datetime_to_iso(now),
                        )
                        .await?;
                    tracing::info!(
                        "initialized next_run_at for schedule {}: {next}",
                        schedule.id
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!("schedule {} cannot be planned: {err}", schedule.id);
                }
            }
        }
        Ok(())
    }

    /// The scheduler loop. Spawned by the server; exceptions from a tick are
    /// logged and swallowed so the loop never dies.
    pub async fn run_loop(self: Arc<Self>) {
        tracing::info!(
            "scheduler started (check_interval={:?}, max_concurrent={})",
            self.config.check_interval,
            self.config.max_concurrent_global
        );
        loop {
            if let Err(err) = self.tick().await {
                tracing::error!("error in scheduler tick: {err}");
            }
            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    /// One pass over the due schedules.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let due = self.db.due_schedules(&datetime_to_iso(now)).await?;
        for schedule in due {
            if let Err(err) = self.process_schedule(&schedule, now).await {
                tracing::error!(
                    "error processing schedule {} ({}): {err}",
                    schedule.id,
                    schedule.name
                );
            }
        }
        Ok(())
    }

    async fn process_schedule(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
        match self.admit(schedule, now).await? {
            Admission::DeferGlobal => {
                // Silent defer: no execution row, next_run_at untouched, the
                // next tick retries.
                tracing::debug!("schedule {}: deferred, global limit reached", schedule.id);
                Ok(())
            }
            Admission::Skip(reason) => self.record_skip(schedule, now, reason).await,
            Admission::Admit => self.execute(schedule, now, true).await,
        }
    }

    async fn admit(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<Admission> {
        let state = self.state.lock().await;

        if state.global_running >= self.config.max_concurrent_global {
            return Ok(Admission::DeferGlobal);
        }

        let running_here = state
            .running
            .get(&schedule.id)
            .map(|set| set.len() as i64)
            .unwrap_or(0);
        if running_here >= schedule.max_concurrent && schedule.skip_if_running {
            return Ok(Admission::Skip(ScheduleSkipReason::PreviousRunning));
        }

        if schedule.rate_limit_enabled {
            let day_ago = now - chrono::Duration::days(1);
            let hour_ago = now - chrono::Duration::hours(1);
            let timestamps: Vec<DateTime<Utc>> = state
                .rate
                .get(&schedule.id)
                .map(|stamps| stamps.iter().copied().filter(|t| *t > day_ago).collect())
                .unwrap_or_default();
            if let Some(per_hour) = schedule.rate_limit_max_per_hour {
                let hourly = timestamps.iter().filter(|t| **t > hour_ago).count() as i64;
                if hourly >= per_hour {
                    return Ok(Admission::Skip(ScheduleSkipReason::RateLimited));
                }
            }
            if let Some(per_day) = schedule.rate_limit_max_per_day {
                if timestamps.len() as i64 >= per_day {
                    return Ok(Admission::Skip(ScheduleSkipReason::RateLimited));
                }
            }
        }
        drop(state);

        if let Some(dependency_id) = schedule.depends_on_schedule_id.as_deref() {
            let latest = self.db.latest_execution(dependency_id).await?;
            let satisfied = match latest {
                // Never-executed dependencies do not admit.
                None => false,
                Some(execution) => match schedule.dependency_mode {
                    runway_types::DependencyMode::AfterSuccess => {
                        execution.status == ScheduleExecutionStatus::Completed
                    }
                    runway_types::DependencyMode::AfterAny => matches!(
                        execution.status,
                        ScheduleExecutionStatus::Completed | ScheduleExecutionStatus::Failed
                    ),
                },
            };
            if !satisfied {
                return Ok(Admission::Skip(ScheduleSkipReason::DependencyFailed));
            }
        }

        Ok(Admission::Admit)
    }

    async fn record_skip(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        reason: ScheduleSkipReason,
    ) -> Result<()> {
        let now_str = datetime_to_iso(now);
        let execution = ScheduleExecution {
            id: gen_id("sexec"),
            schedule_id: schedule.id.clone(),
            run_id: None,
            work_item_id: None,
            scheduled_time: schedule.next_run_at.clone().unwrap_or_else(|| now_str.clone()),
            actual_start_time: now_str.clone(),
            actual_end_time: Some(now_str.clone()),
            duration_ms: Some(0),
            status: ScheduleExecutionStatus::Skipped,
            skip_reason: Some(reason),
            attempt_number: 1,
            result_json: None,
            error_message: None,
            notification_sent: false,
            notification_error: None,
        };
        self.db.insert_schedule_execution(&execution).await?;

        // next_run_at advances even when skipped, so a blocked schedule does
        // not thrash every tick.
        match compute_next_run(schedule, now) {
            Ok(Some(next)) => {
                self.db
                    .set_schedule_next_run(&schedule.id, Some(&datetime_to_iso(next)), &now_str)
                    .await?;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!("schedule {}: {err}", schedule.id),
        }

        tracing::info!(
            "schedule {} ({}) skipped: {}",
            schedule.id,
            schedule.name,
            reason.as_str()
        );
        self.event_bus.publish(ServerEvent::new(
            "schedule.execution.skipped",
            json!({
                "schedule_id": schedule.id,
                "execution_id": execution.id,
                "skip_reason": reason,
            }),
        ));
        Ok(())
    }

    /// Run an admitted schedule to a terminal execution, including the retry
    /// ladder, schedule bookkeeping and notifications. Manual fires pass
    /// `advance_next = false` so they do not shift the planned cadence.
    async fn execute(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        advance_next: bool,
    ) -> Result<()> {
        let execution_id = gen_id("sexec");
        let now_str = datetime_to_iso(now);
        let execution = ScheduleExecution {
            id: execution_id.clone(),
            schedule_id: schedule.id.clone(),
            run_id: None,
            work_item_id: None,
            scheduled_time: if advance_next {
                schedule.next_run_at.clone().unwrap_or_else(|| now_str.clone())
            } else {
                now_str.clone()
            },
            actual_start_time: now_str.clone(),
            actual_end_time: None,
            duration_ms: None,
            status: ScheduleExecutionStatus::Running,
            skip_reason: None,
            attempt_number: 1,
            result_json: None,
            error_message: None,
            notification_sent: false,
            notification_error: None,
        };
        self.db.insert_schedule_execution(&execution).await?;

        {
            let mut state = self.state.lock().await;
            state
                .running
                .entry(schedule.id.clone())
                .or_default()
                .insert(execution_id.clone());
            state.global_running += 1;
            state.rate.entry(schedule.id.clone()).or_default().push(now);
        }

        let outcome = self.execute_with_retry(schedule, &execution_id).await;

        {
            let mut state = self.state.lock().await;
            if let Some(set) = state.running.get_mut(&schedule.id) {
                set.remove(&execution_id);
            }
            state.global_running = state.global_running.saturating_sub(1);
        }

        let end = Utc::now();
        let end_str = datetime_to_iso(end);
        let duration_ms = (end - now).num_milliseconds().max(0);

        let (status, run_id, work_item_id, result_json, error_message) = match &outcome {
            Ok(DispatchTarget::Run(run_id)) => (
                ScheduleExecutionStatus::Completed,
                Some(run_id.clone()),
                None,
                Some(json!({"run_id": run_id}).to_string()),
                None,
            ),
            Ok(DispatchTarget::WorkItem(item_id)) => (
                ScheduleExecutionStatus::Completed,
                None,
                Some(item_id.clone()),
                Some(json!({"work_item_id": item_id}).to_string()),
                None,
            ),
            Err(err) => (
                ScheduleExecutionStatus::Failed,
                None,
                None,
                None,
                Some(err.to_string()),
            ),
        };
        self.db
            .finalize_execution(
                &execution_id,
                &end_str,
                duration_ms,
                status,
                run_id.as_deref(),
                work_item_id.as_deref(),
                result_json.as_deref(),
                error_message.as_deref(),
            )
            .await?;

        if advance_next {
            let (next_run, disable) = match compute_next_run(schedule, end) {
                Ok(Some(next)) => (Some(datetime_to_iso(next)), false),
                Ok(None) => (None, schedule.schedule_type == ScheduleType::Once),
                Err(err) => {
                    tracing::warn!("schedule {}: {err}", schedule.id);
                    (None, schedule.schedule_type == ScheduleType::Once)
                }
            };
            self.db
                .settle_schedule_after_execution(
                    &schedule.id,
                    &now_str,
                    next_run.as_deref(),
                    disable,
                    &end_str,
                )
                .await?;
        } else {
            self.db
                .settle_schedule_after_execution(
                    &schedule.id,
                    &now_str,
                    schedule.next_run_at.as_deref(),
                    false,
                    &end_str,
                )
                .await?;
        }

        let success = status == ScheduleExecutionStatus::Completed;
        tracing::info!(
            "schedule {} ({}) {} (duration={duration_ms}ms)",
            schedule.id,
            schedule.name,
            if success { "completed" } else { "failed" }
        );
        self.event_bus.publish(ServerEvent::new(
            "schedule.execution.finished",
            json!({
                "schedule_id": schedule.id,
                "execution_id": execution_id,
                "status": status,
                "run_id": run_id,
                "work_item_id": work_item_id,
            }),
        ));

        let execution = ScheduleExecution {
            actual_end_time: Some(end_str),
            duration_ms: Some(duration_ms),
            status,
            ..execution
        };
        self.send_notifications(schedule, &execution, success, error_message.as_deref())
            .await;
        Ok(())
    }

    async fn execute_with_retry(
        &self,
        schedule: &Schedule,
        execution_id: &str,
    ) -> Result<DispatchTarget> {
        let max_attempts = if schedule.retry_enabled {
            schedule.retry_max_attempts.max(1)
        } else {
            1
        };

        let mut last_error = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.db
                    .mark_execution_retrying(execution_id, attempt)
                    .await?;
            }
            match self.dispatch(schedule).await {
                Ok(target) => return Ok(target),
                Err(err) => {
                    tracing::warn!(
                        "schedule {} attempt {attempt}/{max_attempts} failed: {err}",
                        schedule.id
                    );
                    last_error = Some(err);
                    if attempt < max_attempts {
                        let delay = schedule.retry_delay_seconds
                            * schedule.retry_backoff_multiplier.powi((attempt - 1) as i32);
                        tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            runway_types::ServerError::Infrastructure("dispatch never ran".to_string())
        }))
    }

    async fn dispatch(&self, schedule: &Schedule) -> Result<DispatchTarget> {
        let inputs: Value = match schedule.inputs_json.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => json!({}),
        };
        match schedule.execution_mode {
            ExecutionMode::Run => {
                let run_id = self
                    .dispatcher
                    .dispatch_run(schedule, inputs, format!("schedule:{}", schedule.id))
                    .await?;
                Ok(DispatchTarget::Run(run_id))
            }
            ExecutionMode::WorkItem => {
                let item_id = self.dispatcher.dispatch_work_item(schedule, inputs).await?;
                Ok(DispatchTarget::WorkItem(item_id))
            }
        }
    }

    async fn send_notifications(
        &self,
        schedule: &Schedule,
        execution: &ScheduleExecution,
        success: bool,
        error: Option<&str>,
    ) {
        let should_notify = (success && schedule.notify_on_success)
            || (!success && schedule.notify_on_failure);
        if !should_notify {
            return;
        }

        let mut notification_error: Option<String> = None;
        if schedule.notification_webhook_url.is_some() {
            if let Err(err) = self
                .notifier
                .send_webhook(schedule, execution, success, error)
                .await
            {
                notification_error = Some(format!("Webhook failed: {err}"));
                tracing::error!("failed to send webhook notification: {err}");
            }
        }
        if schedule.notification_email.is_some() {
            if let Err(err) = self.notifier.send_email(schedule).await {
                let message = format!("Email failed: {err}");
                notification_error = match notification_error {
                    Some(existing) => Some(format!("{existing}; {message}")),
                    None => Some(message),
                };
            }
        }

        if schedule.notification_webhook_url.is_some() || schedule.notification_email.is_some() {
            // Delivery problems are recorded but never affect the execution
            // status itself.
            if let Err(err) = self
                .db
                .set_execution_notification(
                    &execution.id,
                    notification_error.is_none(),
                    notification_error.as_deref(),
                )
                .await
            {
                tracing::error!("failed to record notification outcome: {err}");
            }
        }
    }

    /// Manual fire, bypassing the admission gates. The schedule's planned
    /// next_run_at stays where it was.
    pub async fn run_now(&self, schedule_id: &str) -> Result<String> {
        let schedule = self.db.get_schedule(schedule_id).await?;
        let before = self.db.list_executions(schedule_id, 1).await?;
        self.execute(&schedule, Utc::now(), false).await?;
        let after = self.db.list_executions(schedule_id, 1).await?;
        let latest = after
            .into_iter()
            .next()
            .filter(|e| before.first().map(|b| b.id != e.id).unwrap_or(true));
        latest
            .map(|e| e.id)
            .ok_or_else(|| runway_types::ServerError::Infrastructure(
                "manual execution left no record".to_string(),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_types::{DependencyMode, ServerError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockDispatcher {
        calls: AtomicUsize,
        failures_before_success: usize,
    }

    impl MockDispatcher {
        fn new(failures_before_success: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures_before_success,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExecutionDispatcher for MockDispatcher {
        async fn dispatch_run(
            &self,
            _schedule: &Schedule,
            _inputs: Value,
            request_id: String,
        ) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(ServerError::Worker("dispatch failed".to_string()));
            }
            assert!(request_id.starts_with("schedule:"));
            Ok(format!("run-{call}"))
        }

        async fn dispatch_work_item(
            &self,
            _schedule: &Schedule,
            _inputs: Value,
        ) -> Result<String> {
            Ok("wi-1".to_string())
        }
    }

    fn base_schedule(id: &str) -> Schedule {
        Schedule {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            schedule_type: ScheduleType::Interval,
            cron_expression: None,
            interval_seconds: Some(300),
            weekday_config_json: None,
            timezone: "UTC".to_string(),
            next_run_at: Some("2024-01-01T00:00:00.000Z".to_string()),
            last_run_at: None,
            priority: 0,
            action_id: None,
            inputs_json: Some(r#"{"v":1}"#.to_string()),
            execution_mode: ExecutionMode::Run,
            work_item_queue: None,
            max_concurrent: 1,
            skip_if_running: true,
            depends_on_schedule_id: None,
            dependency_mode: DependencyMode::AfterSuccess,
            retry_enabled: false,
            retry_max_attempts: 3,
            retry_delay_seconds: 0.01,
            retry_backoff_multiplier: 1.0,
            rate_limit_enabled: false,
            rate_limit_max_per_hour: None,
            rate_limit_max_per_day: None,
            notify_on_success: false,
            notify_on_failure: false,
            notification_webhook_url: None,
            notification_email: None,
            created_at: runway_types::now_iso(),
            updated_at: runway_types::now_iso(),
        }
    }

    async fn engine_with(
        dispatcher: Arc<MockDispatcher>,
    ) -> (Arc<SchedulerEngine>, Db) {
        let db = Db::open_in_memory().await.expect("db");
        let engine = SchedulerEngine::new(
            db.clone(),
            dispatcher,
            EventBus::new(),
            SchedulerConfig::default(),
        );
        (engine, db)
    }

    #[tokio::test]
    async fn due_schedule_executes_and_advances_next_run() {
        let dispatcher = MockDispatcher::new(0);
        let (engine, db) = engine_with(dispatcher.clone()).await;
        db.insert_schedule(&base_schedule("sched-a")).await.expect("insert");

        engine.tick().await.expect("tick");

        assert_eq!(dispatcher.calls(), 1);
        let executions = db.list_executions("sched-a", 10).await.expect("list");
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ScheduleExecutionStatus::Completed);
        assert_eq!(executions[0].attempt_number, 1);
        assert_eq!(executions[0].run_id.as_deref(), Some("run-0"));

        let schedule = db.get_schedule("sched-a").await.expect("get");
        let next = schedule.next_run_at.expect("advanced");
        assert!(next.as_str() > "2024-01-01T00:00:00.000Z");
        assert!(schedule.last_run_at.is_some());
    }

    #[tokio::test]
    async fn retry_ladder_retries_and_records_attempts() {
        let dispatcher = MockDispatcher::new(2);
        let (engine, db) = engine_with(dispatcher.clone()).await;
        let mut schedule = base_schedule("sched-retry");
        schedule.retry_enabled = true;
        db.insert_schedule(&schedule).await.expect("insert");

        engine.tick().await.expect("tick");

        assert_eq!(dispatcher.calls(), 3);
        let executions = db.list_executions("sched-retry", 10).await.expect("list");
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ScheduleExecutionStatus::Completed);
        assert_eq!(executions[0].attempt_number, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_execution() {
        let dispatcher = MockDispatcher::new(99);
        let (engine, db) = engine_with(dispatcher.clone()).await;
        let mut schedule = base_schedule("sched-fail");
        schedule.retry_enabled = true;
        schedule.retry_max_attempts = 2;
        db.insert_schedule(&schedule).await.expect("insert");

        engine.tick().await.expect("tick");

        assert_eq!(dispatcher.calls(), 2);
        let executions = db.list_executions("sched-fail", 10).await.expect("list");
        assert_eq!(executions[0].status, ScheduleExecutionStatus::Failed);
        assert_eq!(
            executions[0].error_message.as_deref(),
            Some("dispatch failed")
        );
    }

    #[tokio::test]
    async fn dependency_failure_skips_with_reason_and_advances() {
        let dispatcher = MockDispatcher::new(0);
        let (engine, db) = engine_with(dispatcher.clone()).await;

        let upstream = base_schedule("sched-up");
        db.insert_schedule(&upstream).await.expect("insert");
        db.insert_schedule_execution(&ScheduleExecution {
            id: gen_id("sexec"),
            schedule_id: "sched-up".to_string(),
            run_id: None,
            work_item_id: None,
            scheduled_time: runway_types::now_iso(),
            actual_start_time: runway_types::now_iso(),
            actual_end_time: Some(runway_types::now_iso()),
            duration_ms: Some(5),
            status: ScheduleExecutionStatus::Failed,
            skip_reason: None,
            attempt_number: 1,
            result_json: None,
            error_message: Some("boom".to_string()),
            notification_sent: false,
            notification_error: None,
        })
        .await
        .expect("seed failed execution");

        let mut downstream = base_schedule("sched-down");
        downstream.depends_on_schedule_id = Some("sched-up".to_string());
        // Upstream is due as well; push it out of the window so only the
        // dependent schedule fires this tick.
        db.insert_schedule(&downstream).await.expect("insert");
        db.set_schedule_next_run("sched-up", Some("2999-01-01T00:00:00.000Z"), &runway_types::now_iso())
            .await
            .expect("park upstream");

        engine.tick().await.expect("tick");

        assert_eq!(dispatcher.calls(), 0);
        let executions = db.list_executions("sched-down", 10).await.expect("list");
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ScheduleExecutionStatus::Skipped);
        assert_eq!(
            executions[0].skip_reason,
            Some(ScheduleSkipReason::DependencyFailed)
        );

        let schedule = db.get_schedule("sched-down").await.expect("get");
        assert_ne!(
            schedule.next_run_at.as_deref(),
            Some("2024-01-01T00:00:00.000Z")
        );
    }

    #[tokio::test]
    async fn never_executed_dependency_also_skips() {
        let dispatcher = MockDispatcher::new(0);
        let (engine, db) = engine_with(dispatcher.clone()).await;

        let upstream = base_schedule("sched-up2");
        db.insert_schedule(&upstream).await.expect("insert");
        db.set_schedule_next_run("sched-up2", Some("2999-01-01T00:00:00.000Z"), &runway_types::now_iso())
            .await
            .expect("park upstream");

        let mut downstream = base_schedule("sched-down2");
        downstream.depends_on_schedule_id = Some("sched-up2".to_string());
        db.insert_schedule(&downstream).await.expect("insert");

        engine.tick().await.expect("tick");

        let executions = db.list_executions("sched-down2", 10).await.expect("list");
        assert_eq!(
            executions[0].skip_reason,
            Some(ScheduleSkipReason::DependencyFailed)
        );
    }

    #[tokio::test]
    async fn after_any_admits_on_failed_dependency() {
        let dispatcher = MockDispatcher::new(0);
        let (engine, db) = engine_with(dispatcher.clone()).await;

        db.insert_schedule(&base_schedule("sched-up3")).await.expect("insert");
        db.insert_schedule_execution(&ScheduleExecution {
            id: gen_id("sexec"),
            schedule_id: "sched-up3".to_string(),
            run_id: None,
            work_item_id: None,
            scheduled_time: runway_types::now_iso(),
            actual_start_time: runway_types::now_iso(),
            actual_end_time: Some(runway_types::now_iso()),
            duration_ms: Some(5),
            status: ScheduleExecutionStatus::Failed,
            skip_reason: None,
            attempt_number: 1,
            result_json: None,
            error_message: None,
            notification_sent: false,
            notification_error: None,
        })
        .await
        .expect("seed");
        db.set_schedule_next_run("sched-up3", Some("2999-01-01T00:00:00.000Z"), &runway_types::now_iso())
            .await
            .expect("park");

        let mut downstream = base_schedule("sched-down3");
        downstream.depends_on_schedule_id = Some("sched-up3".to_string());
        downstream.dependency_mode = DependencyMode::AfterAny;
        db.insert_schedule(&downstream).await.expect("insert");

        engine.tick().await.expect("tick");
        assert_eq!(dispatcher.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_skips_after_budget_is_spent() {
        let dispatcher = MockDispatcher::new(0);
        let (engine, db) = engine_with(dispatcher.clone()).await;
        let mut schedule = base_schedule("sched-rate");
        schedule.rate_limit_enabled = true;
        schedule.rate_limit_max_per_hour = Some(1);
        db.insert_schedule(&schedule).await.expect("insert");

        engine.tick().await.expect("first tick");
        assert_eq!(dispatcher.calls(), 1);

        // Make it due again immediately.
        db.set_schedule_next_run("sched-rate", Some("2024-01-01T00:00:00.000Z"), &runway_types::now_iso())
            .await
            .expect("re-arm");
        engine.tick().await.expect("second tick");

        assert_eq!(dispatcher.calls(), 1);
        let executions = db.list_executions("sched-rate", 10).await.expect("list");
        let skipped: Vec<_> = executions
            .iter()
            .filter(|e| e.status == ScheduleExecutionStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].skip_reason, Some(ScheduleSkipReason::RateLimited));
    }

    #[tokio::test]
    async fn once_schedule_disables_after_running() {
        let dispatcher = MockDispatcher::new(0);
        let (engine, db) = engine_with(dispatcher.clone()).await;
        let mut schedule = base_schedule("sched-once");
        schedule.schedule_type = ScheduleType::Once;
        schedule.interval_seconds = None;
        db.insert_schedule(&schedule).await.expect("insert");

        engine.tick().await.expect("tick");

        let stored = db.get_schedule("sched-once").await.expect("get");
        assert!(!stored.enabled);
        assert!(stored.next_run_at.is_none());
    }

    #[tokio::test]
    async fn manual_fire_keeps_the_planned_cadence() {
        let dispatcher = MockDispatcher::new(0);
        let (engine, db) = engine_with(dispatcher.clone()).await;
        let mut schedule = base_schedule("sched-manual");
        schedule.next_run_at = Some("2999-01-01T00:00:00.000Z".to_string());
        db.insert_schedule(&schedule).await.expect("insert");

        let execution_id = engine.run_now("sched-manual").await.expect("run now");
        assert!(!execution_id.is_empty());
        assert_eq!(dispatcher.calls(), 1);

        let stored = db.get_schedule("sched-manual").await.expect("get");
        assert_eq!(
            stored.next_run_at.as_deref(),
            Some("2999-01-01T00:00:00.000Z")
        );
    }
}
