use serde::{Deserialize, Serialize};

/// An imported action package: a directory with a manifest declaring
/// dependencies and one or more actions. Replaced wholesale on re-import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPackage {
    pub id: String,
    pub name: String,
    pub directory: String,
    pub environment_hash: String,
    /// JSON object with the environment variables used to run this package.
    pub env_json: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Action,
    Query,
    Predict,
    Tool,
    Prompt,
    Resource,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Action => "action",
            ActionKind::Query => "query",
            ActionKind::Predict => "predict",
            ActionKind::Tool => "tool",
            ActionKind::Prompt => "prompt",
            ActionKind::Resource => "resource",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "action" => Some(ActionKind::Action),
            "query" => Some(ActionKind::Query),
            "predict" => Some(ActionKind::Predict),
            "tool" => Some(ActionKind::Tool),
            "prompt" => Some(ActionKind::Prompt),
            "resource" => Some(ActionKind::Resource),
            _ => None,
        }
    }

    /// Kinds exposed as MCP tools (prompts and resources have their own
    /// primitives).
    pub fn is_tool_like(self) -> bool {
        matches!(
            self,
            ActionKind::Action | ActionKind::Query | ActionKind::Predict | ActionKind::Tool
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub action_package_id: String,
    pub name: String,
    pub docs: String,
    /// Source file, relative to the package directory.
    pub file: String,
    pub lineno: i64,
    /// JSON Schema (object) for caller-provided inputs.
    pub input_schema: String,
    /// JSON Schema for the returned value.
    pub output_schema: String,
    /// JSON object mapping managed parameter name -> kind
    /// (secret, oauth2_secret, data_source, request).
    pub managed_params_json: Option<String>,
    /// Decorator keyword arguments that matter to the surface (resource
    /// `uri`, prompt/display metadata).
    pub options_json: Option<String>,
    pub is_consequential: Option<bool>,
    pub enabled: bool,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    NotRun,
    Running,
    Passed,
    Failed,
}

impl RunStatus {
    /// Stable integer codes persisted in the run table.
    pub fn code(self) -> i64 {
        match self {
            RunStatus::NotRun => 0,
            RunStatus::Running => 1,
            RunStatus::Passed => 2,
            RunStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RunStatus::NotRun),
            1 => Some(RunStatus::Running),
            2 => Some(RunStatus::Passed),
            3 => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Action,
    Robot,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Action => "action",
            RunType::Robot => "robot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "action" => Some(RunType::Action),
            "robot" => Some(RunType::Robot),
            _ => None,
        }
    }
}

/// One invocation of an action: inputs persisted, subprocess executed,
/// outputs captured. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    /// Dense monotonic integer allocated from the `run_id` counter.
    pub numbered_id: i64,
    pub status: RunStatus,
    pub action_id: String,
    pub start_time: String,
    /// Wall-clock duration in seconds, set when the run finishes.
    pub run_time: Option<f64>,
    /// JSON object with the validated caller inputs.
    pub inputs: String,
    /// JSON-encoded returned value.
    pub result: Option<String>,
    pub error_message: Option<String>,
    /// Relative to the artifacts root (`runs/<run_id>`).
    pub relative_artifacts_dir: String,
    /// Provenance marker: `schedule:<id>`, `trigger:<id>`, or caller-supplied.
    pub request_id: Option<String>,
    pub run_type: RunType,
}

/// A single named counter row, mutated with compare-and-set inside a
/// transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    Interval,
    Weekday,
    Once,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Weekday => "weekday",
            ScheduleType::Once => "once",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cron" => Some(ScheduleType::Cron),
            "interval" => Some(ScheduleType::Interval),
            "weekday" => Some(ScheduleType::Weekday),
            "once" => Some(ScheduleType::Once),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Run,
    WorkItem,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Run => "run",
            ExecutionMode::WorkItem => "work_item",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(ExecutionMode::Run),
            "work_item" => Some(ExecutionMode::WorkItem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    AfterSuccess,
    AfterAny,
}

impl DependencyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyMode::AfterSuccess => "after_success",
            DependencyMode::AfterAny => "after_any",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "after_success" => Some(DependencyMode::AfterSuccess),
            "after_any" => Some(DependencyMode::AfterAny),
            _ => None,
        }
    }
}

/// A stored description of when to auto-create runs or work items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    /// JSON `{days: [0..6, Monday=0], time: "HH:MM"}`.
    pub weekday_config_json: Option<String>,
    pub timezone: String,
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub priority: i64,
    pub action_id: Option<String>,
    pub inputs_json: Option<String>,
    pub execution_mode: ExecutionMode,
    pub work_item_queue: Option<String>,
    pub max_concurrent: i64,
    pub skip_if_running: bool,
    pub depends_on_schedule_id: Option<String>,
    pub dependency_mode: DependencyMode,
    pub retry_enabled: bool,
    pub retry_max_attempts: i64,
    pub retry_delay_seconds: f64,
    pub retry_backoff_multiplier: f64,
    pub rate_limit_enabled: bool,
    pub rate_limit_max_per_hour: Option<i64>,
    pub rate_limit_max_per_day: Option<i64>,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub notification_webhook_url: Option<String>,
    pub notification_email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleExecutionStatus {
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl ScheduleExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleExecutionStatus::Running => "RUNNING",
            ScheduleExecutionStatus::Retrying => "RETRYING",
            ScheduleExecutionStatus::Completed => "COMPLETED",
            ScheduleExecutionStatus::Failed => "FAILED",
            ScheduleExecutionStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(ScheduleExecutionStatus::Running),
            "RETRYING" => Some(ScheduleExecutionStatus::Retrying),
            "COMPLETED" => Some(ScheduleExecutionStatus::Completed),
            "FAILED" => Some(ScheduleExecutionStatus::Failed),
            "SKIPPED" => Some(ScheduleExecutionStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScheduleExecutionStatus::Completed
                | ScheduleExecutionStatus::Failed
                | ScheduleExecutionStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleSkipReason {
    PreviousRunning,
    RateLimited,
    DependencyFailed,
}

impl ScheduleSkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleSkipReason::PreviousRunning => "PREVIOUS_RUNNING",
            ScheduleSkipReason::RateLimited => "RATE_LIMITED",
            ScheduleSkipReason::DependencyFailed => "DEPENDENCY_FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PREVIOUS_RUNNING" => Some(ScheduleSkipReason::PreviousRunning),
            "RATE_LIMITED" => Some(ScheduleSkipReason::RateLimited),
            "DEPENDENCY_FAILED" => Some(ScheduleSkipReason::DependencyFailed),
            _ => None,
        }
    }
}

/// One attempt (or skip) of a schedule. Never mutated after terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub id: String,
    pub schedule_id: String,
    pub run_id: Option<String>,
    pub work_item_id: Option<String>,
    pub scheduled_time: String,
    pub actual_start_time: String,
    pub actual_end_time: Option<String>,
    pub duration_ms: Option<i64>,
    pub status: ScheduleExecutionStatus,
    pub skip_reason: Option<ScheduleSkipReason>,
    pub attempt_number: i64,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub notification_sent: bool,
    pub notification_error: Option<String>,
}

/// A webhook endpoint that converts incoming HTTP requests into runs or
/// work items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub action_id: Option<String>,
    pub execution_mode: ExecutionMode,
    pub work_item_queue: Option<String>,
    /// JSON tree that may contain `{{path}}` references.
    pub inputs_template_json: Option<String>,
    pub webhook_secret: Option<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_max_per_minute: i64,
    pub last_triggered_at: Option<String>,
    pub trigger_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerInvocationStatus {
    Accepted,
    Rejected,
    RateLimited,
    Error,
}

impl TriggerInvocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerInvocationStatus::Accepted => "ACCEPTED",
            TriggerInvocationStatus::Rejected => "REJECTED",
            TriggerInvocationStatus::RateLimited => "RATE_LIMITED",
            TriggerInvocationStatus::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACCEPTED" => Some(TriggerInvocationStatus::Accepted),
            "REJECTED" => Some(TriggerInvocationStatus::Rejected),
            "RATE_LIMITED" => Some(TriggerInvocationStatus::RateLimited),
            "ERROR" => Some(TriggerInvocationStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerInvocation {
    pub id: String,
    pub trigger_id: String,
    pub invoked_at: String,
    pub source_ip: Option<String>,
    pub payload_json: Option<String>,
    pub headers_json: Option<String>,
    pub status: TriggerInvocationStatus,
    pub run_id: Option<String>,
    pub work_item_id: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl WorkItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemState::Pending => "PENDING",
            WorkItemState::InProgress => "IN_PROGRESS",
            WorkItemState::Done => "DONE",
            WorkItemState::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(WorkItemState::Pending),
            "IN_PROGRESS" => Some(WorkItemState::InProgress),
            "DONE" => Some(WorkItemState::Done),
            "FAILED" => Some(WorkItemState::Failed),
            _ => None,
        }
    }
}

/// A persistent queue entry processed by a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub queue_name: String,
    pub state: WorkItemState,
    pub payload_json: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub lease_owner: Option<String>,
    pub attempts: i64,
    pub exception_type: Option<String>,
    pub exception_code: Option<String>,
    pub exception_message: Option<String>,
}

/// Append-only record of an applied schema migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: i64,
    pub name: String,
}
