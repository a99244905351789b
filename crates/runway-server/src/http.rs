use std::collections::HashMap;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use runway_core::ActionContext;
use runway_scheduler::compute_next_run;
use runway_triggers::WebhookOutcome;
use runway_types::{
    action_url_name, gen_id, now_iso, Action, DependencyMode, ExecutionMode, RunStatus, Schedule,
    ScheduleType, ServerError, Trigger, WorkItemState,
};

use crate::{mcp, openapi, AppState};

pub const RUN_ID_HEADER: &str = "x-action-server-run-id";

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    message: String,
}

fn error_response(err: ServerError) -> Response {
    let status = match &err {
        ServerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ServerError::NotFound(_) => StatusCode::NOT_FOUND,
        ServerError::Auth(_) => StatusCode::FORBIDDEN,
        ServerError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        ServerError::EnvironmentBuild(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServerError::Worker(_)
        | ServerError::Transport(_)
        | ServerError::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {err}");
    }
    (
        status,
        Json(ErrorEnvelope {
            message: err.to_string(),
        }),
    )
        .into_response()
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/openapi.json", get(openapi_doc))
        .route("/api/actionPackages", get(list_action_packages))
        .route("/api/actions/{package}/{action}/run", post(run_action))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/artifacts", get(list_run_artifacts))
        .route(
            "/api/runs/{id}/artifacts/text-content",
            get(artifact_text_content),
        )
        .route(
            "/api/runs/{id}/artifacts/binary-content",
            get(artifact_binary_content),
        )
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/api/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/api/schedules/{id}/executions", get(list_schedule_executions))
        .route("/api/schedules/{id}/run", post(run_schedule_now))
        .route("/api/triggers", get(list_triggers).post(create_trigger))
        .route(
            "/api/triggers/{id}",
            get(get_trigger).put(update_trigger).delete(delete_trigger),
        )
        .route("/api/triggers/{id}/invocations", get(list_trigger_invocations))
        .route("/api/triggers/{id}/webhook", post(trigger_webhook))
        .route("/api/workItems", get(list_work_items).post(seed_work_item))
        .route("/api/workItems/reserve", post(reserve_work_item))
        .route("/api/workItems/stats", get(work_item_stats))
        .route("/api/workItems/{id}/release", post(release_work_item))
        .route("/api/workItems/{id}/requeue", post(requeue_work_item))
        .route("/api/serverEvents", get(server_events))
        .route("/api/shutdown", post(shutdown_server))
        .route("/{package}/mcp", post(mcp::streamable_http))
        .route("/{package}/sse", get(mcp::sse_connect))
        .route("/{package}/sse/message", post(mcp::sse_message))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

/// API-key gate. The OpenAPI document stays public and trigger webhooks
/// authenticate with their HMAC instead.
async fn auth_gate(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    if path == "/openapi.json"
        || (path.starts_with("/api/triggers/") && path.ends_with("/webhook"))
    {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let trimmed = v.trim();
            trimmed
                .strip_prefix("Bearer ")
                .or_else(|| trimmed.strip_prefix("bearer "))
        })
        .map(str::trim);
    if provided == Some(expected) {
        return next.run(request).await;
    }
    (
        StatusCode::FORBIDDEN,
        Json(ErrorEnvelope {
            message: "Invalid API key".to_string(),
        }),
    )
        .into_response()
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

async fn openapi_doc(State(state): State<AppState>) -> Response {
    match openapi::build(&state).await {
        Ok(doc) => Json(doc).into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_action_packages(State(state): State<AppState>) -> Response {
    let packages = match state.db.list_action_packages().await {
        Ok(packages) => packages,
        Err(err) => return error_response(err),
    };
    let mut out = Vec::new();
    for package in packages {
        let actions = match state.db.list_actions(&package.id).await {
            Ok(actions) => actions,
            Err(err) => return error_response(err),
        };
        out.push(json!({
            "id": package.id,
            "name": package.name,
            "environment_hash": package.environment_hash,
            "actions": actions.iter().map(|a| json!({
                "id": a.id,
                "name": a.name,
                "docs": a.docs,
                "file": a.file,
                "lineno": a.lineno,
                "enabled": a.enabled,
                "kind": a.kind,
                "is_consequential": a.is_consequential,
                "input_schema": parse_or_null(&a.input_schema),
                "output_schema": parse_or_null(&a.output_schema),
            })).collect::<Vec<_>>(),
        }));
    }
    Json(out).into_response()
}

fn parse_or_null(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

pub(crate) async fn resolve_action(
    state: &AppState,
    package_name: &str,
    action_name: &str,
) -> Result<Action, ServerError> {
    let package = state.db.get_action_package_by_name(package_name).await?;
    let wanted = action_url_name(action_name);
    let actions = state.db.list_actions(&package.id).await?;
    actions
        .into_iter()
        .find(|a| a.enabled && action_url_name(&a.name) == wanted)
        .ok_or_else(|| {
            ServerError::NotFound(format!(
                "action not found: {package_name}/{action_name}"
            ))
        })
}

async fn run_action(
    State(state): State<AppState>,
    Path((package_name, action_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let inputs = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let action = match resolve_action(&state, &package_name, &action_name).await {
        Ok(action) => action,
        Err(err) => return error_response(err),
    };

    let header_map = headers_to_map(&headers);
    let context = match ActionContext::from_headers(&header_map, &state.decrypt) {
        Ok(context) => context,
        Err(err) => return error_response(err),
    };
    let managed = ActionContext::managed_param_values(
        context.as_ref(),
        action.managed_params_json.as_deref(),
        &header_map,
    );

    let run = match state.run_engine.start_run(&action, &inputs, None).await {
        Ok(run) => run,
        Err(err) => return error_response(err),
    };
    let finished = match state.run_engine.execute_run(&run, &action, managed).await {
        Ok(finished) => finished,
        Err(err) => {
            let mut response = error_response(err);
            attach_run_id(&mut response, &run.id);
            return response;
        }
    };

    let mut response = if finished.status == RunStatus::Passed {
        let body = finished
            .result
            .as_deref()
            .map(parse_or_null)
            .unwrap_or(Value::Null);
        Json(body).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorEnvelope {
                message: finished
                    .error_message
                    .unwrap_or_else(|| "action failed".to_string()),
            }),
        )
            .into_response()
    };
    attach_run_id(&mut response, &finished.id);
    response
}

fn attach_run_id(response: &mut Response, run_id: &str) {
    if let Ok(value) = run_id.parse() {
        response.headers_mut().insert(RUN_ID_HEADER, value);
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    limit: Option<i64>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Response {
    match state.db.list_runs(query.limit).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.get_run(&id).await {
        Ok(run) => {
            let mut response = Json(&run).into_response();
            attach_run_id(&mut response, &run.id);
            response
        }
        Err(err) => error_response(err),
    }
}

async fn list_run_artifacts(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let run = match state.db.get_run(&id).await {
        Ok(run) => run,
        Err(err) => return error_response(err),
    };
    match runway_core::list_artifacts(state.run_engine.artifacts_root(), &run) {
        Ok(names) => Json(names).into_response(),
        Err(err) => error_response(err),
    }
}

async fn artifact_text_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let run = match state.db.get_run(&id).await {
        Ok(run) => run,
        Err(err) => return error_response(err),
    };
    let names: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "artifact_names")
        .map(|(_, v)| v.clone())
        .collect();
    let regexp = params
        .iter()
        .find(|(k, _)| k == "artifact_name_regexp")
        .map(|(_, v)| v.as_str());
    match runway_core::read_text_artifacts(
        state.run_engine.artifacts_root(),
        &run,
        &names,
        regexp,
    ) {
        Ok(contents) => Json(contents).into_response(),
        Err(err) => error_response(err),
    }
}

async fn artifact_binary_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let run = match state.db.get_run(&id).await {
        Ok(run) => run,
        Err(err) => return error_response(err),
    };
    let Some(name) = params
        .iter()
        .find(|(k, _)| k == "artifact_name")
        .map(|(_, v)| v.clone())
    else {
        return error_response(ServerError::Validation(
            "artifact_name query parameter is required".to_string(),
        ));
    };
    match runway_core::read_binary_artifact(state.run_engine.artifacts_root(), &run, &name) {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

// --- Schedules ---

#[derive(Debug, Deserialize)]
struct ScheduleInput {
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    schedule_type: ScheduleType,
    cron_expression: Option<String>,
    interval_seconds: Option<i64>,
    weekday_config: Option<Value>,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    priority: i64,
    action_id: Option<String>,
    inputs: Option<Value>,
    #[serde(default = "default_execution_mode")]
    execution_mode: ExecutionMode,
    work_item_queue: Option<String>,
    #[serde(default = "default_one")]
    max_concurrent: i64,
    #[serde(default = "default_true")]
    skip_if_running: bool,
    depends_on_schedule_id: Option<String>,
    #[serde(default = "default_dependency_mode")]
    dependency_mode: DependencyMode,
    #[serde(default)]
    retry_enabled: bool,
    #[serde(default = "default_retry_attempts")]
    retry_max_attempts: i64,
    #[serde(default = "default_retry_delay")]
    retry_delay_seconds: f64,
    #[serde(default = "default_backoff")]
    retry_backoff_multiplier: f64,
    #[serde(default)]
    rate_limit_enabled: bool,
    rate_limit_max_per_hour: Option<i64>,
    rate_limit_max_per_day: Option<i64>,
    #[serde(default)]
    notify_on_success: bool,
    #[serde(default)]
    notify_on_failure: bool,
    notification_webhook_url: Option<String>,
    notification_email: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_one() -> i64 {
    1
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Run
}
fn default_dependency_mode() -> DependencyMode {
    DependencyMode::AfterSuccess
}
fn default_retry_attempts() -> i64 {
    3
}
fn default_retry_delay() -> f64 {
    60.0
}
fn default_backoff() -> f64 {
    2.0
}

impl ScheduleInput {
    fn into_schedule(self, id: String) -> Result<Schedule, ServerError> {
        match self.schedule_type {
            ScheduleType::Cron
                if self
                    .cron_expression
                    .as_deref()
                    .map(|e| e.trim().is_empty())
                    .unwrap_or(true) =>
            {
                return Err(ServerError::Validation(
                    "cron schedules require cron_expression".to_string(),
                ));
            }
            ScheduleType::Interval if self.interval_seconds.filter(|s| *s > 0).is_none() => {
                return Err(ServerError::Validation(
                    "interval schedules require interval_seconds > 0".to_string(),
                ));
            }
            ScheduleType::Weekday if self.weekday_config.is_none() => {
                return Err(ServerError::Validation(
                    "weekday schedules require weekday_config".to_string(),
                ));
            }
            _ => {}
        }
        let now = now_iso();
        Ok(Schedule {
            id,
            name: self.name,
            enabled: self.enabled,
            schedule_type: self.schedule_type,
            cron_expression: self.cron_expression,
            interval_seconds: self.interval_seconds,
            weekday_config_json: self.weekday_config.map(|c| c.to_string()),
            timezone: self.timezone,
            next_run_at: None,
            last_run_at: None,
            priority: self.priority,
            action_id: self.action_id,
            inputs_json: self.inputs.map(|i| i.to_string()),
            execution_mode: self.execution_mode,
            work_item_queue: self.work_item_queue,
            max_concurrent: self.max_concurrent.max(1),
            skip_if_running: self.skip_if_running,
            depends_on_schedule_id: self.depends_on_schedule_id,
            dependency_mode: self.dependency_mode,
            retry_enabled: self.retry_enabled,
            retry_max_attempts: self.retry_max_attempts.max(1),
            retry_delay_seconds: self.retry_delay_seconds.max(0.0),
            retry_backoff_multiplier: self.retry_backoff_multiplier.max(1.0),
            rate_limit_enabled: self.rate_limit_enabled,
            rate_limit_max_per_hour: self.rate_limit_max_per_hour,
            rate_limit_max_per_day: self.rate_limit_max_per_day,
            notify_on_success: self.notify_on_success,
            notify_on_failure: self.notify_on_failure,
            notification_webhook_url: self.notification_webhook_url,
            notification_email: self.notification_email,
            created_at: now.clone(),
            updated_at: now,
        })
    }
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(input): Json<ScheduleInput>,
) -> Response {
    let mut schedule = match input.into_schedule(gen_id("sched")) {
        Ok(schedule) => schedule,
        Err(err) => return error_response(err),
    };
    if schedule.enabled {
        match compute_next_run(&schedule, chrono::Utc::now()) {
            Ok(next) => {
                schedule.next_run_at = next.map(runway_types::datetime_to_iso);
            }
            Err(err) => return error_response(err),
        }
    }
    if let Err(err) = state.db.insert_schedule(&schedule).await {
        return error_response(err);
    }
    Json(schedule).into_response()
}

async fn list_schedules(State(state): State<AppState>) -> Response {
    match state.db.list_schedules().await {
        Ok(schedules) => Json(schedules).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.get_schedule(&id).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(err) => error_response(err),
    }
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ScheduleInput>,
) -> Response {
    let existing = match state.db.get_schedule(&id).await {
        Ok(existing) => existing,
        Err(err) => return error_response(err),
    };
    let mut schedule = match input.into_schedule(id) {
        Ok(schedule) => schedule,
        Err(err) => return error_response(err),
    };
    schedule.created_at = existing.created_at;
    schedule.last_run_at = existing.last_run_at;
    if schedule.enabled {
        match compute_next_run(&schedule, chrono::Utc::now()) {
            Ok(next) => schedule.next_run_at = next.map(runway_types::datetime_to_iso),
            Err(err) => return error_response(err),
        }
    }
    match state.db.update_schedule(&schedule).await {
        Ok(()) => Json(schedule).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.delete_schedule(&id).await {
        Ok(()) => Json(json!({"deleted": true})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ExecutionsQuery {
    limit: Option<i64>,
}

async fn list_schedule_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExecutionsQuery>,
) -> Response {
    if let Err(err) = state.db.get_schedule(&id).await {
        return error_response(err);
    }
    match state.db.list_executions(&id, query.limit.unwrap_or(100)).await {
        Ok(executions) => Json(executions).into_response(),
        Err(err) => error_response(err),
    }
}

async fn run_schedule_now(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.scheduler.run_now(&id).await {
        Ok(execution_id) => Json(json!({"execution_id": execution_id})).into_response(),
        Err(err) => error_response(err),
    }
}

// --- Triggers ---

#[derive(Debug, Deserialize)]
struct TriggerInput {
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    action_id: Option<String>,
    #[serde(default = "default_execution_mode")]
    execution_mode: ExecutionMode,
    work_item_queue: Option<String>,
    inputs_template: Option<Value>,
    webhook_secret: Option<String>,
    #[serde(default)]
    rate_limit_enabled: bool,
    #[serde(default = "default_rate_per_minute")]
    rate_limit_max_per_minute: i64,
}

fn default_rate_per_minute() -> i64 {
    60
}

impl TriggerInput {
    fn into_trigger(self, id: String) -> Trigger {
        let now = now_iso();
        Trigger {
            id,
            name: self.name,
            enabled: self.enabled,
            action_id: self.action_id,
            execution_mode: self.execution_mode,
            work_item_queue: self.work_item_queue,
            inputs_template_json: self.inputs_template.map(|t| t.to_string()),
            webhook_secret: self.webhook_secret,
            rate_limit_enabled: self.rate_limit_enabled,
            rate_limit_max_per_minute: self.rate_limit_max_per_minute.max(1),
            last_triggered_at: None,
            trigger_count: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

async fn create_trigger(
    State(state): State<AppState>,
    Json(input): Json<TriggerInput>,
) -> Response {
    let trigger = input.into_trigger(gen_id("trig"));
    match state.db.insert_trigger(&trigger).await {
        Ok(()) => Json(trigger).into_response(),
        Err(err) => error_response(err),
    }
}

async fn list_triggers(State(state): State<AppState>) -> Response {
    match state.db.list_triggers().await {
        Ok(triggers) => Json(triggers).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.get_trigger(&id).await {
        Ok(trigger) => Json(trigger).into_response(),
        Err(err) => error_response(err),
    }
}

async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<TriggerInput>,
) -> Response {
    let existing = match state.db.get_trigger(&id).await {
        Ok(existing) => existing,
        Err(err) => return error_response(err),
    };
    let mut trigger = input.into_trigger(id);
    trigger.created_at = existing.created_at;
    trigger.trigger_count = existing.trigger_count;
    trigger.last_triggered_at = existing.last_triggered_at;
    match state.db.update_trigger(&trigger).await {
        Ok(()) => Json(trigger).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.db.delete_trigger(&id).await {
        Ok(()) => Json(json!({"deleted": true})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct InvocationsQuery {
    limit: Option<i64>,
}

async fn list_trigger_invocations(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<InvocationsQuery>,
) -> Response {
    if let Err(err) = state.db.get_trigger(&id).await {
        return error_response(err);
    }
    match state
        .db
        .list_trigger_invocations(&id, query.limit.unwrap_or(100))
        .await
    {
        Ok(invocations) => Json(invocations).into_response(),
        Err(err) => error_response(err),
    }
}

async fn trigger_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).to_string()));
    let header_map = headers_to_map(&headers);
    let source_ip = header_map
        .get("x-forwarded-for")
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());

    let outcome = match state
        .triggers
        .handle_webhook(&id, payload, &body, header_map, source_ip)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return error_response(err),
    };

    match outcome {
        WebhookOutcome::Accepted {
            invocation_id,
            run_id,
            work_item_id,
        } => Json(json!({
            "status": "accepted",
            "invocation_id": invocation_id,
            "run_id": run_id,
            "work_item_id": work_item_id,
        }))
        .into_response(),
        WebhookOutcome::Rejected { message } => (
            StatusCode::FORBIDDEN,
            Json(ErrorEnvelope { message }),
        )
            .into_response(),
        WebhookOutcome::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorEnvelope {
                message: "Rate limit exceeded".to_string(),
            }),
        )
            .into_response(),
        WebhookOutcome::Error { message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorEnvelope { message }),
        )
            .into_response(),
        WebhookOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(ErrorEnvelope {
                message: format!("Trigger not found: {id}"),
            }),
        )
            .into_response(),
    }
}

// --- Work items ---

#[derive(Debug, Deserialize)]
struct SeedWorkItemInput {
    queue_name: String,
    payload: Value,
}

async fn seed_work_item(
    State(state): State<AppState>,
    Json(input): Json<SeedWorkItemInput>,
) -> Response {
    match state.queue.seed_input(input.payload, &input.queue_name).await {
        Ok(item) => Json(item).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct WorkItemsQuery {
    queue: Option<String>,
    state: Option<String>,
    limit: Option<i64>,
}

async fn list_work_items(
    State(state): State<AppState>,
    Query(query): Query<WorkItemsQuery>,
) -> Response {
    let Some(queue) = query.queue.as_deref() else {
        return error_response(ServerError::Validation(
            "queue query parameter is required".to_string(),
        ));
    };
    let item_state = match query.state.as_deref() {
        Some(raw) => match WorkItemState::parse(raw) {
            Some(parsed) => Some(parsed),
            None => {
                return error_response(ServerError::Validation(format!(
                    "unknown work item state: {raw}"
                )))
            }
        },
        None => None,
    };
    match state
        .queue
        .list(queue, item_state, query.limit.unwrap_or(100))
        .await
    {
        Ok(items) => Json(items).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReserveInput {
    queue_name: String,
    lease_owner: String,
}

async fn reserve_work_item(
    State(state): State<AppState>,
    Json(input): Json<ReserveInput>,
) -> Response {
    match state.queue.reserve(&input.queue_name, &input.lease_owner).await {
        Ok(Some(item)) => Json(json!({"status": "reserved", "item": item})).into_response(),
        Ok(None) => Json(json!({"status": "empty", "item": Value::Null})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseInput {
    state: String,
    exception_type: Option<String>,
    exception_code: Option<String>,
    exception_message: Option<String>,
}

async fn release_work_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ReleaseInput>,
) -> Response {
    let Some(target) = WorkItemState::parse(&input.state) else {
        return error_response(ServerError::Validation(format!(
            "unknown work item state: {}",
            input.state
        )));
    };
    let exception = match (&input.exception_type, &input.exception_message) {
        (None, None) => None,
        _ => Some((
            input.exception_type.clone().unwrap_or_default(),
            input.exception_code.clone().unwrap_or_default(),
            input.exception_message.clone().unwrap_or_default(),
        )),
    };
    match state.queue.release(&id, target, exception).await {
        Ok(()) => Json(json!({"released": true})).into_response(),
        Err(err) => error_response(err),
    }
}

async fn requeue_work_item(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.queue.requeue(&id).await {
        Ok(()) => Json(json!({"requeued": true})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct StatsQuery {
    queue: Option<String>,
}

async fn work_item_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let Some(queue) = query.queue.as_deref() else {
        return error_response(ServerError::Validation(
            "queue query parameter is required".to_string(),
        ));
    };
    match state.queue.stats(queue).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => error_response(err),
    }
}

// --- Events / lifecycle ---

fn event_stream(state: AppState) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.event_bus.subscribe();
    BroadcastStream::new(rx).filter_map(|message| match message {
        Ok(event) => {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    })
}

async fn server_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(event_stream(state))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownQuery {
    timeout: Option<u64>,
}

/// Gated by RC_ADD_SHUTDOWN_API; absent otherwise.
async fn shutdown_server(
    State(state): State<AppState>,
    Query(query): Query<ShutdownQuery>,
) -> Response {
    if !state.expose_shutdown {
        return error_response(ServerError::NotFound("not found".to_string()));
    }
    let delay = query.timeout.unwrap_or(0).min(300);
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
        shutdown.notify_waiters();
    });
    Json(json!({"shutting_down": true})).into_response()
}
