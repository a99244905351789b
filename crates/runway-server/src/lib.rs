use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Notify, RwLock};

use runway_core::{DecryptConfig, RunEngine};
use runway_queue::WorkItemQueue;
use runway_scheduler::{ExecutionDispatcher, SchedulerConfig, SchedulerEngine};
use runway_store::Db;
use runway_triggers::{TriggerDispatcher, TriggerEngine};
use runway_types::{EventBus, Result, Schedule, ServerError, Trigger};

mod http;
mod mcp;
mod openapi;

pub use http::app_router;

/// Sessions opened over the MCP SSE transport: session id -> the sender that
/// feeds frames down the event stream.
pub type McpSessions = Arc<RwLock<HashMap<String, mpsc::Sender<Value>>>>;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub run_engine: RunEngine,
    pub queue: WorkItemQueue,
    pub scheduler: Arc<SchedulerEngine>,
    pub triggers: Arc<TriggerEngine>,
    pub event_bus: EventBus,
    pub decrypt: DecryptConfig,
    pub api_key: Option<String>,
    pub expose_shutdown: bool,
    pub shutdown: Arc<Notify>,
    pub mcp_sessions: McpSessions,
}

impl AppState {
    pub fn new(
        db: Db,
        run_engine: RunEngine,
        event_bus: EventBus,
        api_key: Option<String>,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let queue = WorkItemQueue::new(db.clone(), event_bus.clone());
        let dispatcher = Arc::new(EngineDispatcher {
            db: db.clone(),
            run_engine: run_engine.clone(),
            queue: queue.clone(),
        });
        let scheduler = SchedulerEngine::new(
            db.clone(),
            dispatcher.clone(),
            event_bus.clone(),
            scheduler_config,
        );
        let triggers = TriggerEngine::new(db.clone(), dispatcher, event_bus.clone());
        Self {
            db,
            run_engine,
            queue,
            scheduler,
            triggers,
            event_bus,
            decrypt: DecryptConfig::from_env(),
            api_key,
            expose_shutdown: std::env::var("RC_ADD_SHUTDOWN_API")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            shutdown: Arc::new(Notify::new()),
            mcp_sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Bridges the scheduler and trigger engines onto the run engine and the
/// work-items queue. Runs are created synchronously and executed in their
/// own task; the dispatch result is the created id.
struct EngineDispatcher {
    db: Db,
    run_engine: RunEngine,
    queue: WorkItemQueue,
}

impl EngineDispatcher {
    async fn create_and_spawn_run(
        &self,
        action_id: Option<&str>,
        inputs: Value,
        request_id: String,
    ) -> Result<String> {
        let action_id = action_id.ok_or_else(|| {
            ServerError::Validation("no action_id configured".to_string())
        })?;
        let action = self.db.get_action(action_id).await?;
        if !action.enabled {
            return Err(ServerError::Validation(format!(
                "action {} is disabled",
                action.id
            )));
        }
        let run = self
            .run_engine
            .start_run(&action, &inputs, Some(request_id))
            .await?;
        let engine = self.run_engine.clone();
        let run_for_task = run.clone();
        tokio::spawn(async move {
            if let Err(err) = engine
                .execute_run(&run_for_task, &action, Map::new())
                .await
            {
                tracing::error!("background run {} failed: {err}", run_for_task.id);
            }
        });
        Ok(run.id)
    }
}

#[async_trait]
impl ExecutionDispatcher for EngineDispatcher {
    async fn dispatch_run(
        &self,
        schedule: &Schedule,
        inputs: Value,
        request_id: String,
    ) -> Result<String> {
        self.create_and_spawn_run(schedule.action_id.as_deref(), inputs, request_id)
            .await
    }

    async fn dispatch_work_item(&self, schedule: &Schedule, inputs: Value) -> Result<String> {
        let queue_name = schedule.work_item_queue.as_deref().unwrap_or("default");
        let mut payload = match inputs {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        payload.insert("_schedule_id".to_string(), json!(schedule.id));
        payload.insert("_schedule_name".to_string(), json!(schedule.name));
        let item = self
            .queue
            .seed_input(Value::Object(payload), queue_name)
            .await?;
        Ok(item.id)
    }
}

#[async_trait]
impl TriggerDispatcher for EngineDispatcher {
    async fn dispatch_run(
        &self,
        trigger: &Trigger,
        inputs: Value,
        request_id: String,
    ) -> Result<String> {
        self.create_and_spawn_run(trigger.action_id.as_deref(), inputs, request_id)
            .await
    }

    async fn dispatch_work_item(&self, trigger: &Trigger, inputs: Value) -> Result<String> {
        let queue_name = trigger.work_item_queue.as_deref().unwrap_or("default");
        let item = self.queue.seed_input(inputs, queue_name).await?;
        Ok(item.id)
    }
}

/// Serve the HTTP surface, with the scheduler loop running alongside.
/// Shutdown on ctrl-c or the gated shutdown endpoint; the scheduler task is
/// aborted once the listener drains, in-flight work finishes on its own.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    state.scheduler.initialize_next_runs().await?;
    let scheduler = tokio::spawn(state.scheduler.clone().run_loop());

    let shutdown = state.shutdown.clone();
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("action server listening on http://{addr}");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let ctrl_c = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            };
            tokio::select! {
                _ = shutdown.notified() => {}
                _ = ctrl_c => {}
            }
        })
        .await;
    scheduler.abort();
    result?;
    Ok(())
}
