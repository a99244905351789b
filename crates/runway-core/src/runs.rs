use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;

use runway_runtime::{ProcessPool, WorkerLease, WorkerMessage};
use runway_store::Db;
use runway_types::{
    gen_id, now_iso, Action, ActionResponse, EventBus, Result, Run, RunStatus, RunType,
    ServerError, ServerEvent,
};

use crate::validate::{check_output, validate_input};

pub const INPUTS_FILE: &str = "__action_server_inputs.json";
pub const RESULT_FILE: &str = "__action_server_result.json";
pub const OUTPUT_FILE: &str = "__action_server_output.txt";

/// Orchestrates one invocation end to end: input validation, id allocation,
/// artifact capture, worker lease, output validation, terminal state.
#[derive(Clone)]
pub struct RunEngine {
    db: Db,
    pool: Arc<ProcessPool>,
    artifacts_root: PathBuf,
    event_bus: EventBus,
    lease_timeout: Duration,
    run_timeout: Option<Duration>,
}

struct Terminal {
    status: RunStatus,
    result: Option<String>,
    error_message: Option<String>,
}

impl RunEngine {
    pub fn new(db: Db, pool: Arc<ProcessPool>, datadir: &Path, event_bus: EventBus) -> Self {
        Self {
            db,
            pool,
            artifacts_root: datadir.join("artifacts"),
            event_bus,
            lease_timeout: Duration::from_secs(120),
            run_timeout: None,
        }
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn artifacts_root(&self) -> &Path {
        &self.artifacts_root
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Persist a new run in NOT_RUN: validated inputs written to the
    /// artifacts dir, dense numbered id allocated atomically.
    pub async fn start_run(
        &self,
        action: &Action,
        inputs: &Value,
        request_id: Option<String>,
    ) -> Result<Run> {
        if !action.enabled {
            return Err(ServerError::NotFound(format!(
                "action is disabled: {}",
                action.name
            )));
        }
        validate_input(&action.input_schema, inputs)?;

        let run_id = gen_id("run");
        let relative_artifacts_dir = format!("runs/{run_id}");
        let artifacts_dir = self.artifacts_root.join(&relative_artifacts_dir);
        tokio::fs::create_dir_all(&artifacts_dir).await?;
        tokio::fs::write(
            artifacts_dir.join(INPUTS_FILE),
            serde_json::to_string_pretty(inputs)?,
        )
        .await?;

        let mut run = Run {
            id: run_id,
            numbered_id: 0,
            status: RunStatus::NotRun,
            action_id: action.id.clone(),
            start_time: now_iso(),
            run_time: None,
            inputs: inputs.to_string(),
            result: None,
            error_message: None,
            relative_artifacts_dir,
            request_id,
            run_type: RunType::Action,
        };
        self.db.create_run(&mut run).await?;
        self.publish("run.created", &run);
        Ok(run)
    }

    /// Drive a NOT_RUN run to its terminal state.
    pub async fn execute_run(
        &self,
        run: &Run,
        action: &Action,
        managed_params: Map<String, Value>,
    ) -> Result<Run> {
        let package = self.db.get_action_package(&action.action_package_id).await?;
        self.db.mark_run_running(&run.id).await?;
        self.publish("run.running", run);

        let started = Instant::now();
        let terminal = match self
            .drive_worker(&package.id, &package.directory, &package.env_json, action, run, managed_params)
            .await
        {
            Ok(terminal) => terminal,
            // Worker-level failures still terminate the run with a synthetic
            // message; infrastructure errors before the worker was reached
            // propagate to the caller.
            Err(ServerError::Worker(message)) => Terminal {
                status: RunStatus::Failed,
                result: None,
                error_message: Some(message),
            },
            Err(other) => {
                let run_time = started.elapsed().as_secs_f64();
                let message = other.to_string();
                self.db
                    .finish_run(&run.id, RunStatus::Failed, run_time, None, Some(&message))
                    .await?;
                let failed = self.db.get_run(&run.id).await?;
                self.publish("run.finished", &failed);
                return Err(other);
            }
        };

        let run_time = started.elapsed().as_secs_f64();
        self.db
            .finish_run(
                &run.id,
                terminal.status,
                run_time,
                terminal.result.as_deref(),
                terminal.error_message.as_deref(),
            )
            .await?;
        let finished = self.db.get_run(&run.id).await?;
        self.publish("run.finished", &finished);
        Ok(finished)
    }

    /// start_run + execute_run in one call; the path schedules and triggers
    /// use.
    pub async fn run_action(
        &self,
        action: &Action,
        inputs: &Value,
        request_id: Option<String>,
        managed_params: Map<String, Value>,
    ) -> Result<Run> {
        let run = self.start_run(action, inputs, request_id).await?;
        self.execute_run(&run, action, managed_params).await
    }

    async fn drive_worker(
        &self,
        package_id: &str,
        package_dir: &str,
        env_json: &str,
        action: &Action,
        run: &Run,
        managed_params: Map<String, Value>,
    ) -> Result<Terminal> {
        let mut lease = self
            .pool
            .lease(package_id, package_dir, env_json, self.lease_timeout)
            .await?;

        let artifacts_dir = self.artifacts_root.join(&run.relative_artifacts_dir);
        let action_file = Path::new(package_dir).join(&action.file);
        let inputs: Value = serde_json::from_str(&run.inputs)?;
        let request = json!({
            "action_name": action.name,
            "file": action_file.to_string_lossy(),
            "inputs": inputs,
            "managed_params": Value::Object(managed_params),
            "artifacts_dir": artifacts_dir.to_string_lossy(),
        });
        lease.send(&request).await?;

        let mut output = tokio::fs::File::create(artifacts_dir.join(OUTPUT_FILE)).await?;
        let deadline = self.run_timeout.map(|t| Instant::now() + t);

        loop {
            let message = match next_with_deadline(&mut lease, deadline).await {
                Ok(message) => message,
                Err(TimeoutOrWorker::Timeout) => {
                    lease.kill().await;
                    return Ok(Terminal {
                        status: RunStatus::Failed,
                        result: None,
                        error_message: Some(format!(
                            "action did not finish within {:?} and its worker was killed",
                            self.run_timeout.unwrap_or_default()
                        )),
                    });
                }
                Err(TimeoutOrWorker::Worker(message)) => {
                    lease.kill().await;
                    return Ok(Terminal {
                        status: RunStatus::Failed,
                        result: None,
                        error_message: Some(format!(
                            "worker process terminated unexpectedly: {message}"
                        )),
                    });
                }
            };

            match message {
                WorkerMessage::Output(line) => {
                    output.write_all(line.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                }
                WorkerMessage::Error(user_error) => {
                    output.flush().await?;
                    lease.release(true).await;
                    return Ok(Terminal {
                        status: RunStatus::Failed,
                        result: None,
                        error_message: Some(user_error),
                    });
                }
                WorkerMessage::Result(value) => {
                    output.flush().await?;
                    lease.release(true).await;
                    return self.settle_result(&artifacts_dir, action, value).await;
                }
            }
        }
    }

    async fn settle_result(
        &self,
        artifacts_dir: &Path,
        action: &Action,
        value: Value,
    ) -> Result<Terminal> {
        // The Response envelope is the preferred error-signaling path: the
        // run PASSES and the error travels inside the stored result.
        if ActionResponse::matches(&value) {
            let serialized = value.to_string();
            tokio::fs::write(
                artifacts_dir.join(RESULT_FILE),
                serde_json::to_string_pretty(&value)?,
            )
            .await?;
            return Ok(Terminal {
                status: RunStatus::Passed,
                result: Some(serialized),
                error_message: None,
            });
        }

        match check_output(&action.output_schema, &value) {
            Ok(()) => {
                let serialized = value.to_string();
                tokio::fs::write(
                    artifacts_dir.join(RESULT_FILE),
                    serde_json::to_string_pretty(&value)?,
                )
                .await?;
                Ok(Terminal {
                    status: RunStatus::Passed,
                    result: Some(serialized),
                    error_message: None,
                })
            }
            Err(message) => Ok(Terminal {
                status: RunStatus::Failed,
                result: None,
                error_message: Some(message),
            }),
        }
    }

    fn publish(&self, event_type: &str, run: &Run) {
        self.event_bus.publish(ServerEvent::new(
            event_type,
            json!({
                "run_id": run.id,
                "numbered_id": run.numbered_id,
                "action_id": run.action_id,
                "status": run.status,
            }),
        ));
    }
}

enum TimeoutOrWorker {
    Timeout,
    Worker(String),
}

async fn next_with_deadline(
    lease: &mut WorkerLease,
    deadline: Option<Instant>,
) -> std::result::Result<WorkerMessage, TimeoutOrWorker> {
    let next = lease.next_message();
    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TimeoutOrWorker::Timeout);
            }
            match tokio::time::timeout(remaining, next).await {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(err)) => Err(TimeoutOrWorker::Worker(err.to_string())),
                Err(_) => Err(TimeoutOrWorker::Timeout),
            }
        }
        None => next
            .await
            .map_err(|err| TimeoutOrWorker::Worker(err.to_string())),
    }
}
