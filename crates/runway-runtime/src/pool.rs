use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use runway_types::{Result, ServerError};

use crate::kill::kill_process_tree;
use crate::runner::{RUNNER_FILE_NAME, RUNNER_PY};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_processes: usize,
    pub max_processes: usize,
    pub reuse_processes: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_processes: 0,
            max_processes: 4,
            reuse_processes: false,
        }
    }
}

/// A line read from a worker: either streamed action output or the terminal
/// result/error frame.
#[derive(Debug)]
pub enum WorkerMessage {
    Output(String),
    Result(Value),
    Error(String),
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
    pid: u32,
}

impl Worker {
    async fn spawn(
        python_exe: &str,
        runner_path: &PathBuf,
        env: &HashMap<String, String>,
        package_dir: &str,
    ) -> Result<Self> {
        let mut command = Command::new(python_exe);
        command
            .arg("-u")
            .arg(runner_path)
            .current_dir(package_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }
        // The package directory must be importable for relative imports in
        // user action files.
        let pythonpath = match env.get("PYTHONPATH") {
            Some(existing) if !existing.is_empty() => {
                format!("{package_dir}{}{existing}", path_separator())
            }
            _ => package_dir.to_string(),
        };
        command.env("PYTHONPATH", pythonpath);

        let mut child = command
            .spawn()
            .map_err(|e| ServerError::Worker(format!("failed to spawn worker: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| ServerError::Worker("worker exited during spawn".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServerError::Worker("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::Worker("worker stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        let mut worker = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            pid,
        };
        worker.await_ready().await?;
        Ok(worker)
    }

    async fn await_ready(&mut self) -> Result<()> {
        let line = tokio::time::timeout(Duration::from_secs(60), self.stdout.next_line())
            .await
            .map_err(|_| ServerError::Worker("worker did not become ready".to_string()))?
            .map_err(|e| ServerError::Worker(e.to_string()))?
            .ok_or_else(|| ServerError::Worker("worker closed stdout during boot".to_string()))?;
        let frame: Value = serde_json::from_str(&line)
            .map_err(|_| ServerError::Worker(format!("unexpected worker boot line: {line}")))?;
        if frame.get("ready").and_then(|v| v.as_bool()) != Some(true) {
            return Err(ServerError::Worker(format!(
                "worker boot handshake failed: {line}"
            )));
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn send(&mut self, request: &Value) -> Result<()> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ServerError::Worker(format!("worker stdin write failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ServerError::Worker(format!("worker stdin flush failed: {e}")))?;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<WorkerMessage> {
        let line = self
            .stdout
            .next_line()
            .await
            .map_err(|e| ServerError::Worker(e.to_string()))?
            .ok_or_else(|| ServerError::Worker("worker process closed its stdout".to_string()))?;
        if let Ok(frame) = serde_json::from_str::<Value>(&line) {
            if let Some(obj) = frame.as_object() {
                if obj.len() == 1 {
                    if let Some(error) = obj.get("error").and_then(|v| v.as_str()) {
                        return Ok(WorkerMessage::Error(error.to_string()));
                    }
                    if let Some(result) = obj.get("result") {
                        return Ok(WorkerMessage::Result(result.clone()));
                    }
                }
            }
        }
        Ok(WorkerMessage::Output(line))
    }

    async fn kill(mut self) {
        kill_process_tree(self.pid).await;
        let _ = self.child.wait().await;
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr, pid: u32) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(worker = pid, "worker stderr: {line}");
    }
}

#[cfg(windows)]
fn path_separator() -> char {
    ';'
}

#[cfg(not(windows))]
fn path_separator() -> char {
    ':'
}

struct PackagePool {
    package_id: String,
    python_exe: String,
    env: HashMap<String, String>,
    package_dir: String,
    idle: Mutex<Vec<Worker>>,
    slots: Arc<Semaphore>,
}

/// Long-lived worker subprocesses, pooled per action package when process
/// reuse is enabled. `lease` blocks (bounded) until a pool slot frees up;
/// `release` decides between returning the worker and discarding it.
pub struct ProcessPool {
    config: PoolConfig,
    runner_path: PathBuf,
    base_env: HashMap<String, String>,
    pools: Mutex<HashMap<String, Arc<PackagePool>>>,
}

/// A leased worker plus its pool slot. Dropping the lease without releasing
/// kills the worker, so a crashed caller cannot leak a slot's process.
pub struct WorkerLease {
    worker: Option<Worker>,
    pool: Arc<PackagePool>,
    _permit: OwnedSemaphorePermit,
    reusable: bool,
}

impl WorkerLease {
    pub async fn send(&mut self, request: &Value) -> Result<()> {
        self.worker_mut()?.send(request).await
    }

    pub async fn next_message(&mut self) -> Result<WorkerMessage> {
        self.worker_mut()?.next_message().await
    }

    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.pid)
    }

    fn worker_mut(&mut self) -> Result<&mut Worker> {
        self.worker
            .as_mut()
            .ok_or_else(|| ServerError::Worker("worker already released".to_string()))
    }

    /// Return the worker to the pool (healthy) or kill it. Consumes the
    /// lease; the slot frees when the permit drops.
    pub async fn release(mut self, healthy: bool) {
        if let Some(mut worker) = self.worker.take() {
            if healthy && self.reusable && worker.is_alive() {
                self.pool.idle.lock().await.push(worker);
            } else {
                worker.kill().await;
            }
        }
    }

    /// Kill the worker subtree outright (run cancellation / timeout).
    pub async fn kill(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.kill().await;
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let pid = worker.pid;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { worker.kill().await });
            }
            tracing::warn!("worker {pid} leaked by caller; killed");
        }
    }
}

impl ProcessPool {
    pub fn new(config: PoolConfig, datadir: &std::path::Path) -> Result<Self> {
        let runner_path = datadir.join(RUNNER_FILE_NAME);
        std::fs::create_dir_all(datadir)?;
        std::fs::write(&runner_path, RUNNER_PY)?;
        Ok(Self {
            config,
            runner_path,
            base_env: HashMap::new(),
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Extra variables injected into every worker (work-items adapter wiring,
    /// server URL, API key).
    pub fn set_base_env(&mut self, base_env: HashMap<String, String>) {
        self.base_env = base_env;
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    async fn package_pool(
        &self,
        package_id: &str,
        package_dir: &str,
        env_json: &str,
    ) -> Result<Arc<PackagePool>> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(package_id) {
            return Ok(pool.clone());
        }

        let mut env: HashMap<String, String> = serde_json::from_str(env_json)
            .map_err(|e| ServerError::EnvironmentBuild(format!("bad env_json: {e}")))?;
        for (key, value) in &self.base_env {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let python_exe = env.get("PYTHON_EXE").cloned().ok_or_else(|| {
            ServerError::EnvironmentBuild(format!(
                "package {package_id} has no PYTHON_EXE in its environment"
            ))
        })?;

        let pool = Arc::new(PackagePool {
            package_id: package_id.to_string(),
            python_exe,
            env,
            package_dir: package_dir.to_string(),
            idle: Mutex::new(Vec::new()),
            slots: Arc::new(Semaphore::new(self.config.max_processes.max(1))),
        });
        pools.insert(package_id.to_string(), pool.clone());
        Ok(pool)
    }

    /// Spawn `min_processes` idle workers ahead of traffic.
    pub async fn warm_up(&self, package_id: &str, package_dir: &str, env_json: &str) -> Result<()> {
        if !self.config.reuse_processes || self.config.min_processes == 0 {
            return Ok(());
        }
        let pool = self.package_pool(package_id, package_dir, env_json).await?;
        let mut idle = pool.idle.lock().await;
        while idle.len() < self.config.min_processes {
            let worker = Worker::spawn(
                &pool.python_exe,
                &self.runner_path,
                &pool.env,
                &pool.package_dir,
            )
            .await?;
            tracing::debug!(
                "warmed worker {} for package {}",
                worker.pid,
                pool.package_id
            );
            idle.push(worker);
        }
        Ok(())
    }

    /// Lease an idle worker for the package, spawning one when the pool has
    /// a free slot, blocking up to `timeout` otherwise.
    pub async fn lease(
        &self,
        package_id: &str,
        package_dir: &str,
        env_json: &str,
        timeout: Duration,
    ) -> Result<WorkerLease> {
        let pool = self.package_pool(package_id, package_dir, env_json).await?;
        let permit = tokio::time::timeout(timeout, pool.slots.clone().acquire_owned())
            .await
            .map_err(|_| {
                ServerError::Worker(format!(
                    "no worker available for package {package_id} within {timeout:?}"
                ))
            })?
            .map_err(|_| ServerError::Worker("worker pool is shut down".to_string()))?;

        // Reuse an idle worker if it is still alive; dead ones are discarded
        // until a live one or an empty list remains.
        loop {
            let candidate = pool.idle.lock().await.pop();
            let Some(mut worker) = candidate else { break };
            if worker.is_alive() {
                return Ok(WorkerLease {
                    worker: Some(worker),
                    pool,
                    _permit: permit,
                    reusable: self.config.reuse_processes,
                });
            }
            worker.kill().await;
        }

        let worker = Worker::spawn(
            &pool.python_exe,
            &self.runner_path,
            &pool.env,
            &pool.package_dir,
        )
        .await?;
        Ok(WorkerLease {
            worker: Some(worker),
            pool,
            _permit: permit,
            reusable: self.config.reuse_processes,
        })
    }

    /// Kill every idle worker. In-flight leases die with their leases.
    pub async fn shutdown(&self) {
        let pools = self.pools.lock().await;
        for pool in pools.values() {
            let mut idle = pool.idle.lock().await;
            for worker in idle.drain(..) {
                worker.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn python_exe() -> Option<String> {
        for candidate in ["python3", "python"] {
            let found = std::process::Command::new(candidate)
                .arg("--version")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if found {
                return Some(candidate.to_string());
            }
        }
        None
    }

    fn env_json(python: &str) -> String {
        json!({ "PYTHON_EXE": python }).to_string()
    }

    #[tokio::test]
    async fn worker_round_trips_an_action_call() {
        let Some(python) = python_exe() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let package_dir = dir.path().join("pkg");
        std::fs::create_dir_all(&package_dir).expect("mkdir");
        std::fs::write(
            package_dir.join("actions.py"),
            "def add(v1, v2):\n    print('adding')\n    return v1 + v2\n",
        )
        .expect("write action");

        let pool = ProcessPool::new(
            PoolConfig {
                min_processes: 0,
                max_processes: 1,
                reuse_processes: true,
            },
            dir.path(),
        )
        .expect("pool");

        let mut lease = pool
            .lease(
                "ap-test",
                package_dir.to_str().unwrap(),
                &env_json(&python),
                Duration::from_secs(30),
            )
            .await
            .expect("lease");

        let artifacts = dir.path().join("artifacts");
        lease
            .send(&json!({
                "action_name": "add",
                "file": package_dir.join("actions.py").to_str().unwrap(),
                "inputs": {"v1": 1.0, "v2": 2.0},
                "managed_params": {},
                "artifacts_dir": artifacts.to_str().unwrap(),
            }))
            .await
            .expect("send");

        let mut output_lines = Vec::new();
        let result = loop {
            match lease.next_message().await.expect("message") {
                WorkerMessage::Output(line) => output_lines.push(line),
                WorkerMessage::Result(value) => break value,
                WorkerMessage::Error(err) => panic!("unexpected error: {err}"),
            }
        };
        assert_eq!(result, json!(3.0));
        assert_eq!(output_lines, vec!["adding".to_string()]);
        lease.release(true).await;
    }

    #[tokio::test]
    async fn user_exception_surfaces_as_error_frame() {
        let Some(python) = python_exe() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let package_dir = dir.path().join("pkg");
        std::fs::create_dir_all(&package_dir).expect("mkdir");
        std::fs::write(
            package_dir.join("actions.py"),
            "def explode():\n    raise RuntimeError('user message')\n",
        )
        .expect("write action");

        let pool = ProcessPool::new(PoolConfig::default(), dir.path()).expect("pool");
        let mut lease = pool
            .lease(
                "ap-test",
                package_dir.to_str().unwrap(),
                &env_json(&python),
                Duration::from_secs(30),
            )
            .await
            .expect("lease");

        lease
            .send(&json!({
                "action_name": "explode",
                "file": package_dir.join("actions.py").to_str().unwrap(),
                "inputs": {},
                "managed_params": {},
            }))
            .await
            .expect("send");

        match lease.next_message().await.expect("message") {
            WorkerMessage::Error(err) => assert_eq!(err, "user message"),
            other => panic!("expected error frame, got {other:?}"),
        }
        lease.release(false).await;
    }

    #[tokio::test]
    async fn lease_times_out_when_slots_are_exhausted() {
        let Some(python) = python_exe() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let package_dir = dir.path().join("pkg");
        std::fs::create_dir_all(&package_dir).expect("mkdir");

        let pool = ProcessPool::new(
            PoolConfig {
                min_processes: 0,
                max_processes: 1,
                reuse_processes: true,
            },
            dir.path(),
        )
        .expect("pool");

        let held = pool
            .lease(
                "ap-test",
                package_dir.to_str().unwrap(),
                &env_json(&python),
                Duration::from_secs(30),
            )
            .await
            .expect("first lease");

        let second = pool
            .lease(
                "ap-test",
                package_dir.to_str().unwrap(),
                &env_json(&python),
                Duration::from_millis(100),
            )
            .await;
        assert!(second.is_err());
        held.release(true).await;
    }
}
