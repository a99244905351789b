mod env;
mod kill;
mod pool;
mod runner;

pub use env::{BuiltEnvironment, EnvironmentManager};
pub use kill::kill_process_tree;
pub use pool::{PoolConfig, ProcessPool, WorkerLease, WorkerMessage};
pub use runner::RUNNER_FILE_NAME;
