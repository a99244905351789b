use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use runway_core::RunEngine;
use runway_packages::{import_packages, ImportOptions};
use runway_runtime::{EnvironmentManager, PoolConfig, ProcessPool};
use runway_scheduler::SchedulerConfig;
use runway_server::{serve, AppState};
use runway_store::Db;
use runway_types::{EventBus, ServerError};

#[derive(Parser, Debug)]
#[command(name = "runway")]
#[command(about = "Self-hosted action server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve imported action packages over HTTP and MCP.
    Start {
        #[arg(long, env = "RUNWAY_DATADIR")]
        datadir: Option<PathBuf>,
        #[arg(long, default_value = "127.0.0.1")]
        address: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Re-import packages from --dir before serving.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        actions_sync: bool,
        /// Directory scanned for package manifests when --actions-sync is on.
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        min_processes: usize,
        #[arg(long, default_value_t = 4)]
        max_processes: usize,
        #[arg(long, default_value_t = false)]
        reuse_processes: bool,
        #[arg(long, env = "RUNWAY_API_KEY")]
        api_key: Option<String>,
        #[arg(long, default_value_t = false)]
        skip_lint: bool,
        /// Skip rcc and run packages with the ambient interpreter.
        #[arg(long, default_value_t = false)]
        devmode: bool,
        #[arg(long, default_value_t = false)]
        verbose: bool,
    },
    /// Import action packages into the database and exit.
    Import {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, env = "RUNWAY_DATADIR")]
        datadir: Option<PathBuf>,
        #[arg(long)]
        db_file: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        skip_lint: bool,
        #[arg(long, default_value_t = false)]
        devmode: bool,
        #[arg(long, default_value_t = false)]
        verbose: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = run(cli);
    std::process::exit(code);
}

fn run(cli: Cli) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return 3;
        }
    };
    let result = runtime.block_on(async {
        match cli.command {
            Command::Start {
                datadir,
                address,
                port,
                actions_sync,
                dir,
                min_processes,
                max_processes,
                reuse_processes,
                api_key,
                skip_lint,
                devmode,
                verbose,
            } => {
                init_logging(verbose);
                start(
                    resolve_datadir(datadir),
                    address,
                    port,
                    actions_sync,
                    dir,
                    PoolConfig {
                        min_processes,
                        max_processes,
                        reuse_processes,
                    },
                    api_key,
                    skip_lint,
                    devmode,
                )
                .await
            }
            Command::Import {
                dir,
                datadir,
                db_file,
                skip_lint,
                devmode,
                verbose,
            } => {
                init_logging(verbose);
                import(resolve_datadir(datadir), dir, db_file, skip_lint, devmode).await
            }
        }
    });

    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("{err:#}");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ServerError>() {
        Some(ServerError::Validation(_)) => 1,
        Some(ServerError::NotFound(_)) => 2,
        _ => 3,
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve_datadir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    dirs::data_dir()
        .map(|base| base.join("runway"))
        .unwrap_or_else(|| PathBuf::from(".runway"))
}

#[allow(clippy::too_many_arguments)]
async fn start(
    datadir: PathBuf,
    address: String,
    port: u16,
    actions_sync: bool,
    dir: Option<PathBuf>,
    pool_config: PoolConfig,
    api_key: Option<String>,
    skip_lint: bool,
    devmode: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&datadir).context("cannot create datadir")?;
    log_startup_paths(&datadir);

    let db = Db::open(&datadir.join("server.db")).await?;
    let envs = EnvironmentManager::new(&datadir, devmode);

    if actions_sync {
        let import_dir = dir.unwrap_or_else(|| PathBuf::from("."));
        let imported =
            import_packages(&db, &envs, &import_dir, ImportOptions { skip_lint }).await?;
        for package in &imported {
            info!(
                "package '{}': {} actions ({} disabled)",
                package.package.name,
                package.actions.len(),
                package.disabled
            );
        }
    }

    let addr: SocketAddr = format!("{address}:{port}")
        .parse()
        .context("invalid address or port")?;

    let mut pool = ProcessPool::new(pool_config, &datadir.join("runtime"))?;
    pool.set_base_env(runway_queue::adapter_env(
        &format!("http://{addr}"),
        api_key.as_deref(),
    ));
    let pool = Arc::new(pool);

    let event_bus = EventBus::new();
    let run_engine = RunEngine::new(db.clone(), pool.clone(), &datadir, event_bus.clone());
    let state = AppState::new(
        db,
        run_engine,
        event_bus,
        api_key,
        SchedulerConfig::default(),
    );

    if pool.config().reuse_processes {
        for package in state.db.list_action_packages().await? {
            if let Err(err) = pool
                .warm_up(&package.id, &package.directory, &package.env_json)
                .await
            {
                tracing::warn!("could not warm package '{}': {err}", package.name);
            }
        }
    }

    serve(addr, state).await?;
    pool.shutdown().await;
    Ok(())
}

async fn import(
    datadir: PathBuf,
    dir: PathBuf,
    db_file: Option<PathBuf>,
    skip_lint: bool,
    devmode: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&datadir).context("cannot create datadir")?;
    let db_path = db_file.unwrap_or_else(|| datadir.join("server.db"));
    let db = Db::open(&db_path).await?;
    let envs = EnvironmentManager::new(&datadir, devmode);

    let imported = import_packages(&db, &envs, &dir, ImportOptions { skip_lint }).await?;
    for package in &imported {
        info!(
            "imported package '{}' ({} actions, {} disabled)",
            package.package.name,
            package.actions.len(),
            package.disabled
        );
    }
    Ok(())
}

fn log_startup_paths(datadir: &PathBuf) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!(
        "startup paths: exe={} cwd={} datadir={}",
        exe.display(),
        cwd.display(),
        datadir.display()
    );
}
