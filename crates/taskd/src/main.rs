//! taskd - agent task orchestration daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use task_core::config::default_data_dir;
use task_core::{Config, ConflictPolicy};
use taskd::{Daemon, DaemonConfig, DEFAULT_PORT};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "taskd", about = "Agent task orchestration daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "TASKD_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Config file (key=value lines); defaults to <data-dir>/config when present
    #[arg(short, long, env = "TASKD_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for tasks, snapshots, run files and workspaces
    #[arg(long, env = "TASKD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Agent binary
    #[arg(long, env = "TASKD_AGENT_BIN")]
    agent_bin: Option<String>,

    /// Model passed to the agent
    #[arg(long, env = "TASKD_MODEL")]
    model: Option<String>,

    /// Reconciliation policy: memory_wins, disk_wins or newest_wins
    #[arg(long, value_parser = parse_policy)]
    conflict_policy: Option<ConflictPolicy>,

    /// Hand merge conflicts to the resolver agent by default
    #[arg(long)]
    auto_resolve: bool,

    /// Bearer token required by the HTTP API
    #[arg(long, env = "TASKD_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,
}

fn parse_policy(value: &str) -> Result<ConflictPolicy, String> {
    let mut config = Config::default();
    config
        .apply_value("conflict_policy", value)
        .map_err(|e| e.to_string())?;
    Ok(config.conflict_policy)
}

/// File values first, then CLI overrides.
fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut config = Config::default();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let file = cli.config.clone().or_else(|| {
        let candidate = data_dir.join("config");
        candidate.is_file().then_some(candidate)
    });
    if let Some(path) = &file {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
    }

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(bin) = &cli.agent_bin {
        config.agent_bin = bin.clone();
    }
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    if let Some(policy) = cli.conflict_policy {
        config.conflict_policy = policy;
    }
    if cli.auto_resolve {
        config.auto_resolve = true;
    }
    Ok(config)
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn watch_signals(token: CancellationToken) -> eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            () = token.cancelled() => return Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.wrap_err("failed to listen for ctrl-c")?;
                info!("received ctrl-c, initiating graceful shutdown");
            }
            () = token.cancelled() => return Ok(()),
        }
    }

    token.cancel();
    Ok(())
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DaemonConfig {
        engine: load_config(&cli)?,
        port: cli.port,
        auth_token: cli.auth_token.clone(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config)
            .await
            .wrap_err("failed to initialize daemon")?;
        let signals = tokio::spawn(watch_signals(daemon.shutdown_token()));
        let result = daemon.run().await.wrap_err("daemon error");
        signals.abort();
        result
    })
}
