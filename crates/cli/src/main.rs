use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use commander::{run_commander, CommanderConfig};
use common::{Broker, MemoryBroker, MeshBroker, MeshConfig};
use soldier::{run_soldier, SoldierConfig};

#[derive(Debug, Parser)]
#[command(name = "muster")]
#[command(about = "Commander/soldier mission dispatch", version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a commander: HTTP API, token authority and status reconciler
    Commander(CommanderArgs),
    /// Run a soldier worker for one commander
    Soldier(SoldierArgs),
    /// Run a commander and soldiers in one process over an in-memory broker
    Local(LocalArgs),
}

#[derive(Debug, Args)]
struct MeshArgs {
    /// Multiaddr to listen on (repeatable)
    #[arg(long = "listen", value_name = "MULTIADDR")]
    listen: Vec<String>,
    /// Peer multiaddr to dial at startup (repeatable)
    #[arg(long = "bootstrap", value_name = "MULTIADDR")]
    bootstrap: Vec<String>,
    /// Disable mDNS peer discovery
    #[arg(long, default_value_t = false)]
    no_mdns: bool,
}

impl MeshArgs {
    fn apply(&self, mesh: &mut MeshConfig) {
        if !self.listen.is_empty() {
            mesh.listen = self.listen.clone();
        }
        mesh.bootstrap.extend(self.bootstrap.iter().cloned());
        if self.no_mdns {
            mesh.mdns = false;
        }
    }
}

#[derive(Debug, Args)]
struct CommanderArgs {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "COMMANDER_NAME")]
    name: Option<String>,
    #[arg(long, env = "COMMANDER_BIND")]
    bind: Option<SocketAddr>,
    /// Shared secret soldiers present when rotating tokens
    #[arg(long, env = "MUSTER_ROTATION_SECRET", hide_env_values = true)]
    secret: Option<String>,
    #[command(flatten)]
    mesh: MeshArgs,
}

#[derive(Debug, Args)]
struct SoldierArgs {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, env = "SOLDIER_NAME")]
    name: Option<String>,
    #[arg(long, env = "COMMANDER_NAME")]
    commander: Option<String>,
    /// Commander base URL, e.g. http://commander1:8080
    #[arg(long, env = "COMMANDER_URL")]
    commander_url: Option<String>,
    #[arg(long, env = "MUSTER_ROTATION_SECRET", hide_env_values = true)]
    secret: Option<String>,
    /// Missions executed at once
    #[arg(long)]
    concurrency: Option<usize>,
    /// Serve GET /metrics on this address
    #[arg(long)]
    metrics_bind: Option<SocketAddr>,
    #[command(flatten)]
    mesh: MeshArgs,
}

#[derive(Debug, Args)]
struct LocalArgs {
    #[arg(long, default_value = "commander1")]
    commander: String,
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
    /// Soldier to start (repeatable)
    #[arg(long = "soldier", default_value = "soldier1")]
    soldiers: Vec<String>,
    #[arg(long, default_value_t = 2)]
    concurrency: usize,
    #[arg(long, default_value_t = 5)]
    min_work_secs: u64,
    #[arg(long, default_value_t = 15)]
    max_work_secs: u64,
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Commander(args) => commander(args).await,
        Commands::Soldier(args) => soldier(args).await,
        Commands::Local(args) => local(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn commander(args: CommanderArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => CommanderConfig::from_file(path)?,
        None => CommanderConfig::default(),
    };
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(secret) = args.secret {
        config.rotation_secret = secret;
    }
    args.mesh.apply(&mut config.mesh);
    config.validate()?;

    let broker = MeshBroker::start(&config.mesh)
        .await
        .context("starting mesh broker")?;
    info!(peer_id=%broker.local_peer_id(), "mesh broker ready");
    run_commander(config, Arc::new(broker), setup_shutdown_handler()).await
}

async fn soldier(args: SoldierArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SoldierConfig::from_file(path)?,
        None => SoldierConfig::default(),
    };
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(commander) = args.commander {
        config.commander = commander;
    }
    if let Some(url) = args.commander_url {
        config.commander_url = Some(url);
    }
    if let Some(secret) = args.secret {
        config.rotation_secret = secret;
    }
    if let Some(n) = args.concurrency {
        config.concurrency = n;
    }
    if let Some(addr) = args.metrics_bind {
        config.metrics_bind = Some(addr);
    }
    args.mesh.apply(&mut config.mesh);
    config.validate()?;

    let broker = MeshBroker::start(&config.mesh)
        .await
        .context("starting mesh broker")?;
    info!(peer_id=%broker.local_peer_id(), "mesh broker ready");
    run_soldier(config, Arc::new(broker), setup_shutdown_handler()).await
}

async fn local(args: LocalArgs) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let (stop_tx, stop_rx) = watch::channel(false);

    let commander_config = CommanderConfig {
        name: args.commander.clone(),
        bind: args.bind,
        ..CommanderConfig::default()
    };
    let url = format!("http://127.0.0.1:{}", args.bind.port());
    let mut commander = tokio::spawn(run_commander(
        commander_config,
        broker.clone(),
        stopped(stop_rx.clone()),
    ));

    let mut soldiers = Vec::new();
    for name in &args.soldiers {
        let config = SoldierConfig {
            name: name.clone(),
            commander: args.commander.clone(),
            commander_url: Some(url.clone()),
            concurrency: args.concurrency,
            min_work_secs: args.min_work_secs,
            max_work_secs: args.max_work_secs,
            failure_rate: args.failure_rate,
            ..SoldierConfig::default()
        };
        config.validate()?;
        soldiers.push((
            name.clone(),
            tokio::spawn(run_soldier(config, broker.clone(), stopped(stop_rx.clone()))),
        ));
    }
    println!("muster local: commander '{}' on {url}, soldiers {:?}", args.commander, args.soldiers);

    let early = tokio::select! {
        _ = setup_shutdown_handler() => None,
        res = &mut commander => Some(res),
    };
    let _ = stop_tx.send(true);

    for (name, handle) in soldiers {
        match handle.await {
            Ok(Ok(())) => info!(soldier=%name, "soldier stopped"),
            Ok(Err(e)) => warn!(soldier=%name, error=%e, "soldier exited with error"),
            Err(e) => warn!(soldier=%name, error=%e, "soldier task failed"),
        }
    }
    let result = match early {
        Some(res) => res,
        None => commander.await,
    };
    result.map_err(|e| anyhow!("commander task failed: {e}"))?
}

/// Resolves once `rx` has seen `true` or its sender is gone.
fn stopped(mut rx: watch::Receiver<bool>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error=%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error=%e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
