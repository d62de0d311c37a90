use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use builder::config::loader::{self, Loaded};
use builder::health::run_health;
use builder::hook;
use builder::supervisor::Supervisor;
use clap::{Parser, Subcommand};
use git_ssh::auth::HttpIdentityService;
use git_ssh::repo::RepoStore;
use git_ssh::server::{load_host_keys, ssh_config};
use git_ssh::{AuthGateway, Circuit, Executor, ExecutorConfig, LockTable, ServerState, SshServer};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "builder")]
#[command(about = "SSH gateway accepting git pushes for the build platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SSH gateway and health endpoint
    Serve {
        /// Config file (defaults to discovery via BUILDER_CONFIG_PATH, builder.ron, /etc/builder/config.ron)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    #[command(subcommand)]
    Hook(HookCommands),
}

#[derive(Subcommand)]
enum HookCommands {
    /// Called by git before refs are updated
    PreReceive,
}

fn init_logging(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            init_logging("info");
            let loaded = loader::load(config.as_deref())?;
            serve(loaded).await
        }
        Commands::Hook(HookCommands::PreReceive) => {
            // Hook stderr is relayed to the pushing client.
            init_logging("warn");
            let config = hook::load_config(|name| std::env::var(name).ok())?;
            hook::pre_receive(&config).await
        }
    }
}

async fn serve(loaded: Loaded) -> Result<()> {
    let env = loaded.subprocess_env();
    let config = loaded.config;
    let keys = load_host_keys(&config.ssh.host_keys)?;

    let identity = HttpIdentityService::new(
        config.identity.url.clone(),
        config.identity.token(),
        config.identity.timeout(),
    )
    .context("failed to build identity client")?;

    tokio::fs::create_dir_all(&config.git.home)
        .await
        .with_context(|| format!("failed to create git home: {}", config.git.home.display()))?;

    let executor = Executor::new(
        RepoStore::new(config.git.home.clone()),
        Arc::new(LockTable::new()),
        ExecutorConfig {
            git_program: config.git.program.clone(),
            git_args: config.git.args.clone(),
            lock_timeout: config.ssh.lock_timeout(),
            env,
        },
    );
    let circuit = Arc::new(Circuit::new());
    let server = SshServer::new(
        ssh_config(keys, config.ssh.inactivity_timeout()),
        ServerState {
            gateway: AuthGateway::new(Arc::new(identity)),
            executor,
            circuit: circuit.clone(),
        },
    );

    let ssh_listener = TcpListener::bind(&config.ssh.listen)
        .await
        .with_context(|| format!("failed to bind ssh listener on {}", config.ssh.listen))?;
    let health_listener = TcpListener::bind(&config.health.listen)
        .await
        .with_context(|| format!("failed to bind health listener on {}", config.health.listen))?;

    let mut supervisor = Supervisor::new();
    supervisor.spawn("ssh", move |shutdown| server.serve(ssh_listener, shutdown));
    supervisor.spawn("health", move |shutdown| {
        run_health(health_listener, circuit, shutdown)
    });
    supervisor.run().await
}
