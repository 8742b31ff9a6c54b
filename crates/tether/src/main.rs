use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{debug, info};

use tether::api::{create_router, ApiSettings, AppState};
use tether::bus::EventBus;
use tether::settings::{default_config_path, AppConfig};
use tether::db::Database;
use tether::mailbox::{MailboxRepository, MailboxService};
use tether::sandbox::{
    HttpSandbox, LocalSandbox, SandboxApi, SandboxSupervisor, SupervisorConfig,
};
use tether::session::{
    SessionRegistry, SessionRepository, SessionService, SessionServiceConfig,
};
use tether::tasks::{TaskRepository, TaskService};
use tether::workflow::{
    SessionStepEffects, WorkflowEngine, WorkflowRepository, WorkflowService,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common)?;

    match cli.command {
        Command::Serve(cmd) => run_serve(cli.common, cmd),
        Command::Init(cmd) => handle_init(cli.common, cmd),
        Command::Config { command } => handle_config(cli.common, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tether - control plane for sandboxed coding agents.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Create config directories and a default config file
    Init(InitCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Override the listen host
    #[arg(long)]
    host: Option<String>,
    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the resolved configuration
    Show,
    /// Print the config file path
    Path,
}

fn init_logging(opts: &CommonOpts) -> Result<()> {
    let level = if opts.trace {
        "trace"
    } else if opts.quiet {
        "error"
    } else {
        match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("tether={level},info")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initializing logging: {err}"))?;
    Ok(())
}

#[tokio::main]
async fn run_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    let mut config = AppConfig::load(common.config.as_deref())?;
    if let Some(host) = cmd.host {
        config.server.host = host;
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    debug!("resolved config: {config:#?}");

    let db = Database::open(&config.database).await?;
    let recovered = db.recover_interrupted_sessions().await?;
    if recovered > 0 {
        info!(recovered, "marked sessions interrupted by the previous shutdown as errored");
    }

    let state = build_state(&config, &db).await?;

    // Background sweep for expired proposals.
    let sweeper = state.workflows.clone();
    let sweep_interval = Duration::from_secs(config.workflow.proposal_sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            if let Err(err) = sweeper.proposals().sweep_expired().await {
                tracing::warn!(error = %err, "proposal expiry sweep failed");
            }
        }
    });

    let app = create_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("tether listening on http://{addr}");

    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

async fn build_state(config: &AppConfig, db: &Database) -> Result<AppState> {
    let bus = Arc::new(EventBus::new());

    let sandbox_api: Arc<dyn SandboxApi> = match config.sandbox.backend.as_str() {
        "http" => Arc::new(HttpSandbox::new(config.sandbox.provisioner_url.clone())?),
        "local" => Arc::new(LocalSandbox::new(format!(
            "ws://{}:{}",
            config.server.host, config.server.port
        ))),
        other => anyhow::bail!("unknown sandbox backend '{other}' (expected local or http)"),
    };
    let supervisor = Arc::new(SandboxSupervisor::new(
        sandbox_api,
        SupervisorConfig {
            image: config.sandbox.image.clone(),
            command: config.sandbox.command.clone(),
            port: config.sandbox.port,
            idle_timeout_ms: config.sandbox.idle_timeout_ms,
            start_timeout: Duration::from_secs(config.sandbox.start_timeout_secs),
            health_polls: config.sandbox.health_polls,
        },
    ));

    let session_repo = SessionRepository::new(db.pool().clone());
    let registry = SessionRegistry::new(session_repo.clone(), bus.clone(), supervisor);
    let sessions = Arc::new(SessionService::new(
        session_repo.clone(),
        registry,
        SessionServiceConfig::default(),
    ));

    let mailbox = Arc::new(MailboxService::new(
        MailboxRepository::new(db.pool().clone()),
        sessions.clone(),
        bus.clone(),
    ));
    let tasks = Arc::new(TaskService::new(TaskRepository::new(db.pool().clone())));

    let workflow_repo = WorkflowRepository::new(db.pool().clone());
    let effects = Arc::new(SessionStepEffects::new(sessions.clone()));
    let engine = WorkflowEngine::new(workflow_repo.clone(), effects, bus.clone());
    let workflows = Arc::new(WorkflowService::new(workflow_repo, engine));

    Ok(AppState::new(
        sessions,
        session_repo,
        mailbox,
        tasks,
        workflows,
        bus,
        ApiSettings { default_user: config.auth.default_user.clone() },
    ))
}

fn handle_init(common: CommonOpts, cmd: InitCommand) -> Result<()> {
    let path = common.config.unwrap_or_else(default_config_path);
    if path.exists() && !cmd.force {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(&path, AppConfig::default_toml())
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn handle_config(common: CommonOpts, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Path => {
            println!("{}", common.config.unwrap_or_else(default_config_path).display());
        }
        ConfigCommand::Show => {
            let config = AppConfig::load(common.config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
