//! tetherctl - workflow CLI for the Tether server.
//!
//! `validate` runs locally; `run`, `resume`, and `propose` call the server's
//! HTTP API. Every command writes a single JSON envelope to stdout. Exit
//! codes: 0 success, 20 workflow hash mismatch, 1 otherwise.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use tether::workflow::{validate_definition, workflow_hash};

const DEFAULT_SERVER_URL: &str = "http://localhost:4180";

/// Exit code for `HASH_MISMATCH` / `STALE_BASE`, so scripts can retry with
/// a fresh hash.
const EXIT_HASH_MISMATCH: u8 = 20;

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(mismatch) = err.downcast_ref::<HashMismatch>() {
                let _ = writeln!(io::stderr(), "{mismatch}");
                emit(&json!({
                    "ok": false,
                    "status": "hash_mismatch",
                    "currentHash": mismatch.current_hash,
                }));
                return ExitCode::from(EXIT_HASH_MISMATCH);
            }
            let _ = writeln!(io::stderr(), "Error: {err:?}");
            emit(&json!({ "ok": false, "status": "error", "error": err.to_string() }));
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let client = TetherClient::new(&cli.server, cli.user.clone());

    match cli.command {
        Command::Validate(cmd) => handle_validate(cmd),
        Command::Run(cmd) => handle_run(&client, cmd).await,
        Command::Resume(cmd) => handle_resume(&client, cmd).await,
        Command::Propose(cmd) => handle_propose(&client, cmd).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "tetherctl",
    author,
    version,
    about = "Workflow CLI for the Tether control plane."
)]
struct Cli {
    /// Tether server URL
    #[arg(long, short = 's', default_value = DEFAULT_SERVER_URL, env = "TETHER_SERVER_URL")]
    server: String,

    /// Caller identity sent as x-tether-user
    #[arg(long, env = "TETHER_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a workflow definition file and print its hash
    Validate(ValidateCommand),
    /// Run a workflow at a specific hash
    Run(RunCommand),
    /// Resume a suspended execution with a decision
    Resume(ResumeCommand),
    /// Propose a definition change for review
    Propose(ProposeCommand),
}

#[derive(Debug, Parser)]
struct ValidateCommand {
    /// Path to the definition JSON
    file: PathBuf,
}

#[derive(Debug, Parser)]
struct RunCommand {
    /// Workflow id or slug
    workflow: String,
    /// Hash to execute against (refused with exit 20 if the workflow moved)
    #[arg(long = "hash")]
    workflow_hash: String,
    /// Variables as JSON object
    #[arg(long, default_value = "{}")]
    variables: String,
    /// Idempotency id for the execution
    #[arg(long)]
    execution_id: Option<String>,
    /// Trigger label recorded on the execution
    #[arg(long, default_value = "cli")]
    trigger: String,
}

#[derive(Debug, Parser)]
struct ResumeCommand {
    /// Execution id
    execution_id: String,
    /// Resume token from the awaiting execution
    #[arg(long = "token")]
    resume_token: String,
    /// Decision: approve or deny
    #[arg(long, value_parser = ["approve", "deny"])]
    decision: String,
    /// Hash to resume against (defaults to the execution's own hash)
    #[arg(long = "hash")]
    workflow_hash: Option<String>,
    /// Reason recorded on deny
    #[arg(long)]
    reason: Option<String>,
    /// Extra variables merged into the scope, as JSON object
    #[arg(long)]
    variables: Option<String>,
}

#[derive(Debug, Parser)]
struct ProposeCommand {
    /// Workflow id or slug
    workflow: String,
    /// Base hash the proposal is built against
    #[arg(long = "base-hash")]
    base_hash: String,
    /// Path to the proposed definition JSON
    file: PathBuf,
    /// Human-readable diff attached to the proposal
    #[arg(long)]
    diff: Option<String>,
    /// RFC3339 expiry for the draft
    #[arg(long)]
    expires_at: Option<String>,
}

// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HashMismatch {
    current_hash: String,
}

impl std::fmt::Display for HashMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Workflow hash mismatch; workflow is now at {}", self.current_hash)
    }
}

impl std::error::Error for HashMismatch {}

struct TetherClient {
    base_url: String,
    user: Option<String>,
    http: reqwest::Client,
}

impl TetherClient {
    fn new(base_url: &str, user: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            http: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let mut request = self.http.post(format!("{}{path}", self.base_url)).json(&body);
        if let Some(user) = &self.user {
            request = request.header("x-tether-user", user);
        }

        let response = request.send().await.context("calling tether server")?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))?;

        if status.is_success() {
            return Ok(payload);
        }

        let code = payload["code"].as_str().unwrap_or_default();
        if code == "HASH_MISMATCH" || code == "STALE_BASE" {
            let current_hash = payload["detail"]
                .as_str()
                .and_then(|d| d.rsplit(' ').next())
                .unwrap_or("unknown")
                .to_string();
            anyhow::bail!(HashMismatch { current_hash });
        }

        anyhow::bail!(
            "server returned {status}: {} ({code})",
            payload["error"].as_str().unwrap_or("unknown error")
        )
    }
}

fn emit(envelope: &Value) {
    // Single JSON envelope on stdout; everything else goes to stderr.
    println!("{envelope}");
}

fn read_definition(path: &PathBuf) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn handle_validate(cmd: ValidateCommand) -> Result<()> {
    let definition = read_definition(&cmd.file)?;
    validate_definition(&definition).map_err(|err| anyhow::anyhow!(err.to_string()))?;

    emit(&json!({
        "ok": true,
        "status": "valid",
        "workflowHash": workflow_hash(&definition),
    }));
    Ok(())
}

async fn handle_run(client: &TetherClient, cmd: RunCommand) -> Result<()> {
    let variables: Value =
        serde_json::from_str(&cmd.variables).context("parsing --variables JSON")?;

    let result = client
        .post(
            &format!("/api/workflows/{}/run", cmd.workflow),
            json!({
                "workflowHash": cmd.workflow_hash,
                "variables": variables,
                "executionId": cmd.execution_id,
                "trigger": cmd.trigger,
            }),
        )
        .await?;

    emit(&json!({
        "ok": true,
        "status": result["status"],
        "executionId": result["executionId"],
        "resumeToken": result["resumeToken"],
    }));
    Ok(())
}

async fn handle_resume(client: &TetherClient, cmd: ResumeCommand) -> Result<()> {
    let variables: Option<Value> = match &cmd.variables {
        Some(raw) => Some(serde_json::from_str(raw).context("parsing --variables JSON")?),
        None => None,
    };

    let result = client
        .post(
            &format!("/api/executions/{}/approve", cmd.execution_id),
            json!({
                "approve": cmd.decision == "approve",
                "resumeToken": cmd.resume_token,
                "reason": cmd.reason,
                "workflowHash": cmd.workflow_hash,
                "variables": variables,
            }),
        )
        .await?;

    emit(&json!({
        "ok": true,
        "status": result["status"],
        "resumeToken": result["resumeToken"],
    }));
    Ok(())
}

async fn handle_propose(client: &TetherClient, cmd: ProposeCommand) -> Result<()> {
    let proposal = read_definition(&cmd.file)?;
    // Catch shape problems before bothering the server.
    validate_definition(&proposal).map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let result = client
        .post(
            &format!("/api/workflows/{}/proposals", cmd.workflow),
            json!({
                "baseWorkflowHash": cmd.base_hash,
                "proposal": proposal,
                "diffText": cmd.diff,
                "expiresAt": cmd.expires_at,
            }),
        )
        .await?;

    emit(&json!({
        "ok": true,
        "status": "draft",
        "proposalId": result["proposal"]["id"],
        "proposedHash": workflow_hash(&proposal),
    }));
    Ok(())
}
