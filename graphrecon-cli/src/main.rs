//! graphrecon: apply a plan of directory and cloud resources idempotently.
//!
//! Each step is looked up by its natural key and created only when absent.
//! Changes can be followed by a propagation wait so dependent steps see
//! them. Rerunning a plan is always safe.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use graphrecon_core::{CancelToken, HttpTransport, Reconciler, RestResourceApi, RetryExecutor, Session};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod orchestrator;
mod report;

use config::Plan;
use orchestrator::Orchestrator;
use report::StepReport;

/// Idempotent provisioning for Microsoft Graph and Azure Resource Manager
#[derive(Parser, Debug)]
#[command(name = "graphrecon", version, about)]
struct Cli {
    /// Plan file (JSON)
    #[arg(short, long)]
    plan: PathBuf,

    /// Bearer token for the target API
    #[arg(long, env = "GRAPHRECON_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Read the bearer token from a file
    #[arg(long, conflicts_with = "token")]
    token_file: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every step in the plan
    Apply,
    /// Look up every step without changing anything
    Check,
    /// Wait for one step's change to propagate
    Wait {
        /// Step id
        #[arg(long)]
        step: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn load_token(cli: &Cli) -> Result<String> {
    let token = match (&cli.token, &cli.token_file) {
        (Some(token), _) => token.clone(),
        (None, Some(path)) => read_token_file(path)?,
        (None, None) => bail!("No access token: pass --token, set GRAPHRECON_TOKEN or use --token-file"),
    };
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("Access token is empty");
    }
    Ok(token)
}

fn read_token_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read token file {}", path.display()))
}

/// First Ctrl-C cancels the run after the current request; the second exits.
fn install_interrupt_handler(cancel: CancelToken) -> Result<()> {
    std::thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("Interrupt handler unavailable: {}", e);
                    return;
                }
            };
            rt.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("Interrupted, stopping after the current request (Ctrl-C again to abort)");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        })
        .context("Failed to spawn interrupt handler")?;
    Ok(())
}

fn print(reports: &[StepReport], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => println!("{}", report::render_table(reports)),
        OutputFormat::Json => println!("{}", report::render_json(reports)?),
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graphrecon=info,graphrecon_core=info,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let plan = Plan::load(&cli.plan)?;
    info!(
        plan = %cli.plan.display(),
        steps = plan.steps.len(),
        max_attempts = plan.retry.max_attempts(),
        "Loaded plan"
    );

    let token = load_token(&cli)?;
    let transport = HttpTransport::new(Session::bearer(token), Duration::from_secs(cli.timeout))
        .context("Failed to build HTTP client")?;
    let api = RestResourceApi::new(transport, plan.kinds.clone());
    let reconciler = Reconciler::with_executor(api, RetryExecutor::new(plan.retry));

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone())?;
    let orchestrator = Orchestrator::new(&reconciler, &cancel);

    let reports = match &cli.command {
        Commands::Apply => orchestrator.apply(&plan),
        Commands::Check => orchestrator.check(&plan),
        Commands::Wait { step } => {
            let Some(step) = plan.step(step) else {
                bail!("No step '{}' in {}", step, cli.plan.display());
            };
            vec![orchestrator.wait_step(step)]
        }
    };

    print(&reports, cli.output)?;
    Ok(report::exit_code(&reports))
}
