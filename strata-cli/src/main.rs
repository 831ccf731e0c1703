use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use strata_core::provider::{AwsCli, ObjectStore, ProviderApi};
use strata_core::Config;

mod confirm;
mod handler;
mod output;

use handler::{CliError, Flags, Handler};

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Change-set driven management for fleets of CloudFormation stacks")]
#[command(disable_version_flag = true)]
struct Cli {
    /// Config file
    #[arg(short = 'c', long, global = true, default_value = "config.yml")]
    config: PathBuf,

    /// Override config file, merged over the primary one
    #[arg(short = 'e', long, global = true)]
    config_override: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    /// Print the full error chain on failure
    #[arg(short = 't', long, global = true)]
    trace: bool,

    /// User input availability; defaults to whether stdin is a terminal
    #[arg(short = 'i', long, global = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    input: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List short status information of all stacks
    List,

    /// Show status of one stack
    Status {
        /// Stack name
        name: String,
    },

    /// Plan and deploy the bootstrap stack
    Init {
        /// Auto-approve changes
        #[arg(short = 'a', long)]
        auto_approve: bool,
    },

    /// Plan stack changes using a change set
    ///
    /// Exit codes: 0 when the stack has no changes, 2 when changes are
    /// present, 1 on error. With a plan id, reprints a previously planned
    /// change.
    Plan {
        /// Stack name
        name: String,
        /// Previously created plan id
        plan_id: Option<String>,
        /// Treat changes that only touch nested stacks automatically as no-ops
        #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
        ignore_nested_updates: bool,
        /// Verify referenced parent stacks before using their outputs
        #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
        verify_parent_stacks: bool,
    },

    /// Execute a previously planned change
    Execute {
        /// Stack name
        name: String,
        /// Plan id printed by the plan command
        plan_id: String,
    },

    /// Plan a stack and, on confirmation, execute the change
    Deploy {
        /// Stack name
        name: String,
        /// Auto-approve changes
        #[arg(short = 'a', long)]
        auto_approve: bool,
        /// Treat changes that only touch nested stacks automatically as no-ops
        #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
        ignore_nested_updates: bool,
        /// Verify referenced parent stacks before using their outputs
        #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
        verify_parent_stacks: bool,
    },

    /// Destroy a stack
    Destroy {
        /// Stack name
        name: String,
        /// Auto-approve the destruction
        #[arg(short = 'a', long)]
        auto_approve: bool,
    },

    /// Show version information
    Version,
}

impl Commands {
    fn auto_approve(&self) -> bool {
        match self {
            Commands::Init { auto_approve }
            | Commands::Deploy { auto_approve, .. }
            | Commands::Destroy { auto_approve, .. } => *auto_approve,
            _ => false,
        }
    }

    fn ignore_nested_updates(&self) -> bool {
        match self {
            Commands::Plan { ignore_nested_updates, .. }
            | Commands::Deploy { ignore_nested_updates, .. } => *ignore_nested_updates,
            _ => true,
        }
    }

    fn verify_parent_stacks(&self) -> bool {
        match self {
            Commands::Plan { verify_parent_stacks, .. }
            | Commands::Deploy { verify_parent_stacks, .. } => *verify_parent_stacks,
            _ => true,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let trace = cli.trace;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::StatusCode { code }) => ExitCode::from(code),
        Err(err) => {
            report_error(&err, trace);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    if matches!(cli.command, Commands::Version) {
        println!("strata {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config =
        Config::load_with_override(&cli.config, cli.config_override.as_ref())?;
    config.ignore_nested_updates = cli.command.ignore_nested_updates();

    let flags = Flags {
        auto_approve: cli.command.auto_approve(),
        input: cli.input.unwrap_or_else(|| std::io::stdin().is_terminal()),
        verify_parent_stacks: cli.command.verify_parent_stacks(),
    };

    let aws = Arc::new(AwsCli::new().await.map_err(strata_core::Error::from)?);
    let api: Arc<dyn ProviderApi> = aws.clone();
    let store: Arc<dyn ObjectStore> = aws;
    let handler = Handler::new(config, flags, api, store).await?;

    match &cli.command {
        Commands::List => handler.list().await,
        Commands::Status { name } => handler.status(name).await,
        Commands::Init { .. } => handler.init_command().await,
        Commands::Plan { name, plan_id: Some(plan_id), .. } => {
            handler.plan_status(name, plan_id).await
        }
        Commands::Plan { name, plan_id: None, .. } => handler.plan(name).await,
        Commands::Execute { name, plan_id } => handler.execute(name, plan_id).await,
        Commands::Deploy { name, .. } => handler.deploy(name).await,
        Commands::Destroy { name, .. } => handler.destroy(name).await,
        Commands::Version => unreachable!("handled above"),
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn report_error(err: &CliError, trace: bool) {
    let message = match err {
        CliError::Core(core) if trace => {
            // One cause per line, outermost first.
            let mut lines = vec![core.to_string()];
            let mut source = std::error::Error::source(core);
            while let Some(err) = source {
                lines.push(format!("  caused by: {err}"));
                source = err.source();
            }
            lines.join("\n")
        }
        CliError::Core(core) => core.chain(),
        other => other.to_string(),
    };
    eprintln!("{}", format!("Error: {message}").red());
}
