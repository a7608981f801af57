//! Command-line front end for the QTrader engine.
//!
//! Applications register their strategies and data providers, then hand
//! control to [`run_app`]. Exit codes follow the engine contract: 0 for a
//! finished (or cleanly paused) run, 1 for an interrupted one, 2 for a
//! usage error (clap's default).

pub mod telemetry;

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use qtrader_config::{load_config_file, AppConfig};
use qtrader_data::load_provider;
use qtrader_engine::{snapshot, Engine, RunOutcome, SystemClock};
use qtrader_strategy::builtin_strategy_names;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use telemetry::init_tracing;

#[derive(Parser)]
#[command(author, version, about = "QTrader CLI")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Optional JSON log file
    #[arg(long)]
    log_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh backtest or simulation
    Run(RunArgs),
    /// Continue a paused run from its envelope
    Resume(ResumeArgs),
    /// Fork a paused run onto a new timeline with a new strategy
    Fork(ForkArgs),
    /// Inspect a snapshot envelope
    State {
        #[command(subcommand)]
        action: StateCommand,
    },
    /// List registered strategies
    Strategies,
}

#[derive(Args)]
struct RunArgs {
    /// Engine configuration file
    #[arg(long)]
    config: PathBuf,
    /// Strategy selection file (`strategy_name` + `[params]`)
    #[arg(long)]
    strategy: PathBuf,
    /// Provider selection file (`provider_name` + `[params]`)
    #[arg(long)]
    provider: PathBuf,
    /// Launch into the paused state
    #[arg(long)]
    start_paused: bool,
}

#[derive(Args)]
struct ResumeArgs {
    /// Pause envelope to rehydrate
    #[arg(long)]
    envelope: PathBuf,
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    provider: PathBuf,
}

#[derive(Args)]
struct ForkArgs {
    /// Pause envelope to fork from
    #[arg(long)]
    envelope: PathBuf,
    #[arg(long)]
    config: PathBuf,
    /// New strategy selection file (required for a fork)
    #[arg(long)]
    strategy: PathBuf,
    #[arg(long)]
    provider: PathBuf,
    /// Fork date (defaults to the envelope's current date)
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Preserve the parent's user data instead of reinitializing
    #[arg(long)]
    keep_user_data: bool,
}

#[derive(Subcommand)]
enum StateCommand {
    /// Print a summary (or the raw JSON) of an envelope
    Inspect {
        #[arg(long)]
        envelope: PathBuf,
        #[arg(long)]
        raw: bool,
    },
}

#[derive(Deserialize)]
struct StrategyConfigFile {
    strategy_name: String,
    #[serde(default = "empty_table")]
    params: toml::Value,
}

#[derive(Deserialize)]
struct ProviderConfigFile {
    provider_name: String,
    #[serde(default = "empty_table")]
    params: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(Default::default())
}

fn read_strategy_file(path: &PathBuf) -> Result<StrategyConfigFile> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&body).context("failed to parse strategy config file")
}

fn read_provider_file(path: &PathBuf) -> Result<ProviderConfigFile> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&body).context("failed to parse provider config file")
}

/// Parse the command line and run it. Returns the process exit code.
pub fn run_app() -> Result<i32> {
    let cli = Cli::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => "info".to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    init_tracing(&filter, cli.log_path.as_deref()).context("failed to initialize logging")?;

    match cli.command {
        Commands::Run(args) => run_cmd(args),
        Commands::Resume(args) => resume_cmd(args),
        Commands::Fork(args) => fork_cmd(args),
        Commands::State {
            action: StateCommand::Inspect { envelope, raw },
        } => {
            inspect_state(&envelope, raw)?;
            Ok(0)
        }
        Commands::Strategies => {
            println!("Registered strategies:");
            for name in builtin_strategy_names() {
                println!("- {name}");
            }
            Ok(0)
        }
    }
}

fn outcome_code(outcome: RunOutcome) -> i32 {
    if outcome == RunOutcome::Paused {
        info!("run paused; resume it from the pause envelope in the workspace");
    }
    outcome.exit_code()
}

fn run_cmd(args: RunArgs) -> Result<i32> {
    let mut config: AppConfig = load_config_file(&args.config)?;
    let strategy = read_strategy_file(&args.strategy)?;
    config.engine.strategy_name = strategy.strategy_name;
    let provider_def = read_provider_file(&args.provider)?;
    let provider = load_provider(&provider_def.provider_name, provider_def.params)
        .map_err(|err| anyhow!(err.to_string()))?;

    let mut engine = Engine::new_run(config, strategy.params, provider, Arc::new(SystemClock))?;
    if args.start_paused {
        engine = engine.start_paused();
    }
    let outcome = engine.execute()?;
    Ok(outcome_code(outcome))
}

fn resume_cmd(args: ResumeArgs) -> Result<i32> {
    let config: AppConfig = load_config_file(&args.config).unwrap_or_default();
    let provider_def = read_provider_file(&args.provider)?;
    let provider = load_provider(&provider_def.provider_name, provider_def.params)
        .map_err(|err| anyhow!(err.to_string()))?;

    let mut engine = Engine::resume(&args.envelope, config, provider, Arc::new(SystemClock))?;
    let outcome = engine.execute()?;
    Ok(outcome_code(outcome))
}

fn fork_cmd(args: ForkArgs) -> Result<i32> {
    let mut config: AppConfig = load_config_file(&args.config)?;
    let strategy = read_strategy_file(&args.strategy)?;
    config.engine.strategy_name = strategy.strategy_name;
    let provider_def = read_provider_file(&args.provider)?;
    let provider = load_provider(&provider_def.provider_name, provider_def.params)
        .map_err(|err| anyhow!(err.to_string()))?;

    let mut engine = Engine::fork(
        &args.envelope,
        args.date,
        config,
        strategy.params,
        provider,
        Arc::new(SystemClock),
        !args.keep_user_data,
    )?;
    let outcome = engine.execute()?;
    Ok(outcome_code(outcome))
}

fn inspect_state(path: &PathBuf, raw: bool) -> Result<()> {
    let envelope = snapshot::load(path)?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }
    println!("Envelope: {}", path.display());
    println!("  Version: {}", envelope.version);
    println!("  Status: {}", envelope.status);
    println!("  Saved at: {}", envelope.saved_at);
    println!("  Strategy: {}", envelope.context.strategy_name);
    match envelope.context.current_dt {
        Some(dt) => println!("  Current dt: {dt}"),
        None => println!("  Current dt: <none>"),
    }
    println!("  Net worth: {}", envelope.portfolio.net_worth);
    println!("  Cash: {}", envelope.portfolio.cash);
    println!("  Equity points: {}", envelope.portfolio.history.len());
    println!("  Positions: {}", envelope.positions.len());
    println!("  Known orders: {}", envelope.orders.orders.len());
    Ok(())
}
