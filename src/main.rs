//! `flowmaster` command line: initialize a home, run the engine and manage
//! ledger items.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use flowmaster::builders::EngineBuilder;
use flowmaster::config::{ExecutorConfig, Settings};
use flowmaster::core::AppResult;
use flowmaster::flow::DirNotebookSource;
use flowmaster::infra::{PeriodRange, SqliteLedger};
use flowmaster::runtime::{self, api};
use flowmaster::util::init_tracing;

/// FlowMaster - scheduling and execution engine for recurring data flows
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Home directory (overrides FLOWMASTER_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the home directory tree and a starter pools.json
    Init,
    /// Run the engine until Ctrl+C or until the order budget is spent
    Run {
        /// Worker threads (defaults to the CPU count)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Seconds between order ticks
        #[arg(short, long)]
        interval: Option<u64>,
        /// Stop after this many order ticks once all tasks finish
        #[arg(long)]
        orders: Option<u32>,
        /// Use an in-memory ledger and only run fakedata flows
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect and manage ledger items
    Item {
        #[command(subcommand)]
        action: ItemAction,
    },
    /// Show per-status counts of every flow
    Flows,
    /// Show configured pools
    Pools,
    /// Validate every notebook in the notebooks directory
    Notebooks,
}

#[derive(Subcommand, Debug)]
enum ItemAction {
    /// Most recent items of a flow
    List {
        /// Flow name
        flow: String,
        /// Maximum number of items
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Failed items of a flow
    Errors {
        /// Flow name
        flow: String,
        /// Maximum number of items
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Put items back to ADD so they run again
    Restart {
        /// Flow names, comma separated
        flows: String,
        /// First period (RFC 3339, `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS`)
        #[arg(long)]
        from: Option<String>,
        /// Last period
        #[arg(long)]
        to: Option<String>,
    },
    /// Put every failed item back to ADD
    RestartErrors {
        /// Flow names, comma separated
        flows: String,
    },
    /// Delete every item of a flow
    Clear {
        /// Flow names, comma separated
        flows: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let args = Args::parse();
    let settings = args.home.map_or_else(Settings::from_env, Settings::with_home);

    match args.command {
        Command::Init => {
            settings.init_dirs().map_err(anyhow::Error::msg)?;
            print_json(&settings)
        }
        Command::Run {
            workers,
            interval,
            orders,
            dry_run,
        } => {
            let mut executor = ExecutorConfig::new().with_max_orders(orders).with_dry_run(dry_run);
            if let Some(workers) = workers {
                executor = executor.with_workers(workers);
            }
            if let Some(interval) = interval {
                executor = executor.with_order_interval(Duration::from_secs(interval));
            }
            settings.init_dirs().map_err(anyhow::Error::msg)?;
            let engine = EngineBuilder::new(settings, executor).build()?;
            let reason = runtime::run_until_signal(&engine).await?;
            println!("Stopped: {reason:?}");
            Ok(())
        }
        Command::Item { action } => run_item(&settings, action),
        Command::Flows => {
            let ledger = open_ledger(&settings)?;
            print_json(&api::summarize_flows(&ledger)?)
        }
        Command::Pools => {
            let pools = settings.load_pools().map_err(anyhow::Error::msg)?;
            print_json(&api::list_pools(&pools))
        }
        Command::Notebooks => {
            let mut source = DirNotebookSource::new(settings.notebooks_dir.clone());
            print_json(&api::validate_notebooks(&mut source))
        }
    }
}

fn run_item(settings: &Settings, action: ItemAction) -> AppResult<()> {
    let ledger = open_ledger(settings)?;
    let now = Utc::now();
    match action {
        ItemAction::List { flow, limit } => print_json(&api::list_entries(&ledger, &flow, limit)?),
        ItemAction::Errors { flow, limit } => print_json(&api::list_errors(&ledger, &flow, limit)?),
        ItemAction::Restart { flows, from, to } => {
            let range = PeriodRange {
                from: from.as_deref().map(parse_period).transpose()?,
                to: to.as_deref().map(parse_period).transpose()?,
            };
            let reports = split_flows(&flows)
                .map(|flow| api::restart(&ledger, flow, &range, now))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&reports)
        }
        ItemAction::RestartErrors { flows } => {
            let reports = split_flows(&flows)
                .map(|flow| api::restart_errors(&ledger, flow, now))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&reports)
        }
        ItemAction::Clear { flows } => {
            let reports = split_flows(&flows)
                .map(|flow| api::clear(&ledger, flow))
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&reports)
        }
    }
}

fn open_ledger(settings: &Settings) -> AppResult<SqliteLedger> {
    SqliteLedger::open(&settings.db_path).with_context(|| format!("open ledger {}", settings.db_path.display()))
}

fn split_flows(flows: &str) -> impl Iterator<Item = &str> {
    flows.split(',').map(str::trim).filter(|flow| !flow.is_empty())
}

fn parse_period(text: &str) -> AppResult<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Utc));
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Ok(at.and_utc());
    }
    if let Some(at) = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(at.and_utc());
    }
    bail!("invalid period '{text}'")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
