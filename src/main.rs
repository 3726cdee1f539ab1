//! CostPulse - AI token usage and cost tracker
//!
//! Tracks per-request token usage from log files, the clipboard, and manual
//! entry, and prices every request against a configurable pricing table.
//!
//! ## Usage
//!
//! ```bash
//! # Tail watched log directories and the clipboard until Ctrl-C
//! costpulse run
//!
//! # Watch a directory of application logs
//! costpulse watch add ~/myapp/logs
//!
//! # Record usage by hand
//! costpulse add --model gpt-4o --input 1200 --output 300
//!
//! # Show today's spend against the budget
//! costpulse totals
//!
//! # With verbose logging and a custom data directory
//! costpulse -v --data-dir /tmp/costpulse totals
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use costpulse_core::paths::{self, DATA_FILE_NAME, OFFSETS_FILE_NAME};
use costpulse_core::{LogGuard, format_cost, init_logging};
use costpulse_cost::{
    JsonUsageStore, ManualEntry, PricingResolver, StoreEvent, TotalsCalculator, UsageStore,
};
use costpulse_ingest::{
    ClipboardHandle, ClipboardSource, EngineConfig, LogIngestionEngine, MemoryClipboard,
    is_eligible,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

/// CostPulse AI usage tracker
///
/// Imports token usage from logs and the clipboard and attributes a cost
/// to every request.
#[derive(Parser, Debug)]
#[command(name = "costpulse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (defaults to $COSTPULSE_HOME or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tail watched log directories and the clipboard until Ctrl-C
    Run {
        /// Do not poll the clipboard
        #[arg(long)]
        no_clipboard: bool,
    },

    /// Record usage by hand
    Add {
        /// Model name, e.g. gpt-4o
        #[arg(long)]
        model: String,

        /// Input (prompt) tokens
        #[arg(long, default_value_t = 0)]
        input: u64,

        /// Output (completion) tokens
        #[arg(long, default_value_t = 0)]
        output: u64,

        /// Provider; inferred from the model when omitted
        #[arg(long)]
        provider: Option<String>,

        /// Free-text note
        #[arg(long)]
        label: Option<String>,
    },

    /// Import new usage from one log file
    Import {
        /// Log file (.log, .txt, .json or .jsonl)
        file: PathBuf,
    },

    /// Read usage JSON from stdin as if it had been copied
    Paste,

    /// Show spend totals and budget status
    Totals {
        /// Number of days in the daily breakdown
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// List the pricing table, or show the price used for one model
    Pricing {
        /// Model name to resolve
        model: Option<String>,
    },

    /// Manage watched log directories
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },
}

#[derive(Subcommand, Debug)]
enum WatchAction {
    /// Start watching a directory
    Add { dir: PathBuf },
    /// Stop watching a directory
    Remove { dir: PathBuf },
    /// List watched directories
    List,
}

/// Resolved file locations.
struct DataPaths {
    data_file: PathBuf,
    offsets_file: PathBuf,
    log_dir: PathBuf,
}

impl DataPaths {
    fn resolve(data_dir: Option<PathBuf>) -> costpulse_core::Result<Self> {
        let dir = match data_dir {
            Some(dir) => dir,
            None => paths::data_dir()?,
        };
        Ok(Self {
            data_file: dir.join(DATA_FILE_NAME),
            offsets_file: dir.join(OFFSETS_FILE_NAME),
            log_dir: dir.join("logs"),
        })
    }

    fn open_store(&self) -> anyhow::Result<Arc<JsonUsageStore>> {
        let store = JsonUsageStore::open(&self.data_file)
            .with_context(|| format!("opening {}", self.data_file.display()))?;
        Ok(Arc::new(store))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let paths = match DataPaths::resolve(cli.data_dir.clone()) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Failed to locate data directory: {}", e);
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    let _guard = match setup_logging(&cli, &paths) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    match run_command(cli.command, &paths).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("costpulse error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli, paths: &DataPaths) -> costpulse_core::Result<LogGuard> {
    let debug = cli.verbose > 0;
    init_logging(Some(paths.log_dir.clone()), debug)
}

async fn run_command(command: Command, paths: &DataPaths) -> anyhow::Result<()> {
    match command {
        Command::Run { no_clipboard } => run(paths, no_clipboard).await,
        Command::Add {
            model,
            input,
            output,
            provider,
            label,
        } => {
            let mut entry = ManualEntry::new(model, input, output);
            entry.provider = provider;
            entry.label = label;
            add(paths, entry)
        }
        Command::Import { file } => import(paths, &file),
        Command::Paste => paste(paths),
        Command::Totals { days } => totals(paths, days),
        Command::Pricing { model } => pricing(paths, model.as_deref()),
        Command::Watch { action } => watch(paths, action),
    }
}

async fn run(paths: &DataPaths, no_clipboard: bool) -> anyhow::Result<()> {
    let store = paths.open_store()?;
    let currency = store.settings().currency;

    let mut events = store.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StoreEvent::EntryAdded(record)) => println!(
                    "{}  {:<24} {:>8} in {:>8} out  {}  ({})",
                    record.timestamp.with_timezone(&Local).format("%H:%M:%S"),
                    record.model_name,
                    record.input_tokens,
                    record.output_tokens,
                    record.formatted_cost(&currency),
                    record.provider,
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut engine = LogIngestionEngine::new(
        store.clone(),
        EngineConfig::new(&paths.offsets_file),
    );
    engine.start().context("starting log ingestion")?;

    let clipboard = if no_clipboard {
        None
    } else {
        start_clipboard(store.clone())
    };

    let watched = store.log_watch_paths();
    if watched.is_empty() {
        println!("No log directories configured; add one with `costpulse watch add <DIR>`.");
    } else {
        println!("Watching {} log directories. Press Ctrl-C to stop.", watched.len());
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("shutting down");
    if let Some(handle) = clipboard {
        handle.stop().await;
    }
    engine.stop().await;
    printer.abort();

    Ok(())
}

#[cfg(feature = "system-clipboard")]
fn start_clipboard(store: Arc<JsonUsageStore>) -> Option<ClipboardHandle> {
    Some(ClipboardSource::new(costpulse_ingest::SystemClipboard, store).spawn())
}

#[cfg(not(feature = "system-clipboard"))]
fn start_clipboard(_store: Arc<JsonUsageStore>) -> Option<ClipboardHandle> {
    tracing::warn!("built without clipboard support, clipboard source disabled");
    None
}

fn add(paths: &DataPaths, entry: ManualEntry) -> anyhow::Result<()> {
    let store = paths.open_store()?;
    let record = store.add_entry(entry.into_record()?)?;
    println!(
        "Recorded {} ({}): {} in / {} out, {}",
        record.model_name,
        record.provider,
        record.input_tokens,
        record.output_tokens,
        record.formatted_cost(&store.settings().currency)
    );
    Ok(())
}

fn import(paths: &DataPaths, file: &Path) -> anyhow::Result<()> {
    if !is_eligible(file) {
        bail!(
            "{} is not a .log, .txt, .json or .jsonl file",
            file.display()
        );
    }
    if !file.is_file() {
        bail!("{} does not exist", file.display());
    }

    let store = paths.open_store()?;
    let engine = LogIngestionEngine::new(store, EngineConfig::new(&paths.offsets_file));
    let imported = engine.process_file(file);
    engine.tracker().save()?;

    println!("Imported {} new usage records from {}", imported, file.display());
    Ok(())
}

fn paste(paths: &DataPaths) -> anyhow::Result<()> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("reading stdin")?;

    let store = paths.open_store()?;
    let currency = store.settings().currency;
    let mut source = ClipboardSource::new(MemoryClipboard::with_text(text), store);

    match source.poll_once() {
        Some(record) => println!(
            "Recorded {}: {} in / {} out, {}",
            record.model_name,
            record.input_tokens,
            record.output_tokens,
            record.formatted_cost(&currency)
        ),
        None => println!("No usage report found in input"),
    }
    Ok(())
}

fn totals(paths: &DataPaths, days: u32) -> anyhow::Result<()> {
    let store = paths.open_store()?;
    let settings = store.settings();
    let entries = store.entries();
    let now = Local::now();
    let calc = TotalsCalculator::new();
    let summary = calc.summary(&entries, now);
    let budget = calc.budget_status(&entries, settings.daily_budget, now);
    let currency = settings.currency.as_str();

    println!("Today:  {} ({} tokens)", format_cost(summary.today_cost, currency), summary.tokens_today);
    println!("Month:  {} ({} tokens)", format_cost(summary.month_cost, currency), summary.tokens_month);
    println!(
        "Budget: {} of {} ({}%){}",
        format_cost(budget.spent_today, currency),
        format_cost(budget.daily_budget, currency),
        budget.percent_used,
        if budget.over_budget { "  OVER BUDGET" } else { "" }
    );

    if days > 0 {
        println!();
        for day in calc.daily_totals(&entries, days, now) {
            println!("{}  {}", day.date, format_cost(day.cost, currency));
        }
    }
    Ok(())
}

fn pricing(paths: &DataPaths, model: Option<&str>) -> anyhow::Result<()> {
    let store = paths.open_store()?;
    let resolver = store.pricing();
    let currency = store.settings().currency;

    match model {
        Some(model) => match resolver.resolve(model) {
            Some(rate) => println!(
                "{} -> {}: {}{}/M in, {}{}/M out (1M + 1M = {})",
                model,
                rate.model_name,
                currency,
                rate.input_price_per_million,
                currency,
                rate.output_price_per_million,
                format_cost(
                    PricingResolver::cost(1_000_000, 1_000_000, Some(&rate)),
                    &currency
                )
            ),
            None => println!("{}: no pricing, usage is recorded at zero cost", model),
        },
        None => {
            for rate in resolver.snapshot().rates() {
                println!(
                    "{:<24} {}{:>8}/M in  {}{:>8}/M out",
                    rate.model_name,
                    currency,
                    rate.input_price_per_million,
                    currency,
                    rate.output_price_per_million
                );
            }
        }
    }
    Ok(())
}

fn watch(paths: &DataPaths, action: WatchAction) -> anyhow::Result<()> {
    let store = paths.open_store()?;

    match action {
        WatchAction::Add { dir } => {
            let dir = std::path::absolute(&dir)
                .with_context(|| format!("resolving {}", dir.display()))?;
            if !dir.is_dir() {
                println!("Warning: {} is not a directory yet", dir.display());
            }
            if store.add_watch_path(&dir)? {
                println!("Watching {}", dir.display());
            } else {
                println!("Already watching {}", dir.display());
            }
        }
        WatchAction::Remove { dir } => {
            let absolute = std::path::absolute(&dir).unwrap_or_else(|_| dir.clone());
            if store.remove_watch_path(&absolute)? || store.remove_watch_path(&dir)? {
                println!("Stopped watching {}", dir.display());
            } else {
                println!("{} was not being watched", dir.display());
            }
        }
        WatchAction::List => {
            let dirs = store.log_watch_paths();
            if dirs.is_empty() {
                println!("No log directories configured");
            }
            for path in dirs {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}
