//! Hearth CLI
//!
//! Inspect and maintain a memory store.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;

use hearth_core::decay::DecayEngine;
use hearth_core::scheduler::{AddOutcome, ExecutionStatus, NewScheduledItem};
use hearth_core::{HearthConfig, MemoryCategory, MemoryFilter};
use hearth_daemon::{init_logging, Runtime};

/// Hearth - memory store CLI
#[derive(Parser)]
#[command(name = "hearth")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the Hearth assistant memory store")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User to act on (defaults to store.default_user)
    #[arg(long, short, global = true)]
    user: Option<String>,

    /// Log to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show memory statistics
    Stats,

    /// List memories, most prominent first
    Memories {
        /// Only this category (preference, fact, event, relationship, insight)
        #[arg(long)]
        category: Option<String>,
        /// Include superseded and archived memories
        #[arg(long)]
        all: bool,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// List scheduled items
    Items {
        /// Only this status (pending, processing, fired, dismissed, expired, acted)
        #[arg(long)]
        status: Option<String>,
    },

    /// Apply prominence decay now
    Decay,

    /// Delete faded memories and old terminal items
    Prune,

    /// Run one light tick (and a sleep tick if one is due)
    Tick,

    /// Force a sleep tick: dream cycle, reflection, gap pipeline
    Sleep,

    /// Queue a nudge or task
    AddItem {
        /// Nudge text, or the task goal
        message: String,
        /// Trigger in this many minutes
        #[arg(long, conflicts_with = "at")]
        in_minutes: Option<i64>,
        /// Trigger at an RFC 3339 time
        #[arg(long)]
        at: Option<String>,
        /// Queue a sub-agent task instead of a nudge
        #[arg(long)]
        task: bool,
        /// Tools a task may use (comma-separated)
        #[arg(long)]
        tools: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        init_logging(false);
    }

    let config = HearthConfig::load(cli.config.as_deref())?;
    let user = cli.user.clone().unwrap_or_else(|| config.store.default_user.clone());
    let runtime = Runtime::open(config)?;

    match cli.command {
        Commands::Stats => run_stats(&runtime, &user),
        Commands::Memories { category, all, limit } => run_memories(&runtime, &user, category, all, limit),
        Commands::Items { status } => run_items(&runtime, &user, status),
        Commands::Decay => run_decay(&runtime),
        Commands::Prune => run_prune(&runtime),
        Commands::Tick => run_tick(&runtime).await,
        Commands::Sleep => run_sleep(&runtime).await,
        Commands::AddItem {
            message,
            in_minutes,
            at,
            task,
            tools,
        } => run_add_item(&runtime, &user, message, in_minutes, at, task, tools),
    }
}

fn run_stats(runtime: &Runtime, user: &str) -> anyhow::Result<()> {
    let stats = runtime.storage.memory_stats(user)?;

    println!("{}", format!("=== Hearth Memory Statistics ({}) ===", user).cyan().bold());
    println!();
    println!("{}: {}", "Total Memories".white().bold(), stats.total);
    println!("{}: {}", "Latest".white().bold(), stats.latest);
    println!("{}: {}", "Superseded".white().bold(), stats.superseded);
    println!("{}: {}", "Relations".white().bold(), stats.relations);
    println!("{}: {:.2}", "Average Prominence".white().bold(), stats.average_prominence);

    let coverage = if stats.total > 0 {
        stats.with_embedding as f64 / stats.total as f64 * 100.0
    } else {
        0.0
    };
    println!("{}: {:.1}%", "Embedding Coverage".white().bold(), coverage);

    if !stats.by_category.is_empty() {
        println!();
        println!("{}", "=== By Category ===".yellow().bold());
        for (category, count) in &stats.by_category {
            println!("  {:<14} {}", category, count);
        }
    }

    let pending = runtime
        .storage
        .list_scheduled_items(user, Some(ExecutionStatus::Pending))?;
    println!();
    println!("{}: {}", "Pending Items".white().bold(), pending.len());

    let usage = runtime.storage.usage_since(user, Utc::now() - Duration::days(1))?;
    if !usage.is_empty() {
        println!();
        println!("{}", "=== LLM Usage (24h) ===".magenta().bold());
        for row in usage {
            println!(
                "  {:<22} {:>4} calls  {:>8} in  {:>8} out",
                row.operation, row.calls, row.input_tokens, row.output_tokens
            );
        }
    }
    Ok(())
}

fn run_memories(
    runtime: &Runtime,
    user: &str,
    category: Option<String>,
    all: bool,
    limit: usize,
) -> anyhow::Result<()> {
    let filter = MemoryFilter {
        category: category.as_deref().map(MemoryCategory::parse_name),
        include_superseded: all,
        limit: Some(limit),
        ..Default::default()
    };
    let memories = runtime.storage.list_memories(user, &filter)?;
    if memories.is_empty() {
        println!("{}", "No memories found.".dimmed());
        return Ok(());
    }

    for memory in memories {
        let marker = if memory.is_latest { " ".normal() } else { "~".red() };
        println!(
            "{} {:.2}  {:<12} {}  {}",
            marker,
            memory.prominence,
            memory.category.to_string().yellow(),
            memory.id.get(..8).unwrap_or(&memory.id).dimmed(),
            memory.content
        );
    }
    Ok(())
}

fn run_items(runtime: &Runtime, user: &str, status: Option<String>) -> anyhow::Result<()> {
    let status = match status {
        Some(s) => Some(
            ExecutionStatus::parse_name(&s).ok_or_else(|| anyhow::anyhow!("unknown status: {}", s))?,
        ),
        None => None,
    };
    let items = runtime.storage.list_scheduled_items(user, status)?;
    if items.is_empty() {
        println!("{}", "No scheduled items.".dimmed());
        return Ok(());
    }

    for item in items {
        let when = item
            .trigger_at
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unscheduled".to_string());
        println!(
            "{:<10} {:<11} {:<16} {}  {}",
            item.status.as_str().cyan(),
            item.board_status.as_str(),
            when,
            item.kind.as_str().dimmed(),
            item.message
        );
    }
    Ok(())
}

fn run_decay(runtime: &Runtime) -> anyhow::Result<()> {
    let engine = DecayEngine::new(runtime.config.decay.clone());
    let report = runtime.storage.apply_decay(&engine, Utc::now())?;
    println!(
        "{} {} updated, {} archived",
        "Decay applied:".green().bold(),
        report.updated,
        report.archived
    );
    Ok(())
}

fn run_prune(runtime: &Runtime) -> anyhow::Result<()> {
    let now = Utc::now();
    let engine = DecayEngine::new(runtime.config.decay.clone());
    let memories = runtime.storage.prune_decayed(&engine, now)?;
    let items = runtime.gardener.scheduler().purge_terminal(now)?;
    println!(
        "{} {} memories, {} scheduled items",
        "Pruned:".green().bold(),
        memories,
        items
    );
    Ok(())
}

async fn run_tick(runtime: &Runtime) -> anyhow::Result<()> {
    let report = runtime.gardener.tick(Utc::now()).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_sleep(runtime: &Runtime) -> anyhow::Result<()> {
    let report = runtime.gardener.sleep_tick(Utc::now()).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_add_item(
    runtime: &Runtime,
    user: &str,
    message: String,
    in_minutes: Option<i64>,
    at: Option<String>,
    task: bool,
    tools: Option<String>,
) -> anyhow::Result<()> {
    let trigger_at = match (in_minutes, at) {
        (Some(minutes), _) => Some((Utc::now() + Duration::minutes(minutes)).timestamp()),
        (None, Some(at)) => Some(DateTime::parse_from_rfc3339(&at)?.timestamp()),
        (None, None) => None,
    };

    let input = if task {
        let tools = tools
            .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        NewScheduledItem::task(user, message, tools, trigger_at)
    } else {
        NewScheduledItem::nudge(user, message, trigger_at)
    };

    match runtime.gardener.scheduler().add(input)? {
        AddOutcome::Created(item) => println!("{} {}", "Queued".green().bold(), item.id),
        AddOutcome::Duplicate(id) => println!("{} {}", "Similar item already pending:".yellow().bold(), id),
    }
    Ok(())
}
