use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use tierflow::budget::BudgetLedger;
use tierflow::config::Config;
use tierflow::core::TaskGraph;
use tierflow::orchestration::{AllocationPlan, Allocator, Assignment, DynamicExecutor, StaticExecutor};
use tierflow::run::RunResult;
use tierflow::simulate::{SimulatedDispatcher, TierTagScorer};
use tierflow::summary::RunSummary;
use tierflow::{logging, Result};

/// tierflow - run tiered subtask graphs under a hard dollar budget
#[derive(Parser, Debug)]
#[command(name = "tierflow")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TIERFLOW_LOG=<filter>   Tracing filter (e.g. tierflow=debug)\n    TIERFLOW_DEBUG=1        Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.tierflow/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a subtask graph and print its statistics
    Stats {
        /// Graph JSON file
        graph: PathBuf,
    },

    /// Allocate tiers for a graph and show how the plan was degraded
    Plan {
        /// Graph JSON file
        graph: PathBuf,

        /// Budget in dollars (overrides the config)
        #[arg(short, long)]
        budget: Option<f64>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a graph against simulated tiers
    Simulate {
        /// Graph JSON file
        graph: PathBuf,

        /// Execution path
        #[arg(short, long, value_enum, default_value_t = Mode::Static)]
        mode: Mode,

        /// Budget in dollars (overrides the config)
        #[arg(short, long)]
        budget: Option<f64>,

        /// Share of each token cap the simulated tiers use
        #[arg(long, default_value_t = 0.5)]
        fill: f64,

        /// Print the full run result as JSON instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Show the effective config
    Config {
        /// Write it back to the config path
        #[arg(long)]
        write: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Static,
    Dynamic,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Stats { graph } => run_stats(&graph),
        Command::Plan { graph, budget, json } => run_plan(&config, &graph, budget, json),
        Command::Simulate {
            graph,
            mode,
            budget,
            fill,
            json,
        } => run_simulate(&config, &graph, mode, budget, fill, json),
        Command::Config { write } => run_config(&config, cli.config.as_deref(), write),
    }
}

fn load_graph(path: &Path) -> Result<TaskGraph> {
    let graph = TaskGraph::from_json(&fs::read_to_string(path)?)?;
    info!(path = %path.display(), subtasks = graph.len(), "graph loaded");
    Ok(graph)
}

fn run_stats(path: &Path) -> Result<()> {
    let graph = load_graph(path)?;
    println!("{}", serde_json::to_string_pretty(&graph.stats())?);
    Ok(())
}

fn allocate_plan(config: &Config, graph: &TaskGraph, budget: f64) -> Result<AllocationPlan> {
    let allocator = Allocator::new(config.pricing.clone(), config.allocator.clone());
    let plan = allocator.allocate(graph, budget)?;
    if plan.allocation.is_infeasible() {
        warn!(budget, "budget cannot cover the cheapest plan");
    }
    Ok(plan)
}

fn run_plan(config: &Config, path: &Path, budget: Option<f64>, json: bool) -> Result<()> {
    let graph = load_graph(path)?;
    let budget = budget.unwrap_or(config.budget_dollars);
    let plan = allocate_plan(config, &graph, budget)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("Budget ${:.4}", budget);
    for entry in plan.allocation.entries() {
        match &entry.assignment {
            Assignment::Run {
                tier,
                max_tokens,
                estimated_cost,
            } => println!(
                "  {:>4}  {:<6} -> {:<6} {:>6} tokens  ${:.6}",
                entry.subtask.to_string(),
                entry.default_tier.as_str(),
                tier.as_str(),
                max_tokens,
                estimated_cost
            ),
            Assignment::Skipped => println!(
                "  {:>4}  {:<6} -> skipped",
                entry.subtask.to_string(),
                entry.default_tier.as_str()
            ),
        }
    }
    let record = &plan.record;
    println!(
        "Estimated ${:.6} (default plan ${:.6}), {} downgrade step(s)",
        record.final_cost,
        record.original_cost,
        record.steps.len()
    );
    if let Some(scale) = record.scale {
        println!("Token caps scaled by {:.4}", scale);
    }
    if record.infeasible {
        println!("INFEASIBLE: even the floor plan exceeds the budget");
    }
    Ok(())
}

fn run_simulate(
    config: &Config,
    path: &Path,
    mode: Mode,
    budget: Option<f64>,
    fill: f64,
    json: bool,
) -> Result<()> {
    let graph = load_graph(path)?;
    let budget = budget.unwrap_or(config.budget_dollars);
    let ledger = BudgetLedger::new(budget, config.pricing.clone())?;
    let dispatchers = SimulatedDispatcher::ladder(fill);

    let rt = tokio::runtime::Runtime::new()?;
    let result: RunResult = rt.block_on(async {
        match mode {
            Mode::Static => {
                let plan = allocate_plan(config, &graph, budget)?;
                StaticExecutor::new(dispatchers, config.executor.clone())
                    .execute(&graph, &plan, &ledger)
                    .await
            }
            Mode::Dynamic => {
                DynamicExecutor::new(dispatchers, Arc::new(TierTagScorer::default()), config.dynamic.clone())
                    .execute(&graph, &ledger)
                    .await
            }
        }
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", RunSummary::from_run(&result, &graph));
    }
    Ok(())
}

fn run_config(config: &Config, path: Option<&Path>, write: bool) -> Result<()> {
    config.validate()?;
    if write {
        match path {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
        let shown = match path {
            Some(path) => path.to_path_buf(),
            None => Config::config_path()?,
        };
        eprintln!("Wrote {}", shown.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
