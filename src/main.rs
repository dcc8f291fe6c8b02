use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use validag::config::Config;
use validag::orchestration::{Capabilities, Completion, Engine, Outcome, PartialResult, UnitRecord};
use validag::scripted::{Plan, RegexValidator, ScriptedImplementation};
use validag::{telemetry, Result};

/// Exit status of a run that ended with a partial result.
const PARTIAL_EXIT_CODE: i32 = 2;

/// validag - recursive validated task execution
#[derive(Parser, Debug)]
#[command(name = "validag")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    VALIDAG_LOG=<filter>   Log filter, e.g. validag=debug (overrides --debug)")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.validag/validag.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a plan's rules and blueprints and print their execution order
    Check {
        /// Plan file (TOML)
        plan: PathBuf,
    },

    /// Execute a plan with its scripted outputs and regex contracts
    Run {
        /// Plan file (TOML)
        plan: PathBuf,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,

        /// Attempts per unit (overrides the config file)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Concurrent units per group (overrides the config file)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.debug);
    debug!(?cli, "Parsed command line");

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Check { plan } => run_check(&plan),
        Command::Run {
            plan,
            json,
            max_retries,
            concurrency,
        } => {
            let completed = run_plan(&plan, config, json, max_retries, concurrency)?;
            if !completed {
                std::process::exit(PARTIAL_EXIT_CODE);
            }
            Ok(())
        }
        Command::Config => run_config(&config, cli.config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_check(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    let graphs = plan.check()?;

    println!("Plan:  {}", path.display());
    println!("Goal:  {}", plan.goal);
    println!("Root:  {} ({})", plan.root.id, plan.root.kind);
    println!();

    if graphs.is_empty() {
        println!("No blueprints scripted.");
    }
    for planned in &graphs {
        let graph = &planned.graph;
        println!(
            "Blueprint for '{}' (attempt {}): {} node(s), {} edge(s)",
            planned.owner,
            planned.attempt,
            graph.len(),
            graph.edge_count()
        );
        println!("  Order:  {}", join(&graph.topological_order()));
        let groups: Vec<String> = graph
            .independent_groups()
            .iter()
            .map(|group| format!("[{}]", join(group)))
            .collect();
        println!("  Groups: {}", groups.join(" "));
    }
    Ok(())
}

fn run_plan(
    path: &Path,
    mut config: Config,
    json: bool,
    max_retries: Option<u32>,
    concurrency: Option<usize>,
) -> Result<bool> {
    if let Some(max_retries) = max_retries {
        config.max_retries = max_retries;
    }
    if let Some(concurrency) = concurrency {
        config.max_concurrency = concurrency;
    }
    config.validate()?;

    let mut plan = Plan::load(path)?;
    plan.check()?;
    plan.apply_thresholds(config.thresholds());

    let capabilities = Capabilities::builder()
        .implementation(Arc::new(ScriptedImplementation::from_plan(&plan)))
        .validator(Arc::new(RegexValidator::new()))
        .build()?;
    let engine = Engine::new(config.engine_config(), capabilities)?;

    info!(plan = %path.display(), root = %plan.root.id, "Running plan");
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(engine.run(plan.root.clone(), plan.input()))?;
    let completed = outcome.is_completed();

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        match &outcome {
            Outcome::Completed(completion) => print_completion(completion),
            Outcome::Partial(partial) => print_partial(partial),
        }
    }
    Ok(completed)
}

fn run_config(config: &Config, path: Option<&Path>) -> Result<()> {
    let source = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    println!("# {}", source.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn print_completion(completion: &Completion) {
    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                      Run Completed                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Run ID:  {}", completion.run_id);
    println!("  Path:    {}", completion.path);
    println!("  Bound:   {:.4}", completion.error_bound());
    if let Some((path, bound)) = completion.budget.critical_path() {
        println!("  Worst:   {} ({:.4})", path, bound);
    }
    println!();
    print_trace(&completion.trace);
    println!();
    println!("Artifact:");
    println!("{}", completion.artifact);
}

fn print_partial(partial: &PartialResult) {
    println!();
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                      Partial Result                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("  Run ID:       {}", partial.run_id);
    println!("  Root:         {}", partial.root);
    println!("  Failed path:  {}", partial.failed_path);
    println!("  Salvaged:     {} artifact(s)", partial.salvaged.len());
    println!();
    print_trace(&partial.trace);
    println!();
    println!("Feedback trail:");
    for entry in &partial.feedback_trail {
        println!("  {}: {}", entry.scope, entry.feedback);
    }
    for salvaged in &partial.salvaged {
        println!();
        println!("Salvaged {}:", salvaged.scope);
        println!("{}", salvaged.artifact);
    }
}

fn print_trace(trace: &[UnitRecord]) {
    println!("Units:");
    for record in trace {
        println!(
            "  {:<32} {:<10} {:<10} {} attempt(s)",
            record.scope.to_string(),
            record.kind.to_string(),
            record.unit.state().to_string(),
            record.unit.attempt()
        );
    }
}

fn join(ids: &[validag::NodeId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}
