use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use autobatch::{profiling, AutobatchConfig, BatchStrategy};
use autobatch_backend_ref_cpu::CpuBackend;
use autobatch_cli::benchmark::{compare_strategies, run_bench, BenchOptions, EvalOrder};
use autobatch_cli::workload::WorkloadSpec;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "autobatch",
    about = "Benchmark operator autobatching on dynamic computation graphs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Time a synthetic recurrent workload under one batching strategy
    Bench {
        /// Batching strategy: 0 (off), 1 (agenda), 2 (depth); overrides the config file
        #[arg(long)]
        autobatch: Option<BatchStrategy>,
        /// JSON autobatch config; AUTOBATCH* environment variables apply when absent
        #[arg(long)]
        config: Option<PathBuf>,
        /// Evaluate the total loss only, or force every node in creation order
        #[arg(long, value_enum, default_value_t = EvalOrder::Latest)]
        order: EvalOrder,
        /// Number of build-and-evaluate rounds on the same graph
        #[arg(long, default_value_t = 10)]
        iterations: usize,
        /// Record profiling counters and print them after the run
        #[arg(long)]
        profile: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        workload: WorkloadArgs,
    },
    /// Run every strategy on the same workload and check the values agree
    Compare {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        workload: WorkloadArgs,
    },
}

#[derive(Args)]
struct WorkloadArgs {
    /// Number of sequences per round
    #[arg(long, default_value_t = 32)]
    sequences: usize,
    #[arg(long, default_value_t = 4)]
    min_len: usize,
    #[arg(long, default_value_t = 16)]
    max_len: usize,
    #[arg(long, default_value_t = 32)]
    input_dim: usize,
    #[arg(long, default_value_t = 64)]
    hidden_dim: usize,
    #[arg(long, default_value_t = 5)]
    classes: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl From<WorkloadArgs> for WorkloadSpec {
    fn from(args: WorkloadArgs) -> Self {
        WorkloadSpec {
            sequences: args.sequences,
            min_len: args.min_len,
            max_len: args.max_len,
            input_dim: args.input_dim,
            hidden_dim: args.hidden_dim,
            classes: args.classes,
            seed: args.seed,
        }
    }
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Bench {
            autobatch,
            config,
            order,
            iterations,
            profile,
            json,
            workload,
        } => {
            let mut config = load_config(config)?;
            if let Some(strategy) = autobatch {
                config.strategy = strategy;
            }
            cmd_bench(
                BenchOptions {
                    config,
                    order,
                    iterations,
                    workload: workload.into(),
                },
                profile,
                json,
            )
        }
        Commands::Compare {
            config,
            json,
            workload,
        } => cmd_compare(load_config(config)?, workload.into(), json),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AutobatchConfig> {
    match path {
        Some(path) => AutobatchConfig::load_json(&path)
            .with_context(|| format!("failed to load autobatch config {}", path.display())),
        None => Ok(AutobatchConfig::from_env()?),
    }
}

fn cmd_bench(options: BenchOptions, profile: bool, json: bool) -> Result<()> {
    if profile {
        profiling::reset();
        profiling::enable(true);
    }
    let report = run_bench(Arc::new(CpuBackend::new()), &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = &report.stats;
        println!(
            "=== autobatch bench: strategy={} order={} ===",
            report.config.strategy, report.order
        );
        println!(
            "{} iterations x {} nodes, {} sequences",
            report.iterations, report.nodes_per_iteration, options.workload.sequences
        );
        println!("{:<22} {:>12.3}", "build (ms)", report.build_ms);
        println!("{:<22} {:>12.3}", "evaluate (ms)", report.evaluate_ms);
        println!("{:<22} {:>12.3}", "  per iteration", report.evaluate_ms_per_iteration());
        println!("{:<22} {:>12.3}", "  scheduling", report.schedule_ms);
        println!("{:<22} {:>12}", "steps", stats.steps);
        println!("{:<22} {:>12}", "kernel launches", stats.kernel_launches);
        println!("{:<22} {:>12}", "nodes computed", stats.nodes_computed);
        println!("{:<22} {:>12.2}", "avg batch size", stats.average_batch_size());
        println!("{:<22} {:>12}", "fallback nodes", stats.fallback_nodes);
        println!(
            "{:<22} {:>12}",
            "plans built / reused",
            format!("{}/{}", stats.plans_built, stats.plan_cache_hits)
        );
        println!("{:<22} {:>12.6}", "total loss", report.total_loss);
    }

    if profile {
        println!("{}", profiling::snapshot().to_json()?);
    }
    Ok(())
}

fn cmd_compare(base: AutobatchConfig, spec: WorkloadSpec, json: bool) -> Result<()> {
    let comparisons = compare_strategies(Arc::new(CpuBackend::new()), &base, &spec)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&comparisons)?);
    } else {
        println!(
            "{:<8} {:>8} {:>10} {:>10} {:>12}",
            "strategy", "steps", "launches", "mismatch", "max |diff|"
        );
        println!("{}", "-".repeat(52));
        for comparison in &comparisons {
            println!(
                "{:<8} {:>8} {:>10} {:>10} {:>12.3e}",
                comparison.strategy.to_string(),
                comparison.stats.steps,
                comparison.stats.kernel_launches,
                comparison.mismatched_nodes,
                comparison.max_abs_diff
            );
        }
    }

    let diverged: Vec<String> = comparisons
        .iter()
        .filter(|comparison| !comparison.matches())
        .map(|comparison| comparison.strategy.to_string())
        .collect();
    if !diverged.is_empty() {
        bail!("strategies diverged from unbatched execution: {}", diverged.join(", "));
    }
    Ok(())
}
