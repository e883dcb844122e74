//! Dialogen - Dialogue Corpus Generator
//!
//! CLI entry point for generating, checking and planning sharegpt corpora.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialogen::bucket::BucketContext;
use dialogen::client::{CompletionBackend, HttpBackend};
use dialogen::config::DialogenConfig;
use dialogen::dispatch::{cross_product, Dispatcher};
use dialogen::plan::GenerationPlan;
use dialogen::session::SessionConfig;
use dialogen::validate::check::{check_tree, CheckSummary, Tally};
use dialogen::validate::Validator;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dialogen")]
#[command(version)]
#[command(about = "Token-budgeted dialogue corpus generator", long_about = None)]
struct Cli {
    /// Config file (default: dialogen.toml in this or a parent directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill every bucket of the plan up to its target
    Generate {
        /// Parallel bucket workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Records per bucket
        #[arg(short, long)]
        target: Option<usize>,

        /// Model name (overrides config and DEEPSEEK_MODEL)
        #[arg(short, long)]
        model: Option<String>,

        /// Output directory for bucket stores
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Generation plan file
        #[arg(long)]
        plan: Option<PathBuf>,

        /// System instruction file
        #[arg(long)]
        instruction: Option<PathBuf>,

        /// Run buckets one at a time
        #[arg(long)]
        sequential: bool,
    },

    /// Validate stored records and drop the invalid ones
    Check {
        /// Root of the bucket stores (default: generation.output_dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Write the summary as JSON to this path
        #[arg(long)]
        stats: Option<PathBuf>,

        /// Report only, leave files untouched
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the bucket cross-product and resume counts
    Plan {
        /// Generation plan file
        #[arg(long)]
        plan: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate {
            workers,
            target,
            model,
            output,
            plan,
            instruction,
            sequential,
        } => {
            let mut config = config;
            if let Some(model) = model {
                config.api.model = model;
            }
            if let Some(workers) = workers {
                config.concurrency.workers = workers;
            }
            if sequential {
                config.concurrency.enabled = false;
            }
            if let Some(target) = target {
                config.generation.target_per_bucket = target;
            }
            if let Some(output) = output {
                config.generation.output_dir = output;
            }
            if let Some(plan) = plan {
                config.generation.plan_file = plan;
            }
            if let Some(instruction) = instruction {
                config.generation.instruction_file = instruction;
            }
            cmd_generate(config)
        }
        Commands::Check {
            dir,
            stats,
            dry_run,
        } => cmd_check(&config, dir, stats.as_deref(), dry_run),
        Commands::Plan { plan } => cmd_plan(&config, plan),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("dialogen=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dialogen=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<DialogenConfig> {
    let mut config = match path {
        Some(path) => DialogenConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DialogenConfig::load_from_cwd().context("Failed to load dialogen.toml")?,
    };
    config.apply_env();
    Ok(config)
}

fn cmd_generate(config: DialogenConfig) -> Result<()> {
    config.validate()?;
    let api_key = config.api_key()?;
    let instruction = config.load_instruction()?;
    let plan = GenerationPlan::load(&config.generation.plan_file)?;

    let output_dir = &config.generation.output_dir;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let buckets = cross_product(&plan, config.generation.target_per_bucket);
    let workers = config.worker_count();

    println!("Model:        {} ({})", config.api.model, config.variant().name());
    println!(
        "Plan:         {} domains x {} types x {} rounds = {} buckets",
        plan.domains.len(),
        plan.ambiguity_types.len(),
        plan.rounds.len(),
        buckets.len()
    );
    println!("Target:       {} records per bucket", config.generation.target_per_bucket);
    println!("Workers:      {}", workers);
    println!("Output:       {}", output_dir.display());
    println!();

    let backend: Arc<dyn CompletionBackend> =
        Arc::new(HttpBackend::from_config(&config.api, api_key));
    let dispatcher = Dispatcher::new(
        BucketContext::from_config(&config, backend),
        SessionConfig::from_config(&config),
        instruction,
        workers,
    );

    let stop = dispatcher.stop_handle();
    ctrlc::set_handler(move || {
        if !stop.swap(true, Ordering::SeqCst) {
            eprintln!("\nStopping: finishing in-flight requests, no new buckets will start");
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    let summary = dispatcher.run(buckets);
    let p = summary.progress;

    println!();
    println!("Buckets:      {}", p.total);
    println!("Completed:    {}", p.completed);
    println!("Succeeded:    {}", p.succeeded);
    println!("Failed:       {}", p.failed);
    if p.interrupted > 0 {
        println!("Interrupted:  {}", p.interrupted);
    }
    println!("Elapsed:      {:.1}s", summary.elapsed.as_secs_f64());

    let failed: Vec<_> = summary.failed_buckets().collect();
    if !failed.is_empty() {
        println!();
        println!("Incomplete buckets:");
        for report in failed {
            println!(
                "  {}  {}/{}",
                report.bucket, report.outcome.count, report.outcome.target
            );
        }
        println!(
            "Logged to {}",
            output_dir.join(dialogen::store::INCOMPLETE_LOG_NAME).display()
        );
    }
    Ok(())
}

fn cmd_check(
    config: &DialogenConfig,
    dir: Option<PathBuf>,
    stats: Option<&Path>,
    dry_run: bool,
) -> Result<()> {
    let root = dir.unwrap_or_else(|| config.generation.output_dir.clone());
    let validator = Validator::new(
        config.generation.identifying_field.clone(),
        config.generation.summary_marker.clone(),
    );

    let summary = check_tree(&root, &validator, !dry_run)
        .with_context(|| format!("Failed to check {}", root.display()))?;
    print_summary(&summary);

    if let Some(path) = stats {
        summary.write_json(path)?;
        println!("\nStatistics written to {}", path.display());
    }
    Ok(())
}

fn print_tally(label: &str, tally: &Tally) {
    println!(
        "  {:<32} files {:>4}  before {:>6}  after {:>6}  removed {:>5} ({:.2}%)",
        label,
        tally.files,
        tally.data_before,
        tally.data_after,
        tally.removed,
        tally.removal_rate()
    );
}

fn print_group<K: Display>(title: &str, group: &BTreeMap<K, Tally>) {
    println!("\n{}:", title);
    for (key, tally) in group {
        print_tally(&key.to_string(), tally);
    }
}

fn print_summary(summary: &CheckSummary) {
    println!("{}", "=".repeat(80));
    println!("Check report");
    println!("{}", "=".repeat(80));
    print_tally("total", &summary.total);
    println!("  files with removals: {}", summary.files_with_removals);

    print_group("By domain", &summary.by_domain);
    print_group("By round", &summary.by_round);
    print_group("By ambiguity type", &summary.by_ambiguity_type);

    if !summary.error_details.is_empty() {
        println!("\nErrors (first {}):", summary.error_details.len().min(10));
        for (i, detail) in summary.error_details.iter().take(10).enumerate() {
            println!("  {}. {} (removed {})", i + 1, detail.file, detail.removed);
            for err in &detail.errors {
                println!("     - {}", err);
            }
        }
    }
}

fn cmd_plan(config: &DialogenConfig, plan: Option<PathBuf>) -> Result<()> {
    let path = plan.unwrap_or_else(|| config.generation.plan_file.clone());
    let plan = GenerationPlan::load(&path)?;
    let buckets = cross_product(&plan, config.generation.target_per_bucket);
    let output_dir = &config.generation.output_dir;

    let mut remaining = 0;
    for bucket in &buckets {
        let have = bucket.store(output_dir).count();
        let mark = if have >= bucket.target { "done" } else { "" };
        remaining += bucket.target.saturating_sub(have);
        println!("{:<60} {:>4}/{:<4} {}", bucket.to_string(), have, bucket.target, mark);
    }
    println!(
        "\n{} buckets, {} records still to generate",
        buckets.len(),
        remaining
    );
    Ok(())
}
