use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wgof_storage::write_json_atomic;
use wgof_sync::{classify_batch, report_markdown, write_review_queue, MergeRun, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "wgof-cli")]
#[command(about = "Wildlife Graduate Opportunity Finder: merge, classify and review scraped postings")]
struct Cli {
    /// Overrides WGOF_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Overrides WGOF_RULES_DIR.
    #[arg(long, global = true)]
    rules_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge a scraped batch into the historical store.
    Merge {
        incoming: PathBuf,
        /// Reconcile and report without writing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Annotate a batch without merging it.
    Classify {
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Write the human review queue for the current store.
    Review {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Summarize recent archived merges.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "wgof=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = cli.rules_dir {
        config.rules_dir = dir;
    }
    info!(data_dir = %config.data_dir.display(), rules_dir = %config.rules_dir.display(), "configuration loaded");
    let run = MergeRun::new(config)?;

    match cli.command {
        Commands::Merge { incoming, dry_run } => {
            let summary = if dry_run { run.plan(&incoming)? } else { run.run(&incoming)? };
            println!("{}", summary.render_markdown());
        }
        Commands::Classify { input, output } => {
            let classified = classify_batch(run.annotator(), &input)?;
            println!("classified {} (skipped {})", input.display(), classified.skipped);
            for line in classified.counts.render_lines() {
                println!("  {line}");
            }
            if let Some(path) = output {
                write_json_atomic(&path, &classified.postings)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("annotated batch written to {}", path.display());
            }
        }
        Commands::Review { output } => {
            let (path, queued) = write_review_queue(run.store(), run.annotator(), output.as_deref())?;
            println!("review queue: {queued} positions written to {}", path.display());
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(run.store(), runs)?);
        }
    }

    Ok(())
}
