//! kgload - knowledge graph bulk loader

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kgload_common::logging::{init_logging, LogConfig, LogLevel};
use kgload_common::{FileKind, SchemaVersion, StageName};
use kgload_ingest::config::parse_delimiter;
use kgload_ingest::consistency::check_consistency_with;
use kgload_ingest::schema::TableSchema;
use kgload_ingest::{
    JobCatalog, LoaderConfig, MemoryGraphStore, Neo4jHttpStore, Pipeline, PipelineOptions,
    PipelineReport, PreprocessOptions, TargetStore,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kgload")]
#[command(author, version, about = "Biomedical knowledge graph bulk loader")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Column layout of the input files (v1, v2)
    #[arg(long, global = true, env = "KGLOAD_SCHEMA_VERSION")]
    schema_version: Option<SchemaVersion>,

    /// Directory holding the source files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Field delimiter (a character, or tab / comma / pipe)
    #[arg(long, global = true)]
    delimiter: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the selected stages into the graph store
    Run(RunArgs),

    /// Check cross-file references without loading anything
    Check {
        /// Exit with an error when dangling references are found
        #[arg(long)]
        strict: bool,
    },

    /// Sanitize one file in place or into another path
    Preprocess {
        input: PathBuf,

        /// Output path; defaults to rewriting the input
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// File kind whose column layout the output must match
        #[arg(short, long)]
        kind: Option<FileKind>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Run every stage (the default when no stage is selected)
    #[arg(long)]
    all: bool,

    /// Constraints and indexes
    #[arg(long)]
    constraints: bool,

    /// Independent and dependent entity nodes
    #[arg(long)]
    nodes: bool,

    /// Relationships between loaded nodes
    #[arg(long)]
    relationships: bool,

    /// Select stages by name
    #[arg(long = "stage", value_name = "STAGE")]
    stages: Vec<StageName>,

    /// Graph store HTTP URL
    #[arg(long)]
    store_url: Option<String>,

    #[arg(long)]
    database: Option<String>,

    /// Load into an in-memory graph instead of the store
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    skip_consistency: bool,

    /// Stages whose failure does not stop later stages
    #[arg(long = "non-blocking", value_name = "STAGE")]
    non_blocking: Vec<StageName>,

    /// Concurrent jobs per stage
    #[arg(long)]
    workers: Option<usize>,

    /// Write the JSON report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

impl RunArgs {
    fn selected_stages(&self) -> BTreeSet<StageName> {
        let mut stages: BTreeSet<StageName> = self.stages.iter().copied().collect();
        if self.constraints {
            stages.insert(StageName::Constraints);
        }
        if self.nodes {
            stages.insert(StageName::IndependentEntities);
            stages.insert(StageName::DependentEntities);
        }
        if self.relationships {
            stages.insert(StageName::Relationships);
        }
        if self.all || stages.is_empty() {
            stages.extend(StageName::ALL);
        }
        stages
    }
}

fn load_config(cli: &Cli) -> Result<LoaderConfig> {
    dotenvy::dotenv().ok();
    let mut config = LoaderConfig::default()
        .merge_env()
        .context("invalid KGLOAD_* environment")?;

    if let Some(version) = cli.schema_version {
        config.schema_version = version;
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(delimiter) = &cli.delimiter {
        config.input.delimiter = parse_delimiter(delimiter)?;
    }
    if let Command::Run(args) = &cli.command {
        if let Some(url) = &args.store_url {
            config.store.url = url.clone();
        }
        if let Some(database) = &args.database {
            config.store.database = database.clone();
        }
        if let Some(workers) = args.workers {
            config.load.workers = workers;
        }
    }

    config.validate()?;
    Ok(config)
}

async fn run_pipeline<S: TargetStore>(
    store: Arc<S>,
    config: &LoaderConfig,
    options: PipelineOptions,
    cancel: CancellationToken,
    stages: &BTreeSet<StageName>,
) -> Result<PipelineReport> {
    let pipeline = Pipeline::from_config(store, config, options).with_cancellation(cancel);
    Ok(pipeline.run(stages).await?)
}

async fn run(args: &RunArgs, config: &LoaderConfig) -> Result<()> {
    let stages = args.selected_stages();
    let options = PipelineOptions {
        non_blocking: args.non_blocking.iter().copied().collect(),
        run_consistency_check: !args.skip_consistency,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        }
    });

    info!(
        data_dir = %config.data_dir.display(),
        schema_version = %config.schema_version,
        dry_run = args.dry_run,
        "Starting load"
    );
    let report = if args.dry_run {
        run_pipeline(Arc::new(MemoryGraphStore::new()), config, options, cancel, &stages).await?
    } else {
        let store = Neo4jHttpStore::new(config.neo4j_config()).context("cannot create store client")?;
        run_pipeline(Arc::new(store), config, options, cancel, &stages).await?
    };

    println!("{}", report.summary());

    if let Some(path) = &args.report {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create report {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report).context("cannot write report")?;
        info!(path = %path.display(), "Wrote report");
    }

    if report.blocking_failure() {
        bail!("load failed: {}", report.errors.join("; "));
    }
    if !report.is_success() {
        warn!("Load finished with failures in non-blocking stages");
    }
    Ok(())
}

async fn check(config: &LoaderConfig, strict: bool) -> Result<()> {
    let specs = JobCatalog::new(config.catalog_options()).consistency_specs();
    if specs.is_empty() {
        bail!("no source files found in {}", config.data_dir.display());
    }
    let format = config.source_format();
    let report = tokio::task::spawn_blocking(move || check_consistency_with(&specs, &format)).await??;

    for (file, count) in &report.identifier_counts {
        println!("{file:<20} {count} identifiers");
    }
    for warning in &report.warnings {
        println!("WARNING {warning}");
    }
    if strict && !report.is_clean() {
        bail!("{} dangling reference sets", report.warnings.len());
    }
    Ok(())
}

async fn preprocess(
    config: &LoaderConfig,
    input: PathBuf,
    output: Option<PathBuf>,
    kind: Option<FileKind>,
) -> Result<()> {
    let output = output.unwrap_or_else(|| input.clone());
    let options = PreprocessOptions {
        schema: kind.map(|k| TableSchema::for_kind(k, config.schema_version)),
        format: config.source_format(),
        sanitize: config.sanitize_options(),
        show_progress: true,
        ..Default::default()
    };

    let summary = tokio::task::spawn_blocking({
        let output = output.clone();
        move || kgload_ingest::preprocess_file(&input, &output, &options)
    })
    .await??;

    println!(
        "Wrote {} rows ({} columns) to {}: {} read, {} skipped, {} repaired, {} malformed",
        summary.rows_written,
        summary.columns,
        output.display(),
        summary.rows_read,
        summary.rows_skipped,
        summary.rows_repaired,
        summary.rows_malformed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("kgload")
        .build()
        .merge_env()
        .context("invalid logging configuration")?;

    let _guard = init_logging(&log_config)?;

    let config = load_config(&cli)?;

    match cli.command {
        Command::Run(args) => run(&args, &config).await?,
        Command::Check { strict } => check(&config, strict).await?,
        Command::Preprocess {
            input,
            output,
            kind,
        } => preprocess(&config, input, output, kind).await?,
    }

    Ok(())
}
