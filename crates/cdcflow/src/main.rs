// crates/cdcflow/src/main.rs

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cdcflow_core::config::{
    parse_trigger_interval, PipelineConfig, DATA_DIR_ENV, DEFAULT_TRIGGER_INTERVAL,
    TRIGGER_INTERVAL_ENV,
};
use cdcflow_core::ingest::{read_source_file, SourceFormat};
use cdcflow_core::pipelines::{all_pipeline_descriptors, find_pipeline};
use cdcflow_core::runtime::run_continuous;
use cdcflow_core::storage::PipelineStore;
use cdcflow_core::Pipeline;
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Declarative CDC pipelines over local tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a file of change events to a source table
    Ingest(IngestArgs),
    /// Run one update (or keep running with --continuous)
    Run(RunArgs),
    /// Print the current snapshot of a table
    Show(ShowArgs),
    /// Check that a pipeline's views, tables and flows are consistent
    Validate(PipelineArgs),
    /// List the built-in pipelines
    Pipelines,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Pipeline TOML file
    #[arg(long, conflicts_with = "pipeline")]
    config: Option<PathBuf>,
    /// Code of a built-in pipeline
    #[arg(long, default_value = "gold_fact")]
    pipeline: String,
    /// Directory holding tables and checkpoints
    #[arg(long, env = DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Source table, e.g. spotify_catalog.silver.factstream
    #[arg(long)]
    table: String,
    #[arg(long)]
    file: PathBuf,
    /// csv, json or parquet; inferred from the extension when omitted
    #[arg(long)]
    format: Option<SourceFormat>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Keep running an update per trigger interval until Ctrl-C
    #[arg(long)]
    continuous: bool,
    /// Empty every streaming table and reprocess all source data
    #[arg(long, conflicts_with = "continuous")]
    full_refresh: bool,
}

#[derive(Args, Debug)]
struct ShowArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    #[arg(long)]
    table: String,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Ingest(args) => {
            let (mut pipeline, _) = open_pipeline(&args.pipeline)?;
            let format = match args.format {
                Some(format) => format,
                None => SourceFormat::from_path(&args.file)?,
            };
            let batch = read_source_file(&args.file, format)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let rows = batch.height();
            let version = pipeline
                .append(&args.table, batch)
                .with_context(|| format!("failed to append to {}", args.table))?;
            info!(table = %args.table, rows, version, "ingested source file");
            println!("Appended {rows} rows to {} (version {version}).", args.table);
            Ok(())
        }
        Command::Run(args) => {
            let (mut pipeline, trigger_interval) = open_pipeline(&args.pipeline)?;
            if args.continuous {
                let summary =
                    run_continuous(&mut pipeline, trigger_interval, shutdown_signal()).await;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }

            let report = if args.full_refresh {
                pipeline.full_refresh()?
            } else {
                pipeline.update()?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Show(args) => {
            let (pipeline, _) = open_pipeline(&args.pipeline)?;
            let df = pipeline
                .read(&args.table)
                .with_context(|| format!("failed to read {}", args.table))?;
            println!("{}", df.head(Some(args.limit)));
            Ok(())
        }
        Command::Validate(args) => {
            let (pipeline, _) = open_pipeline(&args)?;
            pipeline.validate()?;

            let mut table = Table::new();
            table.set_header(vec!["Flow", "Source", "Target", "Keys", "Sequence by", "History"]);
            for flow in pipeline.flows() {
                table.add_row(vec![
                    flow.flow_name().to_string(),
                    flow.source.clone(),
                    pipeline.catalog().resolve(&flow.target)?.to_string(),
                    flow.keys.join(", "),
                    flow.sequence_by.clone(),
                    flow.stored_as_scd_type.to_string(),
                ]);
            }
            println!("{table}");
            println!("Pipeline '{}' is valid.", pipeline.name());
            Ok(())
        }
        Command::Pipelines => {
            let mut table = Table::new();
            table.set_header(vec!["Code", "Version", "Target schema", "Description"]);
            for descriptor in all_pipeline_descriptors() {
                table.add_row(vec![
                    descriptor.code.to_string(),
                    descriptor.version.to_string(),
                    format!("{}.{}", descriptor.default_catalog, descriptor.default_schema),
                    descriptor.description.to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

/// Builds the pipeline named by `args` along with its trigger interval.
fn open_pipeline(args: &PipelineArgs) -> Result<(Pipeline, Duration)> {
    if let Some(path) = &args.config {
        let mut config = PipelineConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        config.apply_env_overrides()?;
        if let Some(dir) = &args.data_dir {
            config.pipeline.storage = Some(dir.clone());
        }
        let pipeline = config.build()?;
        return Ok((pipeline, config.trigger_interval()));
    }

    let Some(descriptor) = find_pipeline(&args.pipeline) else {
        bail!("unknown pipeline '{}'; see `cdcflow pipelines`", args.pipeline);
    };
    let store = match &args.data_dir {
        Some(dir) => PipelineStore::local(dir),
        None => {
            warn!(pipeline = descriptor.code, "no data directory set; nothing will be persisted");
            PipelineStore::memory()
        }
    };
    let trigger_interval = match std::env::var(TRIGGER_INTERVAL_ENV) {
        Ok(raw) => parse_trigger_interval(&raw)?,
        Err(_) => DEFAULT_TRIGGER_INTERVAL,
    };
    let pipeline = descriptor.open(store)?;
    Ok((pipeline, trigger_interval))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}
