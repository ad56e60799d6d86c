//! Sync filter loader CLI

use clap::Parser;
use sync_filter_core::{build_registry, PipelineConfig};
use sync_filter_loader::{source, BatchProcessor, TracingWriter};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sync-filter-loader")]
#[command(about = "Load captured change batches through the sync filter pipeline")]
#[command(version)]
struct Args {
    /// Pipeline configuration file (TOML)
    #[arg(long, env = "SYNC_FILTER_CONFIG")]
    config: Option<String>,

    /// Batches to load, one JSON document per line
    #[arg(long, env = "SYNC_FILTER_INPUT")]
    input: String,

    /// Batches processed concurrently (overrides the configuration)
    #[arg(long, env = "SYNC_FILTER_CONCURRENCY")]
    concurrency: Option<usize>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// `json` or `pretty`
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        "pretty" => tracing_subscriber::registry()
            .with(fmt::layer().pretty())
            .with(filter)
            .init(),
        _ => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if let Some(concurrency) = args.concurrency {
        config.processor.concurrency = concurrency;
    }
    config.validate()?;

    let level = args.log_level.as_deref().unwrap_or(&config.observability.log_level);
    let format = args.log_format.as_deref().unwrap_or(&config.observability.log_format);
    init_tracing(level, format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sync-filter-loader");

    let registry = build_registry(&config.filters);
    info!(bindings = registry.len(), "Filter registry built");

    let batches = source::open_ndjson(&args.input).await?;
    let processor = BatchProcessor::new(registry, TracingWriter::new(), &config.processor);

    let run = processor.run(batches);
    tokio::pin!(run);

    let summary = tokio::select! {
        summary = &mut run => summary,
        _ = tokio::signal::ctrl_c() => {
            warn!("Shutdown signal received, finishing batches in flight");
            processor.stop();
            run.await
        }
    };

    info!(
        batches_ok = summary.batches_ok,
        batches_failed = summary.batches_failed,
        rows = summary.rows,
        written = summary.rows_written,
        suppressed = summary.rows_suppressed,
        committed = processor.writer().committed_count(),
        "Load finished"
    );

    if summary.batches_failed > 0 {
        error!(failed = summary.batches_failed, "Some batches failed");
        anyhow::bail!("{} batch(es) failed", summary.batches_failed);
    }
    Ok(())
}
