//! kuba-stream command line interface
//!
//! Reads points as JSON lines on stdin, runs them through the configured
//! pipeline and writes the resulting points as JSON lines to stdout. Logs go
//! to stderr.

use std::io::{self, BufRead, BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use kuba_stream::{Error, Pipeline, PipelineConfig, Point, PointsConverter};

// =============================================================================
// CLI Definition
// =============================================================================

/// kuba-stream - record batch transformation engine for streaming metrics
#[derive(Parser)]
#[command(name = "kuba-stream")]
#[command(version)]
#[command(about = "Group, join, aggregate and threshold streaming metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the pipeline configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Process JSON-lines points from stdin (default)
    Run {
        /// Number of points converted into one batch
        #[arg(short, long, default_value_t = 1000)]
        batch_size: usize,
    },

    /// Validate the configuration file and print the pipeline
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig, Error> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_file_with_env(path)?,
        None => {
            let mut config = PipelineConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    config.validate()?;
    Ok(config)
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(config: &PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = Pipeline::from_config(config)?;

    println!("Configuration is valid!");
    println!();
    println!("Conversion:");
    println!("  Time column: {}", config.conversion.time_column);
    println!("  Measurement column: {}", config.conversion.measurement_column);
    println!();
    println!("Pipeline ({} stages):", pipeline.len());
    for (index, name) in pipeline.stage_names().iter().enumerate() {
        println!("  {}. {}", index + 1, name);
    }
    println!();
    println!("Log level: {}", config.logging.level);

    Ok(())
}

/// Stream points from stdin through the pipeline
fn cmd_run(config: &PipelineConfig, batch_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    if batch_size == 0 {
        return Err(Box::new(Error::config("batch size must be > 0")));
    }

    let mut pipeline = Pipeline::from_config(config)?;
    let converter = PointsConverter::new(config.conversion.clone());
    let stdin = io::stdin();
    let mut out = BufWriter::new(io::stdout().lock());

    let mut pending: Vec<Point> = Vec::with_capacity(batch_size);
    let mut processed = 0usize;

    for (number, line) in stdin.lock().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let point: Point = serde_json::from_str(&line).map_err(|e| {
            Error::Serialization(format!("line {}: {}", number + 1, e))
        })?;
        pending.push(point);

        if pending.len() >= batch_size {
            processed += flush(&mut pipeline, &converter, &mut pending, &mut out)?;
        }
    }
    if !pending.is_empty() {
        processed += flush(&mut pipeline, &converter, &mut pending, &mut out)?;
    }

    out.flush()?;
    info!("Processed {} points", processed);
    Ok(())
}

/// Convert, transform and write the pending points
fn flush(
    pipeline: &mut Pipeline,
    converter: &PointsConverter,
    pending: &mut Vec<Point>,
    out: &mut impl Write,
) -> Result<usize, Box<dyn std::error::Error>> {
    let count = pending.len();
    let batch = converter.to_record_batch(pending)?;
    pending.clear();

    let batches = pipeline.handle(vec![batch])?;
    let points = converter.to_points(&batches)?;
    debug!("Flushed {} points in, {} points out", count, points.len());

    for point in &points {
        serde_json::to_writer(&mut *out, point)?;
        out.write_all(b"\n")?;
    }
    Ok(count)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();

    debug!("Starting kuba-stream v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Some(Commands::CheckConfig) => cmd_check_config(&config),
        Some(Commands::Run { batch_size }) => cmd_run(&config, *batch_size),
        None => cmd_run(&config, 1000),
    }
}
