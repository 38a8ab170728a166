//! Writes `test0.nc` and `test1.nc` into the configured data directory.
//!
//! The data directory defaults to `demos/data`, relative to the working
//! directory. Point `CHUNKSTACK_CONFIG` at a JSON file to override it or any
//! other pipeline setting, e.g. `{"data_dir": "/tmp/chunkstack"}`.
use anyhow::{Context, Result};
use chunkstack::{pipeline, PipelineConfig};
use std::time::Instant;
use tracing::{info, info_span};
use tracing_subscriber::{fmt, EnvFilter};

fn setup_logging() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("generate_example=info".parse()?)
        .add_directive("chunkstack=info".parse()?);

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging()?;
    let config = PipelineConfig::from_env().context("Failed to load pipeline configuration")?;
    let _span = info_span!("generate", data_dir = %config.data_dir.display()).entered();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    let start = Instant::now();
    let written = pipeline::generate(&config).context("Failed to generate datasets")?;
    info!(
        files = written.len(),
        shape = ?config.shape,
        elapsed = ?start.elapsed(),
        "Generation complete"
    );
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}
