//! Opens the generated containers as virtual datasets, concatenates them
//! along `z` and commits the result to `test.icechunk.zarr` on `main`.
//!
//! Files are read from, and the repository is written to, the configured data
//! directory, `demos/data` by default. Set `CHUNKSTACK_CONFIG` to a JSON file
//! to override it or any other pipeline setting.
use anyhow::{Context, Result};
use chunkstack::{concat, open_virtual_dataset, PipelineConfig, Repository};
use std::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

fn setup_logging() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("virtualize_example=info".parse()?)
        .add_directive("chunkstack=info".parse()?);

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;
    let config = PipelineConfig::from_env().context("Failed to load pipeline configuration")?;
    let span = info_span!("virtualize", store = %config.store_path().display());
    run(&config).instrument(span).await
}

async fn run(config: &PipelineConfig) -> Result<()> {
    let start = Instant::now();

    // --- Open sources as references ---
    let mut datasets = Vec::new();
    for path in config.output_paths() {
        let vds = open_virtual_dataset(&path)
            .with_context(|| format!("Failed to open {} as a virtual dataset", path.display()))?;
        debug!(path = %path.display(), dimensions = ?vds.dimensions(), "Opened source");
        datasets.push(vds);
    }

    let combined = concat(&datasets, &config.concat_dim, config.coords, config.compat)
        .with_context(|| format!("Failed to concatenate along '{}'", config.concat_dim))?;
    info!(dimensions = ?combined.dimensions(), "Combined virtual dataset");

    // --- Commit ---
    let store = config.store_path();
    let repo = Repository::open_or_create(&store)
        .await
        .with_context(|| format!("Failed to open repository at {}", store.display()))?;
    let mut session = repo
        .writable_session(&config.branch)
        .await
        .with_context(|| format!("Failed to start a session on '{}'", config.branch))?;
    session
        .write_virtual_dataset("/", &combined)
        .await
        .context("Failed to stage the combined dataset")?;
    let snapshot = session
        .commit(&config.commit_message)
        .await
        .context("Failed to commit")?;

    info!(
        %snapshot,
        branch = %config.branch,
        elapsed = ?start.elapsed(),
        "Committed combined dataset"
    );
    println!("{}", snapshot);
    Ok(())
}
