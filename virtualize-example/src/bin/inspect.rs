//! Prints the hierarchy, array metadata and values at the tip of a branch.
//!
//! Reads the repository in the configured data directory (`demos/data` by
//! default, overridable through the file named in `CHUNKSTACK_CONFIG`).
use anyhow::{Context, Result};
use chunkstack::{NodeKind, PipelineConfig, Repository, VersionInfo};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn setup_logging() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("inspect=info".parse()?)
        .add_directive("chunkstack=warn".parse()?);

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;
    let config = PipelineConfig::from_env().context("Failed to load pipeline configuration")?;
    let store = config.store_path();
    let repo = Repository::open(&store)
        .await
        .with_context(|| format!("Failed to open repository at {}", store.display()))?;
    let session = repo
        .readonly_session(&VersionInfo::BranchTipRef(config.branch.clone()))
        .await
        .with_context(|| format!("Failed to read branch '{}'", config.branch))?;
    info!(snapshot = %session.snapshot_id(), branch = %config.branch, "Branch tip");

    println!("{}", session.hierarchy().await?);

    for (path, kind) in session.list_nodes().await? {
        if kind != NodeKind::Array {
            continue;
        }
        println!("\n{} metadata:", path);
        println!("{}", serde_json::to_string_pretty(&session.node_metadata(&path).await?)?);
        let variable = session
            .read_array(&path)
            .await
            .with_context(|| format!("Failed to read {}", path))?;
        println!("{} values:\n{:.1}", path, variable.data);
    }
    Ok(())
}
