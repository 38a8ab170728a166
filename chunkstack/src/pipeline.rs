//! The two demo pipelines: generate containers, then combine them virtually
//! into a repository.
use ndarray::{Array, IxDyn};
use std::path::PathBuf;
use tracing::info;

use crate::{
    concat::concat,
    config::PipelineConfig,
    container::write_dataset,
    dataset::{Dataset, Variable},
    error::{ChunkStackError, Result},
    repository::Repository,
    virtual_dataset::open_virtual_dataset,
};
use icechunk::format::SnapshotId;

/// The base variable: `u32` values counting up in row-major order.
pub fn source_variable(config: &PipelineConfig) -> Result<Variable> {
    let len: usize = config.shape.iter().product();
    let values: Vec<u32> = (0..len as u32).collect();
    let data = Array::from_shape_vec(IxDyn(&config.shape), values)
        .map_err(|e| ChunkStackError::Other(e.into()))?;
    let dims: Vec<&str> = config.dims.iter().map(String::as_str).collect();
    Variable::from_array(config.variable.as_str(), &dims, data)
}

/// Writes one container per configured output, each offset from the base values.
pub fn generate(config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let base = source_variable(config)?;
    let encodings = config.encodings();
    let mut written = Vec::new();
    for (i, path) in config.output_paths().into_iter().enumerate() {
        let offset = i as f64 * config.offset_step;
        let dataset = Dataset::from_variables([base.map_values(|v| v + offset)])?;
        let metadata = write_dataset(&path, &dataset, &encodings)?;
        info!(
            path = %path.display(),
            offset,
            variables = metadata.variables.len(),
            "Generated dataset"
        );
        written.push(path);
    }
    Ok(written)
}

/// Opens every output virtually, concatenates them and commits the result at
/// the root group of the configured branch.
pub async fn combine(config: &PipelineConfig) -> Result<SnapshotId> {
    let datasets = config
        .output_paths()
        .iter()
        .map(open_virtual_dataset)
        .collect::<Result<Vec<_>>>()?;
    let combined = concat(&datasets, &config.concat_dim, config.coords, config.compat)?;

    let repo = Repository::open_or_create(config.store_path()).await?;
    let mut session = repo.writable_session(&config.branch).await?;
    session.write_virtual_dataset("/", &combined).await?;
    session.commit(&config.commit_message).await
}
