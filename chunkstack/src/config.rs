//! Settings shared by the generate and virtualize binaries.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{
    concat::{Compat, CoordsMode},
    encoding::{EncodingMap, StorageEncoding},
    error::{ChunkStackError, Result},
};

/// Path of a JSON file overriding any subset of [`PipelineConfig`].
pub const CONFIG_ENV_VAR: &str = "CHUNKSTACK_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the containers and the repository.
    pub data_dir: PathBuf,
    pub shape: Vec<usize>,
    pub dims: Vec<String>,
    pub variable: String,
    /// Container file names; file `i` holds the base values plus `i * offset_step`.
    pub outputs: Vec<String>,
    pub offset_step: f64,
    pub encoding: StorageEncoding,
    pub concat_dim: String,
    pub coords: CoordsMode,
    pub compat: Compat,
    pub store: String,
    pub branch: String,
    pub commit_message: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("demos/data"),
            shape: vec![2, 5, 10],
            dims: vec!["z".into(), "y".into(), "x".into()],
            variable: "data".into(),
            outputs: vec!["test0.nc".into(), "test1.nc".into()],
            offset_step: 100.0,
            encoding: StorageEncoding {
                shuffle: true,
                zlib: true,
                chunksizes: Some(vec![1, 2, 2]),
                scale_factor: Some(0.1),
                add_offset: Some(3.0),
                ..Default::default()
            },
            concat_dim: "z".into(),
            coords: CoordsMode::Minimal,
            compat: Compat::Override,
            store: "test.icechunk.zarr".into(),
            branch: "main".into(),
            commit_message: "Initial commit".into(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ChunkStackError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| ChunkStackError::metadata(path, e))
    }

    /// Defaults, overridden by the file named in `CHUNKSTACK_CONFIG` when set.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                info!(path = ?path, "Loading pipeline configuration");
                Self::from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.outputs.iter().map(|name| self.data_dir.join(name)).collect()
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store)
    }

    pub fn encodings(&self) -> EncodingMap {
        let mut encodings = EncodingMap::new();
        encodings.insert(self.variable.clone(), self.encoding.clone());
        encodings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_demo_pipeline() {
        let config = PipelineConfig::default();
        assert_eq!(config.shape, vec![2, 5, 10]);
        assert_eq!(
            config.output_paths(),
            vec![PathBuf::from("demos/data/test0.nc"), PathBuf::from("demos/data/test1.nc")]
        );
        assert_eq!(config.store_path(), PathBuf::from("demos/data/test.icechunk.zarr"));
        assert_eq!(config.encodings()["data"].chunksizes, Some(vec![1, 2, 2]));
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let json = r#"{"data_dir": "/tmp/out", "compat": "equals", "encoding": {"zlib": true}}"#;
        std::fs::write(&path, json).unwrap();
        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.compat, Compat::Equals);
        assert_eq!(config.encoding.chunksizes, None);
        assert_eq!(config.branch, "main");
    }

    #[test]
    fn malformed_file_is_a_metadata_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(&path),
            Err(ChunkStackError::Metadata { .. })
        ));
    }
}
