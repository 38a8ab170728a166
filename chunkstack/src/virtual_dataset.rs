//! Datasets whose arrays are manifests of references into existing containers.
//!
//! Opening a container virtually reads its footer only; no chunk is decoded
//! until [`VirtualArray::load`] is called.
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};
use tracing::{debug, info};

use crate::{
    container::{ContainerReader, VariableMetadata},
    dataset::{Dataset, Variable},
    encoding::ChunkEncoding,
    error::{ChunkStackError, Result},
    grid::ChunkGrid,
    manifest::{ChunkFetcher, ChunkManifest, ChunkRef},
    types::{Attributes, DataType},
};

/// Everything about an array except where its chunks live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub shape: Vec<usize>,
    pub chunk_shape: Vec<usize>,
    pub dimension_names: Vec<String>,
    pub source_dtype: DataType,
    pub encoding: ChunkEncoding,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ArrayMetadata {
    pub fn grid(&self) -> Result<ChunkGrid> {
        ChunkGrid::new(self.shape.clone(), self.chunk_shape.clone())
    }

    /// Checks that the dimension names match the rank and that the chunk
    /// grid is valid, returning the grid.
    pub fn validate(&self, name: &str) -> Result<ChunkGrid> {
        if self.dimension_names.len() != self.shape.len() {
            return Err(ChunkStackError::RankMismatch {
                variable: name.to_string(),
                dims: self.dimension_names.len(),
                rank: self.shape.len(),
            });
        }
        self.grid()
    }

    pub fn decoded_dtype(&self) -> DataType {
        self.encoding.decoded_dtype(self.source_dtype)
    }

    /// Same layout and codecs, ignoring the extents along `axis` and the attributes.
    fn aligned_with(&self, other: &Self, axis: usize) -> std::result::Result<(), String> {
        if self.dimension_names != other.dimension_names {
            return Err(format!(
                "dimensions {:?} differ from {:?}",
                other.dimension_names, self.dimension_names
            ));
        }
        if self.source_dtype != other.source_dtype {
            return Err(format!(
                "dtype {} differs from {}",
                other.source_dtype, self.source_dtype
            ));
        }
        if self.encoding != other.encoding {
            return Err("encodings differ".to_string());
        }
        if self.chunk_shape != other.chunk_shape {
            return Err(format!(
                "chunk shape {:?} differs from {:?}",
                other.chunk_shape, self.chunk_shape
            ));
        }
        let differs = self
            .shape
            .iter()
            .zip(&other.shape)
            .enumerate()
            .any(|(i, (a, b))| i != axis && a != b);
        if differs {
            return Err(format!("shape {:?} differs from {:?}", other.shape, self.shape));
        }
        Ok(())
    }
}

/// An array backed by chunk references.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualArray {
    pub metadata: ArrayMetadata,
    pub manifest: ChunkManifest,
}

impl VirtualArray {
    pub fn shape(&self) -> &[usize] {
        &self.metadata.shape
    }

    pub fn dims(&self) -> &[String] {
        &self.metadata.dimension_names
    }

    pub fn load(&self) -> Result<ArrayD<f64>> {
        self.load_with(&mut ChunkFetcher::new())
    }

    /// Fetches and decodes every referenced chunk. Chunks absent from the
    /// manifest read as the decoded fill value.
    pub fn load_with(&self, fetcher: &mut ChunkFetcher) -> Result<ArrayD<f64>> {
        let grid = self.metadata.grid()?;
        let encoding = &self.metadata.encoding;
        let fill = encoding.decoded_fill_value();
        let mut data = ArrayD::from_elem(IxDyn(&self.metadata.shape), fill);
        for (index, chunk) in self.manifest.indexed(self.metadata.shape.len())? {
            if !grid.contains(&index) {
                return Err(ChunkStackError::ChunkOutOfBounds {
                    path: chunk.location.clone(),
                    index,
                    grid: grid.grid_shape(),
                });
            }
            let values = encoding.decode_chunk(&fetcher.fetch(chunk)?)?;
            if values.len() != grid.chunk_len() {
                return Err(ChunkStackError::DecompressionError(format!(
                    "chunk {:?} decoded to {} values, expected {}",
                    index,
                    values.len(),
                    grid.chunk_len()
                )));
            }
            grid.insert(&mut data, &index, &values);
        }
        Ok(data)
    }

    pub fn to_variable(&self, name: &str, fetcher: &mut ChunkFetcher) -> Result<Variable> {
        let mut variable = Variable::new(
            name,
            self.metadata.dimension_names.clone(),
            self.metadata.decoded_dtype(),
            self.load_with(fetcher)?,
        )?;
        variable.attributes = self.metadata.attributes.clone();
        Ok(variable)
    }

    pub(crate) fn check_aligned(&self, name: &str, other: &Self, axis: usize) -> Result<()> {
        self.metadata
            .aligned_with(&other.metadata, axis)
            .map_err(|reason| ChunkStackError::IncompatibleVariables {
                variable: name.to_string(),
                reason,
            })
    }
}

/// A dataset of [`VirtualArray`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualDataset {
    pub variables: BTreeMap<String, VirtualArray>,
    pub coordinates: BTreeSet<String>,
    pub attributes: Attributes,
}

impl VirtualDataset {
    pub fn variable(&self, name: &str) -> Option<&VirtualArray> {
        self.variables.get(name)
    }

    pub fn is_coordinate(&self, name: &str) -> bool {
        self.coordinates.contains(name)
    }

    /// Dimension name to size over all arrays.
    pub fn dimensions(&self) -> BTreeMap<String, usize> {
        let mut dims = BTreeMap::new();
        for array in self.variables.values() {
            for (dim, size) in array.dims().iter().zip(array.shape()) {
                dims.insert(dim.clone(), *size);
            }
        }
        dims
    }

    /// Files referenced by any manifest.
    pub fn locations(&self) -> BTreeSet<&str> {
        self.variables
            .values()
            .flat_map(|a| a.manifest.locations())
            .collect()
    }

    /// Materializes every array.
    pub fn load(&self) -> Result<Dataset> {
        let mut fetcher = ChunkFetcher::new();
        let mut dataset = Dataset::new();
        dataset.attributes = self.attributes.clone();
        for (name, array) in &self.variables {
            let variable = array.to_variable(name, &mut fetcher)?;
            if self.is_coordinate(name) {
                dataset.add_coordinate(variable)?;
            } else {
                dataset.add_variable(variable)?;
            }
        }
        Ok(dataset)
    }
}

fn virtual_array(location: &str, meta: VariableMetadata) -> VirtualArray {
    let mut manifest = ChunkManifest::new();
    for chunk in &meta.chunks {
        manifest.insert(
            &chunk.index,
            ChunkRef {
                location: location.to_string(),
                offset: chunk.offset,
                length: chunk.length,
            },
        );
    }
    VirtualArray {
        metadata: ArrayMetadata {
            shape: meta.shape,
            chunk_shape: meta.chunk_shape,
            dimension_names: meta.dims,
            source_dtype: meta.source_dtype,
            encoding: meta.encoding,
            attributes: meta.attributes,
        },
        manifest,
    }
}

/// Opens a container as references to its chunks. Only the footer is read.
pub fn open_virtual_dataset(path: impl AsRef<Path>) -> Result<VirtualDataset> {
    let path = path.as_ref();
    let absolute = path.canonicalize().map_err(|e| ChunkStackError::io(path, e))?;
    let location = absolute
        .to_str()
        .ok_or_else(|| ChunkStackError::Unsupported(format!("non UTF-8 path {:?}", absolute)))?
        .to_string();
    let metadata = ContainerReader::open(&absolute)?.into_metadata();
    let variables: BTreeMap<_, _> = metadata
        .variables
        .into_iter()
        .map(|(name, meta)| (name, virtual_array(&location, meta)))
        .collect();
    let chunks: usize = variables.values().map(|a| a.manifest.len()).sum();
    info!(path = %location, variables = variables.len(), chunks, "Opened virtual dataset");
    debug!(dimensions = ?metadata.dimensions, "Virtual dataset dimensions");
    Ok(VirtualDataset {
        variables,
        coordinates: metadata.coordinates,
        attributes: metadata.attributes,
    })
}
