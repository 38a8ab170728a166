//! Concatenation of virtual datasets along an existing dimension.
//!
//! Only manifests are combined: chunk keys of each input are shifted along the
//! concatenation axis by the number of chunks that precede it. No chunk bytes
//! are read or copied.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::{
    error::{ChunkStackError, Result},
    manifest::ChunkManifest,
    virtual_dataset::{VirtualArray, VirtualDataset},
};

/// Which coordinate variables take part in concatenation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordsMode {
    /// Only coordinates that contain the dimension are concatenated; the rest
    /// come from the first dataset.
    #[default]
    Minimal,
    /// Every coordinate is concatenated. Coordinates lacking the dimension
    /// would need a new axis, which manifests cannot express.
    All,
}

/// How variables that are not concatenated are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compat {
    /// Skip comparing and pick the variable from the first dataset.
    #[default]
    Override,
    /// Require identical metadata and manifests in every dataset.
    Equals,
}

/// Concatenates `datasets` along `dim`, in order.
///
/// Every input must have `dim`. For each concatenated variable, all inputs but
/// the last must span a whole number of chunks along `dim`. Global attributes
/// come from the first dataset.
pub fn concat(
    datasets: &[VirtualDataset],
    dim: &str,
    coords: CoordsMode,
    compat: Compat,
) -> Result<VirtualDataset> {
    let first = datasets
        .first()
        .ok_or_else(|| ChunkStackError::Unsupported("nothing to concatenate".to_string()))?;
    for dataset in datasets {
        if !dataset.dimensions().contains_key(dim) {
            return Err(ChunkStackError::DimensionNotFound(dim.to_string()));
        }
        for (name, array) in &dataset.variables {
            array.metadata.validate(name)?;
        }
    }
    check_other_dimensions(datasets, dim)?;

    let names: BTreeSet<&String> = datasets.iter().flat_map(|d| d.variables.keys()).collect();
    let mut combined = VirtualDataset {
        attributes: first.attributes.clone(),
        ..Default::default()
    };
    for name in names {
        let instances: Vec<Option<&VirtualArray>> =
            datasets.iter().map(|d| d.variable(name)).collect();
        let Some(template) = instances.iter().flatten().next() else {
            continue;
        };
        let is_coordinate = datasets.iter().any(|d| d.is_coordinate(name));
        let array = if template.dims().iter().any(|d| d == dim) {
            let present = instances
                .iter()
                .enumerate()
                .map(|(i, a)| {
                    a.ok_or_else(|| ChunkStackError::IncompatibleVariables {
                        variable: name.clone(),
                        reason: format!("missing from dataset {}", i),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            concat_arrays(name, &present, dim)?
        } else {
            if is_coordinate && coords == CoordsMode::All {
                return Err(ChunkStackError::Unsupported(format!(
                    "coordinate '{}' lacks dimension '{}' and cannot be concatenated",
                    name, dim
                )));
            }
            pick(name, &instances, compat)?
        };
        if is_coordinate {
            combined.coordinates.insert(name.clone());
        }
        combined.variables.insert(name.clone(), array);
    }

    info!(
        inputs = datasets.len(),
        dim,
        variables = combined.variables.len(),
        extent = combined.dimensions().get(dim).copied().unwrap_or_default(),
        "Concatenated virtual datasets"
    );
    Ok(combined)
}

/// Every dimension other than `dim` must have one size across all arrays of
/// all inputs.
fn check_other_dimensions(datasets: &[VirtualDataset], dim: &str) -> Result<()> {
    let mut sizes: BTreeMap<&str, usize> = BTreeMap::new();
    let arrays = datasets.iter().flat_map(|d| d.variables.values());
    for array in arrays {
        for (name, &size) in array.dims().iter().zip(array.shape()) {
            if name == dim {
                continue;
            }
            let existing = *sizes.entry(name.as_str()).or_insert(size);
            if existing != size {
                return Err(ChunkStackError::DimensionMismatch {
                    dimension: name.clone(),
                    existing,
                    found: size,
                });
            }
        }
    }
    Ok(())
}

fn pick(name: &str, instances: &[Option<&VirtualArray>], compat: Compat) -> Result<VirtualArray> {
    match compat {
        Compat::Override => instances
            .iter()
            .flatten()
            .next()
            .map(|a| (*a).clone())
            .ok_or_else(|| ChunkStackError::VariableNotFound(name.to_string())),
        Compat::Equals => {
            let mut iter = instances.iter().enumerate();
            let first = match iter.next() {
                Some((_, Some(a))) => *a,
                _ => {
                    return Err(ChunkStackError::IncompatibleVariables {
                        variable: name.to_string(),
                        reason: "missing from dataset 0".to_string(),
                    })
                }
            };
            for (i, other) in iter {
                if *other != Some(first) {
                    return Err(ChunkStackError::IncompatibleVariables {
                        variable: name.to_string(),
                        reason: format!("dataset {} does not hold an equal variable", i),
                    });
                }
            }
            Ok(first.clone())
        }
    }
}

fn concat_arrays(name: &str, arrays: &[&VirtualArray], dim: &str) -> Result<VirtualArray> {
    let first = arrays[0];
    let axis = first
        .dims()
        .iter()
        .position(|d| d == dim)
        .ok_or_else(|| ChunkStackError::DimensionNotFound(dim.to_string()))?;
    let rank = first.shape().len();
    let chunk = first.metadata.grid()?.chunk_shape()[axis];

    let mut manifest = ChunkManifest::new();
    let mut extent = 0;
    for (i, array) in arrays.iter().enumerate() {
        first.check_aligned(name, array, axis)?;
        let length = array.shape()[axis];
        if i + 1 < arrays.len() && length % chunk != 0 {
            return Err(ChunkStackError::ChunkMisaligned {
                variable: name.to_string(),
                dimension: dim.to_string(),
                extent: length,
                chunk,
            });
        }
        manifest.merge(array.manifest.shifted(rank, axis, extent / chunk)?);
        extent += length;
    }

    let mut metadata = first.metadata.clone();
    metadata.shape[axis] = extent;
    debug!(variable = name, axis, extent, chunks = manifest.len(), "Concatenated array");
    Ok(VirtualArray { metadata, manifest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        encoding::ChunkEncoding,
        manifest::ChunkRef,
        types::DataType,
        virtual_dataset::ArrayMetadata,
    };

    fn array(location: &str, dims: &[&str], shape: &[usize], chunks: &[usize]) -> VirtualArray {
        let metadata = ArrayMetadata {
            shape: shape.to_vec(),
            chunk_shape: chunks.to_vec(),
            dimension_names: dims.iter().map(|d| d.to_string()).collect(),
            source_dtype: DataType::UInt32,
            encoding: ChunkEncoding {
                dtype: DataType::UInt32,
                shuffle: false,
                compression: None,
                fletcher32: false,
                scale_offset: None,
                fill_value: 0.0,
            },
            attributes: Default::default(),
        };
        let grid = metadata.grid().unwrap();
        let mut manifest = ChunkManifest::new();
        for (offset, index) in grid.chunk_indices().enumerate() {
            manifest.insert(
                &index,
                ChunkRef {
                    location: location.to_string(),
                    offset: offset as u64,
                    length: 1,
                },
            );
        }
        VirtualArray { metadata, manifest }
    }

    fn dataset(location: &str, z: usize) -> VirtualDataset {
        let mut ds = VirtualDataset::default();
        let data = array(location, &["z", "y"], &[z, 4], &[1, 2]);
        ds.variables.insert("data".into(), data);
        ds.variables.insert("y".into(), array(location, &["y"], &[4], &[4]));
        ds.coordinates.insert("y".into());
        ds.attributes.insert("source".into(), location.into());
        ds
    }

    fn minimal(datasets: &[VirtualDataset], dim: &str) -> Result<VirtualDataset> {
        concat(datasets, dim, CoordsMode::Minimal, Compat::Override)
    }

    #[test]
    fn manifests_are_shifted_along_the_axis() {
        let combined = minimal(&[dataset("/a", 2), dataset("/b", 3)], "z").unwrap();
        let data = combined.variable("data").unwrap();
        assert_eq!(data.shape(), &[5, 4]);
        assert_eq!(data.manifest.len(), 10);
        assert_eq!(data.manifest.get(&[1, 1]).unwrap().location, "/a");
        assert_eq!(data.manifest.get(&[2, 0]).unwrap().location, "/b");
        assert_eq!(data.manifest.get(&[4, 1]).unwrap().offset, 5);
        // not concatenated, and attributes come from the first input
        let y = combined.variable("y").unwrap();
        assert_eq!(y.manifest.get(&[0]).unwrap().location, "/a");
        assert!(combined.is_coordinate("y"));
        assert_eq!(combined.attributes["source"], "/a");
    }

    #[test]
    fn missing_dimension_is_rejected() {
        let err = minimal(&[dataset("/a", 2), dataset("/b", 2)], "t").unwrap_err();
        assert!(matches!(err, ChunkStackError::DimensionNotFound(d) if d == "t"));
    }

    #[test]
    fn partial_chunks_only_allowed_last() {
        let mut a = VirtualDataset::default();
        a.variables.insert("data".into(), array("/a", &["z"], &[3], &[2]));
        let mut b = a.clone();
        b.variables.insert("data".into(), array("/b", &["z"], &[4], &[2]));
        let err = minimal(&[a.clone(), b.clone()], "z").unwrap_err();
        assert!(matches!(err, ChunkStackError::ChunkMisaligned { extent: 3, chunk: 2, .. }));
        let ok = minimal(&[b, a], "z").unwrap();
        assert_eq!(ok.variable("data").unwrap().shape(), &[7]);
    }

    #[test]
    fn mismatched_layouts_are_incompatible() {
        let a = dataset("/a", 2);
        let mut b = dataset("/b", 2);
        b.variables.insert("data".into(), array("/b", &["z", "y"], &[2, 4], &[1, 4]));
        let err = minimal(&[a, b], "z").unwrap_err();
        assert!(matches!(err, ChunkStackError::IncompatibleVariables { .. }));
    }

    #[test]
    fn other_dimensions_must_agree_across_inputs() {
        let mut a = dataset("/a", 2);
        a.variables.insert("aux".into(), array("/a", &["x"], &[10], &[5]));
        let mut b = dataset("/b", 2);
        b.variables.insert("aux".into(), array("/b", &["x"], &[12], &[6]));
        let err = minimal(&[a, b], "z").unwrap_err();
        assert!(
            matches!(
                &err,
                ChunkStackError::DimensionMismatch { dimension, existing: 10, found: 12 }
                    if dimension == "x"
            ),
            "{:?}",
            err
        );
    }

    #[test]
    fn malformed_metadata_is_an_error_not_a_panic() {
        let a = dataset("/a", 2);
        let mut b = dataset("/b", 2);
        b.variables.get_mut("data").unwrap().metadata.chunk_shape = vec![0, 2];
        let err = minimal(&[a.clone(), b], "z").unwrap_err();
        assert!(matches!(err, ChunkStackError::InvalidChunkShape { .. }), "{:?}", err);

        let mut c = dataset("/c", 2);
        c.variables.get_mut("data").unwrap().metadata.dimension_names = vec!["z".into()];
        let err = minimal(&[a, c], "z").unwrap_err();
        assert!(matches!(err, ChunkStackError::RankMismatch { dims: 1, rank: 2, .. }));
    }

    #[test]
    fn equals_compares_and_all_rejects_unconcatenable_coords() {
        let inputs = [dataset("/a", 2), dataset("/b", 2)];
        let err = concat(&inputs, "z", CoordsMode::Minimal, Compat::Equals).unwrap_err();
        assert!(matches!(
            err,
            ChunkStackError::IncompatibleVariables { variable, .. } if variable == "y"
        ));
        let same = [dataset("/a", 2), dataset("/a", 2)];
        let same = concat(&same, "z", CoordsMode::Minimal, Compat::Equals).unwrap();
        assert_eq!(same.variable("data").unwrap().shape(), &[4, 4]);
        let err = concat(&inputs, "z", CoordsMode::All, Compat::Override).unwrap_err();
        assert!(matches!(err, ChunkStackError::Unsupported(_)));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(concat(&[], "z", CoordsMode::Minimal, Compat::Override).is_err());
    }
}
