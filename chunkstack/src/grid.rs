//! Regular chunk grids over n-dimensional arrays.
use ndarray::{ArrayD, IxDyn};

use crate::error::{ChunkStackError, Result};

/// Chunk index to manifest key, e.g. `[0, 1, 2]` -> `"0.1.2"`. Rank 0 maps to `"0"`.
pub fn chunk_key(index: &[usize]) -> String {
    if index.is_empty() {
        return "0".to_string();
    }
    index
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Inverse of [`chunk_key`] for arrays of the given rank.
pub fn parse_chunk_key(key: &str, rank: usize) -> Option<Vec<usize>> {
    if rank == 0 {
        return (key == "0").then(Vec::new);
    }
    let index = key
        .split('.')
        .map(|part| part.parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;
    (index.len() == rank).then_some(index)
}

/// A regular grid of equally shaped chunks. Edge chunks are stored padded to
/// the full chunk shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGrid {
    shape: Vec<usize>,
    chunk_shape: Vec<usize>,
}

impl ChunkGrid {
    /// Validates that `chunk_shape` has the array's rank and that every extent is
    /// in `1..=max(dim, 1)`.
    pub fn new(shape: Vec<usize>, chunk_shape: Vec<usize>) -> Result<Self> {
        let invalid = |reason: String| ChunkStackError::InvalidChunkShape {
            shape: shape.clone(),
            chunk_shape: chunk_shape.clone(),
            reason,
        };
        if chunk_shape.len() != shape.len() {
            return Err(invalid(format!(
                "chunk rank {} does not match array rank {}",
                chunk_shape.len(),
                shape.len()
            )));
        }
        for (axis, (&chunk, &dim)) in chunk_shape.iter().zip(&shape).enumerate() {
            if chunk == 0 || chunk > dim.max(1) {
                return Err(invalid(format!(
                    "chunk extent {} on axis {} must be between 1 and {}",
                    chunk,
                    axis,
                    dim.max(1)
                )));
            }
        }
        Ok(Self { shape, chunk_shape })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn chunk_shape(&self) -> &[usize] {
        &self.chunk_shape
    }

    /// Number of chunks along each axis.
    pub fn grid_shape(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(dim, chunk)| dim.div_ceil(*chunk))
            .collect()
    }

    pub fn num_chunks(&self) -> usize {
        self.grid_shape().iter().product()
    }

    /// Elements per (padded) chunk.
    pub fn chunk_len(&self) -> usize {
        self.chunk_shape.iter().product()
    }

    pub fn contains(&self, index: &[usize]) -> bool {
        index.len() == self.shape.len()
            && index.iter().zip(self.grid_shape()).all(|(i, n)| *i < n)
    }

    /// All chunk indices in row-major order.
    pub fn chunk_indices(&self) -> impl Iterator<Item = Vec<usize>> {
        let rank = self.shape.len();
        ndarray::indices(IxDyn(&self.grid_shape()))
            .into_iter()
            .map(move |ix| (0..rank).map(|axis| ix[axis]).collect())
    }

    /// Copies one chunk out of `data` in row-major order, padding with `fill`
    /// past the array edge.
    pub fn extract(&self, data: &ArrayD<f64>, index: &[usize], fill: f64) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.chunk_len());
        let mut global = vec![0usize; self.shape.len()];
        for local in ndarray::indices(IxDyn(&self.chunk_shape)) {
            let mut inside = true;
            for axis in 0..global.len() {
                global[axis] = index[axis] * self.chunk_shape[axis] + local[axis];
                inside &= global[axis] < self.shape[axis];
            }
            values.push(if inside { data[global.as_slice()] } else { fill });
        }
        values
    }

    /// Writes one decoded chunk into `out`, dropping the padding.
    pub fn insert(&self, out: &mut ArrayD<f64>, index: &[usize], values: &[f64]) {
        let mut global = vec![0usize; self.shape.len()];
        for (local, value) in ndarray::indices(IxDyn(&self.chunk_shape)).into_iter().zip(values) {
            let mut inside = true;
            for axis in 0..global.len() {
                global[axis] = index[axis] * self.chunk_shape[axis] + local[axis];
                inside &= global[axis] < self.shape[axis];
            }
            if inside {
                out[global.as_slice()] = *value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        assert_eq!(chunk_key(&[0, 1, 2]), "0.1.2");
        assert_eq!(parse_chunk_key("0.1.2", 3), Some(vec![0, 1, 2]));
        assert_eq!(parse_chunk_key("0.1", 3), None);
        assert_eq!(parse_chunk_key("a.1.2", 3), None);
        assert_eq!(parse_chunk_key(&chunk_key(&[]), 0), Some(vec![]));
    }

    #[test]
    fn grid_shape_rounds_up() {
        let grid = ChunkGrid::new(vec![2, 5, 10], vec![1, 2, 2]).unwrap();
        assert_eq!(grid.grid_shape(), vec![2, 3, 5]);
        assert_eq!(grid.num_chunks(), 30);
        assert!(grid.contains(&[1, 2, 4]));
        assert!(!grid.contains(&[1, 3, 0]));
        assert!(!grid.contains(&[1, 2]));
    }

    #[test]
    fn chunk_extent_bounds() {
        assert!(ChunkGrid::new(vec![2, 5], vec![0, 1]).is_err());
        assert!(ChunkGrid::new(vec![2, 5], vec![3, 1]).is_err());
        assert!(ChunkGrid::new(vec![0], vec![1]).is_ok());
    }

    #[test]
    fn indices_are_row_major() {
        let grid = ChunkGrid::new(vec![2, 3], vec![1, 2]).unwrap();
        let indices: Vec<_> = grid.chunk_indices().collect();
        assert_eq!(
            indices,
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
    }

    #[test]
    fn extract_pads_edge_chunks_and_insert_crops() {
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0., 1., 2., 3., 4., 5.]).unwrap();
        let grid = ChunkGrid::new(vec![2, 3], vec![2, 2]).unwrap();
        assert_eq!(grid.extract(&data, &[0, 0], -1.0), vec![0., 1., 3., 4.]);
        assert_eq!(grid.extract(&data, &[0, 1], -1.0), vec![2., -1., 5., -1.]);

        let mut out = ArrayD::zeros(IxDyn(&[2, 3]));
        for index in grid.chunk_indices() {
            let values = grid.extract(&data, &index, -1.0);
            grid.insert(&mut out, &index, &values);
        }
        assert_eq!(out, data);
    }
}
