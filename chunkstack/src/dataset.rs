//! In-memory labeled arrays and datasets.
use ndarray::{Array, ArrayD, Dimension};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{ChunkStackError, Result},
    types::{Attributes, DataType, Element},
};

/// A dense n-dimensional array with named dimensions.
///
/// Values are kept as f64 whatever the source type; `dtype` remembers the type
/// the values came from, which is also the default on-disk type.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    pub dtype: DataType,
    pub data: ArrayD<f64>,
    pub attributes: Attributes,
}

impl Variable {
    /// Creates a variable, checking that there is one unique dimension name per axis.
    pub fn new(
        name: impl Into<String>,
        dims: Vec<String>,
        dtype: DataType,
        data: ArrayD<f64>,
    ) -> Result<Self> {
        let name = name.into();
        if dims.len() != data.ndim() {
            return Err(ChunkStackError::RankMismatch {
                variable: name,
                dims: dims.len(),
                rank: data.ndim(),
            });
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = dims.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(ChunkStackError::DuplicateDimension {
                dimension: dup.clone(),
                variable: name,
            });
        }
        Ok(Self {
            name,
            dims,
            dtype,
            data,
            attributes: Attributes::new(),
        })
    }

    /// Wraps a typed ndarray, recording its element type.
    pub fn from_array<T: Element, D: Dimension>(
        name: impl Into<String>,
        dims: &[&str],
        data: Array<T, D>,
    ) -> Result<Self> {
        let dims = dims.iter().map(|d| d.to_string()).collect();
        let data = data.mapv(Element::into_f64).into_dyn();
        Self::new(name, dims, T::DATA_TYPE, data)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Returns a copy with `f` applied elementwise. The source type is kept.
    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            data: self.data.mapv(f),
            ..self.clone()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// A collection of variables sharing a dimension space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    variables: BTreeMap<String, Variable>,
    coords: BTreeSet<String>,
    pub attributes: Attributes,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dataset from data variables, as in `Dataset({"data": da})`.
    pub fn from_variables(variables: impl IntoIterator<Item = Variable>) -> Result<Self> {
        let mut dataset = Self::new();
        for variable in variables {
            dataset.add_variable(variable)?;
        }
        Ok(dataset)
    }

    /// Adds (or replaces) a data variable.
    pub fn add_variable(&mut self, variable: Variable) -> Result<()> {
        self.check_dimensions(&variable)?;
        self.coords.remove(&variable.name);
        self.variables.insert(variable.name.clone(), variable);
        Ok(())
    }

    /// Adds (or replaces) a coordinate variable.
    pub fn add_coordinate(&mut self, variable: Variable) -> Result<()> {
        self.check_dimensions(&variable)?;
        self.coords.insert(variable.name.clone());
        self.variables.insert(variable.name.clone(), variable);
        Ok(())
    }

    fn check_dimensions(&self, variable: &Variable) -> Result<()> {
        let known = self.dimensions_excluding(&variable.name);
        for (dim, size) in variable.dims.iter().zip(variable.shape()) {
            if let Some(existing) = known.get(dim) {
                if existing != size {
                    return Err(ChunkStackError::DimensionMismatch {
                        dimension: dim.clone(),
                        existing: *existing,
                        found: *size,
                    });
                }
            }
        }
        Ok(())
    }

    fn dimensions_excluding(&self, skip: &str) -> BTreeMap<String, usize> {
        let mut dims = BTreeMap::new();
        for variable in self.variables.values().filter(|v| v.name != skip) {
            for (dim, size) in variable.dims.iter().zip(variable.shape()) {
                dims.insert(dim.clone(), *size);
            }
        }
        dims
    }

    /// Dimension name to size over all variables.
    pub fn dimensions(&self) -> BTreeMap<String, usize> {
        self.dimensions_excluding("")
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn is_coordinate(&self, name: &str) -> bool {
        self.coords.contains(name)
    }

    pub fn coordinate_names(&self) -> &BTreeSet<String> {
        &self.coords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, ArrayD, IxDyn};

    fn ramp(shape: &[usize]) -> ArrayD<u32> {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n as u32).collect()).unwrap()
    }

    #[test]
    fn rank_must_match_dims() {
        let err = Variable::from_array("data", &["z", "y"], ramp(&[2, 5, 10])).unwrap_err();
        assert!(matches!(err, ChunkStackError::RankMismatch { dims: 2, rank: 3, .. }));
    }

    #[test]
    fn from_array_records_dtype() {
        let var = Variable::from_array("data", &["z", "y", "x"], ramp(&[2, 5, 10])).unwrap();
        assert_eq!(var.dtype, DataType::UInt32);
        assert_eq!(var.shape(), &[2, 5, 10]);
        assert_eq!(var.data[[1, 4, 9]], 99.0);
    }

    #[test]
    fn map_values_keeps_dtype() {
        let var = Variable::from_array("data", &["x"], Array1::from(vec![1u32, 2])).unwrap();
        let shifted = var.map_values(|v| v + 100.0);
        assert_eq!(shifted.dtype, DataType::UInt32);
        assert_eq!(shifted.data.as_slice().unwrap(), &[101.0, 102.0]);
    }

    #[test]
    fn dimension_sizes_must_agree() {
        let a = Variable::from_array("a", &["x"], Array1::from(vec![1u32, 2])).unwrap();
        let b = Variable::from_array("b", &["x"], Array1::from(vec![1u32, 2, 3])).unwrap();
        let mut ds = Dataset::from_variables([a]).unwrap();
        let err = ds.add_variable(b).unwrap_err();
        assert!(matches!(err, ChunkStackError::DimensionMismatch { existing: 2, found: 3, .. }));
    }

    #[test]
    fn replacing_a_variable_may_resize_its_dims() {
        let a = Variable::from_array("a", &["x"], Array1::from(vec![1u32, 2])).unwrap();
        let a2 = Variable::from_array("a", &["x"], Array1::from(vec![1u32, 2, 3])).unwrap();
        let mut ds = Dataset::from_variables([a]).unwrap();
        ds.add_variable(a2).unwrap();
        assert_eq!(ds.dimensions().get("x"), Some(&3));
    }

    #[test]
    fn coordinates_are_tracked() {
        let x = Variable::from_array("x", &["x"], Array1::from(vec![0.5f64, 1.5])).unwrap();
        let mut ds = Dataset::new();
        ds.add_coordinate(x).unwrap();
        assert!(ds.is_coordinate("x"));
        assert_eq!(ds.variables().count(), 1);
    }
}
