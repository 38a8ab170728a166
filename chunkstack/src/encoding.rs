//! Per-variable storage encoding.
//!
//! [`StorageEncoding`] is what a caller asks for (the keys mirror the usual
//! netCDF encoding dictionary: `zlib`, `complevel`, `shuffle`, `chunksizes`,
//! `scale_factor`, `add_offset`, `dtype`, `fletcher32`). Resolving it against a
//! [`Variable`] yields the [`ChunkEncoding`] that is actually applied to every
//! chunk and recorded next to the data.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{
    compression,
    dataset::Variable,
    error::{ChunkStackError, Result},
    grid::ChunkGrid,
    types::DataType,
};

/// Default zlib level, as used by netCDF4 when only `zlib: true` is given.
pub const DEFAULT_ZLIB_LEVEL: u32 = 4;

/// Packed type used for scale/offset quantization when no `dtype` is requested.
pub const DEFAULT_PACKED_DTYPE: DataType = DataType::Int32;

/// Encodings keyed by variable name. Variables without an entry are stored
/// contiguously and uncompressed.
pub type EncodingMap = BTreeMap<String, StorageEncoding>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Compression {
    Zlib { level: u32 },
    Zstd { level: i32 },
}

/// Affine quantization: `decoded = stored * scale_factor + add_offset`.
///
/// Arithmetic follows the zarr `numcodecs.fixedscaleoffset` codec, which
/// multiplies by `1 / scale_factor` when packing and divides by it when
/// unpacking, so both readers produce the same bits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleOffset {
    pub scale_factor: f64,
    pub add_offset: f64,
}

impl ScaleOffset {
    /// The packing multiplier, `1 / scale_factor`.
    pub fn scale(&self) -> f64 {
        1.0 / self.scale_factor
    }

    /// Maps a decoded value into packed space. Integer packed types round to nearest.
    pub fn pack(&self, value: f64, packed: DataType) -> f64 {
        let stored = (value - self.add_offset) * self.scale();
        if packed.is_integer() {
            stored.round()
        } else {
            stored
        }
    }

    pub fn unpack(&self, stored: f64) -> f64 {
        stored / self.scale() + self.add_offset
    }
}

/// Requested storage options for one variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageEncoding {
    /// Byte-shuffle filter before compression.
    pub shuffle: bool,
    /// Shortcut for `compression: Zlib { level: complevel }`.
    pub zlib: bool,
    pub complevel: Option<u32>,
    /// Explicit compressor; takes precedence over `zlib`/`complevel`.
    pub compression: Option<Compression>,
    /// Physical chunk shape; the whole array is one chunk when absent.
    pub chunksizes: Option<Vec<usize>>,
    pub scale_factor: Option<f64>,
    pub add_offset: Option<f64>,
    /// On-disk element type.
    pub dtype: Option<DataType>,
    /// Append a Fletcher-32 checksum to every chunk.
    pub fletcher32: bool,
}

/// The codec chain applied to each chunk of a stored array.
///
/// Encode order: quantize, serialize little-endian, shuffle, compress, checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEncoding {
    /// On-disk element type.
    pub dtype: DataType,
    pub shuffle: bool,
    pub compression: Option<Compression>,
    pub fletcher32: bool,
    pub scale_offset: Option<ScaleOffset>,
    /// Packed value used to pad edge chunks and stand in for missing chunks.
    pub fill_value: f64,
}

impl StorageEncoding {
    /// Resolves the requested options for `variable` into a codec chain and chunk grid.
    pub fn resolve(&self, variable: &Variable) -> Result<(ChunkEncoding, ChunkGrid)> {
        let name = &variable.name;
        let shape = variable.shape().to_vec();

        let chunk_shape = match &self.chunksizes {
            Some(chunks) => chunks.clone(),
            None => shape.iter().map(|&d| d.max(1)).collect(),
        };
        let grid = ChunkGrid::new(shape, chunk_shape)?;

        let compression = match (self.compression, self.zlib) {
            (Some(Compression::Zstd { .. }), true) => {
                return Err(ChunkStackError::FilterConflict {
                    variable: name.clone(),
                    reason: "zlib and zstd compression requested together".to_string(),
                })
            }
            (Some(c), _) => Some(c),
            (None, true) => Some(Compression::Zlib {
                level: self.complevel.unwrap_or(DEFAULT_ZLIB_LEVEL),
            }),
            (None, false) => None,
        };
        match compression {
            Some(Compression::Zlib { level }) if level > 9 => {
                return Err(ChunkStackError::InvalidEncoding {
                    variable: name.clone(),
                    reason: format!("zlib level {} is outside 0..=9", level),
                })
            }
            Some(Compression::Zstd { level }) if !(-7..=22).contains(&level) => {
                return Err(ChunkStackError::InvalidEncoding {
                    variable: name.clone(),
                    reason: format!("zstd level {} is outside -7..=22", level),
                })
            }
            _ => {}
        }

        let scale_offset = if self.scale_factor.is_some() || self.add_offset.is_some() {
            let scale_factor = self.scale_factor.unwrap_or(1.0);
            let add_offset = self.add_offset.unwrap_or(0.0);
            if !scale_factor.is_finite() || scale_factor == 0.0 || !add_offset.is_finite() {
                return Err(ChunkStackError::InvalidEncoding {
                    variable: name.clone(),
                    reason: format!(
                        "scale_factor {} / add_offset {} must be finite and scale_factor non-zero",
                        scale_factor, add_offset
                    ),
                });
            }
            Some(ScaleOffset {
                scale_factor,
                add_offset,
            })
        } else {
            None
        };

        // checksums cover packed bytes only
        if self.fletcher32 && scale_offset.is_some() {
            return Err(ChunkStackError::FilterConflict {
                variable: name.clone(),
                reason: "fletcher32 cannot be combined with scale_factor/add_offset".to_string(),
            });
        }

        let dtype = match (self.dtype, scale_offset) {
            (Some(dtype), _) => dtype,
            (None, Some(_)) => DEFAULT_PACKED_DTYPE,
            (None, None) => variable.dtype,
        };

        let encoding = ChunkEncoding {
            dtype,
            shuffle: self.shuffle,
            compression,
            fletcher32: self.fletcher32,
            scale_offset,
            fill_value: 0.0,
        };
        debug!(
            variable = %name,
            ?encoding,
            chunk_shape = ?grid.chunk_shape(),
            "Resolved storage encoding"
        );
        Ok((encoding, grid))
    }
}

impl ChunkEncoding {
    /// The element type values have after decoding.
    pub fn decoded_dtype(&self, source: DataType) -> DataType {
        if self.scale_offset.is_some() {
            DataType::Float64
        } else {
            source
        }
    }

    /// Quantizes and serializes decoded values into raw chunk bytes.
    pub fn pack(&self, values: &[f64]) -> Result<Vec<u8>> {
        match &self.scale_offset {
            Some(so) => {
                let packed: Vec<f64> = values.iter().map(|v| so.pack(*v, self.dtype)).collect();
                self.dtype.encode_values(&packed)
            }
            None => self.dtype.encode_values(values),
        }
    }

    /// Inverse of [`ChunkEncoding::pack`].
    pub fn unpack(&self, raw: &[u8]) -> Result<Vec<f64>> {
        let mut values = self.dtype.decode_values(raw)?;
        if let Some(so) = &self.scale_offset {
            values.iter_mut().for_each(|v| *v = so.unpack(*v));
        }
        Ok(values)
    }

    /// Runs the full codec chain over one chunk of decoded values.
    pub fn encode_chunk(&self, values: &[f64]) -> Result<Vec<u8>> {
        let raw = self.pack(values)?;
        compression::encode_chunk(raw, self)
    }

    /// Reverses [`ChunkEncoding::encode_chunk`].
    pub fn decode_chunk(&self, stored: &[u8]) -> Result<Vec<f64>> {
        let raw = compression::decode_chunk(stored, self)?;
        self.unpack(&raw)
    }

    /// The decoded value of a chunk that was never written.
    pub fn decoded_fill_value(&self) -> f64 {
        match &self.scale_offset {
            Some(so) => so.unpack(self.fill_value),
            None => self.fill_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn variable() -> Variable {
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 5, 10]), (0..100u32).collect()).unwrap();
        Variable::from_array("data", &["z", "y", "x"], data).unwrap()
    }

    fn pipeline_encoding() -> StorageEncoding {
        StorageEncoding {
            shuffle: true,
            zlib: true,
            chunksizes: Some(vec![1, 2, 2]),
            scale_factor: Some(0.1),
            add_offset: Some(3.0),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_pipeline_encoding() {
        let (encoding, grid) = pipeline_encoding().resolve(&variable()).unwrap();
        assert_eq!(encoding.dtype, DataType::Int32);
        assert_eq!(encoding.compression, Some(Compression::Zlib { level: 4 }));
        assert!(encoding.shuffle);
        assert_eq!(grid.chunk_shape(), &[1, 2, 2]);
        assert_eq!(grid.grid_shape(), vec![2, 3, 5]);
        assert_eq!(encoding.decoded_dtype(DataType::UInt32), DataType::Float64);
    }

    #[test]
    fn defaults_to_source_dtype_without_quantization() {
        let (encoding, grid) = StorageEncoding::default().resolve(&variable()).unwrap();
        assert_eq!(encoding.dtype, DataType::UInt32);
        assert_eq!(encoding.compression, None);
        assert_eq!(grid.chunk_shape(), &[2, 5, 10]);
    }

    #[test]
    fn fletcher32_and_quantization_conflict() {
        let encoding = StorageEncoding {
            fletcher32: true,
            ..pipeline_encoding()
        };
        let err = encoding.resolve(&variable()).unwrap_err();
        assert!(matches!(err, ChunkStackError::FilterConflict { .. }));
    }

    #[test]
    fn chunk_rank_must_match() {
        let encoding = StorageEncoding {
            chunksizes: Some(vec![1, 2]),
            ..Default::default()
        };
        let err = encoding.resolve(&variable()).unwrap_err();
        assert!(matches!(err, ChunkStackError::InvalidChunkShape { .. }));
    }

    #[test]
    fn zero_scale_factor_is_rejected() {
        let encoding = StorageEncoding {
            scale_factor: Some(0.0),
            ..Default::default()
        };
        assert!(encoding.resolve(&variable()).is_err());
    }

    #[test]
    fn quantization_round_trips_within_precision() {
        let (encoding, _) = pipeline_encoding().resolve(&variable()).unwrap();
        let values = [0.0, 0.04, 99.0, 199.0, 3.26];
        let bytes = encoding.encode_chunk(&values).unwrap();
        let decoded = encoding.decode_chunk(&bytes).unwrap();
        for (v, d) in values.iter().zip(&decoded) {
            assert!((v - d).abs() <= 0.05 + 1e-9, "{} decoded as {}", v, d);
        }
    }

    #[test]
    fn quantization_out_of_range_is_an_error() {
        let encoding = StorageEncoding {
            scale_factor: Some(0.1),
            dtype: Some(DataType::UInt8),
            ..Default::default()
        };
        let (encoding, _) = encoding.resolve(&variable()).unwrap();
        assert!(encoding.pack(&[1.0]).is_ok());
        let err = encoding.pack(&[100.0]).unwrap_err();
        assert!(matches!(err, ChunkStackError::ValueOutOfRange { .. }));
    }

    #[test]
    fn explicit_zstd_is_used() {
        let encoding = StorageEncoding {
            compression: Some(Compression::Zstd { level: 3 }),
            ..Default::default()
        };
        let (encoding, _) = encoding.resolve(&variable()).unwrap();
        let values: Vec<f64> = (0..50).map(|v| v as f64).collect();
        let bytes = encoding.encode_chunk(&values).unwrap();
        assert_eq!(encoding.decode_chunk(&bytes).unwrap(), values);
    }

    #[test]
    fn encoding_map_deserializes_from_netcdf_style_keys() {
        let json = r#"{"data": {"shuffle": true, "zlib": true, "chunksizes": [1, 2, 2],
                       "scale_factor": 0.1, "add_offset": 3.0}}"#;
        let map: EncodingMap = serde_json::from_str(json).unwrap();
        assert_eq!(map["data"], pipeline_encoding());
    }
}
