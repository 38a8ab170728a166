use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::error::{ChunkStackError, Result};

/// Free-form metadata attached to variables, datasets and groups.
pub type Attributes = BTreeMap<String, serde_json::Value>;

// --- Basic Data Types ---

/// Element types an array can be stored as. Elements are always little-endian on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        f.write_str(name)
    }
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::UInt8 | DataType::Int8 => 1,
            DataType::UInt16 | DataType::Int16 => 2,
            DataType::UInt32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::UInt64 | DataType::Int64 | DataType::Float64 => 8,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Inclusive lower and exclusive upper bound of the integer types, as f64.
    fn integer_bounds(&self) -> Option<(f64, f64)> {
        let bounds = match self {
            DataType::UInt8 => (0.0, 256.0),
            DataType::UInt16 => (0.0, 65_536.0),
            DataType::UInt32 => (0.0, 4_294_967_296.0),
            DataType::UInt64 => (0.0, 18_446_744_073_709_551_616.0),
            DataType::Int8 => (-128.0, 128.0),
            DataType::Int16 => (-32_768.0, 32_768.0),
            DataType::Int32 => (-2_147_483_648.0, 2_147_483_648.0),
            DataType::Int64 => (-9_223_372_036_854_775_808.0, 9_223_372_036_854_775_808.0),
            DataType::Float32 | DataType::Float64 => return None,
        };
        Some(bounds)
    }

    /// Checks that `value` is exactly representable (integers) or in range (floats).
    pub fn check(&self, value: f64) -> Result<()> {
        let ok = match (self, self.integer_bounds()) {
            (_, Some((low, high))) => {
                value.is_finite() && value.fract() == 0.0 && value >= low && value < high
            }
            (DataType::Float32, None) => !value.is_finite() || value.abs() <= f32::MAX as f64,
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ChunkStackError::ValueOutOfRange {
                value,
                dtype: *self,
            })
        }
    }

    /// Serializes `values` as little-endian elements of this type.
    ///
    /// Every value is range checked first; nothing is truncated silently.
    pub fn encode_values(&self, values: &[f64]) -> Result<Vec<u8>> {
        let size = self.size();
        let mut buf = vec![0u8; values.len() * size];
        for (value, out) in values.iter().zip(buf.chunks_exact_mut(size)) {
            self.check(*value)?;
            let v = *value;
            match self {
                DataType::UInt8 => out[0] = v as u8,
                DataType::Int8 => out[0] = (v as i8) as u8,
                DataType::UInt16 => LittleEndian::write_u16(out, v as u16),
                DataType::Int16 => LittleEndian::write_i16(out, v as i16),
                DataType::UInt32 => LittleEndian::write_u32(out, v as u32),
                DataType::Int32 => LittleEndian::write_i32(out, v as i32),
                DataType::UInt64 => LittleEndian::write_u64(out, v as u64),
                DataType::Int64 => LittleEndian::write_i64(out, v as i64),
                DataType::Float32 => LittleEndian::write_f32(out, v as f32),
                DataType::Float64 => LittleEndian::write_f64(out, v),
            }
        }
        Ok(buf)
    }

    /// Reads little-endian elements of this type back into f64.
    pub fn decode_values(&self, bytes: &[u8]) -> Result<Vec<f64>> {
        let size = self.size();
        if bytes.len() % size != 0 {
            return Err(ChunkStackError::DecompressionError(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                self
            )));
        }
        let values = bytes
            .chunks_exact(size)
            .map(|b| match self {
                DataType::UInt8 => b[0] as f64,
                DataType::Int8 => (b[0] as i8) as f64,
                DataType::UInt16 => LittleEndian::read_u16(b) as f64,
                DataType::Int16 => LittleEndian::read_i16(b) as f64,
                DataType::UInt32 => LittleEndian::read_u32(b) as f64,
                DataType::Int32 => LittleEndian::read_i32(b) as f64,
                DataType::UInt64 => LittleEndian::read_u64(b) as f64,
                DataType::Int64 => LittleEndian::read_i64(b) as f64,
                DataType::Float32 => LittleEndian::read_f32(b) as f64,
                DataType::Float64 => LittleEndian::read_f64(b),
            })
            .collect();
        Ok(values)
    }
}

/// Rust element types that map onto a [`DataType`].
///
/// Values are widened to f64 in memory; 64-bit integers above 2^53 lose precision.
pub trait Element: Copy + 'static {
    const DATA_TYPE: DataType;

    fn into_f64(self) -> f64;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$dtype;

                fn into_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_element!(
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
);
