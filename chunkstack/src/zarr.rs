//! Zarr v3 node documents (`zarr.json`) for groups and virtual arrays.
//!
//! The codec chain of a [`ChunkEncoding`] maps one to one onto zarr codecs, so
//! chunks written into a container decode unchanged through any zarr v3 reader
//! once the repository points at them.
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::{
    encoding::{ChunkEncoding, Compression},
    error::{ChunkStackError, Result},
    types::{Attributes, DataType},
    virtual_dataset::ArrayMetadata,
};

/// Group attribute under which this crate keeps its own bookkeeping. User
/// attributes may not use it.
pub const RESERVED_ATTRIBUTE: &str = "_chunkstack";

/// Store key of the metadata document of the node at `path` (`/`, `/data`).
pub fn node_key(path: &str) -> String {
    match path.trim_matches('/') {
        "" => "zarr.json".to_string(),
        rest => format!("{}/zarr.json", rest),
    }
}

/// Absolute path of `name` inside `group`.
pub fn join_path(group: &str, name: &str) -> String {
    match group.trim_end_matches('/') {
        "" => format!("/{}", name),
        group => format!("{}/{}", group, name),
    }
}

/// Little-endian numpy type string, as the numcodecs codecs expect.
fn numpy_dtype(dtype: DataType) -> &'static str {
    match dtype {
        DataType::UInt8 => "|u1",
        DataType::UInt16 => "<u2",
        DataType::UInt32 => "<u4",
        DataType::UInt64 => "<u8",
        DataType::Int8 => "|i1",
        DataType::Int16 => "<i2",
        DataType::Int32 => "<i4",
        DataType::Int64 => "<i8",
        DataType::Float32 => "<f4",
        DataType::Float64 => "<f8",
    }
}

/// Parses a zarr v3 `data_type` name. The names coincide with [`DataType`]'s.
pub fn parse_data_type(name: &str) -> Result<DataType> {
    serde_json::from_value(Value::String(name.to_string()))
        .map_err(|_| ChunkStackError::Unsupported(format!("zarr data type '{}'", name)))
}

fn fill_value(value: f64, dtype: DataType) -> Value {
    match dtype {
        _ if value.is_nan() => json!("NaN"),
        _ if value.is_infinite() => json!(if value > 0.0 { "Infinity" } else { "-Infinity" }),
        DataType::Float32 | DataType::Float64 => json!(value),
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            json!(value as u64)
        }
        _ => json!(value as i64),
    }
}

/// The zarr codecs equivalent to `encoding`, outermost last.
pub fn codecs(encoding: &ChunkEncoding) -> Vec<Value> {
    let mut codecs = Vec::new();
    if let Some(so) = &encoding.scale_offset {
        codecs.push(json!({
            "name": "numcodecs.fixedscaleoffset",
            "configuration": {
                "offset": so.add_offset,
                "scale": so.scale(),
                "dtype": numpy_dtype(DataType::Float64),
                "astype": numpy_dtype(encoding.dtype),
            }
        }));
    }
    codecs.push(json!({"name": "bytes", "configuration": {"endian": "little"}}));
    if encoding.shuffle {
        codecs.push(json!({
            "name": "numcodecs.shuffle",
            "configuration": {"elementsize": encoding.dtype.size()}
        }));
    }
    match encoding.compression {
        Some(Compression::Zlib { level }) => codecs.push(json!({
            "name": "numcodecs.zlib",
            "configuration": {"level": level}
        })),
        Some(Compression::Zstd { level }) => codecs.push(json!({
            "name": "zstd",
            "configuration": {"level": level, "checksum": false}
        })),
        None => {}
    }
    if encoding.fletcher32 {
        codecs.push(json!({"name": "numcodecs.fletcher32"}));
    }
    codecs
}

/// The `zarr.json` of a virtual array. Scale/offset arrays present as
/// float64; the packed type only appears inside the codec chain.
pub fn array_document(metadata: &ArrayMetadata) -> Value {
    let encoding = &metadata.encoding;
    let data_type = match encoding.scale_offset {
        Some(_) => DataType::Float64,
        None => encoding.dtype,
    };
    json!({
        "zarr_format": 3,
        "node_type": "array",
        "shape": metadata.shape,
        "data_type": data_type.to_string(),
        "chunk_grid": {
            "name": "regular",
            "configuration": {"chunk_shape": metadata.chunk_shape}
        },
        "chunk_key_encoding": {"name": "default", "configuration": {"separator": "/"}},
        "fill_value": fill_value(encoding.decoded_fill_value(), data_type),
        "codecs": codecs(encoding),
        "attributes": metadata.attributes,
        "dimension_names": metadata.dimension_names,
    })
}

/// The `zarr.json` of a group. Coordinate names travel under
/// [`RESERVED_ATTRIBUTE`], so every user attribute round-trips untouched.
pub fn group_document(attributes: &Attributes, coordinates: &BTreeSet<String>) -> Result<Value> {
    if attributes.contains_key(RESERVED_ATTRIBUTE) {
        return Err(ChunkStackError::ReservedAttribute(
            RESERVED_ATTRIBUTE.to_string(),
        ));
    }
    let mut attributes = attributes.clone();
    if !coordinates.is_empty() {
        attributes.insert(
            RESERVED_ATTRIBUTE.to_string(),
            json!({ "coordinates": coordinates }),
        );
    }
    Ok(json!({
        "zarr_format": 3,
        "node_type": "group",
        "attributes": attributes,
    }))
}

/// Splits group attributes read back from a store into the user attributes
/// and the coordinate names recorded by [`group_document`].
pub fn split_group_attributes(
    mut attributes: Attributes,
) -> Result<(Attributes, BTreeSet<String>)> {
    let coordinates = match attributes.remove(RESERVED_ATTRIBUTE) {
        None => BTreeSet::new(),
        Some(reserved) => match reserved.get("coordinates") {
            None => BTreeSet::new(),
            Some(names) => serde_json::from_value(names.clone())
                .map_err(|e| ChunkStackError::metadata(RESERVED_ATTRIBUTE, e))?,
        },
    };
    Ok((attributes, coordinates))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::ScaleOffset;

    fn metadata(encoding: ChunkEncoding) -> ArrayMetadata {
        ArrayMetadata {
            shape: vec![4, 5, 10],
            chunk_shape: vec![1, 2, 2],
            dimension_names: vec!["z".into(), "y".into(), "x".into()],
            source_dtype: DataType::UInt32,
            encoding,
            attributes: Default::default(),
        }
    }

    fn quantized() -> ChunkEncoding {
        ChunkEncoding {
            dtype: DataType::Int32,
            shuffle: true,
            compression: Some(Compression::Zlib { level: 4 }),
            fletcher32: false,
            scale_offset: Some(ScaleOffset {
                scale_factor: 0.1,
                add_offset: 3.0,
            }),
            fill_value: 0.0,
        }
    }

    #[test]
    fn quantized_arrays_read_as_float64() {
        let doc = array_document(&metadata(quantized()));
        assert_eq!(doc["data_type"], "float64");
        assert_eq!(doc["fill_value"], 3.0);
        assert_eq!(doc["chunk_grid"]["configuration"]["chunk_shape"], json!([1, 2, 2]));
        assert_eq!(doc["dimension_names"], json!(["z", "y", "x"]));
        let names: Vec<_> = doc["codecs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["numcodecs.fixedscaleoffset", "bytes", "numcodecs.shuffle", "numcodecs.zlib"]
        );
        let fso = &doc["codecs"][0]["configuration"];
        assert_eq!(fso["astype"], "<i4");
        assert_eq!(fso["offset"], 3.0);
        assert!((fso["scale"].as_f64().unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(doc["codecs"][2]["configuration"]["elementsize"], 4);
    }

    #[test]
    fn plain_arrays_keep_their_type() {
        let encoding = ChunkEncoding {
            dtype: DataType::UInt16,
            shuffle: false,
            compression: Some(Compression::Zstd { level: 3 }),
            fletcher32: true,
            scale_offset: None,
            fill_value: 7.0,
        };
        let doc = array_document(&metadata(encoding));
        assert_eq!(doc["data_type"], "uint16");
        assert_eq!(doc["fill_value"], 7);
        assert_eq!(doc["codecs"][1]["name"], "zstd");
        assert_eq!(doc["codecs"][2]["name"], "numcodecs.fletcher32");
        assert_eq!(parse_data_type("uint16").unwrap(), DataType::UInt16);
        assert!(parse_data_type("complex64").is_err());
    }

    #[test]
    fn user_coordinates_attribute_survives() {
        let mut attributes = Attributes::new();
        attributes.insert("coordinates".into(), json!("lat lon"));
        let coordinates: BTreeSet<String> = ["x".to_string()].into();
        let doc = group_document(&attributes, &coordinates).unwrap();
        assert_eq!(doc["attributes"]["coordinates"], "lat lon");
        assert_eq!(doc["attributes"][RESERVED_ATTRIBUTE]["coordinates"], json!(["x"]));

        let stored: Attributes = serde_json::from_value(doc["attributes"].clone()).unwrap();
        let (user, coords) = split_group_attributes(stored).unwrap();
        assert_eq!(user, attributes);
        assert_eq!(coords, coordinates);
    }

    #[test]
    fn reserved_attribute_is_rejected() {
        let mut attributes = Attributes::new();
        attributes.insert(RESERVED_ATTRIBUTE.into(), json!({}));
        let err = group_document(&attributes, &BTreeSet::new()).unwrap_err();
        assert!(matches!(err, ChunkStackError::ReservedAttribute(_)));
    }

    #[test]
    fn node_keys_and_paths() {
        assert_eq!(node_key("/"), "zarr.json");
        assert_eq!(node_key("/data"), "data/zarr.json");
        assert_eq!(node_key("/a/b"), "a/b/zarr.json");
        assert_eq!(join_path("/", "data"), "/data");
        assert_eq!(join_path("/grp", "data"), "/grp/data");
    }
}
