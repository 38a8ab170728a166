//! Self-describing chunked array container.
//!
//! Layout
//!
//! ```text
//! 0                                                                     EOF
//! +--------------+---------------------+-------------+-----------+--------------+
//! | MAGIC_NUMBER | chunk blobs ...     | JSON footer | footer len| MAGIC_NUMBER |
//! |  8 bytes     | (encoded, any order)| (metadata)  | u64 LE    |  8 bytes     |
//! +--------------+---------------------+-------------+-----------+--------------+
//! ```
//!
//! The footer lists every variable with its shape, dimension names, codec chain
//! and the absolute byte range of each stored chunk, so a reader can locate any
//! chunk without touching the others. Nothing time dependent is written: the same
//! dataset and encodings always produce the same bytes.
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};

use crate::{
    dataset::{Dataset, Variable},
    encoding::{ChunkEncoding, EncodingMap, StorageEncoding},
    error::{ChunkStackError, Result},
    grid::ChunkGrid,
    types::{Attributes, DataType},
};

pub const MAGIC_NUMBER: &[u8; 8] = b"CHNKSTK\x01";
pub const FORMAT_VERSION: u32 = 1;

/// Magic plus footer length at the end of the file.
const TRAILER_LEN: u64 = 8 + MAGIC_NUMBER.len() as u64;

/// Where one encoded chunk lives inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub index: Vec<usize>,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableMetadata {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    /// Type of the values before encoding.
    pub source_dtype: DataType,
    pub chunk_shape: Vec<usize>,
    pub encoding: ChunkEncoding,
    #[serde(default)]
    pub attributes: Attributes,
    pub chunks: Vec<ChunkLocation>,
}

impl VariableMetadata {
    pub fn grid(&self) -> Result<ChunkGrid> {
        ChunkGrid::new(self.shape.clone(), self.chunk_shape.clone())
    }
}

/// The footer of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub format_version: u32,
    pub dimensions: BTreeMap<String, usize>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub coordinates: BTreeSet<String>,
    pub variables: BTreeMap<String, VariableMetadata>,
}

// --- Writing ---

/// Streams variables into a container, chunk by chunk.
pub struct ContainerWriter<W: Write> {
    inner: W,
    /// Destination, for error context.
    path: PathBuf,
    position: u64,
    variables: BTreeMap<String, VariableMetadata>,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(mut inner: W, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        inner
            .write_all(MAGIC_NUMBER)
            .map_err(|e| ChunkStackError::io(&path, e))?;
        Ok(Self {
            inner,
            path,
            position: MAGIC_NUMBER.len() as u64,
            variables: BTreeMap::new(),
        })
    }

    /// Encodes and appends every chunk of `variable`.
    pub fn write_variable(
        &mut self,
        variable: &Variable,
        encoding: &StorageEncoding,
    ) -> Result<()> {
        let (chunk_encoding, grid) = encoding.resolve(variable)?;
        let mut chunks = Vec::with_capacity(grid.num_chunks());
        for index in grid.chunk_indices() {
            let values = grid.extract(&variable.data, &index, chunk_encoding.decoded_fill_value());
            let bytes = chunk_encoding.encode_chunk(&values)?;
            self.inner
                .write_all(&bytes)
                .map_err(|e| ChunkStackError::io(&self.path, e))?;
            trace!(
                variable = %variable.name,
                ?index,
                offset = self.position,
                length = bytes.len(),
                "Wrote chunk"
            );
            chunks.push(ChunkLocation {
                index,
                offset: self.position,
                length: bytes.len() as u64,
            });
            self.position += bytes.len() as u64;
        }
        debug!(variable = %variable.name, chunks = chunks.len(), "Wrote variable");
        self.variables.insert(
            variable.name.clone(),
            VariableMetadata {
                dims: variable.dims.clone(),
                shape: variable.shape().to_vec(),
                source_dtype: variable.dtype,
                chunk_shape: grid.chunk_shape().to_vec(),
                encoding: chunk_encoding,
                attributes: variable.attributes.clone(),
                chunks,
            },
        );
        Ok(())
    }

    /// Writes the footer and trailer and hands back the sink.
    pub fn finish(
        mut self,
        attributes: &Attributes,
        coordinates: &BTreeSet<String>,
    ) -> Result<(W, ContainerMetadata)> {
        let mut dimensions = BTreeMap::new();
        for meta in self.variables.values() {
            for (dim, size) in meta.dims.iter().zip(&meta.shape) {
                dimensions.insert(dim.clone(), *size);
            }
        }
        let metadata = ContainerMetadata {
            format_version: FORMAT_VERSION,
            dimensions,
            attributes: attributes.clone(),
            coordinates: coordinates.clone(),
            variables: std::mem::take(&mut self.variables),
        };
        let footer =
            serde_json::to_vec(&metadata).map_err(|e| ChunkStackError::metadata(&self.path, e))?;
        write_trailer(&mut self.inner, &footer).map_err(|e| ChunkStackError::io(&self.path, e))?;
        Ok((self.inner, metadata))
    }
}

fn write_trailer<W: Write>(inner: &mut W, footer: &[u8]) -> std::io::Result<()> {
    inner.write_all(footer)?;
    inner.write_u64::<LittleEndian>(footer.len() as u64)?;
    inner.write_all(MAGIC_NUMBER)?;
    inner.flush()
}

/// Writes `dataset` to `path`, replacing any existing file atomically.
///
/// The data goes to a temporary file in the destination directory first, so
/// the destination directory must exist and a failed write leaves the old file
/// (if any) untouched.
pub fn write_dataset(
    path: &Path,
    dataset: &Dataset,
    encodings: &EncodingMap,
) -> Result<ContainerMetadata> {
    if let Some(unknown) = encodings.keys().find(|name| dataset.variable(name).is_none()) {
        return Err(ChunkStackError::VariableNotFound(unknown.clone()));
    }
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| ChunkStackError::io(&dir, e))?;

    let metadata = {
        let mut writer = ContainerWriter::new(BufWriter::new(tmp.as_file_mut()), path)?;
        for variable in dataset.variables() {
            let encoding = encodings.get(&variable.name).cloned().unwrap_or_default();
            writer.write_variable(variable, &encoding)?;
        }
        let (_, metadata) = writer.finish(&dataset.attributes, dataset.coordinate_names())?;
        metadata
    };

    tmp.persist(path)
        .map_err(|e| ChunkStackError::io(path, e.error))?;
    info!(
        path = %path.display(),
        variables = metadata.variables.len(),
        "Wrote container"
    );
    Ok(metadata)
}

// --- Reading ---

/// Random access to a container. Opening reads only the footer.
pub struct ContainerReader {
    path: PathBuf,
    file: File,
    metadata: ContainerMetadata,
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| ChunkStackError::io(&path, e))?;
        let metadata = read_footer(&mut file, &path)?;
        debug!(path = %path.display(), variables = metadata.variables.len(), "Opened container");
        Ok(Self {
            path,
            file,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> ContainerMetadata {
        self.metadata
    }

    fn variable_metadata(&self, name: &str) -> Result<&VariableMetadata> {
        self.metadata
            .variables
            .get(name)
            .ok_or_else(|| ChunkStackError::VariableNotFound(name.to_string()))
    }

    /// Reads the still-encoded bytes of one chunk.
    pub fn read_chunk_bytes(&mut self, location: &ChunkLocation) -> Result<Vec<u8>> {
        read_range(&mut self.file, &self.path, location.offset, location.length)
    }

    /// Reads and decodes one variable.
    pub fn read_variable(&mut self, name: &str) -> Result<Variable> {
        let meta = self.variable_metadata(name)?.clone();
        let grid = meta.grid()?;
        let mut data = ArrayD::from_elem(IxDyn(&meta.shape), meta.encoding.decoded_fill_value());
        for location in &meta.chunks {
            if !grid.contains(&location.index) {
                return Err(ChunkStackError::ChunkOutOfBounds {
                    path: name.to_string(),
                    index: location.index.clone(),
                    grid: grid.grid_shape(),
                });
            }
            let bytes = self.read_chunk_bytes(location)?;
            let values = meta.encoding.decode_chunk(&bytes)?;
            if values.len() != grid.chunk_len() {
                return Err(ChunkStackError::DecompressionError(format!(
                    "chunk {:?} of '{}' decoded to {} values, expected {}",
                    location.index,
                    name,
                    values.len(),
                    grid.chunk_len()
                )));
            }
            grid.insert(&mut data, &location.index, &values);
        }
        let mut variable = Variable::new(
            name,
            meta.dims.clone(),
            meta.encoding.decoded_dtype(meta.source_dtype),
            data,
        )?;
        variable.attributes = meta.attributes;
        Ok(variable)
    }

    /// Reads and decodes every variable.
    pub fn read_dataset(&mut self) -> Result<Dataset> {
        let mut dataset = Dataset::new();
        dataset.attributes = self.metadata.attributes.clone();
        let names: Vec<String> = self.metadata.variables.keys().cloned().collect();
        for name in names {
            let variable = self.read_variable(&name)?;
            if self.metadata.coordinates.contains(&name) {
                dataset.add_coordinate(variable)?;
            } else {
                dataset.add_variable(variable)?;
            }
        }
        Ok(dataset)
    }
}

/// Reads exactly `length` bytes at `offset`.
pub(crate) fn read_range(
    file: &mut File,
    path: &Path,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; length as usize];
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(&mut buf))
        .map_err(|e| ChunkStackError::io(path, e))?;
    Ok(buf)
}

fn read_footer(file: &mut File, path: &Path) -> Result<ContainerMetadata> {
    let invalid = |reason: &str| ChunkStackError::InvalidContainer {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    let len = file
        .metadata()
        .map_err(|e| ChunkStackError::io(path, e))?
        .len();
    if len < MAGIC_NUMBER.len() as u64 + TRAILER_LEN {
        return Err(invalid("file too short"));
    }

    let head = read_range(file, path, 0, MAGIC_NUMBER.len() as u64)?;
    if head != MAGIC_NUMBER {
        return Err(invalid("missing leading magic number"));
    }
    let trailer = read_range(file, path, len - TRAILER_LEN, TRAILER_LEN)?;
    if &trailer[8..] != MAGIC_NUMBER {
        return Err(invalid("missing trailing magic number"));
    }
    let footer_len = LittleEndian::read_u64(&trailer[..8]);
    let footer_start = (len - TRAILER_LEN)
        .checked_sub(footer_len)
        .filter(|start| *start >= MAGIC_NUMBER.len() as u64)
        .ok_or_else(|| invalid("footer length out of bounds"))?;

    let footer = read_range(file, path, footer_start, footer_len)?;
    let metadata: ContainerMetadata =
        serde_json::from_slice(&footer).map_err(|e| ChunkStackError::metadata(path, e))?;
    if metadata.format_version != FORMAT_VERSION {
        return Err(invalid(&format!(
            "unsupported format version {}",
            metadata.format_version
        )));
    }
    validate_footer(&metadata, footer_start).map_err(|reason| invalid(&reason))?;
    trace!(path = %path.display(), footer_len, "Read container footer");
    Ok(metadata)
}

/// Checks every variable's layout and that each chunk lies on the grid and
/// inside the blob region, which ends where the footer starts.
fn validate_footer(metadata: &ContainerMetadata, blobs_end: u64) -> Result<(), String> {
    for (name, meta) in &metadata.variables {
        if meta.dims.len() != meta.shape.len() {
            return Err(format!(
                "variable '{}' has {} dimension names for rank {}",
                name,
                meta.dims.len(),
                meta.shape.len()
            ));
        }
        let grid = meta
            .grid()
            .map_err(|e| format!("variable '{}': {}", name, e))?;
        for chunk in &meta.chunks {
            if !grid.contains(&chunk.index) {
                return Err(format!(
                    "variable '{}' lists chunk {:?} outside its grid {:?}",
                    name,
                    chunk.index,
                    grid.grid_shape()
                ));
            }
            let end = chunk.offset.checked_add(chunk.length);
            if chunk.offset < MAGIC_NUMBER.len() as u64 || end.map_or(true, |e| e > blobs_end) {
                return Err(format!(
                    "variable '{}' chunk {:?} range {}+{} lies outside the data region",
                    name, chunk.index, chunk.offset, chunk.length
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Compression;
    use ndarray::Array2;
    use tempfile::tempdir;

    fn dataset() -> Dataset {
        let data = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as u16);
        let var = Variable::from_array("grid", &["y", "x"], data)
            .unwrap()
            .with_attribute("units", serde_json::json!("K"));
        let mut ds = Dataset::from_variables([var]).unwrap();
        ds.attributes.insert("title".into(), serde_json::json!("test"));
        ds
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid.nc");
        let mut encodings = EncodingMap::new();
        encodings.insert(
            "grid".into(),
            StorageEncoding {
                compression: Some(Compression::Zstd { level: 3 }),
                shuffle: true,
                chunksizes: Some(vec![2, 3]),
                ..Default::default()
            },
        );
        let written = write_dataset(&path, &dataset(), &encodings).unwrap();
        assert_eq!(written.variables["grid"].chunks.len(), 4);

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.metadata(), &written);
        assert_eq!(reader.metadata().dimensions["x"], 4);
        let back = reader.read_dataset().unwrap();
        assert_eq!(back, dataset());
    }

    #[test]
    fn missing_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("grid.nc");
        let err = write_dataset(&path, &dataset(), &EncodingMap::new()).unwrap_err();
        assert!(matches!(err, ChunkStackError::Io { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn unknown_encoding_key_fails() {
        let dir = tempdir().unwrap();
        let mut encodings = EncodingMap::new();
        encodings.insert("nope".into(), StorageEncoding::default());
        let err = write_dataset(&dir.path().join("a.nc"), &dataset(), &encodings).unwrap_err();
        assert!(matches!(err, ChunkStackError::VariableNotFound(name) if name == "nope"));
    }

    #[test]
    fn non_container_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("text.nc");
        std::fs::write(&path, b"this is not a container at all").unwrap();
        let err = ContainerReader::open(&path).err().unwrap();
        assert!(matches!(err, ChunkStackError::InvalidContainer { .. }));
    }

    /// Rewrites the footer of a container through `edit`.
    fn rewrite_footer(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let bytes = std::fs::read(path).unwrap();
        let trailer = bytes.len() - TRAILER_LEN as usize;
        let footer_len = LittleEndian::read_u64(&bytes[trailer..trailer + 8]) as usize;
        let mut footer: serde_json::Value =
            serde_json::from_slice(&bytes[trailer - footer_len..trailer]).unwrap();
        edit(&mut footer);
        let footer = serde_json::to_vec(&footer).unwrap();
        let mut out = bytes[..trailer - footer_len].to_vec();
        write_trailer(&mut out, &footer).unwrap();
        std::fs::write(path, out).unwrap();
    }

    fn written(dir: &Path) -> PathBuf {
        let path = dir.join("grid.nc");
        let mut encodings = EncodingMap::new();
        encodings.insert(
            "grid".into(),
            StorageEncoding {
                chunksizes: Some(vec![2, 2]),
                ..Default::default()
            },
        );
        write_dataset(&path, &dataset(), &encodings).unwrap();
        path
    }

    #[test]
    fn malformed_footers_are_invalid_containers() {
        let dir = tempdir().unwrap();
        let edits: Vec<Box<dyn Fn(&mut serde_json::Value)>> = vec![
            Box::new(|f| f["variables"]["grid"]["chunk_shape"] = serde_json::json!([0, 2])),
            Box::new(|f| f["variables"]["grid"]["chunk_shape"] = serde_json::json!([2])),
            Box::new(|f| f["variables"]["grid"]["dims"] = serde_json::json!(["y"])),
            Box::new(|f| f["variables"]["grid"]["chunks"][0]["index"] = serde_json::json!([0])),
            Box::new(|f| f["variables"]["grid"]["chunks"][1]["index"] = serde_json::json!([5, 0])),
            Box::new(|f| f["variables"]["grid"]["chunks"][0]["length"] = serde_json::json!(9999)),
        ];
        for edit in edits {
            let path = written(dir.path());
            rewrite_footer(&path, |f| edit(f));
            let err = ContainerReader::open(&path).err().unwrap();
            assert!(matches!(err, ChunkStackError::InvalidContainer { .. }), "{:?}", err);
        }
    }

    #[test]
    fn short_chunks_are_not_truncated() {
        let dir = tempdir().unwrap();
        let path = written(dir.path());
        // point the first chunk at the start of the second one, shortened
        rewrite_footer(&path, |f| {
            let second = f["variables"]["grid"]["chunks"][1].clone();
            f["variables"]["grid"]["chunks"][0]["offset"] = second["offset"].clone();
            f["variables"]["grid"]["chunks"][0]["length"] = serde_json::json!(4);
        });
        let mut reader = ContainerReader::open(&path).unwrap();
        let err = reader.read_variable("grid").unwrap_err();
        assert!(matches!(err, ChunkStackError::DecompressionError(_)), "{:?}", err);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = ContainerReader::open(dir.path().join("absent.nc")).err().unwrap();
        assert!(matches!(err, ChunkStackError::Io { .. }));
    }
}
