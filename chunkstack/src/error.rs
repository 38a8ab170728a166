//! Error types for the chunkstack library.
use std::path::PathBuf;

use thiserror::Error;

use crate::types::DataType;

/// Errors from the store and zarr layers, kept as opaque sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The primary error type for operations within this library.
#[derive(Error, Debug)]
pub enum ChunkStackError {
    /// An I/O failure, tagged with the path it happened on.
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata (container footer, zarr node, config) failed to (de)serialize.
    #[error("Metadata error in {path:?}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The number of dimension names does not match the rank of the data.
    #[error("Variable '{variable}' has {dims} dimension names but rank {rank}")]
    RankMismatch {
        variable: String,
        dims: usize,
        rank: usize,
    },

    /// The same dimension name appears twice on one variable.
    #[error("Variable '{variable}' repeats dimension '{dimension}'")]
    DuplicateDimension { variable: String, dimension: String },

    /// A dimension name is used with two different sizes, within a dataset or
    /// across the inputs of a concatenation.
    #[error("Dimension '{dimension}' has conflicting sizes {existing} and {found}")]
    DimensionMismatch {
        dimension: String,
        existing: usize,
        found: usize,
    },

    /// A dimension was requested that no input carries.
    #[error("Dimension '{0}' not found")]
    DimensionNotFound(String),

    /// A variable was requested that the dataset, container or store does not hold.
    #[error("Variable '{0}' not found")]
    VariableNotFound(String),

    /// The chunk shape is incompatible with the array shape.
    #[error("Invalid chunk shape {chunk_shape:?} for array shape {shape:?}: {reason}")]
    InvalidChunkShape {
        shape: Vec<usize>,
        chunk_shape: Vec<usize>,
        reason: String,
    },

    /// Two encoding options were combined that are not allowed together.
    #[error("Filter conflict for variable '{variable}': {reason}")]
    FilterConflict { variable: String, reason: String },

    /// Any other invalid encoding option.
    #[error("Invalid encoding for variable '{variable}': {reason}")]
    InvalidEncoding { variable: String, reason: String },

    /// A value cannot be represented in the on-disk data type.
    #[error("Value {value} cannot be stored as {dtype}")]
    ValueOutOfRange { value: f64, dtype: DataType },

    /// An error occurred during the compression of chunk data.
    #[error("Compression error: {0}")]
    CompressionError(String),

    /// An error occurred during the decompression or verification of chunk data.
    #[error("Decompression error: {0}")]
    DecompressionError(String),

    /// The file is not a container written by this library.
    #[error("{path:?} is not a valid container: {reason}")]
    InvalidContainer { path: PathBuf, reason: String },

    /// Inputs to a concatenation disagree on a variable's layout or encoding.
    #[error("Cannot concatenate variable '{variable}': {reason}")]
    IncompatibleVariables { variable: String, reason: String },

    /// A chunk boundary does not line up with an input boundary along the concat axis.
    #[error(
        "Variable '{variable}' has extent {extent} along '{dimension}', \
         not a multiple of chunk extent {chunk}"
    )]
    ChunkMisaligned {
        variable: String,
        dimension: String,
        extent: usize,
        chunk: usize,
    },

    /// The requested operation is not supported for virtual data.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The location exists but does not hold a repository of the expected format.
    #[error("{location} is not a repository: {reason}")]
    NotARepository { location: String, reason: String },

    /// A repository was to be created over existing content.
    #[error("A repository or other content already exists at {0}")]
    RepositoryExists(String),

    /// A manifest key that does not parse as a chunk index of the array's rank.
    #[error("Invalid chunk key '{0}'")]
    InvalidChunkKey(String),

    /// A chunk index lies outside the array's chunk grid.
    #[error("Chunk index {index:?} is outside the grid {grid:?} of '{path}'")]
    ChunkOutOfBounds {
        path: String,
        index: Vec<usize>,
        grid: Vec<usize>,
    },

    /// Dataset attributes may not use the key the store reserves for itself.
    #[error("Attribute '{0}' is reserved")]
    ReservedAttribute(String),

    #[error("No changes to commit on branch '{0}'")]
    NoChangesToCommit(String),

    /// Optimistic concurrency failure: the branch moved since the session started.
    #[error("Conflict on branch '{branch}': expected tip {expected}, found {actual}")]
    Conflict {
        branch: String,
        expected: String,
        actual: String,
    },

    /// Failure reported by the versioned store.
    #[error("Store error: {0}")]
    Store(#[source] BoxError),

    /// Failure reported while reading zarr metadata or chunks.
    #[error("Zarr error: {0}")]
    Zarr(#[source] BoxError),

    /// A generic error from a lower layer.
    #[error("Underlying error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ChunkStackError {
    /// Wraps an `std::io::Error` with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChunkStackError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn store(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        ChunkStackError::Store(Box::new(source))
    }

    pub fn zarr(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        ChunkStackError::Zarr(Box::new(source))
    }

    /// Wraps a `serde_json::Error` with the path of the document.
    pub fn metadata(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        ChunkStackError::Metadata {
            path: path.into(),
            source,
        }
    }
}

/// A convenience type alias for `Result<T, ChunkStackError>`.
pub type Result<T, E = ChunkStackError> = std::result::Result<T, E>;
