//! Chunked array containers, virtual references to their chunks, and a
//! versioned icechunk repository for datasets assembled from those references.
//!
//! The usual flow:
//!
//! 1. Build a [`Dataset`] and write it with [`write_dataset`], choosing a
//!    [`StorageEncoding`] per variable (chunking, shuffle, compression,
//!    scale/offset quantization).
//! 2. Reopen the files with [`open_virtual_dataset`], which reads only their
//!    footers, and [`concat`] them along a dimension.
//! 3. Stage the result in a [`WritableSession`] of a [`Repository`] and commit.
//!    A [`ReadonlySession`] reads it back through zarrs.

pub mod compression;
pub mod concat;
pub mod config;
pub mod container;
pub mod dataset;
pub mod encoding;
pub mod error;
pub mod grid;
pub mod manifest;
pub mod pipeline;
pub mod repository;
pub mod session;
pub mod types;
pub mod virtual_dataset;
pub mod zarr;

// --- Main Library Exports ---
pub use crate::{
    concat::{concat, Compat, CoordsMode},
    config::{PipelineConfig, CONFIG_ENV_VAR},
    container::{write_dataset, ContainerReader, ContainerWriter},
    dataset::{Dataset, Variable},
    encoding::{ChunkEncoding, Compression, EncodingMap, StorageEncoding},
    error::{ChunkStackError, Result},
    manifest::{ChunkManifest, ChunkRef},
    repository::{Repository, DEFAULT_BRANCH},
    session::{NodeKind, ReadonlySession, WritableSession},
    types::{Attributes, DataType},
    virtual_dataset::{open_virtual_dataset, ArrayMetadata, VirtualArray, VirtualDataset},
    zarr::RESERVED_ATTRIBUTE,
};
pub use icechunk::{format::SnapshotId, repository::VersionInfo};
