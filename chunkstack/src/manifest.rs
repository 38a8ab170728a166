//! Chunk manifests: where the bytes of each chunk of a virtual array live.
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs::File,
    path::Path,
};
use tracing::trace;

use crate::{
    container::read_range,
    error::{ChunkStackError, Result},
    grid::{chunk_key, parse_chunk_key},
};

/// A reference to an encoded chunk inside some other file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Absolute path of the file holding the chunk.
    pub location: String,
    pub offset: u64,
    pub length: u64,
}

/// Chunk key (`"0.1.2"`) to [`ChunkRef`]. Missing keys are unwritten chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkManifest {
    entries: BTreeMap<String, ChunkRef>,
}

impl ChunkManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: &[usize], chunk: ChunkRef) -> Option<ChunkRef> {
        self.entries.insert(chunk_key(index), chunk)
    }

    pub fn remove(&mut self, index: &[usize]) -> Option<ChunkRef> {
        self.entries.remove(&chunk_key(index))
    }

    pub fn get(&self, index: &[usize]) -> Option<&ChunkRef> {
        self.entries.get(&chunk_key(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw key/reference pairs in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ChunkRef)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries with keys parsed for an array of rank `rank`.
    pub fn indexed(&self, rank: usize) -> Result<Vec<(Vec<usize>, &ChunkRef)>> {
        self.entries
            .iter()
            .map(|(key, chunk)| {
                parse_chunk_key(key, rank)
                    .map(|index| (index, chunk))
                    .ok_or_else(|| ChunkStackError::InvalidChunkKey(key.clone()))
            })
            .collect()
    }

    /// Copy with every index moved by `by` chunks along `axis`.
    pub fn shifted(&self, rank: usize, axis: usize, by: usize) -> Result<Self> {
        let mut shifted = Self::new();
        for (mut index, chunk) in self.indexed(rank)? {
            index[axis] += by;
            shifted.insert(&index, chunk.clone());
        }
        Ok(shifted)
    }

    /// Adds every entry of `other`, replacing entries with the same key.
    pub fn merge(&mut self, other: ChunkManifest) {
        self.entries.extend(other.entries);
    }

    /// Distinct files referenced by this manifest.
    pub fn locations(&self) -> BTreeSet<&str> {
        self.entries.values().map(|c| c.location.as_str()).collect()
    }
}

/// Reads referenced byte ranges, keeping one open handle per referenced file.
#[derive(Default)]
pub struct ChunkFetcher {
    files: HashMap<String, File>,
}

impl ChunkFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch(&mut self, chunk: &ChunkRef) -> Result<Vec<u8>> {
        let path = Path::new(&chunk.location);
        let file = match self.files.entry(chunk.location.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let file = File::open(path).map_err(|e| ChunkStackError::io(path, e))?;
                entry.insert(file)
            }
        };
        trace!(
            location = %chunk.location,
            offset = chunk.offset,
            length = chunk.length,
            "Fetching chunk"
        );
        read_range(file, path, chunk.offset, chunk.length)
    }
}
