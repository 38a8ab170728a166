//! Sessions: a readonly view of one snapshot, read through zarrs, or a
//! writable working copy of a branch that stages virtual arrays until `commit`.
use icechunk::{
    format::{
        manifest::{ChunkPayload, VirtualChunkLocation, VirtualChunkRef},
        ChunkIndices, Path as NodePath, SnapshotId,
    },
    session::Session,
};
use ndarray::{ArrayD, IxDyn};
use serde_json::Value;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zarrs::{
    array::Array,
    node::{Node, NodeMetadata},
    storage::{AsyncReadableStorageTraits, AsyncWritableStorageTraits, StoreKey},
};
use zarrs_icechunk::AsyncIcechunkStore;

use crate::{
    dataset::{Dataset, Variable},
    error::{ChunkStackError, Result},
    manifest::ChunkRef,
    repository::Repository,
    types::{Attributes, DataType, Element},
    virtual_dataset::{VirtualArray, VirtualDataset},
    zarr::{
        array_document, group_document, join_path, node_key, parse_data_type,
        split_group_attributes,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Array,
}

fn store_key(key: &str) -> Result<StoreKey> {
    StoreKey::new(key.to_string()).map_err(ChunkStackError::zarr)
}

fn node_path(path: &str) -> Result<NodePath> {
    NodePath::try_from(path).map_err(ChunkStackError::store)
}

fn virtual_ref(chunk: &ChunkRef) -> Result<VirtualChunkRef> {
    let url = format!("file://{}", chunk.location);
    Ok(VirtualChunkRef {
        location: VirtualChunkLocation::from_absolute_path(&url)
            .map_err(ChunkStackError::store)?,
        offset: chunk.offset,
        length: chunk.length,
        checksum: None,
    })
}

fn chunk_indices(index: &[usize]) -> Result<ChunkIndices> {
    index
        .iter()
        .map(|&i| u32::try_from(i))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(ChunkIndices)
        .map_err(|_| ChunkStackError::InvalidChunkKey(format!("{:?}", index)))
}

// --- Readonly ---

/// A view of one snapshot.
pub struct ReadonlySession {
    store: Arc<AsyncIcechunkStore>,
    snapshot: SnapshotId,
}

impl ReadonlySession {
    pub(crate) fn new(session: Session) -> Self {
        let snapshot = session.snapshot_id().clone();
        Self {
            store: Arc::new(AsyncIcechunkStore::new(session)),
            snapshot,
        }
    }

    pub fn snapshot_id(&self) -> &SnapshotId {
        &self.snapshot
    }

    /// The zarrs store over this snapshot, for callers that want zarrs directly.
    pub fn store(&self) -> Arc<AsyncIcechunkStore> {
        self.store.clone()
    }

    /// The node hierarchy rendered as an indented tree.
    pub async fn hierarchy(&self) -> Result<String> {
        let root = Node::async_open(self.store.clone(), "/")
            .await
            .map_err(ChunkStackError::zarr)?;
        Ok(root.hierarchy_tree())
    }

    /// Every node path with its kind, parents before children.
    pub async fn list_nodes(&self) -> Result<Vec<(String, NodeKind)>> {
        fn walk(node: &Node, out: &mut Vec<(String, NodeKind)>) {
            let kind = match node.metadata() {
                NodeMetadata::Array(_) => NodeKind::Array,
                NodeMetadata::Group(_) => NodeKind::Group,
            };
            out.push((node.path().as_str().to_string(), kind));
            for child in node.children() {
                walk(child, out);
            }
        }
        let root = Node::async_open(self.store.clone(), "/")
            .await
            .map_err(ChunkStackError::zarr)?;
        let mut nodes = Vec::new();
        walk(&root, &mut nodes);
        Ok(nodes)
    }

    /// The `zarr.json` document of the node at `path`.
    pub async fn node_metadata(&self, path: &str) -> Result<Value> {
        let key = node_key(path);
        let bytes = self
            .store
            .get(&store_key(&key)?)
            .await
            .map_err(ChunkStackError::zarr)?
            .ok_or_else(|| ChunkStackError::VariableNotFound(path.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ChunkStackError::metadata(key, e))
    }

    /// Decodes a whole array through its zarr codec chain, following virtual
    /// references into the containers.
    pub async fn read_array(&self, path: &str) -> Result<Variable> {
        let document = self.node_metadata(path).await?;
        let dtype = parse_data_type(document["data_type"].as_str().unwrap_or_default())?;
        let dims: Vec<String> = serde_json::from_value(document["dimension_names"].clone())
            .map_err(|e| ChunkStackError::metadata(node_key(path), e))?;
        let attributes: Attributes = match document.get("attributes") {
            Some(attributes) => serde_json::from_value(attributes.clone())
                .map_err(|e| ChunkStackError::metadata(node_key(path), e))?,
            None => Attributes::new(),
        };

        let array = Array::async_open(self.store.clone(), path)
            .await
            .map_err(ChunkStackError::zarr)?;
        let subset = array.subset_all();
        macro_rules! retrieve {
            ($($variant:ident => $ty:ty),* $(,)?) => {
                match dtype {
                    $(DataType::$variant => array
                        .async_retrieve_array_subset_elements::<$ty>(&subset)
                        .await
                        .map_err(ChunkStackError::zarr)?
                        .into_iter()
                        .map(Element::into_f64)
                        .collect::<Vec<f64>>(),)*
                }
            };
        }
        let values = retrieve!(
            UInt8 => u8,
            UInt16 => u16,
            UInt32 => u32,
            UInt64 => u64,
            Int8 => i8,
            Int16 => i16,
            Int32 => i32,
            Int64 => i64,
            Float32 => f32,
            Float64 => f64,
        );
        let shape: Vec<usize> = array.shape().iter().map(|&n| n as usize).collect();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| ChunkStackError::Other(e.into()))?;
        let name = path.rsplit('/').next().unwrap_or(path);
        let mut variable = Variable::new(name, dims, dtype, data)?;
        variable.attributes = attributes;
        debug!(path, shape = ?shape, %dtype, "Read array");
        Ok(variable)
    }

    /// Reads every array directly under `group`, restoring coordinates and
    /// the group's attributes.
    pub async fn read_dataset(&self, group: &str) -> Result<Dataset> {
        let document = self.node_metadata(group).await?;
        let attributes: Attributes = match document.get("attributes") {
            Some(attributes) => serde_json::from_value(attributes.clone())
                .map_err(|e| ChunkStackError::metadata(node_key(group), e))?,
            None => Attributes::new(),
        };
        let (attributes, coordinates) = split_group_attributes(attributes)?;

        let mut dataset = Dataset::new();
        dataset.attributes = attributes;
        for (path, kind) in self.list_nodes().await? {
            let name = path.rsplit('/').next().unwrap_or_default();
            if kind != NodeKind::Array || join_path(group, name) != path {
                continue;
            }
            let variable = self.read_array(&path).await?;
            if coordinates.contains(name) {
                dataset.add_coordinate(variable)?;
            } else {
                dataset.add_variable(variable)?;
            }
        }
        Ok(dataset)
    }
}

// --- Writable ---

/// A working copy of a branch. Writes are staged in the icechunk session
/// until [`WritableSession::commit`].
pub struct WritableSession<'a> {
    repo: &'a Repository,
    branch: String,
    session: Arc<RwLock<Session>>,
    store: AsyncIcechunkStore,
    base: SnapshotId,
    staged: usize,
}

impl<'a> WritableSession<'a> {
    pub(crate) fn new(repo: &'a Repository, branch: String, session: Session) -> Self {
        let base = session.snapshot_id().clone();
        let session = Arc::new(RwLock::new(session));
        Self {
            repo,
            branch,
            store: AsyncIcechunkStore::from(session.clone()),
            session,
            base,
            staged: 0,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// The snapshot this session started from.
    pub fn base_snapshot(&self) -> &SnapshotId {
        &self.base
    }

    pub fn has_uncommitted_changes(&self) -> bool {
        self.staged > 0
    }

    async fn put_document(&mut self, path: &str, document: &Value) -> Result<()> {
        let key = node_key(path);
        let bytes = serde_json::to_vec(document).map_err(|e| ChunkStackError::metadata(&key, e))?;
        self.store
            .set(&store_key(&key)?, bytes.into())
            .await
            .map_err(ChunkStackError::zarr)?;
        self.staged += 1;
        Ok(())
    }

    /// Creates or replaces the group at `path`. `coordinates` names the arrays
    /// under it that are coordinate variables.
    pub async fn write_group(
        &mut self,
        path: &str,
        attributes: &Attributes,
        coordinates: &BTreeSet<String>,
    ) -> Result<()> {
        let document = group_document(attributes, coordinates)?;
        self.put_document(path, &document).await?;
        debug!(path, "Staged group");
        Ok(())
    }

    /// Creates or replaces the array at `path` and points each of its chunks
    /// at the referenced container bytes.
    pub async fn write_virtual_array(&mut self, path: &str, array: &VirtualArray) -> Result<()> {
        let grid = array.metadata.validate(path)?;
        let refs = array.manifest.indexed(array.metadata.shape.len())?;
        for (index, _) in &refs {
            if !grid.contains(index) {
                return Err(ChunkStackError::ChunkOutOfBounds {
                    path: path.to_string(),
                    index: index.clone(),
                    grid: grid.grid_shape(),
                });
            }
        }
        self.put_document(path, &array_document(&array.metadata))
            .await?;

        let node = node_path(path)?;
        let mut session = self.session.write().await;
        for (index, chunk) in &refs {
            let payload = ChunkPayload::Virtual(virtual_ref(chunk)?);
            session
                .set_chunk_ref(node.clone(), chunk_indices(index)?, Some(payload))
                .await
                .map_err(ChunkStackError::store)?;
        }
        debug!(path, chunks = refs.len(), "Staged virtual array");
        Ok(())
    }

    /// Stages the arrays of `dataset` under `group`, creating the group if
    /// needed and replacing same-named arrays.
    pub async fn write_virtual_dataset(
        &mut self,
        group: &str,
        dataset: &VirtualDataset,
    ) -> Result<()> {
        self.write_group(group, &dataset.attributes, &dataset.coordinates)
            .await?;
        for (name, array) in &dataset.variables {
            self.write_virtual_array(&join_path(group, name), array)
                .await?;
        }
        info!(
            branch = %self.branch,
            group,
            arrays = dataset.variables.len(),
            "Staged virtual dataset"
        );
        Ok(())
    }

    /// Drops everything staged and starts over from the current branch tip.
    pub async fn reset(&mut self) -> Result<()> {
        let session = self.repo.open_writable(&self.branch).await?;
        debug!(branch = %self.branch, discarded = self.staged, "Reset session");
        *self = Self::new(self.repo, self.branch.clone(), session);
        Ok(())
    }

    /// Writes the staged changes as a new snapshot and moves the branch to it.
    /// The session then continues from the new tip.
    ///
    /// Fails with `Conflict` when the branch tip is no longer the snapshot
    /// this session started from; the branch is then left untouched.
    pub async fn commit(&mut self, message: &str) -> Result<SnapshotId> {
        if self.staged == 0 {
            return Err(ChunkStackError::NoChangesToCommit(self.branch.clone()));
        }
        let tip = self.repo.branch_tip(&self.branch).await?;
        if tip != self.base {
            warn!(
                branch = %self.branch,
                expected = %self.base,
                actual = %tip,
                "Branch moved during session"
            );
            return Err(ChunkStackError::Conflict {
                branch: self.branch.clone(),
                expected: self.base.to_string(),
                actual: tip.to_string(),
            });
        }
        let snapshot = self
            .session
            .write()
            .await
            .commit(message, None)
            .await
            .map_err(ChunkStackError::store)?;
        info!(
            branch = %self.branch,
            %snapshot,
            parent = %self.base,
            changes = self.staged,
            "Committed snapshot"
        );
        self.reset().await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DEFAULT_BRANCH;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn chunk_indices_fit_u32() {
        assert_eq!(chunk_indices(&[0, 1, 2]).unwrap(), ChunkIndices(vec![0, 1, 2]));
        assert!(chunk_indices(&[usize::MAX]).is_err());
    }

    #[test]
    fn references_are_file_urls() {
        let chunk = ChunkRef {
            location: "/data/test0.nc".into(),
            offset: 8,
            length: 16,
        };
        let vref = virtual_ref(&chunk).unwrap();
        assert_eq!(vref.offset, 8);
        assert_eq!(vref.length, 16);
        assert!(vref.checksum.is_none());
    }

    #[tokio::test]
    async fn nothing_staged_is_nothing_to_commit() {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("repo")).await.unwrap();
        let mut session = repo.writable_session(DEFAULT_BRANCH).await.unwrap();
        assert!(!session.has_uncommitted_changes());
        let err = session.commit("empty").await.unwrap_err();
        assert!(matches!(err, ChunkStackError::NoChangesToCommit(b) if b == "main"));
    }

    #[tokio::test]
    async fn groups_round_trip_their_attributes() {
        let dir = tempdir().unwrap();
        let repo = Repository::create(dir.path().join("repo")).await.unwrap();
        let mut session = repo.writable_session(DEFAULT_BRANCH).await.unwrap();
        let mut attributes = Attributes::new();
        attributes.insert("title".into(), json!("demo"));
        session
            .write_group("/", &attributes, &BTreeSet::new())
            .await
            .unwrap();
        assert!(session.has_uncommitted_changes());
        let snapshot = session.commit("group").await.unwrap();
        assert!(!session.has_uncommitted_changes());
        assert_eq!(session.base_snapshot(), &snapshot);

        let version = icechunk::repository::VersionInfo::SnapshotId(snapshot);
        let reader = repo.readonly_session(&version).await.unwrap();
        let document = reader.node_metadata("/").await.unwrap();
        assert_eq!(document["node_type"], "group");
        assert_eq!(document["attributes"]["title"], "demo");
        assert_eq!(
            reader.list_nodes().await.unwrap(),
            vec![("/".to_string(), NodeKind::Group)]
        );
    }
}
