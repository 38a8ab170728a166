//! Versioned repositories on the local file system, backed by icechunk.
//!
//! A repository holds branches and tags pointing at immutable snapshots. Array
//! chunks are virtual references into the containers they were written to.
use icechunk::{
    format::SnapshotId, repository::VersionInfo, session::Session, RepositoryConfig,
};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

use crate::{
    error::{ChunkStackError, Result},
    session::{ReadonlySession, WritableSession},
};

pub const DEFAULT_BRANCH: &str = "main";

/// What occupies a repository location before it is opened.
enum Occupancy {
    Vacant,
    Occupied,
    NotADirectory,
}

fn occupancy(path: &Path) -> Result<Occupancy> {
    match fs::read_dir(path) {
        Ok(mut entries) => match entries.next() {
            None => Ok(Occupancy::Vacant),
            Some(_) => Ok(Occupancy::Occupied),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Occupancy::Vacant),
        Err(_) if path.exists() && !path.is_dir() => Ok(Occupancy::NotADirectory),
        Err(e) => Err(ChunkStackError::io(path, e)),
    }
}

pub struct Repository {
    inner: icechunk::Repository,
    location: PathBuf,
}

impl Repository {
    /// Initializes a repository in a missing or empty directory. The new
    /// repository has a `main` branch holding one empty snapshot.
    pub async fn create(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        if !matches!(occupancy(&location)?, Occupancy::Vacant) {
            return Err(ChunkStackError::RepositoryExists(
                location.display().to_string(),
            ));
        }
        fs::create_dir_all(&location).map_err(|e| ChunkStackError::io(&location, e))?;
        let storage = icechunk::new_local_filesystem_storage(&location)
            .await
            .map_err(ChunkStackError::store)?;
        let inner = icechunk::Repository::create(
            Some(RepositoryConfig::default()),
            storage,
            HashMap::new(),
        )
        .await
        .map_err(ChunkStackError::store)?;
        info!(location = %location.display(), "Created repository");
        Ok(Self { inner, location })
    }

    /// Opens an existing repository. Nothing is written.
    pub async fn open(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        let not_a_repository = |reason: String| ChunkStackError::NotARepository {
            location: location.display().to_string(),
            reason,
        };
        match occupancy(&location)? {
            Occupancy::Vacant => return Err(not_a_repository("nothing there".to_string())),
            Occupancy::NotADirectory => {
                return Err(not_a_repository("not a directory".to_string()))
            }
            Occupancy::Occupied => {}
        }
        let storage = icechunk::new_local_filesystem_storage(&location)
            .await
            .map_err(|e| not_a_repository(e.to_string()))?;
        let inner = icechunk::Repository::open(
            Some(RepositoryConfig::default()),
            storage,
            HashMap::new(),
        )
        .await
        .map_err(|e| not_a_repository(e.to_string()))?;
        debug!(location = %location.display(), "Opened repository");
        Ok(Self { inner, location })
    }

    /// Creates the repository if the location is missing or empty, otherwise
    /// opens it. Content that is not a repository is left untouched.
    pub async fn open_or_create(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        match occupancy(&location)? {
            Occupancy::Vacant => Self::create(location).await,
            _ => Self::open(location).await,
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Branch names, sorted.
    pub async fn list_branches(&self) -> Result<Vec<String>> {
        let mut branches: Vec<String> = self
            .inner
            .list_branches()
            .await
            .map_err(ChunkStackError::store)?
            .into_iter()
            .collect();
        branches.sort();
        Ok(branches)
    }

    pub async fn branch_tip(&self, branch: &str) -> Result<SnapshotId> {
        self.inner
            .lookup_branch(branch)
            .await
            .map_err(ChunkStackError::store)
    }

    /// Creates `branch` pointing at the snapshot `from` resolves to.
    pub async fn create_branch(&self, branch: &str, from: &VersionInfo) -> Result<SnapshotId> {
        let snapshot = self.resolve(from).await?;
        self.inner
            .create_branch(branch, &snapshot)
            .await
            .map_err(ChunkStackError::store)?;
        info!(branch, %snapshot, "Created branch");
        Ok(snapshot)
    }

    /// Tag names, sorted.
    pub async fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self
            .inner
            .list_tags()
            .await
            .map_err(ChunkStackError::store)?
            .into_iter()
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Creates an immutable `tag` on the snapshot `from` resolves to.
    pub async fn create_tag(&self, tag: &str, from: &VersionInfo) -> Result<SnapshotId> {
        let snapshot = self.resolve(from).await?;
        self.inner
            .create_tag(tag, &snapshot)
            .await
            .map_err(ChunkStackError::store)?;
        info!(tag, %snapshot, "Created tag");
        Ok(snapshot)
    }

    /// The snapshot a branch, tag or snapshot id currently designates.
    pub async fn resolve(&self, version: &VersionInfo) -> Result<SnapshotId> {
        match version {
            VersionInfo::SnapshotId(id) => Ok(id.clone()),
            VersionInfo::BranchTipRef(branch) => self.branch_tip(branch).await,
            VersionInfo::TagRef(tag) => self
                .inner
                .lookup_tag(tag)
                .await
                .map_err(ChunkStackError::store),
            #[allow(unreachable_patterns)]
            _ => Err(ChunkStackError::Unsupported(format!(
                "version {:?}",
                version
            ))),
        }
    }

    pub async fn readonly_session(&self, version: &VersionInfo) -> Result<ReadonlySession> {
        let session = self
            .inner
            .readonly_session(version)
            .await
            .map_err(ChunkStackError::store)?;
        Ok(ReadonlySession::new(session))
    }

    /// A working copy of the tip of `branch`.
    pub async fn writable_session(&self, branch: &str) -> Result<WritableSession<'_>> {
        let session = self.open_writable(branch).await?;
        Ok(WritableSession::new(self, branch.to_string(), session))
    }

    pub(crate) async fn open_writable(&self, branch: &str) -> Result<Session> {
        self.inner
            .writable_session(branch)
            .await
            .map_err(ChunkStackError::store)
    }
}
