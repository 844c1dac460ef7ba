use std::io;
use std::path::{Path, PathBuf};

use corpus_types::hash::ContentHash;
use corpus_types::BaseId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The on-disk tree of preprocessing workspaces.
///
/// Directories are partitioned as `<root>/<base>/<hash-hex>/<module>` so
/// that no two concurrent preprocessing invocations ever share a
/// directory. The module level of the tree is created on demand; the whole
/// `<base>/<hash>` subtree is removed once a resource hash leaves the
/// system.
#[derive(Clone, Debug)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl AsRef<Path>) -> Result<WorkspaceStore> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(WorkspaceStore { root })
    }

    /// The directory holding every workspace derived from one resource hash.
    pub fn resource_dir(&self, base: BaseId, hash: &ContentHash) -> PathBuf {
        self.root.join(base.to_string()).join(hash.to_hex())
    }

    /// Create (if needed) and return the workspace owned by one
    /// preprocessing invocation.
    pub fn module_workspace(
        &self,
        base: BaseId,
        hash: &ContentHash,
        module: &str,
    ) -> Result<PathBuf> {
        let path = self.resource_dir(base, hash).join(module);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// The workspace of a previous preprocessing of a related resource, or
    /// `None` when it no longer exists on disk.
    pub fn latest_cache(&self, base: BaseId, from_hash: &ContentHash, module: &str) -> Option<PathBuf> {
        let path = self.resource_dir(base, from_hash).join(module);
        path.is_dir().then_some(path)
    }

    /// Recursively delete everything derived from one resource hash.
    /// Already-missing directories are not an error.
    pub fn remove_resource_dir(&self, base: BaseId, hash: &ContentHash) -> Result<()> {
        let path = self.resource_dir(base, hash);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::error!("Can't delete workspace directory {}: {e}", path.display());
                Err(e.into())
            }
        }
    }
}
