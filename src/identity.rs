//! Process-class identity resolution
//!
//! Requests are pooled by the identity of the executable that serves them, not by
//! the path used to reach it: two paths that resolve to the same inode on the same
//! device share one class, unless an administrator puts them in different share
//! groups.

use crate::error::PoolError;
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// The pooling key: executable inode, device and share group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClassKey {
    pub inode: u64,
    pub device_id: u64,
    pub share_group_id: u64,
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.device_id, self.inode, self.share_group_id)
    }
}

/// Identity of a pooled process class
///
/// `path` is the path the class was first reached by and is informational only;
/// equality and hashing use the [`ClassKey`] fields.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessClassIdentity {
    pub path: PathBuf,
    pub inode: u64,
    pub device_id: u64,
    pub share_group_id: u64,
}

impl ProcessClassIdentity {
    pub fn new(path: impl Into<PathBuf>, inode: u64, device_id: u64, share_group_id: u64) -> Self {
        Self {
            path: path.into(),
            inode,
            device_id,
            share_group_id,
        }
    }

    pub fn key(&self) -> ClassKey {
        ClassKey {
            inode: self.inode,
            device_id: self.device_id,
            share_group_id: self.share_group_id,
        }
    }
}

impl PartialEq for ProcessClassIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ProcessClassIdentity {}

impl Hash for ProcessClassIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Resolves filesystem paths to process-class identities
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl IdentityResolver {
    /// Stat `path` (following symlinks) and build its identity in `share_group_id`
    pub fn resolve(
        &self,
        path: impl AsRef<Path>,
        share_group_id: u64,
    ) -> Result<ProcessClassIdentity, PoolError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .map_err(|e| PoolError::NotFound(format!("{}: {}", path.display(), e)))?;

        if !metadata.is_file() {
            return Err(PoolError::NotFound(format!(
                "{}: not a regular file",
                path.display()
            )));
        }

        let (inode, device_id) = file_id(path, &metadata);
        Ok(ProcessClassIdentity::new(path, inode, device_id, share_group_id))
    }
}

#[cfg(unix)]
fn file_id(_path: &Path, metadata: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.ino(), metadata.dev())
}

#[cfg(not(unix))]
fn file_id(path: &Path, _metadata: &std::fs::Metadata) -> (u64, u64) {
    use std::collections::hash_map::DefaultHasher;
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    (hasher.finish(), 0)
}
