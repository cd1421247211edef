//! Wrapper resolution: file extension to launch command
//!
//! Administrators map extensions (`.php`, `.inc.php`, or the catch-all `*`) to a
//! wrapper command that serves every file with that extension. The wrapper's own
//! executable identity becomes the process-class identity, so all files served by
//! one wrapper share one pool of workers.

use crate::error::PoolError;
use crate::identity::{IdentityResolver, ProcessClassIdentity};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extension key matching any file without a more specific wrapper
pub const CATCH_ALL: &str = "*";

/// A resolved wrapper: launch command plus the identity of its executable
#[derive(Debug, Clone, Serialize)]
pub struct WrapperConfig {
    /// argv used to launch a worker (program first)
    pub launch_args: Vec<String>,
    /// Path of the wrapper executable
    pub path: PathBuf,
    pub inode: u64,
    pub device_id: u64,
    pub share_group_id: u64,
}

impl WrapperConfig {
    /// Parse a wrapper command line and resolve its executable
    pub fn from_command(
        command: &str,
        share_group_id: u64,
        resolver: &IdentityResolver,
    ) -> Result<Self, PoolError> {
        let launch_args = shell_words::split(command)
            .map_err(|e| PoolError::NotFound(format!("wrapper '{}': {}", command, e)))?;
        let program = launch_args
            .first()
            .ok_or_else(|| PoolError::NotFound("wrapper command is empty".to_string()))?;

        let identity = resolver.resolve(program, share_group_id)?;
        Ok(Self {
            path: identity.path,
            inode: identity.inode,
            device_id: identity.device_id,
            share_group_id,
            launch_args,
        })
    }

    /// The process-class identity of workers launched through this wrapper
    pub fn identity(&self) -> ProcessClassIdentity {
        ProcessClassIdentity::new(
            self.path.clone(),
            self.inode,
            self.device_id,
            self.share_group_id,
        )
    }
}

/// Extension to wrapper table for one directory scope
#[derive(Debug, Clone, Default)]
pub struct WrapperTable {
    entries: HashMap<String, Arc<WrapperConfig>>,
}

impl WrapperTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, extension: impl Into<String>, wrapper: WrapperConfig) {
        self.entries.insert(extension.into(), Arc::new(wrapper));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries of `self` layered over those of an enclosing scope
    pub fn layered_over(&self, parent: &WrapperTable) -> WrapperTable {
        let mut entries = parent.entries.clone();
        for (ext, wrapper) in &self.entries {
            entries.insert(ext.clone(), Arc::clone(wrapper));
        }
        WrapperTable { entries }
    }

    /// Longest-extension match for `file_path`, falling back to the catch-all
    pub fn resolve(&self, file_path: &Path) -> Option<&WrapperConfig> {
        let name = file_path.file_name()?.to_str()?;

        // "a.inc.php" tries ".inc.php" before ".php"
        let found = name
            .match_indices('.')
            .map(|(i, _)| &name[i..])
            .find_map(|ext| self.entries.get(ext));

        found
            .or_else(|| self.entries.get(CATCH_ALL))
            .map(|w| w.as_ref())
    }
}
