//! Auth delegate lookup
//!
//! Authenticator, authorizer and access-check workers share one configuration
//! shape, tagged by [`AuthKind`]. The host pipeline asks for the configuration that
//! applies to a request scope and runs the worker itself; only the lookup contract
//! lives here.

use crate::error::PoolError;
use crate::identity::{IdentityResolver, ProcessClassIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Role an auth worker plays in the request pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Authenticator,
    Authorizer,
    Access,
}

impl AuthKind {
    pub const ALL: [AuthKind; 3] = [AuthKind::Authenticator, AuthKind::Authorizer, AuthKind::Access];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Authenticator => "authenticator",
            AuthKind::Authorizer => "authorizer",
            AuthKind::Access => "access",
        }
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved auth worker for one scope
#[derive(Debug, Clone, Serialize)]
pub struct AuthConfig {
    pub kind: AuthKind,
    pub path: PathBuf,
    pub inode: u64,
    pub device_id: u64,
    pub share_group_id: u64,
    /// When false, a failed check falls through to other auth mechanisms
    pub authoritative: bool,
}

impl AuthConfig {
    pub fn resolve(
        kind: AuthKind,
        path: impl Into<PathBuf>,
        authoritative: bool,
        share_group_id: u64,
        resolver: &IdentityResolver,
    ) -> Result<Self, PoolError> {
        let path: PathBuf = path.into();
        let identity = resolver.resolve(&path, share_group_id)?;
        Ok(Self {
            kind,
            path: identity.path,
            inode: identity.inode,
            device_id: identity.device_id,
            share_group_id,
            authoritative,
        })
    }

    pub fn identity(&self) -> ProcessClassIdentity {
        ProcessClassIdentity::new(
            self.path.clone(),
            self.inode,
            self.device_id,
            self.share_group_id,
        )
    }
}

/// The three optional auth entries of one scope
#[derive(Debug, Clone, Default)]
pub struct AuthTable {
    authenticator: Option<AuthConfig>,
    authorizer: Option<AuthConfig>,
    access: Option<AuthConfig>,
}

impl AuthTable {
    pub fn set(&mut self, config: AuthConfig) {
        match config.kind {
            AuthKind::Authenticator => self.authenticator = Some(config),
            AuthKind::Authorizer => self.authorizer = Some(config),
            AuthKind::Access => self.access = Some(config),
        }
    }

    pub fn get(&self, kind: AuthKind) -> Option<&AuthConfig> {
        match kind {
            AuthKind::Authenticator => self.authenticator.as_ref(),
            AuthKind::Authorizer => self.authorizer.as_ref(),
            AuthKind::Access => self.access.as_ref(),
        }
    }

    /// Entries of `self`, with unset kinds inherited from an enclosing scope
    pub fn layered_over(&self, parent: &AuthTable) -> AuthTable {
        AuthTable {
            authenticator: self.authenticator.clone().or_else(|| parent.authenticator.clone()),
            authorizer: self.authorizer.clone().or_else(|| parent.authorizer.clone()),
            access: self.access.clone().or_else(|| parent.access.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn auth(tmp: &TempDir, kind: AuthKind, name: &str, authoritative: bool) -> AuthConfig {
        let exe = tmp.path().join(name);
        std::fs::write(&exe, "").unwrap();
        AuthConfig::resolve(kind, exe, authoritative, 0, &IdentityResolver).unwrap()
    }

    #[test]
    fn test_table_get_by_kind() {
        let tmp = TempDir::new().unwrap();
        let mut table = AuthTable::default();
        table.set(auth(&tmp, AuthKind::Authorizer, "authz", false));

        assert!(table.get(AuthKind::Authenticator).is_none());
        let authz = table.get(AuthKind::Authorizer).unwrap();
        assert_eq!(authz.kind, AuthKind::Authorizer);
        assert!(!authz.authoritative);
        assert!(table.get(AuthKind::Access).is_none());
    }

    #[test]
    fn test_layered_inherits_unset_kinds() {
        let tmp = TempDir::new().unwrap();
        let mut parent = AuthTable::default();
        parent.set(auth(&tmp, AuthKind::Authenticator, "outer", true));
        parent.set(auth(&tmp, AuthKind::Access, "outer-access", true));

        let mut child = AuthTable::default();
        child.set(auth(&tmp, AuthKind::Authenticator, "inner", false));

        let effective = child.layered_over(&parent);
        assert!(effective
            .get(AuthKind::Authenticator)
            .unwrap()
            .path
            .ends_with("inner"));
        assert!(effective
            .get(AuthKind::Access)
            .unwrap()
            .path
            .ends_with("outer-access"));
        assert!(effective.get(AuthKind::Authorizer).is_none());
    }

    #[test]
    fn test_missing_auth_executable() {
        let err = AuthConfig::resolve(
            AuthKind::Access,
            "/no/such/checker",
            true,
            0,
            &IdentityResolver,
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::NotFound(_)));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(AuthKind::Authenticator.to_string(), "authenticator");
        let kind: AuthKind = serde_json::from_str("\"access\"").unwrap();
        assert_eq!(kind, AuthKind::Access);
    }
}
