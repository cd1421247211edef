use crate::auth::{AuthConfig, AuthKind, AuthTable};
use crate::identity::IdentityResolver;
use crate::wrapper::{WrapperConfig, WrapperTable, CATCH_ALL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration file contents
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Pool tunables for the main server
    #[serde(default)]
    pub server: ServerPoolConfig,

    /// Per-virtual-host overrides of the main server tunables
    #[serde(default)]
    pub vhosts: HashMap<String, ServerOverrides>,

    /// Directory scopes carrying wrapper and auth tables
    #[serde(default)]
    pub directories: Vec<DirectoryScope>,
}

/// Process-class independent pool tunables
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerPoolConfig {
    /// Idle time in seconds after which an idle worker is evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_idle_scan_interval")]
    pub idle_scan_interval_secs: u64,

    #[serde(default = "default_busy_scan_interval")]
    pub busy_scan_interval_secs: u64,

    /// Time in seconds a worker may stay busy on one request before it is killed
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,

    /// Maximum age in seconds of a worker
    #[serde(default = "default_proc_lifetime")]
    pub proc_lifetime_secs: u64,

    #[serde(default = "default_error_scan_interval")]
    pub error_scan_interval_secs: u64,

    #[serde(default = "default_zombie_scan_interval")]
    pub zombie_scan_interval_secs: u64,

    /// Directory in which worker sockets are created
    #[serde(default = "default_socket_prefix")]
    pub socket_prefix: String,

    /// Backing file of the shared process registry
    #[serde(default = "default_shared_state_path")]
    pub shared_state_path: String,

    #[serde(default = "default_spawn_score")]
    pub spawn_score: u32,

    #[serde(default = "default_spawnscore_uplimit")]
    pub spawnscore_uplimit: u32,

    #[serde(default = "default_termination_score")]
    pub termination_score: u32,

    #[serde(default = "default_time_score")]
    pub time_score: u32,

    /// Spawn failures within one error-scan interval before spawning backs off
    #[serde(default = "default_spawn_failure_threshold")]
    pub spawn_failure_threshold: u32,

    #[serde(default = "default_max_process_count")]
    pub max_process_count: usize,

    #[serde(default = "default_max_class_process_count")]
    pub max_class_process_count: usize,

    #[serde(default = "default_min_class_process_count")]
    pub min_class_process_count: usize,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_request_len")]
    pub max_request_len: u64,

    /// Maximum request body size in bytes buffered in memory
    #[serde(default = "default_max_mem_request_len")]
    pub max_mem_request_len: u64,

    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,

    /// Requests a worker serves before it is retired (0 = unlimited)
    #[serde(default)]
    pub max_requests_per_process: u64,

    #[serde(default = "default_ipc_connect_timeout")]
    pub ipc_connect_timeout_secs: u64,

    #[serde(default = "default_ipc_comm_timeout")]
    pub ipc_comm_timeout_secs: u64,

    /// Environment variables injected into every worker
    #[serde(default)]
    pub default_env: HashMap<String, String>,

    /// Request headers forwarded into the worker's request environment
    #[serde(default)]
    pub pass_headers: Vec<String>,

    #[serde(default)]
    pub php_fix_pathinfo: bool,
}

impl Default for ServerPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            idle_scan_interval_secs: default_idle_scan_interval(),
            busy_scan_interval_secs: default_busy_scan_interval(),
            busy_timeout_secs: default_busy_timeout(),
            proc_lifetime_secs: default_proc_lifetime(),
            error_scan_interval_secs: default_error_scan_interval(),
            zombie_scan_interval_secs: default_zombie_scan_interval(),
            socket_prefix: default_socket_prefix(),
            shared_state_path: default_shared_state_path(),
            spawn_score: default_spawn_score(),
            spawnscore_uplimit: default_spawnscore_uplimit(),
            termination_score: default_termination_score(),
            time_score: default_time_score(),
            spawn_failure_threshold: default_spawn_failure_threshold(),
            max_process_count: default_max_process_count(),
            max_class_process_count: default_max_class_process_count(),
            min_class_process_count: default_min_class_process_count(),
            max_request_len: default_max_request_len(),
            max_mem_request_len: default_max_mem_request_len(),
            output_buffer_size: default_output_buffer_size(),
            max_requests_per_process: 0,
            ipc_connect_timeout_secs: default_ipc_connect_timeout(),
            ipc_comm_timeout_secs: default_ipc_comm_timeout(),
            default_env: HashMap::new(),
            pass_headers: Vec::new(),
            php_fix_pathinfo: false,
        }
    }
}

impl ServerPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_scan_interval(&self) -> Duration {
        Duration::from_secs(self.idle_scan_interval_secs)
    }

    pub fn busy_scan_interval(&self) -> Duration {
        Duration::from_secs(self.busy_scan_interval_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn proc_lifetime(&self) -> Duration {
        Duration::from_secs(self.proc_lifetime_secs)
    }

    pub fn error_scan_interval(&self) -> Duration {
        Duration::from_secs(self.error_scan_interval_secs)
    }

    pub fn zombie_scan_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_scan_interval_secs)
    }

    pub fn ipc_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ipc_connect_timeout_secs)
    }

    pub fn ipc_comm_timeout(&self) -> Duration {
        Duration::from_secs(self.ipc_comm_timeout_secs)
    }

    /// Validate bounds and intervals, returning every problem found
    pub fn validate(&self, scope: &str) -> Vec<String> {
        let mut errors = Vec::new();

        if self.min_class_process_count > self.max_class_process_count {
            errors.push(format!(
                "{}: min_class_process_count ({}) exceeds max_class_process_count ({})",
                scope, self.min_class_process_count, self.max_class_process_count
            ));
        }
        if self.max_class_process_count > self.max_process_count {
            errors.push(format!(
                "{}: max_class_process_count ({}) exceeds max_process_count ({})",
                scope, self.max_class_process_count, self.max_process_count
            ));
        }
        if self.max_process_count == 0 {
            errors.push(format!("{}: max_process_count must be greater than 0", scope));
        }
        if self.max_mem_request_len > self.max_request_len {
            errors.push(format!(
                "{}: max_mem_request_len ({}) exceeds max_request_len ({})",
                scope, self.max_mem_request_len, self.max_request_len
            ));
        }
        if self.output_buffer_size == 0 {
            errors.push(format!("{}: output_buffer_size must be greater than 0", scope));
        }

        let intervals = [
            ("idle_scan_interval_secs", self.idle_scan_interval_secs),
            ("busy_scan_interval_secs", self.busy_scan_interval_secs),
            ("error_scan_interval_secs", self.error_scan_interval_secs),
            ("zombie_scan_interval_secs", self.zombie_scan_interval_secs),
            ("ipc_connect_timeout_secs", self.ipc_connect_timeout_secs),
            ("ipc_comm_timeout_secs", self.ipc_comm_timeout_secs),
            ("spawn_failure_threshold", self.spawn_failure_threshold as u64),
        ];
        for (name, value) in intervals {
            if value == 0 {
                errors.push(format!("{}: '{}' must be greater than 0", scope, name));
            }
        }

        for name in self.default_env.keys() {
            if name.is_empty() || name.contains('=') {
                errors.push(format!("{}: invalid environment variable name '{}'", scope, name));
            }
        }

        errors
    }
}

/// Optional per-vhost overrides of [`ServerPoolConfig`]
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerOverrides {
    pub idle_timeout_secs: Option<u64>,
    pub idle_scan_interval_secs: Option<u64>,
    pub busy_scan_interval_secs: Option<u64>,
    pub busy_timeout_secs: Option<u64>,
    pub proc_lifetime_secs: Option<u64>,
    pub error_scan_interval_secs: Option<u64>,
    pub zombie_scan_interval_secs: Option<u64>,
    pub socket_prefix: Option<String>,
    pub shared_state_path: Option<String>,
    pub spawn_score: Option<u32>,
    pub spawnscore_uplimit: Option<u32>,
    pub termination_score: Option<u32>,
    pub time_score: Option<u32>,
    pub spawn_failure_threshold: Option<u32>,
    pub max_process_count: Option<usize>,
    pub max_class_process_count: Option<usize>,
    pub min_class_process_count: Option<usize>,
    pub max_request_len: Option<u64>,
    pub max_mem_request_len: Option<u64>,
    pub output_buffer_size: Option<usize>,
    pub max_requests_per_process: Option<u64>,
    pub ipc_connect_timeout_secs: Option<u64>,
    pub ipc_comm_timeout_secs: Option<u64>,
    /// Added to (and overriding) the inherited default environment
    #[serde(default)]
    pub default_env: HashMap<String, String>,
    /// Appended to the inherited pass-through headers
    #[serde(default)]
    pub pass_headers: Vec<String>,
    pub php_fix_pathinfo: Option<bool>,
}

impl ServerOverrides {
    /// Settings that only the main server's scanner reads
    ///
    /// Scan cadence always follows the main server. The error and zombie intervals
    /// stay overridable since they also set a class's backoff window and kill grace.
    fn server_only(&self) -> Vec<&'static str> {
        [
            ("idle_scan_interval_secs", self.idle_scan_interval_secs),
            ("busy_scan_interval_secs", self.busy_scan_interval_secs),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_some())
        .map(|(name, _)| name)
        .collect()
    }

    /// Produce the effective configuration of this vhost
    pub fn apply(&self, base: &ServerPoolConfig) -> ServerPoolConfig {
        let mut c = base.clone();

        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field.clone() { c.$field = v; })*
            };
        }
        take!(
            idle_timeout_secs,
            busy_timeout_secs,
            proc_lifetime_secs,
            error_scan_interval_secs,
            zombie_scan_interval_secs,
            socket_prefix,
            shared_state_path,
            spawn_score,
            spawnscore_uplimit,
            termination_score,
            time_score,
            spawn_failure_threshold,
            max_process_count,
            max_class_process_count,
            min_class_process_count,
            max_request_len,
            max_mem_request_len,
            output_buffer_size,
            max_requests_per_process,
            ipc_connect_timeout_secs,
            ipc_comm_timeout_secs,
            php_fix_pathinfo,
        );

        for (k, v) in &self.default_env {
            c.default_env.insert(k.clone(), v.clone());
        }
        for header in &self.pass_headers {
            if !c.pass_headers.iter().any(|h| h.eq_ignore_ascii_case(header)) {
                c.pass_headers.push(header.clone());
            }
        }
        c
    }
}

/// Auth worker declaration in a directory scope
#[derive(Debug, Deserialize, Clone)]
pub struct AuthEntry {
    /// Path of the auth worker executable
    pub command: String,
    #[serde(default = "default_authoritative")]
    pub authoritative: bool,
}

/// A directory scope as written in the configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryScope {
    /// Absolute directory path this scope applies to
    pub path: String,

    /// Administrator-declared share group for classes resolved in this scope
    pub share_group: Option<u64>,

    /// Extension (".php", or "*" for any) to wrapper command line
    #[serde(default)]
    pub wrappers: HashMap<String, String>,

    pub authenticator: Option<AuthEntry>,
    pub authorizer: Option<AuthEntry>,
    pub access: Option<AuthEntry>,
}

impl DirectoryScope {
    fn auth_entry(&self, kind: AuthKind) -> Option<&AuthEntry> {
        match kind {
            AuthKind::Authenticator => self.authenticator.as_ref(),
            AuthKind::Authorizer => self.authorizer.as_ref(),
            AuthKind::Access => self.access.as_ref(),
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !Path::new(&self.path).is_absolute() {
            errors.push(format!("Directory '{}': path must be absolute", self.path));
        }
        for (ext, command) in &self.wrappers {
            if ext != CATCH_ALL && (!ext.starts_with('.') || ext.len() < 2 || ext.contains('/')) {
                errors.push(format!(
                    "Directory '{}': invalid wrapper extension '{}' (expected \".ext\" or \"*\")",
                    self.path, ext
                ));
            }
            if command.trim().is_empty() {
                errors.push(format!(
                    "Directory '{}': wrapper for '{}' has an empty command",
                    self.path, ext
                ));
            }
        }
        for kind in AuthKind::ALL {
            if let Some(entry) = self.auth_entry(kind) {
                if entry.command.trim().is_empty() {
                    errors.push(format!(
                        "Directory '{}': {} command is empty",
                        self.path, kind
                    ));
                }
            }
        }
        errors
    }
}

/// Effective wrapper and auth configuration of one directory scope
#[derive(Debug, Clone, Default)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    pub share_group_id: u64,
    pub wrappers: WrapperTable,
    pub auth: AuthTable,
}

impl DirectoryConfig {
    /// Resolve the wrapper serving `file_path`, `None` when the file runs directly
    pub fn resolve_wrapper(&self, file_path: &Path) -> Option<&WrapperConfig> {
        self.wrappers.resolve(file_path)
    }

    pub fn resolve_auth(&self, kind: AuthKind) -> Option<&AuthConfig> {
        self.auth.get(kind)
    }
}

/// Configuration resolved once at load time into immutable per-scope values
#[derive(Debug, Clone)]
pub struct Settings {
    server: Arc<ServerPoolConfig>,
    vhosts: HashMap<String, Arc<ServerPoolConfig>>,
    /// Sorted deepest path first, so the first prefix match is the nearest scope
    directories: Vec<Arc<DirectoryConfig>>,
    root: Arc<DirectoryConfig>,
}

impl Settings {
    /// Validate and resolve a parsed configuration
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let server = Arc::new(config.server.clone());
        let vhosts = config
            .vhosts
            .iter()
            .map(|(host, overrides)| {
                (host.to_lowercase(), Arc::new(overrides.apply(&config.server)))
            })
            .collect();

        let resolver = IdentityResolver;
        let mut errors = Vec::new();

        // Shallowest first so every parent is resolved before its children
        let mut scopes = config.directories.clone();
        scopes.sort_by_key(|s| Path::new(&s.path).components().count());

        let mut resolved: Vec<Arc<DirectoryConfig>> = Vec::new();
        for scope in &scopes {
            let path = PathBuf::from(&scope.path);
            let parent = resolved
                .iter()
                .rev()
                .find(|d| path.starts_with(&d.path) && d.path != path)
                .cloned();
            let share_group_id = scope
                .share_group
                .or_else(|| parent.as_ref().map(|p| p.share_group_id))
                .unwrap_or(0);

            let mut wrappers = WrapperTable::new();
            for (ext, command) in &scope.wrappers {
                match WrapperConfig::from_command(command, share_group_id, &resolver) {
                    Ok(w) => wrappers.insert(ext.clone(), w),
                    Err(e) => errors.push(format!(
                        "Directory '{}': wrapper for '{}': {}",
                        scope.path, ext, e
                    )),
                }
            }

            let mut auth = AuthTable::default();
            for kind in AuthKind::ALL {
                if let Some(entry) = scope.auth_entry(kind) {
                    match AuthConfig::resolve(
                        kind,
                        &entry.command,
                        entry.authoritative,
                        share_group_id,
                        &resolver,
                    ) {
                        Ok(a) => auth.set(a),
                        Err(e) => errors.push(format!(
                            "Directory '{}': {}: {}",
                            scope.path, kind, e
                        )),
                    }
                }
            }

            let (wrappers, auth) = match parent {
                Some(ref p) => (wrappers.layered_over(&p.wrappers), auth.layered_over(&p.auth)),
                None => (wrappers, auth),
            };

            resolved.push(Arc::new(DirectoryConfig {
                path,
                share_group_id,
                wrappers,
                auth,
            }));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        resolved.sort_by_key(|d| std::cmp::Reverse(d.path.components().count()));

        Ok(Self {
            server,
            vhosts,
            directories: resolved,
            root: Arc::new(DirectoryConfig::default()),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::from_config(Config::load(path)?)
    }

    /// Main server configuration
    pub fn main_server(&self) -> Arc<ServerPoolConfig> {
        Arc::clone(&self.server)
    }

    /// Effective configuration for a virtual host (main server if not overridden)
    pub fn server(&self, host: &str) -> Arc<ServerPoolConfig> {
        self.vhosts
            .get(&host.to_lowercase())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.server))
    }

    /// Nearest directory scope enclosing `path`
    pub fn directory(&self, path: &Path) -> Arc<DirectoryConfig> {
        self.directories
            .iter()
            .find(|d| path.starts_with(&d.path))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.root))
    }

    pub fn resolve_wrapper(&self, file_path: &Path) -> Option<WrapperConfig> {
        self.directory(file_path).resolve_wrapper(file_path).cloned()
    }

    pub fn resolve_auth(&self, kind: AuthKind, scope: &Path) -> Option<AuthConfig> {
        self.directory(scope).resolve_auth(kind).cloned()
    }
}

// Default value functions
fn default_idle_timeout() -> u64 {
    300
}

fn default_idle_scan_interval() -> u64 {
    120
}

fn default_busy_scan_interval() -> u64 {
    120
}

fn default_busy_timeout() -> u64 {
    300
}

fn default_proc_lifetime() -> u64 {
    3600
}

fn default_error_scan_interval() -> u64 {
    3
}

fn default_zombie_scan_interval() -> u64 {
    3
}

fn default_socket_prefix() -> String {
    "logs/fcgidsock".to_string()
}

fn default_shared_state_path() -> String {
    "logs/fcgid_shm".to_string()
}

fn default_spawn_score() -> u32 {
    1
}

fn default_spawnscore_uplimit() -> u32 {
    10
}

fn default_termination_score() -> u32 {
    2
}

fn default_time_score() -> u32 {
    1
}

fn default_spawn_failure_threshold() -> u32 {
    3
}

fn default_max_process_count() -> usize {
    1000
}

fn default_max_class_process_count() -> usize {
    100
}

fn default_min_class_process_count() -> usize {
    3
}

fn default_max_request_len() -> u64 {
    128 * 1024
}

fn default_max_mem_request_len() -> u64 {
    64 * 1024
}

fn default_output_buffer_size() -> usize {
    64 * 1024
}

fn default_ipc_connect_timeout() -> u64 {
    3
}

fn default_ipc_comm_timeout() -> u64 {
    40
}

fn default_authoritative() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.server.validate("server");

        for (host, overrides) in &self.vhosts {
            for name in overrides.server_only() {
                errors.push(format!(
                    "vhost '{}': '{}' applies to the main server only",
                    host, name
                ));
            }
            let effective = overrides.apply(&self.server);
            errors.extend(effective.validate(&format!("vhost '{}'", host)));
        }

        for scope in &self.directories {
            errors.extend(scope.validate());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
