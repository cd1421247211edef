//! Worker process launching and signalling
//!
//! The pool talks to processes through the [`Launcher`] trait so tests can supply
//! in-process workers. [`OsLauncher`] is the real implementation: it binds the
//! worker's listen socket, hands it over as the child's stdin, and keeps the
//! `Child` handles it needs to reap exited workers.

use crate::error::PoolError;
use crate::identity::ProcessClassIdentity;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How often `stop` re-checks a signalled process
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to start one worker
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub class: ProcessClassIdentity,
    /// argv, program first
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Unix socket the worker accepts connections on
    pub socket_path: PathBuf,
    pub working_dir: Option<PathBuf>,
}

/// Socket path for a worker: `<prefix>/<manager pid>.<worker id>`
pub fn socket_path(prefix: impl AsRef<Path>, manager_pid: u32, worker_id: u64) -> PathBuf {
    prefix
        .as_ref()
        .join(format!("{}.{}", manager_pid, worker_id))
}

/// Observed state of an OS process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exited (and reaped if this launcher owned it); exit code when known
    Exited(Option<i32>),
    Unknown,
}

pub trait Launcher: Send + Sync {
    /// Start a worker, returning its pid
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, PoolError>;

    /// Ask a worker to exit (SIGTERM), or kill it outright (SIGKILL)
    fn signal(&self, pid: u32, force: bool);

    /// Check whether a worker is still running, reaping it if it has exited
    fn poll(&self, pid: u32) -> ProcessStatus;
}

/// Launches workers as child processes of this server process
#[derive(Debug, Default)]
pub struct OsLauncher {
    children: DashMap<u32, Child>,
}

impl OsLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of children not yet reaped
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[cfg(unix)]
    fn bind_listener(path: &Path) -> Result<Stdio, PoolError> {
        use std::os::fd::OwnedFd;
        use std::os::unix::net::UnixListener;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // A stale socket from a previous run would make bind fail
        match std::fs::remove_file(path) {
            Ok(()) => debug!(socket = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        Ok(Stdio::from(OwnedFd::from(listener)))
    }
}

impl Launcher for OsLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, PoolError> {
        let (program, args) = spec
            .args
            .split_first()
            .ok_or_else(|| PoolError::Spawn("empty launch command".to_string()))?;

        info!(
            class = %spec.class.key(),
            command = %program,
            socket = %spec.socket_path.display(),
            "Starting worker"
        );

        let mut cmd = Command::new(program);
        cmd.args(args);
        #[cfg(unix)]
        cmd.stdin(Self::bind_listener(&spec.socket_path)?);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|e| {
            let _ = std::fs::remove_file(&spec.socket_path);
            PoolError::Spawn(format!("{}: {}", program, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| PoolError::Spawn(format!("{}: exited during spawn", program)))?;

        info!(class = %spec.class.key(), pid, "Worker process spawned");
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn signal(&self, pid: u32, force: bool) {
        if pid == 0 {
            return;
        }

        #[cfg(unix)]
        {
            let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
            debug!(pid, force, "Signalling worker");
            unsafe {
                libc::kill(pid as i32, sig);
            }
        }

        #[cfg(not(unix))]
        if let Some(mut child) = self.children.get_mut(&pid) {
            let _ = child.start_kill();
        }
    }

    fn poll(&self, pid: u32) -> ProcessStatus {
        if pid == 0 {
            return ProcessStatus::Unknown;
        }

        let waited = match self.children.get_mut(&pid) {
            Some(mut child) => child.try_wait(),
            None => return foreign_status(pid),
        };
        match waited {
            Ok(Some(status)) => {
                self.children.remove(&pid);
                debug!(pid, ?status, "Worker reaped");
                ProcessStatus::Exited(status.code())
            }
            Ok(None) => ProcessStatus::Running,
            Err(e) => {
                warn!(pid, error = %e, "Error polling worker");
                ProcessStatus::Unknown
            }
        }
    }
}

/// Status of a process this launcher does not own (e.g. started by another server process)
#[cfg(unix)]
fn foreign_status(pid: u32) -> ProcessStatus {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return ProcessStatus::Running;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => ProcessStatus::Exited(None),
        // EPERM: exists but belongs to someone else
        Some(libc::EPERM) => ProcessStatus::Running,
        _ => ProcessStatus::Unknown,
    }
}

#[cfg(not(unix))]
fn foreign_status(_pid: u32) -> ProcessStatus {
    ProcessStatus::Unknown
}

/// Stop a worker: SIGTERM, wait up to `grace`, then SIGKILL
pub async fn stop(launcher: &dyn Launcher, pid: u32, grace: Duration) -> ProcessStatus {
    launcher.signal(pid, false);

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match launcher.poll(pid) {
            ProcessStatus::Running => {}
            status => {
                debug!(pid, ?status, "Worker exited gracefully");
                return status;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    warn!(
        pid,
        grace_period_ms = grace.as_millis() as u64,
        "Grace period exceeded, sending SIGKILL"
    );
    launcher.signal(pid, true);
    for _ in 0..20 {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
        if let status @ ProcessStatus::Exited(_) = launcher.poll(pid) {
            return status;
        }
    }
    launcher.poll(pid)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(tmp: &TempDir, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            class: ProcessClassIdentity::new("/bin/sh", 1, 1, 0),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            socket_path: socket_path(tmp.path().join("sock"), 1, 1),
            working_dir: None,
        }
    }

    #[test]
    fn test_socket_path_naming() {
        let p = socket_path("/run/fcgid", 4242, 17);
        assert_eq!(p, PathBuf::from("/run/fcgid/4242.17"));
    }

    #[tokio::test]
    async fn test_launch_binds_socket_and_stops() {
        let tmp = TempDir::new().unwrap();
        let launcher = OsLauncher::new();
        let spec = spec(&tmp, &["sleep", "60"]);

        let pid = launcher.launch(&spec).unwrap();
        assert!(pid > 0);
        assert!(spec.socket_path.exists());
        assert_eq!(launcher.poll(pid), ProcessStatus::Running);
        assert_eq!(launcher.child_count(), 1);

        let status = stop(&launcher, pid, Duration::from_secs(2)).await;
        assert!(matches!(status, ProcessStatus::Exited(_)));
        assert_eq!(launcher.child_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let tmp = TempDir::new().unwrap();
        let launcher = OsLauncher::new();
        let spec = spec(&tmp, &["sh", "-c", "trap '' TERM; sleep 30"]);

        let pid = launcher.launch(&spec).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = stop(&launcher, pid, Duration::from_millis(200)).await;
        assert!(matches!(status, ProcessStatus::Exited(_)));
    }

    #[tokio::test]
    async fn test_poll_reports_exit_code() {
        let tmp = TempDir::new().unwrap();
        let launcher = OsLauncher::new();
        let pid = launcher.launch(&spec(&tmp, &["sh", "-c", "exit 3"])).unwrap();

        let mut status = ProcessStatus::Running;
        for _ in 0..100 {
            status = launcher.poll(pid);
            if status != ProcessStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, ProcessStatus::Exited(Some(3)));
    }

    #[tokio::test]
    async fn test_launch_missing_program() {
        let tmp = TempDir::new().unwrap();
        let launcher = OsLauncher::new();
        let spec = spec(&tmp, &["/no/such/worker"]);

        let err = launcher.launch(&spec).unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
        assert!(!spec.socket_path.exists());
    }

    #[test]
    fn test_foreign_pid_status() {
        assert_eq!(foreign_status(std::process::id()), ProcessStatus::Running);
        assert_eq!(OsLauncher::new().poll(0), ProcessStatus::Unknown);
    }
}
