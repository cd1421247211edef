//! Shared helpers for integration tests: an in-process launcher and a pool harness

#![allow(dead_code)]

use dashmap::DashMap;
use fcgid_pool::clock::ManualClock;
use fcgid_pool::config::{Config, ServerPoolConfig, Settings};
use fcgid_pool::process::{LaunchSpec, Launcher, ProcessStatus};
use fcgid_pool::registry::RegistryStore;
use fcgid_pool::store::MemoryStore;
use fcgid_pool::{PoolError, WorkerPool};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

/// How a fake worker treats its socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reply `<pid>:<request>` once the request side is closed
    Echo,
    /// Accept connections but never answer
    Silent,
    /// Never bind the socket
    NoListen,
}

struct FakeWorker {
    task: Option<JoinHandle<()>>,
    exited: bool,
    ignores_term: bool,
}

/// Launcher whose "processes" are tasks in the test runtime
pub struct FakeLauncher {
    next_pid: AtomicU32,
    workers: DashMap<u32, FakeWorker>,
    behavior: Mutex<Behavior>,
    fail: AtomicBool,
    ignore_term: AtomicBool,
    pub attempts: AtomicUsize,
    pub launches: AtomicUsize,
    pub signals: Mutex<Vec<(u32, bool)>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(50_000),
            workers: DashMap::new(),
            behavior: Mutex::new(Behavior::Echo),
            fail: AtomicBool::new(false),
            ignore_term: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            signals: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_ignore_term(&self, ignore: bool) {
        self.ignore_term.store(ignore, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn signals_for(&self, pid: u32) -> Vec<bool> {
        self.signals
            .lock()
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, force)| *force)
            .collect()
    }

    /// Simulate the worker dying on its own
    pub fn crash(&self, pid: u32) {
        if let Some(mut w) = self.workers.get_mut(&pid) {
            w.exited = true;
            if let Some(task) = w.task.take() {
                task.abort();
            }
        }
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.workers.get(&pid).map(|w| !w.exited).unwrap_or(false)
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32, PoolError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PoolError::Spawn("injected launch failure".to_string()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.behavior.lock();
        let task = match behavior {
            Behavior::NoListen => None,
            Behavior::Echo | Behavior::Silent => {
                if let Some(dir) = spec.socket_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let listener = UnixListener::bind(&spec.socket_path)?;
                Some(tokio::spawn(serve(listener, pid, behavior)))
            }
        };

        self.workers.insert(
            pid,
            FakeWorker {
                task,
                exited: false,
                ignores_term: self.ignore_term.load(Ordering::SeqCst),
            },
        );
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(pid)
    }

    fn signal(&self, pid: u32, force: bool) {
        self.signals.lock().push((pid, force));
        let honors = self
            .workers
            .get(&pid)
            .map(|w| force || !w.ignores_term)
            .unwrap_or(false);
        if honors {
            self.crash(pid);
        }
    }

    fn poll(&self, pid: u32) -> ProcessStatus {
        match self.workers.get(&pid) {
            Some(w) if w.exited => ProcessStatus::Exited(Some(0)),
            Some(_) => ProcessStatus::Running,
            None => ProcessStatus::Unknown,
        }
    }
}

async fn serve(listener: UnixListener, pid: u32, behavior: Behavior) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            match behavior {
                Behavior::Echo => {
                    let mut request = Vec::new();
                    if stream.read_to_end(&mut request).await.is_ok() {
                        let mut reply = format!("{}:", pid).into_bytes();
                        reply.extend_from_slice(&request);
                        let _ = stream.write_all(&reply).await;
                    }
                }
                _ => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(stream);
                }
            }
        });
    }
}

/// A pool wired to a fake launcher and a manual clock
pub struct Harness {
    pub pool: WorkerPool,
    pub launcher: Arc<FakeLauncher>,
    pub clock: Arc<ManualClock>,
    pub script: PathBuf,
    pub tmp: TempDir,
}

impl Harness {
    pub fn host(&self) -> &'static str {
        "www.example.com"
    }

    /// Another script file, which is its own process class
    pub fn other_script(&self, name: &str) -> PathBuf {
        let path = self.tmp.path().join("htdocs").join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        path
    }
}

/// Test defaults: no floor, short IPC timeouts
pub fn test_config(tmp: &TempDir) -> ServerPoolConfig {
    ServerPoolConfig {
        min_class_process_count: 0,
        max_class_process_count: 4,
        max_process_count: 16,
        ipc_connect_timeout_secs: 1,
        ipc_comm_timeout_secs: 1,
        socket_prefix: tmp.path().join("sock").display().to_string(),
        shared_state_path: tmp.path().join("state.db").display().to_string(),
        ..Default::default()
    }
}

pub fn harness(tune: impl FnOnce(&mut ServerPoolConfig)) -> Harness {
    harness_with_store(tune, |_| Arc::new(MemoryStore::new()))
}

pub fn harness_with_store(
    tune: impl FnOnce(&mut ServerPoolConfig),
    store: impl FnOnce(&TempDir) -> Arc<dyn RegistryStore>,
) -> Harness {
    harness_with_config(
        |_, config| tune(&mut config.server),
        store,
    )
}

/// Full control over the configuration file, e.g. to declare directory scopes
pub fn harness_with_config(
    tune: impl FnOnce(&TempDir, &mut Config),
    store: impl FnOnce(&TempDir) -> Arc<dyn RegistryStore>,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let htdocs = tmp.path().join("htdocs");
    std::fs::create_dir_all(&htdocs).unwrap();
    let script = htdocs.join("app.fcgi");
    std::fs::write(&script, "#!/bin/sh\n").unwrap();

    let mut config = Config {
        server: test_config(&tmp),
        ..Default::default()
    };
    tune(&tmp, &mut config);
    let settings = Settings::from_config(config).unwrap();

    let launcher = Arc::new(FakeLauncher::new());
    let clock = Arc::new(ManualClock::default());
    let pool = WorkerPool::new(
        Arc::new(settings),
        store(&tmp),
        launcher.clone(),
        clock.clone(),
    );

    Harness {
        pool,
        launcher,
        clock,
        script,
        tmp,
    }
}
