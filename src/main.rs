use fcgid_pool::auth::AuthKind;
use fcgid_pool::clock::SystemClock;
use fcgid_pool::config::Settings;
use fcgid_pool::db::SqliteStore;
use fcgid_pool::pool::WorkerPool;
use fcgid_pool::process::OsLauncher;
use fcgid_pool::scanner::Scanner;
use fcgid_pool::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const USAGE: &str = "usage: fcgid-pool [run] [CONFIG]\n       fcgid-pool check CONFIG\n       fcgid-pool resolve CONFIG HOST SCRIPT";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fcgid_pool=debug".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("check") => {
            let path = args.get(1).map(PathBuf::from).ok_or_else(|| anyhow::anyhow!(USAGE))?;
            check(&path)
        }
        Some("resolve") => match (args.get(1), args.get(2), args.get(3)) {
            (Some(path), Some(host), Some(script)) => resolve(Path::new(path), host, Path::new(script)),
            _ => anyhow::bail!(USAGE),
        },
        Some("run") => run(&config_path(args.get(1).map(String::as_str))).await,
        Some("-h") | Some("--help") => {
            println!("{} {}\n{}", PKG_NAME, VERSION, USAGE);
            Ok(())
        }
        other => run(&config_path(other)).await,
    }
}

fn config_path(arg: Option<&str>) -> PathBuf {
    arg.map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn load(path: &Path) -> anyhow::Result<Settings> {
    Settings::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })
}

/// Validate a configuration file, including wrapper and auth executables
fn check(path: &Path) -> anyhow::Result<()> {
    load(path)?;
    println!("{}: configuration OK", path.display());
    Ok(())
}

/// Print the wrapper, class and auth resolution for one request as JSON
fn resolve(path: &Path, host: &str, script: &Path) -> anyhow::Result<()> {
    let settings = Arc::new(load(path)?);
    let store = Arc::new(fcgid_pool::store::MemoryStore::new());
    let pool = WorkerPool::new(
        Arc::clone(&settings),
        store,
        Arc::new(OsLauncher::new()),
        Arc::new(SystemClock),
    );

    let spec = pool.resolve_class(host, script)?;
    let directory = settings.directory(script);
    let auth: serde_json::Map<String, serde_json::Value> = AuthKind::ALL
        .iter()
        .map(|kind| -> anyhow::Result<(String, serde_json::Value)> {
            let value = directory
                .resolve_auth(*kind)
                .map(serde_json::to_value)
                .transpose()?
                .unwrap_or(serde_json::Value::Null);
            Ok((kind.to_string(), value))
        })
        .collect::<anyhow::Result<_>>()?;

    let output = serde_json::json!({
        "host": host,
        "script": script,
        "class": spec.key().to_string(),
        "identity": spec.identity,
        "launch_args": spec.launch_args,
        "scope": directory.path,
        "auth": auth,
        "config": spec.config.as_ref(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let settings = Arc::new(load(config_path)?);
    info!(path = %config_path.display(), "Configuration loaded");

    let server = settings.main_server();
    info!(
        version = VERSION,
        max_processes = server.max_process_count,
        max_class_processes = server.max_class_process_count,
        min_class_processes = server.min_class_process_count,
        socket_prefix = %server.socket_prefix,
        "{} starting",
        PKG_NAME
    );

    let store = Arc::new(SqliteStore::open(&server.shared_state_path)?);
    std::fs::create_dir_all(&server.socket_prefix)?;

    let pool = WorkerPool::new(
        Arc::clone(&settings),
        store,
        Arc::new(OsLauncher::new()),
        Arc::new(SystemClock),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scanner_handle = tokio::spawn(Scanner::new(pool.clone()).run(shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP logs pool status
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    match pool.status() {
                        Ok(status) => info!(
                            live = status.live,
                            status = %serde_json::to_string(&status)?,
                            "Pool status"
                        ),
                        Err(e) => error!(error = %e, "Failed to read pool status"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all workers...");
    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Worker shutdown incomplete");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), scanner_handle).await;
    info!("Shutdown complete");
    Ok(())
}
