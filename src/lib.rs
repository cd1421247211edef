//! fcgid-pool - process pool manager for FastCGI workers
//!
//! This library decides which worker process serves a request and when workers
//! live or die:
//! - Resolves a request's executable (directly or through a wrapper) to a process class
//! - Tracks workers in a registry that can be shared between server processes
//! - Reuses idle workers, spawns on demand and ahead of demand, within class and global limits
//! - Applies connect and communication timeouts to every worker channel
//! - Evicts idle workers, kills hung ones, backs off broken classes and reaps exited ones

pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod pool;
pub mod process;
pub mod registry;
pub mod scanner;
pub mod scoring;
pub mod store;
pub mod wrapper;

pub use error::{ErrorCode, PoolError};
pub use pool::{WorkerLease, WorkerPool};
pub use registry::{Outcome, WorkerState};

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
