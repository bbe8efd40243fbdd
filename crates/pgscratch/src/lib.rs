//! Throwaway PostgreSQL clusters for test suites.
//!
//! Provides everything a test needs to get an isolated database:
//! - A private cluster per test run (storage directory, `initdb`, server process)
//! - Scratch databases, optionally copied from a template
//! - Signal-escalating shutdown and storage cleanup
//! - Attachment to an externally managed server through `PGSCRATCH_HOST`
//!
//! ```no_run
//! # async fn demo() -> pgscratch::Result<()> {
//! let mut cluster = pgscratch::launch_from_env().await?;
//! let db = cluster.create_scratch_database(None).await?;
//! println!("connect with {}", db.conninfo());
//! cluster.shutdown().await
//! # }
//! ```

pub mod address;
pub mod cluster;
pub mod error;
pub mod guard;
pub mod runner;

mod catalog;
mod naming;
mod server;
mod template;

#[cfg(test)]
mod test_support;

pub use address::{ConnectionAddress, DEFAULT_PORT};
pub use cluster::{Cluster, ClusterState, Database};
pub use error::{Error, Result};
pub use guard::ClusterGuard;
pub use pgscratch_config::ScratchConfig;
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner};

/// Loads layered configuration and launches a guarded cluster.
///
/// With `PGSCRATCH_HOST` set the guard fronts that server; otherwise a
/// private server is initialized and started.
pub async fn launch_from_env() -> Result<ClusterGuard> {
    let config = ScratchConfig::load().map_err(|e| Error::Config(format!("{e:#}")))?;
    ClusterGuard::launch(config).await
}
