//! Shared setup for engine-backed tests.
//!
//! These tests need a local PostgreSQL installation and a non-root user
//! (`postgres` refuses to run as root). When either is missing the test
//! prints a `SKIP-PG-CLUSTER:` marker and returns early.

#![allow(dead_code)]

use pgscratch::{Cluster, ClusterGuard, Database, Error, ScratchConfig};
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pgscratch=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Looks for a versioned Debian-style bin directory when `initdb` is not
/// on PATH.
fn discover_bin_dir() -> Option<PathBuf> {
    let on_path = std::env::var_os("PATH").is_some_and(|path| {
        std::env::split_paths(&path).any(|dir| dir.join("initdb").is_file())
    });
    if on_path {
        return None;
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir("/usr/lib/postgresql")
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path().join("bin")))
        .filter(|bin| bin.join("initdb").is_file())
        .collect();
    candidates.sort();
    candidates.pop()
}

/// Private-server configuration independent of the caller's environment.
pub fn test_config() -> ScratchConfig {
    let mut config = ScratchConfig::default();
    config.server.bin_dir = discover_bin_dir();
    config.timeouts.ready_ms = 30_000;
    config
}

fn skip(reason: impl std::fmt::Display) {
    eprintln!("SKIP-PG-CLUSTER: {reason}");
}

fn runs_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// An initialized, not yet started cluster, or `None` when the engine is
/// unavailable.
pub async fn initialized_cluster() -> Option<Cluster> {
    init_tracing();
    if runs_as_root() {
        skip("postgres cannot run as root");
        return None;
    }
    let mut cluster = Cluster::new(test_config());
    match cluster.initialize().await {
        Ok(()) => Some(cluster),
        Err(e @ Error::BinaryNotFound { .. }) => {
            skip(e);
            None
        }
        Err(e) => panic!("initialize failed: {e}"),
    }
}

/// A started cluster under a guard, or `None` when the engine is unavailable.
pub async fn running_guard() -> Option<ClusterGuard> {
    let cluster = initialized_cluster().await?;
    // Already initialized, so the guard only starts it. Storage is removed
    // on any failure.
    match ClusterGuard::launch_cluster(cluster).await {
        Ok(guard) => Some(guard),
        Err(e) => panic!("launch failed: {e}"),
    }
}

/// Opens a client connection, driving the connection on a background task.
pub async fn connect(conninfo: &str) -> (Client, tokio::task::JoinHandle<()>) {
    let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
        .await
        .unwrap_or_else(|e| panic!("connect to {conninfo} failed: {e}"));
    let handle = tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });
    (client, handle)
}

/// Closes `client` and waits for its connection task to finish.
pub async fn disconnect(client: Client, handle: tokio::task::JoinHandle<()>) {
    drop(client);
    let _ = handle.await;
}

const IDLE_ATTEMPTS: u32 = 50;
const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Drops `name`, retrying while the backend of a just closed connection is
/// still registered.
pub async fn drop_when_idle(cluster: &mut Cluster, name: &str) -> pgscratch::Result<()> {
    let mut attempts = 0;
    loop {
        match cluster.drop_database(name).await {
            Err(Error::DatabaseBusy(_)) if attempts < IDLE_ATTEMPTS => {
                attempts += 1;
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
            other => return other,
        }
    }
}

/// Copies `template` into `name`, retrying while the template still shows a
/// just closed connection.
pub async fn create_when_idle(
    cluster: &mut Cluster,
    name: &str,
    template: &str,
) -> pgscratch::Result<Database> {
    let mut attempts = 0;
    loop {
        match cluster.create_database(name, Some(template)).await {
            Err(Error::TemplateInUse(_)) if attempts < IDLE_ATTEMPTS => {
                attempts += 1;
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
            other => return other,
        }
    }
}
