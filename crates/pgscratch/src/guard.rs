//! Scoped cluster ownership.

use crate::runner::{CommandRunner, ProcessRunner};
use crate::{Cluster, ClusterState, Result};
use pgscratch_config::ScratchConfig;
use std::ops::{Deref, DerefMut};

/// A started cluster that is torn down when it goes out of scope.
///
/// Prefer [`ClusterGuard::shutdown`], which stops the server gracefully and
/// reports errors. If the guard is dropped instead (a panicking test, an
/// early `?` return) the server is killed and the storage directory removed
/// synchronously, unless `keep_storage` is configured.
pub struct ClusterGuard<R: CommandRunner = ProcessRunner> {
    cluster: Cluster<R>,
    keep_storage: bool,
    released: bool,
}

impl ClusterGuard<ProcessRunner> {
    /// Builds a cluster from `config` (private, or external when
    /// `config.host` is set), then initializes and starts it.
    pub async fn launch(config: ScratchConfig) -> Result<Self> {
        Self::launch_cluster(Cluster::from_config(config).await?).await
    }
}

impl<R: CommandRunner> ClusterGuard<R> {
    /// Initializes and starts `cluster`. A cluster that is already
    /// initialized is only started. A failure part way through still
    /// releases whatever was already allocated.
    pub async fn launch_cluster(cluster: Cluster<R>) -> Result<Self> {
        let keep_storage = cluster.config().keep_storage;
        let mut guard = Self {
            cluster,
            keep_storage,
            released: false,
        };
        if guard.cluster.state() != ClusterState::Initialized {
            guard.cluster.initialize().await?;
        }
        guard.cluster.start().await?;
        Ok(guard)
    }

    /// Stops the server and removes the storage directory.
    pub async fn shutdown(mut self) -> Result<()> {
        let cluster = &mut self.cluster;
        if cluster.is_external() {
            cluster.cleanup().await?;
        } else {
            if cluster.state() == ClusterState::Running {
                cluster.stop().await?;
            }
            if self.keep_storage {
                if let Some(dir) = cluster.storage_directory() {
                    tracing::info!(storage = %dir.display(), "keeping storage directory");
                }
            } else if matches!(
                cluster.state(),
                ClusterState::Initialized | ClusterState::Stopped
            ) {
                cluster.cleanup().await?;
            }
        }
        self.released = true;
        Ok(())
    }
}

impl<R: CommandRunner> Deref for ClusterGuard<R> {
    type Target = Cluster<R>;

    fn deref(&self) -> &Self::Target {
        &self.cluster
    }
}

impl<R: CommandRunner> DerefMut for ClusterGuard<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cluster
    }
}

impl<R: CommandRunner> Drop for ClusterGuard<R> {
    fn drop(&mut self) {
        if !self.released {
            self.cluster.teardown_blocking(self.keep_storage);
        }
    }
}
