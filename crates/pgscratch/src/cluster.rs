//! Cluster lifecycle controller.
//!
//! A [`Cluster`] either owns a private server (storage directory plus
//! `postgres` process) or fronts an externally managed one named by
//! `PGSCRATCH_HOST`. Lifecycle calls must follow
//!
//! ```text
//! Uninitialized -> Initialized -> Running <-> Stopped -> CleanedUp
//! ```
//!
//! and a call made out of order fails with [`Error::InvalidState`] without
//! side effects. Against an external server the cluster is always `Running`
//! and `initialize`, `start`, `stop` are no-ops.

use crate::catalog::{self, AdminTarget};
use crate::naming::NameAllocator;
use crate::runner::{CommandRunner, Invocation, ProcessRunner};
use crate::server::ServerProcess;
use crate::template::PreparedCopies;
use crate::{ConnectionAddress, Error, Result};
use pgscratch_config::ScratchConfig;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// No storage directory yet.
    Uninitialized,

    /// Storage directory populated, server never started.
    Initialized,

    /// Server is accepting connections.
    Running,

    /// Server stopped; storage directory retained.
    Stopped,

    /// Storage directory removed.
    CleanedUp,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::CleanedUp => "cleaned up",
        };
        f.write_str(name)
    }
}

/// A database created within a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    name: String,
    source_template: Option<String>,
    address: ConnectionAddress,
    user: String,
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database this one was copied from, if any.
    pub fn source_template(&self) -> Option<&str> {
        self.source_template.as_deref()
    }

    pub fn address(&self) -> &ConnectionAddress {
        &self.address
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// libpq connection string for this database.
    pub fn conninfo(&self) -> String {
        self.address.conninfo(&self.user, &self.name)
    }
}

#[derive(Debug)]
enum Backend {
    Managed {
        storage: Option<PathBuf>,
        server: Option<ServerProcess>,
    },
    External {
        address: ConnectionAddress,
    },
}

/// Supervises one PostgreSQL cluster for a test run.
pub struct Cluster<R: CommandRunner = ProcessRunner> {
    config: ScratchConfig,
    runner: Arc<R>,
    backend: Backend,
    state: ClusterState,
    names: NameAllocator,
    prepared: PreparedCopies,
}

impl Cluster<ProcessRunner> {
    /// Creates a cluster that will own a private server.
    pub fn new(config: ScratchConfig) -> Self {
        let runner = ProcessRunner::new(&config);
        Self::with_runner(config, runner)
    }

    /// Attaches to an already running server at `address`.
    pub async fn connect(config: ScratchConfig, address: ConnectionAddress) -> Result<Self> {
        let runner = ProcessRunner::new(&config);
        Self::connect_with_runner(config, address, runner).await
    }

    /// Private cluster, or external one when `config.host` is set.
    pub async fn from_config(config: ScratchConfig) -> Result<Self> {
        let runner = ProcessRunner::new(&config);
        Self::from_config_with_runner(config, runner).await
    }

    /// Loads layered configuration (honouring `PGSCRATCH_HOST`) and builds
    /// the matching cluster.
    pub async fn from_env() -> Result<Self> {
        let config = ScratchConfig::load().map_err(|e| Error::Config(format!("{e:#}")))?;
        Self::from_config(config).await
    }
}

impl<R: CommandRunner> Cluster<R> {
    pub fn with_runner(config: ScratchConfig, runner: R) -> Self {
        Self {
            names: NameAllocator::new(config.databases.prefix.clone()),
            prepared: PreparedCopies::new(config.databases.max_prepared),
            config,
            runner: Arc::new(runner),
            backend: Backend::Managed {
                storage: None,
                server: None,
            },
            state: ClusterState::Uninitialized,
        }
    }

    pub async fn from_config_with_runner(config: ScratchConfig, runner: R) -> Result<Self> {
        match config.host.clone() {
            Some(host) => {
                let address = host.parse()?;
                Self::connect_with_runner(config, address, runner).await
            }
            None => {
                config.validate()?;
                Ok(Self::with_runner(config, runner))
            }
        }
    }

    pub async fn connect_with_runner(
        config: ScratchConfig,
        address: ConnectionAddress,
        runner: R,
    ) -> Result<Self> {
        config.validate()?;
        let mut cluster = Self::with_runner(config, runner);
        let target = AdminTarget::new(address.clone(), cluster.config.server.superuser.clone());

        let existing = catalog::list_databases(cluster.runner.as_ref(), &target).await?;
        cluster.names = NameAllocator::new(cluster.config.databases.prefix.clone())
            .with_existing(existing);
        tracing::info!(%address, "attached to external cluster");

        cluster.backend = Backend::External { address };
        cluster.state = ClusterState::Running;
        Ok(cluster)
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn config(&self) -> &ScratchConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn is_external(&self) -> bool {
        matches!(self.backend, Backend::External { .. })
    }

    /// Storage directory, present between `initialize` and `cleanup`.
    pub fn storage_directory(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Managed { storage, .. } => storage.as_deref(),
            Backend::External { .. } => None,
        }
    }

    /// Address of the server, only while it runs.
    pub fn connection_address(&self) -> Option<ConnectionAddress> {
        if self.state != ClusterState::Running {
            return None;
        }
        match &self.backend {
            Backend::Managed { storage, .. } => storage.clone().map(ConnectionAddress::Socket),
            Backend::External { address } => Some(address.clone()),
        }
    }

    fn target(&self) -> Option<AdminTarget> {
        self.connection_address()
            .map(|address| AdminTarget::new(address, self.config.server.superuser.clone()))
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state,
        }
    }

    /// Checks the cluster is running and returns the admin target. A managed
    /// server that died behind our back moves the cluster to `Stopped`.
    fn require_running(&mut self, operation: &'static str) -> Result<AdminTarget> {
        if let Backend::Managed { server, .. } = &mut self.backend {
            if let Some(process) = server {
                if !process.is_alive() {
                    tracing::warn!(pid = ?process.pid(), "server exited unexpectedly");
                    *server = None;
                    self.state = ClusterState::Stopped;
                }
            }
        }
        self.target().ok_or_else(|| self.invalid(operation))
    }

    /// Allocates a private storage directory and runs `initdb` in it.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.is_external() {
            tracing::debug!("external cluster, skipping initialize");
            return Ok(());
        }
        if !matches!(
            self.state,
            ClusterState::Uninitialized | ClusterState::CleanedUp
        ) {
            return Err(self.invalid("initialize"));
        }

        let base = self
            .config
            .server
            .base_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let dir = tempfile::Builder::new()
            .prefix("pgscratch-")
            .tempdir_in(&base)
            .map_err(|e| Error::Initialization {
                path: base.clone(),
                reason: e.to_string(),
            })?
            .keep();

        let invocation = Invocation::new("initdb")
            .arg("-E")
            .arg(&self.config.server.encoding)
            .arg("-D")
            .arg(&dir)
            .args(["-A", "trust"])
            .arg("-U")
            .arg(&self.config.server.superuser)
            .env("PGOPTIONS", "-F");

        let outcome = self.runner.run(&invocation).await;
        let failure = match outcome {
            Ok(output) if output.success() => None,
            Ok(output) => Some(Error::Initialization {
                path: dir.clone(),
                reason: output.output.trim().to_string(),
            }),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(path = %dir.display(), error = %e, "failed to remove partial storage");
            }
            return Err(err);
        }

        tracing::info!(storage = %dir.display(), "cluster initialized");
        if let Backend::Managed { storage, .. } = &mut self.backend {
            *storage = Some(dir);
        }
        self.state = ClusterState::Initialized;
        Ok(())
    }

    /// Launches the server against the storage directory.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_external() {
            tracing::debug!("external cluster, skipping start");
            return Ok(());
        }
        if !matches!(
            self.state,
            ClusterState::Initialized | ClusterState::Stopped
        ) {
            return Err(self.invalid("start"));
        }
        let Backend::Managed {
            storage: Some(dir),
            server,
        } = &mut self.backend
        else {
            return Err(self.invalid("start"));
        };

        let target = AdminTarget::new(
            ConnectionAddress::Socket(dir.clone()),
            self.config.server.superuser.clone(),
        );
        let process = ServerProcess::launch(self.runner.as_ref(), &self.config, dir, &target).await?;
        *server = Some(process);
        self.state = ClusterState::Running;
        Ok(())
    }

    /// Shuts the server down, escalating signals until it exits.
    pub async fn stop(&mut self) -> Result<()> {
        if self.is_external() {
            tracing::debug!("external cluster, skipping stop");
            return Ok(());
        }
        if self.state != ClusterState::Running {
            return Err(self.invalid("stop"));
        }
        self.prepared.settle().await;

        let grace = self.config.timeouts.stop();
        let Backend::Managed { server, .. } = &mut self.backend else {
            return Err(self.invalid("stop"));
        };
        let Some(process) = server.take() else {
            // Died on its own; nothing left to signal.
            self.state = ClusterState::Stopped;
            return Ok(());
        };

        match process.shutdown(grace).await {
            Ok(()) => {
                self.state = ClusterState::Stopped;
                Ok(())
            }
            Err((process, err)) => {
                *server = Some(process);
                Err(err)
            }
        }
    }

    /// Creates `name`, copying `template` when given.
    pub async fn create_database(&mut self, name: &str, template: Option<&str>) -> Result<Database> {
        let target = self.require_running("create database")?;
        if template.is_some() {
            self.prepared.settle().await;
        }

        let invocation = target.createdb(name, template);
        let output = self.runner.run(&invocation).await?;
        if !output.success() {
            if let Some(template) = template {
                if catalog::connection_count(self.runner.as_ref(), &target, template).await? > 0 {
                    return Err(Error::TemplateInUse(template.to_string()));
                }
            }
            return Err(Error::Create {
                name: name.to_string(),
                reason: output.output.trim().to_string(),
            });
        }

        tracing::info!(database = %name, template = ?template, "database created");
        Ok(self.database(&target, name.to_string(), template))
    }

    fn database(&self, target: &AdminTarget, name: String, template: Option<&str>) -> Database {
        Database {
            name,
            source_template: template.map(ToString::to_string),
            address: target.address.clone(),
            user: target.user.clone(),
        }
    }

    /// Creates a database with a generated `<prefix><n>` name.
    ///
    /// Templated requests are served from prepared copies when one is
    /// ready, and top the prepared list back up in the background.
    pub async fn create_scratch_database(&mut self, template: Option<&str>) -> Result<Database> {
        let target = self.require_running("create database")?;

        if let Some(template) = template {
            let mut ready = self.prepared.take(template);
            if ready.is_none() {
                self.prepared.settle().await;
                ready = self.prepared.take(template);
            }
            if let Some(name) = ready {
                tracing::debug!(database = %name, template, "using prepared copy");
                self.prepare_next(&target, template).await?;
                return Ok(self.database(&target, name, Some(template)));
            }
        }

        let name = self.allocate_name(&target).await?;
        let database = self.create_database(&name, template).await?;
        if let Some(template) = template {
            self.prepare_next(&target, template).await?;
        }
        Ok(database)
    }

    async fn prepare_next(&mut self, target: &AdminTarget, template: &str) -> Result<()> {
        if !self.prepared.wants_more(template) {
            return Ok(());
        }
        let name = self.allocate_name(target).await?;
        self.prepared
            .spawn(Arc::clone(&self.runner), target.clone(), template, name);
        Ok(())
    }

    async fn allocate_name(&mut self, target: &AdminTarget) -> Result<String> {
        let allocated = self.names.next();
        if allocated.stale {
            tracing::info!(database = %allocated.name, "dropping leftover from a previous run");
            match self.drop_one(target, &allocated.name).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(allocated.name)
    }

    /// Drops `name`. Unused prepared copies of `name` go with it.
    pub async fn drop_database(&mut self, name: &str) -> Result<()> {
        let target = self.require_running("drop database")?;

        // An in-flight copy holds a connection to the template.
        let is_template = self.prepared.is_template(name);
        if is_template {
            self.prepared.settle().await;
        }

        self.drop_one(&target, name).await?;
        self.names.forget(name);

        if is_template {
            for copy in self.prepared.remove_template(name) {
                self.drop_one(&target, &copy).await?;
                self.names.forget(&copy);
            }
        }
        tracing::info!(database = %name, "database dropped");
        Ok(())
    }

    async fn drop_one(&self, target: &AdminTarget, name: &str) -> Result<()> {
        let invocation = target.dropdb(name);
        let output = self.runner.run(&invocation).await?;
        if output.success() {
            return Ok(());
        }

        let runner = self.runner.as_ref();
        if !catalog::database_exists(runner, target, name).await? {
            return Err(Error::NotFound(name.to_string()));
        }
        if catalog::connection_count(runner, target, name).await? > 0 {
            return Err(Error::DatabaseBusy(name.to_string()));
        }
        output.into_checked(&invocation).map(|_| ())
    }

    /// Names of every database in the catalog.
    pub async fn list_databases(&mut self) -> Result<Vec<String>> {
        let target = self.require_running("list databases")?;
        catalog::list_databases(self.runner.as_ref(), &target).await
    }

    /// Number of open connections to `name`.
    pub async fn connection_count(&mut self, name: &str) -> Result<u64> {
        let target = self.require_running("count connections")?;
        catalog::connection_count(self.runner.as_ref(), &target, name).await
    }

    /// Drops every database carrying the scratch prefix, including
    /// prepared copies. Returns the dropped names.
    pub async fn sweep_scratch_databases(&mut self) -> Result<Vec<String>> {
        let target = self.require_running("sweep databases")?;
        self.prepared.settle().await;
        self.prepared.drain();

        let mut dropped = Vec::new();
        for name in catalog::list_databases(self.runner.as_ref(), &target).await? {
            if self.names.owns(&name) {
                self.drop_one(&target, &name).await?;
                self.names.forget(&name);
                dropped.push(name);
            }
        }
        tracing::info!(count = dropped.len(), "swept scratch databases");
        Ok(dropped)
    }

    /// Removes the storage directory.
    ///
    /// Against an external server this only drops unused prepared copies.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.prepared.settle().await;

        if let Backend::External { address } = &self.backend {
            let target = AdminTarget::new(address.clone(), self.config.server.superuser.clone());
            for copy in self.prepared.drain() {
                self.drop_one(&target, &copy).await?;
            }
            return Ok(());
        }

        if !matches!(
            self.state,
            ClusterState::Initialized | ClusterState::Stopped
        ) {
            return Err(self.invalid("clean up"));
        }
        self.prepared.drain();

        let Backend::Managed { storage, .. } = &mut self.backend else {
            return Err(self.invalid("clean up"));
        };
        if let Some(dir) = storage.as_ref() {
            std::fs::remove_dir_all(dir).map_err(|source| Error::Cleanup {
                path: dir.clone(),
                source,
            })?;
            tracing::info!(storage = %dir.display(), "storage removed");
        }
        *storage = None;
        self.state = ClusterState::CleanedUp;
        Ok(())
    }

    /// Synchronous best-effort teardown for drop paths: kills the server and,
    /// unless `keep_storage`, removes the storage directory.
    pub(crate) fn teardown_blocking(&mut self, keep_storage: bool) {
        self.prepared.abort();

        match &mut self.backend {
            Backend::External { address } => {
                let leftover = self.prepared.drain();
                if !leftover.is_empty() {
                    tracing::warn!(%address, databases = ?leftover, "prepared copies left behind");
                }
            }
            Backend::Managed { storage, server } => {
                if let Some(mut process) = server.take() {
                    tracing::warn!(pid = ?process.pid(), "killing server during teardown");
                    process.kill_now();
                    if !process.reap_blocking(Duration::from_secs(5)) {
                        tracing::warn!(pid = ?process.pid(), "server did not exit after SIGKILL");
                    }
                    self.state = ClusterState::Stopped;
                }
                if keep_storage {
                    if let Some(dir) = storage.as_ref() {
                        tracing::info!(storage = %dir.display(), "keeping storage directory");
                    }
                    return;
                }
                if let Some(dir) = storage.take() {
                    if let Err(e) = std::fs::remove_dir_all(&dir) {
                        tracing::warn!(storage = %dir.display(), error = %e, "failed to remove storage");
                    }
                    self.state = ClusterState::CleanedUp;
                }
            }
        }
    }
}

impl<R: CommandRunner> fmt::Debug for Cluster<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
