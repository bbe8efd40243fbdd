//! Configuration management for pgscratch
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (PGSCRATCH_* prefix, highest precedence)
//! 2. pgscratch.local.toml (gitignored, local overrides)
//! 3. pgscratch.toml (git-tracked, project config)
//! 4. ~/.config/pgscratch/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! `PGSCRATCH_HOST` is the one variable most users touch: it points the
//! cluster at an already-running server instead of spawning a private one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main pgscratch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    /// Address of an externally managed server. When set, no private
    /// server is spawned.
    pub host: Option<String>,
    /// Leave storage directories on disk when a guard is dropped.
    pub keep_storage: bool,
    pub server: ServerConfig,
    pub timeouts: TimeoutConfig,
    pub databases: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding `initdb`, `postgres`, `createdb`, `dropdb` and
    /// `psql`. Resolved through `PATH` when unset.
    pub bin_dir: Option<PathBuf>,
    pub superuser: String,
    pub encoding: String,
    /// Parent directory for private storage directories.
    pub base_dir: Option<PathBuf>,
    pub log_min_messages: String,
    pub fsync: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            superuser: "postgres".to_string(),
            encoding: "utf-8".to_string(),
            base_dir: None,
            log_min_messages: "PANIC".to_string(),
            fsync: false,
        }
    }
}

impl ServerConfig {
    /// Resolve the full path of a PostgreSQL program.
    pub fn program(&self, name: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ready_ms: u64,
    pub probe_interval_ms: u64,
    pub stop_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready_ms: 10_000,
            probe_interval_ms: 50,
            stop_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Wait applied after each shutdown signal before escalating.
    pub fn stop(&self) -> Duration {
        Duration::from_millis(self.stop_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Prefix for generated scratch database names.
    pub prefix: String,
    /// Upper bound of template copies created ahead of demand.
    pub max_prepared: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            prefix: "test_db".to_string(),
            max_prepared: 1,
        }
    }
}

impl ScratchConfig {
    /// Load configuration from default locations
    pub fn load() -> anyhow::Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file, without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.superuser.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.superuser must not be empty".to_string(),
            ));
        }
        if self.databases.prefix.is_empty() {
            return Err(ConfigError::Validation(
                "databases.prefix must not be empty".to_string(),
            ));
        }
        let timeouts = &self.timeouts;
        if timeouts.ready_ms == 0 || timeouts.probe_interval_ms == 0 || timeouts.stop_ms == 0 {
            return Err(ConfigError::Validation(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                return Err(ConfigError::Validation("host must not be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        if let Some(dir) = &self.server.bin_dir {
            if dir.is_relative() {
                self.server.bin_dir = Some(base.join(dir));
            }
        }

        if let Some(dir) = &self.server.base_dir {
            if dir.is_relative() {
                self.server.base_dir = Some(base.join(dir));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ScratchConfig::default();
        assert!(config.host.is_none());
        assert!(!config.keep_storage);
        assert_eq!(config.server.superuser, "postgres");
        assert_eq!(config.server.log_min_messages, "PANIC");
        assert!(!config.server.fsync);
        assert_eq!(config.timeouts.ready(), Duration::from_secs(10));
        assert_eq!(config.timeouts.probe_interval(), Duration::from_millis(50));
        assert_eq!(config.databases.prefix, "test_db");
        assert_eq!(config.databases.max_prepared, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_program_resolution() {
        let mut config = ScratchConfig::default();
        assert_eq!(config.server.program("initdb"), PathBuf::from("initdb"));

        config.server.bin_dir = Some(PathBuf::from("/usr/lib/postgresql/16/bin"));
        assert_eq!(
            config.server.program("initdb"),
            PathBuf::from("/usr/lib/postgresql/16/bin/initdb")
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ScratchConfig::default();
        config.timeouts.stop_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = ScratchConfig::default();
        config.databases.prefix.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = ScratchConfig::default();
        config.server.superuser = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = ScratchConfig::default();
        config.host = Some(String::new());
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_path_resolution() {
        let mut config = ScratchConfig::default();
        config.server.bin_dir = Some(PathBuf::from("pg/bin"));
        config.server.base_dir = Some(PathBuf::from("/var/tmp/scratch"));
        config.resolve_paths("/home/user/project");

        assert_eq!(
            config.server.bin_dir,
            Some(PathBuf::from("/home/user/project/pg/bin"))
        );
        assert_eq!(
            config.server.base_dir,
            Some(PathBuf::from("/var/tmp/scratch"))
        );
    }

    #[test]
    fn test_from_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("scratch.toml");
        fs::write(
            &path,
            r#"
host = "/var/run/postgresql"

[databases]
prefix = "it_db"
"#,
        )
        .expect("Failed to write config");

        let config = ScratchConfig::from_file(&path).expect("Failed to parse config");
        assert_eq!(config.host.as_deref(), Some("/var/run/postgresql"));
        assert_eq!(config.databases.prefix, "it_db");
        assert_eq!(config.databases.max_prepared, 1);
    }

    #[test]
    fn test_from_file_errors() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let missing = temp_dir.path().join("missing.toml");
        assert!(matches!(
            ScratchConfig::from_file(&missing),
            Err(ConfigError::ReadError { .. })
        ));

        let broken = temp_dir.path().join("broken.toml");
        fs::write(&broken, "[server\nsuperuser = ").expect("Failed to write config");
        assert!(matches!(
            ScratchConfig::from_file(&broken),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
