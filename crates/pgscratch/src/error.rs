//! Error types for cluster management.

use crate::ClusterState;
use std::path::PathBuf;
use thiserror::Error;

/// Cluster management errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage directory could not be allocated or `initdb` failed.
    #[error("Failed to initialize storage at {path}: {reason}")]
    Initialization { path: PathBuf, reason: String },

    /// Server could not be launched or never became ready.
    #[error("Server failed to start: {0}")]
    Start(String),

    /// Server survived every shutdown signal.
    #[error("Server failed to stop: {0}")]
    Stop(String),

    /// Database name collision or engine rejection.
    #[error("Failed to create database {name}: {reason}")]
    Create { name: String, reason: String },

    /// Database does not exist.
    #[error("Database {0} does not exist")]
    NotFound(String),

    /// Database has open connections and cannot be dropped.
    #[error("Database {0} is being accessed by other connections")]
    DatabaseBusy(String),

    /// Template has open connections and cannot be copied.
    #[error("Template database {0} is being accessed by other connections")]
    TemplateInUse(String),

    /// Storage directory could not be removed.
    #[error("Failed to remove storage directory {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Operation called outside its legal state.
    #[error("Cannot {operation} while cluster is {state}")]
    InvalidState {
        operation: &'static str,
        state: ClusterState,
    },

    /// PostgreSQL program is not installed or not on the search path.
    #[error(
        "Could not find the PostgreSQL binary {program}. Add the PostgreSQL bin \
         directory (e.g. /usr/lib/postgresql/16/bin) to PATH or set server.bin_dir"
    )]
    BinaryNotFound { program: String },

    /// An administrative probe exited non-zero.
    #[error("Command `{command}` failed:\n{output}")]
    Command { command: String, output: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<pgscratch_config::ConfigError> for Error {
    fn from(err: pgscratch_config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
