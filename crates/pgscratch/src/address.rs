//! Server addressing.

use crate::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default PostgreSQL port. Also names the socket file inside a socket
/// directory (`.s.PGSQL.5432`).
pub const DEFAULT_PORT: u16 = 5432;

/// Where a server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionAddress {
    /// Unix socket directory.
    Socket(PathBuf),

    /// Network host and port.
    Tcp { host: String, port: u16 },
}

impl ConnectionAddress {
    /// Value for libpq's `host` parameter (`-h` on the command line tools).
    pub fn host(&self) -> String {
        match self {
            Self::Socket(dir) => dir.display().to_string(),
            Self::Tcp { host, .. } => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Socket(_) => DEFAULT_PORT,
            Self::Tcp { port, .. } => *port,
        }
    }

    /// Socket directory, if this is a local socket address.
    pub fn socket_dir(&self) -> Option<&Path> {
        match self {
            Self::Socket(dir) => Some(dir),
            Self::Tcp { .. } => None,
        }
    }

    /// libpq keyword/value connection string.
    pub fn conninfo(&self, user: &str, dbname: &str) -> String {
        format!(
            "host={} port={} user={} dbname={}",
            quote_conninfo(&self.host()),
            self.port(),
            quote_conninfo(user),
            quote_conninfo(dbname)
        )
    }
}

impl FromStr for ConnectionAddress {
    type Err = Error;

    /// Accepts `/socket/dir`, `host` or `host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty server address".to_string()));
        }
        if s.starts_with('/') {
            return Ok(Self::Socket(PathBuf::from(s)));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid port in address {s:?}")))?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            Some(_) => Err(Error::Config(format!("missing host in address {s:?}"))),
            None => Ok(Self::Tcp {
                host: s.to_string(),
                port: DEFAULT_PORT,
            }),
        }
    }
}

impl fmt::Display for ConnectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(dir) => write!(f, "{}", dir.display()),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

fn quote_conninfo(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
