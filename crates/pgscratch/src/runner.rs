//! External command invocation.
//!
//! Every interaction with the PostgreSQL installation goes through a
//! [`CommandRunner`]: short-lived administrative tools are run to completion
//! with [`CommandRunner::run`], the server itself is launched with
//! [`CommandRunner::spawn`]. Only exit status and captured output come back;
//! interpreting them is the caller's job.

use crate::{Error, Result};
use pgscratch_config::{ScratchConfig, ServerConfig};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::future::Future;
use std::io;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// A single program invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Bare program name, e.g. `createdb`.
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[OsString] {
        &self.args
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(OsString::as_os_str)
    }

    /// Final positional argument.
    pub fn last_arg(&self) -> Option<&OsStr> {
        self.args.last().map(OsString::as_os_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Outcome of a completed invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into [`Error::Command`].
    pub fn into_checked(self, invocation: &Invocation) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::Command {
                command: invocation.to_string(),
                output: self.output,
            })
        }
    }
}

/// Runs PostgreSQL administrative programs.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs an invocation to completion.
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Launches a long-running invocation.
    fn spawn(&self, invocation: &Invocation) -> Result<Child>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    server: ServerConfig,
}

impl ProcessRunner {
    pub fn new(config: &ScratchConfig) -> Self {
        Self {
            server: config.server.clone(),
        }
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut command = Command::new(self.server.program(&invocation.program));
        command.args(&invocation.args).stdin(Stdio::null());
        for (key, value) in &invocation.envs {
            command.env(key, value);
        }
        command
    }
}

impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::debug!(command = %invocation, "running");

        let output = self
            .command(invocation)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| spawn_error(invocation, e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            code: output.status.code(),
            output: combined,
        })
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        tracing::debug!(command = %invocation, "spawning");

        self.command(invocation)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(invocation, e))
    }
}

fn spawn_error(invocation: &Invocation, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::BinaryNotFound {
            program: invocation.program.clone(),
        }
    } else {
        Error::Io(err)
    }
}
