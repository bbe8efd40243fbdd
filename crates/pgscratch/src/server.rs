//! Server process supervision.

use crate::catalog::AdminTarget;
use crate::runner::{CommandRunner, Invocation};
use crate::{Error, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use pgscratch_config::ScratchConfig;
use std::path::Path;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::{Instant, sleep, timeout};

/// Query used to decide whether the server accepts connections.
pub(crate) const READY_PROBE: &str = "SELECT 'ready';";

/// Shutdown signals in order of increasing force: fast shutdown, immediate
/// shutdown, then kill.
const SHUTDOWN_LADDER: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGKILL];

/// A running `postgres` process bound to one storage directory.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
}

impl ServerProcess {
    /// Launches the server and waits until it answers queries.
    ///
    /// The socket lives inside `storage` and TCP listening is disabled, so
    /// concurrent clusters never contend for an address. On any failure the
    /// process is killed before the error is returned.
    pub async fn launch<R: CommandRunner>(
        runner: &R,
        config: &ScratchConfig,
        storage: &Path,
        target: &AdminTarget,
    ) -> Result<Self> {
        let mut invocation = Invocation::new("postgres")
            .arg("-D")
            .arg(storage)
            .arg("-k")
            .arg(storage)
            .arg("-p")
            .arg(target.address.port().to_string())
            .args(["-h", ""])
            .arg(format!(
                "--log_min_messages={}",
                config.server.log_min_messages
            ));
        if !config.server.fsync {
            invocation = invocation.arg("-F");
        }

        let child = runner.spawn(&invocation).map_err(|e| match e {
            err @ Error::BinaryNotFound { .. } => err,
            other => Error::Start(format!("could not launch postgres: {other}")),
        })?;
        let mut server = Self { child };

        if let Err(e) = server.wait_ready(runner, config, target).await {
            server.kill_now();
            let _ = server.child.wait().await;
            return Err(e);
        }

        tracing::info!(
            pid = server.pid().map(Pid::as_raw),
            storage = %storage.display(),
            "server ready"
        );
        Ok(server)
    }

    async fn wait_ready<R: CommandRunner>(
        &mut self,
        runner: &R,
        config: &ScratchConfig,
        target: &AdminTarget,
    ) -> Result<()> {
        let deadline = Instant::now() + config.timeouts.ready();
        let probe = target.psql(READY_PROBE);

        loop {
            sleep(config.timeouts.probe_interval()).await;

            if let Some(status) = self.child.try_wait()? {
                return Err(Error::Start(format!("postgres exited unexpectedly ({status})")));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(output) = timeout(remaining, runner.run(&probe)).await else {
                return Err(Error::Start(format!(
                    "timed out after {:?} waiting for postgres: readiness probe did not answer",
                    config.timeouts.ready()
                )));
            };
            let output = output?;
            if output.success() && output.output.contains("ready") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Start(format!(
                    "timed out after {:?} waiting for postgres: {}",
                    config.timeouts.ready(),
                    output.output.trim()
                )));
            }
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.child.id().map(|id| Pid::from_raw(id as i32))
    }

    /// Checks if the server process is alive.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stops the server, escalating through [`SHUTDOWN_LADDER`] and waiting
    /// up to `grace` after each signal.
    ///
    /// On failure the process handle is returned with the error so the
    /// caller can keep tracking a server that is still alive.
    pub async fn shutdown(mut self, grace: Duration) -> std::result::Result<(), (Self, Error)> {
        for sig in SHUTDOWN_LADDER {
            let Some(pid) = self.pid() else {
                // Already reaped.
                return Ok(());
            };
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return Ok(());
            }

            if sig != Signal::SIGINT {
                tracing::warn!(pid = pid.as_raw(), signal = %sig, "escalating server shutdown");
            }
            if let Err(errno) = signal::kill(pid, sig) {
                if errno == nix::errno::Errno::ESRCH {
                    let _ = self.child.wait().await;
                    return Ok(());
                }
                let err = Error::Stop(format!("failed to send {sig} to {pid}: {errno}"));
                return Err((self, err));
            }

            match timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(pid = pid.as_raw(), %status, "server stopped");
                    return Ok(());
                }
                Ok(Err(e)) => return Err((self, Error::Io(e))),
                Err(_) => continue,
            }
        }

        let pid = self.pid().map_or(-1, Pid::as_raw);
        Err((
            self,
            Error::Stop(format!("process {pid} still alive after SIGKILL")),
        ))
    }

    /// Sends SIGKILL without waiting. Used on teardown paths that cannot
    /// await.
    pub fn kill_now(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "kill on already exited server");
        }
    }

    /// Polls for exit for at most `limit` without an async context.
    pub(crate) fn reap_blocking(&mut self, limit: Duration) -> bool {
        let deadline = std::time::Instant::now() + limit;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) | Err(_) => return true,
                Ok(None) if std::time::Instant::now() >= deadline => return false,
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }
}
