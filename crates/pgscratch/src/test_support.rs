//! Scripted stand-in for a PostgreSQL installation.
//!
//! Keeps an in-memory catalog and answers the administrative commands the
//! cluster issues. The "server" is a real `sh` process so supervision code
//! runs against an actual child.

use crate::runner::{CommandOutput, CommandRunner, Invocation};
use crate::server::READY_PROBE;
use crate::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};

#[derive(Debug)]
struct Catalog {
    databases: BTreeSet<String>,
    connections: HashMap<String, u64>,
    calls: Vec<Invocation>,
    failing: HashMap<String, String>,
    server_script: String,
    ready: bool,
    probe_delay: Option<Duration>,
}

#[derive(Debug)]
pub(crate) struct ScriptedRunner {
    inner: Mutex<Catalog>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        let databases = ["postgres", "template0", "template1"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            inner: Mutex::new(Catalog {
                databases,
                connections: HashMap::new(),
                calls: Vec::new(),
                failing: HashMap::new(),
                server_script: "exec sleep 30".to_string(),
                ready: true,
                probe_delay: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Catalog> {
        self.inner.lock().unwrap()
    }

    pub fn add_database(&self, name: &str) {
        self.lock().databases.insert(name.to_string());
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.lock().databases.contains(name)
    }

    pub fn open_connection(&self, name: &str) {
        *self.lock().connections.entry(name.to_string()).or_default() += 1;
    }

    pub fn close_connection(&self, name: &str) {
        if let Some(count) = self.lock().connections.get_mut(name) {
            *count = count.saturating_sub(1);
        }
    }

    /// Makes every future run of `program` exit 1 with `message`.
    pub fn fail(&self, program: &str, message: &str) {
        self.lock()
            .failing
            .insert(program.to_string(), message.to_string());
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Makes each readiness probe stall for `delay` before answering.
    pub fn set_probe_delay(&self, delay: Duration) {
        self.lock().probe_delay = Some(delay);
    }

    pub fn set_server_script(&self, script: &str) {
        self.lock().server_script = script.to_string();
    }

    pub fn calls_to(&self, program: &str) -> Vec<Invocation> {
        self.lock()
            .calls
            .iter()
            .filter(|inv| inv.program() == program)
            .cloned()
            .collect()
    }

    fn answer(&self, invocation: &Invocation) -> CommandOutput {
        let mut catalog = self.lock();
        catalog.calls.push(invocation.clone());

        if let Some(message) = catalog.failing.get(invocation.program()) {
            return failure(message);
        }

        match invocation.program() {
            "initdb" => {
                let Some(dir) = invocation.flag_value("-D") else {
                    return failure("initdb: no data directory specified");
                };
                let dir = PathBuf::from(dir);
                match std::fs::create_dir_all(&dir)
                    .and_then(|()| std::fs::write(dir.join("PG_VERSION"), "16\n"))
                {
                    Ok(()) => success(""),
                    Err(e) => failure(&e.to_string()),
                }
            }
            "createdb" => {
                let name = last(invocation);
                if catalog.databases.contains(&name) {
                    return failure(&format!("database \"{name}\" already exists"));
                }
                if let Some(template) = invocation.flag_value("--template") {
                    let template = template.to_string_lossy().into_owned();
                    if !catalog.databases.contains(&template) {
                        return failure(&format!("template database \"{template}\" does not exist"));
                    }
                    if catalog.connections.get(&template).copied().unwrap_or(0) > 0 {
                        return failure(&format!(
                            "source database \"{template}\" is being accessed by other users"
                        ));
                    }
                }
                catalog.databases.insert(name);
                success("")
            }
            "dropdb" => {
                let name = last(invocation);
                if !catalog.databases.contains(&name) {
                    return failure(&format!("database \"{name}\" does not exist"));
                }
                if catalog.connections.get(&name).copied().unwrap_or(0) > 0 {
                    return failure(&format!(
                        "database \"{name}\" is being accessed by other users"
                    ));
                }
                catalog.databases.remove(&name);
                success("")
            }
            "psql" => {
                let sql = last(invocation);
                if sql == READY_PROBE {
                    return if catalog.ready {
                        success("ready\n")
                    } else {
                        failure("could not connect to server: No such file or directory")
                    };
                }
                if sql.contains("pg_stat_activity") {
                    let name = literal(&sql);
                    let count = catalog.connections.get(&name).copied().unwrap_or(0);
                    return success(&format!("{count}\n"));
                }
                if sql.contains("datname = ") {
                    let name = literal(&sql);
                    return if catalog.databases.contains(&name) {
                        success("1\n")
                    } else {
                        success("")
                    };
                }
                let listing: String = catalog
                    .databases
                    .iter()
                    .map(|name| format!("{name}\n"))
                    .collect();
                success(&listing)
            }
            other => failure(&format!("unscripted program {other}")),
        }
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let delay = self.lock().probe_delay;
        if let Some(delay) = delay {
            if invocation.program() == "psql" && last(invocation) == READY_PROBE {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(self.answer(invocation))
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        let script = {
            let mut catalog = self.lock();
            catalog.calls.push(invocation.clone());
            if catalog.failing.contains_key(invocation.program()) {
                return Err(Error::BinaryNotFound {
                    program: invocation.program().to_string(),
                });
            }
            catalog.server_script.clone()
        };
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Io)
    }
}

fn success(output: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        output: output.to_string(),
    }
}

fn failure(message: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        output: format!("ERROR:  {message}\n"),
    }
}

fn last(invocation: &Invocation) -> String {
    invocation
        .last_arg()
        .map(OsStr::to_string_lossy)
        .unwrap_or_default()
        .into_owned()
}

/// Extracts the single quoted literal from a probe query.
fn literal(sql: &str) -> String {
    let Some((_, rest)) = sql.split_once("= ") else {
        return String::new();
    };
    let rest = rest.trim_end_matches(';').trim();
    let rest = rest.strip_prefix('E').unwrap_or(rest);
    rest.trim_matches('\'')
        .replace("''", "'")
        .replace("\\\\", "\\")
}
