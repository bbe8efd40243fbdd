//! Catalog probes and administrative command construction.

use crate::runner::{CommandRunner, Invocation};
use crate::{ConnectionAddress, Result};
use pg_escape::quote_literal;

/// Maintenance database the tools connect to.
const MAINTENANCE_DB: &str = "postgres";

/// Coordinates of a server plus the role administrative tools act as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTarget {
    pub address: ConnectionAddress,
    pub user: String,
}

impl AdminTarget {
    pub fn new(address: ConnectionAddress, user: impl Into<String>) -> Self {
        Self {
            address,
            user: user.into(),
        }
    }

    /// Base invocation of `program` with host, port and user set.
    pub fn invocation(&self, program: &str) -> Invocation {
        Invocation::new(program)
            .arg("-h")
            .arg(self.address.host())
            .arg("-p")
            .arg(self.address.port().to_string())
            .arg("-U")
            .arg(&self.user)
    }

    pub fn createdb(&self, name: &str, template: Option<&str>) -> Invocation {
        let mut inv = self.invocation("createdb");
        if let Some(template) = template {
            inv = inv.arg("--template").arg(template);
        }
        inv.arg(name)
    }

    pub fn dropdb(&self, name: &str) -> Invocation {
        self.invocation("dropdb").arg(name)
    }

    /// Unaligned, tuples-only `psql` run of `sql` against the maintenance
    /// database.
    pub fn psql(&self, sql: &str) -> Invocation {
        self.invocation("psql")
            .args(["-X", "-A", "-t", "-d", MAINTENANCE_DB, "-c"])
            .arg(sql)
    }
}

/// Runs `sql` and returns the non-empty output lines.
pub async fn query<R: CommandRunner>(
    runner: &R,
    target: &AdminTarget,
    sql: &str,
) -> Result<Vec<String>> {
    let invocation = target.psql(sql);
    let output = runner.run(&invocation).await?.into_checked(&invocation)?;
    Ok(output
        .output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect())
}

/// Names of every database in the catalog.
pub async fn list_databases<R: CommandRunner>(
    runner: &R,
    target: &AdminTarget,
) -> Result<Vec<String>> {
    query(
        runner,
        target,
        "SELECT datname FROM pg_catalog.pg_database ORDER BY datname;",
    )
    .await
}

pub async fn database_exists<R: CommandRunner>(
    runner: &R,
    target: &AdminTarget,
    name: &str,
) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM pg_catalog.pg_database WHERE datname = {};",
        quote_literal(name)
    );
    Ok(!query(runner, target, &sql).await?.is_empty())
}

/// Number of backends connected to `name`.
pub async fn connection_count<R: CommandRunner>(
    runner: &R,
    target: &AdminTarget,
    name: &str,
) -> Result<u64> {
    let sql = format!(
        "SELECT count(*) FROM pg_catalog.pg_stat_activity WHERE datname = {};",
        quote_literal(name)
    );
    let rows = query(runner, target, &sql).await?;
    Ok(rows
        .first()
        .and_then(|count| count.parse().ok())
        .unwrap_or(0))
}
