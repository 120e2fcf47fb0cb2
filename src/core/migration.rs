//! Ordered schema migrations for the SQLite backend.
//!
//! - **Tracked**: applied versions live in `schema_migrations`
//! - **Ordered**: pending versions apply in ascending order, one transaction each
//! - **Idempotent**: every statement is `IF NOT EXISTS`, and applied versions are skipped
//! - **Forward only**: a target below the current version is refused

use crate::core::error::MarketError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, params};

/// Migration definition
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// All migrations in ascending version order.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Create foundups, tasks, proofs, verifications and payouts",
            statements: &[
                schemas::SCHEMA_FOUNDUPS,
                schemas::SCHEMA_TASKS,
                schemas::SCHEMA_PROOFS,
                schemas::SCHEMA_VERIFICATIONS,
                schemas::SCHEMA_PAYOUTS,
            ],
        },
        Migration {
            version: 2,
            description: "Create append-only event log",
            statements: &[schemas::SCHEMA_EVENTS],
        },
        Migration {
            version: 3,
            description: "Create distribution posts and CABR score history",
            statements: &[
                schemas::SCHEMA_DISTRIBUTION_POSTS,
                schemas::SCHEMA_CABR_SCORES,
            ],
        },
        Migration {
            version: 4,
            description: "Create treasury state and proposals",
            statements: &[
                schemas::SCHEMA_TREASURY_STATES,
                schemas::SCHEMA_TREASURY_PROPOSALS,
            ],
        },
        Migration {
            version: 5,
            description: "Add lookup indexes",
            statements: &[
                schemas::INDEX_TASKS_FOUNDUP,
                schemas::INDEX_TASKS_STATUS,
                schemas::INDEX_EVENTS_TASK,
                schemas::INDEX_EVENTS_FOUNDUP,
                schemas::INDEX_EVENTS_TYPE,
                schemas::INDEX_CABR_FOUNDUP,
                schemas::INDEX_PROPOSALS_FOUNDUP,
            ],
        },
    ]
}

pub fn latest_version() -> u32 {
    all_migrations()
        .iter()
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<u32>,
}

fn ensure_migrations_table(conn: &Connection) -> Result<(), MarketError> {
    conn.execute(schemas::SCHEMA_MIGRATIONS, [])?;
    Ok(())
}

/// Applied versions, ascending.
pub fn applied_versions(conn: &Connection) -> Result<Vec<u32>, MarketError> {
    ensure_migrations_table(conn)?;
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(versions)
}

pub fn current_version(conn: &Connection) -> Result<u32, MarketError> {
    Ok(applied_versions(conn)?.last().copied().unwrap_or(0))
}

/// Applies pending migrations up to `target` (latest when `None`).
pub fn migrate(conn: &mut Connection, target: Option<u32>) -> Result<MigrationReport, MarketError> {
    let applied = applied_versions(conn)?;
    let from_version = applied.last().copied().unwrap_or(0);
    let latest = latest_version();
    let target = target.unwrap_or(latest);

    if target < from_version {
        return Err(MarketError::ValidationError(format!(
            "cannot migrate down: target version {} is below applied version {}",
            target, from_version
        )));
    }
    if target > latest {
        return Err(MarketError::ValidationError(format!(
            "unknown target version {} (latest is {})",
            target, latest
        )));
    }

    let mut report = MigrationReport {
        from_version,
        to_version: from_version,
        applied: Vec::new(),
    };

    for migration in all_migrations() {
        if migration.version > target || applied.contains(&migration.version) {
            continue;
        }
        let tx = conn.transaction()?;
        for statement in migration.statements {
            tx.execute(statement, [])?;
        }
        tx.execute(
            "INSERT INTO schema_migrations(version, description, applied_at) VALUES(?1, ?2, ?3)",
            params![migration.version, migration.description, time::now_epoch_z()],
        )?;
        tx.commit()?;
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
        report.applied.push(migration.version);
        report.to_version = report.to_version.max(migration.version);
    }

    if report.applied.is_empty() {
        tracing::debug!(version = from_version, "schema up to date");
    }
    Ok(report)
}
