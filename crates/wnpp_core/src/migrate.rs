use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use tracing::info;

use crate::runtime::ResolvedPaths;
use crate::store::{open_connection, open_database, unix_timestamp};

/// One embedded schema step; versions start at 1 and have no gaps.
struct SchemaStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const SCHEMA_STEPS: [SchemaStep; 2] = [
    SchemaStep {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    SchemaStep {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

pub fn latest_version() -> u32 {
    SCHEMA_STEPS.last().map_or(0, |step| step.version)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

/// Brings the database at `paths.db_path` up to [`latest_version`], creating it if needed.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    let mut connection = open_database(paths)?;
    ensure_version_table(&connection)?;
    let start = checked_version(&connection)?;

    let mut applied = Vec::new();
    for step in SCHEMA_STEPS.iter().filter(|step| step.version > start) {
        apply_step(&mut connection, step)
            .with_context(|| format!("failed to apply migration v{:03}_{}", step.version, step.name))?;
        info!(version = step.version, name = step.name, "applied migration");
        applied.push(AppliedMigration {
            version: step.version,
            name: step.name.to_string(),
        });
    }

    Ok(MigrateReport {
        applied,
        current_version: current_version(&connection)?,
    })
}

/// Number of schema steps not yet applied; a missing database counts them all.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(SCHEMA_STEPS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_version_table(&connection)?;
    let current = checked_version(&connection)?;
    Ok(SCHEMA_STEPS
        .iter()
        .filter(|step| step.version > current)
        .count())
}

pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .context("failed to read schema version")?;
    u32::try_from(version).context("schema version out of range")
}

fn checked_version(connection: &Connection) -> Result<u32> {
    let current = current_version(connection)?;
    if current > latest_version() {
        bail!(
            "database schema v{current:03} is newer than this build supports (v{:03})",
            latest_version()
        );
    }
    Ok(current)
}

fn ensure_version_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_step(connection: &mut Connection, step: &SchemaStep) -> Result<()> {
    let savepoint = connection
        .savepoint()
        .context("failed to open migration savepoint")?;
    savepoint
        .execute_batch(step.sql)
        .with_context(|| format!("SQL of v{:03} failed", step.version))?;
    savepoint
        .execute(
            "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
            params![i64::from(step.version), step.name, unix_timestamp()?],
        )
        .context("failed to record migration")?;
    savepoint
        .commit()
        .context("failed to commit migration savepoint")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::store::{TABLE_NAMES, table_exists};

    #[test]
    fn versions_are_contiguous_from_one() {
        for (index, step) in SCHEMA_STEPS.iter().enumerate() {
            assert_eq!(step.version as usize, index + 1, "{}", step.name);
        }
    }

    #[test]
    fn fresh_database_is_fully_migrated_once() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_project_root(&temp.path().join("project"));
        assert_eq!(pending_migration_count(&paths).expect("pending"), SCHEMA_STEPS.len());

        let first = run_migrations(&paths).expect("first run");
        assert_eq!(first.applied.len(), SCHEMA_STEPS.len());
        assert_eq!(first.current_version, latest_version());

        let second = run_migrations(&paths).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(pending_migration_count(&paths).expect("pending"), 0);

        let connection = open_connection(&paths.db_path).expect("open");
        for table in TABLE_NAMES {
            assert!(table_exists(&connection, table).expect("exists"), "{table}");
        }
    }

    #[test]
    fn newer_schema_is_refused() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_project_root(temp.path());
        run_migrations(&paths).expect("migrate");
        let connection = open_connection(&paths.db_path).expect("open");
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (99, 'future', 0)",
                [],
            )
            .expect("insert");

        let error = run_migrations(&paths).expect_err("must refuse");
        assert!(error.to_string().contains("newer than this build"));
    }

    #[test]
    fn failed_step_leaves_no_trace() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_project_root(temp.path());
        let mut connection = open_database(&paths).expect("open");
        ensure_version_table(&connection).expect("table");
        let broken = SchemaStep {
            version: 1,
            name: "broken",
            sql: "CREATE TABLE half_done (id INTEGER); SELECT * FROM no_such_table;",
        };

        assert!(apply_step(&mut connection, &broken).is_err());
        assert!(!table_exists(&connection, "half_done").expect("exists"));
        assert_eq!(current_version(&connection).expect("version"), 0);
    }
}
