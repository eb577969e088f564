use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{EventKind, Issue, IssueKind, KindChange, LogEntry, NewLogEntry, PopconEntry};
use crate::runtime::ResolvedPaths;

pub const TABLE_NAMES: [&str; 4] = [
    "debian_popcon",
    "debian_wnpp",
    "debian_log_index",
    "debian_log_mods",
];

const ISSUE_COLUMNS: &str = "ident, open_person, open_stamp, mod_stamp, kind, project, description, charge_person, cron_stamp, has_smaller_sibling";

const LOG_ENTRY_COLUMNS: &str = "l.log_id, l.ident, l.kind, l.project, l.description, l.log_stamp, l.event, l.event_stamp, m.log_id, m.old_kind, m.new_kind";

impl FromSql for IssueKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: anyhow::Error| FromSqlError::Other(error.into()))
    }
}

impl ToSql for IssueKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EventKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: anyhow::Error| FromSqlError::Other(error.into()))
    }
}

impl ToSql for EventKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

/// Opens the dashboard database, creating its parent directory first.
pub fn open_database(paths: &ResolvedPaths) -> Result<Connection> {
    ensure_db_parent(paths)?;
    open_connection(&paths.db_path)
}

pub fn ensure_db_parent(paths: &ResolvedPaths) -> Result<()> {
    let parent = paths
        .db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", paths.db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

pub fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCount {
    pub table: &'static str,
    pub rows: i64,
}

pub fn table_counts(connection: &Connection) -> Result<Vec<TableCount>> {
    let mut output = Vec::with_capacity(TABLE_NAMES.len());
    for table in TABLE_NAMES {
        if !table_exists(connection, table)? {
            continue;
        }
        let rows: i64 = connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows of {table}"))?;
        output.push(TableCount { table, rows });
    }
    Ok(output)
}

pub fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    Ok(Issue {
        ident: row.get(0)?,
        open_person: row.get(1)?,
        open_stamp: row.get(2)?,
        mod_stamp: row.get(3)?,
        kind: row.get(4)?,
        project: row.get(5)?,
        description: row.get(6)?,
        charge_person: row.get(7)?,
        cron_stamp: row.get(8)?,
        has_smaller_sibling: row.get(9)?,
    })
}

pub fn all_issue_ids(connection: &Connection) -> Result<BTreeSet<i64>> {
    let mut statement = connection
        .prepare("SELECT ident FROM debian_wnpp")
        .context("failed to prepare issue id query")?;
    let rows = statement
        .query_map([], |row| row.get::<_, i64>(0))
        .context("failed to query issue ids")?;
    let mut output = BTreeSet::new();
    for row in rows {
        output.insert(row.context("failed to decode issue id")?);
    }
    Ok(output)
}

pub fn load_issue(connection: &Connection, ident: i64) -> Result<Option<Issue>> {
    connection
        .query_row(
            &format!("SELECT {ISSUE_COLUMNS} FROM debian_wnpp WHERE ident = ?1"),
            [ident],
            issue_from_row,
        )
        .optional()
        .with_context(|| format!("failed to load issue {ident}"))
}

pub fn load_issues(connection: &Connection, idents: &[i64]) -> Result<Vec<Issue>> {
    let mut output = Vec::with_capacity(idents.len());
    for ident in idents {
        if let Some(issue) = load_issue(connection, *ident)? {
            output.push(issue);
        }
    }
    Ok(output)
}

/// Ids of issues last refreshed before `cutoff`, oldest first.
pub fn stale_issue_ids(connection: &Connection, cutoff: i64) -> Result<Vec<i64>> {
    let mut statement = connection
        .prepare("SELECT ident FROM debian_wnpp WHERE cron_stamp < ?1 ORDER BY cron_stamp, ident")
        .context("failed to prepare stale issue query")?;
    let rows = statement
        .query_map([cutoff], |row| row.get::<_, i64>(0))
        .context("failed to query stale issues")?;
    let mut output = Vec::new();
    for row in rows {
        output.push(row.context("failed to decode stale issue id")?);
    }
    Ok(output)
}

pub fn insert_issue(connection: &Connection, issue: &Issue) -> Result<()> {
    connection
        .execute(
            &format!(
                "INSERT INTO debian_wnpp ({ISSUE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                issue.ident,
                issue.open_person,
                issue.open_stamp,
                issue.mod_stamp,
                issue.kind,
                issue.project,
                issue.description,
                issue.charge_person,
                issue.cron_stamp,
                issue.has_smaller_sibling,
            ],
        )
        .with_context(|| format!("failed to insert issue {}", issue.ident))?;
    Ok(())
}

pub fn update_issue(connection: &Connection, issue: &Issue) -> Result<()> {
    connection
        .execute(
            "UPDATE debian_wnpp
             SET open_person = ?2, open_stamp = ?3, mod_stamp = ?4, kind = ?5, project = ?6,
                 description = ?7, charge_person = ?8, cron_stamp = ?9, has_smaller_sibling = ?10
             WHERE ident = ?1",
            params![
                issue.ident,
                issue.open_person,
                issue.open_stamp,
                issue.mod_stamp,
                issue.kind,
                issue.project,
                issue.description,
                issue.charge_person,
                issue.cron_stamp,
                issue.has_smaller_sibling,
            ],
        )
        .with_context(|| format!("failed to update issue {}", issue.ident))?;
    Ok(())
}

pub fn delete_issue(connection: &Connection, ident: i64) -> Result<usize> {
    connection
        .execute("DELETE FROM debian_wnpp WHERE ident = ?1", [ident])
        .with_context(|| format!("failed to delete issue {ident}"))
}

pub fn insert_log_entry(connection: &Connection, entry: &NewLogEntry) -> Result<i64> {
    connection
        .execute(
            "INSERT INTO debian_log_index (ident, kind, project, description, log_stamp, event, event_stamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.ident,
                entry.kind,
                entry.project,
                entry.description,
                entry.log_stamp,
                entry.event,
                entry.event_stamp,
            ],
        )
        .with_context(|| format!("failed to log {} of issue {}", entry.event.as_str(), entry.ident))?;
    Ok(connection.last_insert_rowid())
}

pub fn insert_kind_change(connection: &Connection, log_id: i64, change: &KindChange) -> Result<()> {
    connection
        .execute(
            "INSERT INTO debian_log_mods (log_id, old_kind, new_kind) VALUES (?1, ?2, ?3)",
            params![log_id, change.old_kind, change.new_kind],
        )
        .with_context(|| format!("failed to log kind change for log entry {log_id}"))?;
    Ok(())
}

fn log_entry_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let mods_log_id: Option<i64> = row.get(8)?;
    let kind_change = match mods_log_id {
        Some(_) => Some(KindChange {
            old_kind: row.get(9)?,
            new_kind: row.get(10)?,
        }),
        None => None,
    };
    Ok(LogEntry {
        log_id: row.get(0)?,
        ident: row.get(1)?,
        kind: row.get(2)?,
        project: row.get(3)?,
        description: row.get(4)?,
        log_stamp: row.get(5)?,
        event: row.get(6)?,
        event_stamp: row.get(7)?,
        kind_change,
    })
}

/// Newest log entries matching `condition`, a trusted SQL expression over alias `l`.
pub fn recent_log_entries(
    connection: &Connection,
    condition: &str,
    limit: usize,
) -> Result<Vec<LogEntry>> {
    let sql = format!(
        "SELECT {LOG_ENTRY_COLUMNS}
         FROM debian_log_index l
         LEFT JOIN debian_log_mods m ON m.log_id = l.log_id
         WHERE {condition}
         ORDER BY l.event_stamp DESC, l.log_id DESC
         LIMIT ?1"
    );
    let limit = i64::try_from(limit).context("log entry limit does not fit into i64")?;
    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare log entry query")?;
    let rows = statement
        .query_map([limit], log_entry_from_row)
        .context("failed to query log entries")?;
    let mut output = Vec::new();
    for row in rows {
        output.push(row.context("failed to decode log entry")?);
    }
    Ok(output)
}

/// Deletes log entries not in `keep` whose stamps both precede `before`.
pub fn delete_log_entries_except(
    connection: &Connection,
    keep: &BTreeSet<i64>,
    before: i64,
) -> Result<usize> {
    let mut statement = connection
        .prepare(
            "SELECT log_id FROM debian_log_index
             WHERE event_stamp < ?1 AND log_stamp < ?1",
        )
        .context("failed to prepare log truncation query")?;
    let candidates = statement
        .query_map([before], |row| row.get::<_, i64>(0))
        .context("failed to query log entries to truncate")?;
    let mut doomed = Vec::new();
    for candidate in candidates {
        let log_id = candidate.context("failed to decode log id")?;
        if !keep.contains(&log_id) {
            doomed.push(log_id);
        }
    }

    let mut deleted = 0usize;
    for log_id in doomed {
        deleted += connection
            .execute("DELETE FROM debian_log_index WHERE log_id = ?1", [log_id])
            .with_context(|| format!("failed to delete log entry {log_id}"))?;
    }
    Ok(deleted)
}

pub fn load_popcon_entries(connection: &Connection) -> Result<HashMap<String, PopconEntry>> {
    let mut statement = connection
        .prepare("SELECT package, inst, vote, old, recent, nofiles FROM debian_popcon")
        .context("failed to prepare popcon query")?;
    let rows = statement
        .query_map([], |row| {
            Ok(PopconEntry {
                package: row.get(0)?,
                inst: row.get(1)?,
                vote: row.get(2)?,
                old: row.get(3)?,
                recent: row.get(4)?,
                nofiles: row.get(5)?,
            })
        })
        .context("failed to query popcon entries")?;
    let mut output = HashMap::new();
    for row in rows {
        let entry = row.context("failed to decode popcon entry")?;
        output.insert(entry.package.clone(), entry);
    }
    Ok(output)
}

pub fn upsert_popcon_entry(connection: &Connection, entry: &PopconEntry) -> Result<()> {
    connection
        .execute(
            "INSERT INTO debian_popcon (package, inst, vote, old, recent, nofiles)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(package) DO UPDATE SET
                inst = excluded.inst,
                vote = excluded.vote,
                old = excluded.old,
                recent = excluded.recent,
                nofiles = excluded.nofiles",
            params![
                entry.package,
                entry.inst,
                entry.vote,
                entry.old,
                entry.recent,
                entry.nofiles,
            ],
        )
        .with_context(|| format!("failed to store popcon entry for {}", entry.package))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tempfile::tempdir;

    use super::test_support::{migrated_database, sample_issue};
    use super::*;

    #[test]
    fn issues_round_trip_through_the_database() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());

        let mut issue = sample_issue(42, IssueKind::Rfa);
        insert_issue(&connection, &issue).expect("insert");
        assert_eq!(load_issue(&connection, 42).expect("load"), Some(issue.clone()));

        issue.kind = IssueKind::Ita;
        issue.charge_person = Some("Someone <someone@example.org>".to_string());
        update_issue(&connection, &issue).expect("update");
        assert_eq!(load_issue(&connection, 42).expect("load"), Some(issue));

        assert_eq!(delete_issue(&connection, 42).expect("delete"), 1);
        assert!(all_issue_ids(&connection).expect("ids").is_empty());
    }

    #[test]
    fn stale_issue_ids_are_ordered_by_cron_stamp_then_ident() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());

        for (ident, cron_stamp) in [(3, 100), (1, 200), (2, 100), (4, 900)] {
            let mut issue = sample_issue(ident, IssueKind::O);
            issue.cron_stamp = cron_stamp;
            insert_issue(&connection, &issue).expect("insert");
        }

        assert_eq!(stale_issue_ids(&connection, 500).expect("stale"), vec![2, 3, 1]);
    }

    #[test]
    fn kind_change_rows_cascade_with_their_log_entry() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());

        let issue = sample_issue(7, IssueKind::Ita);
        let entry = NewLogEntry::from_issue(&issue, EventKind::Modified, 10, 20);
        let log_id = insert_log_entry(&connection, &entry).expect("log");
        insert_kind_change(
            &connection,
            log_id,
            &KindChange {
                old_kind: Some(IssueKind::O),
                new_kind: Some(IssueKind::Ita),
            },
        )
        .expect("kind change");

        let entries = recent_log_entries(&connection, "1 = 1", 10).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].kind_change,
            Some(KindChange {
                old_kind: Some(IssueKind::O),
                new_kind: Some(IssueKind::Ita),
            })
        );

        let deleted =
            delete_log_entries_except(&connection, &BTreeSet::new(), 1_000).expect("truncate");
        assert_eq!(deleted, 1);
        let remaining: i64 = connection
            .query_row("SELECT COUNT(*) FROM debian_log_mods", [], |row| row.get(0))
            .expect("count");
        assert_eq!(remaining, 0);
    }

    #[test]
    fn popcon_upsert_replaces_existing_values() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());

        let mut entry = PopconEntry {
            package: "dpkg".to_string(),
            inst: Some(1),
            ..PopconEntry::default()
        };
        upsert_popcon_entry(&connection, &entry).expect("insert");
        entry.inst = Some(5);
        entry.vote = Some(3);
        upsert_popcon_entry(&connection, &entry).expect("update");

        let entries = load_popcon_entries(&connection).expect("load");
        assert_eq!(entries.get("dpkg"), Some(&entry));
    }

    #[test]
    fn table_counts_cover_every_table() {
        let temp = tempdir().expect("tempdir");
        let (_paths, connection) = migrated_database(temp.path());
        insert_issue(&connection, &sample_issue(1, IssueKind::Rfp)).expect("insert");

        let counts = table_counts(&connection).expect("counts");
        assert_eq!(counts.len(), TABLE_NAMES.len());
        assert!(counts.contains(&TableCount {
            table: "debian_wnpp",
            rows: 1
        }));
    }
}
